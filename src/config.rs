//! Tunables for kernel construction and memory promotion.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::parse::ParseError;

/// Configuration shared by the mapping and promotion passes.
///
/// Missing fields in a JSON file fall back to [`MappingConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Shared memory available to one block, in bytes
    pub shared_memory_bytes: u64,

    /// Register budget for one private buffer, in elements
    pub private_memory_elements: i64,

    /// Element size for arrays without an entry in the array table
    pub default_element_bytes: u64,

    /// Insert a guard node below each kernel mark
    pub insert_guard: bool,

    /// Shrink grid/block extents to the coordinates actually reachable
    pub shrink_launch_bounds: bool,

    /// Upper bound on instances enumerated by the hazard analysis; larger
    /// scopes are rejected
    pub max_enumerated_instances: u64,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            shared_memory_bytes: 48 * 1024,
            private_memory_elements: 64,
            default_element_bytes: 4,
            insert_guard: true,
            shrink_launch_bounds: true,
            max_enumerated_instances: 1 << 20,
        }
    }
}

impl MappingConfig {
    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    /// Returns `ParseError::IOError` if the file cannot be read and
    /// `ParseError::Json` if it is not a valid configuration object.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ParseError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ParseError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
