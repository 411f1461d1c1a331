//! Textual notation and persistence: building Scops from ISL-style strings,
//! JSON round trips of mapped and promoted Scops, configuration files.

use std::fs;

use polygpu::parse::{parse_band, parse_domain};
use polygpu::scop::ParamContext;
use polygpu::{
    define_promotion_scope, load_scop_json, map_to_gpu, promote_to_shared, reference_groups,
    save_scop_json, schedule_to_block_str, MappingConfig, ParseError, ScopBuilder,
};
use tempfile::TempDir;

#[test]
fn test_builder_with_parameters() {
    let scop = ScopBuilder::new()
        .parameter("N", 128)
        .parameter("M", 32)
        .domain("[N, M] -> { S0[i, j] : 0 <= i < N and 0 <= j < M }")
        .unwrap()
        .read("[N, M] -> { S0[i, j] -> A[i, j + 1] }")
        .unwrap()
        .write("[N, M] -> { S0[i, j] -> B[j, i] }")
        .unwrap()
        .build();
    let domain = scop.domain.get(&"S0".into()).unwrap();
    assert_eq!(domain.cardinality(), 128 * 32);
    assert_eq!(scop.may_reads[0].index[1].eval(&[5, 7]), 8);
    assert_eq!(scop.must_writes[0].index[0].eval(&[5, 7]), 7);
}

#[test]
fn test_band_with_quasi_affine_members() {
    let domain = parse_domain("{ S0[i] : 0 <= i <= 99 }", &ParamContext::new()).unwrap();
    let band = parse_band(
        "[{ S0[i] -> [(floor(i/10))] }, { S0[i] -> [(i mod 10)] }]",
        &domain,
        &ParamContext::new(),
    )
    .unwrap();
    assert_eq!(band.n_member(), 2);
    let s0 = "S0".into();
    assert_eq!(band.members[0].expr(&s0).unwrap().eval(&[57]), 5);
    assert_eq!(band.members[1].expr(&s0).unwrap().eval(&[57]), 7);
}

#[test]
fn test_malformed_input_is_reported() {
    assert!(matches!(
        ScopBuilder::new().domain(""),
        Err(ParseError::EmptyInput)
    ));
    assert!(matches!(
        ScopBuilder::new().domain("{ S0[i] : 0 <= i }"),
        Err(ParseError::ParseFailed(_))
    ));
    let builder = ScopBuilder::new().domain("{ S0[i] : 0 <= i < 4 }").unwrap();
    assert!(builder.read("{ S0[i, j] -> A[i] }").is_err());
}

#[test]
fn test_json_round_trip_after_mapping_and_promotion() {
    let mut scop = ScopBuilder::new()
        .domain("{ S0[i] : 0 <= i < 256 }")
        .unwrap()
        .read("{ S0[i] -> A[i] }")
        .unwrap()
        .write("{ S0[i] -> B[i] }")
        .unwrap()
        .parallel_band("[{ S0[i] -> [(i)] }]")
        .unwrap()
        .build();
    let root = scop.root();
    assert!(map_to_gpu(&mut scop, root, &[32], &mut [32, 1, 1], &mut [8, 1, 1]));
    let thread_filter = scop
        .root()
        .descendants()
        .into_iter()
        .find(|n| n.filter().is_some_and(|f| f.tag.is_some_and(|t| t.is_thread())))
        .unwrap();
    let mark = define_promotion_scope(&mut scop, thread_filter).unwrap();
    let group = reference_groups(&scop, &mark).unwrap().remove(0);
    promote_to_shared(&mut scop, &group, &MappingConfig::default()).unwrap();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scop.json");
    save_scop_json(&scop, &path).unwrap();
    let loaded = load_scop_json(&path).unwrap();
    assert_eq!(loaded, scop);
    assert_eq!(
        schedule_to_block_str(&loaded.schedule),
        schedule_to_block_str(&scop.schedule)
    );

    // ids keep counting from where the saved Scop stopped
    let mut a = loaded.clone();
    let mut b = scop.clone();
    assert_eq!(a.fresh_id("x"), b.fresh_id("x"));
}

#[test]
fn test_load_errors() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.json");
    assert!(matches!(load_scop_json(&missing), Err(ParseError::IOError(_))));

    let empty = dir.path().join("empty.json");
    fs::write(&empty, "  \n").unwrap();
    assert!(matches!(load_scop_json(&empty), Err(ParseError::EmptyInput)));

    let broken = dir.path().join("broken.json");
    fs::write(&broken, "{ \"context\": ").unwrap();
    assert!(matches!(load_scop_json(&broken), Err(ParseError::Json(_))));
}

#[test]
fn test_config_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mapping.json");
    let config = MappingConfig {
        shared_memory_bytes: 96 * 1024,
        insert_guard: false,
        ..MappingConfig::default()
    };
    config.save(&path).unwrap();
    assert_eq!(MappingConfig::load(&path).unwrap(), config);

    fs::write(&path, "{ \"private_memory_elements\": 16 }").unwrap();
    let partial = MappingConfig::load(&path).unwrap();
    assert_eq!(partial.private_memory_elements, 16);
    assert_eq!(partial.shared_memory_bytes, MappingConfig::default().shared_memory_bytes);
}
