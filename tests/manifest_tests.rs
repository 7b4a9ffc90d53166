#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy checks: lint levels, feature wiring, and declared targets.

use std::path::PathBuf;

fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

fn read_manifest(relative_path: &str) -> toml::Table {
    let path = project_root().join(relative_path);
    let text = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read '{}': {e}", path.display()));
    toml::from_str(&text).unwrap_or_else(|e| panic!("'{}' is not valid TOML: {e}", path.display()))
}

const PANIC_FREE_LINTS: &[&str] = &[
    "unwrap_used",
    "expect_used",
    "panic",
    "todo",
    "unimplemented",
    "indexing_slicing",
];

#[test]
fn library_denies_panicking_lints() {
    let cargo = read_manifest("Cargo.toml");
    let clippy = cargo["lints"]["clippy"]
        .as_table()
        .expect("Cargo.toml must have a [lints.clippy] table");
    for lint in PANIC_FREE_LINTS {
        assert_eq!(
            clippy.get(*lint).and_then(toml::Value::as_str),
            Some("deny"),
            "[lints.clippy] must set `{lint} = \"deny\"`"
        );
    }
}

#[test]
fn websocket_feature_is_default_and_pulls_its_dependencies() {
    let cargo = read_manifest("Cargo.toml");
    let features = cargo["features"].as_table().unwrap();

    let default: Vec<&str> = features["default"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(toml::Value::as_str)
        .collect();
    assert!(default.contains(&"transport-websocket"));

    let websocket: Vec<&str> = features["transport-websocket"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(toml::Value::as_str)
        .collect();
    for dep in ["dep:tokio-tungstenite", "dep:futures-util"] {
        assert!(websocket.contains(&dep), "transport-websocket must enable {dep}");
        let name = dep.trim_start_matches("dep:");
        assert_eq!(
            cargo["dependencies"][name]["optional"].as_bool(),
            Some(true),
            "{name} must be optional"
        );
    }
}

#[test]
fn declared_example_targets_exist() {
    let cargo = read_manifest("Cargo.toml");
    for example in cargo["example"].as_array().unwrap() {
        let path = example["path"].as_str().unwrap();
        assert!(
            project_root().join(path).is_file(),
            "example target '{path}' does not exist"
        );
    }
}

#[test]
fn fuzz_crate_targets_this_package() {
    let fuzz = read_manifest("fuzz/Cargo.toml");
    let dep = fuzz["dependencies"]["rps-room-client"].as_table().unwrap();
    assert_eq!(dep["path"].as_str(), Some(".."));
    assert_eq!(dep["default-features"].as_bool(), Some(false));

    for bin in fuzz["bin"].as_array().unwrap() {
        let path = bin["path"].as_str().unwrap();
        assert!(
            project_root().join("fuzz").join(path).is_file(),
            "fuzz target '{path}' does not exist"
        );
    }
}
