// tests/config_errors.rs

use std::io::Write;

use tempfile::NamedTempFile;

use shardrun::config::loader::load_and_validate;
use shardrun::errors::ShardrunError;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_and_validate(dir.path().join("Shardrun.toml")).unwrap_err();
    assert!(matches!(err, ShardrunError::IoError(_)));
}

#[test]
fn malformed_toml_is_a_toml_error() {
    let file = config_file("[task.unit\ncommand = [\"./t\"]\n");
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, ShardrunError::TomlError(_)));
}

#[test]
fn unknown_fields_are_rejected() {
    let file = config_file("[task.unit]\ncommand = [\"./t\"]\nshard_count = 4\n");
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, ShardrunError::TomlError(_)));
}

#[test]
fn non_string_env_value_is_invalid_config() {
    let file = config_file(
        r#"
        [task.unit]
        command = ["./t"]
        env = { RETRIES = 3 }
        "#,
    );
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, ShardrunError::InvalidConfig(ref m) if m.contains("RETRIES")));
}

#[test]
fn input_dir_and_cas_root_are_exclusive() {
    let file = config_file(
        r#"
        [task.unit]
        command = ["./t"]
        input_dir = "src"
        cas_input_root = "abc/12"
        "#,
    );
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, ShardrunError::InvalidConfig(_)));
}

#[test]
fn full_config_resolves_every_section() {
    let file = config_file(
        r#"
        [engine]
        server = "https://tasks.example.com"
        output_dir = "out"

        [build]
        project = "chromium"
        bucket = "ci"
        builder = "linux-rel"
        build_number = 42
        builder_group = "chromium.linux"

        [profile]
        project = "chromium"
        default_priority = 30

        [defaults]
        dimensions = { pool = "ci" }
        env = { LANG = "C" }
        tags = ["purpose:ci"]

        [local]
        dimensions = { os = "Linux", pool = "ci" }

        [task.unit]
        title = "unit_tests"
        command = ["./run_tests"]
        dimensions = { os = "Linux" }
        shards = 4
        shard_indices = [1, 3]
        merge = { script = "merge.py", args = ["--strict"] }
        failure_as_exception = false
        retries = 2
        "#,
    );
    let cfg = load_and_validate(file.path()).unwrap();

    assert_eq!(cfg.server.as_deref(), Some("https://tasks.example.com"));
    assert_eq!(cfg.build.builder_info(), Some(("linux-rel".to_string(), 42)));
    let profile = cfg.profile.as_ref().unwrap();
    assert_eq!(profile.builder_group.as_deref(), Some("chromium.linux"));
    assert_eq!(cfg.defaults.dimensions["pool"].as_deref(), Some("ci"));
    assert_eq!(cfg.local.dimensions.get("pool"), Some("ci"));

    let task = &cfg.tasks["unit"];
    assert_eq!(task.params.title, "unit_tests");
    assert_eq!(task.params.shards, 4);
    assert_eq!(
        task.params.shard_indices.as_ref().map(|s| s.iter().copied().collect::<Vec<_>>()),
        Some(vec![1, 3])
    );
    assert_eq!(task.params.merge.as_ref().unwrap().args, vec!["--strict".to_string()]);
    assert!(!task.failure_as_exception);
    assert_eq!(task.retries, 2);
}
