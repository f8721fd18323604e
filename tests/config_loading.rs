use std::io::Write;

use stepflow_core::config::AppConfig;
use stepflow_core::error::FlowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[executor]
max_steps = 50
allow_implicit_entry = true
event_capacity = 64

[invoker]
timeout_secs = 15
kill_grace_ms = 500
max_output_bytes = 4096
working_dir = "/srv/steps"
inherit_env = false

[invoker.interpreters]
py = "python3 -u"
rb = "ruby"

[log]
console = false
file = true
log_dir = "/var/log/stepflow"
memory_capacity = 50
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.executor.max_steps, 50);
    assert!(config.executor.allow_implicit_entry);
    assert_eq!(config.executor.event_capacity, 64);

    assert_eq!(config.invoker.timeout_secs, 15);
    assert_eq!(config.invoker.kill_grace_ms, 500);
    assert_eq!(config.invoker.max_output_bytes, 4096);
    assert_eq!(config.working_dir(), Some("/srv/steps".into()));
    assert!(!config.invoker.inherit_env);
    assert_eq!(config.invoker.interpreters["py"], "python3 -u");
    assert_eq!(config.invoker.interpreters["rb"], "ruby");

    assert!(!config.log.console);
    assert_eq!(config.log_dir(), std::path::PathBuf::from("/var/log/stepflow"));
    assert_eq!(config.log.memory_capacity, 50);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STEPFLOW_TEST_LOG_DIR", "/tmp/expanded-logs");

    let toml_content = r#"
[log]
log_dir = "${STEPFLOW_TEST_LOG_DIR}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.log.log_dir, "/tmp/expanded-logs");

    std::env::remove_var("STEPFLOW_TEST_LOG_DIR");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[executor]\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.executor.max_steps, 1000);
    assert!(!config.executor.allow_implicit_entry);
    assert_eq!(config.invoker.timeout_secs, 60);
    assert_eq!(config.invoker.kill_grace_ms, 2000);
    assert_eq!(config.invoker.max_output_bytes, 1024 * 1024);
    assert!(config.working_dir().is_none());
    assert_eq!(config.invoker.interpreters["sh"], "sh");
    assert!(config.log.console);
    assert!(config.log.file);
    assert_eq!(config.log.log_dir, "logs");
}

#[test]
fn test_missing_file() {
    let path = std::path::Path::new("/definitely/not/here/stepflow.toml");
    assert!(matches!(AppConfig::load(path), Err(FlowError::ConfigNotFound(_))));
    let config = AppConfig::load_or_default(path).expect("defaults");
    assert_eq!(config.executor.max_steps, 1000);
}

#[test]
fn test_config_serializes_back_to_toml() {
    let config = AppConfig::default();
    let rendered = toml::to_string_pretty(&config).expect("render");
    let reparsed: AppConfig = toml::from_str(&rendered).expect("reparse");
    assert_eq!(reparsed.invoker.interpreters, config.invoker.interpreters);
    assert_eq!(reparsed.log.log_dir, config.log.log_dir);
}
