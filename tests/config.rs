//! Loading kernel configuration from TOML files.

use std::io::Write;

use akh_kernel::cycle::{Phase, RunType};
use akh_kernel::error::{ConfigError, KernelError};
use akh_kernel::exploration::ExplorationPolicy;
use akh_kernel::kernel::{CycleMode, Kernel, KernelConfig};

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn loads_a_complete_file() {
    let file = write_config(
        r#"
cycle_mode = "legacy"
max_elaborations = 50
max_nil_output_cycles = 3
max_goal_depth = 20
stop_phase = "decision"
exploration = "random"
seed = 1234
wait_on_state_no_change = true
"#,
    );
    let config = KernelConfig::load(file.path()).unwrap();
    assert_eq!(config.cycle_mode, CycleMode::Legacy);
    assert_eq!(config.max_elaborations, 50);
    assert_eq!(config.max_nil_output_cycles, 3);
    assert_eq!(config.max_goal_depth, 20);
    assert_eq!(config.stop_phase, Phase::Decision);
    assert_eq!(config.exploration, ExplorationPolicy::Random);
    assert_eq!(config.seed, Some(1234));
    assert!(config.wait_on_state_no_change);

    let mut kernel = Kernel::new(config).unwrap();
    kernel.run(1, RunType::Decisions).unwrap();
    assert_eq!(kernel.current_phase(), Phase::Decision);
}

#[test]
fn empty_file_gives_defaults() {
    let file = write_config("");
    assert_eq!(KernelConfig::load(file.path()).unwrap(), KernelConfig::default());
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let err = KernelConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn malformed_file_is_a_parse_error() {
    let file = write_config("max_elaborations = \"lots\"");
    let err = KernelConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn invalid_values_are_rejected_by_the_kernel() {
    let file = write_config("max_nil_output_cycles = 0");
    let config = KernelConfig::load(file.path()).unwrap();
    let err = Kernel::new(config).unwrap_err();
    assert!(matches!(err, KernelError::Config(ConfigError::Invalid { .. })));
}

#[test]
fn written_defaults_load_back() {
    let text = KernelConfig::default().to_toml_string().unwrap();
    let file = write_config(&text);
    assert_eq!(KernelConfig::load(file.path()).unwrap(), KernelConfig::default());
}
