//! Verify XML config is parsed and used without touching user state.

use platform_env::config::CONFIG_ENV_VAR;
use platform_env::{Env, EnvConfig, LogLevel, Priority, RateLimitMode, load_config, load_config_from_xml_path};
use serial_test::serial;
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn reads_config_xml_and_applies_values() {
    let td = tempdir().expect("create tempdir");
    let cfg_path = td.path().join("config.xml");
    let log_file = td.path().join("env.log");
    let xml = format!(
        r#"
<config>
  <low_threads>3</low_threads>
  <high_threads>2</high_threads>
  <rate_bytes_per_second>  1048576  </rate_bytes_per_second>
  <rate_refill_millis>20</rate_refill_millis>
  <rate_mode>blocking</rate_mode>
  <log_level>info</log_level>
  <log_file>{}</log_file>
</config>
"#,
        log_file.display()
    );
    fs::write(&cfg_path, xml).expect("write config.xml");

    let cfg = load_config_from_xml_path(&cfg_path).expect("load_config_from_xml_path");
    assert_eq!(cfg.threads(Priority::Low), 3);
    assert_eq!(cfg.threads(Priority::High), 2);
    assert_eq!(cfg.threads(Priority::User), 1, "unset count keeps default");
    let rl = cfg.rate_limit.clone().expect("rate limit configured");
    assert_eq!(rl.bytes_per_second, 1 << 20);
    assert_eq!(rl.refill_period, Duration::from_millis(20));
    assert_eq!(rl.burst_bytes, None);
    assert_eq!(rl.mode, RateLimitMode::Blocking);
    assert_eq!(cfg.log_level, LogLevel::Info);
    assert_eq!(cfg.log_file.as_deref(), Some(log_file.as_path()));

    let env = Env::open(&cfg).expect("open env from config");
    assert_eq!(env.background_threads(Priority::Low), 3);
    assert_eq!(env.rate_limiter().unwrap().burst_bytes(), 20_971);
}

#[test]
fn zero_threads_rejected_with_path_context() {
    let td = tempdir().unwrap();
    let cfg_path = td.path().join("config.xml");
    fs::write(&cfg_path, "<config><user_threads>0</user_threads></config>").unwrap();
    let err = load_config_from_xml_path(&cfg_path).unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("config.xml"), "{msg}");
    assert!(msg.contains("user"), "{msg}");
}

#[test]
fn malformed_xml_is_an_error() {
    let td = tempdir().unwrap();
    let cfg_path = td.path().join("config.xml");
    fs::write(&cfg_path, "<config><low_threads>2</config>").unwrap();
    assert!(load_config_from_xml_path(&cfg_path).is_err());
}

#[test]
#[serial]
fn env_var_selects_config_file() {
    let td = tempdir().unwrap();
    let cfg_path = td.path().join("custom.xml");
    fs::write(
        &cfg_path,
        "<config><rate_bytes_per_second>500</rate_bytes_per_second><rate_mode>non_blocking</rate_mode></config>",
    )
    .unwrap();
    unsafe { std::env::set_var(CONFIG_ENV_VAR, &cfg_path) };
    let cfg = load_config();
    unsafe { std::env::remove_var(CONFIG_ENV_VAR) };
    let cfg = cfg.unwrap();
    assert_eq!(cfg.rate_limit.unwrap().mode, RateLimitMode::NonBlocking);
}

#[test]
#[serial]
fn missing_file_means_defaults() {
    let td = tempdir().unwrap();
    unsafe { std::env::set_var(CONFIG_ENV_VAR, td.path().join("absent.xml")) };
    let cfg = load_config();
    unsafe { std::env::remove_var(CONFIG_ENV_VAR) };
    assert_eq!(cfg.unwrap(), EnvConfig::default());
}
