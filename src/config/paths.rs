//! Default config path resolution.

use dirs::config_dir;
use std::env;
use std::path::PathBuf;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "PLATFORM_ENV_CONFIG";

/// `$PLATFORM_ENV_CONFIG` if set, else `<config dir>/platform_env/config.xml`.
/// Falls back to `$HOME/.config` when the platform reports no config dir.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(p) = env::var_os(CONFIG_ENV_VAR) {
        if !p.is_empty() {
            return Some(PathBuf::from(p));
        }
    }
    if let Some(mut base) = config_dir() {
        base.push("platform_env");
        base.push("config.xml");
        Some(base)
    } else {
        env::var("HOME").ok().map(|h| {
            PathBuf::from(h)
                .join(".config")
                .join("platform_env")
                .join("config.xml")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn env_var_wins() {
        unsafe { env::set_var(CONFIG_ENV_VAR, "/tmp/pe-test/config.xml") };
        assert_eq!(default_config_path(), Some(PathBuf::from("/tmp/pe-test/config.xml")));
        unsafe { env::remove_var(CONFIG_ENV_VAR) };
    }

    #[test]
    #[serial]
    fn default_ends_with_crate_dir() {
        unsafe { env::remove_var(CONFIG_ENV_VAR) };
        if let Some(p) = default_config_path() {
            assert!(p.ends_with("platform_env/config.xml"));
        }
    }
}
