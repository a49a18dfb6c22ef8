//! XML configuration support.
//! - Loads settings from config.xml (quick_xml).
//! - A missing file means defaults; a malformed one is an error.
//!
//! Notes:
//! - Unknown XML fields are rejected so typos surface instead of silently using defaults.
//! - Numeric values are whitespace-trimmed.

use anyhow::{Context, Result, anyhow};
use quick_xml::de::from_str as from_xml_str;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::paths::default_config_path;
use crate::config::types::{EnvConfig, LogLevel};
use crate::rate_limiter::{DEFAULT_REFILL_PERIOD, RateLimitMode, RateLimiterConfig};

/// Struct mirroring the XML config for deserialization.
#[derive(Debug, Deserialize)]
#[serde(rename = "config")]
#[serde(deny_unknown_fields)]
struct XmlConfig {
    #[serde(default, deserialize_with = "de_u64_trimmed_opt")]
    low_threads: Option<u64>,
    #[serde(default, deserialize_with = "de_u64_trimmed_opt")]
    high_threads: Option<u64>,
    #[serde(default, deserialize_with = "de_u64_trimmed_opt")]
    user_threads: Option<u64>,
    #[serde(default, deserialize_with = "de_bool_trimmed_opt")]
    lower_low_priority: Option<bool>,
    #[serde(default, deserialize_with = "de_u64_trimmed_opt")]
    rate_bytes_per_second: Option<u64>,
    #[serde(default, deserialize_with = "de_u64_trimmed_opt")]
    rate_refill_millis: Option<u64>,
    #[serde(default, deserialize_with = "de_u64_trimmed_opt")]
    rate_burst_bytes: Option<u64>,
    rate_mode: Option<String>,
    log_level: Option<String>,
    log_file: Option<String>,
}

fn trimmed_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
}

fn de_u64_trimmed_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    match trimmed_opt(deserializer)? {
        None => Ok(None),
        Some(s) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|e| D::Error::custom(format!("invalid number '{s}': {e}"))),
    }
}

fn de_bool_trimmed_opt<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    match trimmed_opt(deserializer)? {
        None => Ok(None),
        Some(s) => s
            .parse::<bool>()
            .map(Some)
            .map_err(|e| D::Error::custom(format!("invalid flag '{s}': {e}"))),
    }
}

fn parse_mode(s: &str) -> Result<RateLimitMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "blocking" => Ok(RateLimitMode::Blocking),
        "non_blocking" | "nonblocking" | "non-blocking" => Ok(RateLimitMode::NonBlocking),
        other => Err(anyhow!("invalid rate_mode '{other}' (expected blocking|non_blocking)")),
    }
}

fn to_usize(v: u64, field: &str) -> Result<usize> {
    usize::try_from(v).with_context(|| format!("{field} out of range"))
}

// Map XmlConfig -> EnvConfig, filling unset fields from defaults.
fn xml_to_config(parsed: XmlConfig) -> Result<EnvConfig> {
    let mut cfg = EnvConfig::default();

    if let Some(n) = parsed.low_threads {
        cfg.low_threads = to_usize(n, "low_threads")?;
    }
    if let Some(n) = parsed.high_threads {
        cfg.high_threads = to_usize(n, "high_threads")?;
    }
    if let Some(n) = parsed.user_threads {
        cfg.user_threads = to_usize(n, "user_threads")?;
    }
    cfg.lower_low_priority = parsed.lower_low_priority.unwrap_or(false);

    match parsed.rate_bytes_per_second {
        Some(rate) => {
            let mode = match parsed.rate_mode.as_deref() {
                Some(s) => parse_mode(s)?,
                None => RateLimitMode::Blocking,
            };
            cfg.rate_limit = Some(RateLimiterConfig {
                bytes_per_second: rate,
                refill_period: parsed
                    .rate_refill_millis
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_REFILL_PERIOD),
                burst_bytes: parsed.rate_burst_bytes,
                mode,
            });
        }
        None => {
            if parsed.rate_refill_millis.is_some()
                || parsed.rate_burst_bytes.is_some()
                || parsed.rate_mode.is_some()
            {
                debug!("rate limiter options given without rate_bytes_per_second; limiter stays off");
            }
        }
    }

    if let Some(s) = parsed.log_level.as_deref() {
        cfg.log_level = s.trim().parse::<LogLevel>().map_err(|e| anyhow!(e))?;
    }
    if let Some(s) = parsed.log_file.as_deref() {
        let trimmed = s.trim();
        if !trimmed.is_empty() {
            cfg.log_file = Some(PathBuf::from(trimmed));
        }
    }

    Ok(cfg)
}

/// Load and validate an EnvConfig from a specific XML file path.
pub fn load_config_from_xml_path(path: &Path) -> Result<EnvConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read config xml '{}'", path.display()))?;
    let parsed: XmlConfig = from_xml_str(&contents)
        .with_context(|| format!("parse config xml '{}'", path.display()))?;
    let cfg = xml_to_config(parsed).with_context(|| format!("config xml '{}'", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config in '{}'", path.display()))?;
    debug!(path = %path.display(), "loaded config");
    Ok(cfg)
}

/// Load from `$PLATFORM_ENV_CONFIG` or the default path. A missing file yields defaults.
pub fn load_config() -> Result<EnvConfig> {
    let Some(path) = default_config_path() else {
        debug!("no config directory available; using defaults");
        return Ok(EnvConfig::default());
    };
    if !path.exists() {
        debug!(path = %path.display(), "config file not found; using defaults");
        return Ok(EnvConfig::default());
    }
    load_config_from_xml_path(&path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> Result<EnvConfig> {
        let parsed: XmlConfig = from_xml_str(xml)?;
        xml_to_config(parsed)
    }

    #[test]
    fn full_document() {
        let cfg = parse(
            "<config>
               <low_threads> 2 </low_threads>
               <high_threads>4</high_threads>
               <user_threads>1</user_threads>
               <lower_low_priority>true</lower_low_priority>
               <rate_bytes_per_second>1048576</rate_bytes_per_second>
               <rate_refill_millis>50</rate_refill_millis>
               <rate_burst_bytes>65536</rate_burst_bytes>
               <rate_mode>non_blocking</rate_mode>
               <log_level>debug</log_level>
               <log_file>/var/log/pe.log</log_file>
             </config>",
        )
        .unwrap();
        assert_eq!(cfg.low_threads, 2);
        assert_eq!(cfg.high_threads, 4);
        assert!(cfg.lower_low_priority);
        let rl = cfg.rate_limit.unwrap();
        assert_eq!(rl.bytes_per_second, 1_048_576);
        assert_eq!(rl.refill_period, Duration::from_millis(50));
        assert_eq!(rl.burst_bytes, Some(65_536));
        assert_eq!(rl.mode, RateLimitMode::NonBlocking);
        assert_eq!(cfg.log_level, LogLevel::Debug);
        assert_eq!(cfg.log_file, Some(PathBuf::from("/var/log/pe.log")));
    }

    #[test]
    fn empty_document_is_defaults() {
        assert_eq!(parse("<config></config>").unwrap(), EnvConfig::default());
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(parse("<config><max_threads>3</max_threads></config>").is_err());
    }

    #[test]
    fn bad_number_rejected() {
        assert!(parse("<config><low_threads>many</low_threads></config>").is_err());
    }

    #[test]
    fn bad_mode_rejected() {
        let err = parse(
            "<config><rate_bytes_per_second>10</rate_bytes_per_second><rate_mode>eager</rate_mode></config>",
        )
        .unwrap_err();
        assert!(err.to_string().contains("rate_mode"));
    }
}
