//! Configuration for the replay proxy.
//!
//! Replaces the teacher's `mini-config` global key/value store: that crate
//! is built for cross-process IPC between a CLI, a GUI and an admin API,
//! none of which this single-process proxy has. A plain `serde` struct
//! loaded from TOML covers the fields the spec enumerates.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WprError};

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WprConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub is_ssl: bool,

    #[serde(default)]
    pub https_root_ca_cert_path: Option<String>,

    #[serde(default = "default_true")]
    pub use_delays: bool,

    #[serde(default)]
    pub up_bandwidth: Bandwidth,

    #[serde(default)]
    pub down_bandwidth: Bandwidth,

    #[serde(default)]
    pub delay_ms: u64,

    #[serde(default)]
    pub use_record_mode: bool,

    #[serde(default)]
    pub use_diff_on_unknown_requests: bool,

    #[serde(default)]
    pub use_closest_match: bool,

    #[serde(default)]
    pub scramble_images: bool,

    #[serde(default)]
    pub inject_script: Option<String>,
}

impl Default for WprConfig {
    fn default() -> Self {
        WprConfig {
            host: default_host(),
            port: default_port(),
            is_ssl: false,
            https_root_ca_cert_path: None,
            use_delays: true,
            up_bandwidth: Bandwidth::Unlimited,
            down_bandwidth: Bandwidth::Unlimited,
            delay_ms: 0,
            use_record_mode: false,
            use_diff_on_unknown_requests: false,
            use_closest_match: false,
            scramble_images: false,
            inject_script: None,
        }
    }
}

impl WprConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| WprError::Config(e.to_string()))
    }
}

/// A bandwidth limit, parsed from strings like `"1Mbit/s"` or `"0"`
/// (unlimited). Stored in bytes/second once parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bandwidth {
    #[default]
    Unlimited,
    BytesPerSec(u64),
}

impl Bandwidth {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "0" {
            return Ok(Bandwidth::Unlimited);
        }
        let lower = s.to_ascii_lowercase();
        let (num_part, unit_part) = lower
            .split_once("bit/s")
            .map(|(n, _)| (n, "bit"))
            .or_else(|| lower.split_once("byte/s").map(|(n, _)| (n, "byte")))
            .ok_or_else(|| WprError::Config(format!("unrecognized bandwidth string: {s}")))?;

        let (num_str, multiplier): (&str, u64) = if let Some(n) = num_part.strip_suffix('k') {
            (n, 1_000)
        } else if let Some(n) = num_part.strip_suffix('m') {
            (n, 1_000_000)
        } else if let Some(n) = num_part.strip_suffix('g') {
            (n, 1_000_000_000)
        } else {
            (num_part, 1)
        };

        let base: f64 = num_str
            .parse()
            .map_err(|_| WprError::Config(format!("unrecognized bandwidth string: {s}")))?;

        let bits_per_sec = base * multiplier as f64;
        let bytes_per_sec = if unit_part == "bit" {
            bits_per_sec / 8.0
        } else {
            bits_per_sec
        };

        Ok(Bandwidth::BytesPerSec(bytes_per_sec.round() as u64))
    }
}

impl<'de> Deserialize<'de> for Bandwidth {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Bandwidth::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Bandwidth {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Bandwidth::Unlimited => serializer.serialize_str("0"),
            Bandwidth::BytesPerSec(bps) => {
                serializer.serialize_str(&format!("{}Byte/s", bps))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unlimited() {
        assert_eq!(Bandwidth::parse("0").unwrap(), Bandwidth::Unlimited);
        assert_eq!(Bandwidth::parse("").unwrap(), Bandwidth::Unlimited);
    }

    #[test]
    fn parses_mbit() {
        match Bandwidth::parse("1Mbit/s").unwrap() {
            Bandwidth::BytesPerSec(bps) => assert_eq!(bps, 125_000),
            _ => panic!("expected limited bandwidth"),
        }
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = WprConfig::default();
        assert!(cfg.use_delays);
        assert!(!cfg.use_closest_match);
        assert!(!cfg.use_diff_on_unknown_requests);
        assert_eq!(cfg.up_bandwidth, Bandwidth::Unlimited);
    }
}
