//! Configuration types and loading for the resolver.

use crate::dns::iterative::DEFAULT_MAX_HOPS;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

/// Default config.yaml embedded at compile time
pub const DEFAULT_CONFIG_YAML: &str = include_str!("../../config.yaml");

/// Main configuration struct
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ============== DNS Config ==============

/// How cache misses are resolved
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    #[default]
    Forward,
    Iterative,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsConfig {
    #[serde(default = "default_dns_listen")]
    pub listen: String,
    #[serde(default)]
    pub strategy: ResolutionMode,
    /// Forwarding target, `ip:port` or bare `ip` (port 53)
    #[serde(default = "default_dns_upstream")]
    pub upstream: String,
    /// Per-attempt upstream timeout
    #[serde(default = "default_dns_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_dns_max_hops")]
    pub max_hops: usize,
    /// Root servers for iterative mode; empty uses the built-in IANA set
    #[serde(default)]
    pub root_servers: Vec<String>,
    /// Reject upstream replies from an address other than the one queried
    #[serde(default = "default_verify_upstream_source")]
    pub verify_upstream_source: bool,
    #[serde(default)]
    pub cache: DnsCacheConfig,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            listen: default_dns_listen(),
            strategy: ResolutionMode::default(),
            upstream: default_dns_upstream(),
            timeout_ms: default_dns_timeout_ms(),
            max_hops: default_dns_max_hops(),
            root_servers: Vec::new(),
            verify_upstream_source: default_verify_upstream_source(),
            cache: DnsCacheConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsCacheConfig {
    /// Snapshot file written at shutdown and read at startup (null = off)
    #[serde(default = "default_backup_file")]
    pub backup_file: Option<String>,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl_seconds: u32,
}

impl Default for DnsCacheConfig {
    fn default() -> Self {
        DnsCacheConfig {
            backup_file: default_backup_file(),
            sweep_interval_seconds: default_sweep_interval(),
            max_ttl_seconds: default_max_ttl(),
        }
    }
}

pub fn default_dns_listen() -> String {
    "0.0.0.0:53".to_string()
}

pub fn default_dns_upstream() -> String {
    "1.1.1.1:53".to_string()
}

fn default_dns_timeout_ms() -> u64 {
    2000 // 2 seconds per upstream attempt
}

fn default_dns_max_hops() -> usize {
    DEFAULT_MAX_HOPS
}

fn default_verify_upstream_source() -> bool {
    true
}

fn default_backup_file() -> Option<String> {
    Some("dns_cache.json".to_string())
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_ttl() -> u32 {
    86400 // 1 day
}

// ============== Logging Config ==============

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_queries")]
    pub log_queries: bool,
    #[serde(default)]
    pub format: LogFormat,
    /// File logging configuration
    #[serde(default)]
    pub file: Option<FileLoggingConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_queries: default_log_queries(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileLoggingConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
    #[serde(default)]
    pub rotation: LogRotation,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        FileLoggingConfig {
            log_dir: default_log_dir(),
            file_prefix: default_log_file_prefix(),
            rotation: LogRotation::Daily,
        }
    }
}

fn default_log_queries() -> bool {
    true
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_file_prefix() -> String {
    "cachedns.log".to_string()
}

// ============== Config Loading ==============

/// Get the directory containing the executable
fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

/// Load configuration from file, falling back to defaults when none exists
pub fn load_config(path: Option<&str>) -> Result<Config, Box<dyn std::error::Error + Send + Sync>> {
    let config_paths = if let Some(p) = path {
        vec![PathBuf::from(p)]
    } else {
        let mut paths = vec![PathBuf::from("config.yaml")];
        if let Some(dir) = exe_dir() {
            paths.push(dir.join("config.yaml"));
        }
        paths
    };

    for config_path in config_paths {
        if config_path.exists() {
            println!("Loading config from: {}", config_path.display());
            let content = fs::read_to_string(&config_path)?;
            let config: Config = serde_yaml_ng::from_str(&content)?;
            return Ok(config);
        }
    }

    Ok(Config::default())
}

// ============== Unit Tests ==============

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_dns_listen() {
        assert_eq!(default_dns_listen(), "0.0.0.0:53");
    }

    #[test]
    fn test_default_dns_upstream() {
        assert_eq!(default_dns_upstream(), "1.1.1.1:53");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_yaml_ng::from_str("").unwrap_or_default();
        assert_eq!(config.dns.listen, "0.0.0.0:53");
        assert_eq!(config.dns.strategy, ResolutionMode::Forward);
        assert_eq!(config.dns.timeout_ms, 2000);
        assert_eq!(config.dns.max_hops, 15);
        assert_eq!(config.dns.cache.sweep_interval_seconds, 60);
        assert_eq!(config.dns.cache.backup_file.as_deref(), Some("dns_cache.json"));
        assert!(config.logging.log_queries);
    }

    #[test]
    fn test_embedded_default_config_parses() {
        let config: Config = serde_yaml_ng::from_str(DEFAULT_CONFIG_YAML).unwrap();
        assert_eq!(config.dns.strategy, ResolutionMode::Forward);
        assert_eq!(config.dns.upstream, "1.1.1.1:53");
        assert!(config.dns.root_servers.is_empty());
        assert!(config.dns.verify_upstream_source);
        assert_eq!(config.dns.cache.max_ttl_seconds, 86400);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_iterative_config() {
        let yaml = r#"
dns:
  listen: "127.0.0.1:5353"
  strategy: iterative
  max_hops: 8
  root_servers: ["198.41.0.4:53"]
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.dns.listen, "127.0.0.1:5353");
        assert_eq!(config.dns.strategy, ResolutionMode::Iterative);
        assert_eq!(config.dns.max_hops, 8);
        assert_eq!(config.dns.root_servers, vec!["198.41.0.4:53".to_string()]);
        // Unspecified fields keep their defaults
        assert_eq!(config.dns.timeout_ms, 2000);
    }

    #[test]
    fn test_backup_file_disabled() {
        let yaml = r#"
dns:
  cache:
    backup_file: null
    sweep_interval_seconds: 30
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(config.dns.cache.backup_file.is_none());
        assert_eq!(config.dns.cache.sweep_interval_seconds, 30);
    }

    #[test]
    fn test_invalid_strategy_rejected() {
        let yaml = "dns:\n  strategy: recursive\n";
        assert!(serde_yaml_ng::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_logging_config() {
        let yaml = r#"
logging:
  log_queries: false
  format: json
  file:
    log_dir: /var/log/cachedns
    rotation: hourly
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(!config.logging.log_queries);
        assert_eq!(config.logging.format, LogFormat::Json);
        let file = config.logging.file.unwrap();
        assert_eq!(file.log_dir, "/var/log/cachedns");
        assert_eq!(file.file_prefix, "cachedns.log");
        assert_eq!(file.rotation, LogRotation::Hourly);
    }

    #[test]
    fn test_load_config_nonexistent_path() {
        let config = load_config(Some("/nonexistent/path/config.yaml")).unwrap();
        assert_eq!(config.dns.listen, "0.0.0.0:53");
    }
}
