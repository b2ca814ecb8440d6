use std::fs::read_to_string;
use std::net::SocketAddr;

use clap::Parser;
use serde::Deserialize;

/// Command-line overrides. Everything has a config-file or built-in
/// default, so a bare `telehub` with no flags is a valid way to start
/// the process for local testing.
#[derive(Parser, Debug)]
#[command(name = "telehub", about = "UDP/HTTP vehicle telemetry hub")]
pub struct Cli {
    /// Path to a TOML config file. When omitted, built-in defaults apply.
    #[arg(long)]
    pub config: Option<String>,

    #[arg(long)]
    pub udp_bind: Option<SocketAddr>,

    #[arg(long)]
    pub http_bind: Option<SocketAddr>,

    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Net {
    #[serde(default = "Net::default_udp_bind")]
    pub udp_bind: SocketAddr,
    #[serde(default = "Net::default_http_bind")]
    pub http_bind: SocketAddr,
}

impl Net {
    fn default_udp_bind() -> SocketAddr {
        "0.0.0.0:33000".parse().unwrap()
    }

    fn default_http_bind() -> SocketAddr {
        "0.0.0.0:8080".parse().unwrap()
    }
}

impl Default for Net {
    fn default() -> Self {
        Self {
            udp_bind: Self::default_udp_bind(),
            http_bind: Self::default_http_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    #[serde(default = "Session::default_max_channels")]
    pub max_channels: usize,
    #[serde(default = "Session::default_channel_timeout")]
    pub channel_timeout_secs: u64,
    #[serde(default = "Session::default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "Session::default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "Session::default_cache_size")]
    pub cache_size: usize,
    #[serde(default)]
    pub server_key: String,
}

impl Session {
    fn default_max_channels() -> usize {
        100
    }
    fn default_channel_timeout() -> u64 {
        300
    }
    fn default_sync_interval() -> u64 {
        30
    }
    fn default_command_timeout() -> u64 {
        5
    }
    fn default_cache_size() -> usize {
        1000
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            max_channels: Self::default_max_channels(),
            channel_timeout_secs: Self::default_channel_timeout(),
            sync_interval_secs: Self::default_sync_interval(),
            command_timeout_secs: Self::default_command_timeout(),
            cache_size: Self::default_cache_size(),
            server_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Store {
    #[serde(default = "Store::default_enabled")]
    pub enabled: bool,
    #[serde(default = "Store::default_data_dir")]
    pub data_dir: String,
}

impl Store {
    fn default_enabled() -> bool {
        true
    }
    fn default_data_dir() -> String {
        "data".to_string()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            data_dir: Self::default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::default_level")]
    pub level: String,
    #[serde(default = "Log::default_dir")]
    pub dir: String,
}

impl Log {
    fn default_level() -> String {
        "info".to_string()
    }
    fn default_dir() -> String {
        "log".to_string()
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            dir: Self::default_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub net: Net,
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    /// Compose defaults, an optional config file, and CLI overrides, in
    /// that ascending order of precedence.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => {
                let text = read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("failed to read config file {path}: {e}"))?;
                toml::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("failed to parse config file {path}: {e}"))?
            }
            None => Config::default(),
        };

        if let Some(addr) = cli.udp_bind {
            config.net.udp_bind = addr;
        }
        if let Some(addr) = cli.http_bind {
            config.net.http_bind = addr;
        }
        if let Some(level) = &cli.log_level {
            config.log.level = level.clone();
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let config = Config::default();
        assert_eq!(config.net.udp_bind.port(), 33000);
        assert_eq!(config.session.max_channels, 100);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let text = r#"
            [session]
            max_channels = 5
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.session.max_channels, 5);
        assert_eq!(config.session.channel_timeout_secs, 300);
    }
}
