use std::path::PathBuf;

/// Where the HTTP server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(String),
    Unix(PathBuf),
}

impl ListenAddr {
    /// Values starting with `/` are Unix socket paths, everything else a
    /// TCP `host:port`.
    pub fn parse(value: &str) -> Self {
        if value.starts_with('/') {
            Self::Unix(PathBuf::from(value))
        } else {
            Self::Tcp(value.to_string())
        }
    }
}

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `WEBMPC_LISTEN`, default `0.0.0.0:8080`.
    pub listen: ListenAddr,
    /// MPD server address (e.g. `127.0.0.1:6600`).
    pub mpd_addr: String,
    /// MPD password. Unset or empty means no authentication.
    pub mpd_password: Option<String>,
}

impl Config {
    /// Load configuration from environment variables. Every variable has a
    /// default.
    pub fn from_env() -> Self {
        Self {
            listen: ListenAddr::parse(&var_or("WEBMPC_LISTEN", "0.0.0.0:8080")),
            mpd_addr: var_or("MPD_ADDR", "127.0.0.1:6600"),
            mpd_password: std::env::var("MPD_PASSWORD").ok().filter(|s| !s.is_empty()),
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}
