//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration. File: ~/.config/ipcam/config.toml or /etc/ipcam/config.toml.
/// Env overrides: IPCAM_LISTEN_ADDRESS, IPCAM_PORT, IPCAM_DATA_FILE, IPCAM_CATALOG_DIR,
/// IPCAM_WORKER_WINDOW_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Bridge listen address (default 0.0.0.0).
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Bridge listen port (default 2001).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host placed in the stream/snapshot URLs handed to clients.
    #[serde(default)]
    pub advertised_address: Option<String>,
    /// Peer database (default /var/lib/ipcam/ipcam.db).
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
    /// Extra JSON device descriptions.
    #[serde(default)]
    pub catalog_dir: Option<PathBuf>,
    /// Time in which every peer is visited once by the worker (default 3000).
    #[serde(default = "default_worker_window_ms")]
    pub worker_window_ms: u64,
    /// tracing filter directive; RUST_LOG wins when set.
    #[serde(default)]
    pub log_filter: Option<String>,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    2001
}
fn default_data_file() -> PathBuf {
    PathBuf::from("/var/lib/ipcam/ipcam.db")
}
fn default_worker_window_ms() -> u64 {
    3000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: default_port(),
            advertised_address: None,
            data_file: default_data_file(),
            catalog_dir: None,
            worker_window_ms: default_worker_window_ms(),
            log_filter: None,
        }
    }
}

impl Config {
    /// Address other devices use to reach the bridge.
    pub fn advertised(&self) -> String {
        match &self.advertised_address {
            Some(a) if !a.is_empty() => a.clone(),
            _ => self.listen_address.clone(),
        }
    }

    pub fn settings(&self) -> ipcam_core::Settings {
        ipcam_core::Settings {
            worker_window: Duration::from_millis(self.worker_window_ms),
            ..ipcam_core::Settings::default()
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("IPCAM_LISTEN_ADDRESS") {
        c.listen_address = s;
    }
    if let Some(s) = var("IPCAM_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Some(s) = var("IPCAM_DATA_FILE") {
        c.data_file = PathBuf::from(s);
    }
    if let Some(s) = var("IPCAM_CATALOG_DIR") {
        c.catalog_dir = Some(PathBuf::from(s));
    }
    if let Some(s) = var("IPCAM_WORKER_WINDOW_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.worker_window_ms = ms;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ipcam/config.toml"));
    }
    out.push(PathBuf::from("/etc/ipcam/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    // logging is not up yet
                    Err(e) => eprintln!("ignoring {}: {}", p.display(), e),
                },
                Err(e) => eprintln!("cannot read {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_values_and_defaults() {
        let c: Config = toml::from_str(
            r#"
            port = 8080
            advertised_address = "cams.lan"
            catalog_dir = "/usr/share/ipcam/devices"
            "#,
        )
        .unwrap();
        assert_eq!(c.port, 8080);
        assert_eq!(c.listen_address, "0.0.0.0");
        assert_eq!(c.advertised(), "cams.lan");
        assert_eq!(c.worker_window_ms, 3000);
        assert_eq!(c.data_file, PathBuf::from("/var/lib/ipcam/ipcam.db"));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 1").is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("IPCAM_PORT", "9000"),
            ("IPCAM_WORKER_WINDOW_MS", "500"),
            ("IPCAM_LISTEN_ADDRESS", "127.0.0.1"),
            ("IPCAM_DATA_FILE", "/tmp/x.db"),
        ]
        .into_iter()
        .collect();
        let c = apply_env(Config::default(), |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.port, 9000);
        assert_eq!(c.advertised(), "127.0.0.1");
        assert_eq!(c.settings().worker_window, Duration::from_millis(500));
        assert_eq!(c.data_file, PathBuf::from("/tmp/x.db"));

        let bad = apply_env(Config::default(), |k| (k == "IPCAM_PORT").then(|| "nope".to_string()));
        assert_eq!(bad.port, 2001);
    }
}
