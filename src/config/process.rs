//! Process-lifetime startup configuration, layered defaults → file → env.
//!
//! Grounded on the teacher's `meridian-server::config::ServerConfig::load`:
//! a `config::Config::builder()` stack of default values, an optional file,
//! and environment variables under a fixed prefix, collected once at process
//! start and never mutated afterward (unlike [`super::ConfigDocument`], which
//! is the live, RwLock-guarded document the application edits at runtime).

use config::{Config, Environment, File};
use serde::Deserialize;

/// Startup configuration read once when the process boots.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Root directory backend paths and the config document resolve against.
    #[serde(default = "default_root")]
    pub root: String,
    /// Port the management surface (if any) binds to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// `tracing_subscriber::EnvFilter`-compatible directive.
    #[serde(default = "default_log")]
    pub log: String,
}

fn default_root() -> String {
    "/data".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log() -> String {
    "info".to_string()
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            port: default_port(),
            log: default_log(),
        }
    }
}

impl ProcessConfig {
    /// Layer defaults, then an optional `taskvault.toml` in the current
    /// directory, then `TASKVAULT_*` environment variables, in that order.
    pub fn load() -> Result<Self, config::ConfigError> {
        let cfg = Config::builder()
            .set_default("root", default_root())?
            .set_default("port", default_port() as i64)?
            .set_default("log", default_log())?
            .add_source(File::with_name("taskvault").required(false))
            .add_source(Environment::with_prefix("TASKVAULT"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn config_document_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.root).join("config").join("config.json")
    }

    pub fn history_db_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.root).join("config").join("archivist.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ProcessConfig::default();
        assert_eq!(cfg.root, "/data");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.log, "info");
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("TASKVAULT_PORT", "9090");
        std::env::set_var("TASKVAULT_ROOT", "/tmp/taskvault-test-root");
        let cfg = ProcessConfig::load().expect("layered config should build");
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.root, "/tmp/taskvault-test-root");
        std::env::remove_var("TASKVAULT_PORT");
        std::env::remove_var("TASKVAULT_ROOT");
    }
}
