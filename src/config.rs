//! Daemon configuraton: defaults, config-file/environment layering, and a
//! [`CowCell`]-guarded snapshot shared with the event loop.
//!
//! Grounded on `ConfigFile`/`try_from`/`try_as_cowcell` in
//! `examples/yaleman-goatns/src/config.rs`: same `config` crate file +
//! environment layering, same `CowCell` sharing discipline, same
//! "search a list of candidate paths, fall back to defaults" loader shape.

use std::fmt::Display;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use concread::cowcell::asynch::CowCell;
use config::{Config, File};
use serde::{Deserialize, Serialize};

/// Default loopback listening port, per spec.md 6 / `DEFAULT_PVDD_PORT` in
/// `examples/original_source/include/pvd-defs.h`.
pub const DEFAULT_PORT: u16 = 10101;

static CONFIG_LOCATIONS: LazyLock<Vec<&'static str>> =
    LazyLock::new(|| vec!["./pvdd.json", "~/.config/pvdd.json"]);

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    /// Listen address for the control-plane TCP socket, default 127.0.0.1.
    pub address: String,
    /// Listen port, default [`DEFAULT_PORT`]; overridable by `-p`/`--port`.
    pub port: u16,
    /// Verbose (debug-level) logging, toggled by `-v`.
    pub verbose: bool,
    /// Skip the kernel socket-option probe and the rtnetlink subscription,
    /// going straight to ICMPv6 RA parsing. Set by `-r`/`--use-cached-ra`.
    pub use_cached_ra: bool,
    /// Persisted-state directory; accepted but unused, per spec.md 6's
    /// explicit non-goal.
    pub persistence_dir: Option<PathBuf>,
    /// Name of the network interface to listen for RAs/join rtnetlink on;
    /// `None` means "all interfaces".
    pub interface: Option<String>,
}

impl ConfigFile {
    pub fn as_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self)
            .unwrap_or_else(|err| format!("{{\"error\": \"failed to serialize config: {err}\"}}"))
    }

    pub fn listener_address(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.address, self.port)
            .parse::<SocketAddr>()
            .map_err(|err| format!("failed to parse listener address: {err}"))
    }

    /// Loads configuration from `config_path` or the default search list,
    /// layering environment variables prefixed `PVDD_` over the file, and
    /// falling back to [`ConfigFile::default`] if nothing is found.
    pub fn try_from_path(config_path: Option<&str>) -> Result<ConfigFile, std::io::Error> {
        let file_locations: Vec<String> = match config_path {
            Some(value) => vec![value.to_owned()],
            None => CONFIG_LOCATIONS.iter().map(|s| s.to_string()).collect(),
        };

        let found_files: Vec<String> = file_locations
            .iter()
            .filter_map(|f| {
                let path = shellexpand::tilde(f).into_owned();
                if std::path::Path::new(&path).exists() {
                    Some(path)
                } else {
                    None
                }
            })
            .collect();

        if found_files.is_empty() {
            if config_path.is_some() {
                return Err(std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("config file not found: {}", file_locations.join(", ")),
                ));
            }
            return Ok(ConfigFile::default());
        }

        for filepath in found_files {
            let builder = Config::builder()
                .add_source(File::new(&filepath, config::FileFormat::Json))
                .add_source(config::Environment::with_prefix("pvdd"));
            match builder.build() {
                Ok(config) => {
                    tracing::info!("loaded configuration from {filepath}");
                    return Ok(ConfigFile::from(config));
                }
                Err(err) => tracing::warn!("failed to load {filepath}: {err}"),
            }
        }
        Ok(ConfigFile::default())
    }

    pub fn try_as_cowcell(config_path: Option<&str>) -> Result<CowCell<ConfigFile>, std::io::Error> {
        Ok(CowCell::new(ConfigFile::try_from_path(config_path)?))
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::LOCALHOST.to_string(),
            port: DEFAULT_PORT,
            verbose: false,
            use_cached_ra: false,
            persistence_dir: None,
            interface: None,
        }
    }
}

impl Display for ConfigFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "listening_address=\"{}:{}\" verbose={} use_cached_ra={} interface={:?}",
            self.address, self.port, self.verbose, self.use_cached_ra, self.interface
        )
    }
}

impl From<Config> for ConfigFile {
    fn from(config: Config) -> Self {
        let defaults = ConfigFile::default();
        ConfigFile {
            address: config.get("address").unwrap_or(defaults.address),
            port: config.get("port").unwrap_or(defaults.port),
            verbose: config.get("verbose").unwrap_or(defaults.verbose),
            use_cached_ra: config.get("use_cached_ra").unwrap_or(defaults.use_cached_ra),
            persistence_dir: config
                .get("persistence_dir")
                .unwrap_or(defaults.persistence_dir),
            interface: config.get("interface").unwrap_or(defaults.interface),
        }
    }
}

impl FromStr for ConfigFile {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let source = File::from_str(input, config::FileFormat::Json);
        let config = Config::builder()
            .add_source(source)
            .build()
            .map_err(|err| format!("{err:?}"))?;
        Ok(config.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_loopback_10101() {
        let config = ConfigFile::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.address, "127.0.0.1");
    }

    #[test]
    fn missing_explicit_config_path_is_an_error() {
        let err = ConfigFile::try_from_path(Some("/nonexistent/pvdd.json")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn missing_default_locations_falls_back_to_defaults() {
        let config = ConfigFile::try_from_path(None).unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn parses_from_json_str() {
        let config: ConfigFile = r#"{"port": 20202}"#.parse().unwrap();
        assert_eq!(config.port, 20202);
        assert_eq!(config.address, ConfigFile::default().address);
    }

    #[test]
    fn loads_explicit_config_file_from_disk() {
        use std::io::Write;
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("create temp config file");
        write!(file, r#"{{"port": 30303, "verbose": true}}"#).expect("write temp config file");

        let config = ConfigFile::try_from_path(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.port, 30303);
        assert!(config.verbose);
        assert_eq!(config.address, ConfigFile::default().address);
    }
}
