use duration_string::DurationString;
use serde::{Deserialize, Deserializer};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// A custom error for describing the error cases of loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file cannot be read.
    #[error("cannot read {0}: {1}")]
    Unreadable(String, std::io::Error),
    /// The file is not valid TOML or has unknown fields.
    #[error("cannot parse {0}: {1}")]
    Invalid(String, toml::de::Error),
    /// A network in the source allow-list cannot be parsed.
    #[error("invalid network {0:?}")]
    InvalidNetwork(String),
}

/// Which callers may deliver webhooks.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// Allow the `hooks` networks published by GitHub.
    pub github_meta: bool,
    /// Additional networks in CIDR notation.
    pub allowed_networks: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            github_meta: true,
            allowed_networks: vec![],
        }
    }
}

/// The service configuration, read once on startup.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Path to the rules file, which is read on every request.
    pub handlers: Option<PathBuf>,
    /// Root of the repository cache.
    pub cache_dir: Option<PathBuf>,
    /// Address of the HTTP server.
    pub listen: String,
    /// Upper bound for fetching and cloning one repository.
    #[serde(deserialize_with = "deserialize_duration")]
    pub fetch_timeout: Duration,
    /// Upper bound for running one action.
    #[serde(deserialize_with = "deserialize_duration")]
    pub action_timeout: Duration,
    pub source: SourceConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            handlers: None,
            cache_dir: None,
            listen: DEFAULT_LISTEN.to_string(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            source: SourceConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load the config file. Relative `handlers` and `cache_dir` paths are resolved
    /// from the directory of the config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = read_file(path)?;
        let mut config = Self::parse(&contents, path)?;

        if let Some(base) = path.parent() {
            config.handlers = config.handlers.map(|handlers| base.join(handlers));
            config.cache_dir = config.cache_dir.map(|cache_dir| base.join(cache_dir));
        }

        Ok(config)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents)
            .map_err(|err| ConfigError::Invalid(path.to_string_lossy().to_string(), err))
    }
}

/// The default cache root, `~/gwh-cache`.
pub fn default_cache_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("~"))
        .join("gwh-cache")
}

/// Parse durations like `30s`, `5m` or `1h`.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    let duration: DurationString = value.parse().map_err(serde::de::Error::custom)?;

    Ok(duration.into())
}

pub(crate) fn read_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path)
        .map_err(|err| ConfigError::Unreadable(path.to_string_lossy().to_string(), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn it_should_use_defaults_for_an_empty_file() -> Result<(), Box<dyn Error>> {
        let config = ServiceConfig::parse("", Path::new("gwh.toml"))?;

        assert_eq!(ServiceConfig::default(), config);
        assert_eq!("0.0.0.0:8080", config.listen);
        assert_eq!(DEFAULT_FETCH_TIMEOUT, config.fetch_timeout);
        assert!(config.source.github_meta);

        Ok(())
    }

    #[test]
    fn it_should_parse_every_field() -> Result<(), Box<dyn Error>> {
        let config = ServiceConfig::parse(
            r#"
            handlers = "/etc/gwh/handlers.toml"
            cache_dir = "/var/cache/gwh"
            listen = "127.0.0.1:9000"
            fetch_timeout = "30s"
            action_timeout = "5m"

            [source]
            github_meta = false
            allowed_networks = ["10.0.0.0/8"]
            "#,
            Path::new("gwh.toml"),
        )?;

        assert_eq!(
            Some(PathBuf::from("/etc/gwh/handlers.toml")),
            config.handlers
        );
        assert_eq!(Some(PathBuf::from("/var/cache/gwh")), config.cache_dir);
        assert_eq!("127.0.0.1:9000", config.listen);
        assert_eq!(Duration::from_secs(30), config.fetch_timeout);
        assert_eq!(Duration::from_secs(300), config.action_timeout);
        assert!(!config.source.github_meta);
        assert_eq!(vec!["10.0.0.0/8".to_string()], config.source.allowed_networks);

        Ok(())
    }

    #[test]
    fn it_should_fail_on_unknown_fields() {
        let result = ServiceConfig::parse("handler = \"x\"", Path::new("gwh.toml"));

        assert!(
            matches!(result, Err(ConfigError::Invalid(_, _))),
            "{result:?} should be Invalid"
        );
    }

    #[test]
    fn it_should_resolve_paths_next_to_the_config() -> Result<(), Box<dyn Error>> {
        let directory = tempfile::tempdir()?;
        let path = directory.path().join("gwh.toml");
        fs::write(&path, "handlers = \"handlers.toml\"\ncache_dir = \"/abs/cache\"")?;

        let config = ServiceConfig::load(&path)?;
        assert_eq!(
            Some(directory.path().join("handlers.toml")),
            config.handlers
        );
        assert_eq!(Some(PathBuf::from("/abs/cache")), config.cache_dir);

        Ok(())
    }

    #[test]
    fn it_should_fail_on_a_missing_file() {
        let result = ServiceConfig::load(Path::new("/path/to/nowhere.toml"));

        assert!(
            matches!(result, Err(ConfigError::Unreadable(_, _))),
            "{result:?} should be Unreadable"
        );
    }
}
