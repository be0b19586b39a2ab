use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use url::Url;

use crate::cache::CacheConfig;
use crate::clients::NatsConfig;
use crate::subscription::RetryPolicy;
use crate::vm::SandboxLimits;

/// Default port of the peer stream.
pub const DEFAULT_PORT: u16 = 4242;

/// Domains generated for this deployment look like `<hash>.g.tau.link`.
pub const DEFAULT_GENERATED_DOMAIN: &str = r"^[a-z0-9]+\.g\.tau\.link$";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid `{field}`: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("invalid generated-domain pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Worker configuration, as read from `monkey.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Development mode: loopback listener, no generated-domain checks.
    pub dev: bool,
    /// Peer stream listen address. Derived from the mode and `port` when
    /// empty.
    pub listen: String,
    pub port: u16,
    /// Job-queue topic to consume.
    pub topic: String,
    /// Pattern of domains generated by this deployment (production only).
    pub generated_domain: String,
    pub scripts_dir: PathBuf,
    /// Naming service base URL.
    pub resolver_url: Option<String>,
    /// Discovery service base URL. No beacon is sent when unset.
    pub discovery_url: Option<String>,
    pub http_timeout_secs: u64,
    pub beacon_interval_secs: u64,
    pub maintenance_interval_secs: u64,
    /// Compiled contexts unused for this long are swept.
    pub maintenance_max_age_secs: u64,
    /// Jobs executing at once; unlimited when unset.
    pub max_concurrent_jobs: Option<usize>,
    /// Buffered updates per status-stream observer.
    pub observer_buffer: usize,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub sandbox: SandboxLimits,
    pub nats: NatsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dev: false,
            listen: String::new(),
            port: DEFAULT_PORT,
            topic: "monkeys".to_string(),
            generated_domain: String::new(),
            scripts_dir: PathBuf::from("scripts"),
            resolver_url: None,
            discovery_url: None,
            http_timeout_secs: 10,
            beacon_interval_secs: 30,
            maintenance_interval_secs: 60,
            maintenance_max_age_secs: 3600,
            max_concurrent_jobs: None,
            observer_buffer: 64,
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            sandbox: SandboxLimits::default(),
            nats: NatsConfig::default(),
        }
    }
}

impl Config {
    /// A development configuration listening on an ephemeral loopback port.
    pub fn dev() -> Self {
        Self {
            dev: true,
            port: 0,
            ..Self::default()
        }
    }

    /// Fill in derived defaults and validate.
    ///
    /// Returns the compiled generated-domain pattern in production mode.
    pub fn build(&mut self) -> Result<Option<Regex>, ConfigError> {
        if self.listen.trim().is_empty() {
            self.listen = if self.dev {
                format!("127.0.0.1:{}", self.port)
            } else {
                format!("0.0.0.0:{}", self.port)
            };
        }

        if self.topic.trim().is_empty() {
            return Err(ConfigError::invalid("topic", "must not be empty"));
        }
        for (field, secs) in [
            ("http_timeout_secs", self.http_timeout_secs),
            ("beacon_interval_secs", self.beacon_interval_secs),
            ("maintenance_interval_secs", self.maintenance_interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        if self.max_concurrent_jobs == Some(0) {
            return Err(ConfigError::invalid("max_concurrent_jobs", "must be greater than zero"));
        }
        if let RetryPolicy::Backoff { initial_ms, max_ms } = self.retry {
            if initial_ms == 0 || max_ms < initial_ms {
                return Err(ConfigError::invalid(
                    "retry",
                    "backoff needs 0 < initial_ms <= max_ms",
                ));
            }
        }
        if let Some(url) = &self.resolver_url {
            parse_url("resolver_url", url)?;
        }
        if let Some(url) = &self.discovery_url {
            parse_url("discovery_url", url)?;
        }

        if self.dev {
            return Ok(None);
        }

        if self.generated_domain.trim().is_empty() {
            self.generated_domain = DEFAULT_GENERATED_DOMAIN.to_string();
        }
        Ok(Some(Regex::new(&self.generated_domain)?))
    }

    pub fn resolver_url(&self) -> Result<Url, ConfigError> {
        match &self.resolver_url {
            Some(url) => parse_url("resolver_url", url),
            None => Err(ConfigError::invalid("resolver_url", "required")),
        }
    }

    pub fn discovery_url(&self) -> Result<Option<Url>, ConfigError> {
        self.discovery_url
            .as_deref()
            .map(|url| parse_url("discovery_url", url))
            .transpose()
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn beacon_interval(&self) -> Duration {
        Duration::from_secs(self.beacon_interval_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn maintenance_max_age(&self) -> Duration {
        Duration::from_secs(self.maintenance_max_age_secs)
    }

    /// Read a config file, expanding `${VAR}` references from the
    /// environment.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.expand_with(&|name| env::var(name).ok());
        Ok(config)
    }

    /// Load from `MONKEY_CONFIG` or `./monkey.json`; defaults when neither
    /// exists.
    pub fn load() -> Result<Self, ConfigError> {
        match resolve_config_path() {
            Some(path) => Self::from_path(&path),
            None => Ok(Self::default()),
        }
    }

    fn expand_with(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        self.listen = expand_env_vars(&self.listen, lookup);
        self.topic = expand_env_vars(&self.topic, lookup);
        self.generated_domain = expand_env_vars(&self.generated_domain, lookup);
        self.scripts_dir = PathBuf::from(expand_env_vars(&self.scripts_dir.to_string_lossy(), lookup));
        self.nats.url = expand_env_vars(&self.nats.url, lookup);
        for url in [&mut self.resolver_url, &mut self.discovery_url]
            .into_iter()
            .flatten()
        {
            *url = expand_env_vars(url, lookup);
        }
    }
}

fn parse_url(field: &'static str, url: &str) -> Result<Url, ConfigError> {
    Url::parse(url).map_err(|e| ConfigError::invalid(field, e.to_string()))
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("MONKEY_CONFIG") {
        return Some(PathBuf::from(p));
    }

    let candidate = PathBuf::from("monkey.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

/// Replace `${NAME}` with the value `lookup` returns; unknown names are
/// left as written.
fn expand_env_vars(input: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Some(val) = lookup(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_dev_defaults() {
        let mut config = Config::dev();
        let pattern = config.build().unwrap();

        assert!(pattern.is_none());
        assert_eq!(config.listen, "127.0.0.1:0");
        assert_eq!(config.topic, "monkeys");
    }

    #[test]
    fn test_production_defaults() {
        let mut config = Config::default();
        let pattern = config.build().unwrap().unwrap();

        assert_eq!(config.listen, format!("0.0.0.0:{}", DEFAULT_PORT));
        assert_eq!(config.generated_domain, DEFAULT_GENERATED_DOMAIN);
        assert!(pattern.is_match("abc123.g.tau.link"));
        assert!(!pattern.is_match("example.com"));
    }

    #[test]
    fn test_explicit_listen_is_kept() {
        let mut config = Config {
            listen: "10.0.0.5:9000".to_string(),
            ..Config::dev()
        };
        config.build().unwrap();
        assert_eq!(config.listen, "10.0.0.5:9000");
    }

    #[test]
    fn test_invalid_pattern() {
        let mut config = Config {
            generated_domain: "([unclosed".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.build(), Err(ConfigError::Pattern(_))));
    }

    #[test]
    fn test_invalid_pattern_ignored_in_dev() {
        let mut config = Config {
            generated_domain: "([unclosed".to_string(),
            ..Config::dev()
        };
        assert!(config.build().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config {
            topic: " ".to_string(),
            ..Config::dev()
        };
        assert!(matches!(config.build(), Err(ConfigError::Invalid { field: "topic", .. })));

        let mut config = Config {
            maintenance_interval_secs: 0,
            ..Config::dev()
        };
        assert!(matches!(
            config.build(),
            Err(ConfigError::Invalid { field: "maintenance_interval_secs", .. })
        ));

        let mut config = Config {
            resolver_url: Some("not a url".to_string()),
            ..Config::dev()
        };
        assert!(matches!(
            config.build(),
            Err(ConfigError::Invalid { field: "resolver_url", .. })
        ));

        let mut config = Config {
            retry: RetryPolicy::Backoff {
                initial_ms: 500,
                max_ms: 100,
            },
            ..Config::dev()
        };
        assert!(matches!(config.build(), Err(ConfigError::Invalid { field: "retry", .. })));
    }

    #[test]
    fn test_resolver_url_required() {
        let config = Config::dev();
        assert!(config.resolver_url().is_err());
        assert!(config.discovery_url().unwrap().is_none());
    }

    #[test]
    fn test_expand_env_vars() {
        let vars = lookup(&[("HOST", "nats.internal")]);
        assert_eq!(
            expand_env_vars("nats://${HOST}:4222", &vars),
            "nats://nats.internal:4222"
        );
        assert_eq!(expand_env_vars("${MISSING}/x", &vars), "${MISSING}/x");
        assert_eq!(expand_env_vars("$HOST", &vars), "$HOST");
    }

    #[test]
    fn test_expand_config_fields() {
        let mut config = Config {
            resolver_url: Some("http://${NAMES}/".to_string()),
            nats: NatsConfig {
                url: "nats://${NATS}".to_string(),
                ..NatsConfig::default()
            },
            ..Config::default()
        };
        config.expand_with(&lookup(&[("NAMES", "names:8080"), ("NATS", "bus:4222")]));

        assert_eq!(config.resolver_url.as_deref(), Some("http://names:8080/"));
        assert_eq!(config.nats.url, "nats://bus:4222");
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monkey.json");
        fs::write(
            &path,
            r#"{
                "dev": true,
                "topic": "builds",
                "max_concurrent_jobs": 4,
                "retry": { "kind": "backoff", "initial_ms": 100, "max_ms": 5000 },
                "cache": { "max_entries": 16 },
                "nats": { "url": "nats://bus:4222" }
            }"#,
        )
        .unwrap();

        let mut config = Config::from_path(&path).unwrap();
        config.build().unwrap();

        assert!(config.dev);
        assert_eq!(config.topic, "builds");
        assert_eq!(config.max_concurrent_jobs, Some(4));
        assert_eq!(
            config.retry,
            RetryPolicy::Backoff {
                initial_ms: 100,
                max_ms: 5000
            }
        );
        assert_eq!(config.cache.max_entries, 16);
        assert_eq!(config.nats.url, "nats://bus:4222");
        assert_eq!(config.nats.status_subject, "monkey.status");
        assert_eq!(config.observer_buffer, 64);
    }

    #[test]
    fn test_from_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::from_path(&dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));

        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::from_path(&path), Err(ConfigError::Parse { .. })));
    }
}
