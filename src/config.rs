//! Configuration for the mock server.
//!
//! Defines the route table (pattern → method → ordered routes) and the
//! listening port, loaded from a YAML document.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Port used when the configuration does not name one.
pub const DEFAULT_PORT: &str = "8080";

/// Routes as authored: URL pattern → HTTP method → ordered routes.
pub type RouteMap = HashMap<String, HashMap<String, Vec<Route>>>;

/// Errors raised while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MockerConfig {
    /// Listening port, kept as authored (`"8080"` and `8080` are both accepted)
    #[serde(default, deserialize_with = "port_from_yaml")]
    pub port: Option<String>,

    /// Route table
    #[serde(default)]
    pub routes: RouteMap,
}

impl MockerConfig {
    /// Load, normalize and validate configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &content)
    }

    /// Like [`MockerConfig::from_file`], reading the file on the async runtime.
    pub async fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(path, &content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Self::parse(Path::new("<inline>"), yaml)
    }

    fn parse(path: &Path, yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// The port to listen on, falling back to [`DEFAULT_PORT`].
    pub fn port(&self) -> &str {
        match self.port.as_deref() {
            Some(port) if !port.trim().is_empty() => port.trim(),
            _ => DEFAULT_PORT,
        }
    }

    /// Lower-case method keys and give every unnamed route its positional name.
    ///
    /// Buckets that differ only in case (`GET` and `get`) are concatenated in
    /// lexical key order so the result does not depend on map iteration.
    pub fn normalize(&mut self) {
        for methods in self.routes.values_mut() {
            let mut keys: Vec<String> = methods.keys().cloned().collect();
            keys.sort();

            let mut merged: HashMap<String, Vec<Route>> = HashMap::new();
            for key in keys {
                if let Some(routes) = methods.remove(&key) {
                    merged.entry(key.to_lowercase()).or_default().extend(routes);
                }
            }

            for routes in merged.values_mut() {
                for (i, route) in routes.iter_mut().enumerate() {
                    if route.name.as_deref().map_or(true, str::is_empty) {
                        route.name = Some(format!("route #{}", i + 1));
                    }
                }
            }

            *methods = merged;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(port) = self.port.as_deref() {
            let port = port.trim();
            if !port.is_empty() && port.parse::<u16>().is_err() {
                return Err(ConfigError::Invalid(format!("invalid port: {port:?}")));
            }
        }

        for (pattern, methods) in &self.routes {
            if !pattern.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "pattern {pattern:?} must start with '/'"
                )));
            }
            for (method, routes) in methods {
                if axum::http::Method::from_bytes(method.as_bytes()).is_err() {
                    return Err(ConfigError::Invalid(format!(
                        "{pattern}: invalid method {method:?}"
                    )));
                }
                for route in routes {
                    route
                        .validate()
                        .map_err(|e| ConfigError::Invalid(format!("{pattern} {method}: {e}")))?;
                }
            }
        }
        Ok(())
    }

    /// Total number of routes across all patterns and methods.
    pub fn route_count(&self) -> usize {
        self.routes
            .values()
            .flat_map(|methods| methods.values())
            .map(Vec::len)
            .sum()
    }
}

/// A single matching rule.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Route {
    /// Expressions that must all be truthy (empty = always matches)
    #[serde(default)]
    pub conditions: Vec<String>,

    /// Response body template
    #[serde(default)]
    pub response: String,

    /// HTTP status code (0 = 200)
    #[serde(default)]
    pub code: u16,

    /// Human-readable identifier
    #[serde(default)]
    pub name: Option<String>,

    /// Response header templates
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Route {
    /// Status code to answer with.
    pub fn status(&self) -> u16 {
        if self.code == 0 {
            200
        } else {
            self.code
        }
    }

    /// Display name; unnamed routes are only seen before normalization.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed route")
    }

    /// Validate the route definition.
    pub fn validate(&self) -> Result<(), String> {
        if self.code != 0 && !(100..=599).contains(&self.code) {
            return Err(format!(
                "{}: invalid status code {}",
                self.display_name(),
                self.code
            ));
        }
        Ok(())
    }
}

fn port_from_yaml<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<Port>::deserialize(deserializer)? {
        Some(Port::Number(n)) => Some(n.to_string()),
        Some(Port::Text(s)) => Some(s),
        None => None,
    })
}
