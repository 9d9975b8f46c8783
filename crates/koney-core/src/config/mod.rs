//! Environment configuration shared by both daemons.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Default HTTP port of the alert forwarder.
pub const DEFAULT_PORT: u16 = 8000;

/// Fallback operator namespace when in-cluster discovery fails.
pub const DEFAULT_NAMESPACE: &str = "koney-system";

/// Path of the mounted service-account namespace file.
const SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Runtime configuration read from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// HTTP listen port (`PORT`).
    pub port: u16,

    /// Log filter directive (`LOG_LEVEL`, `DEBUG`).
    pub log_level: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_level: "info".to_string(),
        }
    }
}

impl EnvConfig {
    /// Build configuration from the process environment.
    ///
    /// `DEBUG` set to anything but `false`/`0` switches to debug
    /// logging; `LOG_LEVEL` takes precedence for finer control.
    #[must_use]
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let mut log_level = "info".to_string();
        if let Ok(debug) = std::env::var("DEBUG") {
            if !matches!(debug.as_str(), "" | "false" | "0") {
                log_level = "debug".to_string();
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            match level.to_lowercase().as_str() {
                lvl @ ("debug" | "info" | "warn" | "error") => log_level = lvl.to_string(),
                "warning" => log_level = "warn".to_string(),
                _ => {}
            }
        }

        Self { port, log_level }
    }
}

/// Discover the operator's own namespace from the in-cluster
/// service-account mount, falling back to [`DEFAULT_NAMESPACE`].
#[must_use]
pub fn operator_namespace() -> String {
    namespace_from(Path::new(SERVICE_ACCOUNT_NAMESPACE_PATH))
}

/// Read a namespace name from a mounted file, with fallback.
#[must_use]
pub fn namespace_from(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
        _ => {
            tracing::debug!(
                path = %path.display(),
                fallback = DEFAULT_NAMESPACE,
                "could not read namespace from service-account mount"
            );
            DEFAULT_NAMESPACE.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_namespace_fallback() {
        assert_eq!(
            namespace_from(Path::new("/nonexistent/namespace")),
            DEFAULT_NAMESPACE
        );
    }

    #[test]
    fn test_namespace_from_mounted_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "deception-ops").unwrap();
        assert_eq!(namespace_from(file.path()), "deception-ops");
    }

    #[test]
    fn test_default_config() {
        let config = EnvConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.log_level, "info");
    }
}
