use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderValue;
use docconv_core::upload::{UploadPolicy, DEFAULT_ALLOWED_CONTENT_TYPES};
use docconv_worker::EngineConfig;

/// A setting that could not be parsed or is out of range.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Log output format selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development. Values are
/// validated once here; nothing downstream re-parses the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8080`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Root directory of job storage (default: `./data`).
    pub data_dir: PathBuf,
    pub workers: usize,
    pub execution_slots: usize,
    pub job_timeout_secs: u64,
    pub cancel_grace_secs: u64,
    pub max_upload_mb: u64,
    pub allowed_mime: Vec<String>,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            cors_origins: vec!["http://localhost:8501".into()],
            request_timeout_secs: 30,
            data_dir: PathBuf::from("./data"),
            workers: 4,
            execution_slots: 4,
            job_timeout_secs: 1800,
            cancel_grace_secs: 5,
            max_upload_mb: 300,
            allowed_mime: DEFAULT_ALLOWED_CONTENT_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            log_format: LogFormat::Text,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `8080`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:8501`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `DATA_DIR`             | `./data`                   |
    /// | `WORKERS`              | `4`                        |
    /// | `EXECUTION_SLOTS`      | value of `WORKERS`         |
    /// | `JOB_TIMEOUT_SEC`      | `1800`                     |
    /// | `CANCEL_GRACE_SECS`    | `5`                        |
    /// | `MAX_UPLOAD_MB`        | `300`                      |
    /// | `ALLOWED_MIME`         | PDF and Office types       |
    /// | `LOG_FORMAT`           | `text`                     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = var("HOST").unwrap_or(defaults.host);
        let port = parse_or(&var, "PORT", "a valid port", defaults.port)?;

        let cors_origins = match var("CORS_ORIGINS") {
            Some(raw) => split_list(&raw),
            None => defaults.cors_origins,
        };
        if let Some(bad) = cors_origins
            .iter()
            .find(|o| HeaderValue::from_str(o).is_err())
        {
            return Err(ConfigError::Invalid {
                var: "CORS_ORIGINS",
                expected: "a list of valid origins",
                value: bad.clone(),
            });
        }

        let request_timeout_secs = positive(
            &var,
            "REQUEST_TIMEOUT_SECS",
            defaults.request_timeout_secs,
        )?;
        let data_dir = var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir);

        let workers = positive(&var, "WORKERS", defaults.workers)?;
        let execution_slots = positive(&var, "EXECUTION_SLOTS", workers)?;
        let job_timeout_secs = positive(&var, "JOB_TIMEOUT_SEC", defaults.job_timeout_secs)?;
        let cancel_grace_secs = parse_or(
            &var,
            "CANCEL_GRACE_SECS",
            "a non-negative integer",
            defaults.cancel_grace_secs,
        )?;
        let max_upload_mb = positive(&var, "MAX_UPLOAD_MB", defaults.max_upload_mb)?;

        let allowed_mime = match var("ALLOWED_MIME") {
            Some(raw) => split_list(&raw),
            None => defaults.allowed_mime,
        };
        if allowed_mime.is_empty() {
            return Err(ConfigError::Empty("ALLOWED_MIME"));
        }

        let log_format = match var("LOG_FORMAT").as_deref().map(str::to_ascii_lowercase) {
            None => defaults.log_format,
            Some(f) if f == "text" => LogFormat::Text,
            Some(f) if f == "json" => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "LOG_FORMAT",
                    expected: "'text' or 'json'",
                    value: other,
                })
            }
        };

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            data_dir,
            workers,
            execution_slots,
            job_timeout_secs,
            cancel_grace_secs,
            max_upload_mb,
            allowed_mime,
            log_format,
        })
    }

    /// Upload limit in bytes.
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    /// Engine settings derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            workers: self.workers,
            execution_slots: self.execution_slots,
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            cancel_grace: Duration::from_secs(self.cancel_grace_secs),
            upload: UploadPolicy::new(self.max_upload_bytes(), self.allowed_mime.clone()),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_or<T, V>(
    var: &V,
    key: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            var: key,
            expected,
            value: raw,
        }),
    }
}

/// Parse an integer setting that must be at least 1.
fn positive<T, V>(var: &V, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + From<u8> + ToString,
    V: Fn(&str) -> Option<String>,
{
    let value = parse_or(var, key, "a positive integer", default)?;
    if value < T::from(1) {
        return Err(ConfigError::Invalid {
            var: key,
            expected: "a positive integer",
            value: value.to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.workers, 4);
        assert_eq!(config.execution_slots, 4);
        assert_eq!(config.max_upload_bytes(), 300 * 1024 * 1024);
        assert_eq!(config.cors_origins, vec!["http://localhost:8501"]);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.allowed_mime.len(), DEFAULT_ALLOWED_CONTENT_TYPES.len());
    }

    #[test]
    fn execution_slots_follow_workers() {
        let config = load(&[("WORKERS", "2")]).unwrap();
        assert_eq!(config.execution_slots, 2);

        let config = load(&[("WORKERS", "2"), ("EXECUTION_SLOTS", "1")]).unwrap();
        assert_eq!(config.execution_slots, 1);
    }

    #[test]
    fn lists_are_trimmed() {
        let config = load(&[
            ("CORS_ORIGINS", "http://a.test, http://b.test ,"),
            ("ALLOWED_MIME", "application/pdf , text/plain"),
        ])
        .unwrap();
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert_eq!(config.allowed_mime, vec!["application/pdf", "text/plain"]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_matches!(
            load(&[("WORKERS", "0")]),
            Err(ConfigError::Invalid { var: "WORKERS", .. })
        );
        assert_matches!(
            load(&[("PORT", "http")]),
            Err(ConfigError::Invalid { var: "PORT", .. })
        );
        assert_matches!(
            load(&[("JOB_TIMEOUT_SEC", "-5")]),
            Err(ConfigError::Invalid { var: "JOB_TIMEOUT_SEC", .. })
        );
        assert_matches!(
            load(&[("LOG_FORMAT", "xml")]),
            Err(ConfigError::Invalid { var: "LOG_FORMAT", .. })
        );
        assert_matches!(load(&[("ALLOWED_MIME", " , ")]), Err(ConfigError::Empty(_)));
        assert_matches!(
            load(&[("CORS_ORIGINS", "http://ok.test,bad\norigin")]),
            Err(ConfigError::Invalid { var: "CORS_ORIGINS", .. })
        );
    }

    #[test]
    fn engine_config_carries_limits() {
        let config = load(&[("MAX_UPLOAD_MB", "2"), ("JOB_TIMEOUT_SEC", "60")]).unwrap();
        let engine = config.engine_config();
        assert_eq!(engine.upload.max_bytes(), 2 * 1024 * 1024);
        assert_eq!(engine.job_timeout, Duration::from_secs(60));
        assert_eq!(engine.cancel_grace, Duration::from_secs(5));
    }
}
