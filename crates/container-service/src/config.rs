// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for container-service.

use std::time::Duration;

use crate::backend::{BackendKind, KubernetesConfig};
use crate::queue::ConcurrencySettings;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL for records, queue and settings
    pub database_url: String,
    /// Backend selected at startup
    pub backend: BackendKind,
    /// Kubernetes API server override (in-cluster address otherwise)
    pub kubernetes_api: Option<String>,
    /// Kubernetes namespace override (service-account namespace otherwise)
    pub kubernetes_namespace: Option<String>,
    /// Reconciliation loop period
    pub reconcile_interval: Duration,
    /// How often consumer concurrency is re-read from the settings store
    pub concurrency_refresh_interval: Duration,
    /// Consumer bounds used until the settings store says otherwise
    pub default_concurrency: ConcurrencySettings,
    /// Remove backend jobs once they are finalized
    pub auto_cleanup: bool,
    /// In-flight records older than this are reported as stale
    pub stale_after: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CONTAINER_SERVICE_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| {
                ConfigError::MissingEnvVar("CONTAINER_SERVICE_DATABASE_URL or DATABASE_URL")
            })?;

        let backend = std::env::var("CONTAINER_SERVICE_BACKEND")
            .unwrap_or_else(|_| "docker".to_string())
            .parse::<BackendKind>()
            .map_err(|e| ConfigError::Invalid("CONTAINER_SERVICE_BACKEND", e))?;

        let kubernetes_api = non_empty_var("CONTAINER_SERVICE_K8S_API");
        let kubernetes_namespace = non_empty_var("CONTAINER_SERVICE_K8S_NAMESPACE");

        let reconcile_interval = seconds_var("CONTAINER_SERVICE_RECONCILE_INTERVAL_SECS", 10)?;
        let concurrency_refresh_interval =
            seconds_var("CONTAINER_SERVICE_CONCURRENCY_REFRESH_SECS", 10)?;
        let stale_after = seconds_var("CONTAINER_SERVICE_STALE_AFTER_SECS", 3600)?;

        let default_concurrency = std::env::var("CONTAINER_SERVICE_DEFAULT_CONCURRENCY")
            .unwrap_or_else(|_| "1-10".to_string())
            .parse::<ConcurrencySettings>()
            .map_err(|e| ConfigError::Invalid("CONTAINER_SERVICE_DEFAULT_CONCURRENCY", e))?;

        let auto_cleanup = std::env::var("CONTAINER_SERVICE_AUTO_CLEANUP")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Ok(Self {
            database_url,
            backend,
            kubernetes_api,
            kubernetes_namespace,
            reconcile_interval,
            concurrency_refresh_interval,
            default_concurrency,
            auto_cleanup,
            stale_after,
        })
    }

    /// Kubernetes client settings: in-cluster defaults plus overrides.
    pub fn kubernetes_config(&self) -> KubernetesConfig {
        let mut config = KubernetesConfig::in_cluster();
        if let Some(api) = &self.kubernetes_api {
            config.api_server = api.clone();
        }
        if let Some(namespace) = &self.kubernetes_namespace {
            config.namespace = namespace.clone();
        }
        config
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn seconds_var(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(value) => {
            let secs: u64 = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(key, format!("'{}' is not a number", value)))?;
            if secs == 0 {
                return Err(ConfigError::Invalid(key, "must be positive".to_string()));
            }
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable has an unusable value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 10] = [
        "CONTAINER_SERVICE_DATABASE_URL",
        "DATABASE_URL",
        "CONTAINER_SERVICE_BACKEND",
        "CONTAINER_SERVICE_K8S_API",
        "CONTAINER_SERVICE_K8S_NAMESPACE",
        "CONTAINER_SERVICE_RECONCILE_INTERVAL_SECS",
        "CONTAINER_SERVICE_CONCURRENCY_REFRESH_SECS",
        "CONTAINER_SERVICE_DEFAULT_CONCURRENCY",
        "CONTAINER_SERVICE_AUTO_CLEANUP",
        "CONTAINER_SERVICE_STALE_AFTER_SECS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Start from a clean slate: every service variable unset.
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("DATABASE_URL", "postgres://localhost/cs");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "postgres://localhost/cs");
        assert_eq!(config.backend, BackendKind::Docker);
        assert_eq!(config.reconcile_interval, Duration::from_secs(10));
        assert_eq!(config.concurrency_refresh_interval, Duration::from_secs(10));
        assert_eq!(config.default_concurrency, ConcurrencySettings { min: 1, max: 10 });
        assert!(config.auto_cleanup);
        assert_eq!(config.stale_after, Duration::from_secs(3600));
        assert!(config.kubernetes_api.is_none());
    }

    #[test]
    fn test_service_database_url_takes_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("DATABASE_URL", "postgres://localhost/generic");
        guard.set("CONTAINER_SERVICE_DATABASE_URL", "postgres://localhost/cs");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "postgres://localhost/cs");
    }

    #[test]
    fn test_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("DATABASE_URL", "postgres://localhost/cs");
        guard.set("CONTAINER_SERVICE_BACKEND", "k8s");
        guard.set("CONTAINER_SERVICE_K8S_API", "https://10.0.0.1:6443");
        guard.set("CONTAINER_SERVICE_K8S_NAMESPACE", "jobs");
        guard.set("CONTAINER_SERVICE_RECONCILE_INTERVAL_SECS", "30");
        guard.set("CONTAINER_SERVICE_DEFAULT_CONCURRENCY", "2-4");
        guard.set("CONTAINER_SERVICE_AUTO_CLEANUP", "false");

        let config = Config::from_env().unwrap();
        assert_eq!(config.backend, BackendKind::Kubernetes);
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert_eq!(config.default_concurrency, ConcurrencySettings { min: 2, max: 4 });
        assert!(!config.auto_cleanup);

        let k8s = config.kubernetes_config();
        assert_eq!(k8s.api_server, "https://10.0.0.1:6443");
        assert_eq!(k8s.namespace, "jobs");
    }

    #[test]
    fn test_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("DATABASE_URL", "postgres://localhost/cs");

        guard.set("CONTAINER_SERVICE_BACKEND", "podman");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("CONTAINER_SERVICE_BACKEND", _))
        ));

        guard.set("CONTAINER_SERVICE_BACKEND", "docker");
        guard.set("CONTAINER_SERVICE_RECONCILE_INTERVAL_SECS", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("CONTAINER_SERVICE_RECONCILE_INTERVAL_SECS", _))
        ));

        guard.set("CONTAINER_SERVICE_RECONCILE_INTERVAL_SECS", "10");
        guard.set("CONTAINER_SERVICE_DEFAULT_CONCURRENCY", "5-1");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("CONTAINER_SERVICE_DEFAULT_CONCURRENCY", _))
        ));
    }
}
