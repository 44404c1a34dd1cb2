//! Core runtime configuration.
//!
//! This module defines configuration that should be resolved once at process startup and then
//! passed into core services. Request handlers never read environment variables; they only see
//! the `CoreConfig` built here.

use crate::constants::{
    DEFAULT_CHANNEL, DEFAULT_DELIVERY_TIMEOUT, DEFAULT_MAX_FILE_SIZE, DEFAULT_PRESIGN_EXPIRY,
    MAX_PRESIGN_EXPIRY,
};
use crate::{BoxError, BoxResult};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where box contents and device heartbeats are stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreConfig {
    /// An S3 bucket. Region and credentials come from the standard `AWS_*` variables.
    S3 {
        bucket: String,
        region: Option<String>,
    },
    /// A directory on the local filesystem. It must already exist.
    Local { root: PathBuf },
    /// Process memory; everything is lost on exit.
    Memory,
}

/// Credentials for the Pusher Channels HTTP API.
#[derive(Clone, PartialEq, Eq)]
pub struct PusherConfig {
    pub app_id: String,
    pub key: String,
    pub secret: String,
    pub cluster: String,
}

impl PusherConfig {
    /// API host for this cluster, e.g. `api-eu.pusher.com`.
    pub fn host(&self) -> String {
        format!("api-{}.pusher.com", self.cluster)
    }
}

impl std::fmt::Debug for PusherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PusherConfig")
            .field("app_id", &self.app_id)
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .field("cluster", &self.cluster)
            .finish()
    }
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    store: StoreConfig,
    channel: String,
    max_file_size: u64,
    presign_expiry: Duration,
    delivery_timeout: Duration,
    pusher: Option<PusherConfig>,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`BoxError::Config`] if:
    /// - `channel` is empty,
    /// - `max_file_size` or `delivery_timeout` is zero,
    /// - `presign_expiry` is zero or longer than seven days.
    pub fn new(
        store: StoreConfig,
        channel: String,
        max_file_size: u64,
        presign_expiry: Duration,
        delivery_timeout: Duration,
        pusher: Option<PusherConfig>,
    ) -> BoxResult<Self> {
        if channel.trim().is_empty() {
            return Err(BoxError::Config("channel cannot be empty".into()));
        }
        if max_file_size == 0 {
            return Err(BoxError::Config("max file size must be positive".into()));
        }
        if presign_expiry.is_zero() || presign_expiry > MAX_PRESIGN_EXPIRY {
            return Err(BoxError::Config(format!(
                "presign expiry must be between 1s and {}s",
                MAX_PRESIGN_EXPIRY.as_secs()
            )));
        }
        if delivery_timeout.is_zero() {
            return Err(BoxError::Config("delivery timeout must be positive".into()));
        }

        Ok(Self {
            store,
            channel: channel.trim().to_owned(),
            max_file_size,
            presign_expiry,
            delivery_timeout,
            pusher,
        })
    }

    /// In-memory configuration with every default applied. Used by tests and demos.
    pub fn in_memory() -> Self {
        Self {
            store: StoreConfig::Memory,
            channel: DEFAULT_CHANNEL.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            presign_expiry: DEFAULT_PRESIGN_EXPIRY,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            pusher: None,
        }
    }

    /// Resolve configuration from the process environment.
    pub fn from_env() -> BoxResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary variable lookup.
    ///
    /// Empty or whitespace-only values are treated as unset.
    ///
    /// # Errors
    ///
    /// Returns [`BoxError::Config`] if:
    /// - `PVFLL_STORE_BACKEND` names an unknown backend,
    /// - the S3 backend is selected without `AWS_BUCKET_NAME`,
    /// - the local backend is selected without an existing `PVFLL_DATA_DIR`,
    /// - a numeric variable does not parse,
    /// - only some of the `PUSHER_*` variables are set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BoxResult<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        let backend = get("PVFLL_STORE_BACKEND").unwrap_or_else(|| "s3".into());
        let store = match backend.to_ascii_lowercase().as_str() {
            "s3" => StoreConfig::S3 {
                bucket: get("AWS_BUCKET_NAME")
                    .ok_or_else(|| BoxError::Config("AWS bucket configuration missing".into()))?,
                region: get("AWS_REGION"),
            },
            "local" => {
                let root = get("PVFLL_DATA_DIR").map(PathBuf::from).ok_or_else(|| {
                    BoxError::Config("PVFLL_DATA_DIR is required for the local backend".into())
                })?;
                if !root.is_dir() {
                    return Err(BoxError::Config(format!(
                        "data directory does not exist: {}",
                        root.display()
                    )));
                }
                StoreConfig::Local { root }
            }
            "memory" => StoreConfig::Memory,
            other => {
                return Err(BoxError::Config(format!(
                    "unknown store backend '{other}' (expected s3, local or memory)"
                )))
            }
        };

        let channel = get("PVFLL_CHANNEL").unwrap_or_else(|| DEFAULT_CHANNEL.into());
        let max_file_size =
            parse_or("PVFLL_MAX_FILE_SIZE", get("PVFLL_MAX_FILE_SIZE"), DEFAULT_MAX_FILE_SIZE)?;
        let presign_expiry = parse_or(
            "PVFLL_PRESIGN_EXPIRY_SECS",
            get("PVFLL_PRESIGN_EXPIRY_SECS"),
            DEFAULT_PRESIGN_EXPIRY.as_secs(),
        )?;
        let delivery_timeout = parse_or(
            "PVFLL_DELIVERY_TIMEOUT_SECS",
            get("PVFLL_DELIVERY_TIMEOUT_SECS"),
            DEFAULT_DELIVERY_TIMEOUT.as_secs(),
        )?;

        let pusher = pusher_from_values(
            get("PUSHER_APP_ID"),
            get("PUSHER_KEY"),
            get("PUSHER_SECRET"),
            get("PUSHER_CLUSTER"),
        )?;

        Self::new(
            store,
            channel,
            max_file_size,
            Duration::from_secs(presign_expiry),
            Duration::from_secs(delivery_timeout),
            pusher,
        )
    }

    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn presign_expiry(&self) -> Duration {
        self.presign_expiry
    }

    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }

    pub fn pusher(&self) -> Option<&PusherConfig> {
        self.pusher.as_ref()
    }
}

fn parse_or<T: FromStr>(name: &str, value: Option<String>, default: T) -> BoxResult<T> {
    match value {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| BoxError::Config(format!("{name} is not a valid number: {v}"))),
    }
}

/// Pusher forwarding is all-or-nothing: either every credential is present or none is.
fn pusher_from_values(
    app_id: Option<String>,
    key: Option<String>,
    secret: Option<String>,
    cluster: Option<String>,
) -> BoxResult<Option<PusherConfig>> {
    match (app_id, key, secret, cluster) {
        (Some(app_id), Some(key), Some(secret), Some(cluster)) => Ok(Some(PusherConfig {
            app_id,
            key,
            secret,
            cluster,
        })),
        (None, None, None, None) => Ok(None),
        _ => Err(BoxError::Config(
            "PUSHER_APP_ID, PUSHER_KEY, PUSHER_SECRET and PUSHER_CLUSTER must be set together"
                .into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn s3_requires_bucket() {
        let err = CoreConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("AWS bucket configuration missing"));
    }

    #[test]
    fn s3_defaults() {
        let cfg = CoreConfig::from_lookup(lookup(&[
            ("AWS_BUCKET_NAME", "pvfll"),
            ("AWS_REGION", "eu-west-2"),
        ]))
        .unwrap();

        assert_eq!(
            cfg.store(),
            &StoreConfig::S3 {
                bucket: "pvfll".into(),
                region: Some("eu-west-2".into()),
            }
        );
        assert_eq!(cfg.channel(), "garden");
        assert_eq!(cfg.max_file_size(), 104_857_600);
        assert_eq!(cfg.presign_expiry(), Duration::from_secs(120));
        assert_eq!(cfg.delivery_timeout(), Duration::from_secs(10));
        assert!(cfg.pusher().is_none());
    }

    #[test]
    fn local_backend_needs_existing_dir() {
        let err = CoreConfig::from_lookup(lookup(&[
            ("PVFLL_STORE_BACKEND", "local"),
            ("PVFLL_DATA_DIR", "/definitely/not/here"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BoxError::Config(_)));

        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp.path().to_string_lossy().to_string();
        let cfg = CoreConfig::from_lookup(lookup(&[
            ("PVFLL_STORE_BACKEND", "local"),
            ("PVFLL_DATA_DIR", &dir),
        ]))
        .unwrap();
        assert_eq!(
            cfg.store(),
            &StoreConfig::Local {
                root: temp.path().to_path_buf()
            }
        );
    }

    #[test]
    fn unknown_backend_rejected() {
        let err =
            CoreConfig::from_lookup(lookup(&[("PVFLL_STORE_BACKEND", "ftp")])).unwrap_err();
        assert!(err.to_string().contains("unknown store backend"));
    }

    #[test]
    fn numeric_overrides() {
        let cfg = CoreConfig::from_lookup(lookup(&[
            ("PVFLL_STORE_BACKEND", "memory"),
            ("PVFLL_MAX_FILE_SIZE", "1024"),
            ("PVFLL_PRESIGN_EXPIRY_SECS", "60"),
            ("PVFLL_DELIVERY_TIMEOUT_SECS", "3"),
            ("PVFLL_CHANNEL", " boxes "),
        ]))
        .unwrap();
        assert_eq!(cfg.max_file_size(), 1024);
        assert_eq!(cfg.presign_expiry(), Duration::from_secs(60));
        assert_eq!(cfg.delivery_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.channel(), "boxes");

        let err = CoreConfig::from_lookup(lookup(&[
            ("PVFLL_STORE_BACKEND", "memory"),
            ("PVFLL_DELIVERY_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("PVFLL_DELIVERY_TIMEOUT_SECS"));
    }

    #[test]
    fn zero_and_out_of_range_values_rejected() {
        for (key, value) in [
            ("PVFLL_MAX_FILE_SIZE", "0"),
            ("PVFLL_DELIVERY_TIMEOUT_SECS", "0"),
            ("PVFLL_PRESIGN_EXPIRY_SECS", "0"),
            ("PVFLL_PRESIGN_EXPIRY_SECS", "604801"),
        ] {
            let result =
                CoreConfig::from_lookup(lookup(&[("PVFLL_STORE_BACKEND", "memory"), (key, value)]));
            assert!(result.is_err(), "{key}={value} should be rejected");
        }
    }

    #[test]
    fn pusher_all_or_nothing() {
        let cfg = CoreConfig::from_lookup(lookup(&[
            ("PVFLL_STORE_BACKEND", "memory"),
            ("PUSHER_APP_ID", "1"),
            ("PUSHER_KEY", "k"),
            ("PUSHER_SECRET", "s"),
            ("PUSHER_CLUSTER", "eu"),
        ]))
        .unwrap();
        let pusher = cfg.pusher().unwrap();
        assert_eq!(pusher.host(), "api-eu.pusher.com");
        assert!(!format!("{pusher:?}").contains("\"s\""));

        let err = CoreConfig::from_lookup(lookup(&[
            ("PVFLL_STORE_BACKEND", "memory"),
            ("PUSHER_KEY", "k"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BoxError::Config(_)));
    }
}
