//! Constants used throughout the pvfll core crate.
//!
//! Object key prefixes and the defaults applied when the environment does not override them.

use std::time::Duration;

/// Prefix under which device heartbeat documents are stored.
pub const DEVICE_HEALTH_PREFIX: &str = "device-health";

/// Suffix of a device heartbeat document.
pub const DEVICE_HEALTH_SUFFIX: &str = ".json";

/// A device that has not reported for longer than this is considered stale.
pub const DEVICE_STALE_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// Default publish/subscribe channel every client listens on.
pub const DEFAULT_CHANNEL: &str = "garden";

/// Default upper bound for a single file: 100 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Default lifetime of a presigned URL.
pub const DEFAULT_PRESIGN_EXPIRY: Duration = Duration::from_secs(120);

/// S3 refuses presigned URLs valid for longer than seven days.
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default timeout wrapping each of the delete and notify steps after a delivery.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Media type used when neither the client nor content sniffing provides one.
pub const FALLBACK_MEDIA_TYPE: &str = "application/octet-stream";
