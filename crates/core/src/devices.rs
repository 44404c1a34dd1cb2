//! Device heartbeats.
//!
//! Devices sitting next to the boxes report whether they are connected. Each device owns one
//! JSON document under `device-health/`; a report overwrites the previous one.

use crate::constants::{DEVICE_HEALTH_PREFIX, DEVICE_HEALTH_SUFFIX, DEVICE_STALE_THRESHOLD};
use crate::store::{collect, list_files, object_name, BoxStore};
use crate::{BoxError, BoxResult};
use chrono::{DateTime, Utc};
use object_store::path::Path;
use object_store::{Attribute, Attributes, ObjectMeta, ObjectStore, PutOptions, PutPayload};
use pvfll_types::DeviceId;

/// A device's most recent report, exactly as stored.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub device_id: DeviceId,
    pub connected: bool,
    pub timestamp: DateTime<Utc>,
}

/// A heartbeat as seen from `now`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHealth {
    pub device_id: DeviceId,
    pub connected: bool,
    pub timestamp: DateTime<Utc>,
    pub stale: bool,
    pub last_seen: String,
}

impl DeviceHealth {
    pub fn from_heartbeat(heartbeat: Heartbeat, now: DateTime<Utc>) -> Self {
        let age = now.signed_duration_since(heartbeat.timestamp);
        let threshold = chrono::Duration::from_std(DEVICE_STALE_THRESHOLD)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));

        Self {
            stale: age > threshold,
            last_seen: relative_time(age),
            device_id: heartbeat.device_id,
            connected: heartbeat.connected,
            timestamp: heartbeat.timestamp,
        }
    }

    /// Label shown to operators: `Stale`, `Connected` or `Disconnected`.
    pub fn state_label(&self) -> &'static str {
        if self.stale {
            "Stale"
        } else if self.connected {
            "Connected"
        } else {
            "Disconnected"
        }
    }
}

/// Human label for how long ago something happened: `42s ago`, `5m ago`, `3h ago`, `2d ago`.
///
/// Negative ages (clock skew between device and server) read as `0s ago`.
pub fn relative_time(age: chrono::Duration) -> String {
    let seconds = age.num_seconds().max(0);
    if seconds < 60 {
        return format!("{seconds}s ago");
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{minutes}m ago");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours}h ago");
    }
    format!("{}d ago", hours / 24)
}

fn heartbeat_path(device_id: &DeviceId) -> Path {
    Path::from_iter([
        DEVICE_HEALTH_PREFIX.to_owned(),
        format!("{}{}", device_id, DEVICE_HEALTH_SUFFIX),
    ])
}

/// Heartbeat storage on top of the box store's object store.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    store: BoxStore,
}

impl DeviceRegistry {
    pub fn new(store: BoxStore) -> Self {
        Self { store }
    }

    /// Store `heartbeat`, replacing the device's previous report.
    pub async fn record(&self, heartbeat: &Heartbeat) -> BoxResult<()> {
        let body = serde_json::to_vec(heartbeat).map_err(BoxError::Serialization)?;
        let location = heartbeat_path(&heartbeat.device_id);

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, "application/json".into());
        let opts = PutOptions {
            attributes,
            ..Default::default()
        };

        let objects = self.store.objects();
        match objects
            .put_opts(&location, PutPayload::from(body.clone()), opts)
            .await
        {
            Ok(_) => {}
            // Backends without attribute support (local disk) still take the document.
            Err(object_store::Error::NotImplemented) => {
                objects.put(&location, PutPayload::from(body)).await?;
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(device_id = %heartbeat.device_id, connected = heartbeat.connected, "device health stored");
        Ok(())
    }

    /// Every reported device, sorted by id.
    ///
    /// Documents that cannot be read or parsed are logged and skipped rather than failing the
    /// whole listing.
    pub async fn list(&self, now: DateTime<Utc>) -> BoxResult<Vec<DeviceHealth>> {
        let objects = self.store.objects();
        let prefix = Path::from(DEVICE_HEALTH_PREFIX);
        let documents: Vec<ObjectMeta> = list_files(objects.as_ref(), &prefix)
            .await?
            .into_iter()
            .filter(|meta| object_name(&meta.location).ends_with(DEVICE_HEALTH_SUFFIX))
            .collect();

        let results = futures::future::join_all(
            documents
                .iter()
                .map(|meta| read_heartbeat(objects.as_ref(), &meta.location)),
        )
        .await;

        let mut devices = Vec::new();
        for (meta, result) in documents.iter().zip(results) {
            match result {
                Ok(heartbeat) => devices.push(DeviceHealth::from_heartbeat(heartbeat, now)),
                Err(e) => {
                    tracing::warn!(key = %meta.location, error = %e, "skipping unreadable device health")
                }
            }
        }

        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }
}

async fn read_heartbeat(objects: &dyn ObjectStore, location: &Path) -> BoxResult<Heartbeat> {
    let result = objects.get(location).await?;
    let bytes = collect(result.into_stream()).await?;
    serde_json::from_slice(&bytes).map_err(BoxError::Deserialization)
}
