//! # pvfll Core
//!
//! Core logic for the pvfll garden: four numbered boxes, each holding at most one file.
//!
//! This crate contains the storage and notification operations:
//! - box status, uploads and presigned URLs over an object store
//! - the download-then-delete-then-notify delivery sequence
//! - publishing garden events to Pusher and to in-process subscribers
//! - device heartbeats
//!
//! **No API concerns**: HTTP routing, request parsing and status codes belong in `api-rest`.

pub mod config;
pub mod constants;
pub mod delivery;
pub mod devices;
mod error;
pub mod notify;
pub mod store;

pub use config::{CoreConfig, PusherConfig, StoreConfig};
pub use delivery::{Delivery, DeliveryStream};
pub use devices::{DeviceHealth, DeviceRegistry, Heartbeat};
pub use error::{BoxError, BoxResult};
pub use notify::{
    BroadcastNotifier, EventKind, FanoutNotifier, GardenEvent, Notifier, Published, PusherNotifier,
};
pub use store::{BoxStatus, BoxStore, PresignedRequest, StoredFile};

pub use pvfll_types::{BoxNumber, DeviceId, FileName, TypesError, BOX_COUNT};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Format a byte count the way the garden shows it: `512 B`, `1.5 KB`, `12.0 MB`.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;

    if bytes < KB {
        format!("{bytes} B")
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    }
}

/// The garden: every box operation, wired to one store and one notifier.
///
/// Cheap to clone; all state lives in the object store.
#[derive(Clone, Debug)]
pub struct Garden {
    cfg: Arc<CoreConfig>,
    store: BoxStore,
    notifier: Arc<dyn Notifier>,
    delivery: Delivery,
    devices: DeviceRegistry,
}

impl Garden {
    pub fn new(cfg: Arc<CoreConfig>, store: BoxStore, notifier: Arc<dyn Notifier>) -> Self {
        let delivery = Delivery::new(
            store.clone(),
            notifier.clone(),
            cfg.channel(),
            cfg.delivery_timeout(),
        );
        let devices = DeviceRegistry::new(store.clone());

        Self {
            cfg,
            store,
            notifier,
            delivery,
            devices,
        }
    }

    /// Build the garden described by `cfg`.
    ///
    /// Events always go to `hub`; when Pusher credentials are configured they are also
    /// forwarded to Pusher.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured object store cannot be built.
    pub fn from_config(cfg: Arc<CoreConfig>, hub: BroadcastNotifier) -> BoxResult<Self> {
        let store = BoxStore::from_config(&cfg)?;

        let mut targets: Vec<Arc<dyn Notifier>> = vec![Arc::new(hub)];
        if let Some(pusher) = cfg.pusher() {
            tracing::info!(app_id = %pusher.app_id, cluster = %pusher.cluster, "forwarding events to pusher");
            targets.push(Arc::new(PusherNotifier::new(pusher.clone())));
        }
        let notifier: Arc<dyn Notifier> = Arc::new(FanoutNotifier::new(targets));

        Ok(Self::new(cfg, store, notifier))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    pub fn store(&self) -> &BoxStore {
        &self.store
    }

    pub async fn status(&self, box_number: BoxNumber) -> BoxResult<BoxStatus> {
        self.store.status(box_number).await
    }

    pub async fn garden(&self) -> BoxResult<Vec<(BoxNumber, BoxStatus)>> {
        self.store.garden().await
    }

    pub async fn presign_upload(
        &self,
        box_number: BoxNumber,
        file_name: &FileName,
        content_type: &str,
    ) -> BoxResult<PresignedRequest> {
        self.store
            .presign_upload(box_number, file_name, content_type)
            .await
    }

    pub async fn presign_download(
        &self,
        box_number: BoxNumber,
        file_name: &FileName,
    ) -> BoxResult<PresignedRequest> {
        self.store.presign_download(box_number, file_name).await
    }

    /// Store a file in an empty box and tell peers about it.
    ///
    /// A failed notification is logged; the file stays stored either way.
    pub async fn offer(
        &self,
        box_number: BoxNumber,
        file_name: &FileName,
        content_type: Option<&str>,
        body: Bytes,
    ) -> BoxResult<StoredFile> {
        let stored = self
            .store
            .upload(box_number, file_name, content_type, body)
            .await?;

        let event = GardenEvent::uploaded(box_number, stored.name.as_str(), stored.size);
        if let Err(e) = self.publish(&event).await {
            tracing::warn!(box_number = %box_number, error = %e, "file stored but peers not notified");
        }

        Ok(stored)
    }

    /// Start handing the file in a box to a receiver. See [`delivery`].
    pub async fn receive(
        &self,
        box_number: BoxNumber,
        file_name: &FileName,
    ) -> BoxResult<DeliveryStream> {
        self.delivery.receive(box_number, file_name).await
    }

    /// Empty a box after its file was delivered out of band.
    pub async fn discard(
        &self,
        box_number: BoxNumber,
        file_name: &FileName,
        size: u64,
    ) -> BoxResult<()> {
        self.delivery.discard(box_number, file_name, size).await
    }

    /// Publish an event on the configured channel, bounded by the delivery timeout.
    pub async fn publish(&self, event: &GardenEvent) -> BoxResult<()> {
        let timeout = self.cfg.delivery_timeout();
        tokio::time::timeout(timeout, self.notifier.publish(self.cfg.channel(), event))
            .await
            .map_err(|_| BoxError::Timeout {
                step: "notify",
                after: timeout,
            })?
    }

    pub async fn record_heartbeat(&self, heartbeat: &Heartbeat) -> BoxResult<()> {
        self.devices.record(heartbeat).await
    }

    pub async fn devices(&self, now: DateTime<Utc>) -> BoxResult<Vec<DeviceHealth>> {
        self.devices.list(now).await
    }
}
