//! Real-time notification of box changes.
//!
//! Peers learn that a box was filled or emptied through a publish/subscribe channel. The
//! service can publish to Pusher Channels, to an in-process broadcast hub (which backs the
//! Server-Sent Events endpoint), or to both.

mod pusher;

pub use pusher::{signed_query, PusherNotifier};

use crate::{BoxError, BoxResult};
use async_trait::async_trait;
use pvfll_types::BoxNumber;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Buffered events per subscriber before slow subscribers start lagging.
const BROADCAST_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FileUploaded,
    FileDeleted,
}

impl EventKind {
    /// Event name on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::FileUploaded => "file-uploaded",
            EventKind::FileDeleted => "file-deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = BoxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file-uploaded" => Ok(EventKind::FileUploaded),
            "file-deleted" => Ok(EventKind::FileDeleted),
            other => Err(BoxError::InvalidInput(format!("unknown event type: {other}"))),
        }
    }
}

/// A change to one box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GardenEvent {
    pub kind: EventKind,
    pub box_number: BoxNumber,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct EventPayload<'a> {
    box_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_size: Option<u64>,
}

impl GardenEvent {
    pub fn uploaded(box_number: BoxNumber, file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            kind: EventKind::FileUploaded,
            box_number,
            file_name: Some(file_name.into()),
            file_size: Some(file_size),
        }
    }

    pub fn deleted(box_number: BoxNumber, file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            kind: EventKind::FileDeleted,
            box_number,
            file_name: Some(file_name.into()),
            file_size: Some(file_size),
        }
    }

    /// JSON payload peers receive. The box number is sent as a string.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!(EventPayload {
            box_number: self.box_number.to_string(),
            file_name: self.file_name.as_deref(),
            file_size: self.file_size,
        })
    }
}

/// Somewhere garden events can be published.
#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    async fn publish(&self, channel: &str, event: &GardenEvent) -> BoxResult<()>;
}

/// An event as seen by a broadcast subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub channel: String,
    pub event: GardenEvent,
}

/// In-process fan-out to every current subscriber.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Published>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn publish(&self, channel: &str, event: &GardenEvent) -> BoxResult<()> {
        let published = Published {
            channel: channel.to_owned(),
            event: event.clone(),
        };
        // No subscribers is fine: nobody is watching the garden right now.
        let receivers = self.tx.send(published).unwrap_or(0);
        tracing::debug!(kind = %event.kind, box_number = %event.box_number, receivers, "event broadcast");
        Ok(())
    }
}

/// Publishes to every inner notifier, even when an earlier one fails.
#[derive(Debug, Clone, Default)]
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn publish(&self, channel: &str, event: &GardenEvent) -> BoxResult<()> {
        let results =
            futures::future::join_all(self.targets.iter().map(|t| t.publish(channel, event)))
                .await;

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                tracing::warn!(error = %e, kind = %event.kind, "notifier failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxn(n: u8) -> BoxNumber {
        BoxNumber::new(n).unwrap()
    }

    #[derive(Debug)]
    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn publish(&self, _channel: &str, _event: &GardenEvent) -> BoxResult<()> {
            Err(BoxError::Notify("down".into()))
        }
    }

    #[test]
    fn payload_shape() {
        let event = GardenEvent::deleted(boxn(3), "a.txt", 12);
        assert_eq!(
            event.payload(),
            serde_json::json!({"boxNumber": "3", "fileName": "a.txt", "fileSize": 12})
        );

        let bare = GardenEvent {
            kind: EventKind::FileUploaded,
            box_number: boxn(1),
            file_name: None,
            file_size: None,
        };
        assert_eq!(bare.payload(), serde_json::json!({"boxNumber": "1"}));
    }

    #[test]
    fn event_kind_names() {
        assert_eq!("file-uploaded".parse::<EventKind>().unwrap(), EventKind::FileUploaded);
        assert_eq!(EventKind::FileDeleted.to_string(), "file-deleted");
        assert!("file-moved".parse::<EventKind>().is_err());
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_ok() {
        let hub = BroadcastNotifier::new();
        hub.publish("garden", &GardenEvent::uploaded(boxn(1), "a", 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let hub = BroadcastNotifier::new();
        let mut rx = hub.subscribe();
        let event = GardenEvent::uploaded(boxn(2), "b", 2);
        hub.publish("garden", &event).await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.channel, "garden");
        assert_eq!(got.event, event);
    }

    #[tokio::test]
    async fn fanout_publishes_everywhere_and_reports_failure() {
        let hub = BroadcastNotifier::new();
        let mut rx = hub.subscribe();
        let fanout = FanoutNotifier::new(vec![
            Arc::new(Failing) as Arc<dyn Notifier>,
            Arc::new(hub.clone()) as Arc<dyn Notifier>,
        ]);

        let err = fanout
            .publish("garden", &GardenEvent::deleted(boxn(4), "c", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, BoxError::Notify(_)));
        // The hub still got the event despite the failing sibling.
        assert_eq!(rx.recv().await.unwrap().event.box_number, boxn(4));
    }
}
