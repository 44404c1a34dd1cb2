//! Download-then-delete-then-notify.
//!
//! A box hands its file to exactly one receiver. The file is streamed out of the object
//! store and removed only once every byte has been handed to the HTTP layer; then peers are
//! told the box is empty again.
//!
//! The sequence is best effort:
//!
//! - there is no record of in-flight deliveries, so a crash between the last chunk and the
//!   delete leaves the file in place;
//! - the delete and the notification are each bounded by one static timeout and are never
//!   retried;
//! - a client that disconnects early leaves the file in the box.

use crate::notify::{GardenEvent, Notifier};
use crate::store::BoxStore;
use crate::{BoxError, BoxResult};
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use pvfll_types::{BoxNumber, FileName};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Everything needed to empty a box once its file has gone out.
#[derive(Debug, Clone)]
struct Settlement {
    store: BoxStore,
    notifier: Arc<dyn Notifier>,
    channel: String,
    timeout: Duration,
    box_number: BoxNumber,
    file_name: FileName,
    size: u64,
}

impl Settlement {
    /// Delete the file, then publish `file-deleted`. The event is only published when the
    /// delete went through.
    async fn run(self) -> BoxResult<()> {
        tokio::time::timeout(
            self.timeout,
            self.store.remove(self.box_number, &self.file_name),
        )
        .await
        .map_err(|_| BoxError::Timeout {
            step: "delete",
            after: self.timeout,
        })??;

        tracing::info!(box_number = %self.box_number, file = %self.file_name, "box emptied");

        let event = GardenEvent::deleted(self.box_number, self.file_name.as_str(), self.size);
        tokio::time::timeout(self.timeout, self.notifier.publish(&self.channel, &event))
            .await
            .map_err(|_| BoxError::Timeout {
                step: "notify",
                after: self.timeout,
            })??;

        Ok(())
    }

    fn spawn(self) {
        tokio::spawn(async move {
            let box_number = self.box_number;
            let file_name = self.file_name.clone();
            if let Err(e) = self.run().await {
                match e {
                    BoxError::Timeout { .. } => {
                        tracing::warn!(box_number = %box_number, file = %file_name, error = %e, "settling delivery")
                    }
                    _ => {
                        tracing::error!(box_number = %box_number, file = %file_name, error = %e, "settling delivery")
                    }
                }
            }
        });
    }
}

/// Byte stream of a file being delivered.
///
/// The box is emptied on a background task as soon as `size` bytes have been yielded. HTTP
/// servers stop polling a body once its declared `Content-Length` is written, so the end of
/// the stream is never awaited. An error or an early drop leaves the file where it is.
pub struct DeliveryStream {
    inner: BoxStream<'static, object_store::Result<Bytes>>,
    settlement: Option<Settlement>,
    size: u64,
    sent: u64,
    media_type: Option<String>,
}

impl DeliveryStream {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Spawn the delete once every byte has gone out.
    fn settle_if_complete(&mut self) {
        if self.sent >= self.size {
            if let Some(s) = self.settlement.take() {
                s.spawn();
            }
        }
    }

    /// Content type recorded at upload, if the backend keeps one.
    pub fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }
}

impl std::fmt::Debug for DeliveryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryStream")
            .field("size", &self.size)
            .field("sent", &self.sent)
            .field("pending", &self.settlement.is_some())
            .finish_non_exhaustive()
    }
}

impl Stream for DeliveryStream {
    type Item = BoxResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                this.settle_if_complete();
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(s) = this.settlement.take() {
                    tracing::warn!(box_number = %s.box_number, file = %s.file_name, error = %e, "delivery failed; file kept");
                }
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                this.settle_if_complete();
                if let Some(s) = this.settlement.take() {
                    tracing::warn!(box_number = %s.box_number, file = %s.file_name, sent = this.sent, size = this.size, "delivery ended short; file kept");
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for DeliveryStream {
    fn drop(&mut self) {
        if let Some(s) = &self.settlement {
            tracing::info!(box_number = %s.box_number, file = %s.file_name, "delivery interrupted; file kept");
        }
    }
}

/// Hands box contents to receivers.
#[derive(Debug, Clone)]
pub struct Delivery {
    store: BoxStore,
    notifier: Arc<dyn Notifier>,
    channel: String,
    timeout: Duration,
}

impl Delivery {
    pub fn new(
        store: BoxStore,
        notifier: Arc<dyn Notifier>,
        channel: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            channel: channel.into(),
            timeout,
        }
    }

    /// Start delivering the file in `box_number`.
    ///
    /// # Errors
    ///
    /// Returns `BoxError::NotFound` if the box does not hold `file_name`.
    pub async fn receive(
        &self,
        box_number: BoxNumber,
        file_name: &FileName,
    ) -> BoxResult<DeliveryStream> {
        let opened = self.store.open(box_number, file_name).await?;
        tracing::info!(box_number = %box_number, file = %file_name, size = opened.size, "delivery started");

        Ok(DeliveryStream {
            inner: opened.stream,
            settlement: Some(self.settlement(box_number, file_name, opened.size)),
            size: opened.size,
            sent: 0,
            media_type: opened.media_type,
        })
    }

    /// Empty a box whose file was delivered out of band, and tell peers.
    pub async fn discard(
        &self,
        box_number: BoxNumber,
        file_name: &FileName,
        size: u64,
    ) -> BoxResult<()> {
        self.settlement(box_number, file_name, size).run().await
    }

    fn settlement(&self, box_number: BoxNumber, file_name: &FileName, size: u64) -> Settlement {
        Settlement {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            channel: self.channel.clone(),
            timeout: self.timeout,
            box_number,
            file_name: file_name.clone(),
            size,
        }
    }
}
