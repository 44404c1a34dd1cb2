//! Pusher Channels publisher.
//!
//! Events are triggered through the Channels HTTP API. Every request is authenticated with
//! query parameters: `auth_key`, `auth_timestamp`, `auth_version`, the MD5 of the body, and an
//! HMAC-SHA256 signature over the method, path and sorted query string.

use super::{GardenEvent, Notifier};
use crate::config::PusherConfig;
use crate::{BoxError, BoxResult};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;

const AUTH_VERSION: &str = "1.0";

#[derive(serde::Serialize)]
struct TriggerBody<'a> {
    name: &'a str,
    channels: [&'a str; 1],
    /// Pusher expects the event data as a JSON-encoded string.
    data: String,
}

#[derive(Debug, Clone)]
pub struct PusherNotifier {
    client: reqwest::Client,
    config: PusherConfig,
}

impl PusherNotifier {
    pub fn new(config: PusherConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn events_path(&self) -> String {
        format!("/apps/{}/events", self.config.app_id)
    }
}

#[async_trait]
impl Notifier for PusherNotifier {
    async fn publish(&self, channel: &str, event: &GardenEvent) -> BoxResult<()> {
        let body = serde_json::to_vec(&TriggerBody {
            name: event.kind.as_str(),
            channels: [channel],
            data: event.payload().to_string(),
        })
        .map_err(BoxError::Serialization)?;

        let path = self.events_path();
        let query = signed_query(
            &self.config,
            "POST",
            &path,
            &body,
            chrono::Utc::now().timestamp(),
        )?;
        let url = format!("https://{}{}?{}", self.config.host(), path, query);

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BoxError::Notify(format!(
                "pusher answered {status}: {}",
                detail.trim()
            )));
        }

        tracing::debug!(kind = %event.kind, channel, "event sent to pusher");
        Ok(())
    }
}

/// Build the authenticated query string for a Pusher HTTP API request.
///
/// The parameters are emitted in lexicographic key order, which is also the order the
/// signature is computed over.
///
/// # Errors
///
/// Returns `BoxError::Notify` if the secret cannot key the HMAC.
pub fn signed_query(
    config: &PusherConfig,
    method: &str,
    path: &str,
    body: &[u8],
    timestamp: i64,
) -> BoxResult<String> {
    let body_md5 = hex::encode(Md5::digest(body));
    let params = format!(
        "auth_key={}&auth_timestamp={}&auth_version={}&body_md5={}",
        config.key, timestamp, AUTH_VERSION, body_md5
    );

    let to_sign = format!("{method}\n{path}\n{params}");
    let mut mac = Hmac::<Sha256>::new_from_slice(config.secret.as_bytes())
        .map_err(|e| BoxError::Notify(format!("invalid pusher secret: {e}")))?;
    mac.update(to_sign.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    Ok(format!("{params}&auth_signature={signature}"))
}
