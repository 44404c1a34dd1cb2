//! Request and response bodies of the pvfll HTTP API.
//!
//! Field names are camelCase on the wire. Request fields the API reports as "missing" rather
//! than "malformed" are `Option`s, so a client forgetting one gets a 400 with a clear message
//! instead of a generic deserialization rejection.

use pvfll_core::{format_size, BoxNumber, BoxStatus, DeviceHealth, PresignedRequest, StoredFile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

/// `{"error": "..."}` body returned with every non-2xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorRes {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SuccessRes {
    pub success: bool,
}

impl SuccessRes {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// What one box holds: `{"empty": true}` or `{"empty": false, "name": ..., "size": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BoxStatusRes {
    pub empty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl From<BoxStatus> for BoxStatusRes {
    fn from(status: BoxStatus) -> Self {
        match status {
            BoxStatus::Empty => Self {
                empty: true,
                name: None,
                size: None,
            },
            BoxStatus::Occupied { name, size, .. } => Self {
                empty: false,
                name: Some(name),
                size: Some(size),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GardenBox {
    pub box_number: u8,
    pub empty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// One-line summary, e.g. `file in box2: notes.txt (1.5 KB)`.
    pub label: String,
}

impl GardenBox {
    pub fn new(box_number: BoxNumber, status: BoxStatus) -> Self {
        let label = match &status {
            BoxStatus::Empty => format!("box{box_number}: empty"),
            BoxStatus::Occupied { name, size, .. } => {
                format!("file in box{box_number}: {name} ({})", format_size(*size))
            }
        };
        let BoxStatusRes { empty, name, size } = status.into();

        Self {
            box_number: box_number.get(),
            empty,
            name,
            size,
            label,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct GardenRes {
    pub boxes: Vec<GardenBox>,
}

/// Ask for a presigned upload into the box named in the path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PresignUploadReq {
    pub file_name: Option<String>,
    pub file_type: Option<String>,
}

/// Older form of [`PresignUploadReq`] carrying the box number in the body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LegacyPresignReq {
    /// Box number as a JSON number or string.
    #[schema(value_type = Option<u8>)]
    pub box_number: Option<serde_json::Value>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PresignRes {
    pub url: String,
    pub method: String,
    /// Form fields for POST-style uploads; always empty for presigned PUTs.
    pub fields: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub key: String,
    pub expires_in: u64,
}

impl From<PresignedRequest> for PresignRes {
    fn from(req: PresignedRequest) -> Self {
        Self {
            url: req.url,
            method: req.method.to_string(),
            fields: BTreeMap::new(),
            headers: req.headers,
            key: req.key,
            expires_in: req.expires_in.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DownloadUrlRes {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadRes {
    pub key: String,
    pub name: String,
    pub size: u64,
    pub media_type: String,
}

impl From<StoredFile> for UploadRes {
    fn from(file: StoredFile) -> Self {
        Self {
            key: file.key,
            name: file.name.to_string(),
            size: file.size,
            media_type: file.media_type,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEventReq {
    /// `file-uploaded` or `file-deleted`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReq {
    pub device_id: Option<String>,
    pub connected: Option<bool>,
    /// RFC 3339 timestamp of the report.
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHealthRes {
    pub device_id: String,
    pub connected: bool,
    pub timestamp: String,
    pub stale: bool,
    pub last_seen: String,
    /// `Connected`, `Disconnected` or `Stale`.
    pub state: String,
}

impl From<DeviceHealth> for DeviceHealthRes {
    fn from(device: DeviceHealth) -> Self {
        Self {
            state: device.state_label().to_owned(),
            device_id: device.device_id.to_string(),
            connected: device.connected,
            timestamp: device
                .timestamp
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            stale: device.stale,
            last_seen: device.last_seen,
        }
    }
}
