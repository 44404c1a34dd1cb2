//! Box storage on top of an object store.
//!
//! Each box is a key prefix in the object store:
//!
//! ```text
//! <bucket>/
//! ├── box1/
//! │   └── holiday.jpg        # at most one file per box
//! ├── box2/
//! ├── box3/
//! ├── box4/
//! └── device-health/
//!     └── pi-kitchen.json
//! ```
//!
//! The store itself never holds state between requests; the object store is the only source
//! of truth for whether a box is occupied.

use crate::config::{CoreConfig, StoreConfig};
use crate::constants::FALLBACK_MEDIA_TYPE;
use crate::{BoxError, BoxResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::{Attribute, Attributes, ObjectMeta, ObjectStore, PutOptions, PutPayload};
use pvfll_types::{BoxNumber, FileName};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// What a box currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoxStatus {
    Empty,
    Occupied {
        name: String,
        size: u64,
        last_modified: DateTime<Utc>,
    },
}

impl BoxStatus {
    pub fn is_empty(&self) -> bool {
        matches!(self, BoxStatus::Empty)
    }
}

/// A presigned request a client can perform directly against the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedRequest {
    pub method: http::Method,
    pub url: String,
    pub key: String,
    /// Headers the client must send with the request for the signature to hold.
    pub headers: BTreeMap<String, String>,
    pub expires_in: Duration,
}

/// Result of a server-side upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub key: String,
    pub name: FileName,
    pub size: u64,
    pub media_type: String,
}

/// An opened object, ready to be streamed.
pub struct OpenedFile {
    pub size: u64,
    pub media_type: Option<String>,
    pub stream: BoxStream<'static, object_store::Result<Bytes>>,
}

impl std::fmt::Debug for OpenedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedFile")
            .field("size", &self.size)
            .field("media_type", &self.media_type)
            .finish_non_exhaustive()
    }
}

/// Box-shaped view over an [`ObjectStore`].
#[derive(Clone)]
pub struct BoxStore {
    inner: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    /// `LocalFileSystem` rejects object attributes, so content types are only recorded
    /// where the backend keeps them.
    attributes: bool,
    max_file_size: u64,
    presign_expiry: Duration,
}

impl std::fmt::Debug for BoxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStore")
            .field("inner", &self.inner)
            .field("signing", &self.signer.is_some())
            .field("max_file_size", &self.max_file_size)
            .finish()
    }
}

impl BoxStore {
    /// Wrap an arbitrary object store.
    pub fn new(
        inner: Arc<dyn ObjectStore>,
        signer: Option<Arc<dyn Signer>>,
        attributes: bool,
        max_file_size: u64,
        presign_expiry: Duration,
    ) -> Self {
        Self {
            inner,
            signer,
            attributes,
            max_file_size,
            presign_expiry,
        }
    }

    /// Build the store described by the configuration.
    ///
    /// # Errors
    ///
    /// Returns `BoxError::Store` if the S3 client cannot be built (for example invalid
    /// credentials configuration) or the local root cannot be canonicalised.
    pub fn from_config(cfg: &CoreConfig) -> BoxResult<Self> {
        let (inner, signer, attributes): (Arc<dyn ObjectStore>, Option<Arc<dyn Signer>>, bool) =
            match cfg.store() {
                StoreConfig::S3 { bucket, region } => {
                    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                    if let Some(region) = region {
                        builder = builder.with_region(region);
                    }
                    let s3 = Arc::new(builder.build()?);
                    let signer: Arc<dyn Signer> = s3.clone();
                    (s3, Some(signer), true)
                }
                StoreConfig::Local { root } => {
                    let local: Arc<dyn ObjectStore> =
                        Arc::new(LocalFileSystem::new_with_prefix(root)?);
                    (local, None, false)
                }
                StoreConfig::Memory => (Arc::new(InMemory::new()), None, true),
            };

        tracing::info!(backend = ?cfg.store(), signing = signer.is_some(), "box store ready");

        Ok(Self::new(
            inner,
            signer,
            attributes,
            cfg.max_file_size(),
            cfg.presign_expiry(),
        ))
    }

    /// In-memory store with default limits.
    pub fn in_memory() -> Self {
        let cfg = CoreConfig::in_memory();
        Self::new(
            Arc::new(InMemory::new()),
            None,
            true,
            cfg.max_file_size(),
            cfg.presign_expiry(),
        )
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn can_sign(&self) -> bool {
        self.signer.is_some()
    }

    /// Direct access to the object store, for modules storing non-box documents.
    pub(crate) fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.inner
    }

    /// Report what `box_number` currently holds.
    ///
    /// Folder markers and zero-byte objects are ignored. If a box somehow holds more than
    /// one file, the first by key order is reported.
    pub async fn status(&self, box_number: BoxNumber) -> BoxResult<BoxStatus> {
        let prefix = Path::from(box_number.prefix());
        let files = list_files(self.inner.as_ref(), &prefix).await?;

        Ok(match files.into_iter().next() {
            None => BoxStatus::Empty,
            Some(meta) => BoxStatus::Occupied {
                name: object_name(&meta.location),
                size: meta.size as u64,
                last_modified: meta.last_modified,
            },
        })
    }

    /// Status of every box, in box order.
    pub async fn garden(&self) -> BoxResult<Vec<(BoxNumber, BoxStatus)>> {
        let statuses =
            futures::future::try_join_all(BoxNumber::all().map(|b| self.status(b))).await?;
        Ok(BoxNumber::all().zip(statuses).collect())
    }

    /// Sign a `PUT` the client can use to drop `file_name` into an empty box.
    ///
    /// The signature does not bind the body length, so `max_file_size` is only enforced on
    /// the server-side [`upload`](Self::upload) path.
    ///
    /// # Errors
    ///
    /// - `BoxError::Occupied` if the box already holds a file.
    /// - `BoxError::SigningUnsupported` if the backend cannot sign URLs.
    pub async fn presign_upload(
        &self,
        box_number: BoxNumber,
        file_name: &FileName,
        content_type: &str,
    ) -> BoxResult<PresignedRequest> {
        self.ensure_empty(box_number).await?;
        let signer = self.signer.as_ref().ok_or(BoxError::SigningUnsupported)?;

        let location = file_path(box_number, file_name);
        let url = signer
            .signed_url(http::Method::PUT, &location, self.presign_expiry)
            .await?;

        let mut headers = BTreeMap::new();
        headers.insert(
            http::header::CONTENT_TYPE.to_string(),
            media_type_or_fallback(content_type),
        );

        Ok(PresignedRequest {
            method: http::Method::PUT,
            url: url.to_string(),
            key: location.to_string(),
            headers,
            expires_in: self.presign_expiry,
        })
    }

    /// Sign a `GET` for the file in a box. The file is not removed.
    pub async fn presign_download(
        &self,
        box_number: BoxNumber,
        file_name: &FileName,
    ) -> BoxResult<PresignedRequest> {
        let signer = self.signer.as_ref().ok_or(BoxError::SigningUnsupported)?;
        let location = file_path(box_number, file_name);
        let url = signer
            .signed_url(http::Method::GET, &location, self.presign_expiry)
            .await?;

        Ok(PresignedRequest {
            method: http::Method::GET,
            url: url.to_string(),
            key: location.to_string(),
            headers: BTreeMap::new(),
            expires_in: self.presign_expiry,
        })
    }

    /// Store `body` as the content of an empty box.
    ///
    /// The check for an empty box and the write are two separate calls; two concurrent
    /// uploads to the same box can both succeed.
    ///
    /// # Errors
    ///
    /// - `BoxError::TooLarge` if `body` exceeds the configured maximum.
    /// - `BoxError::Occupied` if the box already holds a file.
    /// - `BoxError::Store` if the write fails.
    pub async fn upload(
        &self,
        box_number: BoxNumber,
        file_name: &FileName,
        content_type: Option<&str>,
        body: Bytes,
    ) -> BoxResult<StoredFile> {
        let size = body.len() as u64;
        if size > self.max_file_size {
            return Err(BoxError::TooLarge {
                size,
                max: self.max_file_size,
            });
        }
        self.ensure_empty(box_number).await?;

        let media_type = match content_type.map(str::trim).filter(|ct| !ct.is_empty()) {
            Some(ct) => ct.to_owned(),
            None => infer::get(&body)
                .map(|kind| kind.mime_type().to_owned())
                .unwrap_or_else(|| FALLBACK_MEDIA_TYPE.to_owned()),
        };

        let location = file_path(box_number, file_name);
        let mut opts = PutOptions::default();
        if self.attributes {
            let mut attributes = Attributes::new();
            attributes.insert(Attribute::ContentType, media_type.clone().into());
            opts.attributes = attributes;
        }
        self.inner
            .put_opts(&location, PutPayload::from(body), opts)
            .await?;

        tracing::info!(box_number = %box_number, key = %location, size, "file stored");

        Ok(StoredFile {
            key: location.to_string(),
            name: file_name.clone(),
            size,
            media_type,
        })
    }

    /// Open the file in a box for streaming.
    ///
    /// # Errors
    ///
    /// Returns `BoxError::NotFound` if the box does not hold `file_name`.
    pub async fn open(&self, box_number: BoxNumber, file_name: &FileName) -> BoxResult<OpenedFile> {
        let location = file_path(box_number, file_name);
        let result = match self.inner.get(&location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(BoxError::NotFound(location.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let media_type = result
            .attributes
            .get(&Attribute::ContentType)
            .map(|v| v.to_string());

        Ok(OpenedFile {
            size: result.meta.size as u64,
            media_type,
            stream: result.into_stream(),
        })
    }

    /// Remove the file from a box. Removing a file that is already gone succeeds.
    pub async fn remove(&self, box_number: BoxNumber, file_name: &FileName) -> BoxResult<()> {
        let location = file_path(box_number, file_name);
        match self.inner.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_empty(&self, box_number: BoxNumber) -> BoxResult<()> {
        match self.status(box_number).await? {
            BoxStatus::Empty => Ok(()),
            BoxStatus::Occupied { name, .. } => Err(BoxError::Occupied { box_number, name }),
        }
    }
}

/// Object key of a file in a box: `box{n}/{name}`.
pub fn file_path(box_number: BoxNumber, file_name: &FileName) -> Path {
    Path::from_iter([box_number.prefix().as_str(), file_name.as_str()])
}

/// Every non-empty object directly under `prefix`, ordered by key. Nested keys are skipped.
pub(crate) async fn list_files(
    store: &dyn ObjectStore,
    prefix: &Path,
) -> BoxResult<Vec<ObjectMeta>> {
    let mut files: Vec<ObjectMeta> = store
        .list_with_delimiter(Some(prefix))
        .await?
        .objects
        .into_iter()
        .filter(|meta| meta.size > 0 && meta.location != *prefix)
        .collect();

    files.sort_by(|a, b| a.location.cmp(&b.location));
    Ok(files)
}

/// Last segment of an object path, with object_store's percent-encoding undone.
pub(crate) fn object_name(location: &Path) -> String {
    let raw = location.filename().unwrap_or_default();
    percent_encoding::percent_decode_str(raw)
        .decode_utf8_lossy()
        .into_owned()
}

fn media_type_or_fallback(content_type: &str) -> String {
    let trimmed = content_type.trim();
    if trimmed.is_empty() {
        FALLBACK_MEDIA_TYPE.to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Drain a stream into memory. Only used by tests and small documents.
pub(crate) async fn collect(
    mut stream: BoxStream<'static, object_store::Result<Bytes>>,
) -> BoxResult<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
