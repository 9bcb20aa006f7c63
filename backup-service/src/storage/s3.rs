//! S3-compatible object store target.
//!
//! Slots are objects under `<remote_path>/<slot>`. Promotions use server-side
//! `CopyObject` (or `UploadPartCopy` past 5 GiB), so weekly/monthly/yearly
//! slots never re-upload the archive.

use super::{StorageBackend, UploadedRef};
use crate::utils::format::format_bytes;
use crate::utils::{Result, RunLog, ServiceError};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Files above this size go through multipart upload.
const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
const PART_SIZE: usize = 16 * 1024 * 1024;

/// Largest object a single `CopyObject` accepts.
const MAX_SINGLE_COPY: u64 = 5 * 1024 * 1024 * 1024;
const COPY_PART_SIZE: u64 = 512 * 1024 * 1024;

/// Object metadata key carrying the original artifact file name.
const ARTIFACT_NAME_KEY: &str = "artifact-name";

/// Characters escaped in the `x-amz-copy-source` key; `/` stays literal.
const COPY_SOURCE_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Clone, Deserialize)]
pub struct S3TargetConfig {
    pub bucket: String,

    /// AWS region (falls back to the environment when unset)
    #[serde(default)]
    pub region: Option<String>,

    /// Key prefix inside the bucket
    #[serde(default, alias = "prefix")]
    pub remote_path: Option<String>,

    /// Custom endpoint for S3-compatible stores
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    #[serde(default)]
    pub force_path_style: bool,
}

impl std::fmt::Debug for S3TargetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3TargetConfig")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("remote_path", &self.remote_path)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

impl S3TargetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(ServiceError::Config("S3 bucket must be set".to_string()));
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(ServiceError::Config(format!(
                "S3 bucket \"{}\": access_key_id and secret_access_key must be set together",
                self.bucket
            )));
        }
        normalize_prefix(self.remote_path.as_deref())?;
        Ok(())
    }
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
    log: RunLog,
}

impl S3Backend {
    pub async fn connect(config: S3TargetConfig, log: RunLog) -> Result<Self> {
        config.validate()?;
        let prefix = normalize_prefix(config.remote_path.as_deref())?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                id.clone(),
                secret.clone(),
                None,
                None,
                "backup-service",
            ));
        }
        let shared_config = loader.load().await;

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if config.force_path_style {
            s3_builder = s3_builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_builder.build()),
            bucket: config.bucket,
            prefix,
            log,
        })
    }

    fn key(&self, slot: &str) -> String {
        object_key(&self.prefix, slot)
    }

    fn err(&self, context: &str, e: impl std::error::Error) -> ServiceError {
        ServiceError::storage(
            self.describe(),
            format!("{}: {}", context, DisplayErrorContext(e)),
        )
    }

    async fn put_single(&self, source: &Path, key: &str, artifact_name: &str) -> Result<()> {
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| self.err("read artifact", e))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .metadata(ARTIFACT_NAME_KEY, artifact_name)
            .send()
            .await
            .map_err(|e| self.err("PutObject", e))?;
        Ok(())
    }

    async fn put_multipart(&self, source: &Path, key: &str, artifact_name: &str) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .metadata(ARTIFACT_NAME_KEY, artifact_name)
            .send()
            .await
            .map_err(|e| self.err("CreateMultipartUpload", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| ServiceError::storage(self.describe(), "no multipart upload id"))?
            .to_string();

        match self.upload_parts(source, key, &upload_id).await {
            Ok(parts) => self.complete_upload(key, &upload_id, parts).await,
            Err(e) => {
                self.abort_upload(key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) {
        if let Err(abort) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            tracing::warn!(
                "Failed to abort multipart upload {}: {}",
                upload_id,
                DisplayErrorContext(abort)
            );
        }
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| self.err("CompleteMultipartUpload", e))?;
        Ok(())
    }

    /// Server-side copy in `UploadPartCopy` ranges, for objects above the
    /// single `CopyObject` limit.
    async fn copy_multipart(
        &self,
        source_key: &str,
        dest_key: &str,
        size: u64,
        artifact_name: Option<String>,
    ) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(dest_key)
            .set_metadata(artifact_name.map(|name| {
                std::collections::HashMap::from([(ARTIFACT_NAME_KEY.to_string(), name)])
            }))
            .send()
            .await
            .map_err(|e| self.err("CreateMultipartUpload", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| ServiceError::storage(self.describe(), "no multipart upload id"))?
            .to_string();

        match self.copy_parts(source_key, dest_key, &upload_id, size).await {
            Ok(parts) => self.complete_upload(dest_key, &upload_id, parts).await,
            Err(e) => {
                self.abort_upload(dest_key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn copy_parts(
        &self,
        source_key: &str,
        dest_key: &str,
        upload_id: &str,
        size: u64,
    ) -> Result<Vec<CompletedPart>> {
        let source = copy_source(&self.bucket, source_key);
        let mut parts = Vec::new();
        for (index, range) in copy_ranges(size, COPY_PART_SIZE).into_iter().enumerate() {
            let part_number = index as i32 + 1;
            let copied = self
                .client
                .upload_part_copy()
                .bucket(&self.bucket)
                .key(dest_key)
                .upload_id(upload_id)
                .part_number(part_number)
                .copy_source(&source)
                .copy_source_range(range)
                .send()
                .await
                .map_err(|e| self.err("UploadPartCopy", e))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(
                        copied
                            .copy_part_result()
                            .and_then(|r| r.e_tag())
                            .map(str::to_string),
                    )
                    .part_number(part_number)
                    .build(),
            );
        }
        Ok(parts)
    }

    async fn upload_parts(
        &self,
        source: &Path,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>> {
        let mut file = tokio::fs::File::open(source).await?;
        let mut parts = Vec::new();
        let mut part_number = 1;

        loop {
            let chunk = read_chunk(&mut file, PART_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| self.err("UploadPart", e))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
        }

        Ok(parts)
    }

    /// Size and artifact name of `key`, or `None` when it does not exist.
    async fn head(&self, key: &str) -> Result<Option<(u64, Option<String>)>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(head) => {
                let size = head.content_length().unwrap_or(0).max(0) as u64;
                let name = head
                    .metadata()
                    .and_then(|m| m.get(ARTIFACT_NAME_KEY))
                    .cloned();
                Ok(Some((size, name)))
            }
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()) == Some(true) {
                    Ok(None)
                } else {
                    Err(self.err("HeadObject", e))
                }
            }
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    async fn upload(&self, source: &Path, slot: &str) -> Result<UploadedRef> {
        let size = tokio::fs::metadata(source).await?.len();
        let key = self.key(slot);
        let artifact_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        self.log.msg(format!(
            "Upload to S3 started: {} ({}) -> {}",
            source.display(),
            format_bytes(size),
            key
        ));
        if size > MULTIPART_THRESHOLD {
            self.put_multipart(source, &key, &artifact_name).await?;
        } else {
            self.put_single(source, &key, &artifact_name).await?;
        }
        self.log.msg("Upload ended");

        Ok(UploadedRef {
            name: slot.to_string(),
            size,
        })
    }

    async fn delete_slot(&self, slot: &str) -> Result<()> {
        let key = self.key(slot);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| self.err("DeleteObject", e))?;
        self.log.msg(format!("S3: backup deleted {}", slot));
        Ok(())
    }

    async fn copy_from_slot(&self, source_slot: &str, dest_slot: &str) -> Result<UploadedRef> {
        let source_key = self.key(source_slot);
        let dest_key = self.key(dest_slot);
        let (size, artifact_name) = self.head(&source_key).await?.ok_or_else(|| {
            ServiceError::storage(self.describe(), format!("slot {} does not exist", source_slot))
        })?;

        if size > MAX_SINGLE_COPY {
            self.copy_multipart(&source_key, &dest_key, size, artifact_name)
                .await?;
        } else {
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .copy_source(copy_source(&self.bucket, &source_key))
                .key(&dest_key)
                .send()
                .await
                .map_err(|e| self.err("CopyObject", e))?;
        }

        Ok(UploadedRef {
            name: dest_slot.to_string(),
            size,
        })
    }

    async fn slot_exists(&self, slot: &str) -> Result<bool> {
        Ok(self.head(&self.key(slot)).await?.is_some())
    }
}

/// Fill up to `limit` bytes; a short chunk means end of file.
async fn read_chunk(file: &mut tokio::fs::File, limit: usize) -> Result<Vec<u8>> {
    let mut chunk = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let read = file.read(&mut chunk[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    chunk.truncate(filled);
    Ok(chunk)
}

/// `x-amz-copy-source` value: bucket plus URL-encoded key.
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, utf8_percent_encode(key, COPY_SOURCE_ESCAPE))
}

/// Inclusive `bytes=a-b` ranges covering `size` bytes in `part`-sized steps.
fn copy_ranges(size: u64, part: u64) -> Vec<String> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < size {
        let end = (start + part).min(size) - 1;
        ranges.push(format!("bytes={}-{}", start, end));
        start = end + 1;
    }
    ranges
}

fn object_key(prefix: &str, slot: &str) -> String {
    format!("{}{}", prefix, slot)
}

/// Normalizes an optional prefix into `a/b/` form (or empty).
pub(crate) fn normalize_prefix(prefix: Option<&str>) -> Result<String> {
    let Some(prefix) = prefix else {
        return Ok(String::new());
    };
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
            return Err(ServiceError::Config(format!(
                "invalid S3 remote path \"{}\"",
                prefix
            )));
        }
    }
    Ok(format!("{}/", trimmed))
}
