use std::fs;
use std::io::{ErrorKind, Write};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use rand::Rng;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, IF_NONE_MATCH, USER_AGENT};
use tracing::{debug, info};

use crate::config::{PipelineConfig, StoreConfig};
use crate::error::IngestError;
use crate::retry::{FailureKind, NextAction, RetryPolicy};
use crate::store::LocalLayout;
use crate::transport::classify;

pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` at `path`. With `overwrite == false` an existing object
    /// is left untouched and [`IngestError::AlreadyExists`] is returned.
    fn put(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        content_type: Option<&str>,
        overwrite: bool,
    ) -> Result<(), IngestError>;
    fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, IngestError>;
    fn exists(&self, container: &str, path: &str) -> Result<bool, IngestError>;
    fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, IngestError>;
}

impl<S: ObjectStore + ?Sized> ObjectStore for Box<S> {
    fn put(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        content_type: Option<&str>,
        overwrite: bool,
    ) -> Result<(), IngestError> {
        (**self).put(container, path, bytes, content_type, overwrite)
    }

    fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, IngestError> {
        (**self).get(container, path)
    }

    fn exists(&self, container: &str, path: &str) -> Result<bool, IngestError> {
        (**self).exists(container, path)
    }

    fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, IngestError> {
        (**self).list(container, prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    Skipped,
}

/// Put with idempotent semantics: an existing object under a create-only put
/// counts as success.
pub fn upload_bytes(
    store: &dyn ObjectStore,
    container: &str,
    path: &str,
    bytes: &[u8],
    content_type: Option<&str>,
    overwrite: bool,
) -> Result<UploadOutcome, IngestError> {
    let content_type = content_type_for(path, content_type);
    match store.put(container, path, bytes, content_type, overwrite) {
        Ok(()) => {
            info!(container, path, overwrite, bytes = bytes.len(), "uploaded");
            Ok(UploadOutcome::Uploaded)
        }
        Err(IngestError::AlreadyExists { .. }) if !overwrite => {
            info!(container, path, "exists, skipping (overwrite disabled)");
            Ok(UploadOutcome::Skipped)
        }
        Err(err) => Err(err),
    }
}

pub fn content_type_for<'a>(path: &str, explicit: Option<&'a str>) -> Option<&'a str> {
    if explicit.is_some() {
        return explicit;
    }
    let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())?;
    match ext.as_str() {
        "csv" => Some("text/csv"),
        "parquet" | "pq" => Some("application/octet-stream"),
        "json" => Some("application/json"),
        "zip" => Some("application/zip"),
        _ => None,
    }
}

pub fn open_store(config: &PipelineConfig) -> Result<Box<dyn ObjectStore>, IngestError> {
    match &config.store {
        StoreConfig::Fs { root } => {
            let root = Utf8PathBuf::from_path_buf(root.clone())
                .map_err(|_| IngestError::ObjectStore("invalid store root path".to_string()))?;
            Ok(Box::new(FsObjectStore::new(root)))
        }
        StoreConfig::Azure { sas_url } => Ok(Box::new(AzureBlobStore::new(sas_url)?)),
    }
}

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: Utf8PathBuf,
}

impl FsObjectStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, container: &str, path: &str) -> Result<Utf8PathBuf, IngestError> {
        if path.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(IngestError::ObjectStore(format!("invalid object path: {path}")));
        }
        Ok(self.root.join(container).join(path))
    }
}

impl ObjectStore for FsObjectStore {
    fn put(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        _content_type: Option<&str>,
        overwrite: bool,
    ) -> Result<(), IngestError> {
        let target = self.object_path(container, path)?;
        if overwrite {
            return LocalLayout::write_bytes_atomic(&target, bytes);
        }
        let parent = target
            .parent()
            .ok_or_else(|| IngestError::ObjectStore(format!("invalid object path: {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| IngestError::ObjectStore(err.to_string()))?;
        // written in full under a temp name, then linked into place only if absent
        let mut temp = tempfile::Builder::new()
            .prefix(".bts-ingest")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| IngestError::ObjectStore(err.to_string()))?;
        temp.write_all(bytes)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|err| IngestError::ObjectStore(err.to_string()))?;
        match temp.persist_noclobber(target.as_std_path()) {
            Ok(_) => Ok(()),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
                Err(IngestError::AlreadyExists {
                    container: container.to_string(),
                    path: path.to_string(),
                })
            }
            Err(err) => Err(IngestError::ObjectStore(err.error.to_string())),
        }
    }

    fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, IngestError> {
        let target = self.object_path(container, path)?;
        fs::read(target.as_std_path()).map_err(|err| match err.kind() {
            ErrorKind::NotFound => IngestError::ObjectNotFound {
                container: container.to_string(),
                path: path.to_string(),
            },
            _ => IngestError::ObjectStore(err.to_string()),
        })
    }

    fn exists(&self, container: &str, path: &str) -> Result<bool, IngestError> {
        Ok(self.object_path(container, path)?.as_std_path().is_file())
    }

    fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, IngestError> {
        let base = self.root.join(container);
        if !base.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            let entries = fs::read_dir(dir.as_std_path())
                .map_err(|err| IngestError::ObjectStore(err.to_string()))?;
            for entry in entries {
                let entry = entry.map_err(|err| IngestError::ObjectStore(err.to_string()))?;
                let path = Utf8PathBuf::from_path_buf(entry.path())
                    .map_err(|_| IngestError::ObjectStore("non-utf8 object path".to_string()))?;
                if path.is_dir() {
                    stack.push(path);
                } else if let Some(key) = object_key(&base, &path) {
                    if key.starts_with(prefix) {
                        names.push(key);
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn object_key(base: &Utf8Path, path: &Utf8Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let name = relative.file_name()?;
    // temp files from atomic writes
    if name.starts_with(".bts-ingest") {
        return None;
    }
    Some(
        relative
            .components()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

const BLOB_API_VERSION: &str = "2021-08-06";

const BLOB_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 4,
    patient_mode: false,
    backoff_cap: Duration::from_secs(4),
};

/// Azure Blob REST API addressed through an account SAS URL
/// (`https://<account>.blob.core.windows.net/?sv=...`).
#[derive(Clone)]
pub struct AzureBlobStore {
    client: Client,
    account: Url,
    sas: String,
    name_re: Regex,
    marker_re: Regex,
}

impl AzureBlobStore {
    pub fn new(sas_url: &str) -> Result<Self, IngestError> {
        let (base, sas) = sas_url
            .split_once('?')
            .ok_or_else(|| IngestError::ObjectStore("SAS URL has no query token".to_string()))?;
        let account =
            Url::parse(base).map_err(|err| IngestError::ObjectStore(err.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("bts-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::ObjectStore(err.to_string()))?,
        );
        headers.insert("x-ms-version", HeaderValue::from_static(BLOB_API_VERSION));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| IngestError::ObjectStore(err.to_string()))?;

        Ok(Self {
            client,
            account,
            sas: sas.to_string(),
            name_re: Regex::new(r"<Name>([^<]*)</Name>")
                .map_err(|err| IngestError::ObjectStore(err.to_string()))?,
            marker_re: Regex::new(r"<NextMarker>([^<]+)</NextMarker>")
                .map_err(|err| IngestError::ObjectStore(err.to_string()))?,
        })
    }

    fn url(&self, container: &str, path: Option<&str>) -> Result<Url, IngestError> {
        let mut url = self.account.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| IngestError::ObjectStore("SAS URL cannot be a base".to_string()))?;
            segments.pop_if_empty().push(container);
            if let Some(path) = path {
                segments.extend(path.split('/'));
            }
        }
        url.set_query(Some(&self.sas));
        Ok(url)
    }

    fn create_container(&self, container: &str) -> Result<(), IngestError> {
        let mut url = self.url(container, None)?;
        url.query_pairs_mut().append_pair("restype", "container");
        let response = self.send_with_retries(|| self.client.put(url.clone()))?;
        match response.status().as_u16() {
            201 | 409 => Ok(()),
            status => Err(Self::status_error(status, response)),
        }
    }

    fn status_error(status: u16, response: Response) -> IngestError {
        let message = response
            .text()
            .unwrap_or_else(|_| "blob request failed".to_string());
        IngestError::ObjectStore(format!("status {status}: {message}"))
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, IngestError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut attempt = 1;
        loop {
            let (failure, outcome) = match make_req().send() {
                Ok(response) => {
                    let failure = FailureKind::Status(response.status().as_u16());
                    if !failure.is_retryable() {
                        return Ok(response);
                    }
                    (failure, Ok(response))
                }
                Err(err) => {
                    let message = err.to_string();
                    (
                        FailureKind::Transport(classify(err)),
                        Err(IngestError::ObjectStore(message)),
                    )
                }
            };
            match BLOB_RETRY.next_action(attempt, &failure, rand::rng().random::<f64>()) {
                NextAction::Retry(delay) | NextAction::SwitchToPatient(delay) => {
                    let delay_ms = delay.as_millis() as u64;
                    debug!(attempt, %failure, delay_ms, "blob request retry");
                    thread::sleep(delay);
                    attempt += 1;
                }
                NextAction::Fail => return outcome,
            }
        }
    }
}

impl ObjectStore for AzureBlobStore {
    fn put(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        content_type: Option<&str>,
        overwrite: bool,
    ) -> Result<(), IngestError> {
        let url = self.url(container, Some(path))?;
        let make_req = || {
            let mut request = self
                .client
                .put(url.clone())
                .header("x-ms-blob-type", "BlockBlob")
                .body(bytes.to_vec());
            if let Some(content_type) = content_type {
                request = request.header(CONTENT_TYPE, content_type);
            }
            if !overwrite {
                request = request.header(IF_NONE_MATCH, "*");
            }
            request
        };

        let mut response = self.send_with_retries(make_req)?;
        if response.status().as_u16() == 404 {
            debug!(container, "container missing; creating");
            self.create_container(container)?;
            response = self.send_with_retries(make_req)?;
        }
        match response.status().as_u16() {
            200 | 201 => Ok(()),
            409 | 412 if !overwrite => Err(IngestError::AlreadyExists {
                container: container.to_string(),
                path: path.to_string(),
            }),
            status => Err(Self::status_error(status, response)),
        }
    }

    fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, IngestError> {
        let url = self.url(container, Some(path))?;
        let response = self.send_with_retries(|| self.client.get(url.clone()))?;
        match response.status().as_u16() {
            200 => response
                .bytes()
                .map(|bytes| bytes.to_vec())
                .map_err(|err| IngestError::ObjectStore(err.to_string())),
            404 => Err(IngestError::ObjectNotFound {
                container: container.to_string(),
                path: path.to_string(),
            }),
            status => Err(Self::status_error(status, response)),
        }
    }

    fn exists(&self, container: &str, path: &str) -> Result<bool, IngestError> {
        let url = self.url(container, Some(path))?;
        let response = self.send_with_retries(|| self.client.head(url.clone()))?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(Self::status_error(status, response)),
        }
    }

    fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, IngestError> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut url = self.url(container, None)?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("restype", "container")
                    .append_pair("comp", "list")
                    .append_pair("prefix", prefix);
                if let Some(marker) = &marker {
                    query.append_pair("marker", marker);
                }
            }
            let response = self.send_with_retries(|| self.client.get(url.clone()))?;
            let body = match response.status().as_u16() {
                200 => response
                    .text()
                    .map_err(|err| IngestError::ObjectStore(err.to_string()))?,
                404 => return Ok(names),
                status => return Err(Self::status_error(status, response)),
            };
            names.extend(
                self.name_re
                    .captures_iter(&body)
                    .map(|caps| unescape_xml(&caps[1])),
            );
            marker = self
                .marker_re
                .captures(&body)
                .map(|caps| unescape_xml(&caps[1]));
            if marker.is_none() {
                return Ok(names);
            }
        }
    }
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
