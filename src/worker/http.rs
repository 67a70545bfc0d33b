//! HTTP mirror worker built from a server description record.
//!
//! Each [`HttpWorker`] wraps one mirror: a base URL assembled from a
//! [`ServerDef`], a `reqwest` client configured with the descriptor's
//! timeout, and an optional output directory. A unit of work fetches
//! `{code}.{file_type}` relative to the base, streams the body while
//! counting bytes, and reports the count through the result stream.
//!
//! Error mapping keeps retry policy in the worker's declared kinds:
//! connect-level failures and 5xx answers are transient (another mirror may
//! serve the file), 4xx answers and local IO failures are permanent.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::bundle::{ArgBundle, ArgValue};
use crate::stats::BYTES_TO_MEGABITS;
use crate::stream::ResultStream;
use crate::worker::{ErrorKind, Worker, WorkerError};

/// URL scheme for a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// TLS transport (default).
    #[default]
    Https,
    /// Plain-text transport.
    Http,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Https => write!(f, "https"),
            Self::Http => write!(f, "http"),
        }
    }
}

fn default_transport_ver() -> String {
    "1".to_string()
}

/// Description record for one mirror server.
///
/// Only `name` and `server` are required; the rest default as shown in the
/// field docs and can be omitted when deserializing a pool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDef {
    /// Unique worker name for this mirror.
    pub name: String,
    /// Hostname of the mirror.
    pub server: String,
    /// URL prefix under the host; empty for the root.
    #[serde(default)]
    pub dir: String,
    /// URL scheme; defaults to `https`.
    #[serde(default)]
    pub transport: Transport,
    /// HTTP protocol version, `"1"` or `"2"`; defaults to `"1"`.
    #[serde(default = "default_transport_ver")]
    pub transport_ver: String,
    /// Launch-pacing bandwidth cap in Mbit/s; `0` disables pacing.
    #[serde(default)]
    pub bw_limit_mbps: f64,
    /// Advisory per-mirror queue depth; `0` means unlimited.
    #[serde(default)]
    pub queue_depth: u32,
    /// Request timeout in milliseconds; `0` means no explicit timeout.
    #[serde(default)]
    pub timeout_ms: f64,
}

impl ServerDef {
    /// Creates a descriptor with all optional fields at their defaults.
    #[must_use]
    pub fn new(name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            dir: String::new(),
            transport: Transport::default(),
            transport_ver: default_transport_ver(),
            bw_limit_mbps: 0.0,
            queue_depth: 0,
            timeout_ms: 0.0,
        }
    }

    /// Sets the URL prefix, builder style.
    #[must_use]
    pub fn with_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = dir.into();
        self
    }

    /// The base URL this descriptor names.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::InvalidValue`] if host or prefix do not form
    /// a valid URL.
    pub fn base_url(&self) -> Result<Url, WorkerError> {
        let mut base = format!("{}://{}/", self.transport, self.server);
        let dir = self.dir.trim_matches('/');
        if !dir.is_empty() {
            base.push_str(dir);
            base.push('/');
        }
        Url::parse(&base)
            .map_err(|e| WorkerError::invalid_value(format!("bad server URL {base}: {e}")))
    }
}

/// A worker that serves bundles from one HTTP mirror.
#[derive(Debug)]
pub struct HttpWorker {
    def: ServerDef,
    client: reqwest::Client,
    base: Url,
    output_dir: Option<PathBuf>,
    quiet: bool,
    /// Bytes of the last response, for bandwidth-cap pacing.
    last_bytes: AtomicU64,
}

impl HttpWorker {
    /// Builds a worker from a mirror descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::InvalidValue`] if the descriptor's URL parts
    /// are malformed or the client cannot be constructed.
    pub fn new(def: ServerDef) -> Result<Self, WorkerError> {
        let base = def.base_url()?;
        let mut builder = reqwest::Client::builder();
        if def.timeout_ms > 0.0 {
            builder = builder.timeout(std::time::Duration::from_secs_f64(def.timeout_ms / 1000.0));
        }
        if def.transport_ver == "2" {
            builder = builder.http2_prior_knowledge();
        }
        let client = builder
            .build()
            .map_err(|e| WorkerError::invalid_value(format!("client for {}: {e}", def.name)))?;
        debug!(
            worker = %def.name,
            base = %base,
            timeout_ms = def.timeout_ms,
            "built HTTP worker"
        );
        Ok(Self {
            def,
            client,
            base,
            output_dir: None,
            quiet: false,
            last_bytes: AtomicU64::new(0),
        })
    }

    /// Enables writing fetched payloads under `dir`.
    #[must_use]
    pub fn with_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Suppresses per-unit log lines.
    #[must_use]
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// The descriptor this worker was built from.
    #[must_use]
    pub fn def(&self) -> &ServerDef {
        &self.def
    }

    fn target(&self, bundle: &ArgBundle) -> Result<(Url, String), WorkerError> {
        let code = bundle
            .str_field("code")
            .ok_or_else(|| WorkerError::invalid_value(format!("bundle {} has no code", bundle.idx)))?;
        let file_type = bundle
            .str_field("file_type")
            .ok_or_else(|| {
                WorkerError::invalid_value(format!("bundle {} has no file_type", bundle.idx))
            })?;
        let filename = format!("{code}.{file_type}");
        let url = self
            .base
            .join(&filename)
            .map_err(|e| WorkerError::invalid_value(format!("bad filename {filename}: {e}")))?;
        Ok((url, filename))
    }

    fn map_request_error(&self, url: &Url, error: &reqwest::Error) -> WorkerError {
        if error.is_timeout() {
            WorkerError::timeout(url.as_str())
        } else {
            WorkerError::connection(&self.def.server, error.to_string())
        }
    }
}

#[async_trait]
impl Worker for HttpWorker {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn soft_kinds(&self) -> &[ErrorKind] {
        &[ErrorKind::Connection, ErrorKind::Timeout, ErrorKind::Server]
    }

    fn hard_kinds(&self) -> &[ErrorKind] {
        &[ErrorKind::Http, ErrorKind::Io, ErrorKind::InvalidValue]
    }

    fn quiet(&self) -> bool {
        self.quiet
    }

    /// Paces launches when a bandwidth cap is set: waits the time the last
    /// file should have taken at the cap.
    async fn limiter(&self) {
        if self.def.bw_limit_mbps <= 0.0 {
            return;
        }
        let last = self.last_bytes.swap(0, Ordering::SeqCst);
        if last == 0 {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let seconds = last as f64 * BYTES_TO_MEGABITS / self.def.bw_limit_mbps;
        tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await;
    }

    async fn fetch(
        &self,
        results: &ResultStream,
        worker_count: u64,
        bundle: &ArgBundle,
    ) -> Result<(), WorkerError> {
        let (url, filename) = self.target(bundle)?;
        if !self.quiet {
            info!(worker = %self.def.name, idx = bundle.idx, url = %url, "fetching");
        }

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.map_request_error(&url, &e))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(WorkerError::server_status(url.as_str(), status.as_u16()));
        }
        if !status.is_success() {
            return Err(WorkerError::http_status(url.as_str(), status.as_u16()));
        }

        let mut sink = match &self.output_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| WorkerError::io(dir.clone(), e))?;
                let path = dir.join(&filename);
                let file = tokio::fs::File::create(&path)
                    .await
                    .map_err(|e| WorkerError::io(path.clone(), e))?;
                Some((file, path))
            }
            None => None,
        };

        let mut bytes: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.map_request_error(&url, &e))?;
            bytes += chunk.len() as u64;
            if let Some((file, path)) = &mut sink {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| WorkerError::io(path.clone(), e))?;
            }
        }
        if let Some((mut file, path)) = sink {
            file.flush()
                .await
                .map_err(|e| WorkerError::io(path, e))?;
        }
        self.last_bytes.store(bytes, Ordering::SeqCst);

        let mut extras = BTreeMap::new();
        extras.insert("filename".to_string(), ArgValue::from(filename));
        self.put_result(results, worker_count, bundle.idx, bytes, extras)
            .await
    }
}
