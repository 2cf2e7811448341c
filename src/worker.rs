//! Runs ingestion on a background thread with a deadline.
//!
//! The request buffer is shared with the worker through an `Arc`, never
//! copied. A worker that misses the deadline has its cancel flag raised: it
//! gives up at the next entry or decompressed chunk and its late reply is
//! dropped. If no thread can be spawned the import runs on the caller's
//! thread instead.

use crate::adapter::AdapterSelector;
use crate::error::{PackageParseError, PackageParseErrorCode};
use crate::ingest::{ImportOptions, ParsedImportPackage, parse_import_payload_cancellable};
use crate::limits::LimitOverrides;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const WORKER_THREAD_NAME: &str = "package-import";

/// What the caller sends to the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub file_name: String,
    pub bytes: Vec<u8>,
    #[serde(default)]
    pub selected_source: Option<String>,
    #[serde(default)]
    pub limits: LimitOverrides,
}

impl WorkerRequest {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
            ..Default::default()
        }
    }

    fn options(&self) -> ImportOptions {
        ImportOptions {
            selected_source: self.selected_source.clone(),
            limits: self.limits,
        }
    }
}

/// What the worker sends back. Serializes as `{"ok": true, "parsed": ...}` or
/// `{"ok": false, "code": ..., "error": ...}`.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResponse {
    Success {
        parsed: ParsedImportPackage,
    },
    Failure {
        code: Option<PackageParseErrorCode>,
        error: String,
    },
}

impl WorkerResponse {
    pub fn into_result(self) -> Result<ParsedImportPackage, DispatchError> {
        match self {
            Self::Success { parsed } => Ok(parsed),
            Self::Failure {
                code: Some(code),
                error,
            } => Err(PackageParseError::new(code, error).into()),
            Self::Failure { code: None, error } => Err(DispatchError::WorkerFailed(error)),
        }
    }
}

impl From<Result<ParsedImportPackage, PackageParseError>> for WorkerResponse {
    fn from(result: Result<ParsedImportPackage, PackageParseError>) -> Self {
        match result {
            Ok(parsed) => Self::Success { parsed },
            Err(err) => Self::Failure {
                code: Some(err.code),
                error: err.message,
            },
        }
    }
}

impl From<Result<ParsedImportPackage, DispatchError>> for WorkerResponse {
    fn from(result: Result<ParsedImportPackage, DispatchError>) -> Self {
        match result {
            Ok(parsed) => Self::Success { parsed },
            Err(err) => err.into(),
        }
    }
}

impl From<DispatchError> for WorkerResponse {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Parse(err) => Err::<ParsedImportPackage, _>(err).into(),
            other => Self::Failure {
                code: None,
                error: other.to_string(),
            },
        }
    }
}

impl Serialize for WorkerResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            Self::Success { parsed } => {
                map.serialize_entry("ok", &true)?;
                map.serialize_entry("parsed", parsed)?;
            }
            Self::Failure { code, error } => {
                map.serialize_entry("ok", &false)?;
                if let Some(code) = code {
                    map.serialize_entry("code", code)?;
                }
                map.serialize_entry("error", error)?;
            }
        }
        map.end()
    }
}

/// Dispatch-layer failures. Only `Parse` says anything about the package.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Parse(#[from] PackageParseError),
    #[error("import did not finish within {0:?}")]
    Timeout(Duration),
    #[error("import worker failed: {0}")]
    WorkerFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub timeout: Duration,
    /// When false, always ingest on the caller's thread.
    pub use_worker: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            use_worker: true,
        }
    }
}

/// Ingests `request` off the caller's thread, waiting at most `config.timeout`.
pub fn dispatch_import(
    request: WorkerRequest,
    selector: Arc<dyn AdapterSelector>,
    config: &DispatchConfig,
) -> Result<ParsedImportPackage, DispatchError> {
    dispatch_with_cancel(request, selector, config, Arc::new(AtomicBool::new(false)))
}

fn dispatch_with_cancel(
    request: WorkerRequest,
    selector: Arc<dyn AdapterSelector>,
    config: &DispatchConfig,
    cancel: Arc<AtomicBool>,
) -> Result<ParsedImportPackage, DispatchError> {
    let request = Arc::new(request);
    if !config.use_worker {
        return run_request(&request, selector.as_ref(), &cancel).into_result();
    }

    let (tx, rx) = mpsc::channel();
    let shared = Arc::clone(&request);
    let worker_selector = Arc::clone(&selector);
    let worker_cancel = Arc::clone(&cancel);
    let spawned = thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || {
            let response = run_request(&shared, worker_selector.as_ref(), &worker_cancel);
            // the caller may already have given up on us
            let _ = tx.send(response);
        });
    if let Err(err) = spawned {
        warn!(%err, file_name = %request.file_name, "cannot spawn import worker, ingesting synchronously");
        return run_request(&request, selector.as_ref(), &cancel).into_result();
    }

    let started = Instant::now();
    match rx.recv_timeout(config.timeout) {
        Ok(response) => {
            debug!(file_name = %request.file_name, elapsed_ms = started.elapsed().as_millis() as u64, "import worker replied");
            response.into_result()
        }
        Err(RecvTimeoutError::Timeout) => {
            cancel.store(true, Ordering::Relaxed);
            warn!(file_name = %request.file_name, timeout = ?config.timeout, "import worker timed out");
            Err(DispatchError::Timeout(config.timeout))
        }
        Err(RecvTimeoutError::Disconnected) => Err(DispatchError::WorkerFailed(
            "worker exited without a response".to_string(),
        )),
    }
}

/// Runs one request to completion or cancellation, turning a panic into an
/// untagged failure.
pub fn run_request(request: &WorkerRequest, selector: &dyn AdapterSelector, cancel: &AtomicBool) -> WorkerResponse {
    let options = request.options();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        parse_import_payload_cancellable(&request.file_name, &request.bytes, &options, selector, cancel)
    }));
    match outcome {
        Ok(result) => result.into(),
        Err(_) => WorkerResponse::Failure {
            code: None,
            error: format!("ingestion of {:?} panicked", request.file_name),
        },
    }
}
