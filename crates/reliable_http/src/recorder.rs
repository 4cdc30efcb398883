//! Archive of finished requests, for diagnostics and test fixtures.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::request::{IdentityKey, RequestId, RequestState};

/// Copy of a request record taken when it reaches a terminal state.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestSnapshot {
    pub id: RequestId,
    pub key: IdentityKey,
    pub state: RequestState,
    pub method: String,
    pub url: String,
    pub target: Option<String>,
    pub uri_template: Option<String>,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub cache_duration: Duration,
    pub timeout: Duration,
    pub allowed_retries: u32,
    pub attempted_retries: u32,
    /// Dispatch sequence number of the last attempt.
    pub index: u64,
    pub latency: Option<Duration>,
    pub response_text: Option<String>,
    pub error: Option<String>,
}

impl fmt::Display for RequestSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<16}: {:?}", "State", self.state)?;
        writeln!(f, "{:<16}: {}", "Url", self.url)?;
        writeln!(f, "{:<16}: {}", "Method", self.method)?;
        if let Some(target) = &self.target {
            writeln!(f, "{:<16}: {}", "Target", target)?;
        }
        if let Some(template) = &self.uri_template {
            writeln!(f, "{:<16}: {}", "UriTemplate", template)?;
        }
        if !self.parameters.is_empty() {
            writeln!(f, "{:<16}: ", "Parameters")?;
            for (key, value) in &self.parameters {
                writeln!(f, "\t{}: {}", key, value)?;
            }
        }
        writeln!(f, "{:<16}: {:?}", "CacheDuration", self.cache_duration)?;
        writeln!(
            f,
            "{:<16}: {}/{}",
            "Retries", self.attempted_retries, self.allowed_retries
        )?;
        if let Some(latency) = self.latency {
            writeln!(f, "{:<16}: {:?}", "Latency", latency)?;
        }
        if let Some(text) = &self.response_text {
            writeln!(f, "{:<16}: {}", "ResponseText", text)?;
        }
        if let Some(error) = &self.error {
            writeln!(f, "{:<16}: {}", "Error", error)?;
        }
        Ok(())
    }
}

/// Pausable sink for finished requests. Created paused.
#[derive(Debug)]
pub struct Recorder {
    paused: AtomicBool,
    requests: Mutex<Vec<RequestSnapshot>>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            paused: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        !self.paused.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
    }

    /// Stores the snapshot unless the recorder is paused.
    pub fn record(&self, snapshot: RequestSnapshot) {
        if self.is_recording() {
            trace!(message = "Recording request.", id = %snapshot.id, url = %snapshot.url);
            self.requests.lock().push(snapshot);
        }
    }

    pub fn requests(&self) -> Vec<RequestSnapshot> {
        self.requests.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The recording as a JSON array.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.requests.lock())
    }
}
