//! Progress event channel between child commands and DAG watchers.
//!
//! Children correlate their events to a DAG run through the execution
//! token. Transport selection is per-process via the
//! `PIPELIME_PIPER_CHANNEL_TYPE` environment variable; the default
//! filesystem transport needs no running services. Transport errors are
//! logged and degraded to no-ops, never propagated.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const CHANNEL_ENV: &str = "PIPELIME_PIPER_CHANNEL_TYPE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Sender id (command instance).
    pub id: String,
    /// Execution token of the DAG run.
    pub token: String,
    pub payload: serde_json::Value,
}

/// Event sink; implementations are multi-producer safe.
pub trait ProgressSink: Send + Sync {
    /// Deliver one event. Returns whether the transport accepted it.
    fn send(&self, event: &ProgressEvent) -> bool;
}

/// Default sink: drops everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn send(&self, _event: &ProgressEvent) -> bool {
        false
    }
}

/// Filesystem transport: appends JSON lines to a per-token file under the
/// system temp directory. A single consumer tails the file, which
/// serializes the channel.
pub struct FilesystemChannel {
    path: PathBuf,
}

impl FilesystemChannel {
    pub fn for_token(token: &str) -> FilesystemChannel {
        let dir = std::env::temp_dir().join("pipelime").join("progress");
        FilesystemChannel {
            path: dir.join(format!("{token}.jsonl")),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read back every event emitted for this token so far.
    pub fn events(&self) -> Result<Vec<ProgressEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)?;
        let mut events = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }
}

impl ProgressSink for FilesystemChannel {
    fn send(&self, event: &ProgressEvent) -> bool {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let line = serde_json::to_string(event).expect("event serializes");
            writeln!(file, "{line}")
        };
        match write() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("progress channel write failed: {err}");
                false
            }
        }
    }
}

/// In-process bus, mutex-protected; used by library consumers and tests
/// that watch a run from the same process.
static MEMORY_BUS: Lazy<Mutex<HashMap<String, Vec<ProgressEvent>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub struct MemoryBus;

impl MemoryBus {
    /// Drain the events recorded for `token`.
    pub fn take(token: &str) -> Vec<ProgressEvent> {
        MEMORY_BUS.lock().remove(token).unwrap_or_default()
    }
}

impl ProgressSink for MemoryBus {
    fn send(&self, event: &ProgressEvent) -> bool {
        MEMORY_BUS
            .lock()
            .entry(event.token.clone())
            .or_default()
            .push(event.clone());
        true
    }
}

/// Build the sink selected by `PIPELIME_PIPER_CHANNEL_TYPE` (default
/// `FILESYSTEM`). Broker-backed transports are external collaborators:
/// selecting them degrades to the null sink with a warning.
pub fn channel_for_token(token: &str) -> Box<dyn ProgressSink> {
    let selected = std::env::var(CHANNEL_ENV).unwrap_or_else(|_| "FILESYSTEM".to_string());
    match selected.as_str() {
        "FILESYSTEM" => Box::new(FilesystemChannel::for_token(token)),
        "MEMORY" => Box::new(MemoryBus),
        "BULLETIN" | "REDIS" => {
            tracing::warn!(
                "progress transport '{selected}' needs an external broker; events are dropped"
            );
            Box::new(NullSink)
        }
        other => {
            tracing::warn!("unknown progress transport '{other}'; events are dropped");
            Box::new(NullSink)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(token: &str, n: u64) -> ProgressEvent {
        ProgressEvent {
            id: "tester".to_string(),
            token: token.to_string(),
            payload: serde_json::json!({ "n": n }),
        }
    }

    #[test]
    fn filesystem_channel_roundtrips_events() {
        let token = format!("test-{}", uuid::Uuid::new_v4());
        let channel = FilesystemChannel::for_token(&token);
        assert!(channel.send(&event(&token, 1)));
        assert!(channel.send(&event(&token, 2)));
        let events = channel.events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].payload["n"], 2);
        std::fs::remove_file(channel.path()).ok();
    }

    #[test]
    fn memory_bus_drains_per_token() {
        let token = format!("test-{}", uuid::Uuid::new_v4());
        MemoryBus.send(&event(&token, 7));
        let events = MemoryBus::take(&token);
        assert_eq!(events.len(), 1);
        assert!(MemoryBus::take(&token).is_empty());
    }
}
