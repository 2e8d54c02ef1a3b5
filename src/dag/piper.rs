//! Child-command contract ("piper commands").
//!
//! Every command driven by the DAG executor exposes four hidden options:
//! `---piper_inputs`, `---piper_outputs`, `---piper_token` and
//! `---piper_info`. The executor appends the token pair to every spawned
//! command line so children can correlate progress events to the DAG run;
//! `---piper_info` makes a command print a structured description of its
//! options and exit, which the executor may use for pre-flight
//! introspection.

use serde::{Deserialize, Serialize};

use super::progress::{channel_for_token, ProgressEvent, ProgressSink};

pub const PRIVATE_ARGUMENT_PREFIX: &str = "---";
pub const ARG_INPUTS: &str = "---piper_inputs";
pub const ARG_OUTPUTS: &str = "---piper_outputs";
pub const ARG_TOKEN: &str = "---piper_token";
pub const ARG_INFO: &str = "---piper_info";

/// Structured self-description printed by a command invoked with
/// `---piper_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiperInfo {
    pub command: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Per-invocation piper state of a child command: the execution token, the
/// declared ports, and the progress channel. Built from the command line;
/// no token means piper is inactive and every log call is a no-op.
pub struct PiperContext {
    id: String,
    token: Option<String>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    channel: Option<Box<dyn ProgressSink>>,
}

impl PiperContext {
    /// Scan `args` for the hidden piper options. `caller` names the
    /// command (it becomes part of the sender id).
    pub fn from_args(caller: &str, args: &[String]) -> PiperContext {
        let mut token = None;
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut iter = args.iter().peekable();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                ARG_TOKEN => token = iter.next().cloned().filter(|t| !t.is_empty()),
                ARG_INPUTS => {
                    while let Some(next) = iter.peek() {
                        if next.starts_with(PRIVATE_ARGUMENT_PREFIX) {
                            break;
                        }
                        inputs.push(iter.next().unwrap().clone());
                    }
                }
                ARG_OUTPUTS => {
                    while let Some(next) = iter.peek() {
                        if next.starts_with(PRIVATE_ARGUMENT_PREFIX) {
                            break;
                        }
                        outputs.push(iter.next().unwrap().clone());
                    }
                }
                _ => {}
            }
        }
        let id = format!("{caller}:{}", uuid::Uuid::new_v4());
        let channel = token.as_deref().map(channel_for_token);
        if token.is_some() {
            tracing::debug!("{id}|New piper context, token {token:?}");
        }
        PiperContext {
            id,
            token,
            inputs,
            outputs,
            channel,
        }
    }

    pub fn active(&self) -> bool {
        self.token.is_some()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Emit one key/value pair on the progress channel. Transport failures
    /// degrade silently; piper never aborts the command.
    pub fn log(&self, key: &str, value: serde_json::Value) {
        let (Some(token), Some(channel)) = (&self.token, &self.channel) else {
            return;
        };
        let event = ProgressEvent {
            id: self.id.clone(),
            token: token.clone(),
            payload: serde_json::json!({ key: value }),
        };
        channel.send(&event);
    }

    /// Emit a chunked progress update.
    pub fn progress(&self, chunk_index: usize, total_chunks: usize, payload: serde_json::Value) {
        self.log(
            "_progress",
            serde_json::json!({
                "chunk_index": chunk_index,
                "total_chunks": total_chunks,
                "progress_data": payload,
            }),
        );
    }

    /// The structured description a command prints for `---piper_info`.
    pub fn info(&self, command: &str) -> PiperInfo {
        PiperInfo {
            command: command.to_string(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::progress::MemoryBus;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn context_parses_hidden_options() {
        let ctx = PiperContext::from_args(
            "detector",
            &args(&[
                "--src", "in", ARG_INPUTS, "src", ARG_OUTPUTS, "dst", "dst2", ARG_TOKEN, "tok-1",
            ]),
        );
        assert!(ctx.active());
        assert_eq!(ctx.token(), Some("tok-1"));
        assert_eq!(ctx.inputs(), &["src".to_string()]);
        assert_eq!(ctx.outputs(), &["dst".to_string(), "dst2".to_string()]);
    }

    #[test]
    fn missing_token_deactivates_logging() {
        let ctx = PiperContext::from_args("detector", &args(&["--src", "in"]));
        assert!(!ctx.active());
        // No panic, no event.
        ctx.log("key", serde_json::json!(1));
    }

    #[test]
    fn events_reach_the_selected_channel() {
        let token = format!("piper-{}", uuid::Uuid::new_v4());
        let mut ctx = PiperContext::from_args(
            "detector",
            &args(&[ARG_TOKEN, token.as_str()]),
        );
        // Steer this context onto the in-process bus.
        ctx.channel = Some(Box::new(MemoryBus));
        ctx.progress(0, 2, serde_json::json!({"step": 1}));
        let events = MemoryBus::take(&token);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["_progress"]["total_chunks"], 2);
    }
}
