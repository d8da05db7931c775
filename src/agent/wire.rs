//! Newline-delimited JSON protocol spoken with worker subprocesses.
//!
//! The control plane writes one [`ControlFrame`] per line to the worker's
//! stdin; the worker answers with [`WorkerFrame`]s on stdout. stderr is
//! captured verbatim as log output.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("error encoding frame: `{0}`")]
    Encode(#[source] serde_json::Error),
}

/// Frames sent from the control plane to a worker.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlFrame {
    Message {
        id: String,
        from: String,
        #[serde(rename = "type")]
        message_type: String,
        content: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        metadata: Value,
    },
    Task {
        id: String,
        title: String,
        description: String,
        priority: String,
    },
    Shutdown,
}

impl ControlFrame {
    /// Encodes the frame as a single newline-terminated line.
    pub fn encode(&self) -> Result<String, WireError> {
        let mut line = serde_json::to_string(self).map_err(WireError::Encode)?;
        line.push('\n');
        Ok(line)
    }
}

/// Frames received from a worker.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerFrame {
    Ready,
    Response {
        content: String,
        #[serde(
            default,
            rename = "replyTo",
            skip_serializing_if = "Option::is_none"
        )]
        reply_to: Option<String>,
    },
    Log {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
    Heartbeat,
}

/// What a single stdout line from a worker means. Lines that do not parse as
/// a [`WorkerFrame`] are plain log output, not a protocol error.
#[derive(Debug, PartialEq)]
pub enum WorkerOutput {
    Frame(WorkerFrame),
    Raw(String),
}

impl WorkerOutput {
    pub fn parse(line: &str) -> Self {
        match serde_json::from_str::<WorkerFrame>(line) {
            Ok(frame) => WorkerOutput::Frame(frame),
            Err(_) => WorkerOutput::Raw(line.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frame_is_one_tagged_line() {
        let frame = ControlFrame::Shutdown;
        assert_eq!(frame.encode().unwrap(), "{\"kind\":\"shutdown\"}\n");
    }

    #[test]
    fn worker_frames_parse_by_kind() {
        assert_eq!(
            WorkerOutput::parse("{\"kind\":\"ready\"}"),
            WorkerOutput::Frame(WorkerFrame::Ready)
        );
        assert_eq!(
            WorkerOutput::parse("{\"kind\":\"heartbeat\"}"),
            WorkerOutput::Frame(WorkerFrame::Heartbeat)
        );
        assert_eq!(
            WorkerOutput::parse("{\"kind\":\"response\",\"content\":\"done\"}"),
            WorkerOutput::Frame(WorkerFrame::Response {
                content: "done".to_string(),
                reply_to: None,
            })
        );
    }

    #[test]
    fn unparseable_lines_are_raw_log_output() {
        assert_eq!(
            WorkerOutput::parse("plain progress output"),
            WorkerOutput::Raw("plain progress output".to_string())
        );
        // valid JSON but not a frame
        assert_eq!(
            WorkerOutput::parse("{\"other\":true}"),
            WorkerOutput::Raw("{\"other\":true}".to_string())
        );
    }
}
