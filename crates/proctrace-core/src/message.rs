//! Raw messages produced by kernel probes.
//!
//! Messages are tagged by `kind`. The set of kinds known by this crate is
//! closed, but decoding never fails because of a kind it does not know:
//! such messages become [`KernelMessage::Unknown`] and are skipped by the
//! manager.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{EnumDiscriminants, EnumString, IntoStaticStr};
use thiserror::Error;

use crate::event::{Arg, Credentials, Namespaces};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumDiscriminants)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[strum_discriminants(derive(Hash, PartialOrd, Ord, EnumString, IntoStaticStr))]
#[strum_discriminants(strum(serialize_all = "snake_case"))]
#[strum_discriminants(name(MessageKind))]
pub enum KernelMessage {
    /// Probes are loaded and the source is about to stream events.
    Ready,
    Exec(ExecMessage),
    Exit(ExitMessage),
    Kprobe(KprobeMessage),
    Tracepoint(TracepointMessage),
    Test(TestMessage),
    /// A kind this build does not understand.
    #[serde(skip)]
    Unknown { kind: String },
}

impl KernelMessage {
    pub fn kind(&self) -> MessageKind {
        MessageKind::from(self)
    }

    /// Decode a JSON message, mapping unrecognized kinds to [`KernelMessage::Unknown`].
    pub fn from_json(input: &str) -> Result<Self, MessageError> {
        let value: serde_json::Value = serde_json::from_str(input)?;
        let kind = value
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .ok_or(MessageError::MissingKind)?;
        match MessageKind::from_str(kind) {
            Ok(MessageKind::Unknown) | Err(_) => Ok(KernelMessage::Unknown {
                kind: kind.to_string(),
            }),
            Ok(_) => Ok(serde_json::from_value(value)?),
        }
    }
}

impl MessageKind {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no kind")]
    MissingKind,
}

/// Reference to a process by PID and kernel start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRef {
    pub pid: u32,
    pub ktime: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecMessage {
    pub pid: u32,
    pub ppid: u32,
    pub ktime: u64,
    /// Explicit parent reference, when the probe could read it.
    #[serde(default)]
    pub parent: Option<ProcessRef>,
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub creds: Credentials,
    #[serde(default)]
    pub namespaces: Namespaces,
    /// The process was created by a clone right before this exec. Without
    /// it, the exec replaced the image of an already running process.
    #[serde(default)]
    pub clone: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitMessage {
    pub pid: u32,
    pub ktime: u64,
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub signal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KprobeMessage {
    pub pid: u32,
    pub ktime: u64,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracepointMessage {
    pub pid: u32,
    pub ktime: u64,
    pub subsys: String,
    pub event: String,
    #[serde(default)]
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMessage {
    #[serde(default)]
    pub arg0: u64,
    #[serde(default)]
    pub arg1: u64,
    #[serde(default)]
    pub arg2: u64,
    #[serde(default)]
    pub arg3: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_exec() {
        let msg = KernelMessage::from_json(
            r#"{"kind":"exec","pid":100,"ppid":1,"ktime":5,"binary":"/bin/sh","args":["sh","-c","true"],"clone":true}"#,
        )
        .unwrap();
        let KernelMessage::Exec(exec) = msg else {
            panic!("expected exec, got {msg:?}");
        };
        assert_eq!(exec.pid, 100);
        assert_eq!(exec.args, vec!["sh", "-c", "true"]);
        assert!(exec.clone);
        assert_eq!(exec.parent, None);
        assert_eq!(exec.creds, Credentials::default());
    }

    #[test]
    fn decode_kprobe_args() {
        let msg = KernelMessage::from_json(
            r#"{"kind":"kprobe","pid":100,"ktime":5,"function":"__x64_sys_write","args":[{"type":"file","value":"/tmp/x"},{"type":"size","value":12}]}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), MessageKind::Kprobe);
        let KernelMessage::Kprobe(kprobe) = msg else {
            unreachable!()
        };
        assert_eq!(
            kprobe.args,
            vec![Arg::File("/tmp/x".to_string()), Arg::Size(12)]
        );
    }

    #[test]
    fn unknown_kind_is_not_an_error() {
        let msg = KernelMessage::from_json(r#"{"kind":"bpf_loader","foo":1}"#).unwrap();
        assert_eq!(
            msg,
            KernelMessage::Unknown {
                kind: "bpf_loader".to_string()
            }
        );
        assert_eq!(msg.kind(), MessageKind::Unknown);
        // "unknown" itself is not a decodable kind
        let msg = KernelMessage::from_json(r#"{"kind":"unknown"}"#).unwrap();
        assert_eq!(msg.kind(), MessageKind::Unknown);
    }

    #[test]
    fn malformed_messages() {
        assert!(matches!(
            KernelMessage::from_json(r#"{"pid":1}"#),
            Err(MessageError::MissingKind)
        ));
        assert!(matches!(
            KernelMessage::from_json("not json"),
            Err(MessageError::Json(_))
        ));
        // known kind, missing fields
        assert!(matches!(
            KernelMessage::from_json(r#"{"kind":"exit"}"#),
            Err(MessageError::Json(_))
        ));
    }

    #[test]
    fn ready_and_kind_names() {
        let msg = KernelMessage::from_json(r#"{"kind":"ready"}"#).unwrap();
        assert_eq!(msg, KernelMessage::Ready);
        assert_eq!(MessageKind::Tracepoint.name(), "tracepoint");
    }
}
