use std::{
    fmt::{self, Display},
    net::IpAddr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{EnumDiscriminants, IntoStaticStr};

/// Globally unique identifier of an observed process execution.
///
/// Unlike PIDs, execution ids are never reused: they are built from the node
/// name, the kernel start time of the execution and its PID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecId(String);

impl ExecId {
    pub fn new(node_name: &str, ktime: u64, pid: u32) -> Self {
        Self(format!("{node_name}:{ktime}:{pid}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

/// Namespace inode numbers of a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespaces {
    pub uts: u32,
    pub ipc: u32,
    pub mnt: u32,
    pub pid: u32,
    pub net: u32,
    pub time: u32,
    pub cgroup: u32,
    pub user: u32,
}

/// Process information attached to normalized events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub exec_id: ExecId,
    pub pid: u32,
    pub parent_exec_id: Option<ExecId>,
    pub binary: String,
    pub arguments: Vec<String>,
    pub cwd: String,
    pub ktime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<Namespaces>,
    /// Reference count of the cached record when the event was built.
    pub refcnt: u32,
}

impl Process {
    /// Arguments joined by spaces, the way a shell would show them.
    pub fn command_line(&self) -> String {
        self.arguments.join(" ")
    }
}

/// Connection tuple of a socket argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SockTuple {
    pub protocol: String,
    pub saddr: IpAddr,
    pub sport: u16,
    pub daddr: IpAddr,
    pub dport: u16,
    /// Names resolved for `daddr`, if known.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dnames: Vec<String>,
}

impl Display for SockTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> ", self.saddr, self.sport)?;
        match self.dnames.first() {
            Some(name) => write!(f, "{name}:{}", self.dport),
            None => write!(f, "{}:{}", self.daddr, self.dport),
        }
    }
}

/// Typed argument of a probe or tracepoint hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Arg {
    Int(i64),
    Size(u64),
    String(String),
    File(String),
    Sock(SockTuple),
    Bytes(Vec<u8>),
}

impl Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(value) => write!(f, "{value}"),
            Arg::Size(value) => write!(f, "{value}"),
            Arg::String(value) | Arg::File(value) => write!(f, "{value}"),
            Arg::Sock(sock) => write!(f, "{sock}"),
            Arg::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

/// Output representation of a kernel message, independent from its raw kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub node_name: String,
    pub time: DateTime<Utc>,
    pub payload: Payload,
}

impl Event {
    pub fn kind(&self) -> PayloadKind {
        PayloadKind::from(&self.payload)
    }

    /// The process the event refers to, if it could be resolved.
    pub fn process(&self) -> Option<&Process> {
        match &self.payload {
            Payload::ProcessExec { process, .. } | Payload::ProcessExit { process, .. } => {
                Some(process)
            }
            Payload::ProcessKprobe { process, .. } | Payload::ProcessTracepoint { process, .. } => {
                process.as_ref()
            }
            Payload::Test { .. } => None,
        }
    }

    pub fn parent(&self) -> Option<&Process> {
        match &self.payload {
            Payload::ProcessExec { parent, .. }
            | Payload::ProcessExit { parent, .. }
            | Payload::ProcessKprobe { parent, .. }
            | Payload::ProcessTracepoint { parent, .. } => parent.as_ref(),
            Payload::Test { .. } => None,
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self.time.format("%Y-%m-%dT%TZ");
        let process_info = match self.process() {
            Some(process) => format!("{} ({})", process.binary, process.pid),
            None => "unknown".to_string(),
        };
        write!(
            f,
            "[{time} {} {process_info}] {}",
            self.node_name, self.payload
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumDiscriminants)]
#[serde(tag = "type", content = "content")]
#[strum_discriminants(derive(Hash, PartialOrd, Ord, IntoStaticStr))]
#[strum_discriminants(name(PayloadKind))]
pub enum Payload {
    ProcessExec {
        process: Process,
        parent: Option<Process>,
    },
    ProcessExit {
        process: Process,
        parent: Option<Process>,
        status: u32,
        signal: Option<String>,
    },
    ProcessKprobe {
        process: Option<Process>,
        parent: Option<Process>,
        function_name: String,
        args: Vec<Arg>,
    },
    ProcessTracepoint {
        process: Option<Process>,
        parent: Option<Process>,
        subsys: String,
        event: String,
        args: Vec<Arg>,
    },
    Test {
        arg0: u64,
        arg1: u64,
        arg2: u64,
        arg3: u64,
    },
}

impl Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::ProcessExec { process, .. } => {
                write!(f, "Exec {{ arguments: {:?} }}", process.arguments)
            }
            Payload::ProcessExit { status, signal, .. } => match signal {
                Some(signal) => write!(f, "Exit {{ signal: {signal} }}"),
                None => write!(f, "Exit {{ status: {status} }}"),
            },
            Payload::ProcessKprobe {
                function_name,
                args,
                ..
            } => write!(f, "Kprobe {{ function: {function_name}, args: {} }}", join(args)),
            Payload::ProcessTracepoint {
                subsys,
                event,
                args,
                ..
            } => write!(
                f,
                "Tracepoint {{ event: {subsys}/{event}, args: {} }}",
                join(args)
            ),
            Payload::Test {
                arg0,
                arg1,
                arg2,
                arg3,
            } => write!(f, "Test {{ {arg0}, {arg1}, {arg2}, {arg3} }}"),
        }
    }
}

fn join(args: &[Arg]) -> String {
    let args: Vec<String> = args.iter().map(ToString::to_string).collect();
    format!("[{}]", args.join(", "))
}

impl PayloadKind {
    pub fn name(self) -> &'static str {
        self.into()
    }
}
