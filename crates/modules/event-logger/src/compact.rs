//! One line per event, prefixed by an icon telling what happened.

use proctrace_core::event::{Arg, Event, Payload, Process};

const BLUE: &str = "\x1b[34m";
const CYAN: &str = "\x1b[36m";
const MAGENTA: &str = "\x1b[35m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Namespace clone flags, as passed to setns.
const NAMESPACES: [(i64, &str); 9] = [
    (0, "any"),
    (0x2000000, "cgroup"),
    (0x8000000, "ipc"),
    (0x40000000, "net"),
    (0x20000, "mnt"),
    (0x20000000, "pid"),
    (0x80, "time"),
    (0x10000000, "user"),
    (0x4000000, "uts"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactEncoder {
    color: bool,
}

impl CompactEncoder {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    pub fn encode(&self, event: &Event) -> String {
        let node = event.node_name.as_str();
        match &event.payload {
            Payload::ProcessExec { process, .. } => {
                let arguments = arguments(process);
                self.line("🚀", "process", node, Some(process), &[self.cyan(&arguments)])
            }
            Payload::ProcessExit {
                process,
                status,
                signal,
                ..
            } => {
                let arguments = arguments(process);
                let status = match signal {
                    Some(signal) => signal.clone(),
                    None => status.to_string(),
                };
                self.line(
                    "💥",
                    "exit",
                    node,
                    Some(process),
                    &[self.cyan(&arguments), self.red(&status)],
                )
            }
            Payload::ProcessKprobe {
                process,
                function_name,
                args,
                ..
            } => self.kprobe(node, process.as_ref(), function_name, args),
            Payload::ProcessTracepoint {
                process,
                subsys,
                event,
                args,
                ..
            } => {
                let name = format!("{subsys}/{event}");
                let args = args.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ");
                self.line(
                    "🔍",
                    "tracepoint",
                    node,
                    process.as_ref(),
                    &[name, self.cyan(&args)],
                )
            }
            Payload::Test {
                arg0,
                arg1,
                arg2,
                arg3,
            } => {
                let args = format!("{arg0} {arg1} {arg2} {arg3}");
                self.line("🧪", "test", node, None, &[self.cyan(&args)])
            }
        }
    }

    fn kprobe(&self, node: &str, process: Option<&Process>, function: &str, args: &[Arg]) -> String {
        let syscall = function
            .strip_prefix("__x64_sys_")
            .or_else(|| function.strip_prefix("__arm64_sys_"))
            .unwrap_or(function);
        match syscall {
            "write" | "read" => {
                let (icon, label) = if syscall == "write" {
                    ("📝", "write")
                } else {
                    ("📚", "read")
                };
                let mut fields = vec![self.cyan(file_arg(args, 0))];
                if let Some(size) = args.get(2) {
                    fields.push(self.cyan(&format!("{size} bytes")));
                }
                self.line(icon, label, node, process, &fields)
            }
            "fd_install" => self.line("📬", "open", node, process, &[self.cyan(file_arg(args, 1))]),
            "close" => self.line("📪", "close", node, process, &[self.cyan(file_arg(args, 0))]),
            "mount" | "pivot_root" => {
                let fields = [self.cyan(&plain_arg(args, 0)), self.cyan(&plain_arg(args, 1))];
                self.line("💾", syscall, node, process, &fields)
            }
            "setuid" => self.line("🔑", "setuid", node, process, &[self.cyan(&plain_arg(args, 0))]),
            "clock_settime" => self.line("⏰", "clock_settime", node, process, &[]),
            "setns" => {
                let namespace = match args.get(1) {
                    Some(Arg::Int(flag)) => NAMESPACES
                        .iter()
                        .find(|(value, _)| value == flag)
                        .map(|(_, name)| *name)
                        .unwrap_or_default(),
                    _ => "",
                };
                self.line("🔧", "setns", node, process, &[namespace.to_string()])
            }
            "tcp_connect" | "tcp_close" => {
                self.line("🔧", syscall, node, process, &[self.cyan(&sock_arg(args))])
            }
            "tcp_sendmsg" => {
                let bytes = match args.get(1) {
                    Some(Arg::Int(bytes)) => bytes.to_string(),
                    Some(Arg::Size(bytes)) => bytes.to_string(),
                    _ => "0".to_string(),
                };
                let fields = [self.cyan(&sock_arg(args)), format!("bytes {bytes}")];
                self.line("🔧", "tcp_sendmsg", node, process, &fields)
            }
            "proc_exec_connector" => self.line("🔧", syscall, node, process, &[]),
            _ => self.line("⁉️", "syscall", node, process, &[function.to_string()]),
        }
    }

    fn line(
        &self,
        icon: &str,
        label: &str,
        node: &str,
        process: Option<&Process>,
        fields: &[String],
    ) -> String {
        let mut line = self.paint(BLUE, &format!("{icon} {label:<7}"));
        line.push(' ');
        line.push_str(node);
        line.push(' ');
        match process {
            Some(process) => line.push_str(&self.paint(MAGENTA, &process.binary)),
            None => line.push_str("<unknown>"),
        }
        for field in fields.iter().filter(|field| !field.is_empty()) {
            line.push(' ');
            line.push_str(field);
        }
        line
    }

    fn cyan(&self, text: &str) -> String {
        self.paint(CYAN, text)
    }

    fn red(&self, text: &str) -> String {
        self.paint(RED, text)
    }

    fn paint(&self, color: &str, text: &str) -> String {
        if self.color && !text.is_empty() {
            format!("{color}{text}{RESET}")
        } else {
            text.to_string()
        }
    }
}

/// Arguments without the program name.
fn arguments(process: &Process) -> String {
    process
        .arguments
        .iter()
        .skip(1)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

fn file_arg(args: &[Arg], index: usize) -> &str {
    match args.get(index) {
        Some(Arg::File(path)) => path,
        _ => "",
    }
}

fn plain_arg(args: &[Arg], index: usize) -> String {
    args.get(index).map(ToString::to_string).unwrap_or_default()
}

fn sock_arg(args: &[Arg]) -> String {
    match args.first() {
        Some(Arg::Sock(sock)) => sock.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proctrace_core::event::{ExecId, SockTuple};

    use super::*;

    fn process() -> Process {
        Process {
            exec_id: ExecId::new("node", 1, 42),
            pid: 42,
            parent_exec_id: None,
            binary: "/usr/bin/curl".to_string(),
            arguments: vec!["curl".to_string(), "-s".to_string(), "example.com".to_string()],
            cwd: "/".to_string(),
            ktime: 1,
            credentials: None,
            namespaces: None,
            refcnt: 1,
        }
    }

    fn event(payload: Payload) -> Event {
        Event {
            node_name: "node".to_string(),
            time: Utc::now(),
            payload,
        }
    }

    fn kprobe(function: &str, args: Vec<Arg>) -> Event {
        event(Payload::ProcessKprobe {
            process: Some(process()),
            parent: None,
            function_name: function.to_string(),
            args,
        })
    }

    #[test]
    fn exec_and_exit() {
        let encoder = CompactEncoder::new(false);
        let exec = event(Payload::ProcessExec {
            process: process(),
            parent: None,
        });
        assert_eq!(
            encoder.encode(&exec),
            "🚀 process node /usr/bin/curl -s example.com"
        );
        let exit = event(Payload::ProcessExit {
            process: process(),
            parent: None,
            status: 0,
            signal: Some("SIGKILL".to_string()),
        });
        assert_eq!(
            encoder.encode(&exit),
            "💥 exit    node /usr/bin/curl -s example.com SIGKILL"
        );
    }

    #[test]
    fn known_probes() {
        let encoder = CompactEncoder::new(false);
        let write = kprobe(
            "__x64_sys_write",
            vec![Arg::File("/tmp/out".to_string()), Arg::Int(1), Arg::Size(12)],
        );
        assert_eq!(
            encoder.encode(&write),
            "📝 write   node /usr/bin/curl /tmp/out 12 bytes"
        );

        let connect = kprobe(
            "tcp_connect",
            vec![Arg::Sock(SockTuple {
                protocol: "tcp".to_string(),
                saddr: "10.0.0.2".parse().unwrap(),
                sport: 51000,
                daddr: "93.184.216.34".parse().unwrap(),
                dport: 443,
                dnames: vec!["example.com".to_string()],
            })],
        );
        assert_eq!(
            encoder.encode(&connect),
            "🔧 tcp_connect node /usr/bin/curl 10.0.0.2:51000 -> example.com:443"
        );

        let setns = kprobe("__x64_sys_setns", vec![Arg::Int(3), Arg::Int(0x40000000)]);
        assert_eq!(encoder.encode(&setns), "🔧 setns   node /usr/bin/curl net");
    }

    #[test]
    fn formatted_arguments() {
        let encoder = CompactEncoder::new(true);
        let read = kprobe(
            "__arm64_sys_read",
            vec![Arg::File("/etc/passwd".to_string()), Arg::Int(3), Arg::Size(4096)],
        );
        assert!(encoder.encode(&read).ends_with("\x1b[36m4096 bytes\x1b[0m"));

        let encoder = CompactEncoder::new(false);
        let mount = kprobe(
            "__x64_sys_mount",
            vec![Arg::String("/dev/sda1".to_string()), Arg::String("/mnt".to_string())],
        );
        assert_eq!(
            encoder.encode(&mount),
            "💾 mount   node /usr/bin/curl /dev/sda1 /mnt"
        );

        let send = kprobe(
            "tcp_sendmsg",
            vec![
                Arg::Sock(SockTuple {
                    protocol: "tcp".to_string(),
                    saddr: "10.0.0.2".parse().unwrap(),
                    sport: 51000,
                    daddr: "10.0.0.3".parse().unwrap(),
                    dport: 80,
                    dnames: Vec::new(),
                }),
                Arg::Int(512),
            ],
        );
        assert_eq!(
            encoder.encode(&send),
            "🔧 tcp_sendmsg node /usr/bin/curl 10.0.0.2:51000 -> 10.0.0.3:80 bytes 512"
        );
    }

    #[test]
    fn other_functions_and_missing_process() {
        let encoder = CompactEncoder::new(false);
        let other = event(Payload::ProcessKprobe {
            process: None,
            parent: None,
            function_name: "security_file_permission".to_string(),
            args: Vec::new(),
        });
        assert_eq!(
            encoder.encode(&other),
            "⁉️ syscall node <unknown> security_file_permission"
        );
    }

    #[test]
    fn colors() {
        let encoder = CompactEncoder::new(true);
        let exit = event(Payload::ProcessExit {
            process: process(),
            parent: None,
            status: 1,
            signal: None,
        });
        let line = encoder.encode(&exit);
        assert!(line.starts_with("\x1b[34m💥 exit   \x1b[0m"));
        assert!(line.ends_with("\x1b[31m1\x1b[0m"));
    }
}
