use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    event::{Arg, Event, Payload, Process},
    message::{KprobeMessage, TracepointMessage},
    process::ProcessRecord,
};

use super::{HandlerContext, event_cache::Deferred};

/// Builds events for generic kprobe and tracepoint hits.
#[derive(Debug, Clone)]
pub struct TracingHandler {
    ctx: Arc<HandlerContext>,
}

impl TracingHandler {
    pub(crate) fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }

    pub fn handle_kprobe(&self, mut msg: KprobeMessage) -> Option<Event> {
        msg.args = self.annotate(msg.args);
        match self.ctx.resolve(msg.pid, msg.ktime) {
            Some(record) => Some(self.kprobe_event(msg, Some(&record), Utc::now())),
            None => {
                let Err(Deferred::Kprobe(msg)) = self.ctx.defer(Deferred::Kprobe(msg)) else {
                    return None;
                };
                self.ctx.missing("kprobe", msg.pid, msg.ktime);
                Some(self.kprobe_event(msg, None, Utc::now()))
            }
        }
    }

    pub fn handle_tracepoint(&self, mut msg: TracepointMessage) -> Option<Event> {
        msg.args = self.annotate(msg.args);
        match self.ctx.resolve(msg.pid, msg.ktime) {
            Some(record) => Some(self.tracepoint_event(msg, Some(&record), Utc::now())),
            None => {
                let Err(Deferred::Tracepoint(msg)) =
                    self.ctx.defer(Deferred::Tracepoint(msg))
                else {
                    return None;
                };
                self.ctx.missing("tracepoint", msg.pid, msg.ktime);
                Some(self.tracepoint_event(msg, None, Utc::now()))
            }
        }
    }

    pub(crate) fn kprobe_event(
        &self,
        msg: KprobeMessage,
        record: Option<&Arc<ProcessRecord>>,
        time: DateTime<Utc>,
    ) -> Event {
        let (process, parent) = self.export(record);
        self.ctx.event_at(time, Payload::ProcessKprobe {
            process,
            parent,
            function_name: msg.function,
            args: msg.args,
        })
    }

    pub(crate) fn tracepoint_event(
        &self,
        msg: TracepointMessage,
        record: Option<&Arc<ProcessRecord>>,
        time: DateTime<Utc>,
    ) -> Event {
        let (process, parent) = self.export(record);
        self.ctx.event_at(time, Payload::ProcessTracepoint {
            process,
            parent,
            subsys: msg.subsys,
            event: msg.event,
            args: msg.args,
        })
    }

    /// Copy the information of a process and its parent, holding a
    /// reference on the process meanwhile.
    fn export(&self, record: Option<&Arc<ProcessRecord>>) -> (Option<Process>, Option<Process>) {
        let Some(record) = record else {
            return (None, None);
        };
        let ctx = &self.ctx;
        ctx.cache.retain(record);
        let parent = ctx.parent_of(record);
        let exported = (
            Some(ctx.export(record)),
            parent.as_deref().map(|parent| ctx.export(parent)),
        );
        ctx.cache.release(record);
        exported
    }

    /// Attach the known names of destination addresses to socket arguments.
    fn annotate(&self, mut args: Vec<Arg>) -> Vec<Arg> {
        for arg in &mut args {
            if let Arg::Sock(sock) = arg {
                if sock.dnames.is_empty() {
                    sock.dnames = self.ctx.dns.lookup(&sock.daddr);
                }
            }
        }
        args
    }
}
