use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    event::{Event, ExecId, Payload, Process},
    message::{ExecMessage, ExitMessage},
    process::ProcessRecord,
};

use super::{HandlerContext, event_cache::Deferred};

/// Creates process records on exec and drops them on exit.
#[derive(Debug, Clone)]
pub struct ExecHandler {
    ctx: Arc<HandlerContext>,
}

impl ExecHandler {
    pub(crate) fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }

    pub fn handle_exec(&self, msg: ExecMessage) -> Option<Event> {
        let ctx = &self.ctx;
        let exec_id = ctx.exec_id(msg.pid, msg.ktime);

        // Without a clone the exec replaced the image of a running process.
        let replaced = if msg.clone {
            None
        } else {
            ctx.cache
                .find_pid(msg.pid)
                .filter(|previous| *previous != exec_id)
                .and_then(|previous| ctx.cache.get(&previous).ok())
        };

        let parent_exec_id = match (&msg.parent, &replaced) {
            (Some(parent), _) => Some(ctx.exec_id(parent.pid, parent.ktime)),
            (None, Some(previous)) => Some(previous.exec_id().clone()),
            (None, None) => ctx.cache.find_pid(msg.ppid),
        };
        let parent = parent_exec_id
            .as_ref()
            .and_then(|id| ctx.cache.get(id).ok());

        let record = Arc::new(ProcessRecord::new(Process {
            exec_id: exec_id.clone(),
            pid: msg.pid,
            parent_exec_id,
            binary: msg.binary,
            arguments: msg.args,
            cwd: msg.cwd,
            ktime: msg.ktime,
            credentials: Some(msg.creds),
            namespaces: Some(msg.namespaces),
            refcnt: 0,
        }));
        ctx.cache.add(record.clone());
        ctx.cache.retain(&record);
        ctx.cache.put_pid(msg.pid, exec_id);
        if let Some(parent) = &parent {
            ctx.cache.retain(parent);
            record.hold_parent();
        }
        if let Some(previous) = replaced {
            if previous.mark_exited() {
                ctx.cache.release(&previous);
            }
        }

        Some(ctx.event(Payload::ProcessExec {
            process: ctx.export(&record),
            parent: parent.as_deref().map(|parent| ctx.export(parent)),
        }))
    }

    pub fn handle_exit(&self, msg: ExitMessage) -> Option<Event> {
        let ctx = &self.ctx;
        match ctx.resolve(msg.pid, msg.ktime) {
            Some(record) => Some(self.exit_event(msg, &record, Utc::now())),
            None => {
                if let Err(Deferred::Exit(msg)) = ctx.defer(Deferred::Exit(msg)) {
                    ctx.missing("exit", msg.pid, msg.ktime);
                }
                None
            }
        }
    }

    /// Build the exit event of `record` and drop the references its exec took.
    pub(crate) fn exit_event(
        &self,
        msg: ExitMessage,
        record: &Arc<ProcessRecord>,
        time: DateTime<Utc>,
    ) -> Event {
        let ctx = &self.ctx;
        let parent = ctx.parent_of(record);

        let event = ctx.event_at(time, Payload::ProcessExit {
            process: ctx.export(record),
            parent: parent.as_deref().map(|parent| ctx.export(parent)),
            status: msg.code,
            signal: msg.signal,
        });

        if record.mark_exited() {
            ctx.cache.release(record);
        } else {
            log::debug!("duplicate exit for process {}", record.exec_id());
        }
        if record.take_parent() {
            match &parent {
                Some(parent) => ctx.cache.release(parent),
                None => log::debug!(
                    "parent of {} left the cache before its child exited",
                    record.exec_id()
                ),
            }
        }
        event
    }

    /// Execution id an exec message would get on this node.
    pub fn exec_id(&self, pid: u32, ktime: u64) -> ExecId {
        self.ctx.exec_id(pid, ktime)
    }
}
