//! Dispatch of kernel messages and fan-out of the resulting events.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};

use crate::{
    dns::DnsCache,
    event::Event,
    handlers::{Handlers, ProcessOptions, Retry},
    message::{KernelMessage, MessageKind},
    metrics::{ErrorKind, Metrics},
    process::ProcessCache,
};

/// Describes a listener error.
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("listener is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A subscriber of normalized events.
///
/// `notify` is called synchronously by the delivering task, with the
/// listener set locked: a slow listener delays every other one.
pub trait Listener: Send + Sync {
    fn notify(&self, event: Arc<Event>) -> Result<(), ListenerError>;

    /// Called by the owner of the listener once it unregistered it.
    fn close(&self) -> Result<(), ListenerError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Receives kernel messages, hands them to the handler of their kind and
/// delivers the produced events to every registered listener.
///
/// Safe to call from several producers at once. Events coming from one
/// producer reach each listener in the order they were received.
pub struct ProcessManager {
    handlers: Handlers,
    metrics: Arc<Metrics>,
    listeners: Mutex<BTreeMap<ListenerId, Arc<dyn Listener>>>,
    next_id: AtomicU64,
}

impl ProcessManager {
    pub fn new(
        cache: ProcessCache,
        dns: DnsCache,
        options: ProcessOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            handlers: Handlers::new(cache, dns, options, metrics.clone()),
            metrics,
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn on_message(&self, msg: KernelMessage) {
        let kind = msg.kind();
        let event = match msg {
            KernelMessage::Ready => None,
            KernelMessage::Exec(exec) => self.handlers.exec().handle_exec(exec),
            KernelMessage::Exit(exit) => self.handlers.exec().handle_exit(exit),
            KernelMessage::Kprobe(kprobe) => self.handlers.tracing().handle_kprobe(kprobe),
            KernelMessage::Tracepoint(tracepoint) => {
                self.handlers.tracing().handle_tracepoint(tracepoint)
            }
            KernelMessage::Test(test) => Some(self.handlers.handle_test(test)),
            KernelMessage::Unknown { kind } => {
                log::warn!("unhandled message kind {kind}");
                self.metrics.inc(ErrorKind::UnhandledEvent);
                None
            }
        };
        if let Some(event) = event {
            self.deliver(kind, event);
        }
        // The exec may be the one deferred messages were waiting for
        if kind == MessageKind::Exec {
            self.retry_deferred(Retry::Resolve);
        }
    }

    /// Retry the messages waiting in the event cache and deliver the events
    /// they produce.
    pub fn retry_deferred(&self, retry: Retry) {
        for (kind, event) in self.handlers.retry_deferred(retry) {
            self.deliver(kind, event);
        }
    }

    /// Number of messages waiting in the event cache.
    pub fn deferred(&self) -> usize {
        self.handlers.deferred()
    }

    /// Process messages until every sender of `rx` is dropped, retrying
    /// deferred messages on every tick of the event cache interval. What is
    /// still deferred at the end is given up on.
    pub async fn run(&self, mut rx: mpsc::Receiver<KernelMessage>) {
        let period = self.options().event_cache_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.on_message(msg),
                    None => break,
                },
                _ = ticker.tick() => self.retry_deferred(Retry::Tick),
            }
        }
        self.retry_deferred(Retry::Flush);
        log::debug!("message source closed");
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(id, listener);
        log::debug!("{id} added");
        id
    }

    /// Unregister a listener. Once this returns the listener gets no more
    /// events. Closing it is left to the caller.
    pub fn remove_listener(&self, id: ListenerId) -> Option<Arc<dyn Listener>> {
        let removed = self.listeners.lock().remove(&id);
        match &removed {
            Some(_) => log::debug!("{id} removed"),
            None => log::debug!("{id} was not registered"),
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn deliver(&self, kind: MessageKind, event: Event) {
        self.metrics.processed_event(kind, event.kind());
        self.notify_listeners(Arc::new(event));
    }

    fn notify_listeners(&self, event: Arc<Event>) {
        log::trace!(target: "event", "{event}");
        let listeners = self.listeners.lock();
        for (id, listener) in listeners.iter() {
            if let Err(err) = listener.notify(event.clone()) {
                log::warn!("{id} failed to handle event: {err}");
                self.metrics.inc(ErrorKind::ListenerFailed);
            }
        }
    }

    /// Nothing to release here, the process cache is purged by its owner.
    pub fn close(&self) -> Result<(), ListenerError> {
        Ok(())
    }

    pub fn cache(&self) -> &ProcessCache {
        self.handlers.cache()
    }

    pub fn dns(&self) -> &DnsCache {
        self.handlers.dns()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn options(&self) -> &ProcessOptions {
        self.handlers.options()
    }
}

/// Listener forwarding events to a channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Arc<Event>>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Arc<Event>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Listener for ChannelListener {
    fn notify(&self, event: Arc<Event>) -> Result<(), ListenerError> {
        self.tx.send(event).map_err(|_| ListenerError::Closed)
    }
}
