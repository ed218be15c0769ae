//! Plays recorded kernel messages through the process manager.

use std::sync::Arc;

use anyhow::{Context, Result};
use event_logger::{EVENT_LOGGER_CONFIG, EventLogger};
use proctrace_core::{
    dns::{DNS_CONFIG, DnsCache, DnsConfig},
    event::PayloadKind,
    handlers::ProcessOptions,
    manager::ProcessManager,
    message::{KernelMessage, MessageKind},
    metrics::{ErrorKind, Metrics},
    process::{CACHE_CONFIG, CacheConfig, start_process_cache},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::mpsc,
};

use crate::config::ProctraceConfig;

/// What a replay did, printed with `--stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub messages: u64,
    pub skipped_lines: u64,
    pub errors: Vec<(ErrorKind, u64)>,
    pub processed: Vec<((MessageKind, PayloadKind), u64)>,
    pub cache_size: usize,
    pub pid_index_size: usize,
    pub dns_size: usize,
}

/// Build the cache, the name cache and the manager from the configuration.
///
/// Must be called from within a tokio runtime.
pub fn start_manager(config: &ProctraceConfig) -> Result<ProcessManager> {
    let cache_config = CacheConfig::try_from(&config.get_module_config(CACHE_CONFIG))
        .context("invalid process cache configuration")?;
    let dns_config = DnsConfig::try_from(&config.get_module_config(DNS_CONFIG))
        .context("invalid dns configuration")?;
    let options = ProcessOptions::try_from(&config.manager_config())
        .context("invalid process manager configuration")?;

    let metrics = Arc::new(Metrics::new());
    let cache = start_process_cache(cache_config, metrics.clone())
        .context("starting process cache")?;
    let dns = DnsCache::new(dns_config.capacity).context("starting dns cache")?;
    log::info!("tracking processes of node {}", options.node_name);
    Ok(ProcessManager::new(cache, dns, options, metrics))
}

/// Replay `input` (a path, or `-` for stdin) and print every event.
pub async fn run_replay(input: &str, config: &ProctraceConfig) -> Result<ReplayStats> {
    let logger_config =
        event_logger::Config::try_from(&config.get_module_config(EVENT_LOGGER_CONFIG))
            .context("invalid event logger configuration")?;
    let manager = Arc::new(start_manager(config)?);
    let logger = manager.add_listener(Arc::new(EventLogger::stdout(&logger_config)));

    let channel_size = config.channel_size()?;
    let stats = if input == "-" {
        replay(tokio::io::stdin(), manager.clone(), channel_size).await
    } else {
        let file = tokio::fs::File::open(input)
            .await
            .with_context(|| format!("opening {input}"))?;
        replay(file, manager.clone(), channel_size).await
    };

    if let Some(logger) = manager.remove_listener(logger) {
        logger.close()?;
    }
    stats
}

/// Feed every line of `input` to the manager, then purge its cache.
///
/// Stops early on Ctrl-C. Lines that are not valid messages are skipped.
pub async fn replay<R>(
    input: R,
    manager: Arc<ProcessManager>,
    channel_size: usize,
) -> Result<ReplayStats>
where
    R: AsyncRead + Unpin,
{
    let (tx, rx) = mpsc::channel(channel_size);
    let consumer = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run(rx).await })
    };

    let mut stats = ReplayStats::default();
    let mut lines = BufReader::new(input).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                log::info!("interrupted, stopping replay");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading input")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match KernelMessage::from_json(&line) {
                    Ok(msg) => {
                        stats.messages += 1;
                        if tx.send(msg).await.is_err() {
                            log::warn!("process manager stopped");
                            break;
                        }
                    }
                    Err(err) => {
                        log::warn!("skipping line: {err}");
                        stats.skipped_lines += 1;
                    }
                }
            }
        }
    }
    drop(tx);
    consumer.await.context("process manager task failed")?;

    let cache = manager.cache();
    stats.cache_size = cache.len();
    stats.pid_index_size = cache.pid_index_len();
    stats.dns_size = manager.dns().len();
    stats.errors = manager.metrics().errors();
    stats.processed = manager.metrics().processed_events();
    log::debug!("purging {} cached processes", stats.cache_size);
    cache.purge();
    manager.close()?;
    Ok(stats)
}
