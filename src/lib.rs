//! Proctrace tracks the lifecycle of processes observed through kernel
//! events and turns raw kernel messages into normalized events.
//!
//! The heavy lifting is done by [`proctrace_core`]: a reference counted
//! process cache with deferred collection, and a process manager fanning
//! events out to listeners. This crate provides the `proctrace` binary
//! around it:
//!
//! - `proctrace replay --input FILE` plays a file of JSON encoded kernel
//!   messages (one per line, `-` for stdin) through the process manager and
//!   prints the resulting events with the [event logger](event_logger);
//! - `proctrace config` shows the effective configuration.
//!
//! ```sh
//! proctrace replay --input trace.jsonl --output compact --stats
//! ```
//!
//! Configuration is read from an `INI` file, one section per component.
//! See [`config::ProctraceConfig`].

pub mod cli;
pub mod config;
pub mod replay;
mod term_print;
pub mod utils;

use anyhow::Result;

use crate::{cli::Commands, term_print::TermPrintable};

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Init logger. We log from info level and above.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}

pub async fn run(options: &cli::ProctraceOpts) -> Result<()> {
    log::trace!("Proctrace options: {:?}", options);

    match &options.command {
        Commands::Replay(opts) => {
            let mut config = config::ProctraceConfig::load(opts.config_file.as_deref())?;
            opts.apply_overrides(&mut config);
            let stats = replay::run_replay(&opts.input, &config).await?;
            if opts.stats {
                stats.term_print()?;
            }
            Ok(())
        }
        Commands::Config(opts) => {
            let config = config::ProctraceConfig::load(opts.config_file.as_deref())?;
            config.get_configs().term_print()?;
            Ok(())
        }
    }
}
