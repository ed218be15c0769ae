use std::ffi::OsString;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::config::ProctraceConfig;

pub const NAME: &str = "proctrace";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(about = "Process lifecycle tracking for kernel event streams")]
#[clap(version = crate::metadata::VERSION)]
#[clap(disable_help_subcommand = true)]
pub struct ProctraceOpts {
    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[clap(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Replay a file of kernel messages through the process manager
    Replay(ReplayOpts),

    /// Print the effective configuration
    Config(ConfigOpts),
}

#[derive(Args, Debug, Clone)]
pub struct ReplayOpts {
    /// File with one JSON kernel message per line, `-` for stdin
    #[clap(long, short, default_value = "-")]
    pub input: String,

    #[clap(long)]
    pub config_file: Option<String>,

    /// Event output format: compact or json
    #[clap(long)]
    pub output: Option<String>,

    /// Color compact output: auto, always or never
    #[clap(long)]
    pub color: Option<String>,

    /// Print counters and store sizes once the input is consumed
    #[clap(long, default_value_t = false)]
    pub stats: bool,
}

impl ReplayOpts {
    /// Command line flags win over the configuration file.
    pub fn apply_overrides(&self, config: &mut ProctraceConfig) {
        let logger = event_logger::EVENT_LOGGER_CONFIG;
        if let Some(output) = &self.output {
            config.set(logger, "output_format", output);
        }
        if let Some(color) = &self.color {
            config.set(logger, "color", color);
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConfigOpts {
    #[clap(long)]
    pub config_file: Option<String>,
}

impl ProctraceOpts {
    pub fn override_log_level(&self) -> log::LevelFilter {
        log_level_from_verbosity_flag_count(self.verbose)
    }
}

pub fn parse_from_args() -> ProctraceOpts {
    parse_from(std::env::args_os())
}

pub fn parse_from<I, T>(args: I) -> ProctraceOpts
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    try_parse_from(args).unwrap_or_else(|e| e.exit())
}

pub fn try_parse_from<I, T>(args: I) -> Result<ProctraceOpts, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    ProctraceOpts::try_parse_from(args)
}

fn log_level_from_verbosity_flag_count(num: u8) -> log::LevelFilter {
    match num {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        2..=u8::MAX => log::LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_defaults() {
        let opts = try_parse_from(["proctrace", "replay"]).unwrap();
        assert_eq!(opts.override_log_level(), log::LevelFilter::Info);
        let Commands::Replay(replay) = opts.command else {
            panic!("expected replay");
        };
        assert_eq!(replay.input, "-");
        assert!(!replay.stats);
        assert!(replay.output.is_none());
    }

    #[test]
    fn verbosity() {
        let opts = try_parse_from(["proctrace", "-vv", "config"]).unwrap();
        assert_eq!(opts.override_log_level(), log::LevelFilter::Trace);
        let opts = try_parse_from(["proctrace", "replay", "-v", "--input", "trace.jsonl"]).unwrap();
        assert_eq!(opts.override_log_level(), log::LevelFilter::Debug);
    }

    #[test]
    fn overrides() {
        let opts = try_parse_from([
            "proctrace",
            "replay",
            "--output",
            "compact",
            "--color",
            "never",
        ])
        .unwrap();
        let Commands::Replay(replay) = opts.command else {
            panic!("expected replay");
        };
        let mut config = ProctraceConfig::default();
        replay.apply_overrides(&mut config);
        let logger = config.get_module_config(event_logger::EVENT_LOGGER_CONFIG);
        assert_eq!(logger.get_raw("output_format"), Some("compact"));
        assert_eq!(logger.get_raw("color"), Some("never"));
    }

    #[test]
    fn subcommand_required() {
        assert!(try_parse_from(["proctrace"]).is_err());
    }
}
