//! Listener writing every normalized event to a terminal or any writer.

use std::{
    io::{self, IsTerminal, Write},
    str::FromStr,
    sync::Arc,
};

use parking_lot::Mutex;
use proctrace_core::{
    config::{ConfigError, ModuleConfig},
    event::Event,
    manager::{Listener, ListenerError},
};

mod compact;

pub use compact::CompactEncoder;

/// Name of the configuration section read by [`Config`].
pub const EVENT_LOGGER_CONFIG: &str = "event-logger";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    Compact,
    #[default]
    Json,
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(format: &str) -> Result<Self, Self::Err> {
        match format.to_lowercase().as_str() {
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(ConfigError::InvalidValue {
                field: String::from("output_format"),
                value: format.to_string(),
                err: String::from("Output format must be one of [compact, json]"),
            }),
        }
    }
}

/// When to color compact output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorMode {
    /// Only when writing to a terminal.
    #[default]
    Auto,
    Always,
    Never,
}

impl FromStr for ColorMode {
    type Err = ConfigError;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode.to_lowercase().as_str() {
            "auto" => Ok(ColorMode::Auto),
            "always" => Ok(ColorMode::Always),
            "never" => Ok(ColorMode::Never),
            _ => Err(ConfigError::InvalidValue {
                field: String::from("color"),
                value: mode.to_string(),
                err: String::from("Color mode must be one of [auto, always, never]"),
            }),
        }
    }
}

impl ColorMode {
    pub fn enabled(self, terminal: bool) -> bool {
        match self {
            ColorMode::Auto => terminal,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub output_format: OutputFormat,
    pub color: ColorMode,
}

impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            output_format: config.with_default("output_format", OutputFormat::default())?,
            color: config.with_default("color", ColorMode::default())?,
        })
    }
}

/// Writes one line per event.
pub struct EventLogger<W> {
    writer: Mutex<W>,
    output_format: OutputFormat,
    encoder: CompactEncoder,
}

impl EventLogger<io::Stdout> {
    pub fn stdout(config: &Config) -> Self {
        let stdout = io::stdout();
        let color = config.color.enabled(stdout.is_terminal());
        Self::new(stdout, config.output_format, color)
    }
}

impl<W: Write + Send> EventLogger<W> {
    pub fn new(writer: W, output_format: OutputFormat, color: bool) -> Self {
        Self {
            writer: Mutex::new(writer),
            output_format,
            encoder: CompactEncoder::new(color),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn process(&self, event: &Event) -> Result<(), ListenerError> {
        let line = match self.output_format {
            OutputFormat::Compact => self.encoder.encode(event),
            OutputFormat::Json => serde_json::to_string(event)?,
        };
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> Listener for EventLogger<W> {
    fn notify(&self, event: Arc<Event>) -> Result<(), ListenerError> {
        self.process(&event)
    }

    fn close(&self) -> Result<(), ListenerError> {
        log::debug!("event logger closed");
        self.writer.lock().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proctrace_core::event::Payload;

    use super::*;

    fn test_event() -> Arc<Event> {
        Arc::new(Event {
            node_name: "node".to_string(),
            time: Utc::now(),
            payload: Payload::Test {
                arg0: 1,
                arg1: 2,
                arg2: 3,
                arg3: 4,
            },
        })
    }

    #[test]
    fn json_lines() {
        let logger = EventLogger::new(Vec::new(), OutputFormat::Json, false);
        logger.notify(test_event()).unwrap();
        logger.notify(test_event()).unwrap();
        let output = String::from_utf8(logger.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        let event: Event = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(event.payload, test_event().payload);
    }

    #[test]
    fn compact_lines() {
        let logger = EventLogger::new(Vec::new(), OutputFormat::Compact, false);
        logger.notify(test_event()).unwrap();
        logger.close().unwrap();
        let output = String::from_utf8(logger.into_inner()).unwrap();
        assert_eq!(output, "🧪 test    node <unknown> 1 2 3 4\n");
    }

    #[test]
    fn config() {
        let mut module_config = ModuleConfig::default();
        assert_eq!(Config::try_from(&module_config).unwrap(), Config::default());
        module_config.insert("output_format".to_string(), "Compact".to_string());
        module_config.insert("color".to_string(), "never".to_string());
        let config = Config::try_from(&module_config).unwrap();
        assert_eq!(config.output_format, OutputFormat::Compact);
        assert_eq!(config.color, ColorMode::Never);

        module_config.insert("color".to_string(), "sometimes".to_string());
        assert!(Config::try_from(&module_config).is_err());
    }

    #[test]
    fn color_mode() {
        assert!(ColorMode::Auto.enabled(true));
        assert!(!ColorMode::Auto.enabled(false));
        assert!(ColorMode::Always.enabled(false));
        assert!(!ColorMode::Never.enabled(true));
    }
}
