use std::{collections::HashMap, path::PathBuf};

use anyhow::{Context, Result, bail};
use proctrace_core::{config::ModuleConfig, handlers::MANAGER_CONFIG};

const DEFAULT_CHANNEL_SIZE: usize = 1000;

/// Configuration of every component, one [`ModuleConfig`] per section.
///
/// It is backed by an `INI` file, read once on creation.
#[derive(Debug, Clone, Default)]
pub struct ProctraceConfig {
    config_file: Option<PathBuf>,
    configs: HashMap<String, ModuleConfig>,
}

impl ProctraceConfig {
    /// Load `config_file` if given, otherwise start from the defaults.
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        match config_file {
            Some(config_file) => Self::with_custom_file(config_file),
            None => Ok(Self::default()),
        }
    }

    pub fn with_custom_file(config_file: &str) -> Result<Self> {
        let config_file = PathBuf::from(config_file);
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }

        let conf = ini::Ini::load_from_file(&config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;

        let mut configs: HashMap<String, ModuleConfig> = HashMap::new();
        for (section, prop) in &conf {
            if let Some(section) = section {
                let mod_config = configs.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    mod_config.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(Self {
            config_file: Some(config_file),
            configs,
        })
    }

    pub fn config_file(&self) -> Option<&PathBuf> {
        self.config_file.as_ref()
    }

    /// Configuration of a section, empty if the file does not have it.
    pub fn get_module_config(&self, module: &str) -> ModuleConfig {
        self.configs.get(module).cloned().unwrap_or_default()
    }

    /// Process manager section, with the host name as default node name.
    pub fn manager_config(&self) -> ModuleConfig {
        let mut config = self.get_module_config(MANAGER_CONFIG);
        if config.get_raw("node_name").is_none() {
            let hostname = gethostname::gethostname();
            config.insert("node_name".to_string(), hostname.to_string_lossy().into_owned());
        }
        config
    }

    /// Capacity of the channel between the message source and the manager.
    pub fn channel_size(&self) -> Result<usize> {
        let size = self
            .get_module_config(MANAGER_CONFIG)
            .with_default("channel_size", DEFAULT_CHANNEL_SIZE)?;
        if size == 0 {
            bail!("channel_size must be positive");
        }
        Ok(size)
    }

    /// All sections, sorted by name.
    pub fn get_configs(&self) -> Vec<(String, ModuleConfig)> {
        let mut configs: Vec<_> = self
            .configs
            .iter()
            .map(|(module, config)| (module.clone(), config.clone()))
            .collect();
        configs.sort_by(|a, b| a.0.cmp(&b.0));
        configs
    }

    /// Override a single value, in memory only.
    pub fn set(&mut self, module: &str, key: &str, value: &str) {
        log::debug!("Overriding configuration {}.{}={}", module, key, value);
        self.configs
            .entry(module.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
}
