use std::{net::IpAddr, sync::Arc};

use crate::{
    config::{ConfigError, ModuleConfig},
    process::{CacheError, KeyedStore},
};

/// Name of the configuration section of the name cache.
pub const DNS_CONFIG: &str = "dns";

const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsConfig {
    pub capacity: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl TryFrom<&ModuleConfig> for DnsConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            capacity: config.with_default("capacity", DEFAULT_CAPACITY)?,
        })
    }
}

/// Bounded map from IP addresses to the names they were resolved from.
///
/// Filled by whoever observes name resolutions, read by the probe handlers
/// to annotate socket arguments.
#[derive(Debug, Clone)]
pub struct DnsCache {
    names: Arc<KeyedStore<IpAddr, Vec<String>>>,
}

impl DnsCache {
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        Ok(Self {
            names: Arc::new(KeyedStore::new(capacity)?),
        })
    }

    /// Record that `names` resolved to `ip`. Names already known are kept.
    pub fn insert(&self, ip: IpAddr, names: &[String]) {
        let mut known = self.names.peek(&ip).unwrap_or_default();
        for name in names {
            if !known.contains(name) {
                known.push(name.clone());
            }
        }
        self.names.put(ip, known);
    }

    pub fn lookup(&self, ip: &IpAddr) -> Vec<String> {
        self.names.get(ip).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
