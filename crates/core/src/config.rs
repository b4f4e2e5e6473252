//! Engine configuration
//!
//! Tunables for the uninstall drain loop, suspension batching and the
//! async notification queue. Defaults reproduce the engine's historical
//! constants; hosts that embed the engine can override them from a TOML
//! fragment.

use serde::Deserialize;

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value: {0}")]
    Invalid(&'static str),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Attempts to observe a zero usage counter before leaking the slot.
    pub drain_retries: u32,
    /// Sleep between drain attempts, in milliseconds.
    pub drain_backoff_ms: u64,
    /// Maximum IP ranges covered by one suspension window during install.
    pub max_suspend_ranges: usize,
    /// Entries unhooked per chunk by `unhook_all` and the unload reaper.
    pub unhook_chunk: usize,
    /// Capacity of the async notification queue.
    pub notify_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drain_retries: 20,
            drain_backoff_ms: 10,
            max_suspend_ranges: 10,
            unhook_chunk: 64,
            notify_queue_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_suspend_ranges == 0 {
            return Err(ConfigError::Invalid("max_suspend_ranges must be > 0"));
        }
        if self.unhook_chunk == 0 {
            return Err(ConfigError::Invalid("unhook_chunk must be > 0"));
        }
        Ok(())
    }
}
