//! Leasehold Configuration System
//!
//! Listener definitions are read from a TOML file:
//!
//! ```toml
//! [logging]
//! level = "info"
//! json = false
//!
//! [[listener]]
//! identifier = "order-events"
//! queue_url = "https://sqs.eu-west-1.amazonaws.com/000000000000/order-events.fifo"
//! kind = "fifo"
//! concurrency = 5
//!
//! [listener.visibility_extender]
//! visibility_timeout_secs = 30
//! buffer_ms = 2000
//! max_duration_secs = 600
//! ```
//!
//! Every listener setting has a default matching the component defaults, so a
//! listener only needs an identifier and a queue URL. Concurrency can be
//! overridden per listener with `LEASEHOLD_<IDENTIFIER>_CONCURRENCY`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Maximum entries per batched queue call
const MAX_BATCH_SIZE: usize = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration for listener '{listener}': {reason}")]
    Invalid { listener: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Top Level
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseholdConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default, rename = "listener")]
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl LeaseholdConfig {
    /// Load, apply environment overrides and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut config = Self::from_toml_str(&contents)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;

        info!(
            path = %path.display(),
            listeners = config.listeners.len(),
            "Loaded listener configuration"
        );
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `LEASEHOLD_<IDENTIFIER>_CONCURRENCY` overrides using `lookup` to read variables
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for listener in &mut self.listeners {
            let name = concurrency_override_name(&listener.identifier);
            let Some(value) = lookup(&name) else {
                continue;
            };
            match value.trim().parse::<u32>() {
                Ok(concurrency) => {
                    info!(
                        listener = %listener.identifier,
                        concurrency,
                        "Concurrency overridden from environment"
                    );
                    listener.concurrency = concurrency;
                }
                Err(_) => warn!(
                    variable = %name,
                    value = %value,
                    "Ignoring non-numeric concurrency override"
                ),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut identifiers = HashSet::new();
        for listener in &self.listeners {
            listener.validate()?;
            if !identifiers.insert(listener.identifier.as_str()) {
                return Err(listener.invalid("identifier is used by more than one listener"));
            }
        }
        Ok(())
    }

    pub fn listener(&self, identifier: &str) -> Option<&ListenerConfig> {
        self.listeners.iter().find(|listener| listener.identifier == identifier)
    }
}

fn concurrency_override_name(identifier: &str) -> String {
    let normalized: String = identifier
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("LEASEHOLD_{}_CONCURRENCY", normalized)
}

// ============================================================================
// Listener
// ============================================================================

/// Which container preset a listener runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// Concurrent broker fed by a batching retriever
    #[default]
    Batching,
    /// Concurrent broker fed by a prefetching retriever
    Prefetching,
    /// Grouping broker keyed on the message group id
    Fifo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub identifier: String,
    pub queue_url: String,
    #[serde(default)]
    pub kind: ContainerKind,

    /// Maximum messages processed concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_concurrency_polling_rate_ms")]
    pub concurrency_polling_rate_ms: u64,
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    /// Requests to collect before a receive is issued (batching and FIFO)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batching_period_ms")]
    pub batching_period_ms: u64,

    #[serde(default = "default_desired_min_prefetched")]
    pub desired_min_prefetched_messages: usize,
    #[serde(default = "default_max_prefetched")]
    pub max_prefetched_messages: usize,

    /// Lease taken on received messages; queue default when absent
    #[serde(default)]
    pub visibility_timeout_secs: Option<u64>,
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u64,

    /// Deletes buffered before a batched delete is issued; 10, or 1 for FIFO
    /// listeners, when absent
    #[serde(default)]
    pub resolver_buffer_size: Option<usize>,
    #[serde(default = "default_resolver_buffering_time_ms")]
    pub resolver_buffering_time_ms: u64,

    /// FIFO only; defaults to the concurrency level
    #[serde(default)]
    pub max_cached_message_groups: Option<usize>,
    /// FIFO only
    #[serde(default = "default_true")]
    pub purge_group_on_error: bool,

    #[serde(default)]
    pub visibility_extender: Option<VisibilityExtenderConfig>,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl ListenerConfig {
    pub fn new(identifier: impl Into<String>, queue_url: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            queue_url: queue_url.into(),
            kind: ContainerKind::default(),
            concurrency: default_concurrency(),
            concurrency_polling_rate_ms: default_concurrency_polling_rate_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            batch_size: default_batch_size(),
            batching_period_ms: default_batching_period_ms(),
            desired_min_prefetched_messages: default_desired_min_prefetched(),
            max_prefetched_messages: default_max_prefetched(),
            visibility_timeout_secs: None,
            wait_time_secs: default_wait_time_secs(),
            resolver_buffer_size: None,
            resolver_buffering_time_ms: default_resolver_buffering_time_ms(),
            max_cached_message_groups: None,
            purge_group_on_error: true,
            visibility_extender: None,
            shutdown: ShutdownConfig::default(),
        }
    }

    pub fn concurrency_polling_rate(&self) -> Duration {
        Duration::from_millis(self.concurrency_polling_rate_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn batching_period(&self) -> Duration {
        Duration::from_millis(self.batching_period_ms)
    }

    pub fn visibility_timeout(&self) -> Option<Duration> {
        self.visibility_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn resolver_buffering_time(&self) -> Duration {
        Duration::from_millis(self.resolver_buffering_time_ms)
    }

    pub fn resolver_buffer_size(&self) -> usize {
        self.resolver_buffer_size.unwrap_or(match self.kind {
            ContainerKind::Fifo => 1,
            ContainerKind::Batching | ContainerKind::Prefetching => MAX_BATCH_SIZE,
        })
    }

    pub fn max_cached_message_groups(&self) -> usize {
        self.max_cached_message_groups
            .unwrap_or(self.concurrency as usize)
            .max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(self.invalid("identifier must not be blank"));
        }
        if self.queue_url.trim().is_empty() {
            return Err(self.invalid("queue_url must not be blank"));
        }
        if self.concurrency_polling_rate_ms == 0 {
            return Err(self.invalid("concurrency_polling_rate_ms must be positive"));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(self.invalid(format!("batch_size must be between 1 and {}", MAX_BATCH_SIZE)));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.resolver_buffer_size()) {
            return Err(self.invalid(format!(
                "resolver_buffer_size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }
        if self.wait_time_secs > 20 {
            return Err(self.invalid("wait_time_secs must not exceed 20"));
        }
        if self.kind == ContainerKind::Prefetching {
            if self.desired_min_prefetched_messages == 0 {
                return Err(self.invalid("desired_min_prefetched_messages must be positive"));
            }
            if self.max_prefetched_messages < self.desired_min_prefetched_messages {
                return Err(self.invalid(
                    "max_prefetched_messages must not be less than desired_min_prefetched_messages",
                ));
            }
        }
        if self.kind == ContainerKind::Fifo && self.shutdown.process_extra_messages == Some(true) {
            return Err(self.invalid(
                "fifo listeners cannot process extra messages on shutdown, group order would be lost",
            ));
        }
        if let Some(extender) = &self.visibility_extender {
            extender.validate().map_err(|reason| self.invalid(reason))?;
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            listener: self.identifier.clone(),
            reason: reason.into(),
        }
    }
}

/// Automatic lease extension for long running handlers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityExtenderConfig {
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_extender_buffer_ms")]
    pub buffer_ms: u64,
    pub max_duration_secs: u64,
}

impl VisibilityExtenderConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn buffer(&self) -> Duration {
        Duration::from_millis(self.buffer_ms)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.visibility_timeout_secs == 0 {
            return Err("visibility_extender.visibility_timeout_secs must be positive".to_string());
        }
        if self.buffer() >= self.visibility_timeout() {
            return Err("visibility_extender.buffer_ms must be less than the visibility timeout".to_string());
        }
        if self.max_duration_secs == 0 {
            return Err("visibility_extender.max_duration_secs must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Process messages the retriever already received; preset default when absent
    #[serde(default)]
    pub process_extra_messages: Option<bool>,
    /// FIFO only: process messages cached per group before stopping
    #[serde(default)]
    pub process_cached_messages: bool,
    /// Cancel handlers that are still running once the broker has stopped
    #[serde(default)]
    pub interrupt_message_processing: bool,
    #[serde(default = "default_component_shutdown_secs")]
    pub component_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            process_extra_messages: None,
            process_cached_messages: false,
            interrupt_message_processing: false,
            component_timeout_secs: default_component_shutdown_secs(),
        }
    }
}

impl ShutdownConfig {
    pub fn component_timeout(&self) -> Duration {
        Duration::from_secs(self.component_timeout_secs)
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }
fn default_concurrency() -> u32 { 10 }
fn default_concurrency_polling_rate_ms() -> u64 { 60_000 }
fn default_error_backoff_ms() -> u64 { 10_000 }
fn default_batch_size() -> usize { 10 }
fn default_batching_period_ms() -> u64 { 2_000 }
fn default_desired_min_prefetched() -> usize { 1 }
fn default_max_prefetched() -> usize { 10 }
fn default_wait_time_secs() -> u64 { 20 }
fn default_resolver_buffering_time_ms() -> u64 { 1_000 }
fn default_extender_buffer_ms() -> u64 { 2_000 }
fn default_component_shutdown_secs() -> u64 { 60 }
