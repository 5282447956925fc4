//! YAML configuration.
//!
//! Several files may be layered: every later file is merged over the earlier
//! ones key by key, so a system wide file can be refined by a local one.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::bootloader::ResetStrategy;
use crate::error::{Error, Result};

pub const CONFIG_BASENAME: &str = "picloader.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub log: LogConfig,
    pub serial: SerialConfig,
    pub device: DeviceConfig,
    pub reset: ResetConfig,
    pub timeouts: Timeouts,
    pub retries: RetryPolicy,
    pub flash: FlashConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct LogConfig {
    /// off, error, warn, info, debug or trace
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SerialConfig {
    pub port: Option<String>,
    pub baud: u32,
    /// Port whose DTR line drives the reset, when it is not the data port
    pub reset_port: Option<String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            port: None,
            baud: 115200,
            reset_port: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DeviceConfig {
    /// Expected device, checked against what the bootloader reports
    pub name: Option<String>,
    pub firmware: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetKind {
    /// The user resets the board by hand
    #[default]
    None,
    /// The running application jumps to the bootloader on a byte sequence
    Sequence,
    /// DTR is wired to MCLR
    Dtr,
}

/// Raw bytes, written either as a string or as a list of numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ByteSeq {
    Bytes(Vec<u8>),
    Text(String),
}

impl ByteSeq {
    /// Characters of a text sequence map to one byte each (Latin-1).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            ByteSeq::Bytes(bytes) => Ok(bytes.clone()),
            ByteSeq::Text(text) => text
                .chars()
                .map(|c| {
                    u8::try_from(c).map_err(|_| {
                        Error::Config(format!("character {:?} in {:?} is not a byte", c, text))
                    })
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ResetConfig {
    pub strategy: ResetKind,
    /// Try to identify first, and only reset if no bootloader answers
    pub probe_first: bool,
    pub sequence: Option<ByteSeq>,
    pub reply: Option<ByteSeq>,
    pub attempts: u32,
    pub dtr_pulse_ms: u64,
    pub settle_ms: u64,
}

impl Default for ResetConfig {
    fn default() -> Self {
        ResetConfig {
            strategy: ResetKind::None,
            probe_first: true,
            sequence: None,
            reply: None,
            attempts: 3,
            dtr_pulse_ms: 1000,
            settle_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Timeouts {
    pub sync_ms: u64,
    pub write_ms: u64,
    pub verify_ms: u64,
    pub reset_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            sync_ms: 1000,
            write_ms: 1000,
            verify_ms: 1000,
            reset_ms: 1000,
        }
    }
}

impl Timeouts {
    /// Same read timeout for every exchange.
    pub fn uniform(ms: u64) -> Self {
        Timeouts {
            sync_ms: ms,
            write_ms: ms,
            verify_ms: ms,
            reset_ms: ms,
        }
    }

    pub fn sync(&self) -> Duration {
        Duration::from_millis(self.sync_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    pub fn verify(&self) -> Duration {
        Duration::from_millis(self.verify_ms)
    }

    pub fn reset(&self) -> Duration {
        Duration::from_millis(self.reset_ms)
    }
}

/// Attempt budgets. Counts are total attempts, the first try included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RetryPolicy {
    pub sync_attempts: u32,
    pub page_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            sync_attempts: 3,
            page_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct FlashConfig {
    /// Read every page back after writing it
    pub verify: bool,
    pub relocate_reset_vector: bool,
    /// File that receives the completion percentage after every page
    pub progress_file: Option<PathBuf>,
}

impl Default for FlashConfig {
    fn default() -> Self {
        FlashConfig {
            verify: false,
            relocate_reset_vector: true,
            progress_file: None,
        }
    }
}

impl Config {
    /// Next to the executable, then system wide.
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            paths.push(dir.join(CONFIG_BASENAME));
        }
        paths.push(Path::new("/etc/picloader").join(CONFIG_BASENAME));
        paths
    }

    /// Merge `optional` files that exist, then every `required` file.
    pub fn load(optional: &[PathBuf], required: &[PathBuf]) -> Result<Config> {
        let mut merged = Value::Null;
        let found: Vec<&PathBuf> = optional
            .iter()
            .filter(|p| p.is_file())
            .chain(required.iter())
            .collect();
        if found.is_empty() {
            log::debug!("No configuration file found, using defaults");
        }
        for path in found {
            log::info!("Loading configuration from {}...", path.display());
            let text = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("failed to read {}: {}", path.display(), e))
            })?;
            let value: Value = serde_yaml::from_str(&text)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
            merge(&mut merged, value);
        }
        Self::from_value(merged)
    }

    pub fn from_yaml_str(text: &str) -> Result<Config> {
        let value: Value =
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Config> {
        let config: Config = if value.is_null() {
            Config::default()
        } else {
            serde_yaml::from_value(value).map_err(|e| Error::Config(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retries.sync_attempts == 0 || self.retries.page_attempts == 0 {
            return Err(Error::Config("retry attempts must be at least 1".into()));
        }
        if self.reset.attempts == 0 {
            return Err(Error::Config("reset attempts must be at least 1".into()));
        }
        let t = &self.timeouts;
        if [t.sync_ms, t.write_ms, t.verify_ms, t.reset_ms].contains(&0) {
            return Err(Error::Config("timeouts must be greater than zero".into()));
        }
        if self.serial.baud == 0 {
            return Err(Error::Config("baud rate must be greater than zero".into()));
        }
        if self.reset.strategy == ResetKind::Sequence && self.reset.sequence.is_none() {
            return Err(Error::Config(
                "reset strategy 'sequence' needs reset.sequence".into(),
            ));
        }
        self.reset_strategy().map(|_| ())
    }

    /// The reset procedure the protocol engine runs.
    pub fn reset_strategy(&self) -> Result<ResetStrategy> {
        let reset = &self.reset;
        Ok(match reset.strategy {
            ResetKind::None => ResetStrategy::None,
            ResetKind::Sequence => ResetStrategy::Sequence {
                sequence: reset
                    .sequence
                    .as_ref()
                    .map(ByteSeq::to_bytes)
                    .transpose()?
                    .unwrap_or_default(),
                reply: reset.reply.as_ref().map(ByteSeq::to_bytes).transpose()?,
                attempts: reset.attempts,
                timeout: self.timeouts.reset(),
            },
            ResetKind::Dtr => ResetStrategy::Dtr {
                pulse: Duration::from_millis(reset.dtr_pulse_ms),
                settle: Duration::from_millis(reset.settle_ms),
            },
        })
    }
}

/// Recursively merge `over` into `base`, mappings key by key.
fn merge(base: &mut Value, over: Value) {
    match (base, over) {
        (_, Value::Null) => {}
        (Value::Mapping(base), Value::Mapping(over)) => {
            for (key, value) in over {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, over) => *base = over,
    }
}
