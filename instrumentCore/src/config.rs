//! Immutable per-device configuration.
//!
//! The configuration is passed to a device when it is created and never changes afterwards. It
//! can be built in code with the `with_*` methods or loaded from a TOML document, where durations
//! are given in a human readable form:
//!
//! ```
//! use instrumentcore::DeviceConfig;
//!
//! let config = DeviceConfig::from_toml_str(
//!     r#"
//!     [link]
//!     timeout = "5s"
//!     fail_safe = true
//!     retry_times = 5
//!
//!     [codec]
//!     write_separator = ";"
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.link.retry_times, 5);
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::InstrumentError;

/// Timeouts and retry policy of a [`crate::Link`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Timeout of a whole operation, also used to acquire the interface hold.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Timeout of a single backend read attempt in fail-safe mode with a wait callback.
    #[serde(with = "humantime_serde")]
    pub backend_timeout: Duration,
    /// Number of retries after a link error in fail-safe mode.
    pub retry_times: u32,
    /// Sleep between two attempts.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Retry and recover from link errors. Without fail-safe mode every link error is returned
    /// immediately.
    pub fail_safe: bool,
    /// Minimum period between two invocations of a wait callback.
    #[serde(with = "humantime_serde")]
    pub callback_period: Duration,
    /// Wait for the operation to complete after every write by default.
    pub write_sync: bool,
    /// Query sent after draining the input during recovery, e.g. `*STB?`.
    pub recovery_probe: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            timeout: Duration::from_secs(3),
            backend_timeout: Duration::from_millis(500),
            retry_times: 3,
            retry_delay: Duration::from_millis(500),
            fail_safe: false,
            callback_period: Duration::from_millis(100),
            write_sync: false,
            recovery_probe: Some("*STB?".to_string()),
        }
    }
}

impl LinkConfig {
    /// Set the operation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the single attempt timeout used in fail-safe mode.
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    /// Enable or disable fail-safe mode.
    pub fn with_fail_safe(mut self, fail_safe: bool) -> Self {
        self.fail_safe = fail_safe;
        self
    }

    /// Set the number of retries and the delay between them.
    pub fn with_retries(mut self, retry_times: u32, retry_delay: Duration) -> Self {
        self.retry_times = retry_times;
        self.retry_delay = retry_delay;
        self
    }

    /// Set the minimum period between wait callback invocations.
    pub fn with_callback_period(mut self, period: Duration) -> Self {
        self.callback_period = period;
        self
    }

    /// Set whether writes wait for the operation to complete by default.
    pub fn with_write_sync(mut self, write_sync: bool) -> Self {
        self.write_sync = write_sync;
        self
    }

    /// Set the query that is issued while recovering, `None` to only drain the input.
    pub fn with_recovery_probe(mut self, probe: Option<&str>) -> Self {
        self.recovery_probe = probe.map(str::to_string);
        self
    }
}

/// Format of floating point command arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "style", content = "digits")]
pub enum FloatFormat {
    /// Scientific notation with the given number of digits after the decimal point, e.g.
    /// `3.300000E+00`.
    Scientific(usize),
    /// Fixed point notation with the given number of digits after the decimal point.
    Fixed(usize),
}

impl Default for FloatFormat {
    fn default() -> Self {
        FloatFormat::Scientific(6)
    }
}

/// Settings of the [`crate::Codec`] and of the SCPI status handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Format of floating point arguments.
    pub float_format: FloatFormat,
    /// Token sent for `false`.
    pub false_token: String,
    /// Token sent for `true`.
    pub true_token: String,
    /// Separator between buffered commands.
    pub write_separator: String,
    /// Bits of the event status register that flag a command error.
    pub parse_error_mask: u8,
    /// Command that clears the status registers.
    pub clear_status_command: String,
    /// Query that reads the event status register.
    pub status_query: String,
    /// Query that blocks until all pending operations are complete.
    pub sync_query: String,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            float_format: FloatFormat::default(),
            false_token: "0".to_string(),
            true_token: "1".to_string(),
            write_separator: ";".to_string(),
            parse_error_mask: 0x20,
            clear_status_command: "*CLS".to_string(),
            status_query: "*ESR?".to_string(),
            sync_query: "*OPC?".to_string(),
        }
    }
}

impl CodecConfig {
    /// Set the float format.
    pub fn with_float_format(mut self, format: FloatFormat) -> Self {
        self.float_format = format;
        self
    }

    /// Set the tokens sent for `false` and `true`.
    pub fn with_bool_tokens(mut self, false_token: &str, true_token: &str) -> Self {
        self.false_token = false_token.to_string();
        self.true_token = true_token.to_string();
        self
    }

    /// Set the separator between buffered commands.
    pub fn with_write_separator(mut self, separator: &str) -> Self {
        self.write_separator = separator.to_string();
        self
    }

    /// Set the status bits that flag a command error.
    pub fn with_parse_error_mask(mut self, mask: u8) -> Self {
        self.parse_error_mask = mask;
        self
    }
}

/// Complete configuration of a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Transport and retry settings.
    pub link: LinkConfig,
    /// Codec settings.
    pub codec: CodecConfig,
}

impl DeviceConfig {
    /// Create a configuration from its parts.
    pub fn new(link: LinkConfig, codec: CodecConfig) -> Self {
        DeviceConfig { link, codec }
    }

    /// Parse a configuration from a TOML document. Missing keys fall back to the defaults.
    pub fn from_toml_str(doc: &str) -> Result<Self, InstrumentError> {
        toml::from_str(doc).map_err(|err| InstrumentError::Config(err.to_string()))
    }

    /// Read a configuration from a TOML file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, InstrumentError> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path)
            .map_err(|err| InstrumentError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&doc)
    }
}
