//! Logger configuration with environment overrides.
//!
//! Sources, lowest priority first:
//!
//! 1. built-in defaults
//! 2. a TOML file, the one named by `LEDGERLOG_CONFIG` or `ledgerlog.toml` in
//!    the working directory
//! 3. environment variables `LEDGERLOG_<KEY>`, the key upper-cased
//!    (`text_capacity` -> `LEDGERLOG_TEXT_CAPACITY`)
//!
//! ```toml
//! mode = "stderr"
//! level = "debug"
//! slots = 1024
//! text_capacity = 131072
//! idle_timeout_ms = 250
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::{fs, io};

use log::LevelFilter;
use serde::Deserialize;

use crate::queue::{DEFAULT_IDLE_TIMEOUT, DEFAULT_SLOTS, DEFAULT_TEXT_CAPACITY};

const ENV_PREFIX: &str = "LEDGERLOG_";
const CONFIG_PATH_VAR: &str = "LEDGERLOG_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "ledgerlog.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Where the builder's stream sink writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Stdout,
    Stderr,
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        if s.eq_ignore_ascii_case("stdout") {
            Ok(Mode::Stdout)
        } else if s.eq_ignore_ascii_case("stderr") {
            Ok(Mode::Stderr)
        } else {
            Err(())
        }
    }
}

/// The config file as written; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    mode: Option<Mode>,
    level: Option<String>,
    slots: Option<usize>,
    text_capacity: Option<usize>,
    idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mode: Mode,
    pub level: LevelFilter,
    pub slots: usize,
    pub text_capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Stdout,
            level: LevelFilter::Info,
            slots: DEFAULT_SLOTS,
            text_capacity: DEFAULT_TEXT_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl Config {
    /// Reads the config file (if any) and the process environment.
    ///
    /// A missing file is not an error; an unreadable or malformed one is.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_VAR).ok();
        let path = Path::new(path.as_deref().unwrap_or(DEFAULT_CONFIG_FILE));
        let text = match fs::read_to_string(path) {
            Ok(text) => Some(text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        Self::from_sources(text.as_deref(), |name| std::env::var(name).ok())
    }

    /// Builds a config from TOML text and an environment lookup.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML, unknown keys or mistyped
    /// values in the file; [`ConfigError::InvalidValue`] for a level name or
    /// environment value that does not parse.
    pub fn from_sources(
        toml_text: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file: FileConfig = match toml_text {
            Some(text) => toml::from_str(text)?,
            None => FileConfig::default(),
        };

        let mut config = Config::default();
        if let Some(mode) = file.mode {
            config.mode = mode;
        }
        if let Some(level) = file.level {
            config.level = parse("level", &level)?;
        }
        if let Some(slots) = file.slots {
            config.slots = slots;
        }
        if let Some(bytes) = file.text_capacity {
            config.text_capacity = bytes;
        }
        if let Some(ms) = file.idle_timeout_ms {
            config.idle_timeout = Duration::from_millis(ms);
        }

        let lookup = |key: &str| env(&format!("{}{}", ENV_PREFIX, key.to_ascii_uppercase()));
        if let Some(v) = lookup("mode") {
            config.mode = parse("mode", &v)?;
        }
        if let Some(v) = lookup("level") {
            config.level = parse("level", &v)?;
        }
        if let Some(v) = lookup("slots") {
            config.slots = parse("slots", &v)?;
        }
        if let Some(v) = lookup("text_capacity") {
            config.text_capacity = parse("text_capacity", &v)?;
        }
        if let Some(v) = lookup("idle_timeout_ms") {
            config.idle_timeout = Duration::from_millis(parse("idle_timeout_ms", &v)?);
        }
        Ok(config)
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_owned(),
    })
}
