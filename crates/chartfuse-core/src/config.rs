//! Runtime and request configuration.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chartfuse_data::Table;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{ChartError, Result};
use crate::graph::{Scope, ScopedVariable, Variable};

pub const DEFAULT_CACHE_CAPACITY: usize = 64;
pub const DEFAULT_MEMORY_LIMIT: usize = 1 << 30;

/// Sizing of a [`crate::Runtime`]. Changing any field means building a
/// new runtime with an empty cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum cached entries; `None` is unbounded.
    pub cache_capacity: Option<usize>,
    /// Maximum estimated bytes held by the cache; `None` is unbounded.
    pub memory_limit: Option<usize>,
    /// Node computations allowed to run at once.
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_capacity: Some(DEFAULT_CACHE_CAPACITY),
            memory_limit: Some(DEFAULT_MEMORY_LIMIT),
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `CHARTFUSE_CACHE_CAPACITY`,
    /// `CHARTFUSE_MEMORY_LIMIT` and `CHARTFUSE_WORKER_THREADS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(n) = env_usize("CHARTFUSE_CACHE_CAPACITY")? {
            config.cache_capacity = Some(n);
        }
        if let Some(n) = env_usize("CHARTFUSE_MEMORY_LIMIT")? {
            config.memory_limit = Some(n);
        }
        if let Some(n) = env_usize("CHARTFUSE_WORKER_THREADS")? {
            config.worker_threads = n;
        }
        Ok(config)
    }

    pub fn with_cache_capacity(mut self, capacity: Option<usize>) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_memory_limit(mut self, limit: Option<usize>) -> Self {
        self.memory_limit = limit;
        self
    }

    pub fn with_worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| {
            ChartError::InvalidRequest(format!("{key} must be a non-negative integer, got '{raw}'"))
        }),
        Err(_) => Ok(None),
    }
}

/// Options shared by every pre-transform entry point and chart states.
#[derive(Debug, Clone)]
pub struct PreTransformOptions {
    /// IANA zone for local date parts.
    pub local_tz: String,
    /// Zone for date strings without an offset; defaults to `local_tz`.
    pub default_input_tz: Option<String>,
    /// Maximum rows in any returned dataset.
    pub row_limit: Option<usize>,
    pub preserve_interactivity: bool,
    /// Tables addressed by `table://NAME` URLs.
    pub inline_datasets: HashMap<String, Table>,
    pub keep_signals: Vec<ScopedVariable>,
    pub keep_datasets: Vec<ScopedVariable>,
}

impl Default for PreTransformOptions {
    fn default() -> Self {
        Self {
            local_tz: "UTC".to_string(),
            default_input_tz: None,
            row_limit: None,
            preserve_interactivity: true,
            inline_datasets: HashMap::new(),
            keep_signals: Vec::new(),
            keep_datasets: Vec::new(),
        }
    }
}

impl PreTransformOptions {
    pub fn new(local_tz: impl Into<String>) -> Self {
        Self {
            local_tz: local_tz.into(),
            ..Self::default()
        }
    }

    pub fn with_default_input_tz(mut self, tz: impl Into<String>) -> Self {
        self.default_input_tz = Some(tz.into());
        self
    }

    pub fn with_row_limit(mut self, limit: usize) -> Self {
        self.row_limit = Some(limit);
        self
    }

    pub fn with_preserve_interactivity(mut self, preserve: bool) -> Self {
        self.preserve_interactivity = preserve;
        self
    }

    pub fn with_inline_dataset(mut self, name: impl Into<String>, table: Table) -> Self {
        self.inline_datasets.insert(name.into(), table);
        self
    }

    pub fn with_keep_signal(mut self, name: impl Into<String>, scope: Scope) -> Self {
        self.keep_signals.push(Variable::signal(name).scoped(scope));
        self
    }

    pub fn with_keep_dataset(mut self, name: impl Into<String>, scope: Scope) -> Self {
        self.keep_datasets.push(Variable::data(name).scoped(scope));
        self
    }

    /// Validated `(local_tz, default_input_tz)` names.
    pub(crate) fn timezones(&self) -> Result<(String, String)> {
        let local = parse_tz(&self.local_tz)?;
        let input = match &self.default_input_tz {
            Some(tz) => parse_tz(tz)?,
            None => local,
        };
        Ok((local.name().to_string(), input.name().to_string()))
    }
}

fn parse_tz(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| ChartError::InvalidRequest(format!("unknown time zone '{name}'")))
}

/// Encoding of datasets pulled out of a transformed spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractFormat {
    /// Rows as JSON values.
    InlineTable,
    IpcBytes,
    #[default]
    IpcBase64,
}

impl fmt::Display for ExtractFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExtractFormat::InlineTable => "inline-table",
            ExtractFormat::IpcBytes => "ipc-bytes",
            ExtractFormat::IpcBase64 => "ipc-base64",
        })
    }
}

impl FromStr for ExtractFormat {
    type Err = ChartError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inline-table" => Ok(ExtractFormat::InlineTable),
            "ipc-bytes" => Ok(ExtractFormat::IpcBytes),
            "ipc-base64" => Ok(ExtractFormat::IpcBase64),
            other => Err(ChartError::InvalidRequest(format!(
                "unknown extract format '{other}', expected inline-table, ipc-bytes or ipc-base64"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub transform: PreTransformOptions,
    /// Datasets with at least this many rows are extracted.
    pub extract_threshold: usize,
    pub extracted_format: ExtractFormat,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            transform: PreTransformOptions::default(),
            extract_threshold: 20,
            extracted_format: ExtractFormat::default(),
        }
    }
}

impl ExtractOptions {
    pub fn new(transform: PreTransformOptions) -> Self {
        Self {
            transform,
            ..Self::default()
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.extract_threshold = threshold;
        self
    }

    pub fn with_format(mut self, format: ExtractFormat) -> Self {
        self.extracted_format = format;
        self
    }
}
