//! Engine configuration.
//!
//! [`TelemetryConfig`] is assembled with [`TelemetryConfigBuilder`], which
//! validates values once in [`build`](TelemetryConfigBuilder::build), or
//! loaded from an INI file:
//!
//! ```ini
//! [telemetry]
//! storage_dir = telemetry
//! max_storage_bytes = 524288
//! min_level = info
//! persistence = true
//! queue_capacity = 1024
//! overflow_policy = timeout:50
//! flush_timeout_ms = 1000
//!
//! [identity]
//! app_key = 3f2a...
//! app_name = demo
//!
//! [transport]
//! url = https://collector.example.com/logs
//! connect_timeout_ms = 5000
//! request_timeout_ms = 30000
//! header.X-Api-Key = secret
//! ```
//!
//! A relative `storage_dir` is resolved against the INI file's directory.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use ini::{Ini, Properties};
use thiserror::Error;

use crate::{
    delivery::HttpTransportConfig,
    level::FemtoLevel,
    writer::{OverflowPolicy, WriterConfig},
};

/// Default storage cap per category, split between active and overflow.
pub const DEFAULT_MAX_STORAGE_BYTES: u64 = 512 * 1024;

const HEADER_PREFIX: &str = "header.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid value {value:?} for [{section}] {key}: {reason}")]
    InvalidValue {
        section: &'static str,
        key: String,
        value: String,
        reason: String,
    },
    #[error("failed to load {}: {source}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] ini::ParseError),
}

/// Application identity placed in every batch envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub app_key: String,
    pub app_name: String,
}

impl Identity {
    pub fn new(app_key: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_name: app_name.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Directory holding category files and persisted state.
    pub storage_dir: PathBuf,
    pub max_storage_bytes: u64,
    pub min_level: FemtoLevel,
    pub persistence_enabled: bool,
    pub writer: WriterConfig,
    pub identity: Option<Identity>,
    /// Collector settings for the default HTTP transport.
    pub transport: Option<HttpTransportConfig>,
}

impl TelemetryConfig {
    pub fn builder(storage_dir: impl Into<PathBuf>) -> TelemetryConfigBuilder {
        TelemetryConfigBuilder::new(storage_dir)
    }

    /// Load and validate an INI configuration file.
    pub fn from_ini_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        builder_from_ini(&ini, base)?.build()
    }

    /// Parse INI text; relative storage paths resolve against `base_dir`.
    pub fn from_ini_str(text: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text)?;
        builder_from_ini(&ini, base_dir)?.build()
    }
}

/// Builder for [`TelemetryConfig`].
#[derive(Clone, Debug)]
pub struct TelemetryConfigBuilder {
    storage_dir: PathBuf,
    max_storage_bytes: u64,
    min_level: FemtoLevel,
    persistence_enabled: bool,
    writer: WriterConfig,
    identity: Option<Identity>,
    transport: Option<HttpTransportConfig>,
}

impl TelemetryConfigBuilder {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            max_storage_bytes: DEFAULT_MAX_STORAGE_BYTES,
            min_level: FemtoLevel::Debug,
            persistence_enabled: true,
            writer: WriterConfig::default(),
            identity: None,
            transport: None,
        }
    }

    /// Set the storage cap per category in bytes.
    pub fn with_max_storage_bytes(mut self, bytes: u64) -> Self {
        self.max_storage_bytes = bytes;
        self
    }

    pub fn with_min_level(mut self, level: FemtoLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn with_persistence_enabled(mut self, enabled: bool) -> Self {
        self.persistence_enabled = enabled;
        self
    }

    /// Set the bounded queue capacity of each category writer.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.writer.capacity = capacity;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.writer.overflow_policy = policy;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.writer.flush_timeout = timeout;
        self
    }

    pub fn with_warn_interval(mut self, interval: Duration) -> Self {
        self.writer.warn_interval = interval;
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_transport(mut self, transport: HttpTransportConfig) -> Self {
        self.transport = Some(transport);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidConfig(msg.to_owned()));
        if self.storage_dir.as_os_str().is_empty() {
            return invalid("storage_dir must not be empty");
        }
        if self.max_storage_bytes == 0 {
            return invalid("max_storage_bytes must be greater than zero");
        }
        if self.writer.capacity == 0 {
            return invalid("queue_capacity must be greater than zero");
        }
        if self.writer.flush_timeout.is_zero() {
            return invalid("flush_timeout must be greater than zero");
        }
        if let Some(identity) = &self.identity {
            if identity.app_key.trim().is_empty() {
                return invalid("app_key must not be empty");
            }
        }
        if let Some(transport) = &self.transport {
            if transport.url.trim().is_empty() {
                return invalid("transport url must not be empty");
            }
        }
        Ok(())
    }

    pub fn build(self) -> Result<TelemetryConfig, ConfigError> {
        self.validate()?;
        Ok(TelemetryConfig {
            storage_dir: self.storage_dir,
            max_storage_bytes: self.max_storage_bytes,
            min_level: self.min_level,
            persistence_enabled: self.persistence_enabled,
            writer: self.writer,
            identity: self.identity,
            transport: self.transport,
        })
    }
}

fn parse_value<T>(section: &'static str, key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|err: T::Err| ConfigError::InvalidValue {
        section,
        key: key.to_owned(),
        value: value.to_owned(),
        reason: err.to_string(),
    })
}

fn parse_millis(section: &'static str, key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_value::<u64>(section, key, value).map(Duration::from_millis)
}

fn parse_flag(section: &'static str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            section,
            key: key.to_owned(),
            value: value.to_owned(),
            reason: "expected a boolean".to_owned(),
        }),
    }
}

fn unknown_key(section: &'static str, key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section,
        key: key.to_owned(),
        value: value.to_owned(),
        reason: "unknown key".to_owned(),
    }
}

fn builder_from_ini(ini: &Ini, base_dir: &Path) -> Result<TelemetryConfigBuilder, ConfigError> {
    let telemetry = ini
        .section(Some("telemetry"))
        .ok_or_else(|| ConfigError::InvalidConfig("missing [telemetry] section".to_owned()))?;
    let storage_dir = telemetry
        .get("storage_dir")
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
        .ok_or_else(|| ConfigError::InvalidConfig("missing [telemetry] storage_dir".to_owned()))?;
    let mut builder = TelemetryConfigBuilder::new(base_dir.join(storage_dir));
    builder = apply_telemetry(builder, telemetry)?;
    if let Some(identity) = ini.section(Some("identity")) {
        builder = builder.with_identity(parse_identity(identity)?);
    }
    if let Some(transport) = ini.section(Some("transport")) {
        builder = builder.with_transport(parse_transport(transport)?);
    }
    Ok(builder)
}

fn apply_telemetry(
    mut builder: TelemetryConfigBuilder,
    props: &Properties,
) -> Result<TelemetryConfigBuilder, ConfigError> {
    const SECTION: &str = "telemetry";
    for (key, value) in props.iter() {
        builder = match key {
            "storage_dir" => builder,
            "max_storage_bytes" => {
                builder.with_max_storage_bytes(parse_value(SECTION, key, value)?)
            }
            "min_level" => builder.with_min_level(parse_value(SECTION, key, value)?),
            "persistence" => builder.with_persistence_enabled(parse_flag(SECTION, key, value)?),
            "queue_capacity" => builder.with_queue_capacity(parse_value(SECTION, key, value)?),
            "overflow_policy" => builder.with_overflow_policy(parse_value(SECTION, key, value)?),
            "flush_timeout_ms" => builder.with_flush_timeout(parse_millis(SECTION, key, value)?),
            "warn_interval_ms" => builder.with_warn_interval(parse_millis(SECTION, key, value)?),
            _ => return Err(unknown_key(SECTION, key, value)),
        };
    }
    Ok(builder)
}

fn parse_identity(props: &Properties) -> Result<Identity, ConfigError> {
    let app_key = props
        .get("app_key")
        .ok_or_else(|| ConfigError::InvalidConfig("missing [identity] app_key".to_owned()))?;
    let app_name = props.get("app_name").unwrap_or_default();
    Ok(Identity::new(app_key.trim(), app_name.trim()))
}

fn parse_transport(props: &Properties) -> Result<HttpTransportConfig, ConfigError> {
    const SECTION: &str = "transport";
    let url = props
        .get("url")
        .ok_or_else(|| ConfigError::InvalidConfig("missing [transport] url".to_owned()))?;
    let mut config = HttpTransportConfig::new(url.trim());
    for (key, value) in props.iter() {
        if let Some(header) = key.strip_prefix(HEADER_PREFIX) {
            config
                .headers
                .insert(header.to_owned(), value.trim().to_owned());
            continue;
        }
        match key {
            "url" => {}
            "connect_timeout_ms" => config.connect_timeout = parse_millis(SECTION, key, value)?,
            "request_timeout_ms" => config.request_timeout = parse_millis(SECTION, key, value)?,
            "insecure_skip_verify" => {
                config.insecure_skip_verify = parse_flag(SECTION, key, value)?
            }
            _ => return Err(unknown_key(SECTION, key, value)),
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL: &str = r#"
[telemetry]
storage_dir = spool
max_storage_bytes = 4096
min_level = warning
persistence = off
queue_capacity = 16
overflow_policy = timeout:25
flush_timeout_ms = 250

[identity]
app_key = key-1
app_name = demo

[transport]
url = https://collector.example.com/logs
request_timeout_ms = 1500
header.X-Api-Key = secret
"#;

    #[test]
    fn defaults_are_applied() {
        let config = TelemetryConfig::builder("/tmp/t").build().expect("valid");
        assert_eq!(config.max_storage_bytes, DEFAULT_MAX_STORAGE_BYTES);
        assert_eq!(config.min_level, FemtoLevel::Debug);
        assert!(config.persistence_enabled);
        assert_eq!(config.writer, WriterConfig::default());
        assert!(config.identity.is_none());
    }

    #[rstest]
    #[case(TelemetryConfig::builder("/tmp/t").with_max_storage_bytes(0), "max_storage_bytes")]
    #[case(TelemetryConfig::builder("/tmp/t").with_queue_capacity(0), "queue_capacity")]
    #[case(TelemetryConfig::builder(""), "storage_dir")]
    #[case(
        TelemetryConfig::builder("/tmp/t").with_identity(Identity::new(" ", "demo")),
        "app_key"
    )]
    #[case(
        TelemetryConfig::builder("/tmp/t").with_flush_timeout(Duration::ZERO),
        "flush_timeout"
    )]
    fn invalid_values_are_rejected(#[case] builder: TelemetryConfigBuilder, #[case] field: &str) {
        let err = builder.build().expect_err("should be rejected");
        assert!(matches!(err, ConfigError::InvalidConfig(ref msg) if msg.contains(field)));
    }

    #[test]
    fn ini_sets_every_section() {
        let config = TelemetryConfig::from_ini_str(FULL, Path::new("/srv/app")).expect("parse");
        assert_eq!(config.storage_dir, PathBuf::from("/srv/app/spool"));
        assert_eq!(config.max_storage_bytes, 4096);
        assert_eq!(config.min_level, FemtoLevel::Warn);
        assert!(!config.persistence_enabled);
        assert_eq!(config.writer.capacity, 16);
        assert_eq!(
            config.writer.overflow_policy,
            OverflowPolicy::Timeout(Duration::from_millis(25))
        );
        assert_eq!(config.writer.flush_timeout, Duration::from_millis(250));
        assert_eq!(config.identity, Some(Identity::new("key-1", "demo")));
        let transport = config.transport.expect("transport");
        assert_eq!(transport.url, "https://collector.example.com/logs");
        assert_eq!(transport.request_timeout, Duration::from_millis(1500));
        assert_eq!(
            transport.headers.get("X-Api-Key").map(String::as_str),
            Some("secret")
        );
    }

    #[test]
    fn absolute_storage_dir_is_kept() {
        let text = "[telemetry]\nstorage_dir = /var/spool/telemetry\n";
        let config = TelemetryConfig::from_ini_str(text, Path::new("/etc")).expect("parse");
        assert_eq!(config.storage_dir, PathBuf::from("/var/spool/telemetry"));
    }

    #[rstest]
    #[case("[identity]\napp_key = k\n", "[telemetry]")]
    #[case("[telemetry]\nmin_level = info\n", "storage_dir")]
    fn missing_required_settings(#[case] text: &str, #[case] needle: &str) {
        let err = TelemetryConfig::from_ini_str(text, Path::new(".")).expect_err("invalid");
        assert!(err.to_string().contains(needle), "{err}");
    }

    #[rstest]
    #[case("[telemetry]\nstorage_dir = s\nmin_level = loud\n", "min_level")]
    #[case("[telemetry]\nstorage_dir = s\npersistence = maybe\n", "persistence")]
    #[case("[telemetry]\nstorage_dir = s\noverflow_policy = spill\n", "overflow_policy")]
    #[case("[telemetry]\nstorage_dir = s\ncolour = blue\n", "colour")]
    #[case("[telemetry]\nstorage_dir = s\n[transport]\nurl = x\nretries = 3\n", "retries")]
    fn invalid_ini_values_name_the_key(#[case] text: &str, #[case] key: &str) {
        let err = TelemetryConfig::from_ini_str(text, Path::new(".")).expect_err("invalid");
        assert!(
            matches!(err, ConfigError::InvalidValue { key: ref k, .. } if k == key),
            "{err}"
        );
    }

    #[test]
    fn loads_from_file_relative_to_its_directory() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "[telemetry]\nstorage_dir = spool").expect("write");
        let config = TelemetryConfig::from_ini_file(file.path()).expect("load");
        let parent = file.path().parent().expect("parent");
        assert_eq!(config.storage_dir, parent.join("spool"));
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let err = TelemetryConfig::from_ini_file("/definitely/not/here.ini").expect_err("missing");
        assert!(matches!(err, ConfigError::Load { .. }));
    }
}
