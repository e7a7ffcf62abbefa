//! Processor settings, loaded from a JSON file.

use std::path::{Path, PathBuf};

use im_crypto::dh_session::{FsVersion, VersionRange};
use im_crypto::ratchet::DEFAULT_MAX_SKIP;
use im_proto::constants::{MAX_GROUP_NAME_LEN, MAX_MESSAGE_LEN};
use im_proto::validation::ContentLimits;
use im_store::{StoreError, ValidationLog};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardSecuritySettings {
    pub enabled: bool,
    /// How far one frame may move a receiving ratchet.
    #[serde(default = "default_max_skip")]
    pub max_counter_skip: u64,
    /// `"major.minor"`
    #[serde(default = "default_min_version")]
    pub min_version: String,
    #[serde(default = "default_max_version")]
    pub max_version: String,
}

fn default_max_skip() -> u64 {
    DEFAULT_MAX_SKIP
}

fn default_min_version() -> String {
    FsVersion::V1_0.to_string()
}

fn default_max_version() -> String {
    FsVersion::V1_2.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    pub max_text_bytes: usize,
    #[serde(default = "default_group_name")]
    pub max_group_name_bytes: usize,
    /// Peers processed in parallel by `process_batch`.
    pub max_batch_concurrency: usize,
}

fn default_group_name() -> usize {
    MAX_GROUP_NAME_LEN
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationLogSettings {
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorSettings {
    pub forward_security: ForwardSecuritySettings,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub validation_log: ValidationLogSettings,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_text_bytes: MAX_MESSAGE_LEN,
            max_group_name_bytes: MAX_GROUP_NAME_LEN,
            max_batch_concurrency: 8,
        }
    }
}

impl Default for ValidationLogSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            max_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            forward_security: ForwardSecuritySettings {
                enabled: true,
                max_counter_skip: DEFAULT_MAX_SKIP,
                min_version: default_min_version(),
                max_version: default_max_version(),
            },
            limits: Limits::default(),
            validation_log: ValidationLogSettings::default(),
        }
    }
}

fn parse_version(s: &str) -> Result<FsVersion, SettingsError> {
    let (major, minor) = s
        .split_once('.')
        .ok_or_else(|| SettingsError::Invalid(format!("version {s:?} is not major.minor")))?;
    let major: u8 = major
        .parse()
        .map_err(|_| SettingsError::Invalid(format!("bad major version in {s:?}")))?;
    let minor: u8 = minor
        .parse()
        .map_err(|_| SettingsError::Invalid(format!("bad minor version in {s:?}")))?;
    Ok(FsVersion(u16::from(major) << 8 | u16::from(minor)))
}

impl ProcessorSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let range = self.version_range()?;
        let supported = VersionRange::default();
        if range.min < supported.min || range.max > supported.max {
            return Err(SettingsError::Invalid(format!(
                "forward security versions {}..{} outside supported {}..{}",
                range.min, range.max, supported.min, supported.max
            )));
        }
        if self.forward_security.max_counter_skip == 0 {
            return Err(SettingsError::Invalid("max_counter_skip must be positive".into()));
        }
        if self.limits.max_text_bytes == 0 || self.limits.max_text_bytes > MAX_MESSAGE_LEN {
            return Err(SettingsError::Invalid(format!(
                "max_text_bytes must be between 1 and {MAX_MESSAGE_LEN}"
            )));
        }
        if self.limits.max_batch_concurrency == 0 {
            return Err(SettingsError::Invalid("max_batch_concurrency must be positive".into()));
        }
        if self.validation_log.enabled && self.validation_log.path.is_none() {
            return Err(SettingsError::Invalid("validation log enabled without a path".into()));
        }
        Ok(())
    }

    pub fn version_range(&self) -> Result<VersionRange, SettingsError> {
        let min = parse_version(&self.forward_security.min_version)?;
        let max = parse_version(&self.forward_security.max_version)?;
        if min > max {
            return Err(SettingsError::Invalid(format!("min version {min} above max {max}")));
        }
        Ok(VersionRange { min, max })
    }

    /// Open the configured validation log, if enabled.
    pub fn open_validation_log(&self) -> Result<Option<ValidationLog>, StoreError> {
        match (&self.validation_log.path, self.validation_log.enabled) {
            (Some(path), true) => Ok(Some(ValidationLog::open(path, self.validation_log.max_bytes)?)),
            _ => Ok(None),
        }
    }

    pub fn content_limits(&self) -> ContentLimits {
        ContentLimits {
            max_text_bytes: self.limits.max_text_bytes,
            max_group_name_bytes: self.limits.max_group_name_bytes,
        }
    }
}
