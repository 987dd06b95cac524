//! Configuration - segment, cache lock, role and logging settings
//!
//! Loaded from TOML; every field has a default so an empty file (or no file)
//! yields a working server/client pair on the well-known names.

use crate::error::ConfigError;
use crate::logging::{self, LogConfig, LogFormat};
use crate::segment::{DEFAULT_SEGMENT_SIZE, HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Names a config file to load instead of the defaults
pub const CONFIG_ENV: &str = "THEME_SHM_CONFIG";
/// Overrides `segment.name`
pub const SEGMENT_ENV: &str = "THEME_SHM_SEGMENT";
/// Overrides `role.mode`
pub const ROLE_ENV: &str = "THEME_SHM_ROLE";

/// Smallest segment that still fits the header, allocator metadata and one
/// list per size class
const MIN_SEGMENT_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShmConfig {
    #[serde(default)]
    pub segment: SegmentConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub role: RoleConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentConfig {
    #[serde(default = "default_segment_name")]
    pub name: String,

    #[serde(default = "default_segment_size")]
    pub size: usize,

    /// Compacted image preloaded on cold start
    #[serde(default)]
    pub image: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_semaphore_name")]
    pub semaphore: String,

    /// Effect entries reserved when the server creates the cache
    #[serde(default = "default_effect_reserve")]
    pub effect_reserve: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleConfig {
    #[serde(default)]
    pub mode: RoleMode,

    /// Executable name that makes `auto` pick the server role
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleMode {
    #[default]
    Auto,
    Server,
    Client,
}

impl RoleMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "server" => Some(Self::Server),
            "client" => Some(Self::Client),
            _ => None,
        }
    }
}

/// Resolved process role; fixed once a manager is constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sole writer, creates the segment and the cache lock
    Server,
    /// Read-only consumer
    Client,
}

impl Role {
    #[inline]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Server)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to daily rotated files here instead of stderr
    #[serde(default)]
    pub directory: Option<String>,

    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            name: default_segment_name(),
            size: default_segment_size(),
            image: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            semaphore: default_semaphore_name(),
            effect_reserve: default_effect_reserve(),
        }
    }
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            mode: RoleMode::Auto,
            server_name: default_server_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            directory: None,
            filter: None,
        }
    }
}

fn default_segment_name() -> String { "/theme-shm-segment".to_string() }
fn default_segment_size() -> usize { DEFAULT_SEGMENT_SIZE }
fn default_semaphore_name() -> String { "/theme-shm-cache".to_string() }
fn default_effect_reserve() -> usize { 20 }
fn default_server_name() -> String { "theme-server".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "compact".to_string() }

impl ShmConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// `THEME_SHM_CONFIG` file (or defaults) with env overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };

        if let Ok(name) = std::env::var(SEGMENT_ENV) {
            config.segment.name = name;
        }
        if let Ok(mode) = std::env::var(ROLE_ENV) {
            config.role.mode = RoleMode::parse(&mode)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown role {:?}", mode)))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment.size < MIN_SEGMENT_SIZE.max(HEADER_SIZE) {
            return Err(ConfigError::Invalid(format!(
                "segment size {} is below the minimum of {} bytes",
                self.segment.size, MIN_SEGMENT_SIZE
            )));
        }
        if self.segment.size >= u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "segment size {} does not fit 32-bit offsets",
                self.segment.size
            )));
        }
        for (what, name) in [("segment", &self.segment.name), ("semaphore", &self.cache.semaphore)] {
            if !is_platform_name(name) {
                return Err(ConfigError::Invalid(format!(
                    "{} name {:?} must start with '/' and contain no other '/'",
                    what, name
                )));
            }
        }
        Ok(())
    }

    /// Resolve `role.mode`; `auto` compares the running executable's name
    pub fn role(&self) -> Role {
        match self.role.mode {
            RoleMode::Server => Role::Server,
            RoleMode::Client => Role::Client,
            RoleMode::Auto => {
                let stem = std::env::current_exe()
                    .ok()
                    .and_then(|exe| exe.file_stem().map(|s| s.to_string_lossy().into_owned()));
                detect_role(stem.as_deref(), &self.role.server_name)
            }
        }
    }

    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::new()
            .with_level(logging::parse_level(&self.logging.level))
            .with_format(LogFormat::parse(&self.logging.format).unwrap_or(LogFormat::Compact));
        if let Some(directory) = &self.logging.directory {
            config = config.with_directory(directory.clone());
        }
        if let Some(filter) = &self.logging.filter {
            config = config.with_filter(filter.clone());
        }
        config
    }
}

fn detect_role(executable: Option<&str>, server_name: &str) -> Role {
    match executable {
        Some(name) if name == server_name => Role::Server,
        _ => Role::Client,
    }
}

pub(crate) fn is_platform_name(name: &str) -> bool {
    name.len() > 1 && name.starts_with('/') && !name[1..].contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ShmConfig::parse("").expect("parse");
        assert_eq!(config, ShmConfig::default());
        assert_eq!(config.segment.name, "/theme-shm-segment");
        assert_eq!(config.segment.size, 13 * 1024 * 1024);
        assert_eq!(config.cache.semaphore, "/theme-shm-cache");
        assert_eq!(config.cache.effect_reserve, 20);
        assert_eq!(config.role.mode, RoleMode::Auto);
    }

    #[test]
    fn test_partial_sections() {
        let config = ShmConfig::parse(
            r#"
            [segment]
            size = 4194304

            [role]
            mode = "server"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .expect("parse");
        assert_eq!(config.segment.size, 4 * 1024 * 1024);
        assert_eq!(config.segment.name, "/theme-shm-segment");
        assert_eq!(config.role(), Role::Server);

        let log = config.log_config();
        assert_eq!(log.level, logging::Level::DEBUG);
        assert_eq!(log.format, LogFormat::Json);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            ShmConfig::parse("[segment]\nsize = 1024"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ShmConfig::parse("[segment]\nname = \"no-slash\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ShmConfig::parse("[cache]\nsemaphore = \"/a/b\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(ShmConfig::parse("[segment"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[cache]\neffect_reserve = 4").expect("write");
        let config = ShmConfig::load(file.path()).expect("load");
        assert_eq!(config.cache.effect_reserve, 4);

        let missing = ShmConfig::load(Path::new("/nonexistent/theme-shm.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_role_detection() {
        assert_eq!(detect_role(Some("theme-server"), "theme-server"), Role::Server);
        assert_eq!(detect_role(Some("my-app"), "theme-server"), Role::Client);
        assert_eq!(detect_role(None, "theme-server"), Role::Client);
        assert!(Role::Server.is_writable());
        assert!(!Role::Client.is_writable());
        assert_eq!(RoleMode::parse("CLIENT"), Some(RoleMode::Client));
    }
}
