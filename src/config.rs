// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.
// The capability lists end up in an immutable `Requirements` value that is
// handed to instance bootstrap and device selection.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";
pub const DEBUG_UTILS_EXTENSION: &str = "VK_EXT_debug_utils";
pub const SWAPCHAIN_EXTENSION: &str = "VK_KHR_swapchain";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub debug: DebugConfig,
    pub logging: LoggingConfig,
    pub requirements: RequirementsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan".to_string(),
            width: 1366,
            height: 768,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Require the validation layer and install the debug messenger
    pub validation: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self { validation: true }
    }
}

/// Logger settings, `filter` uses the env_logger syntax (e.g. "info,present_loop=debug")
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: Option<String>,
}

/// Layers and device extensions every candidate GPU must offer
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RequirementsConfig {
    pub layers: Vec<String>,
    pub device_extensions: Vec<String>,
}

impl Default for RequirementsConfig {
    fn default() -> Self {
        Self {
            layers: vec![VALIDATION_LAYER.to_string()],
            device_extensions: vec![SWAPCHAIN_EXTENSION.to_string()],
        }
    }
}

/// Where the configuration came from, held until the logger is running
#[derive(Debug)]
pub enum ConfigOrigin {
    File,
    Missing,
    /// The file exists but could not be read or parsed
    Invalid(anyhow::Error),
}

/// Outcome of `Config::load`. Loading happens before logging is set up, so
/// nothing is logged until `report` is called.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: Config,
    pub path: PathBuf,
    pub origin: ConfigOrigin,
}

impl LoadedConfig {
    /// Log how the configuration was obtained
    pub fn report(&self) {
        match &self.origin {
            ConfigOrigin::File => {
                log::info!("Loaded configuration from {:?}", self.path);
                log::debug!("Config: {:?}", self.config);
            }
            ConfigOrigin::Missing => {
                log::info!("Config file not found at {:?}, using defaults", self.path);
            }
            ConfigOrigin::Invalid(e) => {
                log::warn!("Failed to load {:?}: {:#}. Using defaults.", self.path, e);
            }
        }
    }
}

impl Config {
    /// Load config.toml, falling back to defaults if missing or broken
    pub fn load() -> LoadedConfig {
        Self::load_or_default("config.toml")
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> LoadedConfig {
        let path = path.as_ref().to_path_buf();

        let (config, origin) = if !path.exists() {
            (Config::default(), ConfigOrigin::Missing)
        } else {
            match Self::load_from_path(&path) {
                Ok(config) => (config, ConfigOrigin::File),
                Err(e) => (Config::default(), ConfigOrigin::Invalid(e)),
            }
        };

        LoadedConfig {
            config,
            path,
            origin,
        }
    }

    /// Read and parse a specific file
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Freeze the capability lists into the values passed down the stack
    pub fn requirements(&self) -> Requirements {
        let mut layers = Vec::new();
        let mut instance_extensions = Vec::new();

        if self.debug.validation {
            layers.extend(self.requirements.layers.iter().cloned());
            instance_extensions.push(DEBUG_UTILS_EXTENSION.to_string());
        } else {
            layers.extend(
                self.requirements
                    .layers
                    .iter()
                    .filter(|l| l.as_str() != VALIDATION_LAYER)
                    .cloned(),
            );
        }

        let mut device_extensions = self.requirements.device_extensions.clone();
        if !device_extensions.iter().any(|e| e == SWAPCHAIN_EXTENSION) {
            device_extensions.push(SWAPCHAIN_EXTENSION.to_string());
        }

        Requirements {
            layers,
            instance_extensions,
            device_extensions,
            debug_messenger: self.debug.validation,
        }
    }
}

/// Immutable capability requirements, fixed once at startup.
///
/// `instance_extensions` only holds the build-time list; the windowing
/// system's extensions are appended during instance bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirements {
    pub layers: Vec<String>,
    pub instance_extensions: Vec<String>,
    pub device_extensions: Vec<String>,
    pub debug_messenger: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.title, "Vulkan");
        assert_eq!((config.window.width, config.window.height), (1366, 768));
        assert!(config.debug.validation);
        assert!(config.logging.filter.is_none());
    }

    #[test]
    fn default_requirements() {
        let req = Config::default().requirements();
        assert_eq!(req.layers, vec![VALIDATION_LAYER]);
        assert_eq!(req.instance_extensions, vec![DEBUG_UTILS_EXTENSION]);
        assert_eq!(req.device_extensions, vec![SWAPCHAIN_EXTENSION]);
        assert!(req.debug_messenger);
    }

    #[test]
    fn disabling_validation_drops_layer_and_debug_extension() {
        let config = Config::parse(
            r#"
            [debug]
            validation = false
            "#,
        )
        .unwrap();
        let req = config.requirements();
        assert!(req.layers.is_empty());
        assert!(req.instance_extensions.is_empty());
        assert!(!req.debug_messenger);
    }

    #[test]
    fn swapchain_extension_is_always_required() {
        let config = Config::parse(
            r#"
            [window]
            title = "Present"
            width = 640

            [requirements]
            device_extensions = ["VK_KHR_maintenance1"]
            "#,
        )
        .unwrap();
        assert_eq!(config.window.title, "Present");
        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 768);

        let req = config.requirements();
        assert_eq!(req.device_extensions, vec!["VK_KHR_maintenance1", SWAPCHAIN_EXTENSION]);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window\ntitle = 3").is_err());
    }

    fn write_temp(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "present-loop-{}-{}.toml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn missing_file_gives_defaults() {
        let loaded = Config::load_or_default("does/not/exist/config.toml");
        assert!(matches!(loaded.origin, ConfigOrigin::Missing));
        assert!(loaded.config.debug.validation);
    }

    #[test]
    fn malformed_file_gives_defaults_and_keeps_the_error() {
        let path = write_temp("malformed", "[window\ntitle = 3");
        let loaded = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();

        match &loaded.origin {
            ConfigOrigin::Invalid(e) => {
                assert!(format!("{:#}", e).contains("Failed to parse config file"))
            }
            other => panic!("expected a load error, got {:?}", other),
        }
        assert_eq!(loaded.config.window.title, "Vulkan");
        assert!(loaded.config.logging.filter.is_none());
    }

    #[test]
    fn valid_file_is_used() {
        let path = write_temp(
            "valid",
            r#"
            [logging]
            filter = "debug"
            "#,
        );
        let loaded = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(loaded.origin, ConfigOrigin::File));
        assert_eq!(loaded.config.logging.filter.as_deref(), Some("debug"));
    }
}
