//! Runtime settings for fault interception.
//!
//! Settings can be loaded from a TOML file with environment overrides and
//! installed once at startup. Everything that reads them afterwards goes
//! through [`current`], which falls back to [`Settings::default`] when
//! nothing was installed.

use std::path::Path;
use std::sync::OnceLock;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handler::StackPrint;

static INSTALLED: OnceLock<Settings> = OnceLock::new();

/// Errors produced while loading or installing settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file does not exist
    #[error("settings file not found: {0}")]
    FileNotFound(String),

    /// The path is not valid UTF-8
    #[error("invalid settings path: {0}")]
    InvalidPath(String),

    /// The file or environment could not be parsed
    #[error("failed to parse settings: {0}")]
    Parse(#[from] config::ConfigError),

    /// Settings were already installed for this process
    #[error("settings have already been installed")]
    AlreadyInstalled,
}

/// Fault interception settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Capture stack snapshots for wrapped faults
    pub capture_stacks: bool,
    /// Capture a stack snapshot when an error is thrown
    pub thrown_stacks: bool,
    /// Maximum number of frames kept per snapshot
    pub max_frames: usize,
    /// Let the previously installed panic hook print intercepted panics
    pub print_intercepted: bool,
    /// How the default reporter renders stacks
    pub stack_print: StackPrint,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            capture_stacks: true,
            thrown_stacks: true,
            max_frames: 64,
            print_intercepted: false,
            stack_print: StackPrint::Structured,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, with `RECOVERY__*` environment
    /// variables taking precedence.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist, the path is not valid
    /// UTF-8, or the contents do not deserialize.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use panic_recovery::settings::Settings;
    ///
    /// let settings = Settings::load("recovery.toml")?;
    /// # Ok::<(), panic_recovery::settings::SettingsError>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let path_str = path
            .to_str()
            .ok_or_else(|| SettingsError::InvalidPath(format!("{:?}", path)))?;

        if !path.exists() {
            return Err(SettingsError::FileNotFound(path_str.to_string()));
        }

        let config = Config::builder()
            .add_source(File::with_name(path_str))
            .add_source(environment())
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load settings from `RECOVERY__*` environment variables only.
    pub fn from_env() -> Result<Self, SettingsError> {
        let config = Config::builder().add_source(environment()).build()?;
        Ok(config.try_deserialize()?)
    }

    /// Render the settings as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    pub fn with_capture_stacks(mut self, enabled: bool) -> Self {
        self.capture_stacks = enabled;
        self
    }

    pub fn with_thrown_stacks(mut self, enabled: bool) -> Self {
        self.thrown_stacks = enabled;
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    pub fn with_print_intercepted(mut self, enabled: bool) -> Self {
        self.print_intercepted = enabled;
        self
    }

    pub fn with_stack_print(mut self, stack_print: StackPrint) -> Self {
        self.stack_print = stack_print;
        self
    }
}

fn environment() -> Environment {
    Environment::with_prefix("RECOVERY")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

/// Install process-wide settings.
///
/// Settings are fixed the first time they are read, so this has to run at
/// startup before any fault is intercepted. Later calls return
/// [`SettingsError::AlreadyInstalled`].
pub fn install(settings: Settings) -> Result<(), SettingsError> {
    INSTALLED
        .set(settings)
        .map_err(|_| SettingsError::AlreadyInstalled)?;
    tracing::debug!(settings = ?current(), "installed recovery settings");
    Ok(())
}

/// The installed settings, or the defaults.
pub fn current() -> &'static Settings {
    INSTALLED.get_or_init(Settings::default)
}
