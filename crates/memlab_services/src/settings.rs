//! Settings management
//!
//! ```json
//! {
//!   "profiler": { "mode": "every_nth", "report_every": 10, "granularity": "line" },
//!   "reporter": { "verbose": true, "include_unreachable": true, "show_unchanged": false }
//! }
//! ```
//!
//! Every field is optional; missing ones take their defaults.

use memlab_core::ReporterOptions;
use memlab_metrics::{Granularity, ProfileMode, ProfilerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings from {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed settings")]
    Parse(#[from] serde_json::Error),

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// All memlab settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub profiler: ProfilerSettings,
    pub reporter: ReporterSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeSetting {
    Aggregate,
    EveryNth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GranularitySetting {
    Line,
    Call,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfilerSettings {
    pub mode: ModeSetting,
    /// Calls between reports in `every_nth` mode.
    pub report_every: u64,
    pub granularity: GranularitySetting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReporterSettings {
    pub verbose: bool,
    pub include_unreachable: bool,
    pub show_unchanged: bool,
}

impl Default for ProfilerSettings {
    fn default() -> Self {
        Self {
            mode: ModeSetting::Aggregate,
            report_every: 1,
            granularity: GranularitySetting::Line,
        }
    }
}

impl Default for ReporterSettings {
    fn default() -> Self {
        let options = ReporterOptions::default();
        Self {
            verbose: false,
            include_unreachable: options.include_unreachable,
            show_unchanged: options.show_unchanged,
        }
    }
}

impl ProfilerSettings {
    pub fn to_config(&self) -> Result<ProfilerConfig, SettingsError> {
        if self.report_every == 0 {
            return Err(SettingsError::Invalid(
                "profiler.report_every must be at least 1".to_string(),
            ));
        }
        let mode = match self.mode {
            ModeSetting::Aggregate => ProfileMode::Aggregate,
            ModeSetting::EveryNth => ProfileMode::EveryNth(self.report_every),
        };
        let granularity = match self.granularity {
            GranularitySetting::Line => Granularity::Line,
            GranularitySetting::Call => Granularity::Call,
        };
        Ok(ProfilerConfig { mode, granularity })
    }
}

impl ReporterSettings {
    pub fn to_options(&self) -> ReporterOptions {
        ReporterOptions {
            include_unreachable: self.include_unreachable,
            show_unchanged: self.show_unchanged,
        }
    }
}

impl Settings {
    /// Environment variable naming a settings file.
    pub const ENV_VAR: &'static str = "MEMLAB_SETTINGS";

    pub fn from_json(text: &str) -> Result<Self, SettingsError> {
        let settings: Settings = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_json(&text)?;
        tracing::debug!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Load the file named by `MEMLAB_SETTINGS`, or defaults when it is unset.
    pub fn from_env() -> Result<Self, SettingsError> {
        match std::env::var_os(Self::ENV_VAR) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        self.profiler.to_config().map(|_| ())
    }

    pub fn to_json(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_all_defaults() {
        let settings = Settings::from_json("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.profiler.to_config().unwrap(), ProfilerConfig::default());
        assert_eq!(settings.reporter.to_options(), ReporterOptions::default());
    }

    #[test]
    fn every_nth_mode_carries_its_interval() {
        let settings = Settings::from_json(
            r#"{ "profiler": { "mode": "every_nth", "report_every": 5, "granularity": "call" } }"#,
        )
        .unwrap();
        let config = settings.profiler.to_config().unwrap();
        assert_eq!(config.mode, ProfileMode::EveryNth(5));
        assert_eq!(config.granularity, Granularity::Call);
    }

    #[test]
    fn zero_interval_is_invalid() {
        let err = Settings::from_json(r#"{ "profiler": { "report_every": 0 } }"#).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Settings::from_json(r#"{ "reporter": { "verbos": true } }"#).unwrap_err();
        assert!(matches!(err, SettingsError::Parse(_)));
    }

    #[test]
    fn reporter_flags_map_to_options() {
        let settings = Settings::from_json(
            r#"{ "reporter": {
                "verbose": true, "include_unreachable": false, "show_unchanged": true
            } }"#,
        )
        .unwrap();
        assert!(settings.reporter.verbose);
        let options = settings.reporter.to_options();
        assert!(!options.include_unreachable);
        assert!(options.show_unchanged);
    }

    #[test]
    fn json_round_trips_through_disk() {
        let mut settings = Settings::default();
        settings.profiler.mode = ModeSetting::EveryNth;
        settings.profiler.report_every = 3;

        let file = format!("memlab-settings-{}.json", std::process::id());
        let path = std::env::temp_dir().join(file);
        std::fs::write(&path, settings.to_json().unwrap()).unwrap();
        let loaded = Settings::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Settings::load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, SettingsError::Io { .. }));
    }
}
