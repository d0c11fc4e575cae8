//! Memlab Services Layer
//!
//! Configuration for the profiler and reporter.

pub mod settings;

pub use settings::{
    GranularitySetting, ModeSetting, ProfilerSettings, ReporterSettings, Settings, SettingsError,
};
