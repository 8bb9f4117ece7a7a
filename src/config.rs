use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::device::DeviceKind;
use crate::error::Result;
use crate::manager::DeviceManager;
use crate::properties::{RuntimeProperties, SampleType, MAX_VIDEO_STREAMS};

/// Acquisition profile for the CLI: one entry per stream plus system knobs.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScopecamConfig {
    #[serde(default = "default_streams")]
    pub streams: Vec<StreamProfile>,

    #[serde(default)]
    pub system: SystemProfile,
}

/// One camera-to-storage stream as declared in the profile.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StreamProfile {
    /// Camera name pattern (regex against the device table)
    #[serde(default = "default_camera")]
    pub camera: String,

    /// Storage sink name pattern
    #[serde(default = "default_storage")]
    pub storage: String,

    /// Destination URI, optionally `file://`-prefixed; unused by `trash`
    #[serde(default)]
    pub uri: String,

    /// External metadata JSON saved alongside the data (sink permitting)
    #[serde(default)]
    pub external_metadata: String,

    /// Frame width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Frame height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// Pixel sample type (u8, u16, i8, i16, f32, u10, u12, u14)
    #[serde(default)]
    pub sample_type: SampleType,

    /// Exposure time in microseconds
    #[serde(default = "default_exposure_us")]
    pub exposure_time_us: f32,

    /// Binning or downsample factor
    #[serde(default = "default_binning")]
    pub binning: u8,

    /// Frames to acquire; 0 means unbounded
    #[serde(default)]
    pub frame_count: u64,

    /// Emit the mean of every N camera frames; 0 or 1 disables averaging
    #[serde(default)]
    pub frame_average_count: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemProfile {
    /// Print live progress while acquiring
    #[serde(default = "default_progress")]
    pub progress: bool,

    /// Progress poll interval in milliseconds
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

fn default_streams() -> Vec<StreamProfile> {
    vec![StreamProfile::default()]
}

fn default_camera() -> String {
    "simulated: uniform random".to_string()
}

fn default_storage() -> String {
    "trash".to_string()
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_exposure_us() -> f32 {
    10_000.0
}

fn default_binning() -> u8 {
    1
}

fn default_progress() -> bool {
    true
}

fn default_poll_ms() -> u64 {
    250
}

impl Default for StreamProfile {
    fn default() -> Self {
        Self {
            camera: default_camera(),
            storage: default_storage(),
            uri: String::new(),
            external_metadata: String::new(),
            width: default_width(),
            height: default_height(),
            sample_type: SampleType::default(),
            exposure_time_us: default_exposure_us(),
            binning: default_binning(),
            frame_count: 0,
            frame_average_count: 0,
        }
    }
}

impl Default for SystemProfile {
    fn default() -> Self {
        Self {
            progress: default_progress(),
            poll_ms: default_poll_ms(),
        }
    }
}

impl Default for ScopecamConfig {
    fn default() -> Self {
        Self {
            streams: default_streams(),
            system: SystemProfile::default(),
        }
    }
}

impl ScopecamConfig {
    /// Load configuration from the default file and environment variables.
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from_file("scopecam.toml")
    }

    /// Load configuration from a specific file path, with `SCOPECAM_*`
    /// environment variables layered on top.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading acquisition profile from: {}", path_str);

        let settings = Config::builder()
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("SCOPECAM").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Validate the profile before it touches any device.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.streams.is_empty() {
            return Err("at least one stream must be declared".to_string());
        }
        if self.streams.len() > MAX_VIDEO_STREAMS {
            return Err(format!(
                "{} streams declared, the runtime supports {}",
                self.streams.len(),
                MAX_VIDEO_STREAMS
            ));
        }
        for (index, stream) in self.streams.iter().enumerate() {
            if stream.width == 0 || stream.height == 0 {
                return Err(format!("stream {index}: frame shape cannot be empty"));
            }
            if stream.binning == 0 {
                return Err(format!("stream {index}: binning must be at least 1"));
            }
            if stream.exposure_time_us <= 0.0 {
                return Err(format!("stream {index}: exposure must be positive"));
            }
            if stream.storage != "trash" && stream.uri.is_empty() {
                return Err(format!(
                    "stream {index}: storage \"{}\" needs a destination uri",
                    stream.storage
                ));
            }
        }
        Ok(())
    }

    /// Resolve patterns against the device table and build the runtime's
    /// requested properties.
    pub fn to_properties(&self, manager: &DeviceManager) -> Result<RuntimeProperties> {
        let mut properties = RuntimeProperties::default();
        for (index, profile) in self.streams.iter().enumerate() {
            let stream = &mut properties.streams[index];
            stream.camera.identifier = manager.select(DeviceKind::Camera, &profile.camera)?;
            stream.storage.identifier = manager.select(DeviceKind::Storage, &profile.storage)?;
            stream.camera.settings.shape = (profile.width, profile.height);
            stream.camera.settings.sample_type = profile.sample_type;
            stream.camera.settings.exposure_time_us = profile.exposure_time_us;
            stream.camera.settings.binning = profile.binning;
            stream.storage.settings.set_uri(&profile.uri);
            stream
                .storage
                .settings
                .set_external_metadata(&profile.external_metadata);
            stream.max_frame_count = profile.frame_count;
            stream.frame_average_count = profile.frame_average_count;
        }
        Ok(properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = ScopecamConfig::default();
        config.validate().unwrap();
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.streams[0].camera, "simulated: uniform random");
        assert_eq!(config.streams[0].storage, "trash");
    }

    #[test]
    fn test_load_profile_from_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[[streams]]
camera = "simulated.*sin*"
storage = "raw"
uri = "out.bin"
width = 640
height = 480
sample_type = "u16"
frame_count = 100

[system]
progress = false
"#
        )
        .unwrap();

        let config = ScopecamConfig::load_from_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.streams[0].storage, "raw");
        assert_eq!(config.streams[0].sample_type, SampleType::U16);
        assert_eq!(config.streams[0].frame_count, 100);
        assert!(!config.system.progress);
        // unset fields fall back to defaults
        assert_eq!(config.streams[0].exposure_time_us, default_exposure_us());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = ScopecamConfig::default();
        config.streams[0].width = 0;
        assert!(config.validate().is_err());

        let mut config = ScopecamConfig::default();
        config.streams[0].storage = "raw".to_string();
        assert!(config.validate().is_err(), "raw without a uri must fail");

        let mut config = ScopecamConfig::default();
        config.streams = vec![StreamProfile::default(); MAX_VIDEO_STREAMS + 1];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_properties_resolves_patterns() {
        let manager = DeviceManager::with_default_drivers().unwrap();
        let mut config = ScopecamConfig::default();
        config.streams[0].camera = "simulated.*empty.*".to_string();
        config.streams[0].frame_count = 7;

        let properties = config.to_properties(&manager).unwrap();
        assert_eq!(
            properties.streams[0].camera.identifier.name,
            "simulated: empty"
        );
        assert_eq!(properties.streams[0].storage.identifier.name, "trash");
        assert_eq!(properties.streams[0].max_frame_count, 7);
        // the second stream slot stays inactive
        assert!(properties.streams[1].camera.identifier.is_unspecified());
    }

    #[test]
    fn test_profile_round_trips_through_toml() {
        let config = ScopecamConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: ScopecamConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.streams[0].camera, config.streams[0].camera);
        assert_eq!(parsed.system.poll_ms, config.system.poll_ms);
    }
}
