//! The side-by-side TIFF sink (`tiff-json`): a directory holding the frame
//! stream and its external metadata as siblings.
//!
//! Layout for one acquisition:
//!
//! ```text
//! <uri>/data.tif        frame stream (delegated to the TIFF sink)
//!       metadata.json   external metadata, written at start if non-empty
//! ```

use std::fs;
use std::path::PathBuf;

use tracing::{debug, error};

use crate::device::{DeviceState, Storage};
use crate::drivers::tiff::TiffSink;
use crate::drivers::{strip_file_scheme, validate_external_metadata, validate_parent_dir};
use crate::error::SinkError;
use crate::frame::FrameRef;
use crate::properties::{ImageShape, StorageProperties, StoragePropertyMetadata};

#[derive(Default)]
pub struct SideBySideTiffSink {
    properties: StorageProperties,
    state: DeviceState,
    tiff: TiffSink,
}

impl SideBySideTiffSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn directory(&self) -> PathBuf {
        PathBuf::from(&self.properties.uri)
    }

    fn try_set(&mut self, properties: &StorageProperties) -> Result<(), SinkError> {
        validate_external_metadata(&properties.external_metadata_json)?;
        let path = strip_file_scheme(&properties.uri);
        validate_parent_dir(path)?;
        self.properties = properties.clone();
        self.properties.set_uri(path);
        Ok(())
    }

    fn try_start(&mut self) -> Result<(), SinkError> {
        let dir = self.directory();
        if dir.exists() {
            if !dir.is_dir() {
                return Err(SinkError::NotADirectory {
                    path: self.properties.uri.clone(),
                });
            }
        } else {
            fs::create_dir_all(&dir).map_err(|source| SinkError::Write {
                path: self.properties.uri.clone(),
                source,
            })?;
        }

        if !self.properties.external_metadata_json.is_empty() {
            let metadata_path = dir.join("metadata.json");
            fs::write(&metadata_path, &self.properties.external_metadata_json).map_err(
                |source| SinkError::Write {
                    path: metadata_path.display().to_string(),
                    source,
                },
            )?;
            debug!("Wrote external metadata to {}", metadata_path.display());
        }

        let data_path = dir.join("data.tif");
        let mut inner = self.properties.clone();
        inner.set_uri(data_path.to_str().ok_or_else(|| SinkError::Write {
            path: data_path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "non-utf8 path"),
        })?);
        if self.tiff.set(&inner) != DeviceState::Armed {
            return Err(SinkError::ParentNotWritable {
                path: data_path.display().to_string(),
            });
        }
        if self.tiff.start() != DeviceState::Running {
            return Err(SinkError::Write {
                path: data_path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "tiff start failed"),
            });
        }
        Ok(())
    }
}

impl Storage for SideBySideTiffSink {
    fn set(&mut self, properties: &StorageProperties) -> DeviceState {
        match self.try_set(properties) {
            Ok(()) => {
                self.state = DeviceState::Armed;
            }
            Err(e) => {
                error!("Side-by-side TIFF sink rejected properties: {}", e);
                self.state = DeviceState::AwaitingConfiguration;
            }
        }
        self.state
    }

    fn get(&self, properties: &mut StorageProperties) {
        *properties = self.properties.clone();
    }

    fn get_meta(&self, metadata: &mut StoragePropertyMetadata) {
        self.tiff.get_meta(metadata);
    }

    fn start(&mut self) -> DeviceState {
        self.state = match self.try_start() {
            Ok(()) => DeviceState::Running,
            Err(e) => {
                error!("Side-by-side TIFF sink failed to start: {}", e);
                DeviceState::AwaitingConfiguration
            }
        };
        self.state
    }

    fn stop(&mut self) -> DeviceState {
        if self.state == DeviceState::Running {
            self.tiff.stop();
        }
        self.state = DeviceState::Armed;
        self.state
    }

    fn append(&mut self, frame: FrameRef<'_>) -> DeviceState {
        if self.state != DeviceState::Running {
            return self.state;
        }
        if self.tiff.append(frame) != DeviceState::Running {
            error!("Side-by-side TIFF sink append failed; stopping");
            self.state = DeviceState::AwaitingConfiguration;
        }
        self.state
    }

    fn reserve_image_shape(&mut self, shape: &ImageShape) {
        self.tiff.reserve_image_shape(shape);
    }
}
