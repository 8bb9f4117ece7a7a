//! The raw sink: frame records written verbatim to one file.
//!
//! The on-disk format is the concatenation of `VideoFrame` records exactly as
//! they left the ring (header + payload, padded to 8 bytes), so the file size
//! is `nframes * bytes_of_frame` for a fixed shape.

use std::fs::File;
use std::io::{BufWriter, Write};

use tracing::{debug, error};

use crate::device::{DeviceState, Storage};
use crate::drivers::{strip_file_scheme, validate_parent_dir};
use crate::error::SinkError;
use crate::frame::{FrameHeader, FrameRef};
use crate::properties::{ImageShape, StorageProperties, StoragePropertyMetadata};

#[derive(Default)]
pub struct RawSink {
    properties: StorageProperties,
    state: DeviceState,
    file: Option<BufWriter<File>>,
    bytes_written: u64,
}

impl RawSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_set(&mut self, properties: &StorageProperties) -> Result<(), SinkError> {
        let path = strip_file_scheme(&properties.uri);
        validate_parent_dir(path)?;
        self.properties = properties.clone();
        self.properties.set_uri(path);
        Ok(())
    }

    fn try_start(&mut self) -> Result<(), SinkError> {
        let path = self.properties.uri.clone();
        let file = File::create(&path).map_err(|source| SinkError::Write {
            path: path.clone(),
            source,
        })?;
        debug!(
            "Raw sink streaming to {} (frame header is {} bytes)",
            path,
            FrameHeader::SIZE
        );
        self.file = Some(BufWriter::new(file));
        self.bytes_written = 0;
        Ok(())
    }

    fn try_append(&mut self, frame: FrameRef<'_>) -> Result<(), SinkError> {
        let record = frame.as_bytes();
        let file = self.file.as_mut().expect("append on a running sink");
        file.write_all(record).map_err(|source| SinkError::Write {
            path: self.properties.uri.clone(),
            source,
        })?;
        self.bytes_written += record.len() as u64;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                error!("Raw sink flush failed for {}: {}", self.properties.uri, e);
            }
        }
    }
}

impl Storage for RawSink {
    fn set(&mut self, properties: &StorageProperties) -> DeviceState {
        match self.try_set(properties) {
            Ok(()) => {
                self.state = DeviceState::Armed;
            }
            Err(e) => {
                error!("Raw sink rejected properties: {}", e);
                self.state = DeviceState::AwaitingConfiguration;
            }
        }
        self.state
    }

    fn get(&self, properties: &mut StorageProperties) {
        *properties = self.properties.clone();
    }

    fn get_meta(&self, metadata: &mut StoragePropertyMetadata) {
        *metadata = StoragePropertyMetadata::default();
    }

    fn start(&mut self) -> DeviceState {
        self.state = match self.try_start() {
            Ok(()) => DeviceState::Running,
            Err(e) => {
                error!("Raw sink failed to start: {}", e);
                DeviceState::AwaitingConfiguration
            }
        };
        self.state
    }

    fn stop(&mut self) -> DeviceState {
        self.close();
        self.state = DeviceState::Armed;
        self.state
    }

    fn append(&mut self, frame: FrameRef<'_>) -> DeviceState {
        if self.state != DeviceState::Running {
            return self.state;
        }
        if let Err(e) = self.try_append(frame) {
            error!("Raw sink append failed: {}", e);
            self.close();
            self.state = DeviceState::AwaitingConfiguration;
        }
        self.state
    }

    fn reserve_image_shape(&mut self, _shape: &ImageShape) {}
}
