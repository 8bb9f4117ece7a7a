//! The TIFF sink: one BigTIFF file, one image directory per frame.
//!
//! Each frame's acquisition metadata (frame id, both clocks, shape) is
//! embedded as a JSON string in that frame's `ImageDescription` tag, so a
//! stack can be re-associated with its timing without a side file. Signed
//! sample types ride in the unsigned container of the same width.

use std::fs::File;
use std::io::BufWriter;

use chrono::{DateTime, Utc};
use tiff::encoder::{colortype, TiffEncoder, TiffKindBig};
use tiff::tags::Tag;
use tracing::{debug, error};

use crate::device::{DeviceState, Storage};
use crate::drivers::{strip_file_scheme, validate_parent_dir};
use crate::error::SinkError;
use crate::frame::FrameRef;
use crate::properties::{ImageShape, SampleType, StorageProperties, StoragePropertyMetadata};

type BigTiffEncoder = TiffEncoder<BufWriter<File>, TiffKindBig>;

#[derive(Default)]
pub struct TiffSink {
    properties: StorageProperties,
    state: DeviceState,
    encoder: Option<BigTiffEncoder>,
    frames_appended: u64,
}

impl TiffSink {
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
        let encoder = TiffEncoder::new_big(BufWriter::new(file))?;
        debug!("TIFF sink streaming BigTIFF to {}", path);
        self.encoder = Some(encoder);
        self.frames_appended = 0;
        Ok(())
    }

    fn try_append(&mut self, frame: FrameRef<'_>) -> Result<(), SinkError> {
        let header = frame.header();
        let shape = header.shape;
        let width = shape.dims.width;
        let height = shape.dims.height * shape.dims.planes * shape.dims.channels;
        let description = frame_description(frame);
        let data = frame.data();
        let encoder = self.encoder.as_mut().expect("append on a running sink");

        match shape.sample_type {
            SampleType::U8 | SampleType::I8 => {
                let mut image = encoder.new_image::<colortype::Gray8>(width, height)?;
                image
                    .encoder()
                    .write_tag(Tag::ImageDescription, description.as_str())?;
                image.write_data(data)?;
            }
            SampleType::U16
            | SampleType::I16
            | SampleType::U10
            | SampleType::U12
            | SampleType::U14 => {
                let samples: Vec<u16> = data
                    .chunks_exact(2)
                    .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
                    .collect();
                let mut image = encoder.new_image::<colortype::Gray16>(width, height)?;
                image
                    .encoder()
                    .write_tag(Tag::ImageDescription, description.as_str())?;
                image.write_data(&samples)?;
            }
            SampleType::F32 => {
                let samples: Vec<f32> = data
                    .chunks_exact(4)
                    .map(|quad| f32::from_ne_bytes([quad[0], quad[1], quad[2], quad[3]]))
                    .collect();
                let mut image = encoder.new_image::<colortype::Gray32Float>(width, height)?;
                image
                    .encoder()
                    .write_tag(Tag::ImageDescription, description.as_str())?;
                image.write_data(&samples)?;
            }
        }
        self.frames_appended += 1;
        Ok(())
    }

    fn close(&mut self) {
        if self.encoder.take().is_some() {
            debug!(
                "TIFF sink closed {} after {} frames",
                self.properties.uri, self.frames_appended
            );
        }
    }
}

/// Per-frame JSON for the ImageDescription tag.
fn frame_description(frame: FrameRef<'_>) -> String {
    let header = frame.header();
    let system = DateTime::<Utc>::from_timestamp_nanos(header.timestamps.system as i64);
    serde_json::json!({
        "frame_id": header.frame_id,
        "stream_id": header.stream_id,
        "timestamps": {
            "hardware_ns": header.timestamps.hardware,
            "system": system.to_rfc3339(),
        },
        "shape": {
            "width": header.shape.dims.width,
            "height": header.shape.dims.height,
            "planes": header.shape.dims.planes,
            "channels": header.shape.dims.channels,
            "type": header.shape.sample_type.to_string(),
        },
    })
    .to_string()
}

impl Storage for TiffSink {
    fn set(&mut self, properties: &StorageProperties) -> DeviceState {
        match self.try_set(properties) {
            Ok(()) => {
                self.state = DeviceState::Armed;
            }
            Err(e) => {
                error!("TIFF sink rejected properties: {}", e);
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
                error!("TIFF sink failed to start: {}", e);
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
            error!("TIFF sink append failed: {}", e);
            self.close();
            self.state = DeviceState::AwaitingConfiguration;
        }
        self.state
    }

    fn reserve_image_shape(&mut self, _shape: &ImageShape) {}
}
