//! Property records shared by cameras, storage sinks, and the runtime.
//!
//! These are plain owned data: every string and dimension array is owned by
//! the record that carries it, so `Clone` gives the copy semantics the device
//! layer relies on (a copied record never borrows from its source). Borrowed
//! views are accepted only at API boundaries (`&str` setters) and materialized
//! into ownership immediately.

use serde::{Deserialize, Serialize};

use crate::device::DeviceIdentifier;
use crate::error::PropertyError;

/// System-wide cap on concurrently configured video streams.
pub const MAX_VIDEO_STREAMS: usize = 2;

/// Pixel sample type of a camera frame.
///
/// The packed types (`U10`/`U12`/`U14`) are transported two bytes per sample
/// with the measurement in the low bits.
///
/// `repr(u32)` because the type is embedded in the `repr(C)` frame header.
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    #[default]
    U8,
    U16,
    I8,
    I16,
    F32,
    U10,
    U12,
    U14,
}

impl SampleType {
    /// Bytes used to transport one sample.
    ///
    /// Every variant has a nonzero width; an unknown sample type is
    /// unrepresentable, so this can never silently report zero.
    pub const fn bytes(self) -> usize {
        match self {
            SampleType::U8 | SampleType::I8 => 1,
            SampleType::U16 | SampleType::I16 => 2,
            SampleType::U10 | SampleType::U12 | SampleType::U14 => 2,
            SampleType::F32 => 4,
        }
    }

    /// Bit for this type in a `supported_pixel_types` capability mask.
    pub const fn bit(self) -> u64 {
        1 << (self as u64)
    }

    pub const ALL: [SampleType; 8] = [
        SampleType::U8,
        SampleType::U16,
        SampleType::I8,
        SampleType::I16,
        SampleType::F32,
        SampleType::U10,
        SampleType::U12,
        SampleType::U14,
    ];
}

impl std::fmt::Display for SampleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SampleType::U8 => "u8",
            SampleType::U16 => "u16",
            SampleType::I8 => "i8",
            SampleType::I16 => "i16",
            SampleType::F32 => "f32",
            SampleType::U10 => "u10",
            SampleType::U12 => "u12",
            SampleType::U14 => "u14",
        };
        f.write_str(name)
    }
}

/// Pixel extents of a frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageDims {
    pub width: u32,
    pub height: u32,
    pub planes: u32,
    pub channels: u32,
}

/// Strides between samples, measured in samples.
///
/// Invariant: `plane == channels * height * row`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageStrides {
    pub pixel: u64,
    pub row: u64,
    pub plane: u64,
}

/// Shape and memory layout of one frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageShape {
    pub dims: ImageDims,
    pub strides: ImageStrides,
    pub sample_type: SampleType,
    reserved: u32,
}

impl ImageShape {
    /// Densely packed single-plane, single-channel shape.
    pub fn packed(width: u32, height: u32, sample_type: SampleType) -> Self {
        Self {
            dims: ImageDims {
                width,
                height,
                planes: 1,
                channels: 1,
            },
            strides: ImageStrides {
                pixel: 1,
                row: width as u64,
                plane: height as u64 * width as u64,
            },
            sample_type,
            reserved: 0,
        }
    }

    /// Total payload size in bytes: `strides.plane * bytes_of_type`.
    pub fn bytes_of_image(&self) -> usize {
        self.strides.plane as usize * self.sample_type.bytes()
    }
}

/// Signal edge that fires a trigger line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEdge {
    #[default]
    Rising,
    Falling,
    AnyEdge,
}

/// One trigger line binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trigger {
    pub enable: bool,
    pub line: u8,
    pub edge: TriggerEdge,
}

/// Sensor readout direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

/// Input trigger bindings of a camera.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputTriggers {
    pub acquisition_start: Trigger,
    pub frame_start: Trigger,
    pub exposure: Trigger,
}

/// Digital output line bindings of a camera.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputTriggers {
    pub exposure: Trigger,
    pub frame_start: Trigger,
    pub trigger_wait: Trigger,
}

/// Requested or applied camera settings.
///
/// Filled out to define values a camera should adopt, or populated by the
/// camera with what it actually chose (e.g. quantized exposure).
#[derive(Debug, Clone, PartialEq)]
pub struct CameraProperties {
    /// Exposure time of a frame in microseconds.
    pub exposure_time_us: f32,
    pub line_interval_us: f32,
    pub readout_direction: Direction,
    /// Binning or downsample factor applied on the sensor.
    pub binning: u8,
    pub sample_type: SampleType,
    /// Offset of the region of interest from the sensor's top-left corner,
    /// in binned pixels.
    pub offset: (u32, u32),
    /// Shape of the region of interest, in binned pixels.
    pub shape: (u32, u32),
    pub input_triggers: InputTriggers,
    pub output_triggers: OutputTriggers,
}

impl Default for CameraProperties {
    fn default() -> Self {
        Self {
            exposure_time_us: 10_000.0,
            line_interval_us: 0.0,
            readout_direction: Direction::Forward,
            binning: 1,
            sample_type: SampleType::U8,
            offset: (0, 0),
            shape: (1920, 1080),
            input_triggers: InputTriggers::default(),
            output_triggers: OutputTriggers::default(),
        }
    }
}

/// Inclusive range of acceptable values for one camera property.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PropertyRange {
    pub low: f32,
    pub high: f32,
    pub writable: bool,
}

/// Trigger capability masks: bit `i` is set if digital line `i` can be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerCapabilities {
    pub input: u8,
    pub output: u8,
}

/// Capabilities and acceptable property values reported by a camera.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraPropertyMetadata {
    pub exposure_time_us: PropertyRange,
    pub line_interval_us: PropertyRange,
    pub binning: PropertyRange,
    pub offset: (PropertyRange, PropertyRange),
    pub shape: (PropertyRange, PropertyRange),
    /// Bit `i` is 1 if `SampleType` with discriminant `i` is supported.
    pub supported_pixel_types: u64,
    /// Names of the camera's digital IO lines.
    pub digital_lines: Vec<String>,
    pub triggers: TriggersMetadata,
}

/// Per-event trigger capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggersMetadata {
    pub acquisition_start: TriggerCapabilities,
    pub frame_start: TriggerCapabilities,
    pub exposure: TriggerCapabilities,
}

/// Kind of a named storage axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionKind {
    #[default]
    Space,
    Channel,
    Time,
    Other,
}

impl std::fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DimensionKind::Space => "Spatial",
            DimensionKind::Channel => "Channel",
            DimensionKind::Time => "Time",
            DimensionKind::Other => "Other",
        };
        f.write_str(name)
    }
}

/// One named axis of a chunked/sharded storage layout.
///
/// The first dimension listed is the fastest varying; the last is the append
/// dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageDimension {
    pub name: String,
    pub kind: DimensionKind,
    /// Expected size of the full output array along this dimension.
    pub array_size_px: u32,
    /// Size of one chunk along this dimension.
    pub chunk_size_px: u32,
    /// Number of chunks in a shard along this dimension.
    pub shard_size_chunks: u32,
}

/// Requested or applied storage sink settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageProperties {
    /// Destination, optionally prefixed `file://`. Sinks report the stripped
    /// form back through `get`.
    pub uri: String,
    /// External metadata saved alongside the data, as a JSON string.
    pub external_metadata_json: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Reserved for file rollover; currently unused.
    pub first_frame_id: u32,
    /// Pixel size in microns, (x, y).
    pub pixel_scale_um: (f64, f64),
    pub dimensions: Vec<StorageDimension>,
    pub enable_multiscale: bool,
}

impl StorageProperties {
    /// New record with a destination and `dimension_count` zeroed axis slots.
    pub fn new(uri: &str, dimension_count: usize) -> Self {
        Self {
            uri: uri.to_owned(),
            dimensions: vec![StorageDimension::default(); dimension_count],
            ..Self::default()
        }
    }

    /// Replace the destination URI, taking ownership of the bytes.
    pub fn set_uri(&mut self, uri: &str) {
        self.uri = uri.to_owned();
    }

    /// Replace the external metadata JSON, taking ownership of the bytes.
    pub fn set_external_metadata(&mut self, metadata: &str) {
        self.external_metadata_json = metadata.to_owned();
    }

    /// Set both S3 credentials, taking ownership of the bytes.
    pub fn set_access_key_and_secret(&mut self, access_key_id: &str, secret_access_key: &str) {
        self.access_key_id = access_key_id.to_owned();
        self.secret_access_key = secret_access_key.to_owned();
    }

    /// Fill one axis slot.
    ///
    /// Fails, leaving the slot zeroed, when the name is empty or the index is
    /// out of range. Invalid kinds are unrepresentable in [`DimensionKind`].
    pub fn set_dimension(
        &mut self,
        index: usize,
        name: &str,
        kind: DimensionKind,
        array_size_px: u32,
        chunk_size_px: u32,
        shard_size_chunks: u32,
    ) -> std::result::Result<(), PropertyError> {
        if index >= self.dimensions.len() {
            return Err(PropertyError::DimensionIndexOutOfRange {
                index,
                count: self.dimensions.len(),
            });
        }
        if name.is_empty() {
            self.dimensions[index] = StorageDimension::default();
            return Err(PropertyError::EmptyDimensionName);
        }
        self.dimensions[index] = StorageDimension {
            name: name.to_owned(),
            kind,
            array_size_px,
            chunk_size_px,
            shard_size_chunks,
        };
        Ok(())
    }
}

/// Capability flags reported by a storage sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoragePropertyMetadata {
    pub chunking_is_supported: bool,
    pub sharding_is_supported: bool,
    pub multiscale_is_supported: bool,
    pub s3_is_supported: bool,
}

/// Camera half of a stream: which device, and what to ask of it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraSlot {
    pub identifier: DeviceIdentifier,
    pub settings: CameraProperties,
}

/// Storage half of a stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageSlot {
    pub identifier: DeviceIdentifier,
    pub settings: StorageProperties,
}

/// Configuration of one camera-to-storage stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoStreamProperties {
    pub camera: CameraSlot,
    pub storage: StorageSlot,
    /// Number of frames to acquire; 0 means unbounded.
    pub max_frame_count: u64,
    /// Emit the mean of every N camera frames; 0 or 1 disables averaging.
    pub frame_average_count: u32,
}

impl VideoStreamProperties {
    /// A stream with neither device named takes no part in an acquisition.
    pub fn is_active(&self) -> bool {
        !self.camera.identifier.is_unspecified() || !self.storage.identifier.is_unspecified()
    }
}

/// Requested or applied configuration of the whole runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeProperties {
    pub streams: [VideoStreamProperties; MAX_VIDEO_STREAMS],
}

/// Observable ranges and device-chosen values for one stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamMetadata {
    pub camera_identifier: DeviceIdentifier,
    pub camera: CameraPropertyMetadata,
    pub storage_identifier: DeviceIdentifier,
    pub storage: StoragePropertyMetadata,
}

/// Metadata for every active stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeMetadata {
    pub streams: [StreamMetadata; MAX_VIDEO_STREAMS],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_of_type_is_defined_for_all() {
        for sample_type in SampleType::ALL {
            assert!(sample_type.bytes() > 0, "{sample_type} reports zero width");
        }
        assert_eq!(SampleType::U8.bytes(), 1);
        assert_eq!(SampleType::U16.bytes(), 2);
        assert_eq!(SampleType::I8.bytes(), 1);
        assert_eq!(SampleType::I16.bytes(), 2);
        assert_eq!(SampleType::F32.bytes(), 4);
        assert_eq!(SampleType::U10.bytes(), 2);
        assert_eq!(SampleType::U12.bytes(), 2);
        assert_eq!(SampleType::U14.bytes(), 2);
    }

    #[test]
    fn test_sample_type_display_is_defined_for_all() {
        for sample_type in SampleType::ALL {
            assert!(!sample_type.to_string().is_empty());
        }
    }

    #[test]
    fn test_bytes_of_image_law() {
        for sample_type in SampleType::ALL {
            let shape = ImageShape::packed(33, 47, sample_type);
            assert_eq!(shape.strides.row, 33);
            assert_eq!(shape.strides.plane, 33 * 47);
            assert_eq!(
                shape.bytes_of_image(),
                sample_type.bytes() * shape.strides.plane as usize
            );
        }
    }

    #[test]
    fn test_packed_shape_stride_invariant() {
        let shape = ImageShape::packed(1920, 1080, SampleType::U16);
        let channels = shape.dims.channels as u64;
        let height = shape.dims.height as u64;
        assert_eq!(shape.strides.plane, channels * height * shape.strides.row);
    }

    #[test]
    fn test_storage_properties_ingestion_owns_strings() {
        let uri = String::from("file://out.tif");
        let mut props = StorageProperties::new(&uri, 0);
        drop(uri);
        assert_eq!(props.uri, "file://out.tif");

        props.set_external_metadata("{\"hello\":\"world\"}");
        props.set_access_key_and_secret("key", "secret");
        assert_eq!(props.external_metadata_json, "{\"hello\":\"world\"}");
        assert_eq!(props.access_key_id, "key");
        assert_eq!(props.secret_access_key, "secret");
    }

    #[test]
    fn test_storage_properties_copy_is_owned_and_idempotent() {
        let mut src = StorageProperties::new("out.tif", 3);
        src.set_external_metadata("{}");
        src.set_dimension(0, "x", DimensionKind::Space, 64, 64, 1)
            .unwrap();
        src.set_dimension(1, "y", DimensionKind::Space, 48, 48, 1)
            .unwrap();
        src.set_dimension(2, "t", DimensionKind::Time, 0, 32, 1)
            .unwrap();

        let dst = src.clone();
        assert_eq!(dst, src);
        let dst2 = dst.clone();
        assert_eq!(dst2, src);

        // destination owns its buffers: mutating it leaves the source alone
        let mut dst3 = dst2;
        dst3.set_uri("other.tif");
        dst3.dimensions[0].name.push('z');
        assert_eq!(src.uri, "out.tif");
        assert_eq!(src.dimensions[0].name, "x");
    }

    #[test]
    fn test_set_dimension_validation() {
        let mut props = StorageProperties::new("out.zarr", 1);

        // empty name leaves the slot zeroed
        assert_eq!(
            props.set_dimension(0, "", DimensionKind::Space, 1, 1, 1),
            Err(PropertyError::EmptyDimensionName)
        );
        assert_eq!(props.dimensions[0], StorageDimension::default());

        // out-of-range index
        assert_eq!(
            props.set_dimension(1, "x", DimensionKind::Space, 1, 1, 1),
            Err(PropertyError::DimensionIndexOutOfRange { index: 1, count: 1 })
        );

        // valid set
        props
            .set_dimension(0, "x", DimensionKind::Space, 1, 1, 1)
            .unwrap();
        assert_eq!(props.dimensions[0].name, "x");
        assert_eq!(props.dimensions[0].array_size_px, 1);
    }

    #[test]
    fn test_stream_activity() {
        let mut stream = VideoStreamProperties::default();
        assert!(!stream.is_active());

        stream.camera.identifier = DeviceIdentifier::camera("simulated: empty");
        assert!(stream.is_active());
    }

    #[test]
    fn test_sample_type_bits_are_distinct() {
        let mut mask = 0u64;
        for sample_type in SampleType::ALL {
            assert_eq!(mask & sample_type.bit(), 0);
            mask |= sample_type.bit();
        }
        assert_eq!(mask.count_ones(), SampleType::ALL.len() as u32);
    }
}
