pub mod config;
pub mod device;
pub mod drivers;
pub mod error;
pub mod frame;
pub mod manager;
pub mod pipeline;
pub mod properties;
pub mod reconcile;
pub(crate) mod report;
pub mod ring;
pub mod runtime;

pub use config::{ScopecamConfig, StreamProfile, SystemProfile};
pub use device::{
    Camera, DeviceHandle, DeviceIdentifier, DeviceKind, DeviceState, Driver, FrameInfo, FramePoll,
    OpenCamera, OpenStorage, Storage,
};
pub use error::{
    DeviceError, PropertyError, Result, RingError, RuntimeError, ScopecamError, SinkError,
};
pub use frame::{align_up, FrameHeader, FrameIter, FrameRef, FrameTimestamps, MappedFrames};
pub use manager::DeviceManager;
pub use pipeline::{PipelineOutcome, StreamPipeline};
pub use properties::{
    CameraProperties, CameraPropertyMetadata, DimensionKind, ImageShape, RuntimeMetadata,
    RuntimeProperties, SampleType, StorageDimension, StorageProperties, StoragePropertyMetadata,
    StreamMetadata, VideoStreamProperties, MAX_VIDEO_STREAMS,
};
pub use report::{LogRecord, Reporter};
pub use ring::{FrameRing, RingStatsSnapshot, RingWriter};
pub use runtime::{Runtime, StreamProgress};
