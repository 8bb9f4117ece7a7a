//! The trash sink: accepts every frame and discards it.
//!
//! Useful as the default storage device and for acquisitions that only need
//! the live monitor. The filesystem is never touched.

use tracing::debug;

use crate::device::{DeviceState, Storage};
use crate::drivers::strip_file_scheme;
use crate::frame::FrameRef;
use crate::properties::{ImageShape, StorageProperties, StoragePropertyMetadata};

#[derive(Default)]
pub struct TrashSink {
    properties: StorageProperties,
    state: DeviceState,
    frames_discarded: u64,
}

impl TrashSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for TrashSink {
    fn set(&mut self, properties: &StorageProperties) -> DeviceState {
        self.properties = properties.clone();
        self.properties.set_uri(strip_file_scheme(&properties.uri));
        self.state = DeviceState::Armed;
        self.state
    }

    fn get(&self, properties: &mut StorageProperties) {
        *properties = self.properties.clone();
    }

    fn get_meta(&self, metadata: &mut StoragePropertyMetadata) {
        *metadata = StoragePropertyMetadata::default();
    }

    fn start(&mut self) -> DeviceState {
        self.frames_discarded = 0;
        self.state = DeviceState::Running;
        self.state
    }

    fn stop(&mut self) -> DeviceState {
        if self.state == DeviceState::Running {
            debug!("Trash sink discarded {} frames", self.frames_discarded);
        }
        self.state = DeviceState::Armed;
        self.state
    }

    fn append(&mut self, _frame: FrameRef<'_>) -> DeviceState {
        self.frames_discarded += 1;
        self.state
    }

    fn reserve_image_shape(&mut self, _shape: &ImageShape) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameHeader, FrameTimestamps};
    use crate::properties::SampleType;

    #[test]
    fn test_state_machine() {
        let mut sink = TrashSink::new();
        assert_eq!(sink.set(&StorageProperties::new("anything", 0)), DeviceState::Armed);
        assert_eq!(sink.start(), DeviceState::Running);
        assert_eq!(sink.stop(), DeviceState::Armed);
    }

    #[test]
    fn test_uri_round_trip_strips_scheme() {
        let mut sink = TrashSink::new();
        sink.set(&StorageProperties::new("file:///dev/null", 0));
        let mut read_back = StorageProperties::default();
        sink.get(&mut read_back);
        assert_eq!(read_back.uri, "/dev/null");
    }

    #[test]
    fn test_append_discards() {
        let shape = ImageShape::packed(8, 8, SampleType::U8);
        let record = FrameHeader::bytes_of_frame_for(&shape);
        let mut backing = vec![0u64; record / 8];
        let region =
            unsafe { std::slice::from_raw_parts_mut(backing.as_mut_ptr() as *mut u8, record) };
        FrameHeader::new(0, 0, shape, FrameTimestamps::default()).write_to(region);

        let mut sink = TrashSink::new();
        sink.set(&StorageProperties::default());
        sink.start();
        assert_eq!(sink.append(FrameRef::new(region)), DeviceState::Running);
        assert_eq!(sink.frames_discarded, 1);
    }
}
