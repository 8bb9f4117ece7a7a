//! Device kit: the interfaces a driver exposes and the HAL wrappers the
//! runtime drives them through.
//!
//! Cameras and storage sinks share one state machine:
//! `AwaitingConfiguration -> Armed -> Running -> Armed -> Closed`, with
//! `AwaitingConfiguration` also reachable from any state when `set` rejects a
//! property record. The HAL treats that transition as "validation failed; fix
//! the properties before retrying" and guarantees the device keeps its
//! previous applied settings.

use crate::error::DeviceError;
use crate::frame::FrameRef;
use crate::properties::{
    CameraProperties, CameraPropertyMetadata, ImageShape, StorageProperties,
    StoragePropertyMetadata,
};

/// What a device is, from the manager's point of view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Unspecified; triggers default selection during reconciliation.
    #[default]
    None,
    Camera,
    Storage,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceKind::None => "None",
            DeviceKind::Camera => "Camera",
            DeviceKind::Storage => "Storage",
        };
        f.write_str(name)
    }
}

/// (kind, name) pair that uniquely names a device to the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DeviceIdentifier {
    pub kind: DeviceKind,
    pub name: String,
}

impl DeviceIdentifier {
    pub fn camera<S: Into<String>>(name: S) -> Self {
        Self {
            kind: DeviceKind::Camera,
            name: name.into(),
        }
    }

    pub fn storage<S: Into<String>>(name: S) -> Self {
        Self {
            kind: DeviceKind::Storage,
            name: name.into(),
        }
    }

    /// A default-constructed identifier means "no device named".
    pub fn is_unspecified(&self) -> bool {
        self.kind == DeviceKind::None
    }
}

impl std::fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} \"{}\"", self.kind, self.name)
    }
}

/// Shared camera/storage state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceState {
    #[default]
    AwaitingConfiguration,
    Armed,
    Running,
    Closed,
}

impl DeviceState {
    pub const fn as_str(self) -> &'static str {
        match self {
            DeviceState::AwaitingConfiguration => "AwaitingConfiguration",
            DeviceState::Armed => "Armed",
            DeviceState::Running => "Running",
            DeviceState::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-frame facts a camera reports alongside the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameInfo {
    pub shape: ImageShape,
    /// Acquisition clock, nanoseconds since the camera started.
    pub hardware_timestamp: u64,
}

/// Outcome of polling a camera for its next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePoll {
    /// A frame was written into the caller's buffer.
    Ready { nbytes: usize },
    /// No frame is due yet; yield briefly and retry.
    Again,
}

/// Capability set a camera device exposes.
pub trait Camera: Send {
    /// Apply a property record. `AwaitingConfiguration` signals rejection;
    /// the previously applied record stays in force.
    fn set(&mut self, properties: &CameraProperties) -> DeviceState;

    /// Report the applied properties, including device-chosen values.
    fn get(&self, properties: &mut CameraProperties);

    fn get_meta(&self, metadata: &mut CameraPropertyMetadata);

    /// Effective frame shape under the applied properties.
    fn shape(&self) -> ImageShape;

    fn start(&mut self) -> DeviceState;

    /// After `stop` returns, `get_frame` must not be called again until the
    /// next `start`.
    fn stop(&mut self) -> DeviceState;

    /// Fire a software trigger, if one is armed.
    fn execute_trigger(&mut self);

    /// Poll for the next frame, writing the payload into `buffer`.
    fn get_frame(
        &mut self,
        buffer: &mut [u8],
        info: &mut FrameInfo,
    ) -> Result<FramePoll, DeviceError>;
}

/// Capability set a storage device exposes.
pub trait Storage: Send {
    fn set(&mut self, properties: &StorageProperties) -> DeviceState;

    fn get(&self, properties: &mut StorageProperties);

    fn get_meta(&self, metadata: &mut StoragePropertyMetadata);

    fn start(&mut self) -> DeviceState;

    fn stop(&mut self) -> DeviceState;

    /// Append one frame record. Any state other than `Running` terminates
    /// the consumer.
    fn append(&mut self, frame: FrameRef<'_>) -> DeviceState;

    /// Called during configure, once the camera's effective shape is known.
    fn reserve_image_shape(&mut self, shape: &ImageShape);
}

/// An opened device, still untyped.
pub enum DeviceHandle {
    Camera(Box<dyn Camera>),
    Storage(Box<dyn Storage>),
}

impl DeviceHandle {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceHandle::Camera(_) => DeviceKind::Camera,
            DeviceHandle::Storage(_) => DeviceKind::Storage,
        }
    }
}

/// A driver is a factory for a fixed set of devices.
///
/// The runtime uses a static registry of built-in drivers; the capability
/// surface matches what a dynamically loaded plugin would export.
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    fn device_count(&self) -> usize;

    fn describe(&self, index: usize) -> Result<DeviceIdentifier, DeviceError>;

    fn open(&self, index: usize) -> Result<DeviceHandle, DeviceError>;

    /// Release driver-wide resources. Built-in drivers are stateless.
    fn shutdown(&self) {}
}

/// A camera bound to its identifier and tracked device state.
pub struct OpenCamera {
    pub identifier: DeviceIdentifier,
    state: DeviceState,
    inner: Box<dyn Camera>,
}

impl OpenCamera {
    pub fn new(identifier: DeviceIdentifier, inner: Box<dyn Camera>) -> Self {
        Self {
            identifier,
            state: DeviceState::AwaitingConfiguration,
            inner,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Apply properties; on rejection the device keeps its previous record.
    pub fn apply(&mut self, properties: &CameraProperties) -> Result<(), DeviceError> {
        self.state = self.inner.set(properties);
        if self.state == DeviceState::AwaitingConfiguration {
            return Err(DeviceError::ConfigurationRejected {
                name: self.identifier.name.clone(),
            });
        }
        Ok(())
    }

    /// Read back what the device actually chose.
    pub fn read_back(&self, properties: &mut CameraProperties) {
        self.inner.get(properties);
    }

    pub fn metadata(&self) -> CameraPropertyMetadata {
        let mut metadata = CameraPropertyMetadata::default();
        self.inner.get_meta(&mut metadata);
        metadata
    }

    pub fn shape(&self) -> ImageShape {
        self.inner.shape()
    }

    pub fn start(&mut self) -> Result<(), DeviceError> {
        self.state = self.inner.start();
        if self.state != DeviceState::Running {
            return Err(DeviceError::BadTransition {
                name: self.identifier.name.clone(),
                action: "start",
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), DeviceError> {
        self.state = self.inner.stop();
        if self.state != DeviceState::Armed {
            return Err(DeviceError::BadTransition {
                name: self.identifier.name.clone(),
                action: "stop",
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    pub fn execute_trigger(&mut self) {
        self.inner.execute_trigger();
    }

    pub fn get_frame(
        &mut self,
        buffer: &mut [u8],
        info: &mut FrameInfo,
    ) -> Result<FramePoll, DeviceError> {
        self.inner.get_frame(buffer, info)
    }
}

/// A storage sink bound to its identifier and tracked device state.
pub struct OpenStorage {
    pub identifier: DeviceIdentifier,
    state: DeviceState,
    inner: Box<dyn Storage>,
}

impl OpenStorage {
    pub fn new(identifier: DeviceIdentifier, inner: Box<dyn Storage>) -> Self {
        Self {
            identifier,
            state: DeviceState::AwaitingConfiguration,
            inner,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn apply(&mut self, properties: &StorageProperties) -> Result<(), DeviceError> {
        self.state = self.inner.set(properties);
        if self.state == DeviceState::AwaitingConfiguration {
            return Err(DeviceError::ConfigurationRejected {
                name: self.identifier.name.clone(),
            });
        }
        Ok(())
    }

    pub fn read_back(&self, properties: &mut StorageProperties) {
        self.inner.get(properties);
    }

    pub fn metadata(&self) -> StoragePropertyMetadata {
        let mut metadata = StoragePropertyMetadata::default();
        self.inner.get_meta(&mut metadata);
        metadata
    }

    pub fn reserve_image_shape(&mut self, shape: &ImageShape) {
        self.inner.reserve_image_shape(shape);
    }

    pub fn start(&mut self) -> Result<(), DeviceError> {
        self.state = self.inner.start();
        if self.state != DeviceState::Running {
            return Err(DeviceError::BadTransition {
                name: self.identifier.name.clone(),
                action: "start",
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), DeviceError> {
        self.state = self.inner.stop();
        if self.state != DeviceState::Armed {
            return Err(DeviceError::BadTransition {
                name: self.identifier.name.clone(),
                action: "stop",
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    /// Append one frame, tracking the sink's reported state.
    pub fn append(&mut self, frame: FrameRef<'_>) -> DeviceState {
        self.state = self.inner.append(frame);
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_equality_is_kind_and_name() {
        let a = DeviceIdentifier::camera("simulated: empty");
        let b = DeviceIdentifier::camera("simulated: empty");
        let c = DeviceIdentifier::storage("simulated: empty");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_default_identifier_is_unspecified() {
        let identifier = DeviceIdentifier::default();
        assert!(identifier.is_unspecified());
        assert_eq!(identifier.kind, DeviceKind::None);
        assert!(!DeviceIdentifier::storage("trash").is_unspecified());
    }

    #[test]
    fn test_device_state_display() {
        assert_eq!(
            DeviceState::AwaitingConfiguration.to_string(),
            "AwaitingConfiguration"
        );
        assert_eq!(DeviceState::Armed.to_string(), "Armed");
        assert_eq!(DeviceState::Running.to_string(), "Running");
        assert_eq!(DeviceState::Closed.to_string(), "Closed");
    }
}
