//! Property reconciliation: merge a requested stream configuration with the
//! devices that will carry it out.
//!
//! For each stream this resolves identifiers (applying the default-device
//! rules), reuses or re-opens devices, applies camera then storage settings,
//! plumbs the camera's effective shape into the sink, and writes the applied
//! values back into the caller's record so `configure` followed by
//! `get_configuration` is the identity on everything the devices did not
//! choose themselves.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::device::{DeviceKind, OpenCamera, OpenStorage};
use crate::error::Result;
use crate::frame::FrameHeader;
use crate::manager::DeviceManager;
use crate::properties::{StreamMetadata, VideoStreamProperties};

/// Camera used when a stream names a storage sink but no camera.
pub const DEFAULT_CAMERA: &str = "simulated: uniform random";
/// Sink used when a stream names a camera but no storage.
pub const DEFAULT_STORAGE: &str = "trash";

/// The opened device pair backing one stream slot.
///
/// Devices are shared with the pipeline tasks while running; the controller
/// holds the configuration lock whenever it touches them.
#[derive(Default)]
pub struct StreamDevices {
    pub camera: Option<Arc<Mutex<OpenCamera>>>,
    pub storage: Option<Arc<Mutex<OpenStorage>>>,
}

impl StreamDevices {
    pub fn is_active(&self) -> bool {
        self.camera.is_some() && self.storage.is_some()
    }

    /// Drop both devices; the drivers destroy them.
    pub fn release(&mut self) {
        self.camera = None;
        self.storage = None;
    }
}

/// Reconcile one stream's requested properties against its devices.
///
/// Returns the maximum frame record size for the ring when the stream is
/// active, `None` when both identifiers are unspecified and the stream takes
/// no part in the acquisition. On error the devices keep their previous
/// applied settings.
pub fn configure_stream(
    manager: &DeviceManager,
    devices: &mut StreamDevices,
    requested: &mut VideoStreamProperties,
    stream_index: usize,
) -> Result<Option<usize>> {
    let camera_named = !requested.camera.identifier.is_unspecified();
    let storage_named = !requested.storage.identifier.is_unspecified();

    // Default selection: a stream with only one side named gets the
    // counterpart filled in; a stream with neither stays inactive.
    let (camera_id, storage_id) = match (camera_named, storage_named) {
        (false, false) => {
            if devices.is_active() {
                debug!("[stream {}] deactivated; releasing devices", stream_index);
            }
            devices.release();
            return Ok(None);
        }
        (false, true) => (
            manager.select(DeviceKind::Camera, DEFAULT_CAMERA)?,
            manager.select(DeviceKind::Storage, &requested.storage.identifier.name)?,
        ),
        (true, false) => (
            manager.select(DeviceKind::Camera, &requested.camera.identifier.name)?,
            manager.select(DeviceKind::Storage, DEFAULT_STORAGE)?,
        ),
        (true, true) => (
            manager.select(DeviceKind::Camera, &requested.camera.identifier.name)?,
            manager.select(DeviceKind::Storage, &requested.storage.identifier.name)?,
        ),
    };

    // Reuse an open device when its identifier is unchanged; in particular,
    // switching only the storage identifier must not recreate the camera.
    let reuse_camera = devices
        .camera
        .as_ref()
        .is_some_and(|camera| camera.lock().identifier == camera_id);
    if !reuse_camera {
        if devices.camera.is_some() {
            debug!("[stream {}] replacing camera with {}", stream_index, camera_id);
        }
        devices.camera = Some(Arc::new(Mutex::new(manager.open_camera(&camera_id)?)));
    }

    let reuse_storage = devices
        .storage
        .as_ref()
        .is_some_and(|storage| storage.lock().identifier == storage_id);
    if !reuse_storage {
        if devices.storage.is_some() {
            debug!(
                "[stream {}] replacing storage with {}",
                stream_index, storage_id
            );
        }
        devices.storage = Some(Arc::new(Mutex::new(manager.open_storage(&storage_id)?)));
    }

    let camera = devices.camera.as_ref().expect("camera opened above");
    let storage = devices.storage.as_ref().expect("storage opened above");

    // Camera first: the sink needs the effective shape the camera chose.
    let shape = {
        let mut camera = camera.lock();
        camera.apply(&requested.camera.settings)?;
        camera.read_back(&mut requested.camera.settings);
        camera.shape()
    };

    {
        let mut storage = storage.lock();
        storage.apply(&requested.storage.settings)?;
        storage.read_back(&mut requested.storage.settings);
        // Reserved during configure, not start.
        storage.reserve_image_shape(&shape);
    }

    requested.camera.identifier = camera_id.clone();
    requested.storage.identifier = storage_id.clone();

    info!(
        "[stream {}] configured {} -> {} ({}x{} {})",
        stream_index,
        camera_id,
        storage_id,
        shape.dims.width,
        shape.dims.height,
        shape.sample_type
    );

    Ok(Some(FrameHeader::bytes_of_frame_for(&shape)))
}

/// Assemble the observable metadata for one stream.
pub fn stream_metadata(devices: &StreamDevices) -> StreamMetadata {
    let mut metadata = StreamMetadata::default();
    if let Some(camera) = &devices.camera {
        let camera = camera.lock();
        metadata.camera_identifier = camera.identifier.clone();
        metadata.camera = camera.metadata();
    }
    if let Some(storage) = &devices.storage {
        let storage = storage.lock();
        metadata.storage_identifier = storage.identifier.clone();
        metadata.storage = storage.metadata();
    }
    metadata
}
