//! Built-in device drivers.
//!
//! The runtime registers two drivers: `simulated` (cameras) and `common`
//! (storage sinks). They are constructed fresh per `open`, carry no shared
//! state, and exercise the same capability surface a loadable plugin would.

pub mod raw;
pub mod side_by_side;
pub mod simulated;
pub mod tiff;
pub mod trash;

use std::path::Path;
use std::sync::Arc;

use crate::device::{DeviceHandle, DeviceIdentifier, Driver};
use crate::error::{DeviceError, SinkError};

pub use simulated::SimulatedDriver;

/// Driver load order defines select() tie-breaking: cameras first.
pub fn default_drivers() -> Vec<Arc<dyn Driver>> {
    vec![
        Arc::new(SimulatedDriver) as Arc<dyn Driver>,
        Arc::new(CommonStorageDriver),
    ]
}

/// The common storage driver: raw, tiff, side-by-side tiff, and trash sinks.
pub struct CommonStorageDriver;

const STORAGE_NAMES: [&str; 4] = ["raw", "tiff", "tiff-json", "trash"];

impl Driver for CommonStorageDriver {
    fn name(&self) -> &'static str {
        "common"
    }

    fn device_count(&self) -> usize {
        STORAGE_NAMES.len()
    }

    fn describe(&self, index: usize) -> Result<DeviceIdentifier, DeviceError> {
        STORAGE_NAMES
            .get(index)
            .map(|name| DeviceIdentifier::storage(*name))
            .ok_or(DeviceError::BadIndex {
                driver: "common".to_string(),
                index,
            })
    }

    fn open(&self, index: usize) -> Result<DeviceHandle, DeviceError> {
        let sink: Box<dyn crate::device::Storage> = match index {
            0 => Box::new(raw::RawSink::new()),
            1 => Box::new(tiff::TiffSink::new()),
            2 => Box::new(side_by_side::SideBySideTiffSink::new()),
            3 => Box::new(trash::TrashSink::new()),
            _ => {
                return Err(DeviceError::BadIndex {
                    driver: "common".to_string(),
                    index,
                })
            }
        };
        Ok(DeviceHandle::Storage(sink))
    }
}

/// Strip a leading `file://` scheme, if present.
///
/// Sinks accept both plain paths and `file://` URIs and report the stripped
/// form back through `get`.
pub(crate) fn strip_file_scheme(uri: &str) -> &str {
    uri.strip_prefix("file://").unwrap_or(uri)
}

/// Validate that `path` can be created: its parent directory (or the current
/// directory for bare names) must exist and be a directory.
pub(crate) fn validate_parent_dir(path: &str) -> Result<(), SinkError> {
    if path.is_empty() {
        return Err(SinkError::EmptyUri);
    }
    let parent = match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    if !parent.is_dir() {
        return Err(SinkError::ParentNotWritable {
            path: path.to_owned(),
        });
    }
    Ok(())
}

/// Shallow JSON check for external metadata: empty is fine, anything else
/// must at least look like an object.
pub(crate) fn validate_external_metadata(json: &str) -> Result<(), SinkError> {
    if json.is_empty() {
        return Ok(());
    }
    let trimmed = json.trim();
    if !trimmed.starts_with('{') || !trimmed.ends_with('}') {
        return Err(SinkError::BadMetadata {
            details: "expected a {...} object".to_string(),
        });
    }
    Ok(())
}
