//! Device manager: one flat table over every loaded driver's devices.

use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::device::{
    DeviceHandle, DeviceIdentifier, DeviceKind, Driver, OpenCamera, OpenStorage,
};
use crate::error::DeviceError;

struct TableEntry {
    identifier: DeviceIdentifier,
    driver: usize,
    index: usize,
}

/// Registry of every device the loaded drivers expose.
///
/// The table is built at init and is read-only afterwards; entries are
/// ordered by driver load order, then by each driver's enumeration order,
/// which is also the tie-break order for [`DeviceManager::select`].
pub struct DeviceManager {
    drivers: Vec<Arc<dyn Driver>>,
    table: Vec<TableEntry>,
}

impl DeviceManager {
    pub fn new(drivers: Vec<Arc<dyn Driver>>) -> Result<Self, DeviceError> {
        let mut table = Vec::new();
        for (driver_index, driver) in drivers.iter().enumerate() {
            for device_index in 0..driver.device_count() {
                let identifier = driver.describe(device_index)?;
                debug!("Enumerated {} from driver \"{}\"", identifier, driver.name());
                table.push(TableEntry {
                    identifier,
                    driver: driver_index,
                    index: device_index,
                });
            }
        }
        Ok(Self { drivers, table })
    }

    /// All built-in drivers.
    pub fn with_default_drivers() -> Result<Self, DeviceError> {
        Self::new(crate::drivers::default_drivers())
    }

    pub fn device_count(&self) -> usize {
        self.table.len()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &DeviceIdentifier> {
        self.table.iter().map(|entry| &entry.identifier)
    }

    /// Select the first device of `kind` whose name matches `pattern`.
    ///
    /// The pattern is a regular expression matched case-sensitively anywhere
    /// in the device name; the empty pattern means "first device of this
    /// kind".
    pub fn select(
        &self,
        kind: DeviceKind,
        pattern: &str,
    ) -> Result<DeviceIdentifier, DeviceError> {
        if pattern.is_empty() {
            return self
                .table
                .iter()
                .find(|entry| entry.identifier.kind == kind)
                .map(|entry| entry.identifier.clone())
                .ok_or_else(|| DeviceError::NotFound {
                    kind,
                    pattern: String::new(),
                });
        }

        let matcher = Regex::new(pattern).map_err(|source| DeviceError::BadPattern {
            pattern: pattern.to_owned(),
            source,
        })?;

        self.table
            .iter()
            .find(|entry| entry.identifier.kind == kind && matcher.is_match(&entry.identifier.name))
            .map(|entry| entry.identifier.clone())
            .ok_or_else(|| DeviceError::NotFound {
                kind,
                pattern: pattern.to_owned(),
            })
    }

    /// Open the device named exactly by `identifier`.
    pub fn open(&self, identifier: &DeviceIdentifier) -> Result<DeviceHandle, DeviceError> {
        let entry = self
            .table
            .iter()
            .find(|entry| entry.identifier == *identifier)
            .ok_or_else(|| DeviceError::NotFound {
                kind: identifier.kind,
                pattern: identifier.name.clone(),
            })?;
        let handle = self.drivers[entry.driver].open(entry.index)?;
        if handle.kind() != identifier.kind {
            return Err(DeviceError::WrongKind {
                name: identifier.name.clone(),
                expected: identifier.kind,
                actual: handle.kind(),
            });
        }
        Ok(handle)
    }

    pub fn open_camera(&self, identifier: &DeviceIdentifier) -> Result<OpenCamera, DeviceError> {
        match self.open(identifier)? {
            DeviceHandle::Camera(camera) => Ok(OpenCamera::new(identifier.clone(), camera)),
            DeviceHandle::Storage(_) => Err(DeviceError::WrongKind {
                name: identifier.name.clone(),
                expected: DeviceKind::Camera,
                actual: DeviceKind::Storage,
            }),
        }
    }

    pub fn open_storage(&self, identifier: &DeviceIdentifier) -> Result<OpenStorage, DeviceError> {
        match self.open(identifier)? {
            DeviceHandle::Storage(storage) => Ok(OpenStorage::new(identifier.clone(), storage)),
            DeviceHandle::Camera(_) => Err(DeviceError::WrongKind {
                name: identifier.name.clone(),
                expected: DeviceKind::Storage,
                actual: DeviceKind::Camera,
            }),
        }
    }

    /// Shut every driver down. Devices must already be released.
    pub fn shutdown(&self) {
        for driver in &self.drivers {
            driver.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> DeviceManager {
        DeviceManager::with_default_drivers().unwrap()
    }

    #[test]
    fn test_enumerates_all_builtin_devices() {
        let manager = manager();
        let cameras = manager
            .identifiers()
            .filter(|id| id.kind == DeviceKind::Camera)
            .count();
        let storages = manager
            .identifiers()
            .filter(|id| id.kind == DeviceKind::Storage)
            .count();
        assert_eq!(cameras, 3);
        assert_eq!(storages, 4);
    }

    #[test]
    fn test_select_by_regex() {
        let manager = manager();
        let selected = manager.select(DeviceKind::Camera, "simulated.*sin*").unwrap();
        assert_eq!(selected.name, "simulated: radial sin");
        assert_eq!(selected.kind, DeviceKind::Camera);

        let selected = manager.select(DeviceKind::Storage, "trash").unwrap();
        assert_eq!(selected.name, "trash");
    }

    #[test]
    fn test_select_is_case_sensitive() {
        let manager = manager();
        assert!(matches!(
            manager.select(DeviceKind::Camera, "SIMULATED"),
            Err(DeviceError::NotFound { .. })
        ));
    }

    #[test]
    fn test_select_empty_pattern_takes_first_of_kind() {
        let manager = manager();
        let first_camera = manager
            .identifiers()
            .find(|id| id.kind == DeviceKind::Camera)
            .cloned()
            .unwrap();
        assert_eq!(manager.select(DeviceKind::Camera, "").unwrap(), first_camera);
    }

    #[test]
    fn test_select_malformed_pattern() {
        let manager = manager();
        assert!(matches!(
            manager.select(DeviceKind::Camera, "simulated[("),
            Err(DeviceError::BadPattern { .. })
        ));
    }

    #[test]
    fn test_open_wrong_kind_is_rejected() {
        let manager = manager();
        let identifier = DeviceIdentifier {
            kind: DeviceKind::Storage,
            name: "simulated: empty".to_string(),
        };
        assert!(matches!(
            manager.open_storage(&identifier),
            Err(DeviceError::NotFound { .. })
        ));
    }

    #[test]
    fn test_open_camera_by_identifier() {
        let manager = manager();
        let identifier = manager.select(DeviceKind::Camera, "uniform random").unwrap();
        let camera = manager.open_camera(&identifier).unwrap();
        assert_eq!(camera.identifier.name, "simulated: uniform random");
    }
}
