//! Runtime device registry and ordered-fallback acquisition.
//!
//! Device implementations register a kind name together with a device-count probe and a
//! constructor. Acquisition tries the preferred kind first and then each optional kind in the
//! order given, skipping kinds without devices and kinds whose constructor fails.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use super::Device;
use crate::error::{LaunchError, LaunchResult};

/// Returns how many devices of a kind are present.
pub type DeviceCounter = Box<dyn Fn() -> usize + Send + Sync>;

/// Opens a device of a registered kind.
pub type DeviceConstructor = Box<dyn Fn() -> LaunchResult<Arc<dyn Device>> + Send + Sync>;

struct DeviceEntry {
    count: DeviceCounter,
    constructor: DeviceConstructor,
}

/// Kind-name keyed device registry.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C, F>(&self, kind: impl Into<String>, count: C, constructor: F)
    where
        C: Fn() -> usize + Send + Sync + 'static,
        F: Fn() -> LaunchResult<Arc<dyn Device>> + Send + Sync + 'static,
    {
        let kind = kind.into();
        tracing::debug!(kind = %kind, "registering device kind");
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                kind,
                DeviceEntry {
                    count: Box::new(count),
                    constructor: Box::new(constructor),
                },
            );
    }

    /// Zero for unknown kinds.
    pub fn device_count(&self, kind: &str) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .map_or(0, |entry| (entry.count)())
    }

    pub fn list_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }

    pub fn has_kind(&self, kind: &str) -> bool {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(kind)
    }

    /// Opens a device of exactly `kind`.
    pub fn acquire(&self, kind: &str) -> LaunchResult<Arc<dyn Device>> {
        let registry = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        let entry = registry
            .get(kind)
            .ok_or_else(|| LaunchError::DeviceAcquisition(format!("unknown device kind {kind}")))?;
        if (entry.count)() == 0 {
            return Err(LaunchError::DeviceAcquisition(format!(
                "no {kind} devices present"
            )));
        }
        (entry.constructor)()
    }

    fn try_acquire<'a>(&self, kinds: impl IntoIterator<Item = &'a str>) -> Option<Arc<dyn Device>> {
        for kind in kinds {
            if self.device_count(kind) == 0 {
                continue;
            }
            match self.acquire(kind) {
                Ok(device) => {
                    tracing::info!(kind, device = device.name(), "acquired device");
                    return Some(device);
                }
                Err(err) => tracing::debug!(kind, %err, "device acquisition attempt failed"),
            }
        }
        None
    }

    /// Acquires `preferred`, falling back to `optional` kinds in order.
    pub fn acquire_with_fallback(
        &self,
        preferred: &str,
        optional: &[&str],
    ) -> LaunchResult<Arc<dyn Device>> {
        self.try_acquire([preferred])
            .or_else(|| self.try_acquire(optional.iter().copied()))
            .ok_or_else(|| {
                LaunchError::DeviceAcquisition(format!(
                    "no device of kind {preferred} or {optional:?} could be acquired"
                ))
            })
    }
}

static GLOBAL_REGISTRY: OnceLock<DeviceRegistry> = OnceLock::new();

/// Process-wide registry used by [`register_device`] and [`acquire_device`].
pub fn global_registry() -> &'static DeviceRegistry {
    GLOBAL_REGISTRY.get_or_init(DeviceRegistry::new)
}

/// Registers a device kind in the global registry.
///
/// # Example
/// ```ignore
/// use reciperun::device::registry::register_device;
///
/// register_device("sim", || 1, || Ok(SimDevice::shared()));
/// ```
pub fn register_device<C, F>(kind: impl Into<String>, count: C, constructor: F)
where
    C: Fn() -> usize + Send + Sync + 'static,
    F: Fn() -> LaunchResult<Arc<dyn Device>> + Send + Sync + 'static,
{
    global_registry().register(kind, count, constructor);
}

pub fn device_count(kind: &str) -> usize {
    global_registry().device_count(kind)
}

pub fn list_device_kinds() -> Vec<String> {
    global_registry().list_kinds()
}

pub fn has_device_kind(kind: &str) -> bool {
    global_registry().has_kind(kind)
}

/// Acquires a device from the global registry with ordered fallback.
pub fn acquire_device(preferred: &str, optional: &[&str]) -> LaunchResult<Arc<dyn Device>> {
    global_registry().acquire_with_fallback(preferred, optional)
}
