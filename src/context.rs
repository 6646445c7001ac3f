//! Vulkan instance, device and compute queue
//!
//! [`DeviceContext`] is the ownership root for every other handle in the
//! crate. It is a cheap clone over a shared inner value: buffers, layouts,
//! pipelines and command pools each hold a clone, so the logical device and
//! instance are destroyed only after the last of them is gone.
//!
//! # Device selection
//!
//! The first enumerated physical device is used. There is no scoring by
//! memory size, core count or discrete-vs-integrated; every enumerated
//! device is logged so the choice is visible.

use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::{vk, Device, Entry, Instance};

use crate::config::ComputeConfig;
use crate::error::{ComputeError, Result};
use crate::teardown::{next_owner_id, ReleaseStage, TeardownLedger};
use crate::validation::{DebugMessenger, ValidationLayers};

/// Priority of the single compute queue we open
const QUEUE_PRIORITY: f32 = 1.0;

struct DeviceInner {
    /// Keeps the loader library mapped for the lifetime of the instance
    _entry: Entry,
    instance: Instance,
    debug_messenger: Option<DebugMessenger>,
    physical_device: vk::PhysicalDevice,
    device: Device,
    compute_queue: vk::Queue,
    queue_family_index: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device_name: String,
    ledger: Arc<TeardownLedger>,
    owner: u64,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        log::info!("Destroying logical device and instance ({})", self.device_name);
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("device_wait_idle failed during teardown: {:?}", e);
            }
            self.device.destroy_device(None);
            self.ledger.record(self.owner, ReleaseStage::Device);

            if let Some(messenger) = self.debug_messenger.as_mut() {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
            self.ledger.record(self.owner, ReleaseStage::Instance);
        }
    }
}

/// Shared handle to an opened compute device.
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<DeviceInner>,
}

impl DeviceContext {
    /// Load Vulkan, create an instance, pick the first device and open one
    /// compute queue on it.
    ///
    /// # Errors
    ///
    /// `EntryLoadFailed`, `InstanceCreationFailed`, `NoDeviceFound`,
    /// `NoComputeQueueFamily` or `DeviceCreationFailed`.
    pub fn new(config: &ComputeConfig) -> Result<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| ComputeError::EntryLoadFailed(format!("{}", e)))?;

        let validation = ValidationLayers::probe(&entry, config.enable_validation);
        let instance = create_instance(&entry, config, &validation)?;

        // From here on a failure must destroy the instance we already own.
        match Self::finish(entry, instance, &validation) {
            Ok(ctx) => Ok(ctx),
            Err((entry, instance, e)) => {
                unsafe { instance.destroy_instance(None) };
                drop(entry);
                Err(e)
            }
        }
    }

    fn finish(
        entry: Entry,
        instance: Instance,
        validation: &ValidationLayers,
    ) -> std::result::Result<Self, (Entry, Instance, ComputeError)> {
        let mut debug_messenger = if validation.is_enabled() {
            match DebugMessenger::new(&entry, &instance) {
                Ok(m) => Some(m),
                Err(e) => {
                    log::warn!("Debug messenger unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let opened = select_device(&instance).and_then(|physical_device| {
            let families =
                unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
            let family = find_compute_queue_family(&families)?;
            let (device, queue) = open_device(&instance, physical_device, family)?;
            Ok((physical_device, family, device, queue))
        });

        let (physical_device, queue_family_index, device, compute_queue) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                if let Some(m) = debug_messenger.as_mut() {
                    m.destroy();
                }
                return Err((entry, instance, e));
            }
        };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        log::info!(
            "Opened compute device '{}' (queue family {}, {} memory types)",
            device_name,
            queue_family_index,
            memory_properties.memory_type_count
        );

        Ok(Self {
            inner: Arc::new(DeviceInner {
                _entry: entry,
                instance,
                debug_messenger,
                physical_device,
                device,
                compute_queue,
                queue_family_index,
                memory_properties,
                device_name,
                ledger: Arc::new(TeardownLedger::new()),
                owner: next_owner_id(),
            }),
        })
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn instance(&self) -> &Instance {
        &self.inner.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.inner.physical_device
    }

    pub fn compute_queue(&self) -> vk::Queue {
        self.inner.compute_queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.inner.queue_family_index
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.inner.memory_properties
    }

    pub fn device_name(&self) -> &str {
        &self.inner.device_name
    }

    /// Release ledger shared by every object created from this context.
    /// Clone it before teardown to inspect the order afterwards.
    pub fn ledger(&self) -> Arc<TeardownLedger> {
        Arc::clone(&self.inner.ledger)
    }

    /// Number of live clones (children included).
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

fn create_instance(
    entry: &Entry,
    config: &ComputeConfig,
    validation: &ValidationLayers,
) -> Result<Instance> {
    let app_name = CString::new(config.application_name.as_str())
        .map_err(|e| ComputeError::Config(format!("application_name: {}", e)))?;
    let engine_name = c"HLX";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(config.vk_api_version());

    let layers = validation.layer_ptrs();
    let extensions = validation.extension_ptrs();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(ComputeError::InstanceCreationFailed)?;

    log::debug!("Created Vulkan instance for '{}'", config.application_name);
    Ok(instance)
}

/// Enumerate physical devices and return the first one.
///
/// # Errors
///
/// `NoDeviceFound` when enumeration yields nothing.
pub fn select_device(instance: &Instance) -> Result<vk::PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices() }?;

    for (i, &pd) in devices.iter().enumerate() {
        let props = unsafe { instance.get_physical_device_properties(pd) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();
        log::info!("  device {}: {} ({:?})", i, name, props.device_type);
    }

    let selected = pick_first(&devices)?;
    log::info!("Selected device 0 of {}", devices.len());
    Ok(selected)
}

/// Selection policy: the first enumerated device wins.
pub fn pick_first<T: Copy>(devices: &[T]) -> Result<T> {
    devices.first().copied().ok_or(ComputeError::NoDeviceFound)
}

/// Index of the first queue family advertising compute support.
///
/// # Errors
///
/// `NoComputeQueueFamily` when no family qualifies.
pub fn find_compute_queue_family(families: &[vk::QueueFamilyProperties]) -> Result<u32> {
    families
        .iter()
        .position(|props| props.queue_flags.contains(vk::QueueFlags::COMPUTE) && props.queue_count > 0)
        .map(|idx| idx as u32)
        .ok_or(ComputeError::NoComputeQueueFamily)
}

/// Create a logical device with exactly one queue at maximum priority in
/// `queue_family_index`, and fetch that queue.
///
/// # Errors
///
/// `DeviceCreationFailed` if the driver rejects the request.
pub fn open_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
) -> Result<(Device, vk::Queue)> {
    let queue_priorities = [QUEUE_PRIORITY];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family_index)
        .queue_priorities(&queue_priorities);

    let device_create_info =
        vk::DeviceCreateInfo::default().queue_create_infos(std::slice::from_ref(&queue_create_info));

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .map_err(ComputeError::DeviceCreationFailed)?;

    let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
    if queue == vk::Queue::null() {
        unsafe { device.destroy_device(None) };
        return Err(ComputeError::DeviceCreationFailed(vk::Result::ERROR_INITIALIZATION_FAILED));
    }

    log::debug!("Opened logical device with 1 queue in family {}", queue_family_index);
    Ok((device, queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn test_pick_first_device() {
        assert_eq!(pick_first(&[7u32, 3, 9]).unwrap(), 7);
    }

    #[test]
    fn test_pick_first_empty() {
        let none: [u32; 0] = [];
        assert!(matches!(pick_first(&none), Err(ComputeError::NoDeviceFound)));
    }

    #[test]
    fn test_find_compute_family_skips_graphics_only() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::TRANSFER, 2),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 4),
            family(vk::QueueFlags::COMPUTE, 1),
        ];
        assert_eq!(find_compute_queue_family(&families).unwrap(), 2);
    }

    #[test]
    fn test_find_compute_family_none() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1), family(vk::QueueFlags::TRANSFER, 1)];
        assert!(matches!(
            find_compute_queue_family(&families),
            Err(ComputeError::NoComputeQueueFamily)
        ));
    }

    #[test]
    fn test_find_compute_family_ignores_empty_family() {
        let families = [family(vk::QueueFlags::COMPUTE, 0), family(vk::QueueFlags::COMPUTE, 1)];
        assert_eq!(find_compute_queue_family(&families).unwrap(), 1);
    }
}
