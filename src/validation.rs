//! Khronos validation layer and debug-utils routing
//!
//! When enabled in [`ComputeConfig`](crate::ComputeConfig), the instance is
//! created with `VK_LAYER_KHRONOS_validation` and a debug messenger that
//! forwards driver diagnostics into the `log` facade. A missing layer is a
//! warning, not an error: dispatch works the same without it.

use std::ffi::{c_char, CStr};

use ash::{ext::debug_utils, vk, Entry, Instance};

use crate::error::Result;

/// Name of the standard validation layer
pub const KHRONOS_VALIDATION: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Layer and extension names to hand to vkCreateInstance.
#[derive(Debug, Default, Clone)]
pub struct ValidationLayers {
    layers: Vec<&'static CStr>,
    extensions: Vec<&'static CStr>,
}

impl ValidationLayers {
    /// Probe the loader and decide what to enable.
    pub fn probe(entry: &Entry, requested: bool) -> Self {
        if !requested {
            return Self::default();
        }

        let available = match unsafe { entry.enumerate_instance_layer_properties() } {
            Ok(props) => props,
            Err(e) => {
                log::warn!("Could not enumerate instance layers: {:?}", e);
                return Self::default();
            }
        };

        let names: Vec<String> = available
            .iter()
            .map(|p| unsafe { CStr::from_ptr(p.layer_name.as_ptr()) }.to_string_lossy().into_owned())
            .collect();

        Self::select(&names)
    }

    /// Pure selection over available layer names.
    pub fn select(available: &[String]) -> Self {
        let wanted = KHRONOS_VALIDATION.to_string_lossy();
        if available.iter().any(|name| *name == wanted) {
            log::info!("Enabling {}", wanted);
            Self {
                layers: vec![KHRONOS_VALIDATION],
                extensions: vec![debug_utils::NAME],
            }
        } else {
            log::warn!("{} requested but not installed; continuing without it", wanted);
            Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.layers.is_empty()
    }

    pub fn layer_ptrs(&self) -> Vec<*const c_char> {
        self.layers.iter().map(|l| l.as_ptr()).collect()
    }

    pub fn extension_ptrs(&self) -> Vec<*const c_char> {
        self.extensions.iter().map(|e| e.as_ptr()).collect()
    }
}

/// Debug messenger that lives as long as its instance.
pub struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    pub fn new(entry: &Entry, instance: &Instance) -> Result<Self> {
        let loader = debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vk_debug_callback));

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }?;

        log::debug!("Debug messenger installed");
        Ok(Self { loader, messenger })
    }

    /// Must run before the owning instance is destroyed.
    pub(crate) fn destroy(&mut self) {
        if self.messenger != vk::DebugUtilsMessengerEXT::null() {
            unsafe {
                self.loader.destroy_debug_utils_messenger(self.messenger, None);
            }
            self.messenger = vk::DebugUtilsMessengerEXT::null();
        }
    }
}

unsafe extern "system" fn vk_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        std::borrow::Cow::from("")
    } else {
        CStr::from_ptr((*p_callback_data).p_message).to_string_lossy()
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[vulkan {:?}] {}", message_type, message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[vulkan {:?}] {}", message_type, message)
        }
        _ => log::debug!("[vulkan {:?}] {}", message_type, message),
    }

    vk::FALSE
}
