//! Vulkan instance, loader and validation messenger.

use std::ffi::CStr;

use ash::{Entry, vk};
use tracing::{debug, error, info, warn};

use crate::error::{RhiError, RhiResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Owns the loader, the `VkInstance` and, when validation is on, the messenger
/// that forwards layer output to `tracing`.
pub struct Instance {
    entry: Entry,
    instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_support: bool,
}

impl Instance {
    /// Loads Vulkan and creates a 1.3 instance.
    ///
    /// With `presentable` set the platform surface extensions are enabled so
    /// the caller can create a `VkSurfaceKHR`; headless devices skip them.
    /// Validation silently degrades to off when the layer is missing.
    pub fn new(validation: bool, presentable: bool) -> RhiResult<Self> {
        // SAFETY: loading the system loader has no preconditions beyond it existing.
        let entry = unsafe { Entry::load()? };

        let validation = validation && has_layer(&entry, VALIDATION_LAYER)?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"keel")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"keel")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = if presentable {
            surface_extensions()
        } else {
            Vec::new()
        };
        let mut layers = Vec::new();
        if validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
            layers.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        // SAFETY: every pointer in create_info outlives the call.
        let instance = unsafe { entry.create_instance(&create_info, None)? };
        info!(
            "Vulkan 1.3 instance created ({} extensions, validation {})",
            extensions.len(),
            if validation { "on" } else { "off" }
        );

        let debug_utils = if validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(validation_callback));
            // SAFETY: the loader was created from this instance.
            match unsafe { loader.create_debug_utils_messenger(&messenger_info, None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    warn!("Validation messenger unavailable: {:?}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
            surface_support: presentable,
        })
    }

    #[inline]
    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    #[inline]
    pub fn has_validation(&self) -> bool {
        self.debug_utils.is_some()
    }

    /// Whether surface extensions were enabled at creation.
    #[inline]
    pub fn supports_surfaces(&self) -> bool {
        self.surface_support
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // SAFETY: every child object has been destroyed by the owning backend.
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("Vulkan instance destroyed");
    }
}

fn has_layer(entry: &Entry, name: &CStr) -> RhiResult<bool> {
    // SAFETY: plain enumeration.
    let layers = unsafe { entry.enumerate_instance_layer_properties()? };
    let found = layers
        .iter()
        .any(|layer| layer.layer_name_as_c_str().is_ok_and(|n| n == name));
    if !found {
        warn!("{:?} requested but not installed", name);
    }
    Ok(found)
}

/// Platform surface extensions for presentable instances.
fn surface_extensions() -> Vec<*const std::ffi::c_char> {
    let mut extensions = vec![ash::khr::surface::NAME.as_ptr()];

    #[cfg(target_os = "windows")]
    extensions.push(ash::khr::win32_surface::NAME.as_ptr());

    #[cfg(target_os = "linux")]
    {
        extensions.push(ash::khr::xlib_surface::NAME.as_ptr());
        extensions.push(ash::khr::wayland_surface::NAME.as_ptr());
    }

    #[cfg(target_os = "macos")]
    extensions.push(ash::ext::metal_surface::NAME.as_ptr());

    extensions
}

/// Routes validation layer messages to `tracing`.
unsafe extern "system" fn validation_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the layer passes a valid callback struct for the call's duration.
    let data = unsafe { &*data };
    let message = if data.p_message.is_null() {
        std::borrow::Cow::Borrowed("(no message)")
    } else {
        // SAFETY: the loader hands back a non-null, NUL-terminated string.
        unsafe { CStr::from_ptr(data.p_message).to_string_lossy() }
    };

    let kind = match kind {
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "performance",
        _ => "general",
    };
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!(target: "keel_rhi::vulkan", "[{}] {}", kind, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!(target: "keel_rhi::vulkan", "[{}] {}", kind, message),
        _ => debug!(target: "keel_rhi::vulkan", "[{}] {}", kind, message),
    }
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_instance() {
        match Instance::new(false, false) {
            Ok(instance) => {
                assert!(!instance.has_validation());
                assert!(!instance.supports_surfaces());
            }
            Err(RhiError::LoadingError(_)) => eprintln!("Skipping test: Vulkan not available"),
            Err(e) => panic!("Unexpected error: {:?}", e),
        }
    }

    #[test]
    fn test_surface_extensions_include_base() {
        let extensions = surface_extensions();
        assert_eq!(extensions[0], ash::khr::surface::NAME.as_ptr());

        #[cfg(target_os = "linux")]
        assert_eq!(extensions.len(), 3);
    }
}
