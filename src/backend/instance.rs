// Vulkan Instance - one-shot bootstrap
//
// Responsibilities:
// - Load the Vulkan library
// - Verify required layers / instance extensions (build-time list + the
//   ones the windowing system needs)
// - Instance creation
// - Optional debug messenger, resolved once and carried explicitly

use anyhow::{bail, Context, Result};
use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::Arc;

use super::enumerate::{enumerate, name_from_raw};
use crate::config::Requirements;

/// Debug messenger capability. Only exists when it was requested and created.
pub struct DebugMessenger {
    loader: DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// Instance wrapper with automatic cleanup
pub struct VulkanInstance {
    pub instance: ash::Instance,
    pub entry: Entry,
    debug: Option<DebugMessenger>,
}

impl VulkanInstance {
    /// Create the instance
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `display` - Display handle of the window, used to find the
    ///   platform surface extensions
    /// * `requirements` - Layers and extensions that must be present
    pub fn new(
        app_name: &str,
        display: RawDisplayHandle,
        requirements: &Requirements,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let layers = Self::check_layers(&entry, &requirements.layers)?;
        let extensions =
            Self::check_extensions(&entry, display, &requirements.instance_extensions)?;

        let app_name_cstr = CString::new(app_name)?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(1)
            .engine_name(&app_name_cstr)
            .engine_version(1)
            .api_version(vk::API_VERSION_1_0);

        let layer_ptrs: Vec<_> = layers.iter().map(|l| l.as_ptr()).collect();
        let extension_ptrs: Vec<_> = extensions.iter().map(|e| e.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        let debug = if requirements.debug_messenger {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            log::info!("Validation disabled, no debug messenger");
            None
        };

        Ok(Arc::new(Self {
            instance,
            entry,
            debug,
        }))
    }

    pub fn has_debug_messenger(&self) -> bool {
        self.debug.is_some()
    }

    fn check_layers(entry: &Entry, required: &[String]) -> Result<Vec<CString>> {
        let fp = entry.fp_v1_0();
        let available = enumerate("instance layers", |count, data| unsafe {
            (fp.enumerate_instance_layer_properties)(count, data)
        })?;
        let available: Vec<String> = available
            .iter()
            .map(|p: &vk::LayerProperties| name_from_raw(&p.layer_name))
            .collect();
        log::debug!("Instance layers: {:?}", available);

        required
            .iter()
            .map(|name| -> Result<CString> {
                if !available.contains(name) {
                    bail!("Required layer \"{}\" not available", name);
                }
                Ok(CString::new(name.as_str())?)
            })
            .collect()
    }

    fn check_extensions(
        entry: &Entry,
        display: RawDisplayHandle,
        required: &[String],
    ) -> Result<Vec<CString>> {
        let fp = entry.fp_v1_0();
        let available = enumerate("instance extensions", |count, data| unsafe {
            (fp.enumerate_instance_extension_properties)(ptr::null(), count, data)
        })?;
        let available: Vec<String> = available
            .iter()
            .map(|p: &vk::ExtensionProperties| name_from_raw(&p.extension_name))
            .collect();
        log::debug!("Instance extensions: {:?}", available);

        let window_extensions = ash_window::enumerate_required_extensions(display)
            .context("Failed to query instance extensions required by the window system")?;

        let mut wanted: Vec<String> = required.to_vec();
        for &ext in window_extensions {
            let name = unsafe { CStr::from_ptr(ext) }.to_string_lossy().into_owned();
            if !wanted.contains(&name) {
                wanted.push(name);
            }
        }

        wanted
            .iter()
            .map(|name| -> Result<CString> {
                if !available.contains(name) {
                    bail!("Required instance extension \"{}\" not available", name);
                }
                Ok(CString::new(name.as_str())?)
            })
            .collect()
    }

    fn setup_debug_messenger(entry: &Entry, instance: &ash::Instance) -> Result<DebugMessenger> {
        let loader = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok(DebugMessenger { loader, messenger })
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");

        unsafe {
            if let Some(debug) = self.debug.take() {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Render the category flags the way they show up in log lines
fn message_category(message_type: vk::DebugUtilsMessageTypeFlagsEXT) -> String {
    let mut parts = Vec::new();
    if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::GENERAL) {
        parts.push("general");
    }
    if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        parts.push("validation");
    }
    if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        parts.push("performance");
    }
    if parts.is_empty() {
        "unknown".to_string()
    } else {
        parts.join("|")
    }
}

// Debug callback for validation layers. Observational only.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();
    let category = message_category(message_type);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan {}] {}", category, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan {}] {}", category, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan {}] {}", category, message);
        }
        _ => {
            log::debug!("[Vulkan {}] {}", category, message);
        }
    }

    vk::FALSE
}
