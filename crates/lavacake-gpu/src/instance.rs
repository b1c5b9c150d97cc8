//! Vulkan instance creation.

use crate::diagnostics::ErrorState;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{c_char, CStr, CString};

/// Standard validation layer.
pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions every instance is created with.
pub fn base_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::get_physical_device_properties2::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// An instance plus the debug messenger attached to it, if any.
pub(crate) struct InstanceParts {
    pub instance: ash::Instance,
    pub debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

/// Create a Vulkan instance.
///
/// Every requested extension must be supported. The validation layer is
/// only enabled when it is installed; a debug messenger forwarding to
/// `tracing` is attached alongside it when `VK_EXT_debug_utils` exists.
///
/// # Safety
/// The entry must be a valid Vulkan entry point. Pointers in `extensions`
/// must reference nul-terminated strings.
pub(crate) unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    extensions: &[*const c_char],
    enable_validation: bool,
    errors: &ErrorState,
) -> Result<InstanceParts> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::InvalidState("Application name contains a nul byte".to_string()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(c"LavaCake")
        .engine_version(vk::make_api_version(0, 1, 2, 0))
        .api_version(vk::API_VERSION_1_2);

    let available = entry.enumerate_instance_extension_properties(None).map_err(|e| {
        errors.error("Could not enumerate instance extensions.");
        GpuError::from(e)
    })?;
    let is_available = |name: &CStr| {
        available
            .iter()
            .any(|props| props.extension_name_as_c_str().is_ok_and(|n| n == name))
    };

    let mut extension_names: Vec<*const c_char> = extensions.to_vec();
    for &ext in extensions {
        let name = CStr::from_ptr(ext);
        if !is_available(name) {
            let name = name.to_string_lossy().into_owned();
            errors.error(format!(
                "Extension named '{name}' is not supported by an Instance object."
            ));
            return Err(GpuError::ExtensionNotSupported(name));
        }
    }

    let mut layer_names: Vec<*const c_char> = Vec::new();
    let mut debug_utils = false;
    if enable_validation {
        let layers = entry.enumerate_instance_layer_properties()?;
        let found = layers
            .iter()
            .any(|props| props.layer_name_as_c_str().is_ok_and(|n| n == VALIDATION_LAYER));
        if found {
            layer_names.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!(
                "Validation layer {} not available",
                VALIDATION_LAYER.to_string_lossy()
            );
        }

        if is_available(ash::ext::debug_utils::NAME) {
            extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
            debug_utils = true;
        }
    }

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None).map_err(|e| {
        errors.error("Could not create Vulkan instance.");
        GpuError::from(e)
    })?;

    let debug = if debug_utils {
        match create_debug_messenger(entry, &instance) {
            Ok(debug) => Some(debug),
            Err(e) => {
                tracing::warn!("Could not create debug messenger: {e}");
                None
            }
        }
    } else {
        None
    };

    Ok(InstanceParts { instance, debug })
}

unsafe fn create_debug_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = ash::ext::debug_utils::Instance::new(entry, instance);
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = loader.create_debug_utils_messenger(&create_info, None)?;
    Ok((loader, messenger))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "lavacake::validation", "[{message_type:?}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "lavacake::validation", "[{message_type:?}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::debug!(target: "lavacake::validation", "[{message_type:?}] {message}");
        }
        _ => {
            tracing::trace!(target: "lavacake::validation", "[{message_type:?}] {message}");
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_extensions_include_properties2() {
        let properties2 = ash::khr::get_physical_device_properties2::NAME;
        assert!(base_instance_extensions().contains(&properties2));
    }
}
