// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface and validation messenger.

use std::ffi::{c_void, CStr, CString};

use ash::ext::debug_utils as ext_debug;
use ash::khr::surface;
use ash::{vk, Entry, Instance};
use cinder_core::Logger;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::config::RendererConfig;
use crate::error::{Error, Result};
use crate::physical::{DeviceCandidate, QueueFamilyCaps};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

struct Messenger {
    loader: ext_debug::Instance,
    raw: vk::DebugUtilsMessengerEXT,
    // Read by `debug_callback` through `p_user_data` until `raw` is destroyed.
    _log: Box<Logger>,
}

/// Owns the instance-level objects. Destroyed after the logical device.
pub struct VulkanInstance {
    pub(crate) entry: Entry,
    pub(crate) instance: Instance,
    pub(crate) surface_loader: surface::Instance,
    pub(crate) surface: vk::SurfaceKHR,
    messenger: Option<Messenger>,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    user: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: the loader passes either null or a valid callback record, and
    // `user` is the boxed `Logger` owned by the live messenger.
    unsafe {
        if data.is_null() || user.is_null() || (*data).p_message.is_null() {
            return vk::FALSE;
        }
        let log = &*(user as *const Logger);
        let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
        if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            log.error(format_args!("{msg}"));
        } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            log.warn(format_args!("{msg}"));
        } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
            log.debug(format_args!("{msg}"));
        } else {
            log.trace(format_args!("{msg}"));
        }
    }
    vk::FALSE
}

impl VulkanInstance {
    /// Loads the Vulkan library, creates the instance with the window
    /// system's surface extensions, then the surface for `window`.
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        config: &RendererConfig,
        log: &Logger,
    ) -> Result<Self> {
        let log = log.scoped("vulkan");
        let dh = display.display_handle()?.as_raw();
        let wh = window.window_handle()?.as_raw();

        // SAFETY: the loaded library is kept alive by `entry`, which outlives
        // every object created from it.
        let entry = unsafe { Entry::load()? };

        let wsi = ash_window::enumerate_required_extensions(dh)
            .map_err(|result| Error::DeviceCreation {
                stage: "enumerate surface extensions",
                result,
            })?;
        let validation = config.validation && has_validation_layer(&entry);
        if config.validation && !validation {
            log.warn(format_args!(
                "validation requested but {} is not installed",
                VALIDATION_LAYER.to_string_lossy()
            ));
        }
        let mut extensions = wsi.to_vec();
        if validation {
            extensions.push(ext_debug::NAME.as_ptr());
        }
        let layers = [VALIDATION_LAYER.as_ptr()];

        let app_name = CString::new(config.application_name.replace('\0', ""))
            .unwrap_or_else(|_| c"cinder".to_owned());
        let app_info = vk::ApplicationInfo {
            s_type: vk::StructureType::APPLICATION_INFO,
            p_application_name: app_name.as_ptr(),
            application_version: 0,
            p_engine_name: c"cinder".as_ptr(),
            engine_version: 0,
            api_version: vk::API_VERSION_1_2,
            ..Default::default()
        };
        let create_info = vk::InstanceCreateInfo {
            s_type: vk::StructureType::INSTANCE_CREATE_INFO,
            p_application_info: &app_info,
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            enabled_layer_count: if validation { 1 } else { 0 },
            pp_enabled_layer_names: layers.as_ptr(),
            ..Default::default()
        };
        // SAFETY: every pointer in `create_info` refers to locals alive for
        // the duration of the call.
        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|result| {
            Error::DeviceCreation {
                stage: "create instance",
                result,
            }
        })?;

        let surface_loader = surface::Instance::new(&entry, &instance);
        // SAFETY: the handles come from a live window that the caller keeps
        // alive for as long as the renderer.
        let surface = match unsafe { ash_window::create_surface(&entry, &instance, dh, wh, None) }
        {
            Ok(s) => s,
            Err(result) => {
                // SAFETY: nothing else has been created from `instance`.
                unsafe { instance.destroy_instance(None) };
                return Err(Error::SwapchainCreation {
                    stage: "create surface",
                    result,
                });
            }
        };

        let mut this = Self {
            entry,
            instance,
            surface_loader,
            surface,
            messenger: None,
        };
        if validation {
            this.messenger = this.create_messenger(&log);
        }
        log.info(format_args!(
            "vulkan instance ready (validation {})",
            if validation { "on" } else { "off" }
        ));
        Ok(this)
    }

    fn create_messenger(&self, log: &Logger) -> Option<Messenger> {
        let loader = ext_debug::Instance::new(&self.entry, &self.instance);
        let boxed = Box::new(log.scoped("validation"));
        let ci = vk::DebugUtilsMessengerCreateInfoEXT {
            s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
            message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            pfn_user_callback: Some(debug_callback),
            p_user_data: (&*boxed as *const Logger).cast_mut().cast(),
            ..Default::default()
        };
        // SAFETY: `p_user_data` points into `boxed`, which is stored next to
        // the messenger and dropped only after it is destroyed.
        match unsafe { loader.create_debug_utils_messenger(&ci, None) } {
            Ok(raw) => Some(Messenger {
                loader,
                raw,
                _log: boxed,
            }),
            Err(e) => {
                log.warn(format_args!("debug messenger unavailable: {e}"));
                None
            }
        }
    }

    /// Describes every physical device, including present support against
    /// this instance's surface.
    pub fn candidates(&self) -> Result<Vec<DeviceCandidate>> {
        // SAFETY: `instance` and `surface` are live for `&self`.
        unsafe {
            let devices = self
                .instance
                .enumerate_physical_devices()
                .map_err(Error::vulkan("vkEnumeratePhysicalDevices"))?;
            let mut out = Vec::with_capacity(devices.len());
            for phys in devices {
                let props = self.instance.get_physical_device_properties(phys);
                let name = CStr::from_ptr(props.device_name.as_ptr())
                    .to_string_lossy()
                    .into_owned();
                let extensions = self
                    .instance
                    .enumerate_device_extension_properties(phys)
                    .map_err(Error::vulkan("vkEnumerateDeviceExtensionProperties"))?
                    .iter()
                    .map(|e| {
                        CStr::from_ptr(e.extension_name.as_ptr())
                            .to_string_lossy()
                            .into_owned()
                    })
                    .collect();
                let queue_families = self
                    .instance
                    .get_physical_device_queue_family_properties(phys)
                    .iter()
                    .enumerate()
                    .map(|(i, q)| QueueFamilyCaps {
                        flags: q.queue_flags,
                        present: self
                            .surface_loader
                            .get_physical_device_surface_support(phys, i as u32, self.surface)
                            .unwrap_or(false),
                    })
                    .collect();
                out.push(DeviceCandidate {
                    handle: phys,
                    name,
                    device_type: props.device_type,
                    max_image_dimension_2d: props.limits.max_image_dimension2_d,
                    extensions,
                    queue_families,
                });
            }
            Ok(out)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        // SAFETY: the logical device and swapchain were destroyed first by
        // the owning driver; nothing else refers to these objects.
        unsafe {
            if let Some(m) = self.messenger.take() {
                m.loader.destroy_debug_utils_messenger(m.raw, None);
            }
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

fn has_validation_layer(entry: &Entry) -> bool {
    // SAFETY: plain enumeration with no outstanding pointers.
    unsafe { entry.enumerate_instance_layer_properties() }
        .unwrap_or_default()
        .iter()
        // SAFETY: layer names are NUL-terminated within their fixed arrays.
        .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER)
}
