// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, device and queue: everything created once per window.

use std::ffi::{c_char, CStr, CString};

#[cfg(debug_assertions)]
use ash::ext::debug_utils as ext_debug;
use ash::khr::{dynamic_rendering, surface, swapchain, synchronization2};
use ash::{vk, Entry, Instance};
use lumen_render::{RenderError, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::info;

/// Maps `VkResult` into the render error type, naming the failing call.
pub(crate) trait VkCall<T> {
    fn call(self, name: &'static str) -> Result<T>;
}

impl<T> VkCall<T> for std::result::Result<T, vk::Result> {
    fn call(self, name: &'static str) -> Result<T> {
        self.map_err(|e| RenderError::device(name, format!("{e:?}")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderPath {
    /// Vulkan 1.3 core dynamic rendering and synchronization2.
    Core13,
    /// Vulkan 1.2 with VK_KHR_dynamic_rendering and VK_KHR_synchronization2.
    KhrExt,
}

#[cfg(debug_assertions)]
type DebugState = Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>;
#[cfg(not(debug_assertions))]
type DebugState = ();

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader passes a valid callback data pointer for the call.
    let msg = unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", "{msg}");
    } else {
        tracing::trace!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance) -> DebugState {
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    // SAFETY: instance was created with the debug utils extension enabled.
    match unsafe { loader.create_debug_utils_messenger(&ci, None) } {
        Ok(m) => Some((loader, m)),
        Err(e) => {
            tracing::warn!("debug messenger unavailable: {e:?}");
            None
        }
    }
}

#[cfg(not(debug_assertions))]
unsafe fn create_debug_messenger(_entry: &Entry, _instance: &Instance) -> DebugState {}

/// One window's Vulkan objects that outlive every swapchain.
///
/// Dropped after all device children are gone; see [`crate::VkGpu`].
pub struct DeviceContext {
    _entry: Entry,
    pub instance: Instance,
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    debug: DebugState,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub phys: vk::PhysicalDevice,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    pub queue_family: u32,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub path: RenderPath,
    pub swapchain_loader: swapchain::Device,
    sync2_khr: Option<synchronization2::Device>,
    dynren_khr: Option<dynamic_rendering::Device>,
    pub command_pool: vk::CommandPool,
}

impl DeviceContext {
    // STRICT ORDER:
    // 1) instance with WSI (+ debug) extensions
    // 2) surface from that instance
    // 3) physical device + queue family that can present to the surface
    // 4) device with the feature chain chosen for that physical device
    /// # Safety
    /// The window must outlive the returned context.
    pub unsafe fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        app_name: &str,
    ) -> Result<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| RenderError::NoSuitableDevice(format!("display handle: {e}")))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| RenderError::NoSuitableDevice(format!("window handle: {e}")))?
            .as_raw();

        // SAFETY: loading the system Vulkan library has no preconditions here.
        let entry = unsafe { Entry::load() }
            .map_err(|e| RenderError::NoSuitableDevice(format!("vulkan loader: {e}")))?;
        // SAFETY: entry is live; the instance is destroyed in Drop.
        let instance = unsafe { create_instance(&entry, dh, app_name)? };

        let surface_loader = surface::Instance::new(&entry, &instance);
        // SAFETY: handles come from a live window, as the caller guarantees.
        let surface = unsafe { ash_window::create_surface(&entry, &instance, dh, wh, None) }
            .call("vkCreateSurfaceKHR")?;
        // SAFETY: instance is live.
        let debug = unsafe { create_debug_messenger(&entry, &instance) };

        // SAFETY: instance and surface are live.
        let (phys, queue_family) =
            unsafe { pick_device_and_queue(&instance, &surface_loader, surface)? };
        // SAFETY: phys was enumerated from this instance.
        let (device, path) = unsafe { create_device(&instance, phys, queue_family)? };
        // SAFETY: queue family and index were requested at device creation.
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        // SAFETY: phys belongs to instance.
        let memory = unsafe { instance.get_physical_device_memory_properties(phys) };

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: queue_family,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        // SAFETY: device is live.
        let command_pool =
            unsafe { device.create_command_pool(&pool_info, None) }.call("vkCreateCommandPool")?;

        let (sync2_khr, dynren_khr) = match path {
            RenderPath::Core13 => (None, None),
            RenderPath::KhrExt => (
                Some(synchronization2::Device::new(&instance, &device)),
                Some(dynamic_rendering::Device::new(&instance, &device)),
            ),
        };
        let swapchain_loader = swapchain::Device::new(&instance, &device);

        // SAFETY: phys belongs to instance.
        let props = unsafe { instance.get_physical_device_properties(phys) };
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("vk: device {name}, path {path:?}, queue family {queue_family}");

        Ok(Self {
            _entry: entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys,
            memory,
            queue_family,
            device,
            queue,
            path,
            swapchain_loader,
            sync2_khr,
            dynren_khr,
            command_pool,
        })
    }

    /// # Safety
    /// `cmd` must be recording and `dep` must reference live objects.
    pub unsafe fn cmd_pipeline_barrier2(&self, cmd: vk::CommandBuffer, dep: &vk::DependencyInfo<'_>) {
        // SAFETY: forwarded from the caller.
        unsafe {
            match &self.sync2_khr {
                Some(khr) => khr.cmd_pipeline_barrier2(cmd, dep),
                None => self.device.cmd_pipeline_barrier2(cmd, dep),
            }
        }
    }

    /// # Safety
    /// `cmd` must be recording outside any rendering scope.
    pub unsafe fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, info: &vk::RenderingInfo<'_>) {
        // SAFETY: forwarded from the caller.
        unsafe {
            match &self.dynren_khr {
                Some(khr) => khr.cmd_begin_rendering(cmd, info),
                None => self.device.cmd_begin_rendering(cmd, info),
            }
        }
    }

    /// # Safety
    /// `cmd` must be inside a rendering scope.
    pub unsafe fn cmd_end_rendering(&self, cmd: vk::CommandBuffer) {
        // SAFETY: forwarded from the caller.
        unsafe {
            match &self.dynren_khr {
                Some(khr) => khr.cmd_end_rendering(cmd),
                None => self.device.cmd_end_rendering(cmd),
            }
        }
    }

    pub fn supports_attachment(&self, format: vk::Format, features: vk::FormatFeatureFlags) -> bool {
        // SAFETY: phys belongs to instance.
        let props = unsafe {
            self.instance
                .get_physical_device_format_properties(self.phys, format)
        };
        props.optimal_tiling_features.contains(features)
    }
}

// STRICT TEARDOWN ORDER: command pool, device, surface, messenger, instance.
impl Drop for DeviceContext {
    fn drop(&mut self) {
        // SAFETY: every device child was destroyed by the owner before this runs.
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            #[cfg(debug_assertions)]
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

unsafe fn create_instance(entry: &Entry, display: RawDisplayHandle, app_name: &str) -> Result<Instance> {
    let app = CString::new(app_name).unwrap_or_default();
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        p_engine_name: app.as_ptr(),
        api_version: vk::API_VERSION_1_3,
        ..Default::default()
    };

    #[cfg_attr(not(debug_assertions), allow(unused_mut))]
    let mut exts: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
        .call("enumerate_required_extensions")?
        .to_vec();

    #[cfg(debug_assertions)]
    let layers: Vec<*const c_char> = {
        exts.push(ext_debug::NAME.as_ptr());
        let validation = c"VK_LAYER_KHRONOS_validation";
        // SAFETY: entry is live.
        let available = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
        let present = available
            .iter()
            .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == validation));
        if present {
            vec![validation.as_ptr()]
        } else {
            info!("vk: validation layer not installed");
            Vec::new()
        }
    };
    #[cfg(not(debug_assertions))]
    let layers: Vec<*const c_char> = Vec::new();

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: exts.len() as u32,
        pp_enabled_extension_names: exts.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };
    // SAFETY: every pointer in create_info outlives this call.
    unsafe { entry.create_instance(&create_info, None) }.call("vkCreateInstance")
}

unsafe fn pick_device_and_queue(
    instance: &Instance,
    surf_i: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    // SAFETY: instance is live.
    let devices = unsafe { instance.enumerate_physical_devices() }.call("vkEnumeratePhysicalDevices")?;
    for phys in devices {
        // SAFETY: phys was just enumerated.
        let qprops = unsafe { instance.get_physical_device_queue_family_properties(phys) };
        for (i, q) in qprops.iter().enumerate() {
            // SAFETY: i indexes the family list just queried.
            let presents = unsafe { surf_i.get_physical_device_surface_support(phys, i as u32, surface) }
                .unwrap_or(false);
            if q.queue_flags.contains(vk::QueueFlags::GRAPHICS) && presents {
                return Ok((phys, i as u32));
            }
        }
    }
    Err(RenderError::NoSuitableDevice(
        "no graphics queue family can present to this surface".into(),
    ))
}

// STRICT ORDER (feature pNext chain):
// Core 1.3: feats13 -> feats12 -> feats2
// KHR:      sync2 -> dynamic rendering -> feats12 -> feats2
// Core 1.3 structs and their KHR equivalents never share a chain.
unsafe fn create_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<(ash::Device, RenderPath)> {
    let priorities = [1.0_f32];
    let qinfo = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };

    // SAFETY: phys belongs to instance.
    let ext_props = unsafe { instance.enumerate_device_extension_properties(phys) }
        .call("vkEnumerateDeviceExtensionProperties")?;
    let has = |name: &CStr| {
        ext_props
            .iter()
            .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == name))
    };
    if !has(swapchain::NAME) {
        return Err(RenderError::NoSuitableDevice("VK_KHR_swapchain missing".into()));
    }
    let mut device_exts: Vec<*const c_char> = vec![swapchain::NAME.as_ptr()];

    let mut feats12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut feats13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut feats_sync2_khr = vk::PhysicalDeviceSynchronization2FeaturesKHR::default();
    let mut feats_dr_khr = vk::PhysicalDeviceDynamicRenderingFeaturesKHR::default();
    let mut feats2 = vk::PhysicalDeviceFeatures2::default();

    let force_khr = std::env::var("LUMEN_FORCE_KHR").ok().as_deref() == Some("1");
    // SAFETY: phys belongs to instance.
    let api = unsafe { instance.get_physical_device_properties(phys) }.api_version;
    let core13 = vk::api_version_major(api) > 1
        || (vk::api_version_major(api) == 1 && vk::api_version_minor(api) >= 3);

    let path = if core13 && !force_khr {
        feats13.synchronization2 = vk::TRUE;
        feats13.dynamic_rendering = vk::TRUE;
        feats12.p_next = (&mut feats13) as *mut _ as *mut _;
        feats2.p_next = (&mut feats12) as *mut _ as *mut _;
        RenderPath::Core13
    } else if has(synchronization2::NAME) && has(dynamic_rendering::NAME) {
        device_exts.push(synchronization2::NAME.as_ptr());
        device_exts.push(dynamic_rendering::NAME.as_ptr());
        feats_sync2_khr.synchronization2 = vk::TRUE;
        feats_dr_khr.dynamic_rendering = vk::TRUE;
        feats_sync2_khr.p_next = (&mut feats_dr_khr) as *mut _ as *mut _;
        feats12.p_next = (&mut feats_sync2_khr) as *mut _ as *mut _;
        feats2.p_next = (&mut feats12) as *mut _ as *mut _;
        RenderPath::KhrExt
    } else {
        return Err(RenderError::NoSuitableDevice(
            "dynamic rendering and synchronization2 are unavailable".into(),
        ));
    };

    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        p_next: (&feats2) as *const _ as *const _,
        queue_create_info_count: 1,
        p_queue_create_infos: &qinfo,
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        ..Default::default()
    };
    // SAFETY: the feature chain and extension names outlive this call.
    let device = unsafe { instance.create_device(phys, &dinfo, None) }.call("vkCreateDevice")?;
    Ok((device, path))
}
