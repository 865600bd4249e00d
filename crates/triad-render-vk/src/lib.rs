// SPDX-License-Identifier: CEPL-1.0
//! Vulkan 1.3 backend for `triad-render`.
//!
//! The pipeline's model maps onto Vulkan as follows:
//! - adapters are physical devices (`CPU` type counts as software)
//! - fences are timeline semaphores, fence events are host waits on them
//! - a command allocator is a transient pool owning one primary buffer
//! - the RTV heap is a table of image views, one descriptor per view
//! - clears are an empty dynamic-rendering pass with `LOAD_OP_CLEAR`
//!
//! Swap-chain acquire happens at creation and right after each present, so
//! the next back-buffer index is always known before a frame starts.
//!
//! Feature levels are checked as: every level needs Vulkan 1.3 with
//! timeline semaphores, synchronization2 and dynamic rendering; `11_1` adds
//! `logicOp`, `12_x` adds descriptor indexing, `12_1` adds the Vulkan
//! memory model.

mod commands;
mod swapchain;
mod sync;

use anyhow::{anyhow, Context, Result};
#[cfg(debug_assertions)]
use ash::ext::debug_utils as ext_debug;
use ash::khr::{surface, swapchain as khr_swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, RawDisplayHandle};
use std::ffi::CStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use triad_render::hal::{
    AdapterInfo, Backend, BackendError, CpuDescriptor, FeatureLevel, PresentTarget, ResourceState,
    SwapChainDesc, WaitStatus,
};
use triad_render::RenderSize;

pub use commands::{VkAllocator, VkCommandList};
pub use swapchain::{VkRtvHeap, VkSwapChain};
pub use sync::{VkEvent, VkFence};
use sync::AcquireGuards;

#[cfg(debug_assertions)]
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub(crate) struct InstanceShared {
    entry: Entry,
    instance: Instance,
    surface_loader: surface::Instance,
    #[cfg(debug_assertions)]
    debug: Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        // Last owner: every device and surface is already gone.
        unsafe {
            #[cfg(debug_assertions)]
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

pub(crate) struct DeviceShared {
    instance: Arc<InstanceShared>,
    device: ash::Device,
    phys: vk::PhysicalDevice,
    queue_family: u32,
    swapchain_loader: khr_swapchain::Device,
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
        }
    }
}

pub struct VkBackend {
    shared: Arc<InstanceShared>,
    physical: Vec<vk::PhysicalDevice>,
}

pub struct VkAdapter {
    index: u32,
    phys: vk::PhysicalDevice,
    name: String,
    software: bool,
    api_version: u32,
}

pub struct VkDevice {
    shared: Arc<DeviceShared>,
}

/// The graphics queue plus the binary semaphores linking the next submit to
/// the swap chain: wait on the image acquire, signal the present.
pub struct VkQueue {
    device: Arc<DeviceShared>,
    queue: vk::Queue,
    pending_wait: Option<vk::Semaphore>,
    pending_signal: Option<vk::Semaphore>,
    acquire_guards: AcquireGuards,
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!("[vulkan] {msg}");
    } else {
        debug!("[vulkan] {msg}");
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
unsafe fn has_instance_layer(entry: &Entry, name: &CStr) -> bool {
    entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default()
        .iter()
        .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == name)
}

unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle) -> Result<Instance> {
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: c"triad".as_ptr(),
        application_version: 0,
        p_engine_name: c"triad".as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_3,
        ..Default::default()
    };

    let ext_slice = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?;
    #[allow(unused_mut)]
    let mut ext_vec = ext_slice.to_vec();

    // Validation only in debug builds and only when installed.
    #[allow(unused_mut)]
    let mut layers: Vec<*const std::ffi::c_char> = Vec::new();
    #[cfg(debug_assertions)]
    if has_instance_layer(entry, VALIDATION_LAYER) {
        layers.push(VALIDATION_LAYER.as_ptr());
        ext_vec.push(ext_debug::NAME.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: ext_vec.len() as u32,
        pp_enabled_extension_names: ext_vec.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    entry
        .create_instance(&create_info, None)
        .context("create_instance")
}

#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)> {
    if !has_instance_layer(entry, VALIDATION_LAYER) {
        return None;
    }
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    match loader.create_debug_utils_messenger(&ci, None) {
        Ok(m) => Some((loader, m)),
        Err(e) => {
            tracing::warn!("validation messenger unavailable: {e:?}");
            None
        }
    }
}

unsafe fn graphics_family(instance: &Instance, phys: vk::PhysicalDevice) -> Option<u32> {
    instance
        .get_physical_device_queue_family_properties(phys)
        .iter()
        .position(|q| q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
}

unsafe fn supports_level(instance: &Instance, adapter: &VkAdapter, level: FeatureLevel) -> bool {
    let (maj, min) = (
        vk::api_version_major(adapter.api_version),
        vk::api_version_minor(adapter.api_version),
    );
    if maj == 1 && min < 3 {
        return false;
    }
    if graphics_family(instance, adapter.phys).is_none() {
        return false;
    }

    let mut feats13 = vk::PhysicalDeviceVulkan13Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_3_FEATURES,
        ..Default::default()
    };
    let mut feats12 = vk::PhysicalDeviceVulkan12Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES,
        ..Default::default()
    };
    let mut feats2 = vk::PhysicalDeviceFeatures2 {
        s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
        ..Default::default()
    };
    feats12.p_next = (&mut feats13) as *mut _ as *mut _;
    feats2.p_next = (&mut feats12) as *mut _ as *mut _;
    instance.get_physical_device_features2(adapter.phys, &mut feats2);

    let on = |b: vk::Bool32| b == vk::TRUE;
    let base = on(feats12.timeline_semaphore)
        && on(feats13.synchronization2)
        && on(feats13.dynamic_rendering);
    match level {
        FeatureLevel::L11_0 => base,
        FeatureLevel::L11_1 => base && on(feats2.features.logic_op),
        FeatureLevel::L12_0 => base && on(feats12.descriptor_indexing),
        FeatureLevel::L12_1 => {
            base && on(feats12.descriptor_indexing) && on(feats12.vulkan_memory_model)
        }
    }
}

unsafe fn create_logical_device(
    shared: &Arc<InstanceShared>,
    adapter: &VkAdapter,
) -> Result<DeviceShared> {
    let instance = &shared.instance;
    let queue_family = graphics_family(instance, adapter.phys)
        .ok_or_else(|| anyhow!("{} has no graphics queue", adapter.name))?;

    let priorities = [1.0_f32];
    let qinfo = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };

    // Feature chain: feats2 -> feats12 -> feats13. Structs outlive create_device.
    let mut feats13 = vk::PhysicalDeviceVulkan13Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_3_FEATURES,
        synchronization2: vk::TRUE,
        dynamic_rendering: vk::TRUE,
        ..Default::default()
    };
    let mut feats12 = vk::PhysicalDeviceVulkan12Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES,
        timeline_semaphore: vk::TRUE,
        ..Default::default()
    };
    let mut feats2 = vk::PhysicalDeviceFeatures2 {
        s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
        ..Default::default()
    };
    feats12.p_next = (&mut feats13) as *mut _ as *mut _;
    feats2.p_next = (&mut feats12) as *mut _ as *mut _;

    let device_exts = [khr_swapchain::NAME.as_ptr()];
    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        p_next: (&mut feats2) as *mut _ as *const _,
        queue_create_info_count: 1,
        p_queue_create_infos: &qinfo,
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        ..Default::default()
    };

    let device = instance
        .create_device(adapter.phys, &dinfo, None)
        .context("create_device")?;
    let swapchain_loader = khr_swapchain::Device::new(instance, &device);

    Ok(DeviceShared {
        instance: Arc::clone(shared),
        device,
        phys: adapter.phys,
        queue_family,
        swapchain_loader,
    })
}

impl VkBackend {
    /// Creates the instance with the surface extensions `display` needs.
    pub fn new(display: &dyn HasDisplayHandle) -> Result<Self> {
        unsafe {
            let entry = Entry::linked();
            let dh = display.display_handle()?.as_raw();
            let instance = create_instance(&entry, dh)?;
            let surface_loader = surface::Instance::new(&entry, &instance);
            #[cfg(debug_assertions)]
            let debug = create_debug_messenger(&entry, &instance);

            let shared = Arc::new(InstanceShared {
                entry,
                instance,
                surface_loader,
                #[cfg(debug_assertions)]
                debug,
            });
            let physical = shared
                .instance
                .enumerate_physical_devices()
                .context("enumerate_physical_devices")?;
            info!("Vulkan instance ready, {} physical device(s)", physical.len());
            Ok(VkBackend { shared, physical })
        }
    }
}

fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
}

impl Backend for VkBackend {
    type Adapter = VkAdapter;
    type Device = VkDevice;
    type Queue = VkQueue;
    type SwapChain = VkSwapChain;
    type DescriptorHeap = VkRtvHeap;
    type Allocator = VkAllocator;
    type Fence = VkFence;
    type Event = VkEvent;
    type CommandList = VkCommandList;

    fn enum_adapter(&mut self, index: u32) -> Option<VkAdapter> {
        let phys = *self.physical.get(index as usize)?;
        let props = unsafe { self.shared.instance.get_physical_device_properties(phys) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Some(VkAdapter {
            index,
            phys,
            name,
            software: props.device_type == vk::PhysicalDeviceType::CPU,
            api_version: props.api_version,
        })
    }

    fn adapter_info(&self, adapter: &VkAdapter) -> AdapterInfo {
        AdapterInfo {
            index: adapter.index,
            name: adapter.name.clone(),
            software: adapter.software,
        }
    }

    fn probe_feature_level(&mut self, adapter: &VkAdapter, level: FeatureLevel) -> bool {
        unsafe { supports_level(&self.shared.instance, adapter, level) }
    }

    fn create_device(
        &mut self,
        adapter: &VkAdapter,
        level: FeatureLevel,
    ) -> Result<VkDevice, BackendError> {
        let shared = unsafe { create_logical_device(&self.shared, adapter)? };
        debug!(
            "vk device on {} (queue family {}, level {})",
            adapter.name, shared.queue_family, level
        );
        Ok(VkDevice {
            shared: Arc::new(shared),
        })
    }

    fn create_queue(&mut self, device: &VkDevice) -> Result<VkQueue, BackendError> {
        let d = &device.shared;
        let queue = unsafe { d.device.get_device_queue(d.queue_family, 0) };
        Ok(VkQueue {
            device: Arc::clone(d),
            queue,
            pending_wait: None,
            pending_signal: None,
            acquire_guards: AcquireGuards::default(),
        })
    }

    fn execute_command_lists(
        &mut self,
        queue: &mut VkQueue,
        lists: &[&VkCommandList],
    ) -> Result<(), BackendError> {
        if lists.iter().any(|l| l.is_recording()) {
            return Err(anyhow!("executed a command list that is still recording").into());
        }
        let bufs: Vec<vk::CommandBuffer> = lists.iter().map(|l| l.buffer()).collect();
        let waits: Vec<vk::Semaphore> = queue.pending_wait.take().into_iter().collect();
        let stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; waits.len()];
        let signals: Vec<vk::Semaphore> = queue.pending_signal.take().into_iter().collect();

        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: waits.len() as u32,
            p_wait_semaphores: waits.as_ptr(),
            p_wait_dst_stage_mask: stages.as_ptr(),
            command_buffer_count: bufs.len() as u32,
            p_command_buffers: bufs.as_ptr(),
            signal_semaphore_count: signals.len() as u32,
            p_signal_semaphores: signals.as_ptr(),
            ..Default::default()
        };
        unsafe {
            queue
                .device
                .device
                .queue_submit(queue.queue, std::slice::from_ref(&submit), vk::Fence::null())
                .context("queue_submit")?;
        }
        if let Some(&acquire) = waits.first() {
            queue.acquire_guards.consumed(acquire);
        }
        Ok(())
    }

    fn create_swap_chain(
        &mut self,
        device: &VkDevice,
        queue: &mut VkQueue,
        target: &dyn PresentTarget,
        desc: &SwapChainDesc,
    ) -> Result<VkSwapChain, BackendError> {
        let sc = unsafe { swapchain::create(&device.shared, queue, target, desc)? };
        Ok(sc)
    }

    fn swap_chain_buffer_count(&self, swap_chain: &VkSwapChain) -> u32 {
        swap_chain.image_count()
    }

    fn swap_chain_size(&self, swap_chain: &VkSwapChain) -> RenderSize {
        let e = swap_chain.extent();
        RenderSize {
            width: e.width,
            height: e.height,
        }
    }

    fn current_back_buffer_index(&self, swap_chain: &VkSwapChain) -> u32 {
        swap_chain.image_index()
    }

    fn present(
        &mut self,
        queue: &mut VkQueue,
        swap_chain: &mut VkSwapChain,
    ) -> Result<(), BackendError> {
        unsafe { swap_chain.present(queue)? };
        Ok(())
    }

    fn rtv_descriptor_stride(&self, _device: &VkDevice) -> u32 {
        std::mem::size_of::<vk::ImageView>() as u32
    }

    fn create_rtv_heap(
        &mut self,
        device: &VkDevice,
        count: u32,
    ) -> Result<VkRtvHeap, BackendError> {
        Ok(VkRtvHeap::new(&device.shared, count))
    }

    fn heap_start(&self, _heap: &VkRtvHeap) -> CpuDescriptor {
        CpuDescriptor(0)
    }

    fn create_render_target_view(
        &mut self,
        _device: &VkDevice,
        swap_chain: &VkSwapChain,
        buffer: u32,
        heap: &mut VkRtvHeap,
        dest: CpuDescriptor,
    ) -> Result<(), BackendError> {
        let slot = dest.0 / std::mem::size_of::<vk::ImageView>();
        unsafe { heap.create_view(swap_chain, buffer, slot)? };
        Ok(())
    }

    fn create_command_allocator(&mut self, device: &VkDevice) -> Result<VkAllocator, BackendError> {
        Ok(unsafe { VkAllocator::new(&device.shared)? })
    }

    fn reset_command_allocator(&mut self, allocator: &mut VkAllocator) -> Result<(), BackendError> {
        unsafe { allocator.reset()? };
        Ok(())
    }

    fn create_fence(&mut self, device: &VkDevice, initial: u64) -> Result<VkFence, BackendError> {
        Ok(unsafe { VkFence::new(&device.shared, initial)? })
    }

    fn fence_completed_value(&self, fence: &VkFence) -> Result<u64, BackendError> {
        Ok(unsafe { fence.completed()? })
    }

    fn signal(
        &mut self,
        queue: &mut VkQueue,
        fence: &VkFence,
        value: u64,
    ) -> Result<(), BackendError> {
        let values = [value];
        let timeline = vk::TimelineSemaphoreSubmitInfo {
            s_type: vk::StructureType::TIMELINE_SEMAPHORE_SUBMIT_INFO,
            signal_semaphore_value_count: 1,
            p_signal_semaphore_values: values.as_ptr(),
            ..Default::default()
        };
        let sem = fence.semaphore();
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            p_next: (&timeline) as *const _ as *const _,
            signal_semaphore_count: 1,
            p_signal_semaphores: &sem,
            ..Default::default()
        };
        unsafe {
            queue
                .device
                .device
                .queue_submit(queue.queue, std::slice::from_ref(&submit), vk::Fence::null())
                .context("queue_submit(signal)")?;
        }
        queue.acquire_guards.fence_signalled(sem, value);
        Ok(())
    }

    fn create_event(&mut self, device: &VkDevice) -> Result<VkEvent, BackendError> {
        Ok(VkEvent::new(&device.shared))
    }

    fn set_event_on_completion(
        &mut self,
        fence: &VkFence,
        value: u64,
        event: &mut VkEvent,
    ) -> Result<(), BackendError> {
        event.arm(fence, value);
        Ok(())
    }

    fn wait_event(
        &mut self,
        event: &mut VkEvent,
        timeout: Option<Duration>,
    ) -> Result<WaitStatus, BackendError> {
        Ok(unsafe { event.wait(timeout_ns(timeout))? })
    }

    fn create_command_list(
        &mut self,
        _device: &VkDevice,
        allocator: &VkAllocator,
    ) -> Result<VkCommandList, BackendError> {
        Ok(VkCommandList::new(allocator))
    }

    fn reset_command_list(
        &mut self,
        list: &mut VkCommandList,
        allocator: &VkAllocator,
    ) -> Result<(), BackendError> {
        unsafe { list.begin(allocator)? };
        Ok(())
    }

    fn resource_barrier(
        &mut self,
        list: &mut VkCommandList,
        swap_chain: &VkSwapChain,
        buffer: u32,
        before: ResourceState,
        after: ResourceState,
    ) {
        if let Some(image) = swap_chain.image(buffer) {
            unsafe { list.transition(image, before, after) };
        }
    }

    fn clear_render_target(
        &mut self,
        list: &mut VkCommandList,
        heap: &VkRtvHeap,
        rtv: CpuDescriptor,
        rgba: [f32; 4],
    ) {
        let slot = rtv.0 / std::mem::size_of::<vk::ImageView>();
        match heap.view(slot) {
            Some((view, extent)) => unsafe { list.clear(view, extent, rgba) },
            None => tracing::warn!("clear on empty descriptor {rtv:?} skipped"),
        }
    }

    fn close_command_list(&mut self, list: &mut VkCommandList) -> Result<(), BackendError> {
        unsafe { list.end()? };
        Ok(())
    }
}
