// SPDX-License-Identifier: CEPL-1.0
use crate::sync::wait_timeline;
use crate::{DeviceShared, InstanceShared, VkQueue};
use anyhow::{anyhow, bail, Context, Result};
use ash::khr::surface;
use ash::vk;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use triad_render::hal::{PresentTarget, SwapChainDesc, WaitStatus};
use triad_render::RenderSize;

// Borderless fullscreen lands asynchronously on most window systems.
const SETTLE_POLLS: u32 = 20;
const SETTLE_STEP: Duration = Duration::from_millis(25);

struct SurfaceGuard {
    instance: Arc<InstanceShared>,
    surface: vk::SurfaceKHR,
}

impl Drop for SurfaceGuard {
    fn drop(&mut self) {
        unsafe {
            self.instance
                .surface_loader
                .destroy_surface(self.surface, None)
        };
    }
}

/// Swap chain plus the binary semaphores that order acquire, render and
/// present. `image_index` is always an acquired image.
pub struct VkSwapChain {
    device: Arc<DeviceShared>,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::Format,
    extent: vk::Extent2D,
    // Handed out round-robin, one more than images. Before reuse, the host
    // waits for the fence value signalled behind the submit that consumed
    // it (see `VkQueue::acquire_guards`), whatever order images return in.
    acquire_sems: Vec<vk::Semaphore>,
    // Per image, signalled by the submit that renders into it.
    present_sems: Vec<vk::Semaphore>,
    acquire_cursor: usize,
    image_index: u32,
    // Surface outlives the swap chain built on it.
    _surface: SurfaceGuard,
}

impl Drop for VkSwapChain {
    fn drop(&mut self) {
        unsafe {
            let d = &self.device.device;
            // Presentation may still hold the semaphores.
            d.device_wait_idle().ok();
            for &s in self.acquire_sems.iter().chain(&self.present_sems) {
                d.destroy_semaphore(s, None);
            }
            self.device
                .swapchain_loader
                .destroy_swapchain(self.swapchain, None);
        }
    }
}

pub(crate) fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| {
            formats
                .iter()
                .copied()
                .find(|f| f.format == vk::Format::B8G8R8A8_SRGB)
        })
        .or_else(|| formats.first().copied())
}

pub(crate) fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [
        vk::PresentModeKHR::IMMEDIATE,
        vk::PresentModeKHR::MAILBOX,
        vk::PresentModeKHR::FIFO,
    ]
    .into_iter()
    .find(|m| modes.contains(m))
    .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub(crate) fn extent_from_caps(
    caps: &vk::SurfaceCapabilitiesKHR,
    want: RenderSize,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// True once the surface extent is undefined or matches `want`.
pub(crate) fn surface_reached(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> bool {
    let e = caps.current_extent;
    e.width == u32::MAX || (e.width == want.width && e.height == want.height)
}

/// Surface capabilities once a fullscreen window has grown to `want`, or
/// after the settle budget runs out.
unsafe fn settled_caps(
    loader: &surface::Instance,
    phys: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    want: RenderSize,
) -> Result<vk::SurfaceCapabilitiesKHR> {
    let mut caps = loader.get_physical_device_surface_capabilities(phys, surface)?;
    for _ in 0..SETTLE_POLLS {
        if surface_reached(&caps, want) {
            return Ok(caps);
        }
        thread::sleep(SETTLE_STEP);
        caps = loader.get_physical_device_surface_capabilities(phys, surface)?;
    }
    if !surface_reached(&caps, want) {
        warn!(
            "window still {}x{}, not {}x{}; sizing the swap chain to the window",
            caps.current_extent.width, caps.current_extent.height, want.width, want.height
        );
    }
    Ok(caps)
}

/// `wanted` clamped to what the surface allows; `max_image_count == 0`
/// means unbounded.
pub(crate) fn image_count(caps: &vk::SurfaceCapabilitiesKHR, wanted: u32) -> u32 {
    let n = wanted.max(caps.min_image_count);
    if caps.max_image_count == 0 {
        n
    } else {
        n.min(caps.max_image_count)
    }
}

pub(crate) unsafe fn create(
    device: &Arc<DeviceShared>,
    queue: &mut VkQueue,
    target: &dyn PresentTarget,
    desc: &SwapChainDesc,
) -> Result<VkSwapChain> {
    let inst = &device.instance;
    let dh = target.display_handle()?.as_raw();
    let wh = target.window_handle()?.as_raw();
    let surface = ash_window::create_surface(&inst.entry, &inst.instance, dh, wh, None)
        .context("create_surface")?;
    let guard = SurfaceGuard {
        instance: Arc::clone(inst),
        surface,
    };

    let loader = &inst.surface_loader;
    if !loader
        .get_physical_device_surface_support(device.phys, device.queue_family, surface)
        .context("get_physical_device_surface_support")?
    {
        bail!("queue family {} cannot present to this window", device.queue_family);
    }
    let caps = if desc.fullscreen {
        settled_caps(loader, device.phys, surface, desc.size)?
    } else {
        loader.get_physical_device_surface_capabilities(device.phys, surface)?
    };
    let formats = loader.get_physical_device_surface_formats(device.phys, surface)?;
    let modes = loader.get_physical_device_surface_present_modes(device.phys, surface)?;

    let surf_format =
        choose_surface_format(&formats).ok_or_else(|| anyhow!("surface reports no formats"))?;
    let present_mode = choose_present_mode(&modes, desc.vsync);
    let extent = extent_from_caps(&caps, desc.size);
    let min_count = image_count(&caps, desc.buffer_count);

    let swap_info = vk::SwapchainCreateInfoKHR {
        s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
        surface,
        min_image_count: min_count,
        image_format: surf_format.format,
        image_color_space: surf_format.color_space,
        image_extent: extent,
        image_array_layers: 1,
        image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        image_sharing_mode: vk::SharingMode::EXCLUSIVE,
        pre_transform: caps.current_transform,
        composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        present_mode,
        clipped: vk::TRUE,
        ..Default::default()
    };
    let swapchain = device
        .swapchain_loader
        .create_swapchain(&swap_info, None)
        .context("create_swapchain")?;

    // From here on Drop cleans up whatever has been created.
    let mut sc = VkSwapChain {
        device: Arc::clone(device),
        swapchain,
        images: Vec::new(),
        format: surf_format.format,
        extent,
        acquire_sems: Vec::new(),
        present_sems: Vec::new(),
        acquire_cursor: 0,
        image_index: 0,
        _surface: guard,
    };
    sc.images = device
        .swapchain_loader
        .get_swapchain_images(swapchain)
        .context("get_swapchain_images")?;

    let sem_ci = vk::SemaphoreCreateInfo::default();
    for _ in 0..sc.images.len() {
        sc.present_sems
            .push(device.device.create_semaphore(&sem_ci, None)?);
    }
    for _ in 0..=sc.images.len() {
        sc.acquire_sems
            .push(device.device.create_semaphore(&sem_ci, None)?);
    }
    sc.acquire(queue)?;

    info!(
        "Vulkan swapchain ready ({}x{}, {} images, fmt 0x{:x}, {:?})",
        extent.width,
        extent.height,
        sc.images.len(),
        sc.format.as_raw(),
        present_mode
    );
    Ok(sc)
}

impl VkSwapChain {
    /// Acquires the next image and hands its semaphores to the queue for
    /// the next submit.
    unsafe fn acquire(&mut self, queue: &mut VkQueue) -> Result<()> {
        let sem = self.acquire_sems[self.acquire_cursor];
        self.acquire_cursor = (self.acquire_cursor + 1) % self.acquire_sems.len();
        if let Some((fence, value)) = queue.acquire_guards.take(sem) {
            let status = wait_timeline(&self.device.device, fence, value, u64::MAX)?;
            if status != WaitStatus::Signaled {
                bail!("acquire semaphore still awaited by the GPU");
            }
        }

        let (index, suboptimal) = self
            .device
            .swapchain_loader
            .acquire_next_image(self.swapchain, u64::MAX, sem, vk::Fence::null())
            .context("acquire_next_image")?;
        if suboptimal {
            debug!("acquire: swap chain suboptimal");
        }
        self.image_index = index;
        queue.pending_wait = Some(sem);
        queue.pending_signal = Some(self.present_sems[index as usize]);
        Ok(())
    }

    pub(crate) unsafe fn present(&mut self, queue: &mut VkQueue) -> Result<()> {
        if queue.pending_signal.is_some() {
            bail!("present of image {} with nothing rendered to it", self.image_index);
        }
        let wait = self.present_sems[self.image_index as usize];
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &self.swapchain,
            p_image_indices: &self.image_index,
            ..Default::default()
        };
        match self
            .device
            .swapchain_loader
            .queue_present(queue.queue, &present)
        {
            Ok(false) => {}
            Ok(true) => debug!("present: swap chain suboptimal"),
            Err(e) => return Err(anyhow!("queue_present: {e:?}")),
        }
        self.acquire(queue)
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub fn image(&self, index: u32) -> Option<vk::Image> {
        self.images.get(index as usize).copied()
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

/// Render-target views of the swap-chain images, addressed by descriptor
/// slot.
pub struct VkRtvHeap {
    device: Arc<DeviceShared>,
    views: Vec<Option<(vk::ImageView, vk::Extent2D)>>,
}

impl Drop for VkRtvHeap {
    fn drop(&mut self) {
        unsafe {
            for (view, _) in self.views.iter().flatten() {
                self.device.device.destroy_image_view(*view, None);
            }
        }
    }
}

impl VkRtvHeap {
    pub(crate) fn new(device: &Arc<DeviceShared>, count: u32) -> Self {
        VkRtvHeap {
            device: Arc::clone(device),
            views: vec![None; count as usize],
        }
    }

    pub(crate) unsafe fn create_view(
        &mut self,
        sc: &VkSwapChain,
        buffer: u32,
        slot: usize,
    ) -> Result<()> {
        let image = sc
            .image(buffer)
            .ok_or_else(|| anyhow!("no swap chain image {buffer}"))?;
        if slot >= self.views.len() {
            bail!("descriptor slot {slot} outside heap of {}", self.views.len());
        }
        let iv_info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format: sc.format(),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        let view = self
            .device
            .device
            .create_image_view(&iv_info, None)
            .context("create_image_view")?;
        if let Some((old, _)) = self.views[slot].replace((view, sc.extent())) {
            self.device.device.destroy_image_view(old, None);
        }
        Ok(())
    }

    pub(crate) fn view(&self, slot: usize) -> Option<(vk::ImageView, vk::Extent2D)> {
        self.views.get(slot).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn prefers_bgra_unorm_in_srgb_space() {
        let formats = [
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats), Some(formats[2]));
        assert_eq!(choose_surface_format(&formats[..2]), Some(formats[1]));
        assert_eq!(choose_surface_format(&formats[..1]), Some(formats[0]));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn vsync_always_means_fifo() {
        let all = [
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::FIFO,
        ];
        assert_eq!(choose_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&all, false), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX], false),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(choose_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_follows_surface_unless_undefined() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        };
        let want = RenderSize {
            width: 800,
            height: 600,
        };
        assert_eq!(extent_from_caps(&caps, want).width, 1920);

        caps.current_extent.width = u32::MAX;
        let e = extent_from_caps(&caps, want);
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn fullscreen_waits_for_the_window_to_reach_the_monitor() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let monitor = RenderSize {
            width: 1920,
            height: 1080,
        };
        assert!(!surface_reached(&caps, monitor));
        caps.current_extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        assert!(surface_reached(&caps, monitor));
        caps.current_extent.width = u32::MAX;
        assert!(surface_reached(&caps, monitor));
    }

    #[test]
    fn image_count_is_clamped_to_surface_limits() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(image_count(&caps, 3), 3);
        assert_eq!(image_count(&caps, 1), 2);
        caps.max_image_count = 2;
        assert_eq!(image_count(&caps, 3), 2);
    }
}
