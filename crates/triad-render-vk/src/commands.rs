// SPDX-License-Identifier: CEPL-1.0
use crate::DeviceShared;
use anyhow::{bail, Context, Result};
use ash::vk;
use std::sync::Arc;
use triad_render::hal::ResourceState;

/// A transient pool with the one primary buffer recorded from it each
/// frame. Resetting the pool recycles the buffer's memory.
pub struct VkAllocator {
    device: Arc<DeviceShared>,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

impl Drop for VkAllocator {
    fn drop(&mut self) {
        // Destroying the pool frees its buffer.
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}

impl VkAllocator {
    pub(crate) unsafe fn new(device: &Arc<DeviceShared>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: device.queue_family,
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            ..Default::default()
        };
        let pool = device
            .device
            .create_command_pool(&pool_info, None)
            .context("create_command_pool")?;
        let mut alloc = VkAllocator {
            device: Arc::clone(device),
            pool,
            buffer: vk::CommandBuffer::null(),
        };

        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let bufs = device
            .device
            .allocate_command_buffers(&alloc_info)
            .context("allocate_command_buffers")?;
        alloc.buffer = bufs[0];
        Ok(alloc)
    }

    pub(crate) unsafe fn reset(&mut self) -> Result<()> {
        self.device
            .device
            .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
            .context("reset_command_pool")
    }
}

/// Records into whichever allocator's buffer it was last reset onto.
pub struct VkCommandList {
    device: Arc<DeviceShared>,
    current: vk::CommandBuffer,
    recording: bool,
}

impl VkCommandList {
    pub(crate) fn new(allocator: &VkAllocator) -> Self {
        VkCommandList {
            device: Arc::clone(&allocator.device),
            current: allocator.buffer,
            recording: false,
        }
    }

    pub(crate) fn buffer(&self) -> vk::CommandBuffer {
        self.current
    }

    pub(crate) fn is_recording(&self) -> bool {
        self.recording
    }

    pub(crate) unsafe fn begin(&mut self, allocator: &VkAllocator) -> Result<()> {
        if self.recording {
            bail!("command list reset while recording");
        }
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        self.device
            .device
            .begin_command_buffer(allocator.buffer, &begin)
            .context("begin_command_buffer")?;
        self.current = allocator.buffer;
        self.recording = true;
        Ok(())
    }

    pub(crate) unsafe fn end(&mut self) -> Result<()> {
        if !self.recording {
            bail!("command list closed twice");
        }
        self.device
            .device
            .end_command_buffer(self.current)
            .context("end_command_buffer")?;
        self.recording = false;
        Ok(())
    }

    pub(crate) unsafe fn transition(
        &mut self,
        image: vk::Image,
        before: ResourceState,
        after: ResourceState,
    ) {
        let Some(barrier) = layout_barrier(image, before, after) else {
            return;
        };
        let dep = vk::DependencyInfo {
            s_type: vk::StructureType::DEPENDENCY_INFO,
            image_memory_barrier_count: 1,
            p_image_memory_barriers: &barrier,
            ..Default::default()
        };
        self.device.device.cmd_pipeline_barrier2(self.current, &dep);
    }

    /// An empty rendering pass whose load op does the clear.
    pub(crate) unsafe fn clear(
        &mut self,
        image_view: vk::ImageView,
        extent: vk::Extent2D,
        rgba: [f32; 4],
    ) {
        let color_att = vk::RenderingAttachmentInfo {
            s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
            image_view,
            image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue { float32: rgba },
            },
            ..Default::default()
        };
        let rendering_info = vk::RenderingInfo {
            s_type: vk::StructureType::RENDERING_INFO,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            layer_count: 1,
            color_attachment_count: 1,
            p_color_attachments: &color_att,
            ..Default::default()
        };
        let d = &self.device.device;
        d.cmd_begin_rendering(self.current, &rendering_info);
        d.cmd_end_rendering(self.current);
    }
}

/// Present -> render target discards the old contents (the frame clears
/// anyway); render target -> present publishes the colour writes.
fn layout_barrier(
    image: vk::Image,
    before: ResourceState,
    after: ResourceState,
) -> Option<vk::ImageMemoryBarrier2<'static>> {
    let subrange = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };
    let barrier = match (before, after) {
        (ResourceState::Present, ResourceState::RenderTarget) => vk::ImageMemoryBarrier2 {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
            src_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags2::empty(),
            dst_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            dst_access_mask: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags2::COLOR_ATTACHMENT_READ,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            image,
            subresource_range: subrange,
            ..Default::default()
        },
        (ResourceState::RenderTarget, ResourceState::Present) => vk::ImageMemoryBarrier2 {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
            src_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            dst_stage_mask: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            dst_access_mask: vk::AccessFlags2::empty(),
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            image,
            subresource_range: subrange,
            ..Default::default()
        },
        _ => return None,
    };
    Some(barrier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn barriers_follow_present_and_render_target_layouts() {
        let image = vk::Image::from_raw(0x1234);
        let (present, rt) = (ResourceState::Present, ResourceState::RenderTarget);
        let to_rt = layout_barrier(image, present, rt).unwrap();
        assert_eq!(to_rt.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(to_rt.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(to_rt.image, image);

        let to_present = layout_barrier(image, rt, present).unwrap();
        assert_eq!(to_present.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(to_present.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert!(to_present
            .src_access_mask
            .contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
    }

    #[test]
    fn same_state_needs_no_barrier() {
        let image = vk::Image::from_raw(1);
        for state in [ResourceState::Present, ResourceState::RenderTarget] {
            assert!(layout_barrier(image, state, state).is_none());
        }
    }
}
