// SPDX-License-Identifier: CEPL-1.0
use crate::content::{BackBuffer, Content, DrawCommands};
use crate::device::Device;
use crate::error::{FrameOp, PipelineError, Resource};
use crate::hal::{Backend, ResourceState};
use crate::swapchain::SwapChainManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListState {
    Closed,
    Recording,
}

/// One reusable command list, re-pointed at the current slot's allocator
/// every frame.
pub struct CommandRecorder<B: Backend> {
    list: B::CommandList,
    state: ListState,
}

impl<B: Backend> CommandRecorder<B> {
    /// The list starts closed.
    pub fn create(
        backend: &mut B,
        device: &Device<B>,
        allocator: &B::Allocator,
    ) -> Result<Self, PipelineError> {
        let list = backend
            .create_command_list(device.raw(), allocator)
            .map_err(PipelineError::resource(Resource::CommandList))?;
        Ok(CommandRecorder {
            list,
            state: ListState::Closed,
        })
    }

    pub fn begin_frame(
        &mut self,
        backend: &mut B,
        allocator: &B::Allocator,
    ) -> Result<(), PipelineError> {
        self.expect(ListState::Closed)?;
        backend
            .reset_command_list(&mut self.list, allocator)
            .map_err(PipelineError::frame(FrameOp::ResetList))?;
        self.state = ListState::Recording;
        Ok(())
    }

    /// Transition to render target, clear, content, transition back to
    /// present.
    pub fn record_frame(
        &mut self,
        backend: &mut B,
        swap_chain: &SwapChainManager<B>,
        back_buffer: BackBuffer,
        clear_color: [f32; 4],
        content: &mut dyn Content,
    ) -> Result<(), PipelineError> {
        self.expect(ListState::Recording)?;
        let sc = swap_chain.raw();
        let heap = swap_chain.rtv_heap();

        backend.resource_barrier(
            &mut self.list,
            sc,
            back_buffer.index,
            ResourceState::Present,
            ResourceState::RenderTarget,
        );
        backend.clear_render_target(&mut self.list, heap, back_buffer.rtv, clear_color);

        let mut writer = ListWriter {
            backend: &mut *backend,
            list: &mut self.list,
            heap,
            back_buffer,
        };
        content.record_draw_commands(&mut writer);

        backend.resource_barrier(
            &mut self.list,
            sc,
            back_buffer.index,
            ResourceState::RenderTarget,
            ResourceState::Present,
        );
        Ok(())
    }

    pub fn end_frame(&mut self, backend: &mut B) -> Result<(), PipelineError> {
        self.expect(ListState::Recording)?;
        backend
            .close_command_list(&mut self.list)
            .map_err(PipelineError::frame(FrameOp::CloseList))?;
        self.state = ListState::Closed;
        Ok(())
    }

    /// The closed list, ready for the queue.
    pub fn submittable(&self) -> Result<&B::CommandList, PipelineError> {
        self.expect(ListState::Closed)?;
        Ok(&self.list)
    }

    pub fn state(&self) -> ListState {
        self.state
    }

    fn expect(&self, expected: ListState) -> Result<(), PipelineError> {
        if self.state != expected {
            return Err(PipelineError::ListState {
                expected,
                found: self.state,
            });
        }
        Ok(())
    }
}

struct ListWriter<'a, B: Backend> {
    backend: &'a mut B,
    list: &'a mut B::CommandList,
    heap: &'a B::DescriptorHeap,
    back_buffer: BackBuffer,
}

impl<B: Backend> DrawCommands for ListWriter<'_, B> {
    fn back_buffer(&self) -> BackBuffer {
        self.back_buffer
    }

    fn clear(&mut self, rgba: [f32; 4]) {
        self.backend
            .clear_render_target(self.list, self.heap, self.back_buffer.rtv, rgba);
    }
}
