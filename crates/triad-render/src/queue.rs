// SPDX-License-Identifier: CEPL-1.0
use crate::device::Device;
use crate::error::{FrameOp, PipelineError, Resource};
use crate::hal::Backend;

/// The single ordered stream to the GPU. Lists execute in submission order;
/// completion is only observable through a fence.
pub struct CommandQueue<B: Backend> {
    raw: B::Queue,
    submitted: u64,
}

impl<B: Backend> CommandQueue<B> {
    pub fn create(backend: &mut B, device: &Device<B>) -> Result<Self, PipelineError> {
        let raw = backend
            .create_queue(device.raw())
            .map_err(PipelineError::resource(Resource::Queue))?;
        Ok(CommandQueue { raw, submitted: 0 })
    }

    pub fn submit(&mut self, backend: &mut B, list: &B::CommandList) -> Result<(), PipelineError> {
        backend
            .execute_command_lists(&mut self.raw, &[list])
            .map_err(PipelineError::frame(FrameOp::Submit))?;
        self.submitted += 1;
        Ok(())
    }

    /// Command lists handed to the GPU so far.
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn raw_mut(&mut self) -> &mut B::Queue {
        &mut self.raw
    }
}
