// SPDX-License-Identifier: CEPL-1.0
use crate::device::Device;
use crate::error::{FrameOp, PipelineError, Resource};
use crate::hal::Backend;

/// Per back-buffer bundle. `fence_value` is the last value queued for
/// signalling on `fence`; the allocator is free once the fence reaches it.
pub struct FrameSlot<B: Backend> {
    allocator: B::Allocator,
    fence: B::Fence,
    pub(crate) fence_value: u64,
}

impl<B: Backend> FrameSlot<B> {
    pub fn allocator(&self) -> &B::Allocator {
        &self.allocator
    }

    pub fn fence(&self) -> &B::Fence {
        &self.fence
    }

    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }
}

/// Proof that a slot's fence has caught up with its last submission.
///
/// Only [`FenceSynchronizer::wait_for_slot`](crate::sync::FenceSynchronizer::wait_for_slot)
/// hands these out, and [`FrameResourceSet::reset_allocator`] consumes one.
#[must_use]
#[derive(Debug)]
pub struct SlotReady {
    pub(crate) slot: usize,
    pub(crate) target: u64,
    pub(crate) blocked: bool,
}

impl SlotReady {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// The CPU had to sleep for the GPU.
    pub fn was_blocked(&self) -> bool {
        self.blocked
    }
}

/// Exactly one slot per swap-chain buffer, addressed by buffer index.
pub struct FrameResourceSet<B: Backend> {
    slots: Vec<FrameSlot<B>>,
    resets: Vec<u64>,
}

impl<B: Backend> FrameResourceSet<B> {
    pub fn create(
        backend: &mut B,
        device: &Device<B>,
        count: usize,
    ) -> Result<Self, PipelineError> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let allocator = backend
                .create_command_allocator(device.raw())
                .map_err(PipelineError::resource(Resource::CommandAllocator))?;
            let fence = backend
                .create_fence(device.raw(), 0)
                .map_err(PipelineError::resource(Resource::Fence))?;
            slots.push(FrameSlot {
                allocator,
                fence,
                fence_value: 0,
            });
        }
        Ok(FrameResourceSet {
            slots,
            resets: vec![0; count],
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> &FrameSlot<B> {
        &self.slots[index]
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut FrameSlot<B> {
        &mut self.slots[index]
    }

    /// Recycles the slot's allocator memory.
    ///
    /// Re-checks the fence before touching the allocator: a token taken
    /// before a later signal on the same slot is stale and is refused.
    pub fn reset_allocator(
        &mut self,
        backend: &mut B,
        ready: SlotReady,
    ) -> Result<&B::Allocator, PipelineError> {
        let index = ready.slot;
        let slot = &mut self.slots[index];
        let completed = backend
            .fence_completed_value(&slot.fence)
            .map_err(PipelineError::frame(FrameOp::FenceRead))?;
        if completed < slot.fence_value {
            return Err(PipelineError::AllocatorInFlight {
                slot: index,
                target: slot.fence_value,
                completed,
            });
        }
        backend
            .reset_command_allocator(&mut slot.allocator)
            .map_err(PipelineError::frame(FrameOp::ResetAllocator))?;
        self.resets[index] += 1;
        Ok(&slot.allocator)
    }

    /// Allocator resets per slot.
    pub fn resets(&self) -> &[u64] {
        &self.resets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::testing::sim_device;
    use crate::sim::{SimConfig, SimFailure};

    #[test]
    fn one_allocator_and_fence_per_slot() {
        let (mut b, device, _queue) = sim_device(SimConfig::default());
        let ctl = b.control();
        let before = ctl.live_objects();
        let frames = FrameResourceSet::create(&mut b, &device, 3).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(ctl.live_objects(), before + 6);
        assert!((0..3).all(|i| frames.slot(i).fence_value() == 0));
        drop(frames);
        assert_eq!(ctl.live_objects(), before);
    }

    #[test]
    fn partial_creation_releases_what_was_made() {
        let (mut b, device, _queue) = sim_device(SimConfig {
            fail: Some(SimFailure::Fence),
            ..SimConfig::default()
        });
        let ctl = b.control();
        let before = ctl.live_objects();
        let err = FrameResourceSet::create(&mut b, &device, 3).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::ResourceCreationFailed {
                resource: Resource::Fence,
                ..
            }
        ));
        assert_eq!(ctl.live_objects(), before);
    }
}
