// SPDX-License-Identifier: CEPL-1.0
use crate::DeviceShared;
use anyhow::{anyhow, Context, Result};
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;
use triad_render::hal::WaitStatus;

/// Timeline semaphore standing in for a monotonic fence.
pub struct VkFence {
    device: Arc<DeviceShared>,
    sem: vk::Semaphore,
}

impl Drop for VkFence {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_semaphore(self.sem, None) };
    }
}

impl VkFence {
    pub(crate) unsafe fn new(device: &Arc<DeviceShared>, initial: u64) -> Result<Self> {
        let mut type_ci = vk::SemaphoreTypeCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_TYPE_CREATE_INFO,
            semaphore_type: vk::SemaphoreType::TIMELINE,
            initial_value: initial,
            ..Default::default()
        };
        let sem_ci = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            p_next: (&mut type_ci) as *mut _ as *const _,
            ..Default::default()
        };
        let sem = device
            .device
            .create_semaphore(&sem_ci, None)
            .context("create_semaphore(timeline)")?;
        Ok(VkFence {
            device: Arc::clone(device),
            sem,
        })
    }

    pub(crate) fn semaphore(&self) -> vk::Semaphore {
        self.sem
    }

    pub(crate) unsafe fn completed(&self) -> Result<u64> {
        self.device
            .device
            .get_semaphore_counter_value(self.sem)
            .context("get_semaphore_counter_value")
    }
}

/// Blocks until `sem` reaches `value`; `TIMEOUT` is reported, not an error.
pub(crate) unsafe fn wait_timeline(
    device: &ash::Device,
    sem: vk::Semaphore,
    value: u64,
    timeout_ns: u64,
) -> Result<WaitStatus> {
    let info = vk::SemaphoreWaitInfo {
        s_type: vk::StructureType::SEMAPHORE_WAIT_INFO,
        semaphore_count: 1,
        p_semaphores: &sem,
        p_values: &value,
        ..Default::default()
    };
    match device.wait_semaphores(&info, timeout_ns) {
        Ok(()) => Ok(WaitStatus::Signaled),
        Err(vk::Result::TIMEOUT) => Ok(WaitStatus::TimedOut),
        Err(e) => Err(anyhow!("wait_semaphores: {e:?}")),
    }
}

/// Host-side wait on one fence value. Armed by `set_event_on_completion`,
/// consumed by the wait.
pub struct VkEvent {
    device: Arc<DeviceShared>,
    pending: Option<(vk::Semaphore, u64)>,
}

impl VkEvent {
    pub(crate) fn new(device: &Arc<DeviceShared>) -> Self {
        VkEvent {
            device: Arc::clone(device),
            pending: None,
        }
    }

    pub(crate) fn arm(&mut self, fence: &VkFence, value: u64) {
        self.pending = Some((fence.sem, value));
    }

    /// An unarmed event counts as signalled.
    pub(crate) unsafe fn wait(&mut self, timeout_ns: u64) -> Result<WaitStatus> {
        let Some((sem, value)) = self.pending.take() else {
            return Ok(WaitStatus::Signaled);
        };
        wait_timeline(&self.device.device, sem, value, timeout_ns)
    }
}

/// Tracks, per acquire semaphore, the fence value whose completion proves
/// the submit that waited on it has run. A semaphore is fenced by the first
/// fence signal queued after the submit that consumed it.
#[derive(Default)]
pub(crate) struct AcquireGuards {
    consumed: Option<vk::Semaphore>,
    fenced: HashMap<vk::Semaphore, (vk::Semaphore, u64)>,
}

impl AcquireGuards {
    pub(crate) fn consumed(&mut self, acquire: vk::Semaphore) {
        self.consumed = Some(acquire);
    }

    pub(crate) fn fence_signalled(&mut self, fence: vk::Semaphore, value: u64) {
        if let Some(acquire) = self.consumed.take() {
            self.fenced.insert(acquire, (fence, value));
        }
    }

    /// Fence value to wait for before `acquire` may be handed out again.
    pub(crate) fn take(&mut self, acquire: vk::Semaphore) -> Option<(vk::Semaphore, u64)> {
        self.fenced.remove(&acquire)
    }
}
