// SPDX-License-Identifier: CEPL-1.0
use crate::hal::{BackendError, FeatureLevel};
use crate::recorder::ListState;
use std::fmt;
use thiserror::Error;

/// Native objects created after the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Queue,
    DescriptorHeap,
    RenderTargetView,
    CommandAllocator,
    CommandList,
    Fence,
    Event,
}

/// Per-frame operations; any failure here is fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOp {
    ResetAllocator,
    ResetList,
    CloseList,
    Submit,
    Signal,
    FenceRead,
    Wait,
    Present,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Resource::Queue => "command queue",
            Resource::DescriptorHeap => "RTV descriptor heap",
            Resource::RenderTargetView => "render target view",
            Resource::CommandAllocator => "command allocator",
            Resource::CommandList => "command list",
            Resource::Fence => "fence",
            Resource::Event => "fence event",
        };
        f.write_str(s)
    }
}

impl fmt::Display for FrameOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FrameOp::ResetAllocator => "allocator reset",
            FrameOp::ResetList => "command list reset",
            FrameOp::CloseList => "command list close",
            FrameOp::Submit => "submit",
            FrameOp::Signal => "fence signal",
            FrameOp::FenceRead => "fence read",
            FrameOp::Wait => "fence wait",
            FrameOp::Present => "present",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no hardware adapter supports feature level {0}")]
    AdapterNotFound(FeatureLevel),

    #[error("device creation failed")]
    DeviceCreationFailed(#[source] BackendError),

    #[error("swap chain creation failed")]
    SwapChainCreationFailed(#[source] BackendError),

    #[error("failed to create {resource}")]
    ResourceCreationFailed {
        resource: Resource,
        #[source]
        source: BackendError,
    },

    #[error("fence for slot {slot} stuck at {completed}, waited for {target} (GPU hang?)")]
    SyncTimeout { slot: usize, target: u64, completed: u64 },

    #[error("{op} failed")]
    FrameFailed {
        op: FrameOp,
        #[source]
        source: BackendError,
    },

    #[error("allocator for slot {slot} still in flight ({completed} < {target})")]
    AllocatorInFlight { slot: usize, target: u64, completed: u64 },

    #[error("command list is {found:?}, expected {expected:?}")]
    ListState { expected: ListState, found: ListState },

    #[error("pipeline already shut down")]
    ShutDown,

    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    pub(crate) fn resource(resource: Resource) -> impl FnOnce(BackendError) -> Self {
        move |source| PipelineError::ResourceCreationFailed { resource, source }
    }

    pub(crate) fn frame(op: FrameOp) -> impl FnOnce(BackendError) -> Self {
        move |source| PipelineError::FrameFailed { op, source }
    }

    /// True for the startup taxonomy (adapter, device, swap chain, resources).
    pub fn is_init_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::AdapterNotFound(_)
                | PipelineError::DeviceCreationFailed(_)
                | PipelineError::SwapChainCreationFailed(_)
                | PipelineError::ResourceCreationFailed { .. }
                | PipelineError::InvalidConfig(_)
        )
    }
}
