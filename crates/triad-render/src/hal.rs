// SPDX-License-Identifier: CEPL-1.0
//! The native seam. One `Backend` method per GPU call the pipeline makes.
//!
//! Handles are owning: dropping one releases the native object. The
//! pipeline keeps them in fields ordered so that children drop before the
//! objects they were created from.

use crate::RenderSize;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::{fmt, str::FromStr, time::Duration};

/// Opaque native failure. The pipeline maps it into `PipelineError`.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureLevel {
    L11_0,
    L11_1,
    L12_0,
    L12_1,
}

impl fmt::Display for FeatureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FeatureLevel::L11_0 => "11_0",
            FeatureLevel::L11_1 => "11_1",
            FeatureLevel::L12_0 => "12_0",
            FeatureLevel::L12_1 => "12_1",
        })
    }
}

impl FromStr for FeatureLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "11_0" => Ok(FeatureLevel::L11_0),
            "11_1" => Ok(FeatureLevel::L11_1),
            "12_0" => Ok(FeatureLevel::L12_0),
            "12_1" => Ok(FeatureLevel::L12_1),
            other => Err(format!("unknown feature level {other:?}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterInfo {
    pub index: u32,
    pub name: String,
    pub software: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceState {
    Present,
    RenderTarget,
}

/// CPU-side descriptor address inside a non-shader-visible heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuDescriptor(pub usize);

impl CpuDescriptor {
    pub fn offset(self, index: u32, stride: u32) -> Self {
        CpuDescriptor(self.0 + index as usize * stride as usize)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapChainDesc {
    /// In fullscreen this is the monitor's size, which the window may not
    /// have reached yet when the swap chain is created.
    pub size: RenderSize,
    pub buffer_count: u32,
    pub vsync: bool,
    pub fullscreen: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

/// What the windowing layer hands over at swap-chain creation.
pub trait PresentTarget: HasWindowHandle + HasDisplayHandle {
    /// Native resolution of the monitor the window sits on.
    fn monitor_size(&self) -> Option<RenderSize>;
    /// Strip decorations and cover the monitor.
    fn set_borderless(&self);
}

pub trait Backend {
    type Adapter;
    type Device;
    type Queue;
    type SwapChain;
    type DescriptorHeap;
    type Allocator;
    type Fence;
    type Event;
    type CommandList;

    // --- adapters -----------------------------------------------------------
    /// `None` once `index` runs past the last adapter.
    fn enum_adapter(&mut self, index: u32) -> Option<Self::Adapter>;
    fn adapter_info(&self, adapter: &Self::Adapter) -> AdapterInfo;
    /// Would device creation succeed at `level`? Must not create anything.
    fn probe_feature_level(&mut self, adapter: &Self::Adapter, level: FeatureLevel) -> bool;

    // --- device / queue -----------------------------------------------------
    fn create_device(
        &mut self,
        adapter: &Self::Adapter,
        level: FeatureLevel,
    ) -> Result<Self::Device, BackendError>;
    fn create_queue(&mut self, device: &Self::Device) -> Result<Self::Queue, BackendError>;
    fn execute_command_lists(
        &mut self,
        queue: &mut Self::Queue,
        lists: &[&Self::CommandList],
    ) -> Result<(), BackendError>;

    // --- swap chain ---------------------------------------------------------
    fn create_swap_chain(
        &mut self,
        device: &Self::Device,
        queue: &mut Self::Queue,
        target: &dyn PresentTarget,
        desc: &SwapChainDesc,
    ) -> Result<Self::SwapChain, BackendError>;
    fn swap_chain_buffer_count(&self, swap_chain: &Self::SwapChain) -> u32;
    /// Extent the back buffers were actually created with.
    fn swap_chain_size(&self, swap_chain: &Self::SwapChain) -> RenderSize;
    fn current_back_buffer_index(&self, swap_chain: &Self::SwapChain) -> u32;
    fn present(
        &mut self,
        queue: &mut Self::Queue,
        swap_chain: &mut Self::SwapChain,
    ) -> Result<(), BackendError>;

    // --- descriptors --------------------------------------------------------
    /// Increment between consecutive RTV descriptors; hardware dependent.
    fn rtv_descriptor_stride(&self, device: &Self::Device) -> u32;
    fn create_rtv_heap(
        &mut self,
        device: &Self::Device,
        count: u32,
    ) -> Result<Self::DescriptorHeap, BackendError>;
    fn heap_start(&self, heap: &Self::DescriptorHeap) -> CpuDescriptor;
    fn create_render_target_view(
        &mut self,
        device: &Self::Device,
        swap_chain: &Self::SwapChain,
        buffer: u32,
        heap: &mut Self::DescriptorHeap,
        dest: CpuDescriptor,
    ) -> Result<(), BackendError>;

    // --- per-slot resources -------------------------------------------------
    fn create_command_allocator(
        &mut self,
        device: &Self::Device,
    ) -> Result<Self::Allocator, BackendError>;
    fn reset_command_allocator(&mut self, allocator: &mut Self::Allocator)
        -> Result<(), BackendError>;
    fn create_fence(&mut self, device: &Self::Device, initial: u64)
        -> Result<Self::Fence, BackendError>;
    fn fence_completed_value(&self, fence: &Self::Fence) -> Result<u64, BackendError>;
    /// Queue a GPU-side signal of `fence` to `value` behind all prior work.
    fn signal(
        &mut self,
        queue: &mut Self::Queue,
        fence: &Self::Fence,
        value: u64,
    ) -> Result<(), BackendError>;

    // --- CPU wait -----------------------------------------------------------
    fn create_event(&mut self, device: &Self::Device) -> Result<Self::Event, BackendError>;
    /// Arm `event` to fire when `fence` reaches `value`.
    fn set_event_on_completion(
        &mut self,
        fence: &Self::Fence,
        value: u64,
        event: &mut Self::Event,
    ) -> Result<(), BackendError>;
    /// Block until the armed event fires; `None` waits forever.
    fn wait_event(
        &mut self,
        event: &mut Self::Event,
        timeout: Option<Duration>,
    ) -> Result<WaitStatus, BackendError>;

    // --- command lists ------------------------------------------------------
    /// Created closed.
    fn create_command_list(
        &mut self,
        device: &Self::Device,
        allocator: &Self::Allocator,
    ) -> Result<Self::CommandList, BackendError>;
    fn reset_command_list(
        &mut self,
        list: &mut Self::CommandList,
        allocator: &Self::Allocator,
    ) -> Result<(), BackendError>;
    fn resource_barrier(
        &mut self,
        list: &mut Self::CommandList,
        swap_chain: &Self::SwapChain,
        buffer: u32,
        before: ResourceState,
        after: ResourceState,
    );
    fn clear_render_target(
        &mut self,
        list: &mut Self::CommandList,
        heap: &Self::DescriptorHeap,
        rtv: CpuDescriptor,
        rgba: [f32; 4],
    );
    fn close_command_list(&mut self, list: &mut Self::CommandList) -> Result<(), BackendError>;
}
