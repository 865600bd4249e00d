// SPDX-License-Identifier: CEPL-1.0
//! In-process GPU for headless runs and tests.
//!
//! Submitted work is retired on a worker thread in submission order, so
//! fence values really do advance asynchronously to the CPU. The backend
//! also audits misuse a real driver would only corrupt memory on: an
//! allocator reset while GPU work recorded from it is still queued fails.

mod timeline;

use crate::hal::{
    AdapterInfo, Backend, BackendError, CpuDescriptor, FeatureLevel, PresentTarget,
    ResourceState, SwapChainDesc, WaitStatus,
};
use crate::RenderSize;
use portable_atomic::{AtomicUsize, Ordering};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use std::cell::Cell;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::{fmt, io};
use timeline::{AllocatorCell, EventCell, FenceCell, GpuOp, Timeline, Tracked};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimAdapterDesc {
    pub name: String,
    pub software: bool,
    pub max_level: FeatureLevel,
}

impl SimAdapterDesc {
    pub fn hardware(name: &str, max_level: FeatureLevel) -> Self {
        SimAdapterDesc {
            name: name.to_string(),
            software: false,
            max_level,
        }
    }

    pub fn software(name: &str) -> Self {
        SimAdapterDesc {
            name: name.to_string(),
            software: true,
            max_level: FeatureLevel::L12_1,
        }
    }
}

/// Step at which the backend reports a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimFailure {
    Device,
    Queue,
    SwapChain,
    DescriptorHeap,
    RenderTargetView,
    Allocator,
    Fence,
    Event,
    CommandList,
    Submit,
    Signal,
    Present,
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub adapters: Vec<SimAdapterDesc>,
    pub rtv_stride: u32,
    /// Time the GPU spends on each executed command list.
    pub gpu_latency: Duration,
    /// Largest swap chain the surface accepts; bigger requests are clamped.
    pub max_extent: Option<RenderSize>,
    pub fail: Option<SimFailure>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            adapters: vec![
                SimAdapterDesc::software("Sim Basic Render Driver"),
                SimAdapterDesc::hardware("Sim GPU", FeatureLevel::L12_1),
            ],
            rtv_stride: 32,
            gpu_latency: Duration::ZERO,
            max_extent: None,
            fail: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SimCommand {
    Barrier {
        buffer: u32,
        before: ResourceState,
        after: ResourceState,
    },
    /// `buffer` is `None` when the descriptor did not resolve to a view.
    Clear { buffer: Option<u32>, rgba: [f32; 4] },
}

/// Creation calls (CPU side) and retired work (GPU side), in the order observed.
#[derive(Clone, Debug, PartialEq)]
pub enum SimTrace {
    AdapterProbed { index: u32 },
    DeviceCreated { adapter: u32, level: FeatureLevel },
    SwapChainCreated { width: u32, height: u32, buffers: u32 },
    AllocatorReset { allocator: u64 },
    ListExecuted { allocator: u64, commands: Vec<SimCommand> },
    FenceSignaled { fence: u64, value: u64 },
    Presented { buffer: u32 },
}

#[derive(Debug)]
pub struct SimError(String);

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SimError {}

fn sim_err(msg: impl Into<String>) -> BackendError {
    Box::new(SimError(msg.into()))
}

pub struct SimBackend {
    cfg: SimConfig,
    timeline: Arc<Timeline>,
    worker: Option<JoinHandle<()>>,
    live: Arc<AtomicUsize>,
    next_id: u64,
}

/// Test/tool handle onto a backend that may already be owned by a pipeline.
#[derive(Clone)]
pub struct SimControl {
    timeline: Arc<Timeline>,
    live: Arc<AtomicUsize>,
}

impl SimControl {
    /// Stop retiring GPU work; queued ops stay queued.
    pub fn pause(&self) {
        self.timeline.set_paused(true);
    }

    pub fn resume(&self) {
        self.timeline.set_paused(false);
    }

    pub fn pending_ops(&self) -> usize {
        self.timeline.pending()
    }

    pub fn trace(&self) -> Vec<SimTrace> {
        self.timeline.trace()
    }

    /// Native objects currently alive (devices, queues, fences, ...).
    pub fn live_objects(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

pub struct SimAdapter {
    index: u32,
    desc: SimAdapterDesc,
}

pub struct SimDevice {
    _tracked: Tracked,
}

pub struct SimQueue {
    _tracked: Tracked,
}

pub struct SimSwapChain {
    size: RenderSize,
    buffers: u32,
    current: u32,
    _tracked: Tracked,
}

pub struct SimDescriptorHeap {
    start: usize,
    stride: u32,
    views: Vec<Option<u32>>,
    _tracked: Tracked,
}

pub struct SimAllocator {
    cell: Arc<AllocatorCell>,
    _tracked: Tracked,
}

pub struct SimFence {
    id: u64,
    cell: Arc<FenceCell>,
    _tracked: Tracked,
}

pub struct SimFenceEvent {
    cell: Arc<EventCell>,
    _tracked: Tracked,
}

pub struct SimCommandList {
    open: bool,
    allocator: Arc<AllocatorCell>,
    commands: Vec<SimCommand>,
    _tracked: Tracked,
}

impl SimBackend {
    pub fn new(cfg: SimConfig) -> io::Result<Self> {
        let (timeline, worker) = Timeline::spawn(cfg.gpu_latency)?;
        Ok(SimBackend {
            cfg,
            timeline,
            worker: Some(worker),
            live: Arc::new(AtomicUsize::new(0)),
            next_id: 0,
        })
    }

    pub fn control(&self) -> SimControl {
        SimControl {
            timeline: Arc::clone(&self.timeline),
            live: Arc::clone(&self.live),
        }
    }

    fn check(&self, step: SimFailure) -> Result<(), BackendError> {
        if self.cfg.fail == Some(step) {
            return Err(sim_err(format!("injected failure at {step:?}")));
        }
        Ok(())
    }

    fn track(&self) -> Tracked {
        Tracked::new(&self.live)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl Drop for SimBackend {
    fn drop(&mut self) {
        self.timeline.stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Backend for SimBackend {
    type Adapter = SimAdapter;
    type Device = SimDevice;
    type Queue = SimQueue;
    type SwapChain = SimSwapChain;
    type DescriptorHeap = SimDescriptorHeap;
    type Allocator = SimAllocator;
    type Fence = SimFence;
    type Event = SimFenceEvent;
    type CommandList = SimCommandList;

    fn enum_adapter(&mut self, index: u32) -> Option<SimAdapter> {
        self.cfg
            .adapters
            .get(index as usize)
            .cloned()
            .map(|desc| SimAdapter { index, desc })
    }

    fn adapter_info(&self, adapter: &SimAdapter) -> AdapterInfo {
        AdapterInfo {
            index: adapter.index,
            name: adapter.desc.name.clone(),
            software: adapter.desc.software,
        }
    }

    fn probe_feature_level(&mut self, adapter: &SimAdapter, level: FeatureLevel) -> bool {
        self.timeline.record(SimTrace::AdapterProbed {
            index: adapter.index,
        });
        adapter.desc.max_level >= level
    }

    fn create_device(
        &mut self,
        adapter: &SimAdapter,
        level: FeatureLevel,
    ) -> Result<SimDevice, BackendError> {
        self.check(SimFailure::Device)?;
        if adapter.desc.max_level < level {
            return Err(sim_err(format!(
                "{} tops out at {}",
                adapter.desc.name, adapter.desc.max_level
            )));
        }
        self.timeline.record(SimTrace::DeviceCreated {
            adapter: adapter.index,
            level,
        });
        Ok(SimDevice {
            _tracked: self.track(),
        })
    }

    fn create_queue(&mut self, _device: &SimDevice) -> Result<SimQueue, BackendError> {
        self.check(SimFailure::Queue)?;
        Ok(SimQueue {
            _tracked: self.track(),
        })
    }

    fn execute_command_lists(
        &mut self,
        _queue: &mut SimQueue,
        lists: &[&SimCommandList],
    ) -> Result<(), BackendError> {
        self.check(SimFailure::Submit)?;
        if lists.iter().any(|l| l.open) {
            return Err(sim_err("executed a command list that is still recording"));
        }
        for list in lists {
            list.allocator.in_flight.fetch_add(1, Ordering::AcqRel);
            self.timeline.push(GpuOp::Execute {
                allocator: Arc::clone(&list.allocator),
                commands: list.commands.clone(),
            });
        }
        Ok(())
    }

    fn create_swap_chain(
        &mut self,
        _device: &SimDevice,
        _queue: &mut SimQueue,
        _target: &dyn PresentTarget,
        desc: &SwapChainDesc,
    ) -> Result<SimSwapChain, BackendError> {
        self.check(SimFailure::SwapChain)?;
        if desc.buffer_count == 0 {
            return Err(sim_err("swap chain needs at least one buffer"));
        }
        let size = match self.cfg.max_extent {
            Some(max) => RenderSize {
                width: desc.size.width.min(max.width),
                height: desc.size.height.min(max.height),
            },
            None => desc.size,
        };
        self.timeline.record(SimTrace::SwapChainCreated {
            width: size.width,
            height: size.height,
            buffers: desc.buffer_count,
        });
        Ok(SimSwapChain {
            size,
            buffers: desc.buffer_count,
            current: 0,
            _tracked: self.track(),
        })
    }

    fn swap_chain_buffer_count(&self, swap_chain: &SimSwapChain) -> u32 {
        swap_chain.buffers
    }

    fn swap_chain_size(&self, swap_chain: &SimSwapChain) -> RenderSize {
        swap_chain.size
    }

    fn current_back_buffer_index(&self, swap_chain: &SimSwapChain) -> u32 {
        swap_chain.current
    }

    fn present(
        &mut self,
        _queue: &mut SimQueue,
        swap_chain: &mut SimSwapChain,
    ) -> Result<(), BackendError> {
        self.check(SimFailure::Present)?;
        self.timeline.push(GpuOp::Present {
            buffer: swap_chain.current,
        });
        swap_chain.current = (swap_chain.current + 1) % swap_chain.buffers;
        Ok(())
    }

    fn rtv_descriptor_stride(&self, _device: &SimDevice) -> u32 {
        self.cfg.rtv_stride
    }

    fn create_rtv_heap(
        &mut self,
        _device: &SimDevice,
        count: u32,
    ) -> Result<SimDescriptorHeap, BackendError> {
        self.check(SimFailure::DescriptorHeap)?;
        let id = self.next_id() as usize;
        Ok(SimDescriptorHeap {
            start: 0x1_0000 * id,
            stride: self.cfg.rtv_stride.max(1),
            views: vec![None; count as usize],
            _tracked: self.track(),
        })
    }

    fn heap_start(&self, heap: &SimDescriptorHeap) -> CpuDescriptor {
        CpuDescriptor(heap.start)
    }

    fn create_render_target_view(
        &mut self,
        _device: &SimDevice,
        swap_chain: &SimSwapChain,
        buffer: u32,
        heap: &mut SimDescriptorHeap,
        dest: CpuDescriptor,
    ) -> Result<(), BackendError> {
        self.check(SimFailure::RenderTargetView)?;
        if buffer >= swap_chain.buffers {
            return Err(sim_err(format!("no back buffer {buffer}")));
        }
        let slot = heap
            .resolve(dest)
            .ok_or_else(|| sim_err(format!("descriptor {dest:?} outside heap")))?;
        heap.views[slot] = Some(buffer);
        Ok(())
    }

    fn create_command_allocator(
        &mut self,
        _device: &SimDevice,
    ) -> Result<SimAllocator, BackendError> {
        self.check(SimFailure::Allocator)?;
        let id = self.next_id();
        Ok(SimAllocator {
            cell: Arc::new(AllocatorCell {
                id,
                in_flight: AtomicUsize::new(0),
            }),
            _tracked: self.track(),
        })
    }

    fn reset_command_allocator(
        &mut self,
        allocator: &mut SimAllocator,
    ) -> Result<(), BackendError> {
        let in_flight = allocator.cell.in_flight.load(Ordering::Acquire);
        if in_flight > 0 {
            return Err(sim_err(format!(
                "allocator {} reset with {in_flight} command list(s) still in flight",
                allocator.cell.id
            )));
        }
        self.timeline.record(SimTrace::AllocatorReset {
            allocator: allocator.cell.id,
        });
        Ok(())
    }

    fn create_fence(
        &mut self,
        _device: &SimDevice,
        initial: u64,
    ) -> Result<SimFence, BackendError> {
        self.check(SimFailure::Fence)?;
        let id = self.next_id();
        Ok(SimFence {
            id,
            cell: Arc::new(FenceCell::new(initial)),
            _tracked: self.track(),
        })
    }

    fn fence_completed_value(&self, fence: &SimFence) -> Result<u64, BackendError> {
        Ok(fence.cell.completed())
    }

    fn signal(
        &mut self,
        _queue: &mut SimQueue,
        fence: &SimFence,
        value: u64,
    ) -> Result<(), BackendError> {
        self.check(SimFailure::Signal)?;
        self.timeline.push(GpuOp::Signal {
            fence: Arc::clone(&fence.cell),
            fence_id: fence.id,
            value,
        });
        Ok(())
    }

    fn create_event(&mut self, _device: &SimDevice) -> Result<SimFenceEvent, BackendError> {
        self.check(SimFailure::Event)?;
        Ok(SimFenceEvent {
            cell: Arc::new(EventCell::default()),
            _tracked: self.track(),
        })
    }

    fn set_event_on_completion(
        &mut self,
        fence: &SimFence,
        value: u64,
        event: &mut SimFenceEvent,
    ) -> Result<(), BackendError> {
        event.cell.reset();
        fence.cell.notify_at(value, Arc::clone(&event.cell));
        Ok(())
    }

    fn wait_event(
        &mut self,
        event: &mut SimFenceEvent,
        timeout: Option<Duration>,
    ) -> Result<WaitStatus, BackendError> {
        Ok(if event.cell.wait(timeout) {
            WaitStatus::Signaled
        } else {
            WaitStatus::TimedOut
        })
    }

    fn create_command_list(
        &mut self,
        _device: &SimDevice,
        allocator: &SimAllocator,
    ) -> Result<SimCommandList, BackendError> {
        self.check(SimFailure::CommandList)?;
        Ok(SimCommandList {
            open: false,
            allocator: Arc::clone(&allocator.cell),
            commands: Vec::new(),
            _tracked: self.track(),
        })
    }

    fn reset_command_list(
        &mut self,
        list: &mut SimCommandList,
        allocator: &SimAllocator,
    ) -> Result<(), BackendError> {
        if list.open {
            return Err(sim_err("command list reset while recording"));
        }
        list.allocator = Arc::clone(&allocator.cell);
        list.commands.clear();
        list.open = true;
        Ok(())
    }

    fn resource_barrier(
        &mut self,
        list: &mut SimCommandList,
        _swap_chain: &SimSwapChain,
        buffer: u32,
        before: ResourceState,
        after: ResourceState,
    ) {
        list.commands.push(SimCommand::Barrier {
            buffer,
            before,
            after,
        });
    }

    fn clear_render_target(
        &mut self,
        list: &mut SimCommandList,
        heap: &SimDescriptorHeap,
        rtv: CpuDescriptor,
        rgba: [f32; 4],
    ) {
        let buffer = heap.resolve(rtv).and_then(|slot| heap.views[slot]);
        list.commands.push(SimCommand::Clear { buffer, rgba });
    }

    fn close_command_list(&mut self, list: &mut SimCommandList) -> Result<(), BackendError> {
        if !list.open {
            return Err(sim_err("command list closed twice"));
        }
        list.open = false;
        Ok(())
    }
}

impl SimCommandList {
    /// Commands recorded since the last reset.
    pub fn commands(&self) -> &[SimCommand] {
        &self.commands
    }
}

impl SimDescriptorHeap {
    fn resolve(&self, handle: CpuDescriptor) -> Option<usize> {
        let offset = handle.0.checked_sub(self.start)?;
        let stride = self.stride as usize;
        if offset % stride != 0 {
            return None;
        }
        let slot = offset / stride;
        (slot < self.views.len()).then_some(slot)
    }
}

/// A window stand-in with no native handles.
pub struct HeadlessTarget {
    monitor: Option<RenderSize>,
    borderless: Cell<bool>,
}

impl HeadlessTarget {
    pub fn new() -> Self {
        HeadlessTarget {
            monitor: None,
            borderless: Cell::new(false),
        }
    }

    pub fn with_monitor(size: RenderSize) -> Self {
        HeadlessTarget {
            monitor: Some(size),
            borderless: Cell::new(false),
        }
    }

    pub fn is_borderless(&self) -> bool {
        self.borderless.get()
    }
}

impl Default for HeadlessTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl HasWindowHandle for HeadlessTarget {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        Err(HandleError::Unavailable)
    }
}

impl HasDisplayHandle for HeadlessTarget {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        Err(HandleError::Unavailable)
    }
}

impl PresentTarget for HeadlessTarget {
    fn monitor_size(&self) -> Option<RenderSize> {
        self.monitor
    }

    fn set_borderless(&self) {
        self.borderless.set(true);
    }
}
