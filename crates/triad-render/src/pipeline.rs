// SPDX-License-Identifier: CEPL-1.0
//! The owning frame context: every GPU object of the pipeline lives in one
//! [`FramePipeline`] and is released in reverse creation order.
//!
//! One frame, for the slot `i` the swap chain will show next:
//!
//! 1. wait until slot `i`'s fence has reached its last target
//! 2. reset slot `i`'s allocator, update content
//! 3. reset the list on that allocator, record, close
//! 4. submit, signal slot `i`'s fence with `target + 1`, present
//!
//! Up to `buffer_count` frames can be in flight; the CPU only sleeps in
//! step 1.

use crate::adapter::select_adapter;
use crate::content::{Content, FrameState};
use crate::device::Device;
use crate::error::{FrameOp, PipelineError};
use crate::frame::FrameResourceSet;
use crate::hal::{AdapterInfo, Backend, FeatureLevel, PresentTarget};
use crate::queue::CommandQueue;
use crate::recorder::CommandRecorder;
use crate::swapchain::{SwapChainManager, SwapChainOptions};
use crate::sync::FenceSynchronizer;
use crate::{RenderSize, Renderer};
use std::time::{Duration, Instant};
use tracing::{error, info};

pub const MIN_BUFFERS: u32 = 2;
pub const MAX_BUFFERS: u32 = 16;

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub size: RenderSize,
    pub fullscreen: bool,
    pub buffer_count: u32,
    pub feature_level: FeatureLevel,
    pub clear_color: [f32; 4],
    pub vsync: bool,
    /// Upper bound on one fence wait; `None` waits forever.
    pub fence_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            size: RenderSize {
                width: 800,
                height: 600,
            },
            fullscreen: false,
            buffer_count: 3,
            feature_level: FeatureLevel::L11_0,
            clear_color: [0.0, 0.2, 0.4, 1.0],
            vsync: true,
            fence_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.size.width == 0 || self.size.height == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "window size {}x{} has a zero dimension",
                self.size.width, self.size.height
            )));
        }
        if !(MIN_BUFFERS..=MAX_BUFFERS).contains(&self.buffer_count) {
            return Err(PipelineError::InvalidConfig(format!(
                "buffer count {} outside {MIN_BUFFERS}..={MAX_BUFFERS}",
                self.buffer_count
            )));
        }
        Ok(())
    }
}

/// What one `render_frame` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameReport {
    /// Zero-based frame number.
    pub frame: u64,
    pub slot: usize,
    /// Fence value signalled behind this frame's list.
    pub fence_value: u64,
    /// The CPU slept waiting for the slot.
    pub waited: bool,
}

pub struct FramePipeline<B: Backend> {
    // Drop order is reverse creation order: GPU objects before the device,
    // the device before the backend that owns the instance.
    recorder: CommandRecorder<B>,
    sync: FenceSynchronizer<B>,
    frames: FrameResourceSet<B>,
    swap_chain: SwapChainManager<B>,
    queue: CommandQueue<B>,
    device: Device<B>,
    backend: B,

    clear_color: [f32; 4],
    frame_number: u64,
    last_frame: Option<Instant>,
    shut_down: bool,
}

impl<B: Backend> FramePipeline<B> {
    /// Builds the whole pipeline. On any failure everything created so far
    /// is released before the error is returned.
    pub fn init(
        mut backend: B,
        target: &dyn PresentTarget,
        cfg: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        cfg.validate()?;

        let selected = select_adapter(&mut backend, cfg.feature_level)?;
        let device = Device::create(&mut backend, selected, cfg.feature_level)?;
        let mut queue = CommandQueue::create(&mut backend, &device)?;
        let swap_chain = SwapChainManager::create(
            &mut backend,
            &device,
            &mut queue,
            target,
            SwapChainOptions {
                size: cfg.size,
                buffer_count: cfg.buffer_count,
                fullscreen: cfg.fullscreen,
                vsync: cfg.vsync,
            },
        )?;
        let slots = swap_chain.buffer_count() as usize;
        let frames = FrameResourceSet::create(&mut backend, &device, slots)?;
        let recorder = CommandRecorder::create(&mut backend, &device, frames.slot(0).allocator())?;
        let sync = FenceSynchronizer::create(&mut backend, &device, slots, cfg.fence_timeout)?;

        info!(
            "frame pipeline up: {} slots on {}, starting at buffer {}",
            slots,
            device.adapter().name,
            swap_chain.current_index(&backend)
        );

        Ok(FramePipeline {
            recorder,
            sync,
            frames,
            swap_chain,
            queue,
            device,
            backend,
            clear_color: cfg.clear_color,
            frame_number: 0,
            last_frame: None,
            shut_down: false,
        })
    }

    /// Renders and presents one frame into the current back buffer.
    pub fn render_frame(
        &mut self,
        content: &mut dyn Content,
    ) -> Result<FrameReport, PipelineError> {
        if self.shut_down {
            return Err(PipelineError::ShutDown);
        }

        let index = self.swap_chain.current_index(&self.backend);
        let slot = index as usize;

        let ready = self.sync.wait_for_slot(&mut self.backend, &self.frames, slot)?;
        let waited = ready.was_blocked();
        let allocator = self.frames.reset_allocator(&mut self.backend, ready)?;

        let now = Instant::now();
        let delta = self.last_frame.map_or(Duration::ZERO, |t| now - t);
        self.last_frame = Some(now);
        content.update(&FrameState {
            frame: self.frame_number,
            slot,
            delta,
        });

        self.recorder.begin_frame(&mut self.backend, allocator)?;
        self.recorder.record_frame(
            &mut self.backend,
            &self.swap_chain,
            self.swap_chain.back_buffer(index),
            self.clear_color,
            content,
        )?;
        self.recorder.end_frame(&mut self.backend)?;

        let list = self.recorder.submittable()?;
        self.queue.submit(&mut self.backend, list)?;
        let fence_value =
            self.sync
                .signal_and_advance(&mut self.backend, &mut self.queue, &mut self.frames, slot)?;
        self.swap_chain.present(&mut self.backend, &mut self.queue)?;

        let report = FrameReport {
            frame: self.frame_number,
            slot,
            fence_value,
            waited,
        };
        self.frame_number += 1;
        Ok(report)
    }

    /// Waits for the GPU to finish every slot. Later calls are no-ops and
    /// later frames fail with [`PipelineError::ShutDown`].
    pub fn shutdown(&mut self) -> Result<(), PipelineError> {
        if self.shut_down {
            return Ok(());
        }
        // Marked first: a failed drain is not retried on drop.
        self.shut_down = true;
        self.sync
            .drain_all(&mut self.backend, &mut self.queue, &mut self.frames)?;
        info!("frame pipeline shut down after {} frames", self.frame_number);
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn current_index(&self) -> u32 {
        self.swap_chain.current_index(&self.backend)
    }

    pub fn buffer_count(&self) -> u32 {
        self.swap_chain.buffer_count()
    }

    pub fn swap_chain_size(&self) -> RenderSize {
        self.swap_chain.size()
    }

    pub fn is_fullscreen(&self) -> bool {
        self.swap_chain.is_fullscreen()
    }

    /// Last value queued for the slot's fence.
    pub fn slot_fence_value(&self, slot: usize) -> u64 {
        self.frames.slot(slot).fence_value()
    }

    /// Value the GPU has actually reached on the slot's fence.
    pub fn slot_fence_completed(&self, slot: usize) -> Result<u64, PipelineError> {
        self.backend
            .fence_completed_value(self.frames.slot(slot).fence())
            .map_err(PipelineError::frame(FrameOp::FenceRead))
    }

    /// Per-slot count of frame waits.
    pub fn wait_counts(&self) -> &[u64] {
        self.sync.wait_counts()
    }

    pub fn blocked_waits(&self) -> u64 {
        self.sync.blocked_waits()
    }

    pub fn allocator_resets(&self) -> &[u64] {
        self.frames.resets()
    }

    /// Frames rendered so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn submitted(&self) -> u64 {
        self.queue.submitted()
    }

    pub fn adapter(&self) -> &AdapterInfo {
        self.device.adapter()
    }

    pub fn feature_level(&self) -> FeatureLevel {
        self.device.level()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: Backend> Drop for FramePipeline<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("frame pipeline dropped with GPU work outstanding: {e}");
        }
    }
}

impl<B: Backend> Renderer for FramePipeline<B> {
    fn render_frame(&mut self, content: &mut dyn Content) -> Result<FrameReport, PipelineError> {
        FramePipeline::render_frame(self, content)
    }

    fn shutdown(&mut self) -> Result<(), PipelineError> {
        FramePipeline::shutdown(self)
    }

    fn current_index(&self) -> u32 {
        FramePipeline::current_index(self)
    }

    fn size(&self) -> RenderSize {
        self.swap_chain_size()
    }
}
