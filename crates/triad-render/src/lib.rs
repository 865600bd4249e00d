// SPDX-License-Identifier: CEPL-1.0
//! Triple-buffered frame pipeline with explicit CPU/GPU fence pacing.
//!
//! The pipeline is generic over a [`Backend`]; `triad-render-vk` provides
//! the hardware one, [`sim`] an in-process GPU timeline.

pub mod adapter;
pub mod content;
pub mod device;
pub mod error;
pub mod frame;
pub mod hal;
pub mod pipeline;
pub mod queue;
pub mod recorder;
pub mod sim;
pub mod swapchain;
pub mod sync;

pub use content::{BackBuffer, Content, DrawCommands, FrameState, Idle};
pub use error::{FrameOp, PipelineError, Resource};
pub use hal::{Backend, BackendError, FeatureLevel, PresentTarget};
pub use pipeline::{FramePipeline, FrameReport, PipelineConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

/// Lifecycle hooks the windowing layer drives once the pipeline is built.
pub trait Renderer {
    fn render_frame(&mut self, content: &mut dyn Content) -> Result<FrameReport, PipelineError>;
    fn shutdown(&mut self) -> Result<(), PipelineError>;
    fn current_index(&self) -> u32;
    fn size(&self) -> RenderSize;
}
