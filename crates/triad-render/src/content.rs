// SPDX-License-Identifier: CEPL-1.0
//! The scene side of a frame. The pipeline owns timing and synchronisation;
//! content only updates its state and adds commands to an open list.

use crate::hal::CpuDescriptor;
use crate::RenderSize;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackBuffer {
    pub index: u32,
    pub rtv: CpuDescriptor,
    pub size: RenderSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameState {
    /// Frames completed before this one.
    pub frame: u64,
    pub slot: usize,
    /// Time since the previous frame started; zero on the first.
    pub delta: Duration,
}

/// Commands content may record while the list is open. The back buffer is
/// already in the render-target state and cleared.
pub trait DrawCommands {
    fn back_buffer(&self) -> BackBuffer;
    fn clear(&mut self, rgba: [f32; 4]);
}

pub trait Content {
    fn update(&mut self, frame: &FrameState);
    fn record_draw_commands(&mut self, cmds: &mut dyn DrawCommands);
}

/// Draws nothing beyond the pipeline's clear.
#[derive(Clone, Copy, Debug, Default)]
pub struct Idle;

impl Content for Idle {
    fn update(&mut self, _frame: &FrameState) {}
    fn record_draw_commands(&mut self, _cmds: &mut dyn DrawCommands) {}
}
