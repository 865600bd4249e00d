// SPDX-License-Identifier: CEPL-1.0
//! Window side of the app: a fixed-size winit window that can act as a
//! present target, and the two-press Escape confirmation.

pub use winit;

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use triad_render::{PresentTarget, RenderSize};
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use winit::window::{Fullscreen, Window, WindowId};

/// Non-resizable top-level window. The swap chain never changes size, so
/// neither may the window.
pub struct AppWindow {
    window: Window,
}

impl AppWindow {
    pub fn create(event_loop: &ActiveEventLoop, title: &str, size: RenderSize) -> Result<Self> {
        let attrs = Window::default_attributes()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(size.width, size.height))
            .with_resizable(false);
        let window = event_loop.create_window(attrs).context("create_window")?;
        info!("window '{}' created ({}x{})", title, size.width, size.height);
        Ok(AppWindow { window })
    }

    pub fn id(&self) -> WindowId {
        self.window.id()
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    pub fn window(&self) -> &Window {
        &self.window
    }
}

impl HasWindowHandle for AppWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for AppWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

impl PresentTarget for AppWindow {
    fn monitor_size(&self) -> Option<RenderSize> {
        let size = self.window.current_monitor()?.size();
        Some(RenderSize {
            width: size.width,
            height: size.height,
        })
    }

    fn set_borderless(&self) {
        let Some(monitor) = self.window.current_monitor() else {
            warn!("no current monitor; window keeps its decorations");
            return;
        };
        self.window.set_decorations(false);
        let _ = self.window.request_inner_size(monitor.size());
        self.window
            .set_fullscreen(Some(Fullscreen::Borderless(Some(monitor))));
    }
}

/// Time allowed between the two Escape presses.
pub const CONFIRM_WINDOW: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitRequest {
    /// First press; another within the window exits.
    Armed,
    Confirmed,
}

/// Escape must be pressed twice in quick succession to quit.
#[derive(Debug)]
pub struct ExitConfirm {
    armed_at: Option<Instant>,
    window: Duration,
}

impl Default for ExitConfirm {
    fn default() -> Self {
        Self::new(CONFIRM_WINDOW)
    }
}

impl ExitConfirm {
    pub fn new(window: Duration) -> Self {
        ExitConfirm {
            armed_at: None,
            window,
        }
    }

    pub fn escape_pressed(&mut self, now: Instant) -> ExitRequest {
        match self.armed_at {
            Some(t) if now.saturating_duration_since(t) <= self.window => {
                self.armed_at = None;
                ExitRequest::Confirmed
            }
            _ => {
                self.armed_at = Some(now);
                ExitRequest::Armed
            }
        }
    }

    pub fn is_armed(&self, now: Instant) -> bool {
        self.armed_at
            .is_some_and(|t| now.saturating_duration_since(t) <= self.window)
    }
}
