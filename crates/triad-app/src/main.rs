// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use triad_core::{init_tracing, EngineConfig};
use triad_platform::{AppWindow, ExitConfirm, ExitRequest};
use triad_render::sim::{SimBackend, SimConfig};
use triad_render::{FeatureLevel, FramePipeline, Idle, PipelineConfig, RenderSize, Renderer};
use triad_render_vk::VkBackend;

use triad_platform::winit::{
    application::ApplicationHandler,
    event::{ElementState, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{Key, NamedKey},
    window::WindowId,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Vk,
    Sim,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Renderer backend: vk | sim
    #[arg(long, value_enum, default_value_t = BackendKind::Vk)]
    backend: BackendKind,
    /// Config file; missing means defaults
    #[arg(long, default_value = "triad.toml")]
    config: PathBuf,
    /// Borderless fullscreen at the monitor's native resolution
    #[arg(long)]
    fullscreen: bool,
    /// Shut down cleanly after this many frames
    #[arg(long)]
    frames: Option<u64>,
}

enum Backend {
    Vk(Box<FramePipeline<VkBackend>>),
    Sim(Box<FramePipeline<SimBackend>>),
}

impl Backend {
    fn renderer(&mut self) -> &mut dyn Renderer {
        match self {
            Backend::Vk(p) => p.as_mut(),
            Backend::Sim(p) => p.as_mut(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Backend::Vk(_) => "vk",
            Backend::Sim(_) => "sim",
        }
    }
}

const EXIT_OK: u8 = 0;
const EXIT_FAILED: u8 = 1;

fn pipeline_config(cfg: &EngineConfig, force_fullscreen: bool) -> Result<PipelineConfig> {
    let feature_level = cfg.render.feature_level()?;
    let ms = cfg.render.fence_timeout_ms;
    Ok(PipelineConfig {
        size: RenderSize {
            width: cfg.window.width,
            height: cfg.window.height,
        },
        fullscreen: cfg.window.fullscreen || force_fullscreen,
        buffer_count: cfg.render.buffer_count,
        feature_level,
        clear_color: cfg.render.clear_color,
        vsync: cfg.render.vsync,
        fence_timeout: (ms > 0).then(|| Duration::from_millis(ms)),
    })
}

struct App {
    backend_choice: BackendKind,
    title: String,
    cfg: PipelineConfig,
    frame_limit: Option<u64>,

    // Pipeline first: it must be gone before the window it presents to.
    backend: Option<Backend>,
    window: Option<AppWindow>,
    content: Idle,
    exit_confirm: ExitConfirm,

    exiting: bool,
    exit_code: u8,
    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn init_backend(&self, window: &AppWindow) -> Result<Backend> {
        Ok(match self.backend_choice {
            BackendKind::Vk => {
                let vk = VkBackend::new(window)?;
                Backend::Vk(Box::new(FramePipeline::init(vk, window, &self.cfg)?))
            }
            BackendKind::Sim => {
                let sim = SimBackend::new(SimConfig {
                    gpu_latency: Duration::from_millis(16),
                    ..SimConfig::default()
                })?;
                Backend::Sim(Box::new(FramePipeline::init(sim, window, &self.cfg)?))
            }
        })
    }

    /// Drains the GPU, releases the pipeline, then the window.
    fn finish(&mut self, event_loop: &ActiveEventLoop, mut code: u8) {
        if self.exiting {
            return;
        }
        self.exiting = true;
        if let Some(mut backend) = self.backend.take() {
            if let Err(e) = backend.renderer().shutdown() {
                error!("shutdown failed: {e}");
                code = EXIT_FAILED;
            }
        }
        self.window = None;
        self.exit_code = code;
        event_loop.exit();
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(backend) = &mut self.backend else {
            return;
        };
        match backend.renderer().render_frame(&mut self.content) {
            Ok(report) => {
                self.frames = self.frames.saturating_add(1);
                if report.waited {
                    debug!("frame {} waited on slot {}", report.frame, report.slot);
                }
                if self.frame_limit.is_some_and(|n| report.frame + 1 >= n) {
                    info!("frame limit reached after {} frames", report.frame + 1);
                    self.finish(event_loop, EXIT_OK);
                }
            }
            Err(e) => {
                error!("frame failed: {e}");
                self.finish(event_loop, EXIT_FAILED);
            }
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.exiting {
            return;
        }

        let window = match AppWindow::create(event_loop, &self.title, self.cfg.size) {
            Ok(w) => w,
            Err(e) => {
                error!("window creation failed: {e:#}");
                self.finish(event_loop, EXIT_OK);
                return;
            }
        };

        match self.init_backend(&window) {
            Ok(backend) => {
                info!("backend = {}", backend.name());
                info!("vsync cfg = {}", self.cfg.vsync);
                self.backend = Some(backend);
            }
            Err(e) => {
                error!("pipeline init failed: {e:#}");
                self.window = Some(window);
                self.finish(event_loop, EXIT_FAILED);
                return;
            }
        }

        event_loop.set_control_flow(if self.cfg.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });
        window.request_redraw();
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.finish(event_loop, EXIT_OK);
            }

            WindowEvent::KeyboardInput { event, .. }
                if event.state == ElementState::Pressed
                    && !event.repeat
                    && event.logical_key == Key::Named(NamedKey::Escape) =>
            {
                match self.exit_confirm.escape_pressed(Instant::now()) {
                    ExitRequest::Armed => info!("press Escape again within 3 s to quit"),
                    ExitRequest::Confirmed => {
                        info!("exit confirmed");
                        self.finish(event_loop, EXIT_OK);
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if !self.exiting {
                    self.redraw(event_loop);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let args = Args::parse();

    let engine_cfg = EngineConfig::load_or_default(&args.config);
    let cfg = pipeline_config(&engine_cfg, args.fullscreen)?;
    let event_loop: EventLoop<()> = EventLoop::new()?;

    let mut app = App {
        backend_choice: args.backend,
        title: engine_cfg.window.title.clone(),
        cfg,
        frame_limit: args.frames,
        backend: None,
        window: None,
        content: Idle,
        exit_confirm: ExitConfirm::default(),
        exiting: false,
        exit_code: EXIT_OK,
        frames: 0,
        last_fps_instant: Instant::now(),
    };

    event_loop.run_app(&mut app)?;
    info!("exit code {}", app.exit_code);
    Ok(ExitCode::from(app.exit_code))
}
