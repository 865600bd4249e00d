// SPDX-License-Identifier: CEPL-1.0
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use std::cell::RefCell;
use std::time::Duration;
use triad_render::hal::ResourceState;
use triad_render::sim::{
    HeadlessTarget, SimAdapterDesc, SimBackend, SimCommand, SimConfig, SimControl, SimFailure,
    SimTrace,
};
use triad_render::{
    Content, DrawCommands, FeatureLevel, FrameOp, FramePipeline, FrameState, Idle, PipelineConfig,
    PipelineError, RenderSize, Renderer, Resource,
};

fn sim(cfg: SimConfig) -> (SimBackend, SimControl) {
    let backend = SimBackend::new(cfg).unwrap();
    let ctl = backend.control();
    (backend, ctl)
}

fn headless(backend: SimBackend) -> FramePipeline<SimBackend> {
    FramePipeline::init(backend, &HeadlessTarget::new(), &PipelineConfig::default()).unwrap()
}

fn windowed() -> FramePipeline<SimBackend> {
    let (backend, _) = sim(SimConfig::default());
    headless(backend)
}

/// Records the order in which the pipeline touches the window, and what the
/// GPU had seen by the time the border came off.
struct ScriptedTarget {
    monitor: RenderSize,
    ctl: SimControl,
    calls: RefCell<Vec<&'static str>>,
    trace_at_borderless: RefCell<Vec<SimTrace>>,
}

impl HasWindowHandle for ScriptedTarget {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        Err(HandleError::Unavailable)
    }
}

impl HasDisplayHandle for ScriptedTarget {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        Err(HandleError::Unavailable)
    }
}

impl triad_render::PresentTarget for ScriptedTarget {
    fn monitor_size(&self) -> Option<RenderSize> {
        self.calls.borrow_mut().push("monitor_size");
        Some(self.monitor)
    }

    fn set_borderless(&self) {
        self.calls.borrow_mut().push("set_borderless");
        *self.trace_at_borderless.borrow_mut() = self.ctl.trace();
    }
}

fn scripted(ctl: &SimControl, width: u32, height: u32) -> ScriptedTarget {
    ScriptedTarget {
        monitor: RenderSize { width, height },
        ctl: ctl.clone(),
        calls: RefCell::new(Vec::new()),
        trace_at_borderless: RefCell::new(Vec::new()),
    }
}

fn created_swap_chain(trace: &[SimTrace]) -> bool {
    trace
        .iter()
        .any(|t| matches!(t, SimTrace::SwapChainCreated { .. }))
}

#[test]
fn windowed_init_gives_three_buffers() {
    let p = windowed();
    assert_eq!(p.buffer_count(), 3);
    assert!(p.current_index() < 3);
    assert_eq!(
        p.swap_chain_size(),
        RenderSize {
            width: 800,
            height: 600
        }
    );
    assert!(!p.is_fullscreen());
    assert_eq!(p.feature_level(), FeatureLevel::L11_0);
    assert!(!p.adapter().software);
}

#[test]
fn three_frames_wait_on_each_slot_once() {
    let mut p = windowed();
    for _ in 0..3 {
        p.render_frame(&mut Idle).unwrap();
    }
    assert_eq!(p.wait_counts(), &[1, 1, 1]);
    assert_eq!(p.allocator_resets(), &[1, 1, 1]);
}

#[test]
fn each_frame_advances_the_index_by_one() {
    for buffer_count in [2, 3, 4] {
        let (backend, _) = sim(SimConfig::default());
        let cfg = PipelineConfig {
            buffer_count,
            ..PipelineConfig::default()
        };
        let mut p = FramePipeline::init(backend, &HeadlessTarget::new(), &cfg).unwrap();
        // Two laps so every index is a starting index at least twice.
        for _ in 0..2 * buffer_count {
            let before = p.current_index();
            let report = p.render_frame(&mut Idle).unwrap();
            assert_eq!(report.slot, before as usize);
            assert_eq!(p.current_index(), (before + 1) % buffer_count);
        }
    }
}

#[test]
fn slot_fence_values_climb_by_one() {
    let mut p = windowed();
    let mut seen = vec![Vec::new(); 3];
    for _ in 0..12 {
        let r = p.render_frame(&mut Idle).unwrap();
        seen[r.slot].push(r.fence_value);
    }
    for values in seen {
        assert_eq!(values, vec![1, 2, 3, 4]);
    }
    assert_eq!(p.slot_fence_value(0), 4);
}

#[test]
fn fullscreen_uses_monitor_size_and_strips_border_first() {
    let (backend, ctl) = sim(SimConfig::default());
    let target = scripted(&ctl, 1920, 1080);
    let cfg = PipelineConfig {
        fullscreen: true,
        ..PipelineConfig::default()
    };
    let p = FramePipeline::init(backend, &target, &cfg).unwrap();

    assert_eq!(
        p.swap_chain_size(),
        RenderSize {
            width: 1920,
            height: 1080
        }
    );
    assert!(p.is_fullscreen());
    assert_eq!(*target.calls.borrow(), vec!["monitor_size", "set_borderless"]);
    assert!(!created_swap_chain(&target.trace_at_borderless.borrow()));
    assert!(ctl.trace().contains(&SimTrace::SwapChainCreated {
        width: 1920,
        height: 1080,
        buffers: 3
    }));
}

#[test]
fn fullscreen_reports_the_size_the_surface_settled_on() {
    let (backend, ctl) = sim(SimConfig {
        max_extent: Some(RenderSize {
            width: 1600,
            height: 900,
        }),
        ..SimConfig::default()
    });
    let target = scripted(&ctl, 1920, 1080);
    let cfg = PipelineConfig {
        fullscreen: true,
        ..PipelineConfig::default()
    };
    let mut p = FramePipeline::init(backend, &target, &cfg).unwrap();

    let settled = RenderSize {
        width: 1600,
        height: 900,
    };
    assert_eq!(p.swap_chain_size(), settled);
    assert_eq!(Renderer::size(&p), settled);

    let mut content = Counter::default();
    p.render_frame(&mut content).unwrap();
    assert_eq!(content.sizes, vec![settled]);
}

#[test]
fn software_only_machine_has_no_adapter() {
    let (backend, ctl) = sim(SimConfig {
        adapters: vec![
            SimAdapterDesc::software("Basic Render A"),
            SimAdapterDesc::software("Basic Render B"),
        ],
        ..SimConfig::default()
    });
    let err = FramePipeline::init(backend, &HeadlessTarget::new(), &PipelineConfig::default())
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::AdapterNotFound(FeatureLevel::L11_0)));
    assert!(err.is_init_failure());

    let trace = ctl.trace();
    assert!(!trace
        .iter()
        .any(|t| matches!(t, SimTrace::DeviceCreated { .. } | SimTrace::SwapChainCreated { .. })));
    assert!(!trace.iter().any(|t| matches!(t, SimTrace::AdapterProbed { .. })));
}

#[test]
fn underpowered_adapter_is_passed_over() {
    let (backend, ctl) = sim(SimConfig {
        adapters: vec![
            SimAdapterDesc::hardware("Old GPU", FeatureLevel::L11_0),
            SimAdapterDesc::hardware("New GPU", FeatureLevel::L12_1),
        ],
        ..SimConfig::default()
    });
    let cfg = PipelineConfig {
        feature_level: FeatureLevel::L12_0,
        ..PipelineConfig::default()
    };
    let p = FramePipeline::init(backend, &HeadlessTarget::new(), &cfg).unwrap();
    assert_eq!(p.adapter().name, "New GPU");
    assert!(ctl.trace().contains(&SimTrace::DeviceCreated {
        adapter: 1,
        level: FeatureLevel::L12_0
    }));
}

#[test]
fn every_init_failure_releases_everything() {
    let cases = [
        (SimFailure::Device, None),
        (SimFailure::Queue, Some(Resource::Queue)),
        (SimFailure::SwapChain, None),
        (SimFailure::DescriptorHeap, Some(Resource::DescriptorHeap)),
        (SimFailure::RenderTargetView, Some(Resource::RenderTargetView)),
        (SimFailure::Allocator, Some(Resource::CommandAllocator)),
        (SimFailure::Fence, Some(Resource::Fence)),
        (SimFailure::CommandList, Some(Resource::CommandList)),
        (SimFailure::Event, Some(Resource::Event)),
    ];
    for (fail, resource) in cases {
        let (backend, ctl) = sim(SimConfig {
            fail: Some(fail),
            ..SimConfig::default()
        });
        let err = FramePipeline::init(backend, &HeadlessTarget::new(), &PipelineConfig::default())
            .err()
            .unwrap();
        assert!(err.is_init_failure(), "{fail:?}: {err}");
        match (fail, resource) {
            (SimFailure::Device, _) => {
                assert!(matches!(err, PipelineError::DeviceCreationFailed(_)))
            }
            (SimFailure::SwapChain, _) => {
                assert!(matches!(err, PipelineError::SwapChainCreationFailed(_)))
            }
            (_, Some(expected)) => {
                let got = match &err {
                    PipelineError::ResourceCreationFailed { resource, .. } => Some(*resource),
                    _ => None,
                };
                assert_eq!(got, Some(expected), "{fail:?}: {err}");
            }
            _ => unreachable!(),
        }
        assert_eq!(ctl.live_objects(), 0, "{fail:?} leaked");
    }
}

#[test]
fn invalid_config_is_refused_before_any_gpu_work() {
    let (backend, ctl) = sim(SimConfig::default());
    let cfg = PipelineConfig {
        size: RenderSize {
            width: 0,
            height: 600,
        },
        ..PipelineConfig::default()
    };
    let err = FramePipeline::init(backend, &HeadlessTarget::new(), &cfg).err().unwrap();
    assert!(matches!(err, PipelineError::InvalidConfig(_)));
    assert!(ctl.trace().is_empty());
}

#[test]
fn slow_gpu_paces_the_cpu_without_reusing_busy_allocators() {
    let (backend, ctl) = sim(SimConfig {
        gpu_latency: Duration::from_millis(4),
        ..SimConfig::default()
    });
    let mut p = headless(backend);
    for _ in 0..30 {
        let r = p.render_frame(&mut Idle).unwrap();
        assert!(p.slot_fence_completed(r.slot).unwrap() <= r.fence_value);
    }
    assert!(p.blocked_waits() > 0);
    assert_eq!(p.allocator_resets(), &[10, 10, 10]);

    p.shutdown().unwrap();
    for slot in 0..3 {
        assert_eq!(p.slot_fence_completed(slot).unwrap(), p.slot_fence_value(slot));
    }
    assert_eq!(ctl.pending_ops(), 0);
}

#[test]
fn hung_gpu_surfaces_as_timeout_and_recovers() {
    let (backend, ctl) = sim(SimConfig::default());
    let cfg = PipelineConfig {
        fence_timeout: Some(Duration::from_millis(40)),
        ..PipelineConfig::default()
    };
    let mut p = FramePipeline::init(backend, &HeadlessTarget::new(), &cfg).unwrap();

    ctl.pause();
    for _ in 0..3 {
        p.render_frame(&mut Idle).unwrap();
    }
    let err = p.render_frame(&mut Idle).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::SyncTimeout {
            slot: 0,
            target: 1,
            completed: 0
        }
    ));
    assert!(!err.is_init_failure());

    ctl.resume();
    let r = p.render_frame(&mut Idle).unwrap();
    assert_eq!((r.slot, r.fence_value), (0, 2));
}

#[test]
fn clears_land_on_the_presented_buffer() {
    let (backend, ctl) = sim(SimConfig::default());
    let cfg = PipelineConfig {
        clear_color: [0.1, 0.2, 0.3, 1.0],
        ..PipelineConfig::default()
    };
    let mut p = FramePipeline::init(backend, &HeadlessTarget::new(), &cfg).unwrap();
    for _ in 0..3 {
        p.render_frame(&mut Idle).unwrap();
    }
    p.shutdown().unwrap();

    let executed: Vec<Vec<SimCommand>> = ctl
        .trace()
        .into_iter()
        .filter_map(|t| match t {
            SimTrace::ListExecuted { commands, .. } => Some(commands),
            _ => None,
        })
        .collect();
    assert_eq!(executed.len(), 3);
    for (buffer, commands) in executed.iter().enumerate() {
        let buffer = buffer as u32;
        assert_eq!(
            commands,
            &vec![
                SimCommand::Barrier {
                    buffer,
                    before: ResourceState::Present,
                    after: ResourceState::RenderTarget
                },
                SimCommand::Clear {
                    buffer: Some(buffer),
                    rgba: [0.1, 0.2, 0.3, 1.0]
                },
                SimCommand::Barrier {
                    buffer,
                    before: ResourceState::RenderTarget,
                    after: ResourceState::Present
                },
            ]
        );
    }
    let presented: Vec<u32> = ctl
        .trace()
        .into_iter()
        .filter_map(|t| match t {
            SimTrace::Presented { buffer } => Some(buffer),
            _ => None,
        })
        .collect();
    assert_eq!(presented, vec![0, 1, 2]);
}

#[derive(Default)]
struct Counter {
    updates: Vec<FrameState>,
    drawn: Vec<u32>,
    sizes: Vec<RenderSize>,
}

impl Content for Counter {
    fn update(&mut self, frame: &FrameState) {
        self.updates.push(*frame);
    }

    fn record_draw_commands(&mut self, cmds: &mut dyn DrawCommands) {
        let back = cmds.back_buffer();
        self.drawn.push(back.index);
        self.sizes.push(back.size);
    }
}

#[test]
fn content_sees_every_frame_in_order() {
    let mut p = windowed();
    let mut content = Counter::default();
    for _ in 0..4 {
        p.render_frame(&mut content).unwrap();
    }
    let frames: Vec<u64> = content.updates.iter().map(|f| f.frame).collect();
    let slots: Vec<usize> = content.updates.iter().map(|f| f.slot).collect();
    assert_eq!(frames, vec![0, 1, 2, 3]);
    assert_eq!(slots, vec![0, 1, 2, 0]);
    assert_eq!(content.updates[0].delta, Duration::ZERO);
    assert_eq!(content.drawn, vec![0, 1, 2, 0]);
}

#[test]
fn failed_present_is_a_frame_failure() {
    let (backend, _) = sim(SimConfig {
        fail: Some(SimFailure::Present),
        ..SimConfig::default()
    });
    let mut p = headless(backend);
    let err = p.render_frame(&mut Idle).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::FrameFailed {
            op: FrameOp::Present,
            ..
        }
    ));
    assert!(!err.is_init_failure());
}

#[test]
fn shutdown_is_idempotent_and_final() {
    let (backend, ctl) = sim(SimConfig::default());
    let mut p: Box<dyn Renderer> = Box::new(headless(backend));
    p.render_frame(&mut Idle).unwrap();
    p.shutdown().unwrap();
    p.shutdown().unwrap();
    assert!(matches!(p.render_frame(&mut Idle), Err(PipelineError::ShutDown)));
    drop(p);
    assert_eq!(ctl.live_objects(), 0);
}
