// SPDX-License-Identifier: CEPL-1.0
use crate::content::BackBuffer;
use crate::device::Device;
use crate::error::{FrameOp, PipelineError, Resource};
use crate::hal::{Backend, CpuDescriptor, PresentTarget, SwapChainDesc};
use crate::queue::CommandQueue;
use crate::RenderSize;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapChainOptions {
    pub size: RenderSize,
    pub buffer_count: u32,
    pub fullscreen: bool,
    pub vsync: bool,
}

/// Ring of presentable back buffers plus one RTV per buffer.
pub struct SwapChainManager<B: Backend> {
    // Views go before the buffers they describe.
    rtv_heap: B::DescriptorHeap,
    swap_chain: B::SwapChain,
    rtv_start: CpuDescriptor,
    rtv_stride: u32,
    buffer_count: u32,
    size: RenderSize,
    fullscreen: bool,
}

impl<B: Backend> SwapChainManager<B> {
    /// Fullscreen replaces the requested size with the monitor's native one
    /// and strips the window border before the swap chain exists.
    pub fn create(
        backend: &mut B,
        device: &Device<B>,
        queue: &mut CommandQueue<B>,
        target: &dyn PresentTarget,
        opts: SwapChainOptions,
    ) -> Result<Self, PipelineError> {
        let wanted = if opts.fullscreen {
            let native = target.monitor_size().unwrap_or_else(|| {
                warn!("no monitor reported; fullscreen keeps the requested size");
                opts.size
            });
            target.set_borderless();
            native
        } else {
            opts.size
        };

        let desc = SwapChainDesc {
            size: wanted,
            buffer_count: opts.buffer_count,
            vsync: opts.vsync,
            fullscreen: opts.fullscreen,
        };
        let swap_chain = backend
            .create_swap_chain(device.raw(), queue.raw_mut(), target, &desc)
            .map_err(PipelineError::SwapChainCreationFailed)?;

        let size = backend.swap_chain_size(&swap_chain);
        if size != wanted {
            warn!(
                "asked for a {}x{} swap chain, surface gave {}x{}",
                wanted.width, wanted.height, size.width, size.height
            );
        }
        let buffer_count = backend.swap_chain_buffer_count(&swap_chain);
        if buffer_count != opts.buffer_count {
            warn!(
                "asked for {} back buffers, swap chain has {}",
                opts.buffer_count, buffer_count
            );
        }

        let rtv_stride = backend.rtv_descriptor_stride(device.raw());
        let mut rtv_heap = backend
            .create_rtv_heap(device.raw(), buffer_count)
            .map_err(PipelineError::resource(Resource::DescriptorHeap))?;
        let rtv_start = backend.heap_start(&rtv_heap);
        for i in 0..buffer_count {
            backend
                .create_render_target_view(
                    device.raw(),
                    &swap_chain,
                    i,
                    &mut rtv_heap,
                    rtv_start.offset(i, rtv_stride),
                )
                .map_err(PipelineError::resource(Resource::RenderTargetView))?;
        }

        info!(
            "swap chain ready ({}x{}, {} buffers, rtv stride {}{})",
            size.width,
            size.height,
            buffer_count,
            rtv_stride,
            if opts.fullscreen { ", fullscreen" } else { "" }
        );

        Ok(SwapChainManager {
            rtv_heap,
            swap_chain,
            rtv_start,
            rtv_stride,
            buffer_count,
            size,
            fullscreen: opts.fullscreen,
        })
    }

    /// Buffer the next present will show.
    pub fn current_index(&self, backend: &B) -> u32 {
        backend.current_back_buffer_index(&self.swap_chain)
    }

    pub fn back_buffer(&self, index: u32) -> BackBuffer {
        BackBuffer {
            index,
            rtv: self.rtv_start.offset(index, self.rtv_stride),
            size: self.size,
        }
    }

    /// Queues the flip and advances the current index.
    pub fn present(
        &mut self,
        backend: &mut B,
        queue: &mut CommandQueue<B>,
    ) -> Result<(), PipelineError> {
        backend
            .present(queue.raw_mut(), &mut self.swap_chain)
            .map_err(PipelineError::frame(FrameOp::Present))
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    pub fn size(&self) -> RenderSize {
        self.size
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub fn raw(&self) -> &B::SwapChain {
        &self.swap_chain
    }

    pub fn rtv_heap(&self) -> &B::DescriptorHeap {
        &self.rtv_heap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::testing::sim_device;
    use crate::sim::{HeadlessTarget, SimConfig, SimFailure};

    const WINDOWED: SwapChainOptions = SwapChainOptions {
        size: RenderSize {
            width: 800,
            height: 600,
        },
        buffer_count: 3,
        fullscreen: false,
        vsync: true,
    };

    #[test]
    fn windowed_uses_requested_size() {
        let (mut b, device, mut queue) = sim_device(SimConfig::default());
        let target = HeadlessTarget::with_monitor(RenderSize {
            width: 1920,
            height: 1080,
        });
        let sc = SwapChainManager::create(&mut b, &device, &mut queue, &target, WINDOWED).unwrap();
        assert_eq!(sc.size(), WINDOWED.size);
        assert_eq!(sc.buffer_count(), 3);
        assert!(sc.current_index(&b) < 3);
        assert!(!target.is_borderless());
    }

    #[test]
    fn fullscreen_takes_monitor_resolution() {
        let (mut b, device, mut queue) = sim_device(SimConfig::default());
        let target = HeadlessTarget::with_monitor(RenderSize {
            width: 1920,
            height: 1080,
        });
        let opts = SwapChainOptions {
            fullscreen: true,
            ..WINDOWED
        };
        let sc = SwapChainManager::create(&mut b, &device, &mut queue, &target, opts).unwrap();
        assert_eq!(
            sc.size(),
            RenderSize {
                width: 1920,
                height: 1080
            }
        );
        assert!(target.is_borderless());
        assert!(sc.is_fullscreen());
    }

    #[test]
    fn reports_the_extent_the_surface_actually_gave() {
        let (mut b, device, mut queue) = sim_device(SimConfig {
            max_extent: Some(RenderSize {
                width: 1280,
                height: 720,
            }),
            ..SimConfig::default()
        });
        let target = HeadlessTarget::with_monitor(RenderSize {
            width: 1920,
            height: 1080,
        });
        let opts = SwapChainOptions {
            fullscreen: true,
            ..WINDOWED
        };
        let sc = SwapChainManager::create(&mut b, &device, &mut queue, &target, opts).unwrap();
        let actual = RenderSize {
            width: 1280,
            height: 720,
        };
        assert_eq!(sc.size(), actual);
        assert_eq!(sc.back_buffer(1).size, actual);
    }

    #[test]
    fn back_buffer_descriptors_step_by_device_stride() {
        let (mut b, device, mut queue) = sim_device(SimConfig {
            rtv_stride: 48,
            ..SimConfig::default()
        });
        let target = HeadlessTarget::new();
        let sc = SwapChainManager::create(&mut b, &device, &mut queue, &target, WINDOWED).unwrap();
        let first = sc.back_buffer(0).rtv;
        assert_eq!(sc.back_buffer(1).rtv, CpuDescriptor(first.0 + 48));
        assert_eq!(sc.back_buffer(2).rtv, CpuDescriptor(first.0 + 96));
    }

    #[test]
    fn present_walks_the_ring() {
        let (mut b, device, mut queue) = sim_device(SimConfig::default());
        let target = HeadlessTarget::new();
        let mut sc =
            SwapChainManager::create(&mut b, &device, &mut queue, &target, WINDOWED).unwrap();
        let seen: Vec<u32> = (0..6)
            .map(|_| {
                let i = sc.current_index(&b);
                sc.present(&mut b, &mut queue).unwrap();
                i
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn creation_failures_are_classified() {
        let (mut b, device, mut queue) = sim_device(SimConfig {
            fail: Some(SimFailure::SwapChain),
            ..SimConfig::default()
        });
        let target = HeadlessTarget::new();
        let err = SwapChainManager::create(&mut b, &device, &mut queue, &target, WINDOWED)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::SwapChainCreationFailed(_)));

        let (mut b, device, mut queue) = sim_device(SimConfig {
            fail: Some(SimFailure::RenderTargetView),
            ..SimConfig::default()
        });
        let err = SwapChainManager::create(&mut b, &device, &mut queue, &target, WINDOWED)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            PipelineError::ResourceCreationFailed {
                resource: Resource::RenderTargetView,
                ..
            }
        ));
    }
}
