// SPDX-License-Identifier: CEPL-1.0
//! CPU/GPU hand-off for frame slots.
//!
//! A slot's allocator belongs to the GPU from the moment its list is
//! submitted until the slot's fence reaches the value signalled behind it.
//! [`FenceSynchronizer::wait_for_slot`] is the only way back to the CPU and
//! the only place the render thread sleeps.

use crate::device::Device;
use crate::error::{FrameOp, PipelineError, Resource};
use crate::frame::{FrameResourceSet, SlotReady};
use crate::hal::{Backend, WaitStatus};
use crate::queue::CommandQueue;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct FenceSynchronizer<B: Backend> {
    event: B::Event,
    timeout: Option<Duration>,
    waits: Vec<u64>,
    blocked_waits: u64,
}

impl<B: Backend> FenceSynchronizer<B> {
    /// `timeout` bounds every blocking wait; `None` waits forever.
    pub fn create(
        backend: &mut B,
        device: &Device<B>,
        slots: usize,
        timeout: Option<Duration>,
    ) -> Result<Self, PipelineError> {
        let event = backend
            .create_event(device.raw())
            .map_err(PipelineError::resource(Resource::Event))?;
        Ok(FenceSynchronizer {
            event,
            timeout,
            waits: vec![0; slots],
            blocked_waits: 0,
        })
    }

    /// Queues a signal of `last + 1` on the slot's fence and records it as
    /// the slot's new target.
    pub fn signal_and_advance(
        &mut self,
        backend: &mut B,
        queue: &mut CommandQueue<B>,
        frames: &mut FrameResourceSet<B>,
        slot: usize,
    ) -> Result<u64, PipelineError> {
        let s = frames.slot_mut(slot);
        let value = s.fence_value + 1;
        backend
            .signal(queue.raw_mut(), s.fence(), value)
            .map_err(PipelineError::frame(FrameOp::Signal))?;
        s.fence_value = value;
        Ok(value)
    }

    /// Returns once the GPU is done with everything submitted for `slot`.
    /// Immediate when the fence is already there.
    pub fn wait_for_slot(
        &mut self,
        backend: &mut B,
        frames: &FrameResourceSet<B>,
        slot: usize,
    ) -> Result<SlotReady, PipelineError> {
        let target = frames.slot(slot).fence_value();
        let blocked = self.block_until(backend, frames, slot, target)?;
        self.waits[slot] += 1;
        if blocked {
            self.blocked_waits += 1;
        }
        Ok(SlotReady {
            slot,
            target,
            blocked,
        })
    }

    /// Signal every slot once more and wait for all of them: afterwards no
    /// submitted list can still be referenced by the GPU.
    pub fn drain_all(
        &mut self,
        backend: &mut B,
        queue: &mut CommandQueue<B>,
        frames: &mut FrameResourceSet<B>,
    ) -> Result<(), PipelineError> {
        for slot in 0..frames.len() {
            let target = self.signal_and_advance(backend, queue, frames, slot)?;
            self.block_until(backend, frames, slot, target)?;
        }
        info!("drained {} frame slots", frames.len());
        Ok(())
    }

    /// Sleeps until the slot's fence reaches `target`. A wake is only a hint:
    /// the shared event can also be fired by a registration left behind by
    /// an earlier timed-out wait, so the fence is re-read after every wake.
    fn block_until(
        &mut self,
        backend: &mut B,
        frames: &FrameResourceSet<B>,
        slot: usize,
        target: u64,
    ) -> Result<bool, PipelineError> {
        let fence = frames.slot(slot).fence();
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut blocked = false;
        loop {
            let completed = backend
                .fence_completed_value(fence)
                .map_err(PipelineError::frame(FrameOp::FenceRead))?;
            if completed >= target {
                return Ok(blocked);
            }
            if !blocked {
                debug!("slot {slot}: fence at {completed}, waiting for {target}");
            }
            blocked = true;

            backend
                .set_event_on_completion(fence, target, &mut self.event)
                .map_err(PipelineError::frame(FrameOp::Wait))?;
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let status = backend
                .wait_event(&mut self.event, remaining)
                .map_err(PipelineError::frame(FrameOp::Wait))?;
            if status == WaitStatus::TimedOut {
                let completed = backend.fence_completed_value(fence).unwrap_or(completed);
                if completed >= target {
                    return Ok(true);
                }
                return Err(PipelineError::SyncTimeout {
                    slot,
                    target,
                    completed,
                });
            }
        }
    }

    /// `wait_for_slot` calls per slot.
    pub fn wait_counts(&self) -> &[u64] {
        &self.waits
    }

    /// Waits that actually put the CPU to sleep.
    pub fn blocked_waits(&self) -> u64 {
        self.blocked_waits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::testing::sim_device;
    use crate::sim::{SimBackend, SimConfig};
    use std::thread;

    struct Rig {
        b: SimBackend,
        device: Device<SimBackend>,
        queue: CommandQueue<SimBackend>,
        frames: FrameResourceSet<SimBackend>,
    }

    fn rig() -> Rig {
        let (mut b, device, queue) = sim_device(SimConfig::default());
        let frames = FrameResourceSet::create(&mut b, &device, 3).unwrap();
        Rig {
            b,
            device,
            queue,
            frames,
        }
    }

    #[test]
    fn fence_values_climb_by_one_per_reuse() {
        let mut r = rig();
        let mut sync = FenceSynchronizer::create(&mut r.b, &r.device, 3, None).unwrap();
        let mut per_slot = vec![Vec::new(); 3];
        for i in 0..9 {
            let slot = i % 3;
            let v = sync
                .signal_and_advance(&mut r.b, &mut r.queue, &mut r.frames, slot)
                .unwrap();
            per_slot[slot].push(v);
        }
        for values in per_slot {
            assert_eq!(values, vec![1, 2, 3]);
        }
    }

    #[test]
    fn fresh_slot_does_not_block() {
        let mut r = rig();
        let mut sync = FenceSynchronizer::create(&mut r.b, &r.device, 3, None).unwrap();
        let ready = sync.wait_for_slot(&mut r.b, &r.frames, 0).unwrap();
        assert!(!ready.was_blocked());
        assert_eq!(ready.target(), 0);
    }

    #[test]
    fn repeated_wait_without_signal_is_immediate() {
        let mut r = rig();
        let mut sync = FenceSynchronizer::create(&mut r.b, &r.device, 3, None).unwrap();
        sync.signal_and_advance(&mut r.b, &mut r.queue, &mut r.frames, 1).unwrap();
        let _ = sync.wait_for_slot(&mut r.b, &r.frames, 1).unwrap();
        let second = sync.wait_for_slot(&mut r.b, &r.frames, 1).unwrap();
        let third = sync.wait_for_slot(&mut r.b, &r.frames, 1).unwrap();
        assert!(!second.was_blocked());
        assert!(!third.was_blocked());
        assert_eq!(sync.wait_counts(), &[0, 3, 0]);
    }

    #[test]
    fn blocks_until_the_gpu_catches_up() {
        let mut r = rig();
        let ctl = r.b.control();
        let mut sync = FenceSynchronizer::create(&mut r.b, &r.device, 3, None).unwrap();
        ctl.pause();
        sync.signal_and_advance(&mut r.b, &mut r.queue, &mut r.frames, 0).unwrap();

        let resumer = {
            let ctl = ctl.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                ctl.resume();
            })
        };
        let ready = sync.wait_for_slot(&mut r.b, &r.frames, 0).unwrap();
        resumer.join().unwrap();

        assert!(ready.was_blocked());
        assert_eq!(ready.target(), 1);
        assert_eq!(r.b.fence_completed_value(r.frames.slot(0).fence()).unwrap(), 1);
        assert_eq!(sync.blocked_waits(), 1);
    }

    #[test]
    fn hung_gpu_times_out() {
        let mut r = rig();
        let ctl = r.b.control();
        let timeout = Some(Duration::from_millis(30));
        let mut sync = FenceSynchronizer::create(&mut r.b, &r.device, 3, timeout).unwrap();
        ctl.pause();
        sync.signal_and_advance(&mut r.b, &mut r.queue, &mut r.frames, 2).unwrap();
        let err = sync.wait_for_slot(&mut r.b, &r.frames, 2).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SyncTimeout {
                slot: 2,
                target: 1,
                completed: 0
            }
        ));
        ctl.resume();
    }

    #[test]
    fn stale_token_cannot_reset_an_in_flight_allocator() {
        let mut r = rig();
        let ctl = r.b.control();
        let mut sync = FenceSynchronizer::create(&mut r.b, &r.device, 3, None).unwrap();
        let ready = sync.wait_for_slot(&mut r.b, &r.frames, 0).unwrap();

        ctl.pause();
        sync.signal_and_advance(&mut r.b, &mut r.queue, &mut r.frames, 0).unwrap();
        let err = r.frames.reset_allocator(&mut r.b, ready).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::AllocatorInFlight {
                slot: 0,
                target: 1,
                completed: 0
            }
        ));
        ctl.resume();

        let ready = sync.wait_for_slot(&mut r.b, &r.frames, 0).unwrap();
        assert!(r.frames.reset_allocator(&mut r.b, ready).is_ok());
        assert_eq!(r.frames.resets(), &[1, 0, 0]);
    }


    #[test]
    fn wake_left_over_from_a_timed_out_wait_is_not_trusted() {
        let (mut b, device, mut queue) = sim_device(SimConfig {
            gpu_latency: Duration::from_millis(150),
            ..SimConfig::default()
        });
        let mut frames = FrameResourceSet::create(&mut b, &device, 3).unwrap();
        let ctl = b.control();
        let timeout = Some(Duration::from_millis(250));
        let mut sync = FenceSynchronizer::create(&mut b, &device, 3, timeout).unwrap();
        let list = b.create_command_list(device.raw(), frames.slot(2).allocator()).unwrap();

        // Slot 1's signal sits behind a slow list; slot 0's does not.
        ctl.pause();
        sync.signal_and_advance(&mut b, &mut queue, &mut frames, 0).unwrap();
        queue.submit(&mut b, &list).unwrap();
        sync.signal_and_advance(&mut b, &mut queue, &mut frames, 1).unwrap();

        let err = sync.wait_for_slot(&mut b, &frames, 0).unwrap_err();
        assert!(matches!(err, PipelineError::SyncTimeout { slot: 0, .. }));

        // Slot 0's fence now fires the shared event long before slot 1's.
        ctl.resume();
        let ready = sync.wait_for_slot(&mut b, &frames, 1).unwrap();
        assert!(ready.was_blocked());
        assert_eq!(ready.target(), 1);
        assert_eq!(b.fence_completed_value(frames.slot(1).fence()).unwrap(), 1);
        assert!(frames.reset_allocator(&mut b, ready).is_ok());
    }

    #[test]
    fn drain_leaves_every_fence_at_its_target() {
        let mut r = rig();
        let ctl = r.b.control();
        let mut sync = FenceSynchronizer::create(&mut r.b, &r.device, 3, None).unwrap();
        ctl.pause();
        for slot in [0, 1, 2, 0] {
            sync.signal_and_advance(&mut r.b, &mut r.queue, &mut r.frames, slot).unwrap();
        }
        ctl.resume();
        sync.drain_all(&mut r.b, &mut r.queue, &mut r.frames).unwrap();
        for slot in 0..3 {
            let s = r.frames.slot(slot);
            assert_eq!(r.b.fence_completed_value(s.fence()).unwrap(), s.fence_value());
        }
        assert_eq!(r.frames.slot(0).fence_value(), 3);
        assert_eq!(ctl.pending_ops(), 0);
        // Drain is not a per-frame wait.
        assert_eq!(sync.wait_counts(), &[0, 0, 0]);
    }
}
