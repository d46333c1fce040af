//! Gapless placement of buffers on the device clock.
//!
//! ## Algorithm
//!
//! 1. On entering `Playing`, `next_start_time = max(next_start_time, device_now)`:
//!    audio from the previous burst may still be queued on the device.
//! 2. For each buffer: `start = max(next_start_time, device_now)`, schedule it
//!    at `start`, then `next_start_time = start + duration`.
//!
//! The `max` covers a stall that let the device clock run past the planned
//! start. While chunks keep arriving faster than they play, consecutive
//! buffers abut exactly; a starved queue yields an audible gap, which is
//! accepted rather than padded with synthesized silence.

use crate::device::{OutputDevice, ScheduledBuffer};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct Scheduler {
    next_start_time: Option<f64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchor the timeline at `now`, unless earlier buffers still end later.
    /// The timeline never moves backwards; only [`clear`](Self::clear) forgets it.
    pub fn anchor(&mut self, now: f64) {
        self.next_start_time = Some(self.next_start_time.map_or(now, |next| next.max(now)));
    }

    /// Forget the timeline; the next buffer starts at `device_now`.
    pub fn clear(&mut self) {
        self.next_start_time = None;
    }

    pub fn next_start_time(&self) -> Option<f64> {
        self.next_start_time
    }

    /// Place `samples` on `device` and advance the timeline.
    ///
    /// On error the timeline is left untouched.
    pub fn schedule(&mut self, device: &mut dyn OutputDevice, samples: Vec<f32>) -> Result<f64> {
        let now = device.current_time();
        let start = self.next_start_time.map_or(now, |next| next.max(now));
        let buffer = ScheduledBuffer {
            start_time: start,
            samples,
            sample_rate: device.sample_rate(),
        };
        let end = buffer.end_time();
        device.schedule(buffer)?;
        self.next_start_time = Some(end);
        Ok(start)
    }
}
