//! Victim selection for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;

/// Orders eviction candidates.
///
/// Whether a frame may be evicted at all (pins, dirty state, log
/// durability) is the pool's call; the replacer only picks among the
/// frames the pool accepts.
pub trait Replacer: Send + Sync {
    /// Notes a use of the frame.
    fn touch(&self, frame_id: FrameId);

    /// Picks a victim among the frames `accept` allows, or None.
    fn victim(&self, accept: &dyn Fn(FrameId) -> bool) -> Option<FrameId>;

    /// Forgets the frame's history once its page is gone.
    fn forget(&self, frame_id: FrameId);
}

/// Highest usage count a frame can build up.
const MAX_USAGE: u8 = 3;

/// Generalized clock.
///
/// Each use bumps a frame's usage count up to [`MAX_USAGE`]; the sweeping
/// hand decrements counts and takes the first accepted frame found at
/// zero. Inner tree pages, touched on every descent, survive sweeps that
/// evict leaves read once by a scan.
pub struct ClockReplacer {
    clock: Mutex<Clock>,
}

struct Clock {
    usage: Vec<u8>,
    hand: usize,
}

impl ClockReplacer {
    pub fn new(num_frames: usize) -> Self {
        Self {
            clock: Mutex::new(Clock {
                usage: vec![0; num_frames],
                hand: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.clock.lock().usage.len()
    }
}

impl Replacer for ClockReplacer {
    fn touch(&self, frame_id: FrameId) {
        let mut clock = self.clock.lock();
        if let Some(count) = clock.usage.get_mut(frame_id.0 as usize) {
            *count = (*count + 1).min(MAX_USAGE);
        }
    }

    fn victim(&self, accept: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let mut clock = self.clock.lock();
        let frames = clock.usage.len();

        // After MAX_USAGE full sweeps every accepted frame is at zero.
        for _ in 0..frames * (MAX_USAGE as usize + 1) {
            let slot = clock.hand;
            clock.hand = (slot + 1) % frames;

            let frame_id = FrameId(slot as u32);
            if !accept(frame_id) {
                continue;
            }
            match clock.usage[slot] {
                0 => return Some(frame_id),
                n => clock.usage[slot] = n - 1,
            }
        }
        None
    }

    fn forget(&self, frame_id: FrameId) {
        let mut clock = self.clock.lock();
        if let Some(count) = clock.usage.get_mut(frame_id.0 as usize) {
            *count = 0;
        }
    }
}
