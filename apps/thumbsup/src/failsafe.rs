use log::{info, warn};
use thumbsup_core::clock::{TuDuration, TuTime};

pub const FAILSAFE_TIMEOUT: TuDuration = TuDuration::from_millis(1_500);

/// Tracks the radio link. No frame at all counts as a lost link.
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    timeout: TuDuration,
    last_frame: Option<TuTime>,
    active: bool,
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new(FAILSAFE_TIMEOUT)
    }
}

impl LinkMonitor {
    pub fn new(timeout: TuDuration) -> Self {
        LinkMonitor {
            timeout,
            last_frame: None,
            active: true,
        }
    }

    pub fn timeout(&self) -> TuDuration {
        self.timeout
    }

    pub fn last_frame(&self) -> Option<TuTime> {
        self.last_frame
    }

    /// Records the arrival time of a gamepad frame.
    pub fn frame_received(&mut self, at: TuTime) {
        self.last_frame = Some(self.last_frame.map_or(at, |last| last.max(at)));
    }

    /// Re-evaluates the link at `now` and returns whether failsafe is active.
    pub fn update(&mut self, now: TuTime) -> bool {
        let stale = match self.last_frame {
            Some(last) => now.saturating_sub(last) > self.timeout,
            None => true,
        };
        if stale && !self.active {
            warn!("failsafe: no gamepad frame for more than {}", self.timeout);
        } else if !stale && self.active {
            info!("failsafe: link up");
        }
        self.active = stale;
        stale
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}
