use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Run-wide stop/pause switches for the producer side.
///
/// These are capability values injected by the supervisor, not globals, so
/// several runs can coexist in one process (tests do exactly that).
///
/// - `stop` is one-way: once set, producers finish their current unit of
///   work and exit.
/// - `pause` is a toggle polled by producers; flipping it back resumes input.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    stop: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Returns true if this call was the one that initiated the stop.
    pub fn request_stop(&self) -> bool {
        !self.stop.swap(true, Ordering::Relaxed)
    }

    #[inline]
    pub fn paused(&self) -> bool {
        self.pause.load(Ordering::Relaxed)
    }

    /// Flip the pause switch, returning the new state.
    pub fn toggle_pause(&self) -> bool {
        !self.pause.fetch_xor(true, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_one_way_and_first_wins() {
        let c = RunControl::new();
        assert!(!c.stop_requested());
        assert!(c.request_stop());
        assert!(!c.request_stop());
        assert!(c.stop_requested());
    }

    #[test]
    fn pause_toggles() {
        let c = RunControl::new();
        assert!(!c.paused());
        assert!(c.toggle_pause());
        assert!(c.paused());
        assert!(!c.toggle_pause());
        assert!(!c.paused());
    }

    #[test]
    fn clones_share_state() {
        let a = RunControl::new();
        let b = a.clone();
        a.request_stop();
        assert!(b.stop_requested());
    }
}
