//! State-change notification towards the registered client

/// Receives secure element availability changes
///
/// `true` is delivered once the chip is initialised, `false` when it is torn
/// down or a loader download could not be started.
pub trait StateChangeCallback: Send + Sync {
    fn on_state_change(&self, connected: bool);
}

impl<F> StateChangeCallback for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_state_change(&self, connected: bool) {
        self(connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_closure_callback() {
        let seen = AtomicBool::new(false);
        let callback = |connected: bool| seen.store(connected, Ordering::SeqCst);
        callback.on_state_change(true);
        assert!(seen.load(Ordering::SeqCst));
    }
}
