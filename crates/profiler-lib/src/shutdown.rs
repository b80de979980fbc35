//! Cooperative stop signal shared by every engine loop
//!
//! Loops poll [`StopListener::should_stop`] at the top of each iteration and
//! sleep through [`StopListener::sleep`], which wakes early once a stop is
//! requested. Nothing is cancelled mid-cycle.

use std::time::Duration;
use tokio::sync::watch;

/// Owner side of the stop flag
#[derive(Debug)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Request every listener to stop at its next loop boundary
    pub fn notify_stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Loop side of the stop flag
#[derive(Debug, Clone)]
pub struct StopListener {
    rx: watch::Receiver<bool>,
}

impl StopListener {
    /// True once a stop was requested or the signal owner is gone
    pub fn should_stop(&self) -> bool {
        self.rx.has_changed().is_err() || *self.rx.borrow()
    }

    /// Sleep for `duration`, returning early if a stop is requested
    pub async fn sleep(&mut self, duration: Duration) {
        if self.should_stop() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.rx.changed() => {}
        }
    }

    /// Resolve once a stop is requested
    pub async fn stopped(&mut self) {
        while !self.should_stop() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_listener_sees_stop() {
        let signal = StopSignal::new();
        let listener = signal.listener();
        assert!(!listener.should_stop());

        signal.notify_stop();
        assert!(listener.should_stop());
        assert!(signal.is_stopped());
    }

    #[tokio::test]
    async fn test_sleep_wakes_on_stop() {
        let signal = StopSignal::new();
        let mut listener = signal.listener();

        let start = Instant::now();
        let sleeper = tokio::spawn(async move {
            listener.sleep(Duration::from_secs(30)).await;
        });
        signal.notify_stop();
        sleeper.await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stopped_resolves_after_notify() {
        let signal = StopSignal::new();
        let mut listener = signal.listener();

        let waiter = tokio::spawn(async move { listener.stopped().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        signal.notify_stop();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_signal_stops_listeners() {
        let signal = StopSignal::new();
        let listener = signal.listener();
        drop(signal);
        assert!(listener.should_stop());
    }
}
