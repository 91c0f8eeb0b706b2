//! # Single-Slot Timer
//!
//! The session never has more than one pending reconnect timer. Arming the
//! slot cancels whatever was scheduled before, and dropping the slot cancels
//! the pending task, so a disconnected session cannot be woken by a stale
//! timer.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// One cancellable delayed message.
#[derive(Debug, Default)]
pub struct TimerSlot {
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Schedule `msg` to be sent on `tx` after `delay`, replacing any
    /// previously armed timer.
    pub fn arm<T: Send + 'static>(&mut self, delay: Duration, tx: UnboundedSender<T>, msg: T) {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the session loop exited; nothing to do.
            let _ = tx.send(msg);
        }));
    }

    /// Cancel the pending timer, if any.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_timer_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TimerSlot::new();
        slot.arm(Duration::from_millis(10), tx, 42u32);
        assert!(slot.is_armed());

        let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timer should fire");
        assert_eq!(fired, Some(42));
    }

    #[tokio::test]
    async fn test_rearm_replaces_pending_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TimerSlot::new();
        slot.arm(Duration::from_millis(5), tx.clone(), 1u32);
        slot.arm(Duration::from_millis(20), tx, 2u32);

        let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timer should fire");
        assert_eq!(fired, Some(2));

        // The replaced timer must never deliver.
        let extra = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(matches!(extra, Err(_) | Ok(None)));
    }

    #[tokio::test]
    async fn test_cancel_suppresses_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        let mut slot = TimerSlot::new();
        slot.arm(Duration::from_millis(10), tx, 7);
        slot.cancel();
        assert!(!slot.is_armed());

        let extra = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(matches!(extra, Err(_) | Ok(None)));
    }
}
