//! Self-rescheduling heartbeat deadline.
//!
//! A [`Heartbeat`] owns one background task counting down to a deadline.
//! [`Heartbeat::beat`] pushes the deadline out by the current TTL,
//! [`Heartbeat::update`] replaces the TTL, and [`Heartbeat::stop`] cancels
//! without firing. When the deadline passes the timeout callback runs
//! exactly once and the task ends; no path leaks the task.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

enum Command {
    Update(Duration),
    Beat,
    Stop,
}

/// Handle to a running heartbeat timer. Dropping the handle cancels the
/// timer like [`Heartbeat::stop`].
pub struct Heartbeat {
    tx: mpsc::UnboundedSender<Command>,
}

impl Heartbeat {
    /// Start a timer that fires `on_timeout` once the deadline (initially
    /// `now + ttl`) passes without a beat.
    pub fn new<F>(ttl: Duration, on_timeout: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut ttl = ttl;
            let mut deadline = Instant::now() + ttl;
            let mut on_timeout = Some(on_timeout);
            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(Command::Update(new_ttl)) => {
                            ttl = new_ttl;
                            deadline = Instant::now() + ttl;
                        }
                        Some(Command::Beat) => {
                            deadline = Instant::now() + ttl;
                        }
                        Some(Command::Stop) | None => return,
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        if let Some(callback) = on_timeout.take() {
                            callback();
                        }
                        return;
                    }
                }
            }
        });
        Self { tx }
    }

    /// Replace the TTL and reset the deadline to `now + ttl`.
    pub fn update(&self, ttl: Duration) {
        let _ = self.tx.send(Command::Update(ttl));
    }

    /// Reset the deadline to `now + ttl`.
    pub fn beat(&self) {
        let _ = self.tx.send(Command::Beat);
    }

    /// Cancel the timer without firing the callback. Idempotent.
    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }
}
