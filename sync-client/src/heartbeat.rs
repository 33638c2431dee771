//! Heartbeat task.
//!
//! Runs while a session is open: pings on a fixed interval, feeds pongs to a
//! [`PingTracker`], and reports a timeout once. It holds only a weak
//! reference to its sink, so it ends on its own when the session goes away.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use inline_sync_core::{PingTick, PingTracker};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::transport::TransportError;

/// Where the heartbeat sends pings and reports timeouts.
#[async_trait]
pub(crate) trait PingSink: Send + Sync + 'static {
    /// Transmit a ping carrying `nonce`.
    async fn send_ping(&self, nonce: u64) -> Result<(), TransportError>;

    /// No pong arrived in time.
    fn ping_timed_out(&self);
}

/// A running heartbeat. Dropping it stops the task.
pub(crate) struct Heartbeat {
    task: JoinHandle<()>,
    pongs: mpsc::UnboundedSender<u64>,
}

impl Heartbeat {
    /// Start pinging `sink` every `interval`.
    pub(crate) fn spawn<S: PingSink>(sink: Weak<S>, interval: Duration, timeout: Duration) -> Self {
        let (pongs, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(sink, interval, timeout, rx));
        Self { task, pongs }
    }

    /// Forward a pong from the server.
    pub(crate) fn pong(&self, nonce: u64) {
        let _ = self.pongs.send(nonce);
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<S: PingSink>(
    sink: Weak<S>,
    interval: Duration,
    timeout: Duration,
    mut pongs: mpsc::UnboundedReceiver<u64>,
) {
    let start = Instant::now();
    let mut tracker = PingTracker::new(timeout, start.into_std());
    let mut ticker = interval_at(start + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(sink) = sink.upgrade() else {
                    break;
                };
                match tracker.on_tick(Instant::now().into_std()) {
                    PingTick::SendPing(nonce) => {
                        // A write stuck on a dead socket must not hold up the next tick.
                        match tokio::time::timeout(interval, sink.send_ping(nonce)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                tracing::debug!("Ping send failed: {}", e);
                                tracker.forget(nonce);
                            }
                            Err(_) => {
                                tracing::debug!("Ping send stalled for {}s", interval.as_secs());
                                tracker.forget(nonce);
                            }
                        }
                    }
                    PingTick::TimedOut => {
                        tracing::warn!("No pong within {}s", timeout.as_secs());
                        sink.ping_timed_out();
                        break;
                    }
                }
            }
            Some(nonce) = pongs.recv() => {
                if !tracker.on_pong(nonce, Instant::now().into_std()) {
                    tracing::debug!("Ignoring pong with unknown nonce {}", nonce);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records pings; optionally answers them through the heartbeat.
    #[derive(Default)]
    struct Recorder {
        pings: Mutex<Vec<u64>>,
        timeouts: AtomicUsize,
        fail_sends: AtomicBool,
        stall_sends: AtomicBool,
    }

    #[async_trait]
    impl PingSink for Recorder {
        async fn send_ping(&self, nonce: u64) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            if self.stall_sends.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.pings.lock().unwrap().push(nonce);
            Ok(())
        }

        fn ping_timed_out(&self) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    const INTERVAL: Duration = Duration::from_secs(10);
    const TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn pings_on_interval() {
        let sink = Arc::new(Recorder::default());
        let _hb = Heartbeat::spawn(Arc::downgrade(&sink), INTERVAL, TIMEOUT);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(sink.pings.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_never_time_out() {
        let sink = Arc::new(Recorder::default());
        let hb = Heartbeat::spawn(Arc::downgrade(&sink), INTERVAL, TIMEOUT);

        for _ in 0..12 {
            tokio::time::sleep(INTERVAL).await;
            tokio::task::yield_now().await;
            let last = sink.pings.lock().unwrap().last().copied();
            if let Some(nonce) = last {
                hb.pong(nonce);
            }
        }
        assert_eq!(sink.timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_times_out_once() {
        let sink = Arc::new(Recorder::default());
        let _hb = Heartbeat::spawn(Arc::downgrade(&sink), INTERVAL, TIMEOUT);

        tokio::time::sleep(TIMEOUT + INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(sink.timeouts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(TIMEOUT * 3).await;
        assert_eq!(sink.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsendable_pings_still_time_out() {
        let sink = Arc::new(Recorder::default());
        sink.fail_sends.store(true, Ordering::SeqCst);
        let _hb = Heartbeat::spawn(Arc::downgrade(&sink), INTERVAL, TIMEOUT);

        tokio::time::sleep(TIMEOUT + INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(sink.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_ping_writes_still_time_out() {
        let sink = Arc::new(Recorder::default());
        sink.stall_sends.store(true, Ordering::SeqCst);
        let _hb = Heartbeat::spawn(Arc::downgrade(&sink), INTERVAL, TIMEOUT);

        tokio::time::sleep(TIMEOUT + INTERVAL * 3).await;
        assert_eq!(sink.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_stops_pinging() {
        let sink = Arc::new(Recorder::default());
        let hb = Heartbeat::spawn(Arc::downgrade(&sink), INTERVAL, TIMEOUT);
        tokio::time::sleep(Duration::from_secs(15)).await;
        drop(hb);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sink.pings.lock().unwrap().len(), 1);
        assert_eq!(sink.timeouts.load(Ordering::SeqCst), 0);
    }
}
