//! A [`Trigger`] multiplexes a jittered periodic ticker and an externally supplied
//! manual-pulse channel onto a single output channel of timestamps.
//!
//! Both the cache groomer (`rr-cache`) and the venv cleaner (`rr-venv`) are paced by a
//! `Trigger` rather than calling [`tokio::time::interval`] directly, so that tests and
//! operators can force an out-of-band tick without waiting out the real period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long a producer waits for a reader before dropping an event on the floor.
const SEND_TIMEOUT: Duration = Duration::from_millis(200);

/// Paces a background task with a jittered period, plus an optional manual escape hatch.
///
/// Every event, whether from the timer or the manual channel, delivers exactly one
/// [`Instant`] on [`Trigger::receiver`]. A slow reader never blocks the producer: if the
/// channel isn't ready within [`SEND_TIMEOUT`], the event is simply dropped.
pub struct Trigger {
    rx: mpsc::Receiver<Instant>,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Trigger {
    /// Start a trigger with a `period` jittered by up to `jitter` in either direction.
    ///
    /// `manual` is an optional externally owned receiver; anything sent on its paired
    /// sender fires an extra event immediately, independent of the timer.
    pub fn start(period: Duration, jitter: Duration, manual: Option<mpsc::Receiver<()>>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let stop = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let task_stop = Arc::clone(&stop);
        let task = tokio::spawn(run(period, jitter, manual, tx, task_stop));

        Self {
            rx,
            stop,
            stopped,
            task: Some(task),
        }
    }

    /// The read side of the trigger. Only one task should poll this at a time.
    pub fn receiver(&mut self) -> &mut mpsc::Receiver<Instant> {
        &mut self.rx
    }

    /// Wait for the next tick, whether periodic or manual.
    pub async fn recv(&mut self) -> Option<Instant> {
        self.rx.recv().await
    }

    /// Stop the background task. Idempotent: calling this more than once, from more than
    /// one place, is safe and only notifies the loop once.
    ///
    /// The original implementation had `Stop` call itself recursively on a double-close;
    /// here idempotence is structural, guarded by an `AtomicBool` rather than relying on
    /// callers to only stop once.
    pub fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.notify_one();
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    period: Duration,
    jitter: Duration,
    mut manual: Option<mpsc::Receiver<()>>,
    tx: mpsc::Sender<Instant>,
    stop: Arc<Notify>,
) {
    loop {
        let next_period = jittered(period, jitter);
        let sleep = tokio::time::sleep(next_period);
        tokio::pin!(sleep);

        tokio::select! {
            biased;
            () = stop.notified() => {
                tracing::debug!("trigger stopping");
                return;
            }
            () = &mut sleep => {
                deliver(&tx, Instant::now()).await;
            }
            Some(()) = recv_manual(&mut manual) => {
                deliver(&tx, Instant::now()).await;
            }
        }
    }
}

/// `tokio::select!` needs a future even when there's no manual channel; this adapts
/// `Option<Receiver<()>>` into a future that never resolves when absent.
async fn recv_manual(manual: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match manual {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn deliver(tx: &mpsc::Sender<Instant>, at: Instant) {
    match tokio::time::timeout(SEND_TIMEOUT, tx.send(at)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => tracing::debug!("trigger receiver dropped"),
        Err(_) => tracing::debug!("trigger event dropped, no reader within {SEND_TIMEOUT:?}"),
    }
}

fn jittered(period: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return period;
    }
    let jitter_ms = jitter.as_millis().min(u128::from(u32::MAX)) as i64;
    let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
    let period_ms = period.as_millis() as i64;
    Duration::from_millis((period_ms + offset).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn periodic_ticks_without_manual_channel() {
        let mut trigger = Trigger::start(Duration::from_millis(100), Duration::ZERO, None);

        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(100)).await;
            assert!(trigger.recv().await.is_some());
        }

        trigger.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn manual_pulse_fires_independent_of_timer() {
        let (manual_tx, manual_rx) = mpsc::channel(1);
        let mut trigger = Trigger::start(Duration::from_secs(3600), Duration::ZERO, Some(manual_rx));

        manual_tx.send(()).await.unwrap();
        assert!(trigger.recv().await.is_some());

        trigger.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let mut trigger = Trigger::start(Duration::from_millis(10), Duration::ZERO, None);
        trigger.stop();
        trigger.stop();
        trigger.stop();
    }

    #[tokio::test]
    async fn jitter_stays_within_bounds() {
        let period = Duration::from_millis(1000);
        let jitter = Duration::from_millis(100);
        for _ in 0..200 {
            let got = jittered(period, jitter);
            assert!(got >= Duration::from_millis(900));
            assert!(got <= Duration::from_millis(1100));
        }
    }
}
