//! Timer utility implemented using `tokio::time::Sleep` on a spawned task,
//! connected to the caller through `tokio::sync::watch` and
//! `tokio::sync::Notify` channels. The replica core owns two of these: the
//! follower lease timer and the master renewal timer. Both get re-armed far
//! more often than they fire, so cheap re-arming matters more than tick
//! precision here.

use std::sync::Arc;

use crate::utils::CanopyError;

use futures::future::FutureExt;

use tokio::sync::{watch, Notify};
use tokio::time::{self, Duration, Instant};

/// Timer utility for signalling after a given timeout.
///
/// Every `kickoff()` replaces the previous deadline, which is exactly the
/// lease-extension discipline: a fresh grant pushes the expiry out and the
/// old deadline must never fire. Must be used within the context of a tokio
/// runtime.
#[derive(Debug)]
pub struct Timer {
    /// Deadline setting channel (caller side sender).
    deadline_tx: watch::Sender<Option<Instant>>,

    /// Timeout notification channel (caller side receiver).
    notify: Arc<Notify>,
}

impl Timer {
    /// Creates a new timer utility.
    pub fn new() -> Self {
        let (deadline_tx, mut deadline_rx) = watch::channel(None);
        let notify = Arc::new(Notify::new());
        let notify_ref = notify.clone();

        // spawn the background sleeper task
        tokio::spawn(async move {
            let sleep = time::sleep(Duration::ZERO);
            tokio::pin!(sleep);

            while deadline_rx.changed().await.is_ok() {
                // received a new deadline
                let deadline = *deadline_rx.borrow();
                if let Some(ddl) = deadline {
                    sleep.as_mut().reset(ddl);
                    (&mut sleep).await;

                    // only send notification if deadline has not changed
                    // since last wakeup
                    if let Ok(false) = deadline_rx.has_changed() {
                        notify_ref.notify_one();
                    }
                }
            }
            // sender has been dropped, terminate
        });

        Timer {
            deadline_tx,
            notify,
        }
    }

    /// Arms the timer to fire after the given duration. Every call to
    /// `kickoff()` leads to one or zero permits inserted into `notify`; if
    /// a new call to `kickoff()` is made before the active one finishes,
    /// the timer restarts and will notify a timeout only at the new
    /// deadline.
    pub fn kickoff(&self, dur: Duration) -> Result<(), CanopyError> {
        if dur.is_zero() {
            return Err(CanopyError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.deadline_tx.send(Some(Instant::now() + dur))?;
        Ok(())
    }

    /// Cancels the currently scheduled timeout, draining a notification
    /// that may have ticked already. Used e.g. when a master steps down
    /// and its renewal timer must go quiet.
    pub fn cancel(&self) -> Result<(), CanopyError> {
        self.deadline_tx.send(None)?;

        // consume all existing timeout notifications
        while self.notify.notified().now_or_never().is_some() {}

        Ok(())
    }

    /// Waits for a timeout notification. Typically, this should be used as
    /// a branch of a `tokio::select!`.
    pub async fn timeout(&self) {
        self.notify.notified().await;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;
    use tokio::time::{Duration, Instant};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lease_expiry_fires_once() -> Result<(), CanopyError> {
        let lease_timer = Arc::new(Timer::new());
        let armed_at = Instant::now();
        lease_timer.kickoff(Duration::from_millis(80))?;

        // the lease runs out and the timer fires
        lease_timer.timeout().await;
        assert!(armed_at.elapsed() >= Duration::from_millis(80));

        // exactly one permit per kickoff: no phantom second expiry
        tokio::select! {
            () = lease_timer.timeout() => panic!("lease expired twice"),
            _ = time::sleep(Duration::from_millis(40)) => {}
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn grant_race_extends_deadline() -> Result<(), CanopyError> {
        let lease_timer = Arc::new(Timer::new());
        let granter = lease_timer.clone();
        let armed_at = Instant::now();

        // the master goes quiet for a while, but a heartbeat carrying a
        // fresh grant lands before the first lease runs out
        lease_timer.kickoff(Duration::from_millis(120))?;
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(60)).await;
            granter.kickoff(Duration::from_millis(160))?;
            Ok::<(), CanopyError>(())
        });

        // only the extended deadline may fire; firing at the original one
        // would depose a healthy master
        lease_timer.timeout().await;
        assert!(armed_at.elapsed() >= Duration::from_millis(220));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn demotion_drains_pending_expiry() -> Result<(), CanopyError> {
        let renew_timer = Arc::new(Timer::new());

        // the renewal timer ticked while the event loop was busy; by the
        // time the replica steps down, a stale permit is pending
        renew_timer.kickoff(Duration::from_millis(40))?;
        time::sleep(Duration::from_millis(90)).await;
        renew_timer.cancel()?;

        // a cancelled timer must stay quiet, stale permit included
        tokio::select! {
            () = renew_timer.timeout() => panic!("renewal fired after step-down"),
            _ = time::sleep(Duration::from_millis(60)) => {}
        }

        // stepping back up re-arms it like any fresh timer
        let rearmed_at = Instant::now();
        renew_timer.kickoff(Duration::from_millis(50))?;
        renew_timer.timeout().await;
        assert!(rearmed_at.elapsed() >= Duration::from_millis(50));
        Ok(())
    }
}
