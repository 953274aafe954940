//! Rate governor: one shared cooldown for every remote call.
//!
//! The remote service applies FloodWait limits globally per credential, so a
//! single monotonic deadline is shared by all concurrent callers rather than
//! per-chat state. `acquire` suspends until the deadline has passed;
//! `report_limited` pushes it forward and never shortens it.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::{Error, Result};

#[derive(Clone, Copy, Debug)]
pub struct GovernorConfig {
    /// Minimum spacing between consecutive permits (0 disables pacing).
    pub min_interval: Duration,
    /// Consecutive FloodWait reports tolerated before `acquire` gives up
    /// with `RateLimitExceeded`.
    pub flood_retry_ceiling: u32,
    /// Upper bound on the jitter added to each reported cooldown, spreading
    /// out retries from concurrent callers.
    pub jitter_cap: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::ZERO,
            flood_retry_ceiling: 3,
            jitter_cap: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
struct GovernorState {
    next_allowed: Instant,
    /// End of the currently pending FloodWait cooldown, if any. Pacing via
    /// `min_interval` moves `next_allowed` but never this.
    cooldown_until: Option<Instant>,
    strikes: u32,
}

pub struct RateGovernor {
    cfg: GovernorConfig,
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    pub fn new(cfg: GovernorConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(GovernorState {
                next_allowed: Instant::now(),
                cooldown_until: None,
                strikes: 0,
            }),
        }
    }

    /// Suspend until it is safe to issue one remote call.
    ///
    /// Returns `RateLimitExceeded` once the service has reported the same
    /// limit past the configured ceiling without an intervening success.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            let deadline = {
                let mut st = self.state.lock().await;
                if st.strikes > self.cfg.flood_retry_ceiling {
                    return Err(Error::RateLimitExceeded { reports: st.strikes });
                }
                let now = Instant::now();
                if now >= st.next_allowed {
                    // Reserve the pacing slot while we hold the lock.
                    st.next_allowed = now + self.cfg.min_interval;
                    return Ok(());
                }
                st.next_allowed
            };
            // The deadline may move again while we sleep; re-check on wake.
            sleep_until(deadline).await;
        }
    }

    /// Record a FloodWait reported by the remote service.
    ///
    /// Concurrent reports take the maximum wait: the deadline only ever moves
    /// forward. Strikes count cooldown cycles, not reports: every in-flight
    /// worker observes the same FloodWait event, so a report landing while a
    /// cooldown is already pending is a sighting of the current cycle and
    /// does not burn the retry budget.
    pub async fn report_limited(&self, wait: Duration) {
        let jitter = self.jitter();
        let mut st = self.state.lock().await;
        let now = Instant::now();
        let new_cycle = st.cooldown_until.map_or(true, |until| now >= until);
        if new_cycle {
            st.strikes = st.strikes.saturating_add(1);
        }
        let candidate = now + wait + jitter;
        if candidate > st.next_allowed {
            st.next_allowed = candidate;
        }
        st.cooldown_until = Some(st.cooldown_until.map_or(candidate, |u| u.max(candidate)));
        warn!(
            wait_secs = wait.as_secs_f64(),
            strikes = st.strikes,
            new_cycle,
            "remote service rate limit reported"
        );
    }

    /// Record a successful remote call, clearing the strike budget.
    pub async fn report_ok(&self) {
        let mut st = self.state.lock().await;
        if st.strikes > 0 {
            debug!(strikes = st.strikes, "rate limit cleared after success");
            st.strikes = 0;
        }
        st.cooldown_until = None;
    }

    fn jitter(&self) -> Duration {
        let cap_ms = self.cfg.jitter_cap.as_millis() as u64;
        if cap_ms == 0 {
            return Duration::ZERO;
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        Duration::from_millis(nanos % (cap_ms + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn governor(ceiling: u32) -> Arc<RateGovernor> {
        Arc::new(RateGovernor::new(GovernorConfig {
            min_interval: Duration::ZERO,
            flood_retry_ceiling: ceiling,
            jitter_cap: Duration::ZERO,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_out_reported_cooldown() {
        let gov = governor(10);
        gov.report_limited(Duration::from_secs(30)).await;

        let start = Instant::now();
        gov.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reports_take_the_maximum_wait() {
        let gov = governor(10);
        let (a, b) = tokio::join!(
            gov.report_limited(Duration::from_secs(30)),
            gov.report_limited(Duration::from_secs(5)),
        );
        let _ = (a, b);

        let start = Instant::now();
        gov.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_extension_during_sleep_is_honored() {
        let gov = governor(10);
        gov.report_limited(Duration::from_secs(5)).await;

        let waiter = {
            let gov = gov.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                gov.acquire().await.unwrap();
                start.elapsed()
            })
        };

        // Push the deadline further while the waiter is already asleep.
        tokio::time::sleep(Duration::from_secs(1)).await;
        gov.report_limited(Duration::from_secs(20)).await;

        let waited = waiter.await.unwrap();
        assert!(waited >= Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reports_of_one_event_count_one_strike() {
        let gov = governor(3);
        // Four workers hit the same FloodWait and all report it before the
        // cooldown elapses.
        tokio::join!(
            gov.report_limited(Duration::from_secs(10)),
            gov.report_limited(Duration::from_secs(10)),
            gov.report_limited(Duration::from_secs(10)),
            gov.report_limited(Duration::from_secs(10)),
        );

        // One event, one strike: well within the ceiling.
        let start = Instant::now();
        gov.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn reports_in_separate_cycles_still_reach_the_ceiling() {
        let gov = governor(1);
        gov.report_limited(Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        gov.report_limited(Duration::from_secs(2)).await;

        match gov.acquire().await {
            Err(Error::RateLimitExceeded { reports }) => assert_eq!(reports, 2),
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn strike_ceiling_surfaces_terminal_error() {
        let gov = governor(2);
        for _ in 0..3 {
            gov.report_limited(Duration::ZERO).await;
        }
        match gov.acquire().await {
            Err(Error::RateLimitExceeded { reports }) => assert_eq!(reports, 3),
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_strikes() {
        let gov = governor(2);
        for _ in 0..2 {
            gov.report_limited(Duration::ZERO).await;
        }
        gov.acquire().await.unwrap();
        gov.report_ok().await;
        for _ in 0..2 {
            gov.report_limited(Duration::ZERO).await;
        }
        // Two strikes after a success stays within the ceiling.
        gov.acquire().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn min_interval_paces_consecutive_permits() {
        let gov = Arc::new(RateGovernor::new(GovernorConfig {
            min_interval: Duration::from_secs(2),
            flood_retry_ceiling: 3,
            jitter_cap: Duration::ZERO,
        }));

        let start = Instant::now();
        gov.acquire().await.unwrap();
        gov.acquire().await.unwrap();
        gov.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));
    }
}
