//! Master-down and advertisement timers.
//!
//! Each instance owns two one-shot timers. Arming spawns a task that sleeps
//! for the stored timeout and then runs the expiry callback with a
//! [`TimerToken`]. Disarming aborts the task and retires the token.
//!
//! Cancellation is synchronous with respect to the instance lock: arm,
//! disarm and [`TimerEngine::expire`] are only called with the instance
//! locked, and an expiry callback must call `expire` under that lock before
//! acting. A callback that lost the race against a disarm finds its token
//! retired and does nothing; one that won has finished applying its event
//! before the disarming caller could take the lock.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Calculate a timeout of `multiplier * advbase` seconds plus a skew of
/// `advskew / 256` seconds. When both parameters are zero the skew becomes
/// `multiplier / 256` seconds so the timer never has zero duration.
pub fn calculate_timeout(multiplier: u8, advbase: u8, advskew: u8) -> Duration {
    let secs = u64::from(multiplier) * u64::from(advbase);
    let fraction = if advbase == 0 && advskew == 0 {
        u64::from(multiplier)
    } else {
        u64::from(advskew)
    };

    Duration::from_secs(secs) + Duration::from_micros(fraction * 1_000_000 / 256)
}

/// Timeouts derived from advbase/advskew
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// How long a backup waits for an advertisement
    pub master_down: Duration,

    /// Interval between a master's advertisements
    pub advertisement: Duration,
}

impl Timeouts {
    pub fn new(advbase: u8, advskew: u8) -> Self {
        Self {
            master_down: calculate_timeout(3, advbase, advskew),
            advertisement: calculate_timeout(1, advbase, advskew),
        }
    }
}

/// Which of an instance's two timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    MasterDown,
    Advertisement,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::MasterDown => write!(f, "md_timer"),
            TimerKind::Advertisement => write!(f, "adv_timer"),
        }
    }
}

/// Identifies one arming of one timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    kind: TimerKind,
    generation: u64,
}

impl TimerToken {
    pub fn kind(&self) -> TimerKind {
        self.kind
    }
}

#[derive(Default)]
struct Slot {
    token: Option<TimerToken>,
    task: Option<JoinHandle<()>>,
}

impl Slot {
    fn clear(&mut self) {
        self.token = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The pair of timers owned by one instance
pub struct TimerEngine {
    timeouts: Timeouts,
    master_down: Slot,
    advertisement: Slot,
    generation: u64,
}

impl TimerEngine {
    pub fn new(timeouts: Timeouts) -> Self {
        Self {
            timeouts,
            master_down: Slot::default(),
            advertisement: Slot::default(),
            generation: 0,
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Replace the stored timeouts. Armed timers keep their deadline; the
    /// new values apply from the next arming.
    pub fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.timeouts = timeouts;
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Slot {
        match kind {
            TimerKind::MasterDown => &mut self.master_down,
            TimerKind::Advertisement => &mut self.advertisement,
        }
    }

    fn duration(&self, kind: TimerKind) -> Duration {
        match kind {
            TimerKind::MasterDown => self.timeouts.master_down,
            TimerKind::Advertisement => self.timeouts.advertisement,
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::MasterDown => self.master_down.token.is_some(),
            TimerKind::Advertisement => self.advertisement.token.is_some(),
        }
    }

    /// (Re)arm `kind` for its stored timeout. Any previous arming is
    /// disarmed first.
    pub fn arm<F, Fut>(&mut self, kind: TimerKind, on_expiry: F) -> TimerToken
    where
        F: FnOnce(TimerToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm(kind);

        self.generation += 1;
        let token = TimerToken {
            kind,
            generation: self.generation,
        };
        let duration = self.duration(kind);

        trace!(timer = %kind, ?duration, "arming timer");
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            on_expiry(token).await;
        });

        let slot = self.slot(kind);
        slot.token = Some(token);
        slot.task = Some(task);
        token
    }

    pub fn disarm(&mut self, kind: TimerKind) {
        let slot = self.slot(kind);
        if slot.token.is_some() {
            trace!(timer = %kind, "disarming timer");
        }
        slot.clear();
    }

    pub fn disarm_all(&mut self) {
        self.disarm(TimerKind::MasterDown);
        self.disarm(TimerKind::Advertisement);
    }

    /// Consume an expiry. Returns false if `token` was disarmed or rearmed
    /// since it fired, in which case the expiry must be ignored.
    pub fn expire(&mut self, token: TimerToken) -> bool {
        let slot = self.slot(token.kind);
        if slot.token != Some(token) {
            return false;
        }

        slot.token = None;
        // The task is the caller; dropping the handle detaches it
        slot.task = None;
        true
    }
}

impl Drop for TimerEngine {
    fn drop(&mut self) {
        self.disarm_all();
    }
}

impl fmt::Debug for TimerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEngine")
            .field("timeouts", &self.timeouts)
            .field("md_armed", &self.master_down.token.is_some())
            .field("adv_armed", &self.advertisement.token.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::{Mutex, mpsc};

    #[test]
    fn test_timeout_calculation() {
        let t = Timeouts::new(1, 0);
        assert_eq!(t.master_down, Duration::from_secs(3));
        assert_eq!(t.advertisement, Duration::from_secs(1));

        // 50/256 s = 195312 us
        let t = Timeouts::new(1, 50);
        assert_eq!(t.master_down, Duration::from_micros(3_195_312));
        assert_eq!(t.advertisement, Duration::from_micros(1_195_312));

        // Both zero: 3/256 s and 1/256 s
        let t = Timeouts::new(0, 0);
        assert_eq!(t.master_down, Duration::from_micros(11_718));
        assert_eq!(t.advertisement, Duration::from_micros(3_906));
    }

    #[test]
    fn test_master_down_exceeds_advertisement() {
        let valid = (0u8..=255)
            .flat_map(|advbase| (0u8..=255).map(move |advskew| (advbase, advskew)))
            .filter(|&(advbase, advskew)| advbase >= 1 || advskew == 0);

        for (advbase, advskew) in valid {
            let t = Timeouts::new(advbase, advskew);
            assert!(t.advertisement > Duration::ZERO);
            assert!(
                t.master_down > t.advertisement,
                "advbase={advbase} advskew={advskew}"
            );
        }
    }

    #[test]
    fn test_lower_skew_expires_first() {
        assert!(Timeouts::new(1, 0).master_down < Timeouts::new(1, 50).master_down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TimerEngine::new(Timeouts::new(1, 0));

        let start = tokio::time::Instant::now();
        let armed = engine.arm(TimerKind::Advertisement, move |token| async move {
            let _ = tx.send(token);
        });
        assert!(engine.is_armed(TimerKind::Advertisement));
        assert!(!engine.is_armed(TimerKind::MasterDown));

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, armed);
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        assert!(engine.expire(fired));
        assert!(!engine.is_armed(TimerKind::Advertisement));
        // A token is consumed once
        assert!(!engine.expire(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_prevents_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerToken>();
        let mut engine = TimerEngine::new(Timeouts::new(1, 0));

        engine.arm(TimerKind::MasterDown, move |token| async move {
            let _ = tx.send(token);
        });
        engine.disarm(TimerKind::MasterDown);

        tokio::time::sleep(Duration::from_secs(10)).await;
        // The sender was dropped with the aborted task
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_is_ignored_under_lock() {
        let engine = Arc::new(Mutex::new(TimerEngine::new(Timeouts::new(0, 0))));
        let (tx, mut rx) = mpsc::unbounded_channel();

        {
            let shared = engine.clone();
            let mut guard = engine.lock().await;
            guard.arm(TimerKind::MasterDown, move |token| async move {
                let applied = shared.lock().await.expire(token);
                let _ = tx.send(applied);
            });
            // Let the timer fire while we still hold the lock
            tokio::time::sleep(Duration::from_secs(1)).await;
            guard.disarm(TimerKind::MasterDown);
        }

        // The callback either never ran or saw its token retired
        if let Some(applied) = rx.recv().await {
            assert!(!applied);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_timeouts_apply_on_next_arm() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TimerEngine::new(Timeouts::new(1, 0));
        let start = tokio::time::Instant::now();

        let tx1 = tx.clone();
        engine.arm(TimerKind::Advertisement, move |token| async move {
            let _ = tx1.send(token);
        });
        engine.set_timeouts(Timeouts::new(5, 0));

        let first = rx.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert!(engine.expire(first));

        let rearmed = tokio::time::Instant::now();
        engine.arm(TimerKind::Advertisement, move |token| async move {
            let _ = tx.send(token);
        });
        rx.recv().await.unwrap();
        assert_eq!(rearmed.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TimerEngine::new(Timeouts::new(1, 0));

        let tx1 = tx.clone();
        let first = engine.arm(TimerKind::MasterDown, move |token| async move {
            let _ = tx1.send(token);
        });
        let second = engine.arm(TimerKind::MasterDown, move |token| async move {
            let _ = tx.send(token);
        });
        assert_ne!(first, second);

        assert_eq!(rx.recv().await.unwrap(), second);
        assert!(!engine.expire(first));
        assert!(engine.expire(second));
    }
}
