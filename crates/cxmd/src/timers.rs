//! Tokio backing of the coordinator timers.
//!
//! Each armed [`Timer`] is one task that feeds `Input::Timer` back into the
//! coordinator channel. Arming a timer replaces any running timer of the same
//! kind; dropping [`Timers`] cancels them all.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::trace;

use cxm_proto::defaults::{TM_HEARTBEAT, TM_JOIN_WAIT, TM_TALLY, TM_WATCHDOG};

use crate::coordinator::{Input, Timer, TimerKind};

/// First expiry and period of a timer. One-shot timers have no period.
fn schedule(timer: Timer) -> (Duration, Option<Duration>) {
    match timer {
        Timer::Join => (TM_JOIN_WAIT, None),
        Timer::Tally { .. } => (TM_TALLY, None),
        Timer::LeaderHeartbeat | Timer::FollowerHeartbeat => (Duration::ZERO, Some(TM_HEARTBEAT)),
        Timer::LeaderWatchdog | Timer::FollowerWatchdog => (TM_WATCHDOG, Some(TM_WATCHDOG)),
    }
}

pub struct Timers {
    tasks: HashMap<TimerKind, JoinHandle<()>>,
    inputs: mpsc::Sender<Input>,
}

impl Timers {
    pub fn new(inputs: mpsc::Sender<Input>) -> Self {
        Self {
            tasks: HashMap::new(),
            inputs,
        }
    }

    pub fn start(&mut self, timer: Timer) {
        self.start_with(timer, schedule(timer));
    }

    fn start_with(&mut self, timer: Timer, (first, period): (Duration, Option<Duration>)) {
        self.stop(timer.kind());
        trace!("timers: arming {:?}", timer);

        let inputs = self.inputs.clone();
        let handle = tokio::spawn(async move {
            match period {
                None => {
                    time::sleep(first).await;
                    let _ = inputs.send(Input::Timer(timer)).await;
                }
                Some(period) => {
                    let mut ticker = time::interval_at(Instant::now() + first, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        if inputs.send(Input::Timer(timer)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.insert(timer.kind(), handle);
    }

    pub fn stop(&mut self, kind: TimerKind) {
        if let Some(handle) = self.tasks.remove(&kind) {
            trace!("timers: stopping {:?}", kind);
            handle.abort();
        }
    }

    pub fn stop_all(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.tasks.get(&kind).is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    fn fired(input: Option<Input>) -> Timer {
        match input {
            Some(Input::Timer(timer)) => timer,
            other => panic!("unexpected input {:?}", other),
        }
    }

    #[test]
    fn test_schedule() {
        assert_eq!(schedule(Timer::Join), (TM_JOIN_WAIT, None));
        assert_eq!(schedule(Timer::Tally { election: 7 }), (TM_TALLY, None));
        assert_eq!(
            schedule(Timer::FollowerHeartbeat),
            (Duration::ZERO, Some(TM_HEARTBEAT))
        );
        assert_eq!(
            schedule(Timer::LeaderWatchdog),
            (TM_WATCHDOG, Some(TM_WATCHDOG))
        );
    }

    #[tokio::test]
    async fn test_one_shot_fires_once() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.start_with(Timer::Tally { election: 42 }, (SHORT, None));

        assert_eq!(fired(rx.recv().await), Timer::Tally { election: 42 });
        let again = time::timeout(SHORT * 5, rx.recv()).await;
        assert!(again.is_err());
        assert!(!timers.is_armed(TimerKind::Tally));
    }

    #[tokio::test]
    async fn test_periodic_fires_repeatedly() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.start_with(Timer::LeaderHeartbeat, (Duration::ZERO, Some(SHORT)));

        for _ in 0..3 {
            assert_eq!(fired(rx.recv().await), Timer::LeaderHeartbeat);
        }
        assert!(timers.is_armed(TimerKind::LeaderHeartbeat));
    }

    #[tokio::test]
    async fn test_stop_cancels() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.start_with(Timer::Join, (SHORT, None));
        timers.stop(TimerKind::Join);

        let res = time::timeout(SHORT * 5, rx.recv()).await;
        assert!(res.is_err());
        assert!(!timers.is_armed(TimerKind::Join));
    }

    #[tokio::test]
    async fn test_restart_replaces_previous() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.start_with(Timer::Tally { election: 1 }, (SHORT, None));
        timers.start_with(Timer::Tally { election: 2 }, (SHORT, None));

        assert_eq!(fired(rx.recv().await), Timer::Tally { election: 2 });
        let res = time::timeout(SHORT * 5, rx.recv()).await;
        assert!(res.is_err());
    }
}
