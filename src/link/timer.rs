//! Timers for the link actors
//!
//! The state machine only decides *that* a timer is armed ([`TimerSlots`]);
//! the actor owns the tokio tasks that actually sleep ([`TimerWheel`]).
//! Expiries come back through the actor's queue tagged with a generation,
//! and anything not matching the currently armed generation is stale.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::event::InputSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Bounds the Scanning state.
    ScanWatchdog,
    /// Bounds link establishment and service discovery.
    ConnectTimeout,
    /// Automatic reconnect after a failure before Ready.
    Reconnect,
    /// Gives up waiting for an MTU exchange outcome.
    MtuSettle,
    /// Delay before re-writing a failed chunk.
    WriteRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub timer: Timer,
    pub generation: u64,
}

/// Which timers are logically armed, and under which generation.
#[derive(Debug, Default)]
pub struct TimerSlots {
    next_generation: u64,
    armed: HashMap<Timer, u64>,
}

impl TimerSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) `timer`, invalidating any earlier generation.
    pub fn arm(&mut self, timer: Timer) -> u64 {
        self.next_generation += 1;
        self.armed.insert(timer, self.next_generation);
        self.next_generation
    }

    /// Returns whether the timer was armed.
    pub fn cancel(&mut self, timer: Timer) -> bool {
        self.armed.remove(&timer).is_some()
    }

    /// Consume an expiry. True only for the current generation.
    pub fn fire(&mut self, fired: TimerFired) -> bool {
        match self.armed.get(&fired.timer) {
            Some(generation) if *generation == fired.generation => {
                self.armed.remove(&fired.timer);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, timer: Timer) -> bool {
        self.armed.contains_key(&timer)
    }

    pub fn armed(&self) -> impl Iterator<Item = Timer> + '_ {
        self.armed.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

/// Sleeping tasks backing the armed timers of one actor.
pub struct TimerWheel<C> {
    sender: InputSender<C>,
    tasks: HashMap<Timer, (u64, JoinHandle<()>)>,
}

impl<C: Send + 'static> TimerWheel<C> {
    pub fn new(sender: InputSender<C>) -> Self {
        Self {
            sender,
            tasks: HashMap::new(),
        }
    }

    pub fn arm(&mut self, timer: Timer, generation: u64, after: Duration) {
        let sender = self.sender.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            sender.timer(TimerFired { timer, generation });
        });
        if let Some((_, previous)) = self.tasks.insert(timer, (generation, task)) {
            previous.abort();
        }
    }

    pub fn cancel(&mut self, timer: Timer) {
        if let Some((_, task)) = self.tasks.remove(&timer) {
            task.abort();
        }
    }

    /// Forget a timer whose expiry has been delivered. A stale expiry
    /// leaves the re-armed task alone.
    pub fn fired(&mut self, fired: TimerFired) {
        if self.tasks.get(&fired.timer).map(|(g, _)| *g) == Some(fired.generation) {
            self.tasks.remove(&fired.timer);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, task)) in self.tasks.drain() {
            task.abort();
        }
    }

    /// Timer tasks still sleeping.
    pub fn pending(&self) -> usize {
        self.tasks.values().filter(|(_, t)| !t.is_finished()).count()
    }
}

impl<C> Drop for TimerWheel<C> {
    fn drop(&mut self) {
        for (_, (_, task)) in self.tasks.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::event::{Input, LinkEventBus};

    #[test]
    fn test_rearm_invalidates_previous_generation() {
        let mut slots = TimerSlots::new();
        let first = slots.arm(Timer::WriteRetry);
        let second = slots.arm(Timer::WriteRetry);
        assert_ne!(first, second);

        assert!(!slots.fire(TimerFired {
            timer: Timer::WriteRetry,
            generation: first,
        }));
        assert!(slots.fire(TimerFired {
            timer: Timer::WriteRetry,
            generation: second,
        }));
        // A generation fires at most once.
        assert!(!slots.fire(TimerFired {
            timer: Timer::WriteRetry,
            generation: second,
        }));
        assert!(slots.is_empty());
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut slots = TimerSlots::new();
        let generation = slots.arm(Timer::ScanWatchdog);
        assert!(slots.cancel(Timer::ScanWatchdog));
        assert!(!slots.cancel(Timer::ScanWatchdog));
        assert!(!slots.fire(TimerFired {
            timer: Timer::ScanWatchdog,
            generation,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wheel_delivers_expiry_into_queue() {
        let mut bus: LinkEventBus<()> = LinkEventBus::new();
        let mut wheel = TimerWheel::new(bus.sender());

        wheel.arm(Timer::Reconnect, 3, Duration::from_secs(5));
        assert_eq!(wheel.pending(), 1);

        let before = tokio::time::Instant::now();
        match bus.next().await {
            Some(Input::Timer(fired)) => {
                assert_eq!(fired.timer, Timer::Reconnect);
                assert_eq!(fired.generation, 3);
            }
            other => panic!("unexpected input: {:?}", other),
        }
        assert!(before.elapsed() >= Duration::from_secs(5));
        wheel.fired(TimerFired {
            timer: Timer::Reconnect,
            generation: 3,
        });
        assert_eq!(wheel.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wheel_cancel_aborts_task() {
        let bus: LinkEventBus<()> = LinkEventBus::new();
        let mut wheel = TimerWheel::new(bus.sender());
        wheel.arm(Timer::ScanWatchdog, 1, Duration::from_secs(15));
        wheel.arm(Timer::WriteRetry, 2, Duration::from_millis(100));
        wheel.cancel_all();
        tokio::task::yield_now().await;
        assert_eq!(wheel.pending(), 0);
    }
}
