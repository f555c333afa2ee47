//! Cancelable delayed events owned by a room session.
//!
//! A timer is a spawned `tokio::time::sleep` that reports [`TimerFired`]
//! on an mpsc channel. Scheduling a key again replaces the previous timer.
//! Each timer carries a generation so a firing that raced a cancel can be
//! told apart with [`Scheduler::accept`].

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A timer that elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired<K> {
    pub key: K,
    pub generation: u64,
}

pub struct Scheduler<K> {
    tx: mpsc::UnboundedSender<TimerFired<K>>,
    timers: HashMap<K, (u64, JoinHandle<()>)>,
    next_generation: u64,
}

impl<K> Scheduler<K>
where
    K: Copy + Eq + Hash + Send + 'static,
{
    /// Create a scheduler and the receiver its timers fire into.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired<K>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                timers: HashMap::new(),
                next_generation: 0,
            },
            rx,
        )
    }

    /// Fire `key` after `delay`, replacing any pending timer for it.
    pub fn schedule(&mut self, key: K, delay: Duration) {
        self.cancel(key);
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired { key, generation });
        });
        self.timers.insert(key, (generation, handle));
    }

    /// Returns true if a timer was pending.
    pub fn cancel(&mut self, key: K) -> bool {
        match self.timers.remove(&key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self, key: K) -> bool {
        self.timers.contains_key(&key)
    }

    /// Consume a firing. Stale firings (canceled or replaced) return false.
    pub fn accept(&mut self, fired: &TimerFired<K>) -> bool {
        match self.timers.get(&fired.key) {
            Some((generation, _)) if *generation == fired.generation => {
                self.timers.remove(&fired.key);
                true
            }
            _ => false,
        }
    }
}

impl<K> Drop for Scheduler<K> {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Key {
        Settle,
        Loading,
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (mut scheduler, mut rx) = Scheduler::new();
        scheduler.schedule(Key::Settle, Duration::from_millis(1000));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(rx.try_recv().is_err());

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.key, Key::Settle);
        assert!(scheduler.accept(&fired));
        assert!(!scheduler.is_scheduled(Key::Settle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (mut scheduler, mut rx) = Scheduler::new();
        scheduler.schedule(Key::Loading, Duration::from_millis(10));
        assert!(scheduler.cancel(Key::Loading));
        assert!(!scheduler.cancel(Key::Loading));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous() {
        let (mut scheduler, mut rx) = Scheduler::new();
        scheduler.schedule(Key::Settle, Duration::from_millis(10));
        scheduler.schedule(Key::Settle, Duration::from_millis(100));

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.generation, 2);
        assert!(scheduler.accept(&fired));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_firing_rejected() {
        let (mut scheduler, _rx) = Scheduler::new();
        scheduler.schedule(Key::Settle, Duration::from_millis(10));
        let stale = TimerFired {
            key: Key::Settle,
            generation: 0,
        };
        assert!(!scheduler.accept(&stale));
        assert!(scheduler.is_scheduled(Key::Settle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (mut scheduler, mut rx) = Scheduler::new();
        scheduler.schedule(Key::Settle, Duration::from_millis(10));
        scheduler.schedule(Key::Loading, Duration::from_millis(10));
        scheduler.cancel_all();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
