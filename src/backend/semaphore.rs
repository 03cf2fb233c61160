//! Counting semaphore used to block and wake vCPUs.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore.
///
/// `up` never blocks. `down` waits for a signal. `drain` is the non-blocking
/// down-to-zero: it discards every queued signal at once.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u64>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one signal, waking a waiter if there is one.
    pub fn up(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Wait until a signal is queued and consume it.
    pub fn down(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Consume all queued signals. Returns how many were drained.
    pub fn drain(&self) -> u64 {
        std::mem::take(&mut *self.count.lock())
    }

    /// Number of queued signals.
    pub fn pending(&self) -> u64 {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_drain_resets_count() {
        let sem = Semaphore::new();
        sem.up();
        sem.up();
        sem.up();

        assert_eq!(sem.drain(), 3);
        assert_eq!(sem.pending(), 0);
        assert_eq!(sem.drain(), 0);
    }

    #[test]
    fn test_down_waits_for_up() {
        let sem = Arc::new(Semaphore::new());
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.down())
        };

        sem.up();
        waiter.join().unwrap();
        assert_eq!(sem.pending(), 0);
    }
}
