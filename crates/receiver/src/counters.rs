use std::sync::Mutex;

use serde::Serialize;

/// Process-wide ingress counters, served as JSON on `/metrics`.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub events_received: u64,
    pub events_processed: u64,
    pub events_failed: u64,
    pub events_schema_rejected: u64,
}

/// All four counters behind one lock.
#[derive(Default)]
pub struct Counters(Mutex<CounterSnapshot>);

impl Counters {
    fn bump(&self, f: impl FnOnce(&mut CounterSnapshot)) {
        let mut c = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut c);
    }

    pub fn received(&self) {
        self.bump(|c| c.events_received += 1);
    }

    pub fn processed(&self) {
        self.bump(|c| c.events_processed += 1);
    }

    pub fn failed(&self) {
        self.bump(|c| c.events_failed += 1);
    }

    pub fn schema_rejected(&self) {
        self.bump(|c| c.events_schema_rejected += 1);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_increments_are_not_lost() {
        let counters = Counters::default();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        counters.received();
                        counters.failed();
                    }
                });
            }
        });
        let snap = counters.snapshot();
        assert_eq!(snap.events_received, 8000);
        assert_eq!(snap.events_failed, 8000);
        assert_eq!(snap.events_processed, 0);
    }
}
