//! Server-wide admission control: a fixed request window and a redelivery filter.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// At most `limit` requests per `window`, counted across the whole server.
pub struct FixedWindow {
    limit: u32,
    window: Duration,
    state: Mutex<(Instant, u32)>,
}

impl FixedWindow {
    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    /// Count one request; false once the current window is exhausted.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (started, count) = &mut *guard;
        if now.duration_since(*started) >= self.window {
            *started = now;
            *count = 0;
        }
        if *count >= self.limit {
            return false;
        }
        *count += 1;
        true
    }
}

/// Remembers the most recent delivery ids; oldest are evicted first.
pub struct RecentIds {
    capacity: usize,
    inner: Mutex<(VecDeque<String>, HashSet<String>)>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new((VecDeque::new(), HashSet::new())),
        }
    }

    /// Record `id`; returns false if it was already seen.
    pub fn insert(&self, id: &str) -> bool {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (order, seen) = &mut *guard;
        if seen.contains(id) {
            return false;
        }
        if order.len() == self.capacity {
            if let Some(oldest) = order.pop_front() {
                seen.remove(&oldest);
            }
        }
        order.push_back(id.to_string());
        seen.insert(id.to_string());
        true
    }

    /// Forget `id` so a redelivery of it is accepted again.
    pub fn remove(&self, id: &str) {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (order, seen) = &mut *guard;
        if seen.remove(id) {
            order.retain(|o| o != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_blocks_then_resets() {
        let limiter = FixedWindow::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(limiter.allow_at(t0));
        assert!(limiter.allow_at(t0 + Duration::from_secs(1)));
        assert!(!limiter.allow_at(t0 + Duration::from_secs(2)));
        assert!(limiter.allow_at(t0 + Duration::from_secs(61)));
    }

    #[test]
    fn test_zero_limit_rejects_everything() {
        let limiter = FixedWindow::per_minute(0);
        assert!(!limiter.allow());
    }

    #[test]
    fn test_recent_ids_detects_redelivery() {
        let ids = RecentIds::new(8);
        assert!(ids.insert("abc"));
        assert!(!ids.insert("abc"));
        assert!(ids.insert("def"));
    }

    #[test]
    fn test_recent_ids_evicts_oldest() {
        let ids = RecentIds::new(2);
        assert!(ids.insert("a"));
        assert!(ids.insert("b"));
        assert!(ids.insert("c"));
        // "a" fell out of the window, so it is accepted again.
        assert!(ids.insert("a"));
        assert!(!ids.insert("c"));
    }

    #[test]
    fn test_recent_ids_remove_allows_redelivery() {
        let ids = RecentIds::new(2);
        assert!(ids.insert("a"));
        assert!(ids.insert("b"));
        ids.remove("a");
        assert!(ids.insert("a"));
        // "b" is now the oldest and still counted.
        assert!(!ids.insert("b"));
        ids.remove("missing");
        assert!(!ids.insert("a"));
    }
}
