//! Per-host accounting of established connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::trace;

/// Atomic per-host connection counter, used as an admission gate while pools
/// grow. Advisory only: the pool's own connection set stays authoritative
/// for iteration and flushing, and the two may briefly disagree while a
/// connection is being swapped out.
#[derive(Clone, Default)]
pub(crate) struct HostConnectionCounter {
    counts: Arc<RwLock<HashMap<SocketAddr, Arc<AtomicUsize>>>>,
}

impl HostConnectionCounter {
    /// Atomically increments the host's count if it is below `cap`.
    /// The returned guard decrements on drop.
    pub(crate) fn try_increase(
        &self,
        host: SocketAddr,
        cap: usize,
    ) -> Option<HostConnectionGuard> {
        let count = self.count_for(host);
        let mut current = count.load(Ordering::Acquire);
        loop {
            if current >= cap {
                trace!(
                    "[{}] Connection count {} at the cap of {}",
                    host,
                    current,
                    cap
                );
                return None;
            }
            match count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(HostConnectionGuard {
                        counter: self.clone(),
                        host,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Decrements the host's count. Prefer letting the guard do this.
    pub(crate) fn decrease(&self, host: SocketAddr) {
        if let Some(count) = self.counts.read().unwrap().get(&host) {
            count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn connection_count(&self, host: SocketAddr) -> usize {
        self.counts
            .read()
            .unwrap()
            .get(&host)
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    fn count_for(&self, host: SocketAddr) -> Arc<AtomicUsize> {
        if let Some(count) = self.counts.read().unwrap().get(&host) {
            return count.clone();
        }
        self.counts
            .write()
            .unwrap()
            .entry(host)
            .or_default()
            .clone()
    }
}

/// Releases one unit of a host's connection count on drop.
pub(crate) struct HostConnectionGuard {
    counter: HostConnectionCounter,
    host: SocketAddr,
}

impl Drop for HostConnectionGuard {
    fn drop(&mut self) {
        self.counter.decrease(self.host);
    }
}

#[cfg(test)]
mod tests {
    use super::HostConnectionCounter;

    #[test]
    fn counter_enforces_the_cap() {
        let counter = HostConnectionCounter::default();
        let host = "10.0.0.1:9042".parse().unwrap();

        let first = counter.try_increase(host, 2).unwrap();
        let second = counter.try_increase(host, 2).unwrap();
        assert!(counter.try_increase(host, 2).is_none());
        assert_eq!(counter.connection_count(host), 2);

        drop(second);
        assert_eq!(counter.connection_count(host), 1);
        let _third = counter.try_increase(host, 2).unwrap();
        assert!(counter.try_increase(host, 2).is_none());
        drop(first);
    }

    #[test]
    fn counts_are_tracked_per_host() {
        let counter = HostConnectionCounter::default();
        let first_host = "10.0.0.1:9042".parse().unwrap();
        let second_host = "10.0.0.2:9042".parse().unwrap();

        let _first = counter.try_increase(first_host, 1).unwrap();
        assert!(counter.try_increase(first_host, 1).is_none());
        let _second = counter.try_increase(second_host, 1).unwrap();
        assert_eq!(counter.connection_count(first_host), 1);
        assert_eq!(counter.connection_count(second_host), 1);
    }
}
