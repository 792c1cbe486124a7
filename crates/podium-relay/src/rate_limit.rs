//! Per-IP connection limiter for the relay socket endpoint.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};

type LiveCounts = HashMap<IpAddr, u32>;

/// Caps the number of live connections per IP. Each accepted connection
/// holds an [`Admission`]; the slot frees when that admission is dropped.
pub struct RateLimiter {
    max_connections_per_ip: u32,
    live: Arc<Mutex<LiveCounts>>,
}

/// One admitted connection. Dropping it gives the slot back, whether the
/// peer disconnected or the upgrade never completed.
#[derive(Debug)]
pub struct Admission {
    live: Weak<Mutex<LiveCounts>>,
    ip: IpAddr,
}

impl RateLimiter {
    pub fn new(max_connections_per_ip: u32) -> Self {
        Self {
            max_connections_per_ip,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns `None` when `ip` already holds its full allowance.
    pub fn check(&self, ip: IpAddr) -> Option<Admission> {
        let mut map = lock(&self.live);
        let count = map.entry(ip).or_default();

        if *count >= self.max_connections_per_ip {
            warn!(%ip, count = *count, limit = self.max_connections_per_ip,
                "Rate limited: too many connections from IP");
            if *count == 0 {
                map.remove(&ip);
            }
            return None;
        }

        *count += 1;
        Some(Admission {
            live: Arc::downgrade(&self.live),
            ip,
        })
    }

    /// Connections currently admitted for `ip`.
    pub fn live_connections(&self, ip: IpAddr) -> u32 {
        lock(&self.live).get(&ip).copied().unwrap_or(0)
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        let Some(live) = self.live.upgrade() else {
            return;
        };
        let mut map = lock(&live);
        if let Some(count) = map.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(&self.ip);
            }
        }
        debug!(ip = %self.ip, "Released connection slot");
    }
}

fn lock(live: &Mutex<LiveCounts>) -> MutexGuard<'_, LiveCounts> {
    live.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_rate_limiter_allows_up_to_limit() {
        let limiter = RateLimiter::new(3);
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));

        let _a = limiter.check(ip).unwrap();
        let _b = limiter.check(ip).unwrap();
        let _c = limiter.check(ip).unwrap();
        assert!(limiter.check(ip).is_none());
        assert_eq!(limiter.live_connections(ip), 3);
    }

    #[test]
    fn test_rate_limiter_different_ips() {
        let limiter = RateLimiter::new(1);
        let ip1 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let ip2 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        let _first = limiter.check(ip1).unwrap();
        let _second = limiter.check(ip2).unwrap();
        assert!(limiter.check(ip1).is_none());
        assert!(limiter.check(ip2).is_none());
    }

    #[test]
    fn test_rate_limiter_release_on_drop() {
        let limiter = RateLimiter::new(1);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        let admission = limiter.check(ip).unwrap();
        assert!(limiter.check(ip).is_none());
        drop(admission);
        assert_eq!(limiter.live_connections(ip), 0);
        assert!(limiter.check(ip).is_some());
    }

    #[test]
    fn test_closing_one_connection_frees_only_its_slot() {
        let limiter = RateLimiter::new(2);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

        let long_lived = limiter.check(ip).unwrap();
        let newer = limiter.check(ip).unwrap();
        drop(long_lived);

        // The newer connection is still open and still counted.
        assert_eq!(limiter.live_connections(ip), 1);
        let third = limiter.check(ip).unwrap();
        assert!(limiter.check(ip).is_none());

        drop(newer);
        drop(third);
        assert_eq!(limiter.live_connections(ip), 0);
    }

    #[test]
    fn test_admission_outliving_limiter() {
        let limiter = RateLimiter::new(1);
        let admission = limiter.check(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        drop(limiter);
        drop(admission);
    }

    #[test]
    fn test_zero_limit_rejects_without_leaking_entries() {
        let limiter = RateLimiter::new(0);
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        assert!(limiter.check(ip).is_none());
        assert!(lock(&limiter.live).is_empty());
    }
}
