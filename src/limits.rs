//! Connection admission limits
//!
//! Two limits apply to every accepted socket: a server-wide cap on
//! concurrent sessions and a cap per remote address. Slots are held by RAII
//! guards, so a session releases them however it ends.
//!
//! A limit of 0 means unlimited.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::protocol::{codes, Reply};

type CountMap = Arc<Mutex<HashMap<IpAddr, usize>>>;

fn lock(map: &CountMap) -> MutexGuard<'_, HashMap<IpAddr, usize>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks active sessions per remote address
#[derive(Debug)]
pub struct ConnectionTracker {
    connections: CountMap,
    max_per_ip: usize,
}

impl ConnectionTracker {
    #[must_use]
    pub fn new(max_per_ip: usize) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            max_per_ip,
        }
    }

    /// Take a slot for `ip`, or `None` if it is at its limit
    pub fn try_acquire(&self, ip: IpAddr) -> Option<ConnectionGuard> {
        let ip = ip.to_canonical();
        let mut connections = lock(&self.connections);
        let count = connections.entry(ip).or_insert(0);

        if self.max_per_ip > 0 && *count >= self.max_per_ip {
            return None;
        }

        *count += 1;
        Some(ConnectionGuard {
            ip,
            connections: self.connections.clone(),
        })
    }

    pub fn count(&self, ip: IpAddr) -> usize {
        lock(&self.connections)
            .get(&ip.to_canonical())
            .copied()
            .unwrap_or(0)
    }
}

/// Releases a per-address slot when dropped
#[derive(Debug)]
pub struct ConnectionGuard {
    ip: IpAddr,
    connections: CountMap,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut connections = lock(&self.connections);
        if let Some(count) = connections.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(&self.ip);
            }
        }
    }
}

/// Why a connection was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    ServerFull,
    TooManyFromAddress,
}

impl Refusal {
    pub fn to_reply(self) -> Reply {
        let message = match self {
            Refusal::ServerFull => "Too many connections. Service temporarily unavailable.",
            Refusal::TooManyFromAddress => "Too many connections from the same IP address.",
        };
        Reply::new(codes::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refusal::ServerFull => write!(f, "server connection limit reached"),
            Refusal::TooManyFromAddress => write!(f, "per-address connection limit reached"),
        }
    }
}

/// Slots held by one admitted session
#[derive(Debug)]
pub struct Admission {
    _permit: Option<OwnedSemaphorePermit>,
    _guard: ConnectionGuard,
}

/// Global plus per-address admission control
#[derive(Debug)]
pub struct ConnectionLimits {
    global: Option<Arc<Semaphore>>,
    per_ip: ConnectionTracker,
}

impl ConnectionLimits {
    pub fn new(max_connections: usize, max_per_ip: usize) -> Self {
        Self {
            global: (max_connections > 0).then(|| Arc::new(Semaphore::new(max_connections))),
            per_ip: ConnectionTracker::new(max_per_ip),
        }
    }

    /// Admit a session from `ip` or say why not. Existing sessions are never
    /// affected by a refusal.
    pub fn admit(&self, ip: IpAddr) -> Result<Admission, Refusal> {
        let permit = match &self.global {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| Refusal::ServerFull)?,
            ),
            None => None,
        };

        let guard = self
            .per_ip
            .try_acquire(ip)
            .ok_or(Refusal::TooManyFromAddress)?;

        Ok(Admission {
            _permit: permit,
            _guard: guard,
        })
    }

    pub fn sessions_from(&self, ip: IpAddr) -> usize {
        self.per_ip.count(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn test_acquire_and_release() {
        let tracker = ConnectionTracker::new(2);

        let guard1 = tracker.try_acquire(ip(1));
        assert!(guard1.is_some());
        let _guard2 = tracker.try_acquire(ip(1)).unwrap();
        assert!(tracker.try_acquire(ip(1)).is_none());
        assert_eq!(tracker.count(ip(1)), 2);

        drop(guard1);
        assert_eq!(tracker.count(ip(1)), 1);
        assert!(tracker.try_acquire(ip(1)).is_some());
    }

    #[test]
    fn test_addresses_are_independent() {
        let tracker = ConnectionTracker::new(1);
        let _a = tracker.try_acquire(ip(1)).unwrap();
        let _b = tracker.try_acquire(ip(2)).unwrap();
        assert!(tracker.try_acquire(ip(1)).is_none());
    }

    #[test]
    fn test_mapped_address_counts_as_v4() {
        let tracker = ConnectionTracker::new(1);
        let _a = tracker.try_acquire("10.0.0.1".parse().unwrap()).unwrap();
        assert!(tracker.try_acquire("::ffff:10.0.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_entry_removed_at_zero() {
        let tracker = ConnectionTracker::new(2);
        drop(tracker.try_acquire(ip(3)).unwrap());
        assert!(lock(&tracker.connections).is_empty());
    }

    #[test]
    fn test_zero_means_unlimited() {
        let limits = ConnectionLimits::new(0, 0);
        let held: Vec<_> = (0..100).map(|_| limits.admit(ip(1)).unwrap()).collect();
        assert_eq!(limits.sessions_from(ip(1)), 100);
        drop(held);
        assert_eq!(limits.sessions_from(ip(1)), 0);
    }

    #[test]
    fn test_global_limit() {
        let limits = ConnectionLimits::new(2, 5);
        let _a = limits.admit(ip(1)).unwrap();
        let b = limits.admit(ip(2)).unwrap();
        assert_eq!(limits.admit(ip(3)).unwrap_err(), Refusal::ServerFull);

        drop(b);
        assert!(limits.admit(ip(3)).is_ok());
    }

    #[test]
    fn test_per_address_refusal_releases_global_permit() {
        let limits = ConnectionLimits::new(2, 1);
        let _a = limits.admit(ip(1)).unwrap();
        assert_eq!(limits.admit(ip(1)).unwrap_err(), Refusal::TooManyFromAddress);

        // The refused attempt must not keep holding a global slot
        let _b = limits.admit(ip(2)).unwrap();
    }

    #[test]
    fn test_refusal_replies() {
        assert_eq!(Refusal::ServerFull.to_reply().code, 421);
        assert_eq!(Refusal::TooManyFromAddress.to_reply().code, 421);
    }
}
