//! Listener allocation in a configured port range, derivation of the
//! advertised proxy address, and seed list helpers.

use std::collections::HashSet;
use std::net::{TcpListener, ToSocketAddrs, UdpSocket};
use tracing::{error, warn};

use crate::error::{ReplicaError, Result};

const HOME: &str = "127.0.0.1";

/// Binds the first free port in `[port_start, port_end]` on `listen_addr`.
///
/// A `port_start` of zero requests a single OS-assigned ephemeral port. The
/// listener is returned in nonblocking mode, ready for tokio registration.
pub fn new_listener(listen_addr: &str, port_start: u16, port_end: u16) -> Result<TcpListener> {
    if port_start == 0 {
        let listener = TcpListener::bind((listen_addr, 0))?;
        listener.set_nonblocking(true)?;
        return Ok(listener);
    }
    for port in port_start..=port_end {
        if let Ok(listener) = TcpListener::bind((listen_addr, port)) {
            listener.set_nonblocking(true)?;
            return Ok(listener);
        }
    }
    Err(ReplicaError::NoFreePortInRange {
        start: port_start,
        end: port_end,
    })
}

/// The `host:port` clients should dial for this listener.
pub fn proxy_addr(listener: &TcpListener) -> Result<String> {
    let port = listener.local_addr()?.port();
    Ok(format!("{}:{}", proxy_hostname(), port))
}

/// Returns the machine hostname iff it resolves to an address of this host,
/// so the advertised proxy address is reachable by co-located clients.
/// Falls back to `127.0.0.1` otherwise.
pub fn proxy_hostname() -> String {
    let hostname = match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(err) => {
            error!(error = %err, "could not read hostname");
            return HOME.to_string();
        }
    };

    let resolved: Vec<String> = match (hostname.as_str(), 0u16).to_socket_addrs() {
        Ok(addrs) => addrs.map(|sa| sa.ip().to_string()).collect(),
        Err(err) => {
            error!(%hostname, error = %err, "could not resolve hostname");
            return HOME.to_string();
        }
    };

    for interface_addr in local_interface_addrs() {
        for hostname_addr in &resolved {
            // exact match, or a match ignoring a /N suffix on the interface
            if interface_addr == *hostname_addr
                || interface_addr.starts_with(&format!("{hostname_addr}/"))
            {
                return hostname;
            }
        }
    }
    warn!(%hostname, "hostname doesn't resolve to the current host");
    HOME.to_string()
}

// The loopback address plus whatever address routes outward. std cannot
// enumerate interfaces, and a connected UDP socket reveals the interface
// address without sending a packet.
fn local_interface_addrs() -> Vec<String> {
    let mut addrs = vec![HOME.to_string()];
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("198.51.100.1:53").is_ok() {
            if let Ok(local) = socket.local_addr() {
                addrs.push(local.ip().to_string());
            }
        }
    }
    addrs
}

/// Removes duplicates, keeping first occurrences in order.
pub fn uniq(set: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(set.len());
    set.into_iter().filter(|s| seen.insert(s.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_listener_zero_zero_random_port() {
        let listener = new_listener("127.0.0.1", 0, 0).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_new_listener_scans_range() {
        // Occupy a port, then ask for a range starting at it; the allocator
        // must move past the taken port.
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let start = taken.local_addr().unwrap().port();
        let listener = new_listener("127.0.0.1", start, start.saturating_add(20)).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), start);
    }

    #[test]
    fn test_new_listener_error() {
        // Hold the only port in the range. Privileged environments can bind
        // port 1; unprivileged ones fail to, and the range is exhausted
        // either way.
        let _taken = TcpListener::bind(("127.0.0.1", 1)).ok();
        let err = new_listener("127.0.0.1", 1, 1).unwrap_err();
        assert_eq!(err.to_string(), "could not find a free port in range 1-1");
    }

    #[test]
    fn test_uniq_removes_duplicates_keeps_order() {
        let deduped = uniq(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
            "c".to_string(),
            "b".to_string(),
        ]);
        assert_eq!(deduped, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_uniq_keeps_every_original_exactly_once() {
        let seeds = vec!["s1:1".to_string(), "s2:1".to_string()];
        let discovered = vec!["s2:1".to_string(), "s3:1".to_string()];
        let joined = uniq([seeds.clone(), discovered].concat());
        for seed in &seeds {
            assert_eq!(joined.iter().filter(|a| *a == seed).count(), 1);
        }
        assert_eq!(joined, vec!["s1:1", "s2:1", "s3:1"]);
    }

    #[test]
    fn test_proxy_addr_carries_listener_port() {
        let listener = new_listener("127.0.0.1", 0, 0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr = proxy_addr(&listener).unwrap();
        assert!(addr.ends_with(&format!(":{port}")));
    }
}
