use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use dashmap::DashMap;
use tracing::trace;

use blockfs_types::NodeAddress;

/// Process-wide cache of "is this address one of ours" answers.
///
/// Populated lazily and never evicted; interface assignments are stable for
/// the life of the process for our purposes, and a stale positive only costs
/// a failed short-circuit attempt that falls back to the network path.
fn cache() -> &'static DashMap<IpAddr, bool> {
    static CACHE: OnceLock<DashMap<IpAddr, bool>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// Whether `addr` points at the local host.
///
/// Loopback and unspecified addresses are local outright; anything else is
/// probed by binding an ephemeral UDP socket to the address, which only
/// succeeds for addresses assigned to a local interface. Resolution failures
/// count as non-local.
pub fn is_local_address(addr: &NodeAddress) -> bool {
    let ip = match (addr.host.as_str(), 0u16).to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(sa) => sa.ip(),
            None => return false,
        },
        Err(_) => return false,
    };

    if let Some(cached) = cache().get(&ip) {
        trace!(%addr, local = *cached, "locality cache hit");
        return *cached;
    }

    let local = ip.is_loopback()
        || ip.is_unspecified()
        || UdpSocket::bind(SocketAddr::new(ip, 0)).is_ok();
    trace!(%addr, local, "locality cache insert");
    cache().insert(ip, local);
    local
}
