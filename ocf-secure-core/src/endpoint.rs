//! Endpoint & socket abstraction (C3).
//!
//! `Endpoint` is a plain value type; equality is exactly the tuple named in
//! the data-model invariant, never a pointer comparison. `device_index` and
//! `peer_uuid` ride along for diagnostics and session-event payloads but are
//! excluded from equality/hash.

use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// A network endpoint: the wire-level identity of a TCP/UDP peer.
///
/// Equality and hashing cover exactly `(family, addr, port, scope, device)`
/// per the data model — comparing two endpoints never follows pointers and
/// never considers `peer_uuid`, which is resolved only after a handshake
/// completes and must not perturb session/peer identity.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub family: Family,
    pub secured: bool,
    pub tcp: bool,
    pub accepted: bool,
    pub addr: SocketAddr,
    pub scope: u32,
    pub device_index: u8,
    pub peer_uuid: Option<uuid::Uuid>,
}

impl Endpoint {
    pub fn new_tcp(family: Family, addr: SocketAddr, scope: u32, device_index: u8) -> Self {
        Self {
            family,
            secured: false,
            tcp: true,
            accepted: false,
            addr,
            scope,
            device_index,
            peer_uuid: None,
        }
    }

    pub fn new_udp(family: Family, addr: SocketAddr, scope: u32, device_index: u8) -> Self {
        Self {
            family,
            secured: true,
            tcp: false,
            accepted: false,
            addr,
            scope,
            device_index,
            peer_uuid: None,
        }
    }

    fn eq_key(&self) -> (bool, SocketAddr, u32, u8) {
        (matches!(self.family, Family::V6), self.addr, self.scope, self.device_index)
    }

    /// Builds the OS-facing `SocketAddr` for this endpoint. Total and
    /// infallible: the family/scope fields make the mapping unambiguous.
    pub fn to_sockaddr(&self) -> SocketAddr {
        self.addr
    }

    /// Converts a resolved socket address plus ingress flags into an
    /// `Endpoint`. Total and infallible.
    pub fn from_sockaddr(addr: SocketAddr, tcp: bool, secured: bool, device_index: u8) -> Self {
        let family = if addr.is_ipv6() { Family::V6 } else { Family::V4 };
        Self {
            family,
            secured,
            tcp,
            accepted: false,
            addr,
            scope: 0,
            device_index,
            peer_uuid: None,
        }
    }

    pub fn accepted(mut self) -> Self {
        self.accepted = true;
        self
    }

    pub fn with_peer_uuid(mut self, uuid: uuid::Uuid) -> Self {
        self.peer_uuid = Some(uuid);
        self
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.eq_key() == other.eq_key()
    }
}
impl Eq for Endpoint {}

impl std::hash::Hash for Endpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.eq_key().hash(state);
    }
}

/// Resolves the OS interface index for link-local addresses (`scope`).
///
/// The only OS-facing seam in this component: kept behind a trait so the
/// core's business logic stays testable without real network interfaces,
/// mirroring the way the TCP/TLS layer keeps socket creation behind a narrow
/// boundary rather than calling into `std::net` from deep inside the engine.
pub trait InterfaceResolver: Send + Sync {
    fn scope_id_for(&self, addr: &std::net::Ipv6Addr) -> Option<u32>;
}

/// An `InterfaceResolver` that never resolves a scope — correct for any
/// deployment that only ever binds global addresses.
pub struct NoInterfaces;

impl InterfaceResolver for NoInterfaces {
    fn scope_id_for(&self, _addr: &std::net::Ipv6Addr) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_peer_uuid_and_secured() {
        let a = Endpoint::new_tcp(Family::V4, "10.0.0.1:5683".parse().unwrap(), 0, 1);
        let b = a.with_peer_uuid(uuid::Uuid::new_v4());
        assert_eq!(a, b);
    }

    #[test]
    fn different_device_index_not_equal() {
        let a = Endpoint::new_tcp(Family::V4, "10.0.0.1:5683".parse().unwrap(), 0, 1);
        let b = Endpoint::new_tcp(Family::V4, "10.0.0.1:5683".parse().unwrap(), 0, 2);
        assert_ne!(a, b);
    }
}
