//! Connection admission.
//!
//! Rule evaluation lives outside this crate; the load balancer only asks a
//! yes/no question per accepted connection.

use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Decides whether a client may use a listening port.
pub trait SecurityPolicy: Send + Sync {
    fn allow(&self, protocol: Protocol, remote: IpAddr, port: u16) -> bool;
}

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl SecurityPolicy for AllowAll {
    fn allow(&self, _protocol: Protocol, _remote: IpAddr, _port: u16) -> bool {
        true
    }
}

impl<F> SecurityPolicy for F
where
    F: Fn(Protocol, IpAddr, u16) -> bool + Send + Sync,
{
    fn allow(&self, protocol: Protocol, remote: IpAddr, port: u16) -> bool {
        self(protocol, remote, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_closure_policy() {
        let policy: Arc<dyn SecurityPolicy> = Arc::new(|_: Protocol, ip: IpAddr, port: u16| {
            ip.is_loopback() && port != 22
        });
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(policy.allow(Protocol::Tcp, local, 80));
        assert!(!policy.allow(Protocol::Tcp, local, 22));
        assert!(!policy.allow(Protocol::Tcp, "10.0.0.1".parse().unwrap(), 80));
        assert!(AllowAll.allow(Protocol::Udp, "10.0.0.1".parse().unwrap(), 22));
    }
}
