use std::net::IpAddr;

use systemstat::{Platform, System};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Sets up the fmt subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Pick an IPv4 address other hosts can reach us on.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses. The first routable address is
/// returned, or `None` if the host has none.
pub fn select_host_address() -> Option<IpAddr> {
    let system = System::new();
    let networks = match system.networks() {
        Ok(networks) => networks,
        Err(e) => {
            warn!("Cannot list network interfaces: {:?}", e);
            return None;
        }
    };

    for net in networks.values() {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                    return Some(IpAddr::V4(v));
                }
            }
        }
    }

    None
}

/// `user@host` canonical name, falling back to `localhost` when no routable
/// address is found.
pub fn default_cname(user: &str) -> String {
    match select_host_address() {
        Some(addr) => format!("{user}@{addr}"),
        None => format!("{user}@localhost"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cname() {
        let cname = default_cname("rover");
        let (user, host) = cname.split_once('@').unwrap();
        assert_eq!(user, "rover");
        assert!(host == "localhost" || host.parse::<IpAddr>().is_ok());
    }
}
