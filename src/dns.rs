use dns_lookup::lookup_host;
use std::net::IpAddr;

use crate::config::AddressFamily;
use crate::error::PingError;

/// Resolved destination of a session. Fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingTarget {
    pub host: String,
    pub address: IpAddr,
    pub identifier: u16,
}

impl PingTarget {
    pub async fn resolve(host: &str, family: AddressFamily, identifier: u16) -> Result<Self, PingError> {
        let address = resolve_hostname(host, family).await?;
        Ok(Self {
            host: host.to_string(),
            address,
            identifier,
        })
    }

    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }
}

pub async fn resolve_hostname(hostname: &str, family: AddressFamily) -> Result<IpAddr, PingError> {
    let unresolved = || PingError::UnresolvedHost(hostname.to_string());

    // First try to parse as IP address
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return if family.accepts(&ip) {
            Ok(ip)
        } else {
            log::debug!("{} is not an {:?} address", ip, family);
            Err(unresolved())
        };
    }

    let addresses = tokio::task::spawn_blocking({
        let hostname = hostname.to_string();
        move || lookup_host(&hostname)
    })
    .await
    .map_err(|_| unresolved())?
    .map_err(|e| {
        log::debug!("DNS lookup for {} failed: {}", hostname, e);
        unresolved()
    })?;

    let filtered: Vec<IpAddr> = addresses.into_iter().filter(|addr| family.accepts(addr)).collect();

    // Prefer IPv4 unless IPv6 was asked for
    let preferred = match family {
        AddressFamily::V6 => filtered.first().copied(),
        _ => filtered
            .iter()
            .find(|addr| addr.is_ipv4())
            .copied()
            .or_else(|| filtered.first().copied()),
    };

    preferred.ok_or_else(unresolved)
}
