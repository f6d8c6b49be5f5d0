use anyhow::{Context, Result};
use ipnet::IpNet;
use std::net::IpAddr;

/// Parses the original client IP from an X-Forwarded-For header
/// Format: "client, proxy1, proxy2, ..." - returns the leftmost (original client) IP
#[must_use]
pub fn parse_original_client_ip(xff_header: &str) -> Option<IpAddr> {
    xff_header.split(',').next()?.trim().parse().ok()
}

/// Addresses of fronting proxies allowed to open tunnels.
///
/// Entries are individual IPs or CIDR subnets. Without a list every peer is
/// allowed.
#[derive(Clone, Debug, Default)]
pub struct ProxyAllowlist {
    nets: Option<Vec<IpNet>>,
}

impl ProxyAllowlist {
    pub fn parse(entries: Option<&[String]>) -> Result<Self> {
        let Some(entries) = entries else {
            return Ok(Self::default());
        };

        let nets = entries
            .iter()
            .map(|entry| {
                entry
                    .parse::<IpAddr>()
                    .map(IpNet::from)
                    .or_else(|_| entry.parse::<IpNet>())
                    .with_context(|| {
                        format!("Invalid IP address or CIDR in allowed_proxy_ips: {entry}")
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { nets: Some(nets) })
    }

    #[must_use]
    pub fn allows(&self, peer: IpAddr) -> bool {
        self.nets
            .as_ref()
            .is_none_or(|nets| nets.iter().any(|net| net.contains(&peer)))
    }
}
