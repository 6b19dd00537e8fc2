//! IP address management
//!
//! Subnets are assigned per network ID, either from the caller's IPAM
//! configuration or from the `172.<n>.0.0/16` pool starting at `n = 18`.
//! Host numbers released by a disconnect are handed out again before the
//! per-network counter advances.

use crate::api::types::IpamConfig;
use crate::error::{Result, SockerlessError};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};

/// First second-octet used for auto-assigned subnets
const FIRST_AUTO_OCTET: u8 = 18;

/// First host number handed out (`.1` is the gateway)
const FIRST_HOST: u32 = 2;

/// Address assignment for one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAssignment {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub mac: String,
}

#[derive(Debug)]
struct SubnetState {
    network: Ipv4Addr,
    gateway: Ipv4Addr,
    mask: u8,
    next_host: u32,
    released: Vec<u32>,
}

impl SubnetState {
    fn host_number(&self, ip: Ipv4Addr) -> Option<u32> {
        let base = u32::from(self.network);
        let addr = u32::from(ip);
        let host_bits = 32 - u32::from(self.mask);
        let net_mask = if host_bits >= 32 { 0 } else { !0u32 << host_bits };
        if addr & net_mask != base & net_mask {
            return None;
        }
        Some(addr - base)
    }

    /// Host number of the broadcast address
    fn broadcast_host(&self) -> u32 {
        let host_bits = 32 - u32::from(self.mask);
        if host_bits >= 32 {
            u32::MAX
        } else {
            (1u32 << host_bits) - 1
        }
    }
}

#[derive(Debug)]
struct AllocatorState {
    subnets: HashMap<String, SubnetState>,
    next_octet: u8,
}

/// Per-network IP allocator
#[derive(Debug)]
pub struct IpAllocator {
    inner: Mutex<AllocatorState>,
}

impl Default for IpAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `a.b.c.d/len` into its address and prefix length
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, len) = match cidr.split_once('/') {
        Some((addr, len)) => (addr, len),
        None => (cidr, "16"),
    };
    let ip: Ipv4Addr = addr
        .parse()
        .map_err(|_| SockerlessError::InvalidParameter(format!("invalid subnet: {}", cidr)))?;
    let len: u8 = len
        .parse()
        .ok()
        .filter(|l| *l <= 32)
        .ok_or_else(|| SockerlessError::InvalidParameter(format!("invalid subnet: {}", cidr)))?;
    let host_bits = 32 - u32::from(len);
    let mask = if host_bits >= 32 { 0 } else { !0u32 << host_bits };
    Ok((Ipv4Addr::from(u32::from(ip) & mask), len))
}

/// Docker-style MAC derived from the last three IPv4 octets
pub fn mac_from_ip(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("02:42:ac:{:02x}:{:02x}:{:02x}", o[1], o[2], o[3])
}

impl IpAllocator {
    /// Create an allocator with no subnets
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AllocatorState {
                subnets: HashMap::new(),
                next_octet: FIRST_AUTO_OCTET,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AllocatorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign a subnet to a network.
    ///
    /// Honors `requested` when it names a subnet, otherwise takes the next
    /// `172.<n>.0.0/16` block. Returns the effective pool configuration.
    pub fn allocate_subnet(
        &self,
        network_id: &str,
        requested: Option<&IpamConfig>,
    ) -> Result<IpamConfig> {
        if let Some(req) = requested.filter(|r| !r.subnet.is_empty()) {
            let (network, mask) = parse_cidr(&req.subnet)?;
            let gateway = if req.gateway.is_empty() {
                Ipv4Addr::from(u32::from(network) + 1)
            } else {
                req.gateway.parse().map_err(|_| {
                    SockerlessError::InvalidParameter(format!("invalid gateway: {}", req.gateway))
                })?
            };
            self.lock().subnets.insert(
                network_id.to_string(),
                SubnetState {
                    network,
                    gateway,
                    mask,
                    next_host: FIRST_HOST,
                    released: Vec::new(),
                },
            );
            return Ok(IpamConfig {
                subnet: req.subnet.clone(),
                ip_range: req.ip_range.clone(),
                gateway: gateway.to_string(),
            });
        }

        let mut state = self.lock();
        let octet = state.next_octet;
        state.next_octet = state.next_octet.saturating_add(1);
        let network = Ipv4Addr::new(172, octet, 0, 0);
        let gateway = Ipv4Addr::new(172, octet, 0, 1);
        state.subnets.insert(
            network_id.to_string(),
            SubnetState {
                network,
                gateway,
                mask: 16,
                next_host: FIRST_HOST,
                released: Vec::new(),
            },
        );

        Ok(IpamConfig {
            subnet: format!("{}/16", network),
            ip_range: String::new(),
            gateway: gateway.to_string(),
        })
    }

    /// Allocate an address in a network's subnet.
    ///
    /// Unknown networks get the default bridge's first address. Fails once
    /// every host address below the broadcast address is taken.
    pub fn allocate_ip(&self, network_id: &str) -> Result<IpAssignment> {
        let mut state = self.lock();
        let Some(subnet) = state.subnets.get_mut(network_id) else {
            let ip = Ipv4Addr::new(172, 17, 0, 2);
            return Ok(IpAssignment {
                ip,
                prefix_len: 16,
                gateway: Ipv4Addr::new(172, 17, 0, 1),
                mac: mac_from_ip(ip),
            });
        };

        let exhausted =
            || SockerlessError::Server(format!("no available IPv4 addresses on network {}", network_id));
        let host = match subnet.released.pop() {
            Some(host) => host,
            None => {
                let host = subnet.next_host;
                if host >= subnet.broadcast_host() {
                    return Err(exhausted());
                }
                subnet.next_host += 1;
                host
            }
        };
        let ip = u32::from(subnet.network)
            .checked_add(host)
            .map(Ipv4Addr::from)
            .ok_or_else(exhausted)?;
        Ok(IpAssignment {
            ip,
            prefix_len: subnet.mask,
            gateway: subnet.gateway,
            mac: mac_from_ip(ip),
        })
    }

    /// Return an address to its network's pool
    pub fn release_ip(&self, network_id: &str, ip: &str) {
        let Ok(ip) = ip.parse::<Ipv4Addr>() else {
            return;
        };
        let mut state = self.lock();
        if let Some(subnet) = state.subnets.get_mut(network_id) {
            match subnet.host_number(ip) {
                Some(host) if host >= FIRST_HOST && !subnet.released.contains(&host) => {
                    subnet.released.push(host);
                }
                _ => {}
            }
        }
    }

    /// Forget a network's subnet
    pub fn release_subnet(&self, network_id: &str) {
        self.lock().subnets.remove(network_id);
    }

    /// Whether a subnet is tracked for the network
    pub fn has_subnet(&self, network_id: &str) -> bool {
        self.lock().subnets.contains_key(network_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_subnet_counter() {
        let alloc = IpAllocator::new();
        let a = alloc.allocate_subnet("n1", None).unwrap();
        let b = alloc.allocate_subnet("n2", None).unwrap();
        assert_eq!(a.subnet, "172.18.0.0/16");
        assert_eq!(a.gateway, "172.18.0.1");
        assert_eq!(b.subnet, "172.19.0.0/16");
    }

    #[test]
    fn test_requested_subnet_honored() {
        let alloc = IpAllocator::new();
        let req = IpamConfig {
            subnet: "10.5.0.0/24".to_string(),
            gateway: "10.5.0.1".to_string(),
            ..Default::default()
        };
        alloc.allocate_subnet("n", Some(&req)).unwrap();
        let a = alloc.allocate_ip("n").unwrap();
        assert_eq!(a.ip, Ipv4Addr::new(10, 5, 0, 2));
        assert_eq!(a.prefix_len, 24);
        assert_eq!(a.gateway, Ipv4Addr::new(10, 5, 0, 1));
    }

    #[test]
    fn test_released_host_reused_first() {
        let alloc = IpAllocator::new();
        alloc.allocate_subnet("n", None).unwrap();
        let x = alloc.allocate_ip("n").unwrap();
        let y = alloc.allocate_ip("n").unwrap();
        let z = alloc.allocate_ip("n").unwrap();
        assert_ne!(x.ip, y.ip);
        assert_ne!(y.ip, z.ip);

        alloc.release_ip("n", &y.ip.to_string());
        let w = alloc.allocate_ip("n").unwrap();
        assert_eq!(w.ip, y.ip);

        let next = alloc.allocate_ip("n").unwrap();
        assert_eq!(next.ip, Ipv4Addr::new(172, 18, 0, 5));
    }

    #[test]
    fn test_release_is_lifo() {
        let alloc = IpAllocator::new();
        alloc.allocate_subnet("n", None).unwrap();
        let a = alloc.allocate_ip("n").unwrap();
        let b = alloc.allocate_ip("n").unwrap();
        alloc.release_ip("n", &a.ip.to_string());
        alloc.release_ip("n", &b.ip.to_string());
        assert_eq!(alloc.allocate_ip("n").unwrap().ip, b.ip);
        assert_eq!(alloc.allocate_ip("n").unwrap().ip, a.ip);
    }

    #[test]
    fn test_double_release_does_not_duplicate() {
        let alloc = IpAllocator::new();
        alloc.allocate_subnet("n", None).unwrap();
        let a = alloc.allocate_ip("n").unwrap();
        alloc.release_ip("n", &a.ip.to_string());
        alloc.release_ip("n", &a.ip.to_string());
        let first = alloc.allocate_ip("n").unwrap();
        let second = alloc.allocate_ip("n").unwrap();
        assert_ne!(first.ip, second.ip);
    }

    #[test]
    fn test_small_subnet_exhausts() {
        let alloc = IpAllocator::new();
        let req = IpamConfig {
            subnet: "10.9.0.0/30".to_string(),
            ..Default::default()
        };
        alloc.allocate_subnet("tiny", Some(&req)).unwrap();
        let only = alloc.allocate_ip("tiny").unwrap();
        assert_eq!(only.ip, Ipv4Addr::new(10, 9, 0, 2));
        let err = alloc.allocate_ip("tiny").unwrap_err();
        assert_eq!(err.status_code(), 500);

        alloc.release_ip("tiny", "10.9.0.2");
        assert_eq!(alloc.allocate_ip("tiny").unwrap().ip, only.ip);
    }

    #[test]
    fn test_top_of_address_space_does_not_wrap() {
        let alloc = IpAllocator::new();
        let req = IpamConfig {
            subnet: "255.255.255.252/30".to_string(),
            gateway: "255.255.255.253".to_string(),
            ..Default::default()
        };
        alloc.allocate_subnet("edge", Some(&req)).unwrap();
        assert_eq!(alloc.allocate_ip("edge").unwrap().ip, Ipv4Addr::new(255, 255, 255, 254));
        assert!(alloc.allocate_ip("edge").is_err());
    }

    #[test]
    fn test_mac_from_ip() {
        assert_eq!(mac_from_ip(Ipv4Addr::new(172, 17, 0, 2)), "02:42:ac:11:00:02");
        assert_eq!(mac_from_ip(Ipv4Addr::new(172, 18, 1, 255)), "02:42:ac:12:01:ff");
    }

    #[test]
    fn test_parse_cidr_rejects_garbage() {
        assert!(parse_cidr("not-a-subnet").is_err());
        assert!(parse_cidr("10.0.0.0/40").is_err());
        assert_eq!(
            parse_cidr("10.1.2.3/8").unwrap(),
            (Ipv4Addr::new(10, 0, 0, 0), 8)
        );
    }
}
