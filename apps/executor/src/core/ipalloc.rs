use std::collections::HashSet;
use std::net::Ipv4Addr;

use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Deterministic per-VM IPv4 assignment inside a configured subnet.
///
/// The VM id is hashed (SHA-256) and mapped modulo the usable host range;
/// the network address, broadcast address and gateway are never handed out.
/// Collisions probe forward linearly, so the same id always resolves to the
/// same address as long as no collision is recorded in between.
pub struct IpAllocator {
    network: u32,
    prefix: u32,
    gateway: u32,
    in_use: Mutex<HashSet<u32>>,
}

impl IpAllocator {
    pub fn new(subnet: &str, gateway: &str) -> Result<Self> {
        let (network, prefix) = parse_subnet(subnet)?;
        if prefix > 30 {
            bail!("subnet {subnet} has no usable host range");
        }
        let gateway: Ipv4Addr = gateway
            .parse()
            .with_context(|| format!("invalid gateway address {gateway}"))?;
        Ok(IpAllocator {
            network,
            prefix,
            gateway: u32::from(gateway),
            in_use: Mutex::new(HashSet::new()),
        })
    }

    /// Number of assignable host addresses (network, broadcast excluded).
    fn usable(&self) -> u32 {
        (1u32 << (32 - self.prefix)) - 2
    }

    fn broadcast(&self) -> u32 {
        self.network | ((1u32 << (32 - self.prefix)) - 1)
    }

    pub async fn allocate(&self, id: &str) -> Result<Ipv4Addr> {
        let range = self.usable();
        let start = (hash_id(id) % u64::from(range)) as u32;

        let mut in_use = self.in_use.lock().await;
        for offset in 0..range {
            let candidate = self.network + 1 + ((start + offset) % range);
            if candidate == self.gateway || candidate == self.broadcast() {
                continue;
            }
            if in_use.contains(&candidate) {
                continue;
            }
            in_use.insert(candidate);
            return Ok(Ipv4Addr::from(candidate));
        }
        Err(anyhow!("subnet exhausted, no free address for {id}"))
    }

    pub async fn release(&self, ip: Ipv4Addr) {
        self.in_use.lock().await.remove(&u32::from(ip));
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::MAX << (32 - self.prefix))
    }
}

fn hash_id(id: &str) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn parse_subnet(subnet: &str) -> Result<(u32, u32)> {
    let (addr, prefix) = subnet
        .split_once('/')
        .ok_or_else(|| anyhow!("subnet {subnet} is not in CIDR form"))?;
    let addr: Ipv4Addr = addr
        .parse()
        .with_context(|| format!("invalid subnet address in {subnet}"))?;
    let prefix: u32 = prefix
        .parse()
        .with_context(|| format!("invalid prefix length in {subnet}"))?;
    if prefix == 0 || prefix > 32 {
        bail!("prefix length out of range in {subnet}");
    }
    let mask = u32::MAX << (32 - prefix);
    Ok((u32::from(addr) & mask, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> IpAllocator {
        IpAllocator::new("192.168.127.0/24", "192.168.127.1").unwrap()
    }

    #[tokio::test]
    async fn same_id_is_deterministic_across_release() {
        let alloc = allocator();
        let first = alloc.allocate("vm-test").await.unwrap();
        alloc.release(first).await;
        let second = alloc.allocate("vm-test").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn different_ids_get_distinct_valid_addresses() {
        let alloc = allocator();
        let a = alloc.allocate("vm-test").await.unwrap();
        let b = alloc.allocate("vm-other").await.unwrap();
        assert_ne!(a, b);
        for ip in [a, b] {
            let raw = u32::from(ip);
            assert_eq!(raw & 0xffffff00, u32::from(Ipv4Addr::new(192, 168, 127, 0)));
            assert_ne!(ip, Ipv4Addr::new(192, 168, 127, 0));
            assert_ne!(ip, Ipv4Addr::new(192, 168, 127, 1));
            assert_ne!(ip, Ipv4Addr::new(192, 168, 127, 255));
        }
    }

    #[tokio::test]
    async fn collisions_probe_forward() {
        let alloc = allocator();
        let first = alloc.allocate("vm-test").await.unwrap();
        // Without a release the same id must move on to the next free slot.
        let probed = alloc.allocate("vm-test").await.unwrap();
        assert_ne!(first, probed);
    }

    #[tokio::test]
    async fn exhaustion_is_an_error() {
        let alloc = IpAllocator::new("10.0.0.0/30", "10.0.0.1").unwrap();
        // /30 leaves two hosts, one of which is the gateway.
        alloc.allocate("a").await.unwrap();
        assert!(alloc.allocate("b").await.is_err());
    }

    #[test]
    fn parses_and_masks_subnet() {
        let (net, prefix) = parse_subnet("10.1.2.77/24").unwrap();
        assert_eq!(net, u32::from(Ipv4Addr::new(10, 1, 2, 0)));
        assert_eq!(prefix, 24);
        assert!(parse_subnet("10.1.2.0").is_err());
        assert!(parse_subnet("10.1.2.0/40").is_err());
    }

    #[test]
    fn netmask_matches_prefix() {
        assert_eq!(allocator().netmask(), Ipv4Addr::new(255, 255, 255, 0));
    }
}
