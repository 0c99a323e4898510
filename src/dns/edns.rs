use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// EDNS0 option code for Client Subnet (RFC 7871).
pub const OPTION_CLIENT_SUBNET: u16 = 8;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdnsOption {
    pub code: u16,
    pub data: Vec<u8>,
}

/// EDNS Client Subnet option payload (RFC 7871 §6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientSubnet {
    pub family: u16,
    pub source_prefix: u8,
    pub scope_prefix: u8,
    pub address: IpAddr,
}

impl ClientSubnet {
    /// Build an option for `ip` masked down to `prefix` bits.
    pub fn for_ip(ip: IpAddr, prefix: u8) -> Self {
        let (family, address) = match ip {
            IpAddr::V4(v4) => {
                let prefix = prefix.min(32);
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix as u32) };
                (1u16, IpAddr::V4((u32::from(v4) & mask).into()))
            }
            IpAddr::V6(v6) => {
                let prefix = prefix.min(128);
                let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix as u32) };
                (2u16, IpAddr::V6((u128::from(v6) & mask).into()))
            }
        };
        Self { family, source_prefix: prefix, scope_prefix: 0, address }
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        let family = u16::from_be_bytes([data[0], data[1]]);
        let source_prefix = data[2];
        let scope_prefix = data[3];
        let addr_bytes = &data[4..];
        let address = match family {
            1 => {
                let mut octets = [0u8; 4];
                if addr_bytes.len() > 4 {
                    return None;
                }
                octets[..addr_bytes.len()].copy_from_slice(addr_bytes);
                IpAddr::from(octets)
            }
            2 => {
                let mut octets = [0u8; 16];
                if addr_bytes.len() > 16 {
                    return None;
                }
                octets[..addr_bytes.len()].copy_from_slice(addr_bytes);
                IpAddr::from(octets)
            }
            _ => return None,
        };
        Some(Self { family, source_prefix, scope_prefix, address })
    }

    pub fn encode(&self) -> EdnsOption {
        let mut data = Vec::with_capacity(8);
        data.extend_from_slice(&self.family.to_be_bytes());
        data.push(self.source_prefix);
        data.push(self.scope_prefix);
        // Only the significant octets of the address are carried.
        let octet_count = self.source_prefix.div_ceil(8) as usize;
        match self.address {
            IpAddr::V4(v4) => data.extend_from_slice(&v4.octets()[..octet_count.min(4)]),
            IpAddr::V6(v6) => data.extend_from_slice(&v6.octets()[..octet_count.min(16)]),
        }
        EdnsOption { code: OPTION_CLIENT_SUBNET, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn subnet_masks_host_bits() {
        let ecs = ClientSubnet::for_ip("192.168.42.17".parse().unwrap(), 24);
        assert_eq!(ecs.address, IpAddr::V4(Ipv4Addr::new(192, 168, 42, 0)));
        assert_eq!(ecs.source_prefix, 24);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let ecs = ClientSubnet::for_ip("10.1.2.3".parse().unwrap(), 16);
        let decoded = ClientSubnet::decode(&ecs.encode().data).unwrap();
        assert_eq!(decoded.address, IpAddr::V4(Ipv4Addr::new(10, 1, 0, 0)));
        assert_eq!(decoded.source_prefix, 16);
        assert_eq!(decoded.family, 1);
    }
}
