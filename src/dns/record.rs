use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use super::edns::EdnsOption;
use super::enums::{RecordClass, RecordType};
use super::wire::{self, WireError};

/// Typed RDATA for the record types the proxy inspects or synthesises.
/// Anything else is carried opaquely and re-emitted byte for byte.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Ns(String),
    Ptr(String),
    Mx { preference: u16, exchange: String },
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Txt(Vec<String>),
    Opt(Vec<EdnsOption>),
    Raw(Vec<u8>),
}

impl RData {
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            RData::A(ip) => Some(IpAddr::V4(*ip)),
            RData::Aaaa(ip) => Some(IpAddr::V6(*ip)),
            _ => None,
        }
    }

    /// The target name for name-valued RDATA (CNAME chains and friends).
    pub fn target(&self) -> Option<&str> {
        match self {
            RData::Cname(n) | RData::Ns(n) | RData::Ptr(n) => Some(n),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: RecordType,
    pub class: RecordClass,
    pub ttl: u32,
    pub rdata: RData,
}

impl ResourceRecord {
    pub fn a(name: impl Into<String>, ttl: u32, ip: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            rtype: RecordType::A,
            class: RecordClass::IN,
            ttl,
            rdata: RData::A(ip),
        }
    }

    pub fn aaaa(name: impl Into<String>, ttl: u32, ip: Ipv6Addr) -> Self {
        Self {
            name: name.into(),
            rtype: RecordType::AAAA,
            class: RecordClass::IN,
            ttl,
            rdata: RData::Aaaa(ip),
        }
    }

    pub fn from_ip(name: impl Into<String>, ttl: u32, ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::a(name, ttl, v4),
            IpAddr::V6(v6) => Self::aaaa(name, ttl, v6),
        }
    }

    pub fn cname(name: impl Into<String>, ttl: u32, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rtype: RecordType::CNAME,
            class: RecordClass::IN,
            ttl,
            rdata: RData::Cname(target.into()),
        }
    }

    pub fn ptr(name: impl Into<String>, ttl: u32, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rtype: RecordType::PTR,
            class: RecordClass::IN,
            ttl,
            rdata: RData::Ptr(target.into()),
        }
    }

    pub(crate) fn read(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        let (name, next) = wire::read_name(buf, *offset).map_err(|_| WireError::InvalidRecord)?;
        *offset = next;
        let rtype: RecordType = wire::read_u16(buf, offset)?.into();
        let class: RecordClass = wire::read_u16(buf, offset)?.into();
        let ttl = wire::read_u32(buf, offset)?;
        let rdlength = wire::read_u16(buf, offset)? as usize;
        let rdata_start = *offset;
        let rdata_end = rdata_start + rdlength;
        if rdata_end > buf.len() {
            return Err(WireError::Truncated);
        }
        *offset = rdata_end;

        let rdata = Self::read_rdata(buf, rdata_start, rdata_end, rtype)?;
        Ok(Self { name, rtype, class, ttl, rdata })
    }

    fn read_rdata(
        buf: &[u8],
        start: usize,
        end: usize,
        rtype: RecordType,
    ) -> Result<RData, WireError> {
        let raw = &buf[start..end];
        let rdata = match rtype {
            RecordType::A if raw.len() == 4 => {
                RData::A(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
            }
            RecordType::AAAA if raw.len() == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(raw);
                RData::Aaaa(Ipv6Addr::from(octets))
            }
            RecordType::CNAME => RData::Cname(wire::read_name(buf, start)?.0),
            RecordType::NS => RData::Ns(wire::read_name(buf, start)?.0),
            RecordType::PTR => RData::Ptr(wire::read_name(buf, start)?.0),
            RecordType::MX => {
                let mut pos = start;
                let preference = wire::read_u16(buf, &mut pos)?;
                let exchange = wire::read_name(buf, pos)?.0;
                RData::Mx { preference, exchange }
            }
            RecordType::SOA => {
                let (mname, pos) = wire::read_name(buf, start)?;
                let (rname, mut pos) = wire::read_name(buf, pos)?;
                let serial = wire::read_u32(buf, &mut pos)?;
                let refresh = wire::read_u32(buf, &mut pos)?;
                let retry = wire::read_u32(buf, &mut pos)?;
                let expire = wire::read_u32(buf, &mut pos)?;
                let minimum = wire::read_u32(buf, &mut pos)?;
                RData::Soa { mname, rname, serial, refresh, retry, expire, minimum }
            }
            RecordType::TXT => {
                let mut strings = Vec::new();
                let mut pos = start;
                while pos < end {
                    let len = wire::read_u8(buf, &mut pos)? as usize;
                    if pos + len > end {
                        return Err(WireError::InvalidRecord);
                    }
                    strings.push(String::from_utf8_lossy(&buf[pos..pos + len]).into_owned());
                    pos += len;
                }
                RData::Txt(strings)
            }
            RecordType::OPT => {
                let mut options = Vec::new();
                let mut pos = start;
                while pos < end {
                    let code = wire::read_u16(buf, &mut pos)?;
                    let len = wire::read_u16(buf, &mut pos)? as usize;
                    if pos + len > end {
                        return Err(WireError::InvalidRecord);
                    }
                    options.push(EdnsOption { code, data: buf[pos..pos + len].to_vec() });
                    pos += len;
                }
                RData::Opt(options)
            }
            _ => RData::Raw(raw.to_vec()),
        };
        Ok(rdata)
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        wire::write_name(out, &self.name)?;
        out.extend_from_slice(&u16::from(self.rtype).to_be_bytes());
        out.extend_from_slice(&u16::from(self.class).to_be_bytes());
        out.extend_from_slice(&self.ttl.to_be_bytes());

        let mut rdata = Vec::new();
        match &self.rdata {
            RData::A(ip) => rdata.extend_from_slice(&ip.octets()),
            RData::Aaaa(ip) => rdata.extend_from_slice(&ip.octets()),
            RData::Cname(n) | RData::Ns(n) | RData::Ptr(n) => wire::write_name(&mut rdata, n)?,
            RData::Mx { preference, exchange } => {
                rdata.extend_from_slice(&preference.to_be_bytes());
                wire::write_name(&mut rdata, exchange)?;
            }
            RData::Soa { mname, rname, serial, refresh, retry, expire, minimum } => {
                wire::write_name(&mut rdata, mname)?;
                wire::write_name(&mut rdata, rname)?;
                for v in [serial, refresh, retry, expire, minimum] {
                    rdata.extend_from_slice(&v.to_be_bytes());
                }
            }
            RData::Txt(strings) => {
                for s in strings {
                    let bytes = s.as_bytes();
                    if bytes.len() > 255 {
                        return Err(WireError::InvalidRecord);
                    }
                    rdata.push(bytes.len() as u8);
                    rdata.extend_from_slice(bytes);
                }
            }
            RData::Opt(options) => {
                for option in options {
                    rdata.extend_from_slice(&option.code.to_be_bytes());
                    rdata.extend_from_slice(&(option.data.len() as u16).to_be_bytes());
                    rdata.extend_from_slice(&option.data);
                }
            }
            RData::Raw(raw) => rdata.extend_from_slice(raw),
        }

        if rdata.len() > u16::MAX as usize {
            return Err(WireError::InvalidRecord);
        }
        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(rr: ResourceRecord) {
        let mut buf = Vec::new();
        rr.write(&mut buf).unwrap();
        let mut offset = 0;
        let parsed = ResourceRecord::read(&buf, &mut offset).unwrap();
        assert_eq!(parsed, rr);
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn a_record_roundtrip() {
        roundtrip(ResourceRecord::a("one.example.com", 300, Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn aaaa_record_roundtrip() {
        roundtrip(ResourceRecord::aaaa("six.example.com", 60, "2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn cname_record_roundtrip() {
        roundtrip(ResourceRecord::cname("alias.example.com", 120, "canonical.example.com"));
    }

    #[test]
    fn soa_record_roundtrip() {
        roundtrip(ResourceRecord {
            name: "example.com".into(),
            rtype: RecordType::SOA,
            class: RecordClass::IN,
            ttl: 3600,
            rdata: RData::Soa {
                mname: "ns1.example.com".into(),
                rname: "hostmaster.example.com".into(),
                serial: 2024010101,
                refresh: 7200,
                retry: 3600,
                expire: 1209600,
                minimum: 300,
            },
        });
    }

    #[test]
    fn txt_record_roundtrip() {
        roundtrip(ResourceRecord {
            name: "txt.example.com".into(),
            rtype: RecordType::TXT,
            class: RecordClass::IN,
            ttl: 60,
            rdata: RData::Txt(vec!["v=spf1 -all".into()]),
        });
    }

    #[test]
    fn compressed_cname_target_is_decoded() {
        // Hand-build a record whose CNAME target is a pointer to offset 0.
        let mut buf = Vec::new();
        wire::write_name(&mut buf, "target.example.com").unwrap();
        let record_start = buf.len();
        wire::write_name(&mut buf, "alias.example.com").unwrap();
        buf.extend_from_slice(&5u16.to_be_bytes()); // CNAME
        buf.extend_from_slice(&1u16.to_be_bytes()); // IN
        buf.extend_from_slice(&60u32.to_be_bytes());
        buf.extend_from_slice(&2u16.to_be_bytes()); // rdlength
        buf.extend_from_slice(&[0xC0, 0x00]);

        let mut offset = record_start;
        let parsed = ResourceRecord::read(&buf, &mut offset).unwrap();
        assert_eq!(parsed.rdata, RData::Cname("target.example.com".into()));
    }
}
