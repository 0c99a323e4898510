use thiserror::Error;

/// Errors produced while reading or writing the DNS wire format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("invalid DNS header")]
    InvalidHeader,
    #[error("invalid DNS label")]
    InvalidLabel,
    #[error("invalid question section")]
    InvalidQuestion,
    #[error("invalid resource record")]
    InvalidRecord,
    #[error("packet truncated")]
    Truncated,
    #[error("bit stream error: {0}")]
    BitStream(String),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        WireError::BitStream(err.to_string())
    }
}

pub(crate) fn read_u8(buf: &[u8], offset: &mut usize) -> Result<u8, WireError> {
    let v = *buf.get(*offset).ok_or(WireError::Truncated)?;
    *offset += 1;
    Ok(v)
}

pub(crate) fn read_u16(buf: &[u8], offset: &mut usize) -> Result<u16, WireError> {
    if *offset + 2 > buf.len() {
        return Err(WireError::Truncated);
    }
    let v = u16::from_be_bytes([buf[*offset], buf[*offset + 1]]);
    *offset += 2;
    Ok(v)
}

pub(crate) fn read_u32(buf: &[u8], offset: &mut usize) -> Result<u32, WireError> {
    if *offset + 4 > buf.len() {
        return Err(WireError::Truncated);
    }
    let v = u32::from_be_bytes([
        buf[*offset],
        buf[*offset + 1],
        buf[*offset + 2],
        buf[*offset + 3],
    ]);
    *offset += 4;
    Ok(v)
}

/// Read a domain name starting at `offset`, following compression pointers.
///
/// Returns the dotted name (no trailing dot, root is the empty string) and
/// the offset of the first byte after the name as it appears in the stream.
pub fn read_name(buf: &[u8], start: usize) -> Result<(String, usize), WireError> {
    let mut labels: Vec<String> = Vec::new();
    let mut offset = start;
    let mut next_offset = None;
    let mut jumps = 0u8;

    loop {
        let len = *buf.get(offset).ok_or(WireError::Truncated)? as usize;

        if len & 0xC0 == 0xC0 {
            if offset + 1 >= buf.len() {
                return Err(WireError::Truncated);
            }
            jumps += 1;
            if jumps > 16 {
                return Err(WireError::InvalidLabel);
            }
            if next_offset.is_none() {
                next_offset = Some(offset + 2);
            }
            offset = (((len & 0x3F) << 8) | buf[offset + 1] as usize) & 0x3FFF;
            continue;
        }

        if len == 0 {
            return Ok((labels.join("."), next_offset.unwrap_or(offset + 1)));
        }
        if len > 63 {
            return Err(WireError::InvalidLabel);
        }

        let end = offset + 1 + len;
        if end > buf.len() {
            return Err(WireError::Truncated);
        }
        let label = String::from_utf8(buf[offset + 1..end].to_vec())
            .map_err(|_| WireError::InvalidLabel)?;
        labels.push(label);
        offset = end;
    }
}

/// Append a domain name in uncompressed wire form.
pub fn write_name(out: &mut Vec<u8>, name: &str) -> Result<(), WireError> {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            return Err(WireError::InvalidLabel);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrip() {
        let mut buf = Vec::new();
        write_name(&mut buf, "www.example.com").unwrap();
        let (name, next) = read_name(&buf, 0).unwrap();
        assert_eq!(name, "www.example.com");
        assert_eq!(next, buf.len());
    }

    #[test]
    fn root_name() {
        let mut buf = Vec::new();
        write_name(&mut buf, "").unwrap();
        assert_eq!(buf, vec![0]);
        let (name, next) = read_name(&buf, 0).unwrap();
        assert_eq!(name, "");
        assert_eq!(next, 1);
    }

    #[test]
    fn follows_compression_pointer() {
        // "example.com" at offset 0, then a pointer to it at offset 13.
        let mut buf = Vec::new();
        write_name(&mut buf, "example.com").unwrap();
        let pointer_at = buf.len();
        buf.extend_from_slice(&[0xC0, 0x00]);
        let (name, next) = read_name(&buf, pointer_at).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(next, pointer_at + 2);
    }

    #[test]
    fn rejects_pointer_loop() {
        let buf = vec![0xC0, 0x00];
        assert!(read_name(&buf, 0).is_err());
    }
}
