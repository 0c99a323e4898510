use serde::{Deserialize, Serialize};

use super::enums::{RecordClass, RecordType};
use super::wire::{self, WireError};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Dotted name without trailing dot; the root is the empty string.
    pub name: String,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl Question {
    pub fn new(name: impl Into<String>, qtype: RecordType) -> Self {
        Self {
            name: name.into(),
            qtype,
            qclass: RecordClass::IN,
        }
    }

    pub(crate) fn read(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        let (name, next) = wire::read_name(buf, *offset).map_err(|_| WireError::InvalidQuestion)?;
        *offset = next;
        let qtype = wire::read_u16(buf, offset)?.into();
        let qclass = wire::read_u16(buf, offset)?.into();
        Ok(Self { name, qtype, qclass })
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        wire::write_name(out, &self.name)?;
        out.extend_from_slice(&u16::from(self.qtype).to_be_bytes());
        out.extend_from_slice(&u16::from(self.qclass).to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_roundtrip() {
        let q = Question::new("blocked.example.org", RecordType::AAAA);
        let mut buf = Vec::new();
        q.write(&mut buf).unwrap();
        let mut offset = 0;
        let parsed = Question::read(&buf, &mut offset).unwrap();
        assert_eq!(parsed, q);
        assert_eq!(offset, buf.len());
    }
}
