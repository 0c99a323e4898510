pub mod edns;
pub mod enums;
pub mod header;
pub mod message;
pub mod question;
pub mod record;
pub mod wire;

pub use message::DnsMessage;
pub use question::Question;
pub use record::{RData, ResourceRecord};
