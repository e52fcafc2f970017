//! Link protocol message assembly.
//!
//! A protocol message is one signalling header followed, for STATE
//! messages, by the sender's monitor domain record.

use super::header::{HeaderError, SignalHeader, SIGNAL_H_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

// Link management protocol message types.
pub const STATE_MSG: u8 = 0;
pub const RESET_MSG: u8 = 1;
pub const ACTIVATE_MSG: u8 = 2;

/// One link protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoMsg {
    pub header: SignalHeader,
    /// Domain record payload; empty for RESET/ACTIVATE messages.
    pub domain: Bytes,
}

impl ProtoMsg {
    pub fn msg_type(&self) -> u8 {
        self.header.msg_type()
    }

    pub fn command(&self) -> &'static str {
        match self.msg_type() {
            STATE_MSG => "state",
            RESET_MSG => "reset",
            ACTIVATE_MSG => "activate",
            _ => "unknown",
        }
    }

    /// Serialize header and payload to network byte order.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SIGNAL_H_SIZE + self.domain.len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.domain);
        buf.freeze()
    }

    /// Parse a bearer-delivered message, applying the consumer-side
    /// header checks (version, size consistency).
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        let header = SignalHeader::decode(buf)?;
        header.validate_against(buf.len())?;
        let offset = (header.hdr_size() as usize).max(SIGNAL_H_SIZE).min(buf.len());
        Ok(Self {
            header,
            domain: Bytes::copy_from_slice(&buf[offset..]),
        })
    }
}
