//! Domain records transferred between peers.
//!
//! A domain record announces which ring successors the sender is
//! responsible for and which of them it currently considers up. On the
//! wire everything is network byte order:
//!
//! ```text
//! len (u16) | gen (u16) | ack_gen (u16) | member_cnt (u16) |
//! up_map (u64) | members[member_cnt] (u32 each)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest number of members a domain record may describe.
pub const MAX_MON_DOMAIN: usize = 64;

/// Size of the fixed part of a domain record on the wire.
pub const DOM_REC_BASE_LEN: usize = 16;

/// Actual length of a domain record for transport.
pub fn dom_rec_len(member_cnt: u16) -> usize {
    DOM_REC_BASE_LEN + member_cnt as usize * 4
}

/// Size of the own domain based on the number of peers: ⌈√n⌉, capped at
/// [`MAX_MON_DOMAIN`].
pub fn dom_size(peers: usize) -> usize {
    let mut i = 0;
    while i * i < peers {
        i += 1;
    }
    i.min(MAX_MON_DOMAIN)
}

/// Set bit `i` of an up-map.
pub fn map_set(up_map: &mut u64, i: usize, up: bool) {
    *up_map &= !(1u64 << i);
    *up_map |= (up as u64) << i;
}

/// Read bit `i` of an up-map.
pub fn map_get(up_map: u64, i: usize) -> bool {
    up_map & (1u64 << i) != 0
}

/// One domain record, fields in host order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainRecord {
    /// Advertised record length. Zero marks an intentionally invalid
    /// record (sent while the monitor is inactive).
    pub len: u16,
    /// Generation of the sender's domain.
    pub gen: u16,
    /// Most recent generation of the receiver's domain acked by the sender.
    pub ack_gen: u16,
    /// Bit i set: sender considers members[i] up.
    pub up_map: u64,
    /// Identities of the domain members, in ring order after the sender.
    pub members: Vec<u32>,
}

impl DomainRecord {
    pub fn member_cnt(&self) -> u16 {
        self.members.len() as u16
    }

    /// Serialize to network byte order. The `len` field is written as
    /// stored, which lets the monitor emit deliberately invalid records.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(dom_rec_len(self.member_cnt()));
        buf.put_u16(self.len);
        buf.put_u16(self.gen);
        buf.put_u16(self.ack_gen);
        buf.put_u16(self.member_cnt());
        buf.put_u64(self.up_map);
        for member in &self.members {
            buf.put_u32(*member);
        }
        buf.freeze()
    }

    /// Parse a record received from a peer, converting members to host
    /// order. Returns None on any inconsistency; the caller drops the
    /// record silently.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < DOM_REC_BASE_LEN {
            return None;
        }
        let mut buf = data;
        let len = buf.get_u16();
        let gen = buf.get_u16();
        let ack_gen = buf.get_u16();
        let member_cnt = buf.get_u16();
        let up_map = buf.get_u64();

        if member_cnt as usize > MAX_MON_DOMAIN {
            return None;
        }
        let rec_len = dom_rec_len(member_cnt);
        if data.len() != rec_len || len as usize != rec_len {
            return None;
        }
        let mut members = Vec::with_capacity(member_cnt as usize);
        for _ in 0..member_cnt {
            members.push(buf.get_u32());
        }
        Some(Self {
            len,
            gen,
            ack_gen,
            up_map,
            members,
        })
    }
}
