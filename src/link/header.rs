//! Fixed-format link signalling header.
//!
//! The header is ten 32-bit words, big-endian on the wire. Word 0 and the
//! low half of word 5 are bit-packed; everything else is a plain 16- or
//! 32-bit field. The codec is pure: encode and decode move bytes and
//! enforce widths only. Semantic checks (version, size consistency against
//! the bearer-delivered length) live in [`SignalHeader::validate_against`]
//! and are the receiving link's responsibility.

use thiserror::Error;

/// Wire format version carried in every header.
pub const TIPC_VERSION: u8 = 2;

/// Serialized size of the signalling header.
pub const SIGNAL_H_SIZE: usize = 40;

/// Largest user payload a message may carry.
pub const TIPC_MAX_USER_MSG_SIZE: u32 = 66_000;

// Nominal header sizes carried in the header-size field (bytes).
pub const SHORT_H_SIZE: u16 = 24; // in-cluster basic payload message
pub const BASIC_H_SIZE: u16 = 32; // basic payload message
pub const NAMED_H_SIZE: u16 = 40; // named payload message
pub const MCAST_H_SIZE: u16 = 44; // multicast payload message
pub const GROUP_H_SIZE: u16 = 44; // group payload message
pub const INT_H_SIZE: u16 = 40; // internal messages
pub const MIN_H_SIZE: u16 = 24; // smallest legal TIPC header size
pub const MAX_H_SIZE: u16 = 60; // largest possible TIPC header size

pub const MAX_MSG_SIZE: u32 = MAX_H_SIZE as u32 + TIPC_MAX_USER_MSG_SIZE;
pub const FB_MTU: u16 = 3744;

// Internal message users.
pub const BCAST_PROTOCOL: u8 = 5;
pub const MSG_BUNDLER: u8 = 6;
pub const LINK_PROTOCOL: u8 = 7;
pub const CONN_MANAGER: u8 = 8;
pub const GROUP_PROTOCOL: u8 = 9;
pub const TUNNEL_PROTOCOL: u8 = 10;
pub const NAME_DISTRIBUTOR: u8 = 11;
pub const MSG_FRAGMENTER: u8 = 12;
pub const LINK_CONFIG: u8 = 13;

/// Header rejection reasons. All variants fall under the "malformed
/// header" taxonomy: the message is dropped and the sender is not told.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("truncated header: {0} bytes, need {SIGNAL_H_SIZE}")]
    Truncated(usize),
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("illegal header size {0}")]
    BadHeaderSize(u16),
    #[error("header size {hdr} / packet size {pkt} disagree with delivered length {delivered}")]
    LengthMismatch { hdr: u16, pkt: u16, delivered: usize },
}

fn get_bits(word: u32, pos: u32, mask: u32) -> u32 {
    (word >> pos) & mask
}

fn set_bits(word: &mut u32, pos: u32, mask: u32, value: u32) {
    *word &= !(mask << pos);
    *word |= (value & mask) << pos;
}

/// One signalling header.
///
/// Stored as the ten raw words so that encode/decode are straight
/// big-endian moves; field access goes through bit accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalHeader {
    words: [u32; 10],
}

impl SignalHeader {
    /// New header for the given user, stamped with the current protocol
    /// version and nominal header size.
    pub fn new(user: u8, hdr_size: u16, pkt_size: u16) -> Self {
        let mut hdr = Self::default();
        hdr.set_version(TIPC_VERSION);
        hdr.set_user(user);
        hdr.set_hdr_size(hdr_size);
        hdr.set_pkt_size(pkt_size);
        hdr
    }

    // --- word 0: vers | msg usr | hdr sz | n | resv | packet size ---

    pub fn version(&self) -> u8 {
        get_bits(self.words[0], 29, 0x7) as u8
    }

    pub fn set_version(&mut self, v: u8) {
        set_bits(&mut self.words[0], 29, 0x7, v as u32);
    }

    pub fn user(&self) -> u8 {
        get_bits(self.words[0], 24, 0x1f) as u8
    }

    pub fn set_user(&mut self, user: u8) {
        set_bits(&mut self.words[0], 24, 0x1f, user as u32);
    }

    /// Nominal header size in bytes. Stored in 4-byte units on the wire.
    pub fn hdr_size(&self) -> u16 {
        (get_bits(self.words[0], 20, 0xf) << 2) as u16
    }

    pub fn set_hdr_size(&mut self, bytes: u16) {
        set_bits(&mut self.words[0], 20, 0xf, (bytes >> 2) as u32);
    }

    pub fn non_seq(&self) -> bool {
        get_bits(self.words[0], 19, 0x1) != 0
    }

    pub fn set_non_seq(&mut self, on: bool) {
        set_bits(&mut self.words[0], 19, 0x1, on as u32);
    }

    /// Total message size in bytes, header included.
    pub fn pkt_size(&self) -> u16 {
        get_bits(self.words[0], 0, 0xffff) as u16
    }

    pub fn set_pkt_size(&mut self, bytes: u16) {
        set_bits(&mut self.words[0], 0, 0xffff, bytes as u32);
    }

    // --- word 1: m typ | sequence gap | broadcast ack no ---

    pub fn msg_type(&self) -> u8 {
        get_bits(self.words[1], 28, 0xf) as u8
    }

    pub fn set_msg_type(&mut self, mtyp: u8) {
        set_bits(&mut self.words[1], 28, 0xf, mtyp as u32);
    }

    pub fn seq_gap(&self) -> u16 {
        get_bits(self.words[1], 16, 0xfff) as u16
    }

    pub fn set_seq_gap(&mut self, gap: u16) {
        set_bits(&mut self.words[1], 16, 0xfff, gap as u32);
    }

    pub fn bcast_ack(&self) -> u16 {
        get_bits(self.words[1], 0, 0xffff) as u16
    }

    pub fn set_bcast_ack(&mut self, ack: u16) {
        set_bits(&mut self.words[1], 0, 0xffff, ack as u32);
    }

    // --- word 2: link level ack no | link level seq no ---

    pub fn link_ack(&self) -> u16 {
        get_bits(self.words[2], 16, 0xffff) as u16
    }

    pub fn set_link_ack(&mut self, ack: u16) {
        set_bits(&mut self.words[2], 16, 0xffff, ack as u32);
    }

    pub fn link_seq(&self) -> u16 {
        get_bits(self.words[2], 0, 0xffff) as u16
    }

    pub fn set_link_seq(&mut self, seq: u16) {
        set_bits(&mut self.words[2], 0, 0xffff, seq as u32);
    }

    // --- word 3: previous node ---

    pub fn prev_node(&self) -> u32 {
        self.words[3]
    }

    pub fn set_prev_node(&mut self, addr: u32) {
        self.words[3] = addr;
    }

    // --- word 4: last sent broadcast/fragm no | next sent pkt/fragm msg no ---

    pub fn last_bc_no(&self) -> u16 {
        get_bits(self.words[4], 16, 0xffff) as u16
    }

    pub fn set_last_bc_no(&mut self, no: u16) {
        set_bits(&mut self.words[4], 16, 0xffff, no as u32);
    }

    pub fn next_sent_no(&self) -> u16 {
        get_bits(self.words[4], 0, 0xffff) as u16
    }

    pub fn set_next_sent_no(&mut self, no: u16) {
        set_bits(&mut self.words[4], 0, 0xffff, no as u32);
    }

    // --- word 5: session no | res | r | berid | link prio | netpl | p ---

    pub fn session(&self) -> u16 {
        get_bits(self.words[5], 16, 0xffff) as u16
    }

    pub fn set_session(&mut self, session: u16) {
        set_bits(&mut self.words[5], 16, 0xffff, session as u32);
    }

    pub fn redundant_link(&self) -> bool {
        get_bits(self.words[5], 12, 0x1) != 0
    }

    pub fn set_redundant_link(&mut self, on: bool) {
        set_bits(&mut self.words[5], 12, 0x1, on as u32);
    }

    pub fn bearer_id(&self) -> u8 {
        get_bits(self.words[5], 9, 0x7) as u8
    }

    pub fn set_bearer_id(&mut self, id: u8) {
        set_bits(&mut self.words[5], 9, 0x7, id as u32);
    }

    pub fn link_prio(&self) -> u8 {
        get_bits(self.words[5], 4, 0x1f) as u8
    }

    pub fn set_link_prio(&mut self, prio: u8) {
        set_bits(&mut self.words[5], 4, 0x1f, prio as u32);
    }

    /// Network plane, 'A' through 'H'.
    pub fn net_plane(&self) -> char {
        (b'A' + get_bits(self.words[5], 1, 0x7) as u8) as char
    }

    pub fn set_net_plane(&mut self, plane: char) {
        let idx = (plane as u32).saturating_sub('A' as u32);
        set_bits(&mut self.words[5], 1, 0x7, idx);
    }

    pub fn probe(&self) -> bool {
        get_bits(self.words[5], 0, 0x1) != 0
    }

    pub fn set_probe(&mut self, on: bool) {
        set_bits(&mut self.words[5], 0, 0x1, on as u32);
    }

    // --- words 6..8: originating node, destination node, transport seqno ---

    pub fn orig_node(&self) -> u32 {
        self.words[6]
    }

    pub fn set_orig_node(&mut self, addr: u32) {
        self.words[6] = addr;
    }

    pub fn dest_node(&self) -> u32 {
        self.words[7]
    }

    pub fn set_dest_node(&mut self, addr: u32) {
        self.words[7] = addr;
    }

    pub fn trans_seqno(&self) -> u32 {
        self.words[8]
    }

    pub fn set_trans_seqno(&mut self, seqno: u32) {
        self.words[8] = seqno;
    }

    // --- word 9: msg count / max packet | link tolerance ---

    pub fn max_pkt(&self) -> u16 {
        get_bits(self.words[9], 16, 0xffff) as u16
    }

    pub fn set_max_pkt(&mut self, max_pkt: u16) {
        set_bits(&mut self.words[9], 16, 0xffff, max_pkt as u32);
    }

    /// Link tolerance in milliseconds.
    pub fn link_tolerance(&self) -> u16 {
        get_bits(self.words[9], 0, 0xffff) as u16
    }

    pub fn set_link_tolerance(&mut self, tol_ms: u16) {
        set_bits(&mut self.words[9], 0, 0xffff, tol_ms as u32);
    }

    // --- codec ---

    /// Serialize to network byte order.
    pub fn encode(&self) -> [u8; SIGNAL_H_SIZE] {
        let mut buf = [0u8; SIGNAL_H_SIZE];
        for (i, word) in self.words.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        buf
    }

    /// Deserialize from network byte order. Fails when fewer than
    /// [`SIGNAL_H_SIZE`] bytes are available; extra bytes are payload and
    /// are left untouched.
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < SIGNAL_H_SIZE {
            return Err(HeaderError::Truncated(buf.len()));
        }
        let mut words = [0u32; 10];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_be_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        }
        Ok(Self { words })
    }

    /// Consumer-side checks: version must be 2, the nominal header size
    /// must be legal, and the reported sizes must agree with what the
    /// bearer delivered.
    pub fn validate_against(&self, delivered: usize) -> Result<(), HeaderError> {
        if self.version() != TIPC_VERSION {
            return Err(HeaderError::BadVersion(self.version()));
        }
        let hdr = self.hdr_size();
        if !(MIN_H_SIZE..=MAX_H_SIZE).contains(&hdr) {
            return Err(HeaderError::BadHeaderSize(hdr));
        }
        let pkt = self.pkt_size();
        if pkt < hdr || pkt as usize != delivered {
            return Err(HeaderError::LengthMismatch {
                hdr,
                pkt,
                delivered,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word0_fields_do_not_clobber_each_other() {
        let mut hdr = SignalHeader::default();
        hdr.set_version(2);
        hdr.set_user(LINK_PROTOCOL);
        hdr.set_hdr_size(INT_H_SIZE);
        hdr.set_non_seq(true);
        hdr.set_pkt_size(0xbeef);

        assert_eq!(hdr.version(), 2);
        assert_eq!(hdr.user(), LINK_PROTOCOL);
        assert_eq!(hdr.hdr_size(), INT_H_SIZE);
        assert!(hdr.non_seq());
        assert_eq!(hdr.pkt_size(), 0xbeef);
    }

    #[test]
    fn test_word5_fields_do_not_clobber_each_other() {
        let mut hdr = SignalHeader::default();
        hdr.set_session(0x1234);
        hdr.set_redundant_link(true);
        hdr.set_bearer_id(2);
        hdr.set_link_prio(31);
        hdr.set_net_plane('H');
        hdr.set_probe(true);

        assert_eq!(hdr.session(), 0x1234);
        assert!(hdr.redundant_link());
        assert_eq!(hdr.bearer_id(), 2);
        assert_eq!(hdr.link_prio(), 31);
        assert_eq!(hdr.net_plane(), 'H');
        assert!(hdr.probe());
    }

    #[test]
    fn test_encode_is_big_endian() {
        let mut hdr = SignalHeader::default();
        hdr.set_prev_node(0x0102_0304);
        let bytes = hdr.encode();
        assert_eq!(&bytes[12..16], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_decode_short_buffer() {
        assert_eq!(
            SignalHeader::decode(&[0u8; SIGNAL_H_SIZE - 1]),
            Err(HeaderError::Truncated(SIGNAL_H_SIZE - 1))
        );
    }
}
