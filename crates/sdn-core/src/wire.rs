//! OpenFlow 1.3 wire layouts — the subset the controller speaks.
//!
//! Only the messages needed for the handshake, keepalive and the fixed
//! switching rules are modelled. Every struct mirrors the on-wire layout
//! byte for byte (network byte order, no implicit padding) and derives
//! zerocopy traits, so parsing never touches unsafe code.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub type Be16 = U16<BigEndian>;
pub type Be32 = U32<BigEndian>;
pub type Be64 = U64<BigEndian>;

/// OpenFlow 1.3.
pub const OFP_VERSION: u8 = 0x04;

/// Default controller port (pre-IANA OpenFlow port).
pub const DEFAULT_CONTROLLER_PORT: u16 = 6633;

pub const OFP_HEADER_LEN: usize = 8;

/// Largest message the 16-bit length field can describe.
pub const OFP_MAX_MESSAGE_LEN: usize = u16::MAX as usize;

// ── Header ────────────────────────────────────────────────────────────────────

/// Common header in front of every OpenFlow message.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct OfpHeader {
    pub version: u8,
    pub msg_type: u8,
    /// Total message length including this header.
    pub length: Be16,
    /// Transaction id. Replies echo the xid of the request.
    pub xid: Be32,
}

assert_eq_size!(OfpHeader, [u8; 8]);

// ── Message types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0,
    Error = 1,
    EchoRequest = 2,
    EchoReply = 3,
    FeaturesRequest = 5,
    FeaturesReply = 6,
    PacketIn = 10,
    PortStatus = 12,
    FlowMod = 14,
    BarrierRequest = 20,
    BarrierReply = 21,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(MessageType::Hello),
            1 => Ok(MessageType::Error),
            2 => Ok(MessageType::EchoRequest),
            3 => Ok(MessageType::EchoReply),
            5 => Ok(MessageType::FeaturesRequest),
            6 => Ok(MessageType::FeaturesReply),
            10 => Ok(MessageType::PacketIn),
            12 => Ok(MessageType::PortStatus),
            14 => Ok(MessageType::FlowMod),
            20 => Ok(MessageType::BarrierRequest),
            21 => Ok(MessageType::BarrierReply),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

// ── Bodies ────────────────────────────────────────────────────────────────────

/// `OFPT_FEATURES_REPLY` body. Carries the datapath id.
///
/// Wire size: 24 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct SwitchFeaturesBody {
    pub datapath_id: Be64,
    pub n_buffers: Be32,
    pub n_tables: u8,
    pub auxiliary_id: u8,
    pub pad: [u8; 2],
    pub capabilities: Be32,
    pub reserved: Be32,
}

assert_eq_size!(SwitchFeaturesBody, [u8; 24]);

/// Fixed part of `OFPT_ERROR`. Followed by at least 64 bytes of the
/// offending request.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ErrorBody {
    pub err_type: Be16,
    pub code: Be16,
}

assert_eq_size!(ErrorBody, [u8; 4]);

/// Fixed part of `OFPT_FLOW_MOD`, followed by a match and instructions.
///
/// Wire size: 40 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FlowModBody {
    pub cookie: Be64,
    pub cookie_mask: Be64,
    pub table_id: u8,
    pub command: u8,
    pub idle_timeout: Be16,
    pub hard_timeout: Be16,
    pub priority: Be16,
    pub buffer_id: Be32,
    pub out_port: Be32,
    pub out_group: Be32,
    pub flags: Be16,
    pub pad: [u8; 2],
}

assert_eq_size!(FlowModBody, [u8; 40]);

/// OXM match header. An empty match is this header with `length == 4`,
/// padded to 8 bytes.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct MatchHeader {
    pub match_type: Be16,
    pub length: Be16,
    pub pad: [u8; 4],
}

assert_eq_size!(MatchHeader, [u8; 8]);

/// `OFPIT_APPLY_ACTIONS` / `OFPIT_WRITE_ACTIONS` header; actions follow.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct InstructionActions {
    pub instruction_type: Be16,
    pub length: Be16,
    pub pad: [u8; 4],
}

assert_eq_size!(InstructionActions, [u8; 8]);

/// `OFPAT_OUTPUT`.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ActionOutput {
    pub action_type: Be16,
    pub length: Be16,
    pub port: Be32,
    pub max_len: Be16,
    pub pad: [u8; 6],
}

assert_eq_size!(ActionOutput, [u8; 16]);

// ── Constants ─────────────────────────────────────────────────────────────────

pub const OFPFC_ADD: u8 = 0;
pub const OFPFC_DELETE: u8 = 3;

/// Wildcard table id for deletes.
pub const OFPTT_ALL: u8 = 0xff;

/// Hand the packet to the switch's traditional L2 pipeline
/// (flood unknown destinations, learn sources, forward known ones).
pub const OFPP_NORMAL: u32 = 0xffff_fffa;
pub const OFPP_ANY: u32 = 0xffff_ffff;
pub const OFPG_ANY: u32 = 0xffff_ffff;
pub const OFP_NO_BUFFER: u32 = 0xffff_ffff;

pub const OFPMT_OXM: u16 = 1;
pub const OFPIT_APPLY_ACTIONS: u16 = 4;
pub const OFPAT_OUTPUT: u16 = 0;
pub const OFPCML_NO_BUFFER: u16 = 0xffff;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("header declares length {0}, shorter than the 8-byte header")]
    BadLength(u16),

    #[error("{msg_type:?} body truncated: need {needed} bytes, have {actual}")]
    Truncated {
        msg_type: MessageType,
        needed: usize,
        actual: usize,
    },

    #[error("unknown flow-mod command: {0}")]
    UnknownFlowModCommand(u8),

    #[error("message of {0} bytes exceeds the 16-bit length field")]
    TooLarge(usize),
}
