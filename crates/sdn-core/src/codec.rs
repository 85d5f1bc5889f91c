//! Framing and structured messages on top of the raw wire layouts.
//!
//! `decode` pulls complete frames out of a receive buffer and leaves
//! partial ones in place, so callers can keep appending bytes until a
//! frame is whole. `encode` appends one framed message to a send buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use zerocopy::{AsBytes, FromBytes};

use crate::wire::*;

/// Datapath description from `OFPT_FEATURES_REPLY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    pub datapath_id: u64,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub capabilities: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowModCommand {
    Add,
    Delete,
}

/// A flow-table modification with at most one output action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMod {
    pub command: FlowModCommand,
    pub table_id: u8,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub cookie: u64,
    /// Output port for an `APPLY_ACTIONS` instruction; `None` = no instructions.
    pub output: Option<u32>,
}

impl FlowMod {
    /// Remove every flow in every table.
    pub fn delete_all() -> Self {
        Self {
            command: FlowModCommand::Delete,
            table_id: OFPTT_ALL,
            priority: 0,
            idle_timeout: 0,
            hard_timeout: 0,
            cookie: 0,
            output: None,
        }
    }
}

/// Structured OpenFlow message, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello,
    Error { err_type: u16, code: u16, data: Bytes },
    EchoRequest(Bytes),
    EchoReply(Bytes),
    FeaturesRequest,
    FeaturesReply(Features),
    PacketIn(Bytes),
    PortStatus(Bytes),
    FlowMod(FlowMod),
    BarrierRequest,
    BarrierReply,
    /// A well-framed message of a type the controller does not handle.
    Unsupported(u8),
}

impl Message {
    pub fn message_type(&self) -> Option<MessageType> {
        Some(match self {
            Message::Hello => MessageType::Hello,
            Message::Error { .. } => MessageType::Error,
            Message::EchoRequest(_) => MessageType::EchoRequest,
            Message::EchoReply(_) => MessageType::EchoReply,
            Message::FeaturesRequest => MessageType::FeaturesRequest,
            Message::FeaturesReply(_) => MessageType::FeaturesReply,
            Message::PacketIn(_) => MessageType::PacketIn,
            Message::PortStatus(_) => MessageType::PortStatus,
            Message::FlowMod(_) => MessageType::FlowMod,
            Message::BarrierRequest => MessageType::BarrierRequest,
            Message::BarrierReply => MessageType::BarrierReply,
            Message::Unsupported(_) => return None,
        })
    }
}

/// A decoded message together with its header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u8,
    pub xid: u32,
    pub message: Message,
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Take one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. On error the buffer is
/// left untouched; the stream is unrecoverable at that point.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Envelope>, WireError> {
    if buf.len() < OFP_HEADER_LEN {
        return Ok(None);
    }
    let header = match OfpHeader::read_from_prefix(&buf[..]) {
        Some(h) => h,
        None => return Ok(None),
    };
    let length = header.length.get();
    if (length as usize) < OFP_HEADER_LEN {
        return Err(WireError::BadLength(length));
    }
    if buf.len() < length as usize {
        buf.reserve(length as usize - buf.len());
        return Ok(None);
    }

    let mut frame = buf.split_to(length as usize).freeze();
    frame.advance(OFP_HEADER_LEN);
    let message = match MessageType::try_from(header.msg_type) {
        Ok(msg_type) => decode_body(msg_type, frame)?,
        Err(_) => Message::Unsupported(header.msg_type),
    };

    Ok(Some(Envelope {
        version: header.version,
        xid: header.xid.get(),
        message,
    }))
}

fn need(msg_type: MessageType, body: &Bytes, needed: usize) -> Result<(), WireError> {
    if body.len() < needed {
        return Err(WireError::Truncated {
            msg_type,
            needed,
            actual: body.len(),
        });
    }
    Ok(())
}

fn decode_body(msg_type: MessageType, body: Bytes) -> Result<Message, WireError> {
    Ok(match msg_type {
        // Hello elements (version bitmaps) are ignored.
        MessageType::Hello => Message::Hello,
        MessageType::Error => {
            need(msg_type, &body, std::mem::size_of::<ErrorBody>())?;
            let fixed = ErrorBody::read_from_prefix(&body[..])
                .ok_or(WireError::Truncated { msg_type, needed: 4, actual: body.len() })?;
            Message::Error {
                err_type: fixed.err_type.get(),
                code: fixed.code.get(),
                data: body.slice(std::mem::size_of::<ErrorBody>()..),
            }
        }
        MessageType::EchoRequest => Message::EchoRequest(body),
        MessageType::EchoReply => Message::EchoReply(body),
        MessageType::FeaturesRequest => Message::FeaturesRequest,
        MessageType::FeaturesReply => {
            let needed = std::mem::size_of::<SwitchFeaturesBody>();
            need(msg_type, &body, needed)?;
            let f = SwitchFeaturesBody::read_from_prefix(&body[..])
                .ok_or(WireError::Truncated { msg_type, needed, actual: body.len() })?;
            Message::FeaturesReply(Features {
                datapath_id: f.datapath_id.get(),
                n_buffers: f.n_buffers.get(),
                n_tables: f.n_tables,
                capabilities: f.capabilities.get(),
            })
        }
        MessageType::PacketIn => Message::PacketIn(body),
        MessageType::PortStatus => Message::PortStatus(body),
        MessageType::FlowMod => Message::FlowMod(decode_flow_mod(body)?),
        MessageType::BarrierRequest => Message::BarrierRequest,
        MessageType::BarrierReply => Message::BarrierReply,
    })
}

fn decode_flow_mod(body: Bytes) -> Result<FlowMod, WireError> {
    let msg_type = MessageType::FlowMod;
    let fixed_len = std::mem::size_of::<FlowModBody>();
    let match_len = std::mem::size_of::<MatchHeader>();
    need(msg_type, &body, fixed_len + match_len)?;

    let truncated = |needed: usize| WireError::Truncated {
        msg_type,
        needed,
        actual: body.len(),
    };

    let fixed = FlowModBody::read_from_prefix(&body[..]).ok_or_else(|| truncated(fixed_len))?;
    let command = match fixed.command {
        OFPFC_ADD => FlowModCommand::Add,
        OFPFC_DELETE => FlowModCommand::Delete,
        other => return Err(WireError::UnknownFlowModCommand(other)),
    };

    let m = MatchHeader::read_from_prefix(&body[fixed_len..])
        .ok_or_else(|| truncated(fixed_len + match_len))?;
    // Match length excludes padding to the next multiple of 8.
    let padded_match = (m.length.get() as usize + 7) / 8 * 8;
    let mut offset = fixed_len + padded_match.max(match_len);

    let mut output = None;
    let instr_len = std::mem::size_of::<InstructionActions>();
    while output.is_none() && body.len() >= offset + instr_len {
        let instr = InstructionActions::read_from_prefix(&body[offset..])
            .ok_or_else(|| truncated(offset + instr_len))?;
        let len = instr.length.get() as usize;
        if len < instr_len || body.len() < offset + len {
            return Err(truncated(offset + len.max(instr_len)));
        }
        if instr.instruction_type.get() == OFPIT_APPLY_ACTIONS {
            let mut action_offset = offset + instr_len;
            while action_offset + 4 <= offset + len {
                let action = &body[action_offset..offset + len];
                let action_type = u16::from_be_bytes([action[0], action[1]]);
                let action_len = u16::from_be_bytes([action[2], action[3]]) as usize;
                if action_len < 4 {
                    return Err(truncated(action_offset + 4));
                }
                if action_type == OFPAT_OUTPUT {
                    let out = ActionOutput::read_from_prefix(action)
                        .ok_or_else(|| truncated(action_offset + 16))?;
                    output = Some(out.port.get());
                    break;
                }
                action_offset += action_len;
            }
        }
        offset += len;
    }

    Ok(FlowMod {
        command,
        table_id: fixed.table_id,
        priority: fixed.priority.get(),
        idle_timeout: fixed.idle_timeout.get(),
        hard_timeout: fixed.hard_timeout.get(),
        cookie: fixed.cookie.get(),
        output,
    })
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Append `message` with transaction id `xid` to `dst`.
pub fn encode(xid: u32, message: &Message, dst: &mut BytesMut) -> Result<(), WireError> {
    let msg_type = match message.message_type() {
        Some(t) => t,
        None => {
            // Unsupported messages are never sent.
            return Ok(());
        }
    };

    let mut body = BytesMut::new();
    match message {
        Message::Hello
        | Message::FeaturesRequest
        | Message::BarrierRequest
        | Message::BarrierReply
        | Message::Unsupported(_) => {}
        Message::Error { err_type, code, data } => {
            body.put_slice(
                ErrorBody {
                    err_type: Be16::new(*err_type),
                    code: Be16::new(*code),
                }
                .as_bytes(),
            );
            body.put_slice(data);
        }
        Message::EchoRequest(payload)
        | Message::EchoReply(payload)
        | Message::PacketIn(payload)
        | Message::PortStatus(payload) => body.put_slice(payload),
        Message::FeaturesReply(f) => body.put_slice(
            SwitchFeaturesBody {
                datapath_id: Be64::new(f.datapath_id),
                n_buffers: Be32::new(f.n_buffers),
                n_tables: f.n_tables,
                auxiliary_id: 0,
                pad: [0; 2],
                capabilities: Be32::new(f.capabilities),
                reserved: Be32::new(0),
            }
            .as_bytes(),
        ),
        Message::FlowMod(fm) => encode_flow_mod(fm, &mut body),
    }

    let length = OFP_HEADER_LEN + body.len();
    if length > OFP_MAX_MESSAGE_LEN {
        return Err(WireError::TooLarge(length));
    }
    let header = OfpHeader {
        version: OFP_VERSION,
        msg_type: msg_type.into(),
        length: Be16::new(length as u16),
        xid: Be32::new(xid),
    };
    dst.reserve(length);
    dst.put_slice(header.as_bytes());
    dst.put_slice(&body);
    Ok(())
}

fn encode_flow_mod(fm: &FlowMod, body: &mut BytesMut) {
    let command = match fm.command {
        FlowModCommand::Add => OFPFC_ADD,
        FlowModCommand::Delete => OFPFC_DELETE,
    };
    body.put_slice(
        FlowModBody {
            cookie: Be64::new(fm.cookie),
            cookie_mask: Be64::new(0),
            table_id: fm.table_id,
            command,
            idle_timeout: Be16::new(fm.idle_timeout),
            hard_timeout: Be16::new(fm.hard_timeout),
            priority: Be16::new(fm.priority),
            buffer_id: Be32::new(OFP_NO_BUFFER),
            out_port: Be32::new(OFPP_ANY),
            out_group: Be32::new(OFPG_ANY),
            flags: Be16::new(0),
            pad: [0; 2],
        }
        .as_bytes(),
    );
    // Empty OXM match: 4 significant bytes padded to 8.
    body.put_slice(
        MatchHeader {
            match_type: Be16::new(OFPMT_OXM),
            length: Be16::new(4),
            pad: [0; 4],
        }
        .as_bytes(),
    );
    if let Some(port) = fm.output {
        let action_len = std::mem::size_of::<ActionOutput>();
        let instr_len = std::mem::size_of::<InstructionActions>() + action_len;
        body.put_slice(
            InstructionActions {
                instruction_type: Be16::new(OFPIT_APPLY_ACTIONS),
                length: Be16::new(instr_len as u16),
                pad: [0; 4],
            }
            .as_bytes(),
        );
        body.put_slice(
            ActionOutput {
                action_type: Be16::new(OFPAT_OUTPUT),
                length: Be16::new(action_len as u16),
                port: Be32::new(port),
                max_len: Be16::new(OFPCML_NO_BUFFER),
                pad: [0; 6],
            }
            .as_bytes(),
        );
    }
}
