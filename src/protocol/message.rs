//! Domain Wire Protocol
//!
//! Every message starts with a fixed 40 byte header. All multi-byte fields
//! are little endian on the wire.
//!
//! ```text
//! header   version[3] u16 | type u16 | sender u32 | target u32 | global_id u32
//!          flags u32 | data u32 | pad u32 | pad u64
//! start    info { info_size, id_size, id_count, started_count,
//!                 member_count, joined_count, removed_count, failed_count }
//!          id_count x id { node_id, flags, ext_node, master, how, pad,
//!                          fence_time u64, ext_time u64 }
//! ```
//!
//! COMPLETE has the same layout as START, VICTIM_DONE carries a single id
//! entry, EXTERNAL is header only, PROTOCOL carries `max[4] run[4]` u16s.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::version::{Protocol, ProtocolVersion};
use crate::cluster::NodeId;
use crate::error::{Error, Result};

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 40;
/// Size of the change info block in START/COMPLETE
pub const INFO_SIZE: usize = 32;
/// Size of one per-node id entry
pub const ID_INFO_SIZE: usize = 40;
/// Size of the PROTOCOL payload
pub const PROTOCOL_SIZE: usize = 16;

/// Id entry flag: the node is a member of the change being described
pub const IDI_NODEID_IS_MEMBER: u32 = 0x0000_0001;

/// Message type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Protocol = 1,
    Start = 2,
    VictimDone = 3,
    Complete = 4,
    External = 5,
}

impl MessageType {
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Protocol => "protocol",
            MessageType::Start => "start",
            MessageType::VictimDone => "victim_done",
            MessageType::Complete => "complete",
            MessageType::External => "external",
        }
    }
}

impl TryFrom<u16> for MessageType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Protocol),
            2 => Ok(MessageType::Start),
            3 => Ok(MessageType::VictimDone),
            4 => Ok(MessageType::Complete),
            5 => Ok(MessageType::External),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

/// Header flag bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags(u32);

impl MessageFlags {
    /// Accompanies start, the sender is joining
    pub const JOINING: MessageFlags = MessageFlags(1);
    /// Accompanies start, the sender has complete info
    pub const COMPLETE: MessageFlags = MessageFlags(2);
    /// The start is for the second of two indistinguishable changes
    pub const DUPLICATE_CG: MessageFlags = MessageFlags(4);

    pub const fn empty() -> Self {
        MessageFlags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        MessageFlags(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MessageFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

impl std::fmt::LowerHex for MessageFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Counts describing the change a START/COMPLETE was sent for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeInfo {
    pub started_count: u32,
    pub member_count: u32,
    pub joined_count: u32,
    pub removed_count: u32,
    pub failed_count: u32,
}

/// Per-node entry: membership in the described change plus fencing history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdInfo {
    pub node_id: NodeId,
    pub flags: u32,
    pub fence_external_node: NodeId,
    pub fence_master: NodeId,
    pub fence_how: u32,
    pub fence_time: u64,
    pub fence_external_time: u64,
}

impl IdInfo {
    pub fn is_member(&self) -> bool {
        self.flags & IDI_NODEID_IS_MEMBER != 0
    }
}

/// A decoded message body. Change-carrying variants hold the change seq
/// that travels in the header `data` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Protocol(Protocol),
    Start {
        seq: u32,
        info: ChangeInfo,
        ids: Vec<IdInfo>,
    },
    VictimDone {
        seq: u32,
        id: IdInfo,
    },
    Complete {
        seq: u32,
        info: ChangeInfo,
        ids: Vec<IdInfo>,
    },
    External {
        victim: NodeId,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Protocol(_) => MessageType::Protocol,
            Message::Start { .. } => MessageType::Start,
            Message::VictimDone { .. } => MessageType::VictimDone,
            Message::Complete { .. } => MessageType::Complete,
            Message::External { .. } => MessageType::External,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        self.message_type().name()
    }

    fn header_data(&self) -> u32 {
        match self {
            Message::Protocol(_) => 0,
            Message::Start { seq, .. }
            | Message::VictimDone { seq, .. }
            | Message::Complete { seq, .. } => *seq,
            Message::External { victim } => *victim,
        }
    }
}

/// Header fields other than type and data, which follow from the body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub version: ProtocolVersion,
    pub sender: NodeId,
    pub target: NodeId,
    pub global_id: u32,
    pub flags: MessageFlags,
}

/// A full message: header plus body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: Header,
    pub message: Message,
}

impl Envelope {
    pub fn new(header: Header, message: Message) -> Self {
        Self { header, message }
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload_len());
        let hd = &self.header;

        buf.write_u16::<LittleEndian>(hd.version.major)?;
        buf.write_u16::<LittleEndian>(hd.version.minor)?;
        buf.write_u16::<LittleEndian>(hd.version.patch)?;
        buf.write_u16::<LittleEndian>(self.message.message_type() as u16)?;
        buf.write_u32::<LittleEndian>(hd.sender)?;
        buf.write_u32::<LittleEndian>(hd.target)?;
        buf.write_u32::<LittleEndian>(hd.global_id)?;
        buf.write_u32::<LittleEndian>(hd.flags.bits())?;
        buf.write_u32::<LittleEndian>(self.message.header_data())?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u64::<LittleEndian>(0)?;

        match &self.message {
            Message::Protocol(proto) => {
                write_version(&mut buf, &proto.max)?;
                write_version(&mut buf, &proto.run)?;
            }
            Message::Start { info, ids, .. } | Message::Complete { info, ids, .. } => {
                buf.write_u32::<LittleEndian>(INFO_SIZE as u32)?;
                buf.write_u32::<LittleEndian>(ID_INFO_SIZE as u32)?;
                buf.write_u32::<LittleEndian>(ids.len() as u32)?;
                buf.write_u32::<LittleEndian>(info.started_count)?;
                buf.write_u32::<LittleEndian>(info.member_count)?;
                buf.write_u32::<LittleEndian>(info.joined_count)?;
                buf.write_u32::<LittleEndian>(info.removed_count)?;
                buf.write_u32::<LittleEndian>(info.failed_count)?;
                for id in ids {
                    write_id(&mut buf, id)?;
                }
            }
            Message::VictimDone { id, .. } => write_id(&mut buf, id)?,
            Message::External { .. } => {}
        }

        Ok(buf)
    }

    /// Parse wire bytes delivered by the transport as sent by `from`.
    ///
    /// With `running` set, messages other than PROTOCOL must carry the same
    /// major and minor version.
    pub fn decode(buf: &[u8], from: NodeId, running: Option<&ProtocolVersion>) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::ShortMessage {
                len: buf.len(),
                need: HEADER_SIZE,
            });
        }

        let mut rdr = Cursor::new(buf);
        let version = ProtocolVersion::new(
            rdr.read_u16::<LittleEndian>()?,
            rdr.read_u16::<LittleEndian>()?,
            rdr.read_u16::<LittleEndian>()?,
        );
        let msg_type = MessageType::try_from(rdr.read_u16::<LittleEndian>()?)?;
        let sender = rdr.read_u32::<LittleEndian>()?;
        let target = rdr.read_u32::<LittleEndian>()?;
        let global_id = rdr.read_u32::<LittleEndian>()?;
        let flags = MessageFlags::from_bits(rdr.read_u32::<LittleEndian>()?);
        let data = rdr.read_u32::<LittleEndian>()?;
        rdr.read_u32::<LittleEndian>()?;
        rdr.read_u64::<LittleEndian>()?;

        if let Some(running) = running {
            if msg_type != MessageType::Protocol && !version.compatible_with(running) {
                return Err(Error::VersionMismatch {
                    from,
                    got: version,
                    running: *running,
                });
            }
        }

        if sender != from {
            return Err(Error::SenderMismatch {
                claimed: sender,
                actual: from,
            });
        }

        let body = &buf[HEADER_SIZE..];
        let message = match msg_type {
            MessageType::Protocol => {
                expect_len(msg_type, body.len(), PROTOCOL_SIZE)?;
                let mut rdr = Cursor::new(body);
                let max = read_version(&mut rdr)?;
                let run = read_version(&mut rdr)?;
                Message::Protocol(Protocol { max, run })
            }
            MessageType::Start | MessageType::Complete => {
                let (info, ids) = decode_change(body)?;
                if msg_type == MessageType::Start {
                    Message::Start {
                        seq: data,
                        info,
                        ids,
                    }
                } else {
                    Message::Complete {
                        seq: data,
                        info,
                        ids,
                    }
                }
            }
            MessageType::VictimDone => {
                expect_len(msg_type, body.len(), ID_INFO_SIZE)?;
                let id = read_id(&mut Cursor::new(body))?;
                Message::VictimDone { seq: data, id }
            }
            MessageType::External => {
                expect_len(msg_type, body.len(), 0)?;
                Message::External { victim: data }
            }
        };

        Ok(Self {
            header: Header {
                version,
                sender,
                target,
                global_id,
                flags,
            },
            message,
        })
    }

    fn payload_len(&self) -> usize {
        match &self.message {
            Message::Protocol(_) => PROTOCOL_SIZE,
            Message::Start { ids, .. } | Message::Complete { ids, .. } => {
                INFO_SIZE + ids.len() * ID_INFO_SIZE
            }
            Message::VictimDone { .. } => ID_INFO_SIZE,
            Message::External { .. } => 0,
        }
    }
}

fn expect_len(msg_type: MessageType, got: usize, want: usize) -> Result<()> {
    if got != want {
        return Err(Error::BadLength(format!(
            "{} payload {} bytes, expected {}",
            msg_type.name(),
            got,
            want
        )));
    }
    Ok(())
}

fn decode_change(body: &[u8]) -> Result<(ChangeInfo, Vec<IdInfo>)> {
    if body.len() < INFO_SIZE {
        return Err(Error::ShortMessage {
            len: HEADER_SIZE + body.len(),
            need: HEADER_SIZE + INFO_SIZE,
        });
    }

    let mut rdr = Cursor::new(body);
    let info_size = rdr.read_u32::<LittleEndian>()? as usize;
    let id_size = rdr.read_u32::<LittleEndian>()? as usize;
    let id_count = rdr.read_u32::<LittleEndian>()? as usize;
    let info = ChangeInfo {
        started_count: rdr.read_u32::<LittleEndian>()?,
        member_count: rdr.read_u32::<LittleEndian>()?,
        joined_count: rdr.read_u32::<LittleEndian>()?,
        removed_count: rdr.read_u32::<LittleEndian>()?,
        failed_count: rdr.read_u32::<LittleEndian>()?,
    };

    if info_size < INFO_SIZE || id_size < ID_INFO_SIZE {
        return Err(Error::BadLength(format!(
            "info size {} id size {}",
            info_size, id_size
        )));
    }

    let expected = id_size
        .checked_mul(id_count)
        .and_then(|ids| ids.checked_add(info_size))
        .ok_or_else(|| Error::BadLength(format!("id count {} overflows", id_count)))?;

    if body.len() != expected {
        return Err(Error::BadLength(format!(
            "change payload {} bytes, expected {} for {} ids",
            body.len(),
            expected,
            id_count
        )));
    }

    // entries may be larger than we know about; skip the tail of each
    let ids = body[info_size..]
        .chunks_exact(id_size)
        .map(|chunk| read_id(&mut Cursor::new(chunk)))
        .collect::<Result<Vec<_>>>()?;

    Ok((info, ids))
}

fn write_version(buf: &mut Vec<u8>, v: &ProtocolVersion) -> Result<()> {
    buf.write_u16::<LittleEndian>(v.major)?;
    buf.write_u16::<LittleEndian>(v.minor)?;
    buf.write_u16::<LittleEndian>(v.patch)?;
    buf.write_u16::<LittleEndian>(v.flags)?;
    Ok(())
}

fn read_version(rdr: &mut Cursor<&[u8]>) -> Result<ProtocolVersion> {
    Ok(ProtocolVersion {
        major: rdr.read_u16::<LittleEndian>()?,
        minor: rdr.read_u16::<LittleEndian>()?,
        patch: rdr.read_u16::<LittleEndian>()?,
        flags: rdr.read_u16::<LittleEndian>()?,
    })
}

fn write_id(buf: &mut Vec<u8>, id: &IdInfo) -> Result<()> {
    buf.write_u32::<LittleEndian>(id.node_id)?;
    buf.write_u32::<LittleEndian>(id.flags)?;
    buf.write_u32::<LittleEndian>(id.fence_external_node)?;
    buf.write_u32::<LittleEndian>(id.fence_master)?;
    buf.write_u32::<LittleEndian>(id.fence_how)?;
    buf.write_u32::<LittleEndian>(0)?;
    buf.write_u64::<LittleEndian>(id.fence_time)?;
    buf.write_u64::<LittleEndian>(id.fence_external_time)?;
    Ok(())
}

fn read_id(rdr: &mut Cursor<&[u8]>) -> Result<IdInfo> {
    let node_id = rdr.read_u32::<LittleEndian>()?;
    let flags = rdr.read_u32::<LittleEndian>()?;
    let fence_external_node = rdr.read_u32::<LittleEndian>()?;
    let fence_master = rdr.read_u32::<LittleEndian>()?;
    let fence_how = rdr.read_u32::<LittleEndian>()?;
    rdr.read_u32::<LittleEndian>()?;
    let fence_time = rdr.read_u64::<LittleEndian>()?;
    let fence_external_time = rdr.read_u64::<LittleEndian>()?;

    Ok(IdInfo {
        node_id,
        flags,
        fence_external_node,
        fence_master,
        fence_how,
        fence_time,
        fence_external_time,
    })
}
