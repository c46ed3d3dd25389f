//! Framed requests from modules and the command dispatcher that
//! routes them into the store.
//!
//! The transport delivers whole frames, a fixed 20-byte header
//! followed by `size` payload bytes, and frames the replies it sends
//! back; neither side of the socket is handled here. Header and
//! payload integers are little-endian fixed width. The event
//! notification record is the one big-endian structure and lives in
//! [`crate::tagbase::event`].

use anyhow::{anyhow, bail, ensure, Context};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::module::{ModuleBroker, ModuleId};
use crate::tagbase::event::{EventHandle, EventKind};
use crate::tagbase::{TagDatabase, TagIndex};
use crate::types::TagType;
use crate::TAGNAME_SIZE;

pub const FRAME_HEADER_SIZE: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Opaque session id of the sending module.
    pub module: ModuleId,
    pub command: u32,
    pub pid: u32,
    /// Payload size in bytes.
    pub size: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn decode(mut raw: &'a [u8]) -> anyhow::Result<Frame<'a>> {
        let header: FrameHeader = bincode::deserialize_from(&mut raw)
            .context("decoding frame header")?;
        ensure!(
            raw.len() == header.size as usize,
            "frame payload is {} bytes, header says {}",
            raw.len(),
            header.size,
        );
        Ok(Frame {
            header,
            payload: raw,
        })
    }
}

/// Builds one wire frame, filling in the payload size.
pub fn encode_frame(
    module: ModuleId,
    command: Command,
    pid: u32,
    payload: &[u8],
) -> Vec<u8> {
    let header = FrameHeader {
        module,
        command: command.into(),
        pid,
        size: payload.len() as u32,
    };
    let mut frame =
        bincode::serialize(&header).expect("fixed-width header serialises");
    frame.extend_from_slice(payload);
    frame
}

/// The stable command enumeration.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u32)]
pub enum Command {
    ModReg = 1,
    TagAdd = 2,
    TagDel = 3,
    TagGet = 4,
    TagList = 5,
    TagRead = 6,
    TagWrite = 7,
    TagMaskedWrite = 8,
    ModGet = 9,
    EventAdd = 10,
    EventDel = 11,
    CdtCreate = 12,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct TagAddReq {
    name: [u8; TAGNAME_SIZE],
    tag_type: u32,
    count: u32,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct TagIoReq {
    index: u32,
    offset: u32,
    size: u32,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct EventAddReq {
    index: u32,
    byte: u32,
    bit: u8,
    count: u32,
    size: u32,
    datatype: u32,
    kind: u32,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct EventDelReq {
    index: u32,
    id: u32,
}

/// Tag description as carried in TAG_GET and TAG_LIST replies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagDescriptor {
    pub name: String,
    pub tag_type: TagType,
    pub count: u32,
    pub index: TagIndex,
}

impl TagDescriptor {
    /// `{name[32], type: u32, count: u32, index: u32}`.
    pub fn encode(&self) -> [u8; TAGNAME_SIZE + 12] {
        let mut buf = [0u8; TAGNAME_SIZE + 12];
        buf[..self.name.len()].copy_from_slice(self.name.as_bytes());
        buf[32..36].copy_from_slice(&self.tag_type.into_raw().to_le_bytes());
        buf[36..40].copy_from_slice(&self.count.to_le_bytes());
        buf[40..44].copy_from_slice(&self.index.to_le_bytes());
        buf
    }
}

/// What a command produced; the transport frames it on the way out.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Nothing goes back, either by design (MOD_REG) or because the
    /// request could not be decoded.
    None,
    /// 0 on success, a negative taxonomy code otherwise.
    Status(i32),
    Handle(TagIndex),
    TypeId(u32),
    EventId(u32),
    Bytes(Vec<u8>),
    Tag(TagDescriptor),
    TagList(Vec<TagDescriptor>),
    Module(crate::module::ModuleDescriptor),
}

impl Reply {
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Reply::None => Vec::new(),
            Reply::Status(status) => status.to_le_bytes().to_vec(),
            Reply::Handle(value) | Reply::TypeId(value) | Reply::EventId(value) => {
                value.to_le_bytes().to_vec()
            }
            Reply::Bytes(bytes) => bytes.clone(),
            Reply::Tag(descriptor) => descriptor.encode().to_vec(),
            Reply::TagList(descriptors) => descriptors
                .iter()
                .flat_map(|descriptor| descriptor.encode())
                .collect(),
            Reply::Module(descriptor) => {
                bincode::serialize(descriptor).expect("descriptor serialises")
            }
        }
    }
}

fn status_of(result: crate::Result<()>) -> Reply {
    Reply::Status(match result {
        Ok(()) => 0,
        Err(err) => err.status_code(),
    })
}

/// NUL-padded fixed name field, as used in request payloads.
fn unpack_name(raw: &[u8; TAGNAME_SIZE]) -> anyhow::Result<&str> {
    let end = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).context("name field is not UTF-8")
}

fn payload_str(payload: &[u8]) -> anyhow::Result<&str> {
    Ok(std::str::from_utf8(payload)
        .context("payload is not UTF-8")?
        .trim_end_matches('\0'))
}

/// Routes framed requests into the tag store, the type registry, and
/// the event lists.
pub struct Dispatcher<B> {
    db: TagDatabase,
    broker: B,
}

impl<B: ModuleBroker> Dispatcher<B> {
    pub fn new(broker: B) -> Dispatcher<B> {
        Dispatcher {
            db: TagDatabase::new(),
            broker,
        }
    }

    pub fn database(&self) -> &TagDatabase {
        &self.db
    }

    pub fn database_mut(&mut self) -> &mut TagDatabase {
        &mut self.db
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    /// Handles one whole frame. Undecodable requests and unknown
    /// command codes are logged and get no reply; every decoded
    /// request produces one.
    pub fn dispatch(&mut self, raw: &[u8]) -> Reply {
        match self.try_dispatch(raw) {
            Ok(reply) => reply,
            Err(err) => {
                log::error!("dropping request: {err:#}");
                Reply::None
            }
        }
    }

    fn try_dispatch(&mut self, raw: &[u8]) -> anyhow::Result<Reply> {
        let frame = Frame::decode(raw)?;
        let command = Command::try_from_primitive(frame.header.command)
            .map_err(|_| anyhow!("unknown command {}", frame.header.command))?;
        log::debug!(
            "{command:?} from module {} (pid {})",
            frame.header.module,
            frame.header.pid
        );
        match command {
            Command::ModReg => self.mod_reg(&frame),
            Command::TagAdd => self.tag_add(&frame),
            Command::TagDel => self.tag_del(&frame),
            Command::TagGet => self.tag_get(&frame),
            Command::TagList => self.tag_list(&frame),
            Command::TagRead => self.tag_read(&frame),
            Command::TagWrite => self.tag_write(&frame),
            Command::TagMaskedWrite => self.tag_masked_write(&frame),
            Command::ModGet => self.mod_get(&frame),
            Command::EventAdd => self.event_add(&frame),
            Command::EventDel => self.event_del(&frame),
            Command::CdtCreate => self.cdt_create(&frame),
        }
    }

    /// Registration carries the module name; an empty payload
    /// unregisters. Neither direction gets a reply.
    fn mod_reg(&mut self, frame: &Frame) -> anyhow::Result<Reply> {
        let header = frame.header;
        if frame.payload.is_empty() {
            if let Err(err) = self.broker.unregister(header.module) {
                log::warn!("unregister of module {}: {err}", header.module);
            }
        } else {
            let name = payload_str(frame.payload)?;
            self.broker.register(header.module, name, header.pid)?;
        }
        Ok(Reply::None)
    }

    fn tag_add(&mut self, frame: &Frame) -> anyhow::Result<Reply> {
        let mut payload = frame.payload;
        let req: TagAddReq = bincode::deserialize_from(&mut payload)
            .context("decoding TAG_ADD")?;
        let name = unpack_name(&req.name)?;
        Ok(
            match self.db.add(name, TagType::from_raw(req.tag_type), req.count) {
                Ok(index) => Reply::Handle(index),
                Err(err) => Reply::Status(err.status_code()),
            },
        )
    }

    /// Deletion is not supported yet; the command is accepted and
    /// acknowledged so clients written against the full protocol keep
    /// working.
    fn tag_del(&mut self, frame: &Frame) -> anyhow::Result<Reply> {
        let mut payload = frame.payload;
        let name: [u8; TAGNAME_SIZE] = bincode::deserialize_from(&mut payload)
            .context("decoding TAG_DEL")?;
        log::warn!("TAG_DEL {:?} ignored", unpack_name(&name)?);
        Ok(Reply::Status(0))
    }

    fn tag_get(&mut self, frame: &Frame) -> anyhow::Result<Reply> {
        let found = match frame.payload.len() {
            4 => {
                let index =
                    u32::from_le_bytes(frame.payload.try_into().expect("4 bytes"));
                self.db.get_by_index(index).map(|(name, tag_type, count)| {
                    TagDescriptor {
                        name: name.to_string(),
                        tag_type,
                        count,
                        index,
                    }
                })
            }
            TAGNAME_SIZE => {
                let raw: [u8; TAGNAME_SIZE] =
                    frame.payload.try_into().expect("32 bytes");
                let name = unpack_name(&raw)?;
                self.db.get_by_name(name).map(|(index, tag_type, count)| {
                    TagDescriptor {
                        name: name.to_string(),
                        tag_type,
                        count,
                        index,
                    }
                })
            }
            len => bail!("TAG_GET payload of {len} bytes"),
        };
        Ok(match found {
            Ok(descriptor) => Reply::Tag(descriptor),
            Err(err) => Reply::Status(err.status_code()),
        })
    }

    /// Streams every live tag, optionally restricted to names with the
    /// given prefix.
    fn tag_list(&mut self, frame: &Frame) -> anyhow::Result<Reply> {
        let prefix = payload_str(frame.payload)?;
        let mut descriptors = Vec::new();
        for index in 0..self.db.count() as TagIndex {
            let (name, tag_type, count) =
                self.db.get_by_index(index).expect("index is live");
            if !prefix.is_empty() && !name.starts_with(prefix) {
                continue;
            }
            descriptors.push(TagDescriptor {
                name: name.to_string(),
                tag_type,
                count,
                index,
            });
        }
        Ok(Reply::TagList(descriptors))
    }

    fn tag_read(&mut self, frame: &Frame) -> anyhow::Result<Reply> {
        let mut payload = frame.payload;
        let req: TagIoReq = bincode::deserialize_from(&mut payload)
            .context("decoding TAG_READ")?;
        let mut data = vec![0u8; req.size as usize];
        Ok(match self.db.read(req.index, req.offset as usize, &mut data) {
            Ok(()) => Reply::Bytes(data),
            Err(err) => {
                log::warn!("TAG_READ of tag {}: {err}", req.index);
                Reply::Bytes(Vec::new())
            }
        })
    }

    fn tag_write(&mut self, frame: &Frame) -> anyhow::Result<Reply> {
        let mut payload = frame.payload;
        let index: u32 = bincode::deserialize_from(&mut payload)
            .context("decoding TAG_WRITE")?;
        let offset: u32 = bincode::deserialize_from(&mut payload)
            .context("decoding TAG_WRITE")?;
        Ok(status_of(self.db.write(index, offset as usize, payload)))
    }

    /// The payload tail is the data bytes followed by the same number
    /// of mask bytes.
    fn tag_masked_write(&mut self, frame: &Frame) -> anyhow::Result<Reply> {
        let mut payload = frame.payload;
        let index: u32 = bincode::deserialize_from(&mut payload)
            .context("decoding TAG_MWRITE")?;
        let offset: u32 = bincode::deserialize_from(&mut payload)
            .context("decoding TAG_MWRITE")?;
        ensure!(
            payload.len() % 2 == 0,
            "masked write payload has no even data/mask split"
        );
        let (data, mask) = payload.split_at(payload.len() / 2);
        Ok(status_of(self.db.mask_write(
            index,
            offset as usize,
            data,
            mask,
        )))
    }

    fn mod_get(&mut self, frame: &Frame) -> anyhow::Result<Reply> {
        let found = match frame.payload.len() {
            0 => self.broker.descriptor_of(frame.header.module),
            4 => {
                let pid =
                    u32::from_le_bytes(frame.payload.try_into().expect("4 bytes"));
                self.broker.descriptor_by_pid(pid)
            }
            len => bail!("MOD_GET payload of {len} bytes"),
        };
        Ok(match found {
            Some(descriptor) => Reply::Module(descriptor),
            None => Reply::Status(
                Error::NotFound("module".to_string()).status_code(),
            ),
        })
    }

    fn event_add(&mut self, frame: &Frame) -> anyhow::Result<Reply> {
        let mut payload = frame.payload;
        let req: EventAddReq = bincode::deserialize_from(&mut payload)
            .context("decoding EVENT_ADD")?;
        let Ok(kind) = EventKind::try_from_primitive(req.kind) else {
            log::error!("unknown event kind {}", req.kind);
            return Ok(Reply::Status(
                Error::Arg("unknown event kind").status_code(),
            ));
        };
        let Some(sender) = self.broker.sender_of(frame.header.module) else {
            return Ok(Reply::Status(
                Error::NotFound("module".to_string()).status_code(),
            ));
        };
        let handle = EventHandle {
            index: req.index,
            byte: req.byte as usize,
            bit: req.bit,
            count: req.count,
            size: req.size as usize,
            datatype: TagType::from_raw(req.datatype),
        };
        Ok(match self.db.event_add(handle, kind, payload, sender) {
            Ok(id) => {
                self.broker.record_event(frame.header.module, true);
                Reply::EventId(id)
            }
            Err(err) => Reply::Status(err.status_code()),
        })
    }

    fn event_del(&mut self, frame: &Frame) -> anyhow::Result<Reply> {
        let mut payload = frame.payload;
        let req: EventDelReq = bincode::deserialize_from(&mut payload)
            .context("decoding EVENT_DEL")?;
        let result = self.db.event_del(req.index, req.id, frame.header.module);
        if result.is_ok() {
            self.broker.record_event(frame.header.module, false);
        }
        Ok(status_of(result))
    }

    fn cdt_create(&mut self, frame: &Frame) -> anyhow::Result<Reply> {
        let definition = payload_str(frame.payload)?;
        Ok(match self.db.types_mut().create_cdt(definition) {
            Ok(tag_type) => Reply::TypeId(tag_type.into_raw()),
            Err(err) => Reply::Status(err.status_code()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_is_twenty_bytes() {
        let frame = encode_frame(7, Command::TagGet, 42, b"xyz");
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + 3);
        let decoded = Frame::decode(&frame).unwrap();
        assert_eq!(decoded.header.module, 7);
        assert_eq!(decoded.header.command, 4);
        assert_eq!(decoded.header.pid, 42);
        assert_eq!(decoded.payload, b"xyz");
    }

    #[test]
    fn truncated_frames_fail_decode() {
        let frame = encode_frame(7, Command::TagGet, 42, b"xyz");
        assert!(Frame::decode(&frame[..frame.len() - 1]).is_err());
        assert!(Frame::decode(&frame[..10]).is_err());
    }

    #[test]
    fn descriptor_encodes_fixed_layout() {
        let descriptor = TagDescriptor {
            name: "pump".to_string(),
            tag_type: TagType::DINT,
            count: 4,
            index: 9,
        };
        let raw = descriptor.encode();
        assert_eq!(&raw[..4], b"pump");
        assert!(raw[4..32].iter().all(|&c| c == 0));
        assert_eq!(raw[32..36], TagType::DINT.into_raw().to_le_bytes());
        assert_eq!(raw[36..40], 4u32.to_le_bytes());
        assert_eq!(raw[40..44], 9u32.to_le_bytes());
    }
}
