//! Wire codec for the messages the tailer produces and consumes.
//!
//! Every message shares a fixed header followed by a type-specific body:
//!
//! ```text
//! | version (u8) | msg_size (u32 LE) | type (u8) | tenant (u16 LE) | origin |
//! ```
//!
//! `msg_size` counts every byte after the size field itself. `origin` is
//! a length-prefixed host string followed by a varint port. Bodies:
//!
//! - `Deliver` (0x01): `seqno_prev varint | seqno varint | tenant u16 LE |
//!   topic lp_string | flags u16 LE (retention in the low 2 bits) |
//!   namespace u16 LE | msg_id lp(16 bytes) | payload to end`
//! - `Gap` (0x02): `gap_type u8 | from varint | to varint`
//! - `Metadata` (0x03): `meta_type u8 | num_topics varint`, then per
//!   topic `seqno varint | topic lp_string | namespace u16 LE | sub_type u8`
//!
//! Varints use the encoding in [`common::serde::varint`]. Unknown types
//! and versions fail decoding with `InvalidArgument`.

use bytes::{BufMut, Bytes, BytesMut};
use common::serde::varint::var_u64;
use common::serde::{lp_bytes, DeserializeError};

use crate::error::{Error, Result};
use crate::model::{GapKind, MsgId, NamespaceId, Retention, SequenceNumber, TenantId};

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

const TYPE_DELIVER: u8 = 0x01;
const TYPE_GAP: u8 = 0x02;
const TYPE_METADATA: u8 = 0x03;

const RETENTION_MASK: u16 = 0x0003;

/// Network identity of the message origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostId {
    pub host: Bytes,
    pub port: u64,
}

impl HostId {
    pub fn new(host: impl Into<Bytes>, port: u64) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        lp_bytes::serialize(&self.host, buf);
        var_u64::serialize(self.port, buf);
    }

    fn decode(buf: &mut &[u8]) -> std::result::Result<Self, DeserializeError> {
        let host = lp_bytes::deserialize(buf)?;
        let port = var_u64::deserialize(buf)?;
        Ok(Self { host, port })
    }
}

/// A record delivery, tower to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDeliver {
    pub tenant: TenantId,
    pub origin: HostId,
    pub namespace: NamespaceId,
    pub topic: Bytes,
    pub prev_seqno: SequenceNumber,
    pub seqno: SequenceNumber,
    pub msg_id: MsgId,
    pub retention: Retention,
    pub payload: Bytes,
}

/// A gap notification, tower to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageGap {
    pub tenant: TenantId,
    pub origin: HostId,
    pub kind: GapKind,
    pub from: SequenceNumber,
    pub to: SequenceNumber,
}

/// Direction of a metadata message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaType {
    Request = 0,
    Response = 1,
}

/// Subscription operation carried per topic in a metadata message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataOp {
    Subscribe = 0,
    Unsubscribe = 1,
}

/// Per-topic entry of a metadata message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub seqno: SequenceNumber,
    pub namespace: NamespaceId,
    pub topic: Bytes,
    pub op: MetadataOp,
}

/// Subscription control, copilot to tower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub tenant: TenantId,
    pub origin: HostId,
    pub meta_type: MetaType,
    pub topics: Vec<TopicMetadata>,
}

/// Any message the core handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Deliver(MessageDeliver),
    Gap(MessageGap),
    Metadata(MessageMetadata),
}

impl Message {
    fn wire_type(&self) -> u8 {
        match self {
            Message::Deliver(_) => TYPE_DELIVER,
            Message::Gap(_) => TYPE_GAP,
            Message::Metadata(_) => TYPE_METADATA,
        }
    }

    fn tenant(&self) -> TenantId {
        match self {
            Message::Deliver(m) => m.tenant,
            Message::Gap(m) => m.tenant,
            Message::Metadata(m) => m.tenant,
        }
    }

    fn origin(&self) -> &HostId {
        match self {
            Message::Deliver(m) => &m.origin,
            Message::Gap(m) => &m.origin,
            Message::Metadata(m) => &m.origin,
        }
    }

    /// Encodes the message, header included.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u8(self.wire_type());
        body.put_u16_le(self.tenant().0);
        self.origin().encode(&mut body);

        match self {
            Message::Deliver(m) => {
                var_u64::serialize(m.prev_seqno, &mut body);
                var_u64::serialize(m.seqno, &mut body);
                body.put_u16_le(m.tenant.0);
                lp_bytes::serialize(&m.topic, &mut body);
                body.put_u16_le(m.retention as u16 & RETENTION_MASK);
                body.put_u16_le(m.namespace.0);
                lp_bytes::serialize(&m.msg_id.0, &mut body);
                body.put_slice(&m.payload);
            }
            Message::Gap(m) => {
                body.put_u8(m.kind as u8);
                var_u64::serialize(m.from, &mut body);
                var_u64::serialize(m.to, &mut body);
            }
            Message::Metadata(m) => {
                body.put_u8(m.meta_type as u8);
                var_u64::serialize(m.topics.len() as u64, &mut body);
                for entry in &m.topics {
                    var_u64::serialize(entry.seqno, &mut body);
                    lp_bytes::serialize(&entry.topic, &mut body);
                    body.put_u16_le(entry.namespace.0);
                    body.put_u8(entry.op as u8);
                }
            }
        }

        let mut out = BytesMut::with_capacity(1 + 4 + body.len());
        out.put_u8(WIRE_VERSION);
        out.put_u32_le(body.len() as u32);
        out.put_slice(&body);
        out.freeze()
    }

    /// Decodes one message from `data`.
    pub fn decode(data: &[u8]) -> Result<Message> {
        let mut buf = data;
        let version = read_u8(&mut buf)?;
        if version != WIRE_VERSION {
            return Err(Error::InvalidArgument(format!(
                "unsupported wire version {}",
                version
            )));
        }
        let msg_size = read_u32_le(&mut buf)? as usize;
        if buf.len() < msg_size {
            return Err(Error::InvalidArgument(format!(
                "message size {} exceeds remaining {} bytes",
                msg_size,
                buf.len()
            )));
        }
        let mut buf = &buf[..msg_size];

        let wire_type = read_u8(&mut buf)?;
        let header_tenant = TenantId(read_u16_le(&mut buf)?);
        let origin = HostId::decode(&mut buf)?;

        match wire_type {
            TYPE_DELIVER => {
                let prev_seqno = var_u64::deserialize(&mut buf)?;
                let seqno = var_u64::deserialize(&mut buf)?;
                let tenant = TenantId(read_u16_le(&mut buf)?);
                let topic = lp_bytes::deserialize(&mut buf)?;
                let flags = read_u16_le(&mut buf)?;
                let retention = Retention::from_wire((flags & RETENTION_MASK) as u8)
                    .ok_or_else(|| Error::InvalidArgument(format!("bad retention in {flags:#x}")))?;
                let namespace = NamespaceId(read_u16_le(&mut buf)?);
                let msg_id = lp_bytes::deserialize(&mut buf)?;
                let msg_id: [u8; 16] = msg_id
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::InvalidArgument("msg_id must be 16 bytes".to_string()))?;
                let payload = Bytes::copy_from_slice(buf);
                Ok(Message::Deliver(MessageDeliver {
                    tenant,
                    origin,
                    namespace,
                    topic,
                    prev_seqno,
                    seqno,
                    msg_id: MsgId(msg_id),
                    retention,
                    payload,
                }))
            }
            TYPE_GAP => {
                let kind = read_u8(&mut buf)?;
                let kind = GapKind::from_wire(kind)
                    .ok_or_else(|| Error::InvalidArgument(format!("bad gap type {}", kind)))?;
                let from = var_u64::deserialize(&mut buf)?;
                let to = var_u64::deserialize(&mut buf)?;
                Ok(Message::Gap(MessageGap {
                    tenant: header_tenant,
                    origin,
                    kind,
                    from,
                    to,
                }))
            }
            TYPE_METADATA => {
                let meta_type = match read_u8(&mut buf)? {
                    0 => MetaType::Request,
                    1 => MetaType::Response,
                    other => {
                        return Err(Error::InvalidArgument(format!("bad meta type {}", other)))
                    }
                };
                let num_topics = var_u64::deserialize(&mut buf)?;
                let mut topics = Vec::with_capacity(num_topics.min(1024) as usize);
                for _ in 0..num_topics {
                    let seqno = var_u64::deserialize(&mut buf)?;
                    let topic = lp_bytes::deserialize(&mut buf)?;
                    let namespace = NamespaceId(read_u16_le(&mut buf)?);
                    let op = match read_u8(&mut buf)? {
                        0 => MetadataOp::Subscribe,
                        1 => MetadataOp::Unsubscribe,
                        other => {
                            return Err(Error::InvalidArgument(format!(
                                "bad subscription type {}",
                                other
                            )))
                        }
                    };
                    topics.push(TopicMetadata {
                        seqno,
                        namespace,
                        topic,
                        op,
                    });
                }
                Ok(Message::Metadata(MessageMetadata {
                    tenant: header_tenant,
                    origin,
                    meta_type,
                    topics,
                }))
            }
            other => Err(Error::InvalidArgument(format!(
                "unknown message type {:#04x}",
                other
            ))),
        }
    }
}

fn read_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.is_empty() {
        return Err(Error::InvalidArgument(
            "unexpected end of message".to_string(),
        ));
    }
    let value = buf[0];
    *buf = &buf[1..];
    Ok(value)
}

fn read_u16_le(buf: &mut &[u8]) -> Result<u16> {
    if buf.len() < 2 {
        return Err(Error::InvalidArgument(
            "unexpected end of message".to_string(),
        ));
    }
    let value = u16::from_le_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Ok(value)
}

fn read_u32_le(buf: &mut &[u8]) -> Result<u32> {
    if buf.len() < 4 {
        return Err(Error::InvalidArgument(
            "unexpected end of message".to_string(),
        ));
    }
    let value = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(value)
}
