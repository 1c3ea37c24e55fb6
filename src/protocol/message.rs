//! Protocol message definitions
//!
//! Every datagram carries one [`Envelope`]: the shared header plus a
//! [`Message`] body. Bodies only encode their own fields.

use bytes::{Buf, BufMut};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::codec::{need, CodecError};
use super::ids::{get_id, get_opt_id, put_id, put_opt_id};
use super::value::{get_len, get_str, put_str, Value};
use crate::clock::PseudoTime;

/// Property map carried by Update and History
pub type PropertyMap = BTreeMap<String, Value>;

/// Control text that stops every peer it reaches
pub const KILL: &str = "kill";

/// Control text that makes every peer print its state
pub const INFO: &str = "info";

/// The kinds of message a command code can select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Discovery,
    Broadcast,
    Direct,
    Update,
    Delete,
    Get,
    Value,
    Set,
    BeginTx,
    Commit,
    Committed,
    Ack,
    GetHistory,
    History,
    Inventory,
}

impl MessageKind {
    /// The command code written when sending this kind
    pub fn code(self) -> i32 {
        match self {
            MessageKind::Discovery => 0,
            MessageKind::Broadcast => 2,
            MessageKind::Direct => 3,
            MessageKind::Update => 4,
            MessageKind::Delete => 5,
            MessageKind::Get => 7,
            MessageKind::Value => 8,
            MessageKind::Set => 9,
            MessageKind::BeginTx => 10,
            MessageKind::Commit => 12,
            MessageKind::Committed => 13,
            MessageKind::Ack => 14,
            MessageKind::GetHistory => 15,
            MessageKind::History => 16,
            MessageKind::Inventory => 17,
        }
    }
}

/// An object and the device that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub id: Uuid,
    pub owner: Uuid,
}

impl ObjectRef {
    pub fn new(id: Uuid, owner: Uuid) -> Self {
        Self { id, owner }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        put_id(buf, &self.id);
        put_id(buf, &self.owner);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            id: get_id(buf)?,
            owner: get_id(buf)?,
        })
    }
}

/// Full state of one object as shipped by Update and History
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSnapshot {
    pub id: Uuid,
    /// Originating device
    pub device: Uuid,
    pub object_type: String,
    pub user: Uuid,
    pub created: PseudoTime,
    pub last_modified: PseudoTime,
    pub data: PropertyMap,
}

impl ObjectSnapshot {
    fn encode(&self, buf: &mut impl BufMut) {
        put_id(buf, &self.id);
        put_id(buf, &self.device);
        put_str(buf, &self.object_type);
        put_id(buf, &self.user);
        self.created.encode(buf);
        self.last_modified.encode(buf);
        encode_properties(buf, &self.data);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            id: get_id(buf)?,
            device: get_id(buf)?,
            object_type: get_str(buf)?,
            user: get_id(buf)?,
            created: PseudoTime::decode(buf)?,
            last_modified: PseudoTime::decode(buf)?,
            data: decode_properties(buf)?,
        })
    }
}

/// All protocol message bodies
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Presence announcement carrying a digest of the sender's inventory
    Discovery { hash: i64, is_reply: bool },

    /// Control-plane text delivered to every peer
    Broadcast { text: String },

    /// Text for a single peer
    Direct { recipient: Uuid, text: String },

    /// Push of a full object
    Update(ObjectSnapshot),

    /// Tombstone an object
    Delete { object: Uuid, time: PseudoTime },

    /// Read one property from the owner
    Get {
        object: ObjectRef,
        time: PseudoTime,
        tx: Option<Uuid>,
        key: String,
    },

    /// Reply to a Get
    Value {
        request: Uuid,
        recipient: Uuid,
        value: Value,
    },

    /// Write one property
    Set {
        object: ObjectRef,
        time: PseudoTime,
        tx: Option<Uuid>,
        key: String,
        value: Value,
    },

    /// Ask the owner to open a transaction
    BeginTx { recipient: Uuid, timeout_ms: i64 },

    /// Ask the owner to finalize a transaction
    Commit { recipient: Uuid, tx: Uuid },

    /// A transaction has been finalized
    Committed { recipient: Uuid, tx: Uuid },

    /// Generic acknowledgement with optional payload
    Ack {
        recipient: Uuid,
        request: Uuid,
        data: Value,
    },

    /// Pull an object snapshot if the holder's copy predates `instant`
    GetHistory {
        recipient: Uuid,
        object: Uuid,
        instant: PseudoTime,
    },

    /// Reply to GetHistory
    History {
        recipient: Uuid,
        snapshot: ObjectSnapshot,
    },

    /// Advertise the version of an object held by `owner`
    Inventory {
        object: Uuid,
        owner: Uuid,
        last_modified: PseudoTime,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Discovery { .. } => MessageKind::Discovery,
            Message::Broadcast { .. } => MessageKind::Broadcast,
            Message::Direct { .. } => MessageKind::Direct,
            Message::Update(_) => MessageKind::Update,
            Message::Delete { .. } => MessageKind::Delete,
            Message::Get { .. } => MessageKind::Get,
            Message::Value { .. } => MessageKind::Value,
            Message::Set { .. } => MessageKind::Set,
            Message::BeginTx { .. } => MessageKind::BeginTx,
            Message::Commit { .. } => MessageKind::Commit,
            Message::Committed { .. } => MessageKind::Committed,
            Message::Ack { .. } => MessageKind::Ack,
            Message::GetHistory { .. } => MessageKind::GetHistory,
            Message::History { .. } => MessageKind::History,
            Message::Inventory { .. } => MessageKind::Inventory,
        }
    }

    /// The single peer this message is addressed to, if any
    pub fn recipient(&self) -> Option<Uuid> {
        match self {
            Message::Direct { recipient, .. }
            | Message::Value { recipient, .. }
            | Message::BeginTx { recipient, .. }
            | Message::Commit { recipient, .. }
            | Message::Committed { recipient, .. }
            | Message::Ack { recipient, .. }
            | Message::GetHistory { recipient, .. }
            | Message::History { recipient, .. } => Some(*recipient),
            _ => None,
        }
    }

    /// Append this message's own fields
    pub fn encode_body(&self, buf: &mut impl BufMut) {
        match self {
            Message::Discovery { hash, is_reply } => {
                buf.put_i64(*hash);
                buf.put_u8(u8::from(*is_reply));
            }
            Message::Broadcast { text } => put_str(buf, text),
            Message::Direct { recipient, text } => {
                put_id(buf, recipient);
                put_str(buf, text);
            }
            Message::Update(snapshot) => snapshot.encode(buf),
            Message::Delete { object, time } => {
                put_id(buf, object);
                time.encode(buf);
            }
            Message::Get {
                object,
                time,
                tx,
                key,
            } => {
                object.encode(buf);
                time.encode(buf);
                put_opt_id(buf, tx.as_ref());
                put_str(buf, key);
            }
            Message::Value {
                request,
                recipient,
                value,
            } => {
                put_id(buf, request);
                put_id(buf, recipient);
                value.encode(buf);
            }
            Message::Set {
                object,
                time,
                tx,
                key,
                value,
            } => {
                object.encode(buf);
                time.encode(buf);
                put_opt_id(buf, tx.as_ref());
                put_str(buf, key);
                value.encode(buf);
            }
            Message::BeginTx {
                recipient,
                timeout_ms,
            } => {
                put_id(buf, recipient);
                buf.put_i64(*timeout_ms);
            }
            Message::Commit { recipient, tx } | Message::Committed { recipient, tx } => {
                put_id(buf, recipient);
                put_id(buf, tx);
            }
            Message::Ack {
                recipient,
                request,
                data,
            } => {
                put_id(buf, recipient);
                put_id(buf, request);
                data.encode(buf);
            }
            Message::GetHistory {
                recipient,
                object,
                instant,
            } => {
                put_id(buf, recipient);
                put_id(buf, object);
                instant.encode(buf);
            }
            Message::History {
                recipient,
                snapshot,
            } => {
                put_id(buf, recipient);
                snapshot.encode(buf);
            }
            Message::Inventory {
                object,
                owner,
                last_modified,
            } => {
                put_id(buf, object);
                put_id(buf, owner);
                last_modified.encode(buf);
            }
        }
    }

    /// Read the fields of a message of the given kind
    pub fn decode_body(kind: MessageKind, buf: &mut impl Buf) -> Result<Self, CodecError> {
        let message = match kind {
            MessageKind::Discovery => {
                need(buf, 9)?;
                Message::Discovery {
                    hash: buf.get_i64(),
                    is_reply: buf.get_u8() != 0,
                }
            }
            MessageKind::Broadcast => Message::Broadcast {
                text: get_str(buf)?,
            },
            MessageKind::Direct => Message::Direct {
                recipient: get_id(buf)?,
                text: get_str(buf)?,
            },
            MessageKind::Update => Message::Update(ObjectSnapshot::decode(buf)?),
            MessageKind::Delete => Message::Delete {
                object: get_id(buf)?,
                time: PseudoTime::decode(buf)?,
            },
            MessageKind::Get => Message::Get {
                object: ObjectRef::decode(buf)?,
                time: PseudoTime::decode(buf)?,
                tx: get_opt_id(buf)?,
                key: get_str(buf)?,
            },
            MessageKind::Value => Message::Value {
                request: get_id(buf)?,
                recipient: get_id(buf)?,
                value: Value::decode(buf)?,
            },
            MessageKind::Set => Message::Set {
                object: ObjectRef::decode(buf)?,
                time: PseudoTime::decode(buf)?,
                tx: get_opt_id(buf)?,
                key: get_str(buf)?,
                value: Value::decode(buf)?,
            },
            MessageKind::BeginTx => {
                let recipient = get_id(buf)?;
                need(buf, 8)?;
                Message::BeginTx {
                    recipient,
                    timeout_ms: buf.get_i64(),
                }
            }
            MessageKind::Commit => Message::Commit {
                recipient: get_id(buf)?,
                tx: get_id(buf)?,
            },
            MessageKind::Committed => Message::Committed {
                recipient: get_id(buf)?,
                tx: get_id(buf)?,
            },
            MessageKind::Ack => Message::Ack {
                recipient: get_id(buf)?,
                request: get_id(buf)?,
                data: Value::decode(buf)?,
            },
            MessageKind::GetHistory => Message::GetHistory {
                recipient: get_id(buf)?,
                object: get_id(buf)?,
                instant: PseudoTime::decode(buf)?,
            },
            MessageKind::History => Message::History {
                recipient: get_id(buf)?,
                snapshot: ObjectSnapshot::decode(buf)?,
            },
            MessageKind::Inventory => Message::Inventory {
                object: get_id(buf)?,
                owner: get_id(buf)?,
                last_modified: PseudoTime::decode(buf)?,
            },
        };
        Ok(message)
    }
}

/// A message with its shared header
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Command code as sent on the wire
    pub command: i32,
    /// Random per-message id, used for correlation and dedup
    pub id: Uuid,
    pub sender: Uuid,
    pub timestamp: PseudoTime,
    pub message: Message,
}

impl Envelope {
    /// Wrap a message with a fresh id
    pub fn new(sender: Uuid, timestamp: PseudoTime, message: Message) -> Self {
        Self {
            command: message.kind().code(),
            id: Uuid::new_v4(),
            sender,
            timestamp,
            message,
        }
    }
}

fn encode_properties(buf: &mut impl BufMut, data: &PropertyMap) {
    buf.put_i32(data.len() as i32);
    for (key, value) in data {
        put_str(buf, key);
        value.encode(buf);
    }
}

fn decode_properties(buf: &mut impl Buf) -> Result<PropertyMap, CodecError> {
    let count = get_len(buf)?;
    // Key length prefix plus value tag at minimum.
    if count > buf.remaining() / 8 {
        return Err(CodecError::Incomplete);
    }
    let mut data = PropertyMap::new();
    for _ in 0..count {
        let key = get_str(buf)?;
        let value = Value::decode(buf)?;
        data.insert(key, value);
    }
    Ok(data)
}
