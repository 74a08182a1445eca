//! Session messages carried inside framed packets.
//!
//! Each packet type has a fixed-capacity big-endian record. Text fields are
//! NUL-padded on the wire; trailing NULs are stripped when decoding, and
//! anything longer than a field's capacity is rejected at encode time.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::wire::{FramingError, Packet, PacketKind};

/// User identifier. `0` addresses "everyone" / the server.
pub type UserId = u32;

/// Receiver id meaning "no specific recipient".
pub const BROADCAST: UserId = 0;

pub const USERNAME_CAP: usize = 32;
pub const PASSWORD_CAP: usize = 32;
pub const CONTENT_CAP: usize = 512;
pub const FILENAME_CAP: usize = 256;

// ── Wire records ─────────────────────────────────────────────────────────────

/// Payload of a type 1 packet. Wire size: 69 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct IdentityRecord {
    pub uid: U32<BigEndian>,
    pub username: [u8; USERNAME_CAP],
    pub password: [u8; PASSWORD_CAP],
    pub action: u8,
}

/// Payload of a type 2 packet. Wire size: 521 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct TextRecord {
    pub sender: U32<BigEndian>,
    pub receiver: U32<BigEndian>,
    pub content: [u8; CONTENT_CAP],
    pub class: u8,
}

/// Payload of a type 3 packet. Wire size: 281 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FileRecord {
    pub sender: U32<BigEndian>,
    pub receiver: U32<BigEndian>,
    pub filename: [u8; FILENAME_CAP],
    pub file_size: U64<BigEndian>,
    pub offset: U64<BigEndian>,
    pub action: u8,
}

assert_eq_size!(IdentityRecord, [u8; 69]);
assert_eq_size!(TextRecord, [u8; 521]);
assert_eq_size!(FileRecord, [u8; 281]);

// ── Tags ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IdentityAction {
    Heartbeat = 0,
    Login = 1,
    Logout = 2,
    Register = 3,
}

impl TryFrom<u8> for IdentityAction {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Heartbeat),
            1 => Ok(Self::Login),
            2 => Ok(Self::Logout),
            3 => Ok(Self::Register),
            other => Err(MessageError::BadTag {
                field: "identity action",
                value: other,
            }),
        }
    }
}

/// Whether a text is addressed to one user or to everyone online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryClass {
    Private = 0,
    Group = 1,
}

impl TryFrom<u8> for DeliveryClass {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Private),
            1 => Ok(Self::Group),
            other => Err(MessageError::BadTag {
                field: "delivery class",
                value: other,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileAction {
    Upload = 0,
    Download = 1,
}

impl TryFrom<u8> for FileAction {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Upload),
            1 => Ok(Self::Download),
            other => Err(MessageError::BadTag {
                field: "file action",
                value: other,
            }),
        }
    }
}

// ── Typed messages ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: UserId,
    pub credentials: Option<Credentials>,
    pub action: IdentityAction,
}

impl Identity {
    pub fn new(uid: UserId, action: IdentityAction) -> Self {
        Self {
            uid,
            credentials: None,
            action,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, MessageError> {
        let creds = Credentials {
            username: username.into(),
            password: password.into(),
        };
        check_field("username", creds.username.as_bytes(), USERNAME_CAP)?;
        check_field("password", creds.password.as_bytes(), PASSWORD_CAP)?;
        self.credentials = Some(creds);
        Ok(self)
    }

    fn to_record(&self) -> Result<IdentityRecord, MessageError> {
        let (user, pass) = match &self.credentials {
            Some(c) => (c.username.as_bytes(), c.password.as_bytes()),
            None => (&[][..], &[][..]),
        };
        Ok(IdentityRecord {
            uid: U32::new(self.uid),
            username: pad("username", user)?,
            password: pad("password", pass)?,
            action: self.action as u8,
        })
    }

    fn from_record(rec: &IdentityRecord) -> Result<Self, MessageError> {
        let username = utf8("username", &rec.username)?;
        let password = utf8("password", &rec.password)?;
        let credentials = if username.is_empty() && password.is_empty() {
            None
        } else {
            Some(Credentials { username, password })
        };
        Ok(Self {
            uid: rec.uid.get(),
            credentials,
            action: IdentityAction::try_from(rec.action)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text {
    pub sender: UserId,
    pub receiver: UserId,
    pub content: Bytes,
    pub class: DeliveryClass,
}

impl Text {
    pub fn new(
        sender: UserId,
        receiver: UserId,
        content: impl Into<Bytes>,
        class: DeliveryClass,
    ) -> Result<Self, MessageError> {
        let content = content.into();
        check_field("content", &content, CONTENT_CAP)?;
        Ok(Self {
            sender,
            receiver,
            content,
            class,
        })
    }

    /// A server-originated text (sender 0). Overlong notices are cut at the
    /// last character boundary that fits.
    pub fn notice(receiver: UserId, class: DeliveryClass, body: &str) -> Self {
        let body = body.trim_end_matches('\0');
        let mut end = body.len().min(CONTENT_CAP);
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            sender: BROADCAST,
            receiver,
            content: Bytes::copy_from_slice(&body.as_bytes()[..end]),
            class,
        }
    }

    /// Content as text, replacing invalid UTF-8.
    pub fn content_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    fn to_record(&self) -> Result<TextRecord, MessageError> {
        Ok(TextRecord {
            sender: U32::new(self.sender),
            receiver: U32::new(self.receiver),
            content: pad("content", &self.content)?,
            class: self.class as u8,
        })
    }

    fn from_record(rec: &TextRecord) -> Result<Self, MessageError> {
        Ok(Self {
            sender: rec.sender.get(),
            receiver: rec.receiver.get(),
            content: Bytes::copy_from_slice(trim_nul(&rec.content)),
            class: DeliveryClass::try_from(rec.class)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub sender: UserId,
    pub receiver: UserId,
    pub filename: String,
    pub file_size: u64,
    pub offset: u64,
    pub action: FileAction,
}

impl File {
    pub fn new(
        sender: UserId,
        filename: impl Into<String>,
        file_size: u64,
        action: FileAction,
    ) -> Result<Self, MessageError> {
        let filename = filename.into();
        check_field("filename", filename.as_bytes(), FILENAME_CAP)?;
        Ok(Self {
            sender,
            receiver: BROADCAST,
            filename,
            file_size,
            offset: 0,
            action,
        })
    }

    pub fn at_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    fn to_record(&self) -> Result<FileRecord, MessageError> {
        Ok(FileRecord {
            sender: U32::new(self.sender),
            receiver: U32::new(self.receiver),
            filename: pad("filename", self.filename.as_bytes())?,
            file_size: U64::new(self.file_size),
            offset: U64::new(self.offset),
            action: self.action as u8,
        })
    }

    fn from_record(rec: &FileRecord) -> Result<Self, MessageError> {
        Ok(Self {
            sender: rec.sender.get(),
            receiver: rec.receiver.get(),
            filename: utf8("filename", &rec.filename)?,
            file_size: rec.file_size.get(),
            offset: rec.offset.get(),
            action: FileAction::try_from(rec.action)?,
        })
    }
}

/// Tagged union over the three payload variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Identity(Identity),
    Text(Text),
    File(File),
}

impl Message {
    pub fn kind(&self) -> PacketKind {
        match self {
            Message::Identity(_) => PacketKind::Identity,
            Message::Text(_) => PacketKind::Text,
            Message::File(_) => PacketKind::File,
        }
    }

    /// The originating user.
    pub fn sender(&self) -> UserId {
        match self {
            Message::Identity(m) => m.uid,
            Message::Text(m) => m.sender,
            Message::File(m) => m.sender,
        }
    }

    /// The addressed user, for messages that carry one.
    pub fn receiver(&self) -> Option<UserId> {
        match self {
            Message::Identity(_) => None,
            Message::Text(m) => Some(m.receiver),
            Message::File(m) => Some(m.receiver),
        }
    }

    pub fn to_packet(&self) -> Result<Packet, MessageError> {
        let payload = match self {
            Message::Identity(m) => Bytes::copy_from_slice(m.to_record()?.as_bytes()),
            Message::Text(m) => Bytes::copy_from_slice(m.to_record()?.as_bytes()),
            Message::File(m) => Bytes::copy_from_slice(m.to_record()?.as_bytes()),
        };
        Ok(Packet::new(self.kind(), payload)?)
    }

    /// Encode straight to a wire frame.
    pub fn encode(&self) -> Result<Bytes, MessageError> {
        Ok(self.to_packet()?.encode())
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, MessageError> {
        let kind = PacketKind::try_from(packet.kind).map_err(MessageError::UnknownType)?;
        let payload = &packet.payload[..];
        match kind {
            PacketKind::Identity => {
                let rec = read_record::<IdentityRecord>(kind, payload)?;
                Ok(Message::Identity(Identity::from_record(&rec)?))
            }
            PacketKind::Text => {
                let rec = read_record::<TextRecord>(kind, payload)?;
                Ok(Message::Text(Text::from_record(&rec)?))
            }
            PacketKind::File => {
                let rec = read_record::<FileRecord>(kind, payload)?;
                Ok(Message::File(File::from_record(&rec)?))
            }
        }
    }
}

impl From<Identity> for Message {
    fn from(m: Identity) -> Self {
        Message::Identity(m)
    }
}

impl From<Text> for Message {
    fn from(m: Text) -> Self {
        Message::Text(m)
    }
}

impl From<File> for Message {
    fn from(m: File) -> Self {
        Message::File(m)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn read_record<R: FromBytes>(kind: PacketKind, payload: &[u8]) -> Result<R, MessageError> {
    R::read_from(payload).ok_or(MessageError::BadPayload {
        kind: kind as u16,
        expected: std::mem::size_of::<R>(),
        actual: payload.len(),
    })
}

/// Fields are NUL-padded on the wire, so a value may not end in NUL.
fn check_field(field: &'static str, src: &[u8], max: usize) -> Result<(), MessageError> {
    if src.len() > max {
        return Err(MessageError::FieldTooLong {
            field,
            len: src.len(),
            max,
        });
    }
    if src.last() == Some(&0) {
        return Err(MessageError::TrailingNul(field));
    }
    Ok(())
}

fn pad<const N: usize>(field: &'static str, src: &[u8]) -> Result<[u8; N], MessageError> {
    check_field(field, src, N)?;
    let mut out = [0u8; N];
    out[..src.len()].copy_from_slice(src);
    Ok(out)
}

fn trim_nul(src: &[u8]) -> &[u8] {
    let end = src.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
    &src[..end]
}

fn utf8(field: &'static str, src: &[u8]) -> Result<String, MessageError> {
    String::from_utf8(trim_nul(src).to_vec()).map_err(|_| MessageError::NotUtf8(field))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("unknown packet type: {0}")]
    UnknownType(u16),

    #[error("payload for type {kind} is {actual} bytes, expected {expected}")]
    BadPayload {
        kind: u16,
        expected: usize,
        actual: usize,
    },

    #[error("unknown {field} tag: 0x{value:02x}")]
    BadTag { field: &'static str, value: u8 },

    #[error("{field} is {len} bytes, capacity is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{0} is not valid UTF-8")]
    NotUtf8(&'static str),

    #[error("{0} ends in a NUL byte")]
    TrailingNul(&'static str),

    #[error(transparent)]
    Framing(#[from] FramingError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
