//! parley-core: packet framing, session messages and configuration.
//! All other Parley crates depend on this one.

pub mod config;
pub mod message;
pub mod wire;

pub use message::{
    DeliveryClass, File, FileAction, Identity, IdentityAction, Message, MessageError, Text,
    UserId, BROADCAST,
};
pub use wire::{FramingError, Packet, PacketKind};
