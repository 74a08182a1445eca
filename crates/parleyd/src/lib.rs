//! parleyd: the Parley instant-messaging server.
//!
//! Exposed as a library so the server can be composed in-process; the
//! `parleyd` binary is a thin wrapper around [`Server`].

pub mod egress;
pub mod liveness;
pub mod reactor;
pub mod router;
pub mod server;
pub mod tracker;

pub use server::Server;
