//! # vici
//!
//! An async client for strongSwan's VICI (Versatile IKE Configuration
//! Interface) management protocol: the length-framed binary transport, the
//! recursive [`Message`] codec, and a [`Session`] that multiplexes a
//! command channel and an event listener over two connections to the same
//! daemon socket.

mod command;
pub mod error;
mod event;
mod latch;
pub mod message;
pub mod packet;
mod session;
pub mod transport;

pub use error::{Error, Result};
pub use event::EventRecord;
pub use message::{Message, Value};
pub use session::{Session, SessionConfig};
pub use transport::Transport;

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
