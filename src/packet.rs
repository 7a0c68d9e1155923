//! VICI packet types and the (type, payload) pair each frame carries.
//!
//! Framing itself — the 4-byte big-endian length prefix — is
//! [`crate::transport::Transport`]'s concern; this module only knows about
//! the byte immediately after that prefix (the packet type) and how to
//! interpret what follows it.

use crate::error::{Error, Result};
use crate::message::{self, Message};

/// The eight VICI packet types (spec §6.2), in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    CmdRequest,
    CmdResponse,
    CmdUnknown,
    EventRegister,
    EventUnregister,
    EventConfirm,
    EventUnknown,
    Event,
}

impl PacketType {
    pub(crate) fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => PacketType::CmdRequest,
            1 => PacketType::CmdResponse,
            2 => PacketType::CmdUnknown,
            3 => PacketType::EventRegister,
            4 => PacketType::EventUnregister,
            5 => PacketType::EventConfirm,
            6 => PacketType::EventUnknown,
            7 => PacketType::Event,
            other => {
                return Err(Error::Protocol(format!(
                    "unknown packet type code {other}"
                )))
            }
        })
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            PacketType::CmdRequest => 0,
            PacketType::CmdResponse => 1,
            PacketType::CmdUnknown => 2,
            PacketType::EventRegister => 3,
            PacketType::EventUnregister => 4,
            PacketType::EventConfirm => 5,
            PacketType::EventUnknown => 6,
            PacketType::Event => 7,
        }
    }

    /// Whether this packet type's payload leads with a `name-byte` + name
    /// (spec §6.2: request, register/unregister, and event packets all do).
    fn carries_name(self) -> bool {
        matches!(
            self,
            PacketType::CmdRequest
                | PacketType::EventRegister
                | PacketType::EventUnregister
                | PacketType::Event
        )
    }

    /// Whether this packet type's payload ends with an encoded [`Message`]
    /// (request, response, and event packets).
    fn carries_message(self) -> bool {
        matches!(
            self,
            PacketType::CmdRequest | PacketType::CmdResponse | PacketType::Event
        )
    }
}

/// A decoded (type, name, message) unit, as carried by one frame.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub name: Option<String>,
    pub message: Option<Message>,
}

impl Packet {
    pub fn cmd_request(name: impl Into<String>, message: Message) -> Self {
        Self {
            packet_type: PacketType::CmdRequest,
            name: Some(name.into()),
            message: Some(message),
        }
    }

    pub fn cmd_response(message: Message) -> Self {
        Self {
            packet_type: PacketType::CmdResponse,
            name: None,
            message: Some(message),
        }
    }

    pub fn cmd_unknown() -> Self {
        Self {
            packet_type: PacketType::CmdUnknown,
            name: None,
            message: None,
        }
    }

    pub fn event_register(name: impl Into<String>) -> Self {
        Self {
            packet_type: PacketType::EventRegister,
            name: Some(name.into()),
            message: None,
        }
    }

    pub fn event_unregister(name: impl Into<String>) -> Self {
        Self {
            packet_type: PacketType::EventUnregister,
            name: Some(name.into()),
            message: None,
        }
    }

    pub fn event_confirm() -> Self {
        Self {
            packet_type: PacketType::EventConfirm,
            name: None,
            message: None,
        }
    }

    pub fn event_unknown() -> Self {
        Self {
            packet_type: PacketType::EventUnknown,
            name: None,
            message: None,
        }
    }

    pub fn event(name: impl Into<String>, message: Message) -> Self {
        Self {
            packet_type: PacketType::Event,
            name: Some(name.into()),
            message: Some(message),
        }
    }

    /// Encodes the type byte and payload (everything the 4-byte length
    /// prefix in [`crate::transport::Transport`] will cover besides the
    /// length field itself).
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![self.packet_type.code()];
        if self.packet_type.carries_name() {
            let name = self.name.as_deref().ok_or_else(|| {
                Error::Encode(format!("{:?} packet requires a name", self.packet_type))
            })?;
            if name.len() > message::MAX_KEY_LEN {
                return Err(Error::Encode(format!(
                    "event/command name '{name}' exceeds the {}-byte limit",
                    message::MAX_KEY_LEN
                )));
            }
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
        }
        if self.packet_type.carries_message() {
            let message = self.message.as_ref().ok_or_else(|| {
                Error::Encode(format!(
                    "{:?} packet requires a message payload",
                    self.packet_type
                ))
            })?;
            out.extend_from_slice(&message::encode(message));
        }
        Ok(out)
    }

    /// Decodes a type byte plus payload slice, as handed back by
    /// [`crate::transport::Transport::receive`].
    pub(crate) fn decode(type_byte: u8, payload: &[u8]) -> Result<Self> {
        let packet_type = PacketType::from_code(type_byte)?;
        let mut pos = 0usize;

        let name = if packet_type.carries_name() {
            let len = *payload
                .get(pos)
                .ok_or_else(|| Error::Protocol("packet missing name length byte".into()))?
                as usize;
            pos += 1;
            let bytes = payload.get(pos..pos + len).ok_or_else(|| {
                Error::Protocol("packet name length exceeds remaining payload".into())
            })?;
            pos += len;
            Some(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| Error::Protocol("packet name is not valid UTF-8".into()))?,
            )
        } else {
            None
        };

        let message = if packet_type.carries_message() {
            Some(message::decode(&payload[pos..])?)
        } else {
            None
        };

        Ok(Self {
            packet_type,
            name,
            message,
        })
    }
}
