//! The command channel: a mutex-guarded request/response path over a single
//! `Transport`, including streamed commands whose reply is a run of events
//! terminated by a final response (spec §4.3).

use crate::error::{Error, Result};
use crate::latch::Latch;
use crate::message::Message;
use crate::packet::{Packet, PacketType};
use crate::transport::Transport;
use async_stream::try_stream;
use futures_core::Stream;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub(crate) struct CommandChannel {
    transport: Arc<Mutex<Transport>>,
    latch: Latch,
}

impl CommandChannel {
    pub(crate) fn new(transport: Transport, latch: Latch) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            latch,
        }
    }

    /// Sends a named command and returns its decoded reply (spec §4.3
    /// "request protocol"). Acquires the command mutex for the duration of
    /// the call and releases it on every exit path, including error.
    pub(crate) async fn request(&self, name: &str, message: Message) -> Result<Message> {
        self.latch.check()?;
        let mut transport = self.transport.lock().await;
        debug!(command = name, "acquired command mutex for request");

        let result = run_request(&mut transport, name, message).await;
        drop(transport);

        if let Err(err) = &result {
            self.latch.set_if_fatal(err);
        }
        result
    }

    /// Sends a named command whose reply is a run of events on
    /// `event_name` followed by a final response (spec §4.3 "streamedRequest
    /// protocol"). The command mutex is held for the stream's entire
    /// lifetime — including while the caller is merely deciding whether to
    /// poll for the next item — so other commands block until this one (or
    /// its caller dropping the stream early) finishes.
    pub(crate) fn streamed_request<'a>(
        &'a self,
        name: &'a str,
        event_name: &'a str,
        message: Message,
    ) -> impl Stream<Item = Result<Message>> + 'a {
        self.streamed_request_raw(name, event_name, message)
            .map(move |item| {
                if let Err(err) = &item {
                    self.latch.set_if_fatal(err);
                }
                item
            })
    }

    fn streamed_request_raw<'a>(
        &'a self,
        name: &'a str,
        event_name: &'a str,
        message: Message,
    ) -> impl Stream<Item = Result<Message>> + 'a {
        try_stream! {
            self.latch.check()?;
            let mut transport = self.transport.lock().await;
            debug!(command = name, event = event_name, "acquired command mutex for streamed request");

            transport.send(&Packet::event_register(event_name)).await?;
            match transport.receive().await?.packet_type {
                PacketType::EventConfirm => {}
                PacketType::EventUnknown => Err(Error::EventRegisterFailed(event_name.to_string()))?,
                other => Err(protocol_error("registering", other))?,
            }

            // The daemon now believes we're registered for `event_name`. If
            // this generator is dropped before it reaches the unregister
            // call below — a caller stopping mid-stream is ordinary usage
            // of any `Stream`, not just an error path — this guard's `Drop`
            // spawns a best-effort cleanup so the registration doesn't
            // outlive the stream and corrupt the next command's reply with
            // a stray `EVENT` packet.
            let mut unregister_guard =
                UnregisterGuard::new(Arc::clone(&self.transport), self.latch.clone(), event_name);

            transport.send(&Packet::cmd_request(name, message)).await?;

            loop {
                let packet = transport.receive().await?;
                match packet.packet_type {
                    PacketType::Event if packet.name.as_deref() == Some(event_name) => {
                        yield packet.message.unwrap_or_default();
                    }
                    PacketType::Event => {
                        Err(Error::Protocol(format!(
                            "received event '{}' on the command transport while streaming '{event_name}'",
                            packet.name.unwrap_or_default(),
                        )))?;
                    }
                    PacketType::CmdResponse => break,
                    PacketType::EventUnknown => {
                        // Open question in spec §9: treated as a protocol
                        // error absent a daemon version that defines it.
                        Err(Error::Protocol(format!(
                            "received EVENT_UNKNOWN on the command transport while streaming '{event_name}'"
                        )))?;
                    }
                    other => Err(protocol_error("streaming", other))?,
                }
            }

            unregister(&mut transport, event_name).await?;
            unregister_guard.disarm();
        }
    }
}

async fn run_request(transport: &mut Transport, name: &str, message: Message) -> Result<Message> {
    transport.send(&Packet::cmd_request(name, message)).await?;
    let reply = transport.receive().await?;
    match reply.packet_type {
        PacketType::CmdResponse => Ok(reply.message.unwrap_or_default()),
        PacketType::CmdUnknown => Err(Error::UnknownCommand(name.to_string())),
        other => Err(protocol_error("a command request", other)),
    }
}

/// Sends `EVENT_UNREGISTER` for `event_name` and consumes the matching
/// confirmation. Shared by the streamed-request protocol's own cleanup step
/// and [`UnregisterGuard`]'s best-effort catch-up after an early stream drop.
async fn unregister(transport: &mut Transport, event_name: &str) -> Result<()> {
    transport.send(&Packet::event_unregister(event_name)).await?;
    match transport.receive().await?.packet_type {
        PacketType::EventConfirm => Ok(()),
        PacketType::EventUnknown => {
            warn!(
                event = event_name,
                "daemon rejected unregister for an event it had just confirmed"
            );
            Ok(())
        }
        other => Err(protocol_error("unregistering", other)),
    }
}

/// Tracks whether a streamed command's own `EVENT_UNREGISTER` step actually
/// ran. If the stream is dropped beforehand — the caller abandoning it
/// mid-iteration, or an earlier `?` bailing out of the generator — `Drop`
/// spawns a detached task that reacquires the command mutex (free again by
/// the time it runs, since the stream's own `MutexGuard` is a generator
/// local dropped before this guard) and issues the same unregister the
/// stream would have. A latched session short-circuits the attempt instead
/// of hammering an already-dead transport.
struct UnregisterGuard {
    transport: Arc<Mutex<Transport>>,
    latch: Latch,
    event_name: String,
    disarmed: bool,
}

impl UnregisterGuard {
    fn new(transport: Arc<Mutex<Transport>>, latch: Latch, event_name: &str) -> Self {
        Self {
            transport,
            latch,
            event_name: event_name.to_string(),
            disarmed: false,
        }
    }

    /// Called once the stream has run its own unregister step to completion;
    /// `Drop` becomes a no-op.
    fn disarm(&mut self) {
        self.disarmed = true;
    }
}

impl Drop for UnregisterGuard {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        let transport = self.transport.clone();
        let latch = self.latch.clone();
        let event_name = std::mem::take(&mut self.event_name);
        tokio::spawn(async move {
            if latch.check().is_err() {
                return;
            }
            let mut transport = transport.lock().await;
            if let Err(err) = unregister(&mut transport, &event_name).await {
                warn!(
                    event = event_name,
                    error = %err,
                    "best-effort unregister after early stream drop failed"
                );
                latch.set_if_fatal(&err);
            }
        });
    }
}

fn protocol_error(during: &str, got: PacketType) -> Error {
    Error::Protocol(format!("unexpected packet type {got:?} while {during}"))
}
