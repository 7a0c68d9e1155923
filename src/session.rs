//! The top-level handle: two Unix domain socket connections (command and
//! event) sharing one fatal-error latch (spec §4, §5, §7).

use crate::command::CommandChannel;
use crate::error::Result;
use crate::event::{EventListener, EventRecord};
use crate::latch::Latch;
use crate::message::Message;
use crate::transport::{Transport, MAX_PACKET_LEN};
use futures_core::Stream;
use std::path::Path;
use tokio::net::UnixStream;
use tracing::debug;

/// Tunable limits for a [`Session`], mirroring strongSwan's own defaults.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest frame either transport will accept before erroring (spec §4.1).
    pub max_packet_len: usize,
    /// Cap on the event buffer's depth. `None` means unbounded; `Some(n)`
    /// evicts the oldest entry and coalesces a [`EventRecord::LostEvents`]
    /// marker once more than `n` events are outstanding (spec §4.4).
    pub event_buffer_bound: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_packet_len: MAX_PACKET_LEN,
            event_buffer_bound: None,
        }
    }
}

/// A connected VICI client: one command channel, one event listener, one
/// shared latch. Cheaply `Clone`-free — wrap in an `Arc` if you need to
/// share a `Session` across tasks, the way the underlying channels already
/// share their mutexes internally.
pub struct Session {
    command: CommandChannel,
    event: EventListener,
    latch: Latch,
}

impl Session {
    /// Opens the command and event connections to `endpoint` (a VICI Unix
    /// domain socket, conventionally `/var/run/charon.vici`). If the event
    /// connection fails, the command connection is dropped before the error
    /// propagates, leaving no half-open `Session` behind.
    pub async fn connect(endpoint: impl AsRef<Path>, config: SessionConfig) -> Result<Self> {
        let endpoint = endpoint.as_ref();
        let latch = Latch::new();

        let command_stream = UnixStream::connect(endpoint)
            .await
            .map_err(crate::error::Error::transport)?;

        let event_stream = match UnixStream::connect(endpoint).await {
            Ok(stream) => stream,
            Err(err) => {
                drop(command_stream);
                return Err(crate::error::Error::transport(err));
            }
        };

        debug!(endpoint = %endpoint.display(), "vici session connected");

        let command = CommandChannel::new(
            Transport::with_max_packet_len(command_stream, config.max_packet_len),
            latch.clone(),
        );
        let event = EventListener::new(
            event_stream,
            latch.clone(),
            config.max_packet_len,
            config.event_buffer_bound,
        );

        Ok(Self { command, event, latch })
    }

    /// Sends a named command and returns its decoded reply.
    pub async fn request(&self, name: &str, message: Message) -> Result<Message> {
        self.command.request(name, message).await
    }

    /// Sends a named command whose reply is a run of `event_name` events
    /// followed by a final response, yielded as a stream. The command
    /// channel is held for the stream's entire lifetime (spec §4.3).
    pub fn streamed_request<'a>(
        &'a self,
        name: &'a str,
        event_name: &'a str,
        message: Message,
    ) -> impl Stream<Item = Result<Message>> + 'a {
        self.command.streamed_request(name, event_name, message)
    }

    /// Registers interest in one or more event names.
    pub async fn subscribe(&self, names: &[&str]) -> Result<()> {
        self.event.subscribe(names).await
    }

    /// Withdraws interest in one or more event names.
    pub async fn unsubscribe(&self, names: &[&str]) -> Result<()> {
        self.event.unsubscribe(names).await
    }

    /// Blocks until the next subscribed event (or loss marker) is available.
    pub async fn next_event(&self) -> Result<EventRecord> {
        self.event.next_event().await
    }

    /// Shuts down both connections. Latches `SessionClosed` first so that
    /// any command, subscribe/unsubscribe, or `next_event` call issued from
    /// here on fails fast (spec §7); then stops the event reader loop (so it
    /// observes termination rather than blocking forever on its socket) and
    /// releases the command transport when the last command finishes using
    /// it. Idempotent: closing twice just re-latches the same error.
    pub fn close(&self) {
        self.latch.close();
        self.event.shutdown();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
