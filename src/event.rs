//! The event listener: an independent reader loop over its own `Transport`,
//! a subscription set, and a buffered FIFO of delivered events (spec §4.4).

use crate::error::{Error, Result};
use crate::latch::Latch;
use crate::message::Message;
use crate::packet::{Packet, PacketType};
use crate::transport::{read_frame, write_frame, MAX_PACKET_LEN};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One item delivered by [`EventListener::next_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    /// A decoded `EVENT` packet.
    Event { name: String, message: Message },
    /// `n` buffered events were dropped because the bound was exceeded
    /// (spec §4.4, "defensive use").
    LostEvents(u64),
}

enum Confirmation {
    Confirmed,
    Unknown,
}

struct PendingConfirm {
    event_name: String,
    reply: oneshot::Sender<Result<Confirmation>>,
}

/// The queue proper plus a running count of events dropped to stay within
/// `bound`. Kept behind one lock so eviction and loss-counting are a single
/// atomic step — splitting them (e.g. a separate `lost` mutex, or looking
/// for an existing `LostEvents` marker already at the tail) lets the count
/// fall out of sync with what was actually evicted, or lets the marker drift
/// away from the tail as further events are pushed past it.
struct BufferState {
    queue: VecDeque<EventRecord>,
    lost: u64,
}

/// FIFO buffer the reader loop pushes into and `next_event` pops from.
/// `bound: None` (the default) never evicts; `Some(n)` keeps at most `n`
/// events queued, coalescing every eviction since the last successful pop
/// into one `LostEvents` marker delivered ahead of the events that survived.
struct EventBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
    bound: Option<usize>,
    /// Set by [`EventListener::shutdown`]. Checked by `next_event` instead
    /// of relying solely on `JoinHandle::is_finished`, which can still read
    /// as `false` for a moment after `abort()` is requested — this flag is
    /// set synchronously, so a `next_event` call racing a concurrent
    /// `close()` always observes termination rather than waiting on a
    /// `Notify` nothing will ever signal again.
    closed: AtomicBool,
}

impl EventBuffer {
    fn new(bound: Option<usize>) -> Self {
        Self {
            state: Mutex::new(BufferState {
                queue: VecDeque::new(),
                lost: 0,
            }),
            notify: Notify::new(),
            bound,
            closed: AtomicBool::new(false),
        }
    }

    async fn push(&self, record: EventRecord) {
        let mut state = self.state.lock().await;
        if let Some(bound) = self.bound {
            while state.queue.len() >= bound {
                if state.queue.pop_front().is_none() {
                    break;
                }
                state.lost += 1;
            }
        }
        state.queue.push_back(record);
        drop(state);
        self.notify.notify_one();
    }

    /// Pops the oldest record, if any, without waiting. A nonzero loss
    /// count is always surfaced first (and reset), ahead of the events that
    /// survived the eviction that caused it.
    async fn try_pop(&self) -> Option<EventRecord> {
        let mut state = self.state.lock().await;
        if state.lost > 0 {
            let n = state.lost;
            state.lost = 0;
            return Some(EventRecord::LostEvents(n));
        }
        state.queue.pop_front()
    }
}

/// Owns the event transport's two halves (a split read half the reader
/// loop owns exclusively, and a write half guarded by its own mutex for
/// subscribe/unsubscribe calls — spec §5: "single writer ... serializes
/// with itself"), the subscription set, and the event buffer.
pub struct EventListener {
    write_half: Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<Option<PendingConfirm>>>,
    subscriptions: Mutex<HashSet<String>>,
    buffer: Arc<EventBuffer>,
    reader: JoinHandle<()>,
    latch: Latch,
    max_packet_len: usize,
}

impl EventListener {
    pub(crate) fn new(
        stream: UnixStream,
        latch: Latch,
        max_packet_len: usize,
        event_buffer_bound: Option<usize>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let pending = Arc::new(Mutex::new(None));
        let buffer = Arc::new(EventBuffer::new(event_buffer_bound));

        let reader = tokio::spawn(reader_loop(
            read_half,
            pending.clone(),
            buffer.clone(),
            latch.clone(),
            max_packet_len,
        ));

        Self {
            write_half: Mutex::new(write_half),
            pending,
            subscriptions: Mutex::new(HashSet::new()),
            buffer,
            reader,
            latch,
            max_packet_len,
        }
    }

    /// Registers interest in `names`, one `EVENT_REGISTER`/`EVENT_CONFIRM`
    /// handshake per name (spec §4.4).
    pub async fn subscribe(&self, names: &[&str]) -> Result<()> {
        for name in names {
            self.handshake(name, PacketType::EventRegister).await?;
            self.subscriptions.lock().await.insert(name.to_string());
        }
        Ok(())
    }

    /// Withdraws interest in `names`.
    pub async fn unsubscribe(&self, names: &[&str]) -> Result<()> {
        for name in names {
            self.handshake(name, PacketType::EventUnregister).await?;
            self.subscriptions.lock().await.remove(*name);
        }
        Ok(())
    }

    async fn handshake(&self, event_name: &str, kind: PacketType) -> Result<()> {
        self.latch.check()?;
        let mut write_half = self.write_half.lock().await;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            *pending = Some(PendingConfirm {
                event_name: event_name.to_string(),
                reply: tx,
            });
        }

        let packet = match kind {
            PacketType::EventRegister => Packet::event_register(event_name),
            PacketType::EventUnregister => Packet::event_unregister(event_name),
            other => unreachable!("handshake only drives register/unregister, got {other:?}"),
        };

        if let Err(err) = write_frame(&mut *write_half, &packet, self.max_packet_len).await {
            self.latch.set_if_fatal(&err);
            self.pending.lock().await.take();
            return Err(err);
        }
        drop(write_half);

        match rx.await {
            Ok(Ok(Confirmation::Confirmed)) => Ok(()),
            Ok(Ok(Confirmation::Unknown)) => Err(Error::UnknownEvent(event_name.to_string())),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(self.latch.get().unwrap_or(Error::SessionClosed)),
        }
    }

    /// Blocking dequeue of the next buffered record (spec §4.4
    /// "Delivery"). Once the reader loop has terminated and the buffer is
    /// drained, returns the latched terminal error.
    pub async fn next_event(&self) -> Result<EventRecord> {
        loop {
            if let Some(record) = self.buffer.try_pop().await {
                return Ok(record);
            }
            if self.buffer.closed.load(Ordering::SeqCst) || self.reader.is_finished() {
                if let Some(record) = self.buffer.try_pop().await {
                    return Ok(record);
                }
                return Err(self.latch.get().unwrap_or(Error::SessionClosed));
            }
            self.buffer.notify.notified().await;
        }
    }

    /// Stops the reader loop and wakes any call blocked in `next_event`
    /// (spec §4.5: closing the event transport causes the reader loop to
    /// fail out). Idempotent.
    pub(crate) fn shutdown(&self) {
        self.buffer.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
        self.buffer.notify.notify_waiters();
    }
}

async fn reader_loop(
    mut read_half: OwnedReadHalf,
    pending: Arc<Mutex<Option<PendingConfirm>>>,
    buffer: Arc<EventBuffer>,
    latch: Latch,
    max_packet_len: usize,
) {
    loop {
        let packet = match read_frame(&mut read_half, max_packet_len).await {
            Ok(packet) => packet,
            Err(err) => {
                debug!(error = %err, "event reader loop terminating");
                latch.set_if_fatal(&err);
                fail_pending(&pending, err).await;
                return;
            }
        };

        match packet.packet_type {
            PacketType::Event => {
                let name = packet.name.unwrap_or_default();
                let message = packet.message.unwrap_or_default();
                buffer.push(EventRecord::Event { name, message }).await;
            }
            PacketType::EventConfirm => {
                complete_pending(&pending, Ok(Confirmation::Confirmed)).await;
            }
            PacketType::EventUnknown => {
                complete_pending(&pending, Ok(Confirmation::Unknown)).await;
            }
            other => {
                let err = Error::Protocol(format!(
                    "unexpected packet type {other:?} on the event transport"
                ));
                latch.set_if_fatal(&err);
                fail_pending(&pending, err).await;
                return;
            }
        }
    }
}

async fn complete_pending(
    pending: &Arc<Mutex<Option<PendingConfirm>>>,
    result: Result<Confirmation>,
) {
    if let Some(p) = pending.lock().await.take() {
        let _ = p.reply.send(result);
    } else {
        warn!("received an event confirmation with no pending subscribe/unsubscribe call");
    }
}

async fn fail_pending(pending: &Arc<Mutex<Option<PendingConfirm>>>, err: Error) {
    if let Some(p) = pending.lock().await.take() {
        let _ = p.reply.send(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;

    fn listener_pair(bound: Option<usize>) -> (EventListener, Transport) {
        let (client_side, daemon_side) = UnixStream::pair().unwrap();
        let listener = EventListener::new(client_side, Latch::new(), MAX_PACKET_LEN, bound);
        (listener, Transport::new(daemon_side))
    }

    #[tokio::test]
    async fn subscribe_then_receive_event() {
        let (listener, mut daemon) = listener_pair(None);

        let daemon_task = tokio::spawn(async move {
            let reg = daemon.receive().await.unwrap();
            assert_eq!(reg.packet_type, PacketType::EventRegister);
            assert_eq!(reg.name.as_deref(), Some("log"));
            daemon.send(&Packet::event_confirm()).await.unwrap();

            let mut msg = Message::new();
            msg.insert_scalar("msg", b"hello".to_vec()).unwrap();
            daemon.send(&Packet::event("log", msg)).await.unwrap();
            daemon
        });

        listener.subscribe(&["log"]).await.unwrap();
        let record = listener.next_event().await.unwrap();
        match record {
            EventRecord::Event { name, message } => {
                assert_eq!(name, "log");
                assert_eq!(message.get_scalar("msg"), Some(&b"hello"[..]));
            }
            other => panic!("unexpected record: {other:?}"),
        }
        daemon_task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_event_on_subscribe_leaves_set_unchanged() {
        let (listener, mut daemon) = listener_pair(None);

        let daemon_task = tokio::spawn(async move {
            let reg = daemon.receive().await.unwrap();
            assert_eq!(reg.name.as_deref(), Some("no-such-event"));
            daemon.send(&Packet::event_unknown()).await.unwrap();
        });

        let err = listener.subscribe(&["no-such-event"]).await.unwrap_err();
        assert!(matches!(err, Error::UnknownEvent(name) if name == "no-such-event"));
        assert!(listener.subscriptions.lock().await.is_empty());
        daemon_task.await.unwrap();
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_marks_loss() {
        let (listener, mut daemon) = listener_pair(Some(2));

        let daemon_task = tokio::spawn(async move {
            let reg = daemon.receive().await.unwrap();
            daemon.send(&Packet::event_confirm()).await.unwrap();
            let _ = reg;
            for i in 0..4 {
                let mut msg = Message::new();
                msg.insert_scalar("i", i.to_string().into_bytes()).unwrap();
                daemon.send(&Packet::event("log", msg)).await.unwrap();
            }
        });

        listener.subscribe(&["log"]).await.unwrap();
        daemon_task.await.unwrap();

        // Give the reader loop a beat to drain all four sends into the
        // bounded buffer before we start popping.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let first = listener.next_event().await.unwrap();
        assert!(matches!(first, EventRecord::LostEvents(2)));

        for expected in ["2", "3"] {
            match listener.next_event().await.unwrap() {
                EventRecord::Event { message, .. } => {
                    assert_eq!(message.get_scalar("i"), Some(expected.as_bytes()));
                }
                other => panic!("unexpected record: {other:?}"),
            }
        }
    }
}
