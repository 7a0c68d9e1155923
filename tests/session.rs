//! End-to-end `Session` tests against a fake VICI daemon listening on a
//! real Unix domain socket, covering event independence from an in-flight
//! streamed command and error latching across both transports.

use futures_util::{pin_mut, StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use vici::message::Message;
use vici::packet::{Packet, PacketType};
use vici::{Error, EventRecord, Session, SessionConfig, Transport};

fn socket_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("vici-test-{tag}-{}.sock", std::process::id()))
}

async fn accept_both(listener: &UnixListener) -> (UnixStream, UnixStream) {
    let (first, _) = listener.accept().await.unwrap();
    let (second, _) = listener.accept().await.unwrap();
    (first, second)
}

#[tokio::test]
async fn event_independence_during_streamed_command() {
    let path = socket_path("independence");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let daemon = tokio::spawn(async move {
        // `Session::connect` opens the command connection first, then the
        // event connection, in that order.
        let (command_raw, event_raw) = accept_both(&listener).await;
        let mut command = Transport::new(command_raw);
        let mut event = Transport::new(event_raw);

        // The independent subscription arrives on the event transport.
        let reg = event.receive().await.unwrap();
        assert_eq!(reg.packet_type, PacketType::EventRegister);
        assert_eq!(reg.name.as_deref(), Some("log"));
        event.send(&Packet::event_confirm()).await.unwrap();

        // The streamed command's own register/request happens on the
        // command transport, independently of the event transport above.
        let stream_reg = command.receive().await.unwrap();
        assert_eq!(stream_reg.packet_type, PacketType::EventRegister);
        assert_eq!(stream_reg.name.as_deref(), Some("list-sa"));
        command.send(&Packet::event_confirm()).await.unwrap();

        let req = command.receive().await.unwrap();
        assert_eq!(req.name.as_deref(), Some("list-sas"));

        // While the streamed command is still open, an unrelated event
        // arrives on the independent event transport.
        let mut log_msg = Message::new();
        log_msg.insert_scalar("line", b"hello".to_vec()).unwrap();
        event.send(&Packet::event("log", log_msg)).await.unwrap();

        let mut sa = Message::new();
        sa.insert_scalar("name", b"conn0".to_vec()).unwrap();
        command.send(&Packet::event("list-sa", sa)).await.unwrap();
        command
            .send(&Packet::cmd_response(Message::new()))
            .await
            .unwrap();

        let unreg = command.receive().await.unwrap();
        assert_eq!(unreg.packet_type, PacketType::EventUnregister);
        command.send(&Packet::event_confirm()).await.unwrap();

        let unreg = event.receive().await.unwrap();
        assert_eq!(unreg.packet_type, PacketType::EventUnregister);
        event.send(&Packet::event_confirm()).await.unwrap();
    });

    let session = Session::connect(&path, SessionConfig::default())
        .await
        .unwrap();
    session.subscribe(&["log"]).await.unwrap();

    let stream = session.streamed_request("list-sas", "list-sa", Message::new());
    pin_mut!(stream);

    // The `log` event delivered mid-stream must be observable without
    // waiting for the streamed command to finish.
    let log_event = session.next_event().await.unwrap();
    match log_event {
        EventRecord::Event { name, message } => {
            assert_eq!(name, "log");
            assert_eq!(message.get_scalar("line"), Some(&b"hello"[..]));
        }
        other => panic!("unexpected record: {other:?}"),
    }

    let sas: Vec<_> = stream.collect().await;
    assert_eq!(sas.len(), 1);
    assert_eq!(
        sas[0].as_ref().unwrap().get_scalar("name"),
        Some(&b"conn0"[..])
    );

    session.unsubscribe(&["log"]).await.unwrap();
    daemon.await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn error_latches_across_both_transports() {
    let path = socket_path("latch");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let daemon = tokio::spawn(async move {
        let (command_raw, event_raw) = accept_both(&listener).await;
        // Drop both connections immediately to force a transport error on
        // the client's next read.
        drop(command_raw);
        drop(event_raw);
    });

    let session = Session::connect(&path, SessionConfig::default())
        .await
        .unwrap();
    daemon.await.unwrap();

    // Give the event reader loop a moment to observe the peer closing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let event_err = session.next_event().await.unwrap_err();
    assert!(matches!(event_err, Error::Transport(_)));

    let request_err = session
        .request("version", Message::new())
        .await
        .unwrap_err();
    assert!(matches!(request_err, Error::Transport(_)));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn operations_after_close_fail_with_session_closed() {
    let path = socket_path("closed");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let daemon = tokio::spawn(async move {
        let (_command_raw, _event_raw) = accept_both(&listener).await;
        // Keep both ends open; the client closes the session itself.
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let session = Session::connect(&path, SessionConfig::default())
        .await
        .unwrap();
    session.close();

    let request_err = session
        .request("version", Message::new())
        .await
        .unwrap_err();
    assert!(matches!(request_err, Error::SessionClosed));

    let event_err = session.next_event().await.unwrap_err();
    assert!(matches!(event_err, Error::SessionClosed));

    daemon.await.unwrap();
    let _ = std::fs::remove_file(&path);
}
