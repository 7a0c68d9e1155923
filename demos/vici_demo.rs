//! Connects to a running `charon` daemon, issues a `version` request,
//! subscribes to `log` events for a few seconds, and streams the current
//! set of IKE_SAs via `list-sas`.
//!
//! ```text
//! cargo run --example vici_demo -- /var/run/charon.vici
//! ```

use futures_util::{pin_mut, StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use vici::{EventRecord, Message, Session, SessionConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let endpoint: PathBuf = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/run/charon.vici"));

    info!(endpoint = %endpoint.display(), "connecting to charon");
    let session = Session::connect(&endpoint, SessionConfig::default()).await?;

    let version = session.request("version", Message::new()).await?;
    info!(?version, "daemon version");

    session.subscribe(&["log"]).await?;
    let listen_for_logs = async {
        loop {
            match session.next_event().await {
                Ok(EventRecord::Event { name, message }) => {
                    info!(event = name, ?message, "received event");
                }
                Ok(EventRecord::LostEvents(n)) => {
                    warn!(dropped = n, "event buffer overflowed");
                }
                Err(err) => {
                    warn!(error = %err, "event stream ended");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = listen_for_logs => {}
        _ = tokio::time::sleep(Duration::from_secs(3)) => {}
    }
    session.unsubscribe(&["log"]).await?;

    let stream = session.streamed_request("list-sas", "list-sa", Message::new());
    pin_mut!(stream);
    while let Some(sa) = stream.next().await {
        match sa {
            Ok(message) => info!(?message, "IKE_SA"),
            Err(err) => {
                warn!(error = %err, "list-sas failed");
                break;
            }
        }
    }

    session.close();
    Ok(())
}
