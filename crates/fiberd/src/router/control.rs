//! `FiberControl` endpoint.
//!
//! Handlers connect here once and keep the connection open. Every
//! footer-framed message on it becomes a `RouterCommand::HandlerContact`
//! carrying the connection's link token; the router cancels the token to
//! close the connection, which the handler treats as its cue to exit.

use fiber_protocol::{decode, FrameDecoder, FrameReader, HandlerContact, Listener};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::commands::RouterCommand;

/// Accepts control connections until `stop` fires.
pub(super) fn spawn_control_listener(
    listener: Listener,
    sender: mpsc::WeakSender<RouterCommand>,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        info!(endpoint = %listener.name(), "Control endpoint listening");
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let link = stop.child_token();
                        tokio::spawn(serve_control_connection(stream, sender.clone(), link));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept control connection"),
                },
            }
        }
        debug!(endpoint = %listener.name(), "Control endpoint closed");
    });
}

async fn serve_control_connection(
    stream: UnixStream,
    sender: mpsc::WeakSender<RouterCommand>,
    link: CancellationToken,
) {
    let mut reader = FrameReader::new(stream, FrameDecoder::strict());
    let mut received = 0usize;

    loop {
        let frame = tokio::select! {
            _ = link.cancelled() => {
                debug!("Closing control connection");
                break;
            }
            frame = reader.next_frame() => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                if received == 0 {
                    debug!("Empty handshake received");
                } else {
                    debug!("Handler closed its control connection");
                }
                break;
            }
            Err(e) => {
                warn!(error = %e, "Unreadable control message");
                break;
            }
        };
        received += 1;

        let contact = decode(&frame)
            .ok()
            .and_then(|value| serde_json::from_value::<HandlerContact>(value).ok());
        let Some(contact) = contact else {
            warn!("Incorrect JSON format received on control endpoint");
            break;
        };

        let Some(sender) = sender.upgrade() else {
            break;
        };
        let command = RouterCommand::HandlerContact {
            contact,
            link: link.clone(),
        };
        if sender.send(command).await.is_err() {
            break;
        }
    }
}
