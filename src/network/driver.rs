//! Session Driver
//!
//! The per-session unit of execution.
//!
//! ```text
//!   frames ──▶ reader ──┬── hello / result / fault / gone ──▶ Session::dispatch
//!                       └── call ──▶ dispatcher ──admit (in order)──▶ spawn execute
//!   registry removals ──▶ reader ──▶ Session::notify_removed
//! ```
//!
//! Replies are delivered by the reader itself, never queued behind calls,
//! so a handler awaiting a nested remote call cannot starve its own reply.
//! Admission only takes a place in the target's queue, so a busy object
//! holds up the calls queued on it and nothing else.

use std::sync::Arc;

use futures_util::stream::{self, BoxStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, instrument, warn};

use crate::core::ident::{short_session, ObjectAddr};
use crate::network::protocol::{DmcMessage, MethodCall, ProtocolError};
use crate::network::session::{Admission, Session, SessionState};

/// Inbound message stream consumed by [`run_session`].
pub type Frames = BoxStream<'static, Result<DmcMessage, ProtocolError>>;

/// Drive `session` until the peer disconnects or the session closes.
///
/// On exit the session is closed and every object it adopted is
/// unregistered. Returns the retired addresses.
#[instrument(skip_all, fields(session = %short_session(&session.id())))]
pub async fn run_session(session: Arc<Session>, mut inbound: Frames) -> Vec<ObjectAddr> {
    let mut removed = session.registry().subscribe();
    let mut state = session.watch_state();
    let (call_tx, call_rx) = mpsc::unbounded_channel();
    let dispatcher = tokio::spawn(run_dispatcher(session.clone(), call_rx));

    let reason = loop {
        let closed = *state.borrow_and_update() == SessionState::Closed;
        if closed {
            break "session closed".to_string();
        }

        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(msg)) => {
                    #[cfg(feature = "debug-tracing")]
                    tracing::trace!("<- {}", msg.kind());

                    match msg {
                        DmcMessage::Call(call) => {
                            if call_tx.send(call).is_err() {
                                break "dispatcher stopped".to_string();
                            }
                        }
                        other => {
                            let kind = other.kind();
                            if let Err(e) = session.dispatch(other).await {
                                warn!("Dispatch of {} failed: {}", kind, e);
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!("Malformed frame: {}", e);
                    break format!("malformed frame: {}", e);
                }
                None => break "peer disconnected".to_string(),
            },
            addr = removed.recv() => match addr {
                Ok(addr) => session.notify_removed(addr),
                Err(RecvError::Lagged(missed)) => {
                    debug!("Missed {} removal notices, resyncing", missed);
                    session.resync_exposed();
                }
                Err(RecvError::Closed) => break "registry dropped".to_string(),
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break "session dropped".to_string();
                }
            }
        }
    };

    drop(call_tx);
    dispatcher.abort();

    let adopted = session.close(&reason);
    let registry = session.registry();
    let retired: Vec<ObjectAddr> = adopted
        .into_iter()
        .filter(|addr| registry.contains(*addr))
        .filter_map(|addr| registry.unregister(addr.id).ok())
        .collect();

    info!("Session ended ({}), retired {} object(s)", reason, retired.len());
    retired
}

/// Admit calls in arrival order and run each admitted call concurrently.
async fn run_dispatcher(session: Arc<Session>, mut calls: mpsc::UnboundedReceiver<MethodCall>) {
    while let Some(call) = calls.recv().await {
        match session.admit(call).await {
            Admission::Ready(prepared) => {
                let session = session.clone();
                tokio::spawn(async move {
                    let call_id = prepared.call_id();
                    if let Err(e) = session.execute(prepared).await {
                        debug!("Call {} not answered: {}", call_id, e);
                    }
                });
            }
            Admission::Rejected => {}
        }
    }
}

// =============================================================================
// TRANSPORT ADAPTERS
// =============================================================================

/// Decode WebSocket frames: binary as bincode, text as JSON.
pub fn websocket_frames<S>(ws: S) -> Frames
where
    S: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
{
    stream::unfold(ws, |mut ws| async move {
        loop {
            let frame = match ws.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!("WebSocket error: {}", e);
                    return None;
                }
                None => return None,
            };

            let decoded = match frame {
                Message::Binary(bytes) => DmcMessage::from_bytes(&bytes),
                Message::Text(text) => DmcMessage::from_json(&text),
                Message::Close(_) => return None,
                _ => continue,
            };
            return Some((decoded, ws));
        }
    })
    .boxed()
}

/// Frames read from an in-process channel.
pub fn channel_frames(rx: mpsc::UnboundedReceiver<DmcMessage>) -> Frames {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|msg| (Ok(msg), rx)) }).boxed()
}

/// Pump a session's outbound messages into a WebSocket sink as binary frames.
///
/// Stops after sending `Goodbye` or when the sink fails.
pub async fn pump_outbound<W>(mut outbound: mpsc::UnboundedReceiver<DmcMessage>, mut sink: W)
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(msg) = outbound.recv().await {
        #[cfg(feature = "debug-tracing")]
        tracing::trace!("-> {}", msg.kind());

        let last = matches!(msg, DmcMessage::Goodbye { .. });
        let bytes = match msg.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode {}: {}", msg.kind(), e);
                continue;
            }
        };

        if sink.send(Message::Binary(bytes)).await.is_err() {
            break;
        }
        if last {
            let _ = sink.close().await;
            break;
        }
    }
}
