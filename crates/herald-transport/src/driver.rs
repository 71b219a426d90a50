use std::fmt;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionEvents, ConnectionInfo, ConnectionSink};

/// Conversion between a transport's native message and a payload.
pub(crate) trait WireMessage: Send + 'static {
    fn from_payload(payload: Bytes) -> Self;

    /// `None` for control messages that carry no payload.
    fn into_payload(self) -> Option<Bytes>;
}

impl WireMessage for Bytes {
    fn from_payload(payload: Bytes) -> Self {
        payload
    }

    fn into_payload(self) -> Option<Bytes> {
        Some(self)
    }
}

/// Spawn the I/O task for a message-oriented stream and return its
/// [`Connection`].
///
/// One task owns the stream: it writes queued messages in order, forwards
/// inbound messages, and stops on close from either side. Messages queued
/// before a local close are flushed first. Messages over
/// `max_message_size` are refused by the sink before they reach the task.
pub(crate) fn spawn<T, M, E>(io: T, info: ConnectionInfo, max_message_size: usize) -> Connection
where
    T: Stream<Item = std::result::Result<M, E>> + Sink<M> + Send + Unpin + 'static,
    <T as Sink<M>>::Error: fmt::Display + Send,
    M: WireMessage,
    E: fmt::Display + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Bytes>();
    let closed = CancellationToken::new();
    let finished = CancellationToken::new();

    let token = closed.clone();
    let done = finished.clone();
    let remote = info.remote().to_string();
    tokio::spawn(async move {
        let mut io = io;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                outbound = out_rx.recv() => match outbound {
                    Some(payload) => {
                        trace!(remote = %remote, len = payload.len(), "write");
                        if let Err(err) = io.send(M::from_payload(payload)).await {
                            debug!(remote = %remote, error = %err, "write failed");
                            break;
                        }
                    }
                    None => break,
                },
                inbound = io.next() => match inbound {
                    Some(Ok(message)) => {
                        if let Some(payload) = message.into_payload() {
                            trace!(remote = %remote, len = payload.len(), "read");
                            if in_tx.send(payload).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        debug!(remote = %remote, error = %err, "read failed");
                        break;
                    }
                    None => break,
                },
            }
        }

        while let Ok(payload) = out_rx.try_recv() {
            if io.feed(M::from_payload(payload)).await.is_err() {
                break;
            }
        }
        let _ = io.close().await;
        token.cancel();
        done.cancel();
        debug!(remote = %remote, "connection closed");
    });

    Connection::new(
        info,
        ConnectionSink::new(out_tx, closed.clone(), finished).with_max_message_size(max_message_size),
        ConnectionEvents::new(in_rx, closed),
    )
}
