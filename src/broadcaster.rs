//! Single-writer fan-out of code events to connected control-socket subscribers
//!
//! The broadcaster is the only task that ever writes to a subscriber's
//! socket; reader tasks (see `crate::control_server`) only decode inbound
//! messages. A write failure silently prunes that subscriber (no retry,
//! no client-visible error), matching §7's "subscriber write failure" rule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::extractor::CodeEvent;
use crate::protocol::{self, ControlMessage};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// One connected subscriber's write half, wrapped so the broadcaster can
/// write to it independently of whatever the connection's reader task is
/// doing with the read half.
pub struct ConnectionHandle {
    id: u64,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ConnectionHandle {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            writer: Mutex::new(writer),
        })
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
}

/// The subscriber list: appended to by the control server's acceptor,
/// iterated and pruned by the broadcaster, removed from by reader tasks on
/// disconnect.
pub type SubscriberList = Arc<Mutex<Vec<Arc<ConnectionHandle>>>>;

/// Runs until `codes` is closed (the supervisor/watchers have all dropped
/// their senders), fanning out every event to every current subscriber.
pub async fn run(mut codes: mpsc::Receiver<CodeEvent>, subscribers: SubscriberList) {
    while let Some(event) = codes.recv().await {
        broadcast(&event, &subscribers).await;
    }
    debug!("broadcaster shutting down: code channel closed");
}

async fn broadcast(event: &CodeEvent, subscribers: &SubscriberList) {
    let message = ControlMessage::Code {
        code: event.code.clone(),
        sender: event.sender.clone(),
    };
    let line = protocol::encode(&message);

    let snapshot = subscribers.lock().await.clone();
    let mut failed = Vec::new();
    for handle in &snapshot {
        if let Err(err) = handle.write_line(&line).await {
            warn!(error = %err, "dropping subscriber after write failure");
            failed.push(handle.id);
        }
    }

    if !failed.is_empty() {
        let mut guard = subscribers.lock().await;
        guard.retain(|handle| !failed.contains(&handle.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn pair() -> (Arc<ConnectionHandle>, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        (ConnectionHandle::new(Box::new(client)), server)
    }

    #[tokio::test]
    async fn single_event_reaches_every_subscriber_exactly_once() {
        let subscribers: SubscriberList = Arc::new(Mutex::new(Vec::new()));
        let (handle_a, mut server_a) = pair();
        let (handle_b, mut server_b) = pair();
        subscribers.lock().await.push(handle_a);
        subscribers.lock().await.push(handle_b);

        broadcast(
            &CodeEvent {
                sender: "alice@example.com".to_owned(),
                code: "482913".to_owned(),
            },
            &subscribers,
        )
        .await;

        let mut buf_a = [0u8; 4096];
        let n_a = server_a.read(&mut buf_a).await.unwrap();
        let mut buf_b = [0u8; 4096];
        let n_b = server_b.read(&mut buf_b).await.unwrap();

        let line_a = std::str::from_utf8(&buf_a[..n_a]).unwrap();
        let line_b = std::str::from_utf8(&buf_b[..n_b]).unwrap();
        assert_eq!(line_a, line_b);
        assert_eq!(line_a.matches("482913").count(), 1);
    }

    #[tokio::test]
    async fn dead_subscriber_is_pruned_without_affecting_others() {
        let subscribers: SubscriberList = Arc::new(Mutex::new(Vec::new()));
        let (handle_a, server_a) = pair();
        let (handle_b, mut server_b) = pair();
        drop(server_a); // simulate a disconnected subscriber
        subscribers.lock().await.push(handle_a);
        subscribers.lock().await.push(handle_b);

        broadcast(
            &CodeEvent {
                sender: "".to_owned(),
                code: "000000".to_owned(),
            },
            &subscribers,
        )
        .await;

        assert_eq!(subscribers.lock().await.len(), 1);
        let mut buf = [0u8; 4096];
        let n = server_b.read(&mut buf).await.unwrap();
        assert!(n > 0);
    }
}
