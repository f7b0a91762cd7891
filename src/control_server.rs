//! Control socket: accepts subscriber connections and dispatches inbound
//! control messages to the store and supervisor
//!
//! Binds a single Unix-domain socket. Every accepted connection is split:
//! its write half becomes a broadcaster subscriber (`crate::broadcaster`),
//! its read half is handed to a per-connection reader task that decodes
//! newline-delimited JSON frames and executes them. The broadcaster is the
//! only writer to these connections; this module never writes a reply.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broadcaster::{ConnectionHandle, SubscriberList};
use crate::errors::StoreError;
use crate::mailbox::{Mailbox, MailboxStore};
use crate::protocol::{self, ControlMessage};
use crate::supervisor::WatcherSupervisor;

/// Local control-socket listener, tracking subscribers and routing inbound
/// commands to the store/supervisor.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    store: Arc<dyn MailboxStore>,
    supervisor: Arc<WatcherSupervisor>,
    subscribers: SubscriberList,
}

impl ControlServer {
    /// Bind the control socket at `path`.
    ///
    /// A stale socket file left behind by a previous run is removed before
    /// binding; any other kind of file at `path` is treated as a hard
    /// failure rather than silently clobbered.
    pub fn bind(
        path: &Path,
        store: Arc<dyn MailboxStore>,
        supervisor: Arc<WatcherSupervisor>,
    ) -> std::io::Result<Self> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_socket() => {
                std::fs::remove_file(path)?;
            }
            Ok(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()),
                ));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "control socket bound");

        Ok(Self {
            listener,
            path: path.to_owned(),
            store,
            supervisor,
            subscribers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// The subscriber list, shared with the broadcaster.
    pub fn subscribers(&self) -> SubscriberList {
        Arc::clone(&self.subscribers)
    }

    /// Accept connections until `shutdown` resolves. Each connection is
    /// split into a broadcaster subscriber plus a reader task; reader tasks
    /// are tracked so shutdown can wait for them to drain.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut readers = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let (reader, writer) = tokio::io::split(stream);
                            let handle = ConnectionHandle::new(Box::new(writer));
                            self.subscribers.lock().await.push(Arc::clone(&handle));

                            let store = Arc::clone(&self.store);
                            let supervisor = Arc::clone(&self.supervisor);
                            let subscribers = Arc::clone(&self.subscribers);
                            readers.spawn(async move {
                                handle_connection(reader, handle, store, supervisor, subscribers).await;
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "failed to accept control connection");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("control server accept loop stopped, waiting for readers to drain");
        while readers.join_next().await.is_some() {}
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_connection(
    reader: tokio::io::ReadHalf<UnixStream>,
    handle: Arc<ConnectionHandle>,
    store: Arc<dyn MailboxStore>,
    supervisor: Arc<WatcherSupervisor>,
    subscribers: SubscriberList,
) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match protocol::decode(&line) {
                    Ok(message) => dispatch(message, &store, &supervisor).await,
                    Err(err) => warn!(error = %err, "dropping malformed control frame"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "control connection read error");
                break;
            }
        }
    }

    subscribers.lock().await.retain(|s| !Arc::ptr_eq(s, &handle));
}

async fn dispatch(message: ControlMessage, store: &Arc<dyn MailboxStore>, supervisor: &Arc<WatcherSupervisor>) {
    match message {
        ControlMessage::Add {
            email,
            password,
            server,
            port,
            use_ssl,
        } => {
            let mailbox = Mailbox {
                email: email.clone(),
                password: secrecy::SecretString::new(password.into()),
                server,
                port,
                use_tls: use_ssl,
            };
            if let Err(err) = store.add(mailbox) {
                log_store_failure("Add", &email, err);
            }
        }
        ControlMessage::Remove { email } => {
            if let Err(err) = store.remove(&email) {
                log_store_failure("Remove", &email, err);
            }
        }
        ControlMessage::Watch { email } => {
            if let Err(err) = supervisor.start_one(&email).await {
                warn!(email = %email, error = %err, "Watch command failed");
            }
        }
        ControlMessage::WatchAll => {
            if let Err(err) = supervisor.start_all().await {
                warn!(error = %err, "WatchAll command failed");
            }
        }
        ControlMessage::Stop { email } => {
            if let Err(err) = supervisor.stop_one(&email).await {
                warn!(email = %email, error = %err, "Stop command failed");
            }
        }
        ControlMessage::StopAll => {
            supervisor.stop_all().await;
        }
        // Server→client actions are never received by the server; a
        // well-behaved client would not send them, and an ill-behaved one
        // gets nothing done in response.
        ControlMessage::Code { .. } | ControlMessage::ConnectionError { .. } => {
            debug!("ignoring server-originated action received from a client");
        }
    }
}

fn log_store_failure(action: &str, email: &str, err: StoreError) {
    // §7: Add/Remove failures over the socket are logged, not surfaced to
    // the caller, since the control protocol has no ack action (see spec
    // open question on acks).
    warn!(action, email, error = %err, "store operation failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::InMemoryMailboxStore;
    use tokio::sync::mpsc;

    fn supervisor() -> Arc<WatcherSupervisor> {
        let store: Arc<dyn MailboxStore> = Arc::new(InMemoryMailboxStore::new());
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(WatcherSupervisor::new(store, vec![], vec![], tx))
    }

    #[tokio::test]
    async fn bind_removes_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");

        let store: Arc<dyn MailboxStore> = Arc::new(InMemoryMailboxStore::new());
        let first = ControlServer::bind(&path, Arc::clone(&store), supervisor()).unwrap();
        drop(first);

        // the socket file is left on disk after drop; binding again must
        // clean it up rather than failing with AddrInUse.
        let second = ControlServer::bind(&path, store, supervisor());
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn bind_rejects_non_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"hello").unwrap();

        let store: Arc<dyn MailboxStore> = Arc::new(InMemoryMailboxStore::new());
        let err = ControlServer::bind(&path, store, supervisor()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn dispatch_add_then_remove_round_trips_through_store() {
        let store: Arc<dyn MailboxStore> = Arc::new(InMemoryMailboxStore::new());
        let sup = supervisor();

        dispatch(
            ControlMessage::Add {
                email: "a@example.com".into(),
                password: "secret".into(),
                server: "imap.example.com".into(),
                port: 993,
                use_ssl: true,
            },
            &store,
            &sup,
        )
        .await;
        assert_eq!(store.get_all().unwrap().len(), 1);

        dispatch(
            ControlMessage::Remove {
                email: "a@example.com".into(),
            },
            &store,
            &sup,
        )
        .await;
        assert!(store.get_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispatch_ignores_server_originated_actions() {
        let store: Arc<dyn MailboxStore> = Arc::new(InMemoryMailboxStore::new());
        let sup = supervisor();
        dispatch(
            ControlMessage::Code {
                code: "000000".into(),
                sender: "".into(),
            },
            &store,
            &sup,
        )
        .await;
        assert!(store.get_all().unwrap().is_empty());
    }
}
