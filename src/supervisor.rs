//! Owns the set of running watchers and enforces at-most-one-per-mailbox
//!
//! The supervisor is the only thing that mutates the active-watcher map; the
//! uniqueness check and the insertion of a new context happen under one
//! mutex acquisition so two concurrent `start_one` calls for the same
//! mailbox can't both win.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::errors::{StoreError, StoreResult};
use crate::extractor::{CodeEvent, ExtractorRule};
use crate::mailbox::MailboxStore;
use crate::watcher::{self, MailboxWatchContext, WatcherState};

/// Deadline `stop_all`'s caller uses when waiting for watchers to reach
/// `Terminated` before giving up and abandoning them.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

pub struct WatcherSupervisor {
    store: Arc<dyn MailboxStore>,
    subjects: Vec<String>,
    rules: Vec<ExtractorRule>,
    codes: mpsc::Sender<CodeEvent>,
    active: Mutex<HashMap<String, MailboxWatchContext>>,
}

impl WatcherSupervisor {
    pub fn new(
        store: Arc<dyn MailboxStore>,
        subjects: Vec<String>,
        rules: Vec<ExtractorRule>,
        codes: mpsc::Sender<CodeEvent>,
    ) -> Self {
        Self {
            store,
            subjects,
            rules,
            codes,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start the watcher for `email`. No-op if a watcher for this mailbox is
    /// already `Initializing`/`Running`; a previously `Terminated` context is
    /// replaced with a fresh one rather than resurrected.
    pub async fn start_one(&self, email: &str) -> StoreResult<()> {
        let mailbox = self.store.get(email)?;

        let mut active = self.active.lock().await;
        if let Some(existing) = active.get(email) {
            if matches!(
                existing.state().await,
                WatcherState::Initializing | WatcherState::Running
            ) {
                return Ok(());
            }
        }

        let context = watcher::spawn(
            mailbox,
            self.subjects.clone(),
            self.rules.clone(),
            self.codes.clone(),
        );
        active.insert(email.to_owned(), context);
        Ok(())
    }

    /// Start every mailbox in the store. Per-mailbox failures are logged and
    /// skipped; one bad mailbox does not abort the rest.
    pub async fn start_all(&self) -> StoreResult<()> {
        let mailboxes = self.store.get_all()?;
        for mailbox in mailboxes {
            if let Err(err) = self.start_one(&mailbox.email).await {
                warn!(email = %mailbox.email, error = %err, "failed to start watcher");
            }
        }
        Ok(())
    }

    /// Signal the watcher for `email` to stop and drop it from the active
    /// map. Returns `NotFound` if no watcher is tracked for that mailbox.
    pub async fn stop_one(&self, email: &str) -> StoreResult<()> {
        let mut active = self.active.lock().await;
        match active.remove(email) {
            Some(context) => {
                context.request_stop();
                Ok(())
            }
            None => Err(StoreError::NotFound(email.to_owned())),
        }
    }

    /// Signal every active watcher to stop. Entries stay in the map; they
    /// are reaped as their loops observe the signal and reach `Terminated`.
    pub async fn stop_all(&self) {
        let active = self.active.lock().await;
        for context in active.values() {
            context.request_stop();
        }
    }

    /// Wait for every active watcher to reach `Terminated`, up to
    /// `SHUTDOWN_DEADLINE`. Intended for the daemon's shutdown path, after
    /// `stop_all`.
    pub async fn await_shutdown(&self) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
        loop {
            let all_terminated = {
                let active = self.active.lock().await;
                let mut terminated = true;
                for context in active.values() {
                    if !matches!(context.state().await, WatcherState::Terminated) {
                        terminated = false;
                        break;
                    }
                }
                terminated
            };

            if all_terminated || tokio::time::Instant::now() >= deadline {
                if !all_terminated {
                    warn!("shutdown deadline reached with watchers still running; abandoning them");
                }
                break;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("supervisor shutdown complete");
    }

    /// Count of mailboxes currently tracked (any state), for diagnostics.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{InMemoryMailboxStore, Mailbox};
    use secrecy::SecretString;

    fn mailbox(email: &str) -> Mailbox {
        Mailbox {
            email: email.to_owned(),
            password: SecretString::new("hunter2".to_owned().into()),
            server: "127.0.0.1".to_owned(),
            port: 1, // unroutable port: connect_authenticated will fail fast
            use_tls: true,
        }
    }

    fn supervisor() -> (WatcherSupervisor, mpsc::Receiver<CodeEvent>) {
        let store = Arc::new(InMemoryMailboxStore::new());
        let (tx, rx) = mpsc::channel(1);
        (
            WatcherSupervisor::new(store, vec![], vec![], tx),
            rx,
        )
    }

    #[tokio::test]
    async fn start_one_fails_for_unknown_mailbox() {
        let (supervisor, _rx) = supervisor();
        let err = supervisor.start_one("missing@example.com").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn stop_one_fails_for_untracked_mailbox() {
        let (supervisor, _rx) = supervisor();
        let err = supervisor.stop_one("a@example.com").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn start_one_is_idempotent_while_running() {
        let store = Arc::new(InMemoryMailboxStore::new());
        store.add(mailbox("a@example.com")).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let supervisor = WatcherSupervisor::new(store, vec![], vec![], tx);

        supervisor.start_one("a@example.com").await.unwrap();
        supervisor.start_one("a@example.com").await.unwrap();
        assert_eq!(supervisor.active_count().await, 1);
    }

    #[tokio::test]
    async fn stop_one_removes_from_active_map() {
        let store = Arc::new(InMemoryMailboxStore::new());
        store.add(mailbox("a@example.com")).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let supervisor = WatcherSupervisor::new(store, vec![], vec![], tx);

        supervisor.start_one("a@example.com").await.unwrap();
        assert_eq!(supervisor.active_count().await, 1);
        supervisor.stop_one("a@example.com").await.unwrap();
        assert_eq!(supervisor.active_count().await, 0);
    }
}
