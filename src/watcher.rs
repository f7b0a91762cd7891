//! One mailbox's IDLE/SEARCH/FETCH/STORE loop
//!
//! A [`MailboxWatcher`] owns exactly one IMAP session for exactly one
//! mailbox, for as long as that session stays alive. The supervisor
//! (`crate::supervisor`) spawns one task per running watcher and tears it
//! down by way of [`MailboxWatchContext::request_stop`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::extractor::{self, CodeEvent, ExtractorRule};
use crate::imap::{self, IdleOutcome, ImapSession};
use crate::mailbox::Mailbox;

/// How long a single IDLE command is allowed to wait for a server push
/// before the watcher falls through to a fetch cycle anyway.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Lifecycle state of one watcher, observable by the supervisor and (via
/// `--list`-adjacent tooling) external callers. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Initializing,
    Running,
    Stopping,
    Terminated,
}

/// Per-running-watcher bookkeeping the supervisor keeps in its active map.
///
/// The stop channel is buffered (capacity 1) so `request_stop` never blocks
/// even if the watcher has already exited and stopped draining it.
pub struct MailboxWatchContext {
    stop_tx: mpsc::Sender<()>,
    state: Arc<Mutex<WatcherState>>,
}

impl MailboxWatchContext {
    /// Request that the watcher stop. Idempotent: a second call after the
    /// first is a harmless no-op (the channel is full, or the receiver is
    /// already gone).
    pub fn request_stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    pub async fn state(&self) -> WatcherState {
        *self.state.lock().await
    }
}

/// Spawn the watcher task for `mailbox` and return the context the
/// supervisor tracks for it.
///
/// `rules` and `subjects` are shared across every mailbox's watcher; they
/// are cloned once into the task rather than re-read per cycle.
pub fn spawn(
    mailbox: Mailbox,
    subjects: Vec<String>,
    rules: Vec<ExtractorRule>,
    codes: mpsc::Sender<CodeEvent>,
) -> MailboxWatchContext {
    let (stop_tx, stop_rx) = mpsc::channel(1);
    let state = Arc::new(Mutex::new(WatcherState::Initializing));

    let task_state = Arc::clone(&state);
    tokio::spawn(run(mailbox, subjects, rules, codes, stop_rx, task_state));

    MailboxWatchContext { stop_tx, state }
}

async fn set_state(state: &Mutex<WatcherState>, next: WatcherState) {
    *state.lock().await = next;
}

async fn run(
    mailbox: Mailbox,
    subjects: Vec<String>,
    rules: Vec<ExtractorRule>,
    codes: mpsc::Sender<CodeEvent>,
    mut stop_rx: mpsc::Receiver<()>,
    state: Arc<Mutex<WatcherState>>,
) {
    let email = mailbox.email.clone();

    let mut session = match imap::connect_authenticated(&mailbox).await {
        Ok(session) => session,
        Err(err) => {
            warn!(email = %email, error = %err, "watcher failed to connect/authenticate");
            set_state(&state, WatcherState::Terminated).await;
            return;
        }
    };

    if let Err(err) = imap::select_inbox(&mut session).await {
        warn!(email = %email, error = %err, "watcher failed to select INBOX");
        let _ = session.logout().await;
        set_state(&state, WatcherState::Terminated).await;
        return;
    }

    set_state(&state, WatcherState::Running).await;
    info!(email = %email, "watcher running");

    loop {
        if stop_rx.try_recv().is_ok() {
            break;
        }

        let (recovered, outcome) = match imap::idle_once(session, IDLE_TIMEOUT, &mut stop_rx).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(email = %email, error = %err, "IDLE cycle failed, terminating watcher");
                set_state(&state, WatcherState::Terminated).await;
                return;
            }
        };
        session = recovered;

        if matches!(outcome, IdleOutcome::Stopped) {
            break;
        }

        debug!(email = %email, ?outcome, "idle cycle complete, entering fetch phase");

        if let Err(err) = fetch_cycle(&mut session, &email, &subjects, &rules, &codes).await {
            warn!(email = %email, error = %err, "fetch cycle failed, terminating watcher");
            set_state(&state, WatcherState::Terminated).await;
            return;
        }
    }

    set_state(&state, WatcherState::Stopping).await;
    let _ = session.logout().await;
    set_state(&state, WatcherState::Terminated).await;
    info!(email = %email, "watcher terminated");
}

async fn fetch_cycle(
    session: &mut ImapSession,
    email: &str,
    subjects: &[String],
    rules: &[ExtractorRule],
    codes: &mpsc::Sender<CodeEvent>,
) -> Result<(), crate::errors::WatcherError> {
    let criteria = imap::build_search_criteria(subjects);
    let uids = imap::uid_search(session, &criteria).await?;

    if uids.is_empty() {
        return Ok(());
    }

    let candidates = imap::fetch_candidates(session, &uids).await?;
    let mut seen = Vec::new();

    for candidate in candidates {
        match extractor::extract(&candidate.body, &candidate.sender, rules) {
            Ok(event) => {
                seen.push(candidate.uid);
                if codes.send(event).await.is_err() {
                    debug!(email, "code channel closed, broadcaster has shut down");
                }
            }
            Err(err) => {
                debug!(email, uid = candidate.uid, error = %err, "message yielded no code");
            }
        }
    }

    if !seen.is_empty() {
        imap::mark_seen(session, &seen).await?;
    }

    Ok(())
}
