//! IMAP transport: connect, select, SEARCH/FETCH/STORE, and IDLE
//!
//! Every operation here is a thin, typed wrapper around `async-imap`; the
//! watcher loop (`crate::watcher`) owns the session and sequences these
//! calls. Nothing in this module knows about the supervisor, the control
//! socket, or extraction; it only speaks IMAP.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::types::Fetch;
use async_imap::{Client, Session};
use chrono::{Duration as ChronoDuration, Local};
use futures::future::Either;
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::errors::WatcherError;
use crate::mailbox::Mailbox;

/// The transport a session runs over: TLS-wrapped or plain TCP, depending on
/// `Mailbox::use_tls`. Both variants are driven identically past connect
/// time, so `Session` is generic over this enum rather than over either
/// stream type directly.
pub enum MailStream {
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
    Plain(TcpStream),
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            MailStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MailStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            MailStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Tls(s) => Pin::new(s).poll_flush(cx),
            MailStream::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            MailStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

pub type ImapSession = Session<MailStream>;

const IDLE_DONE_TIMEOUT: Duration = Duration::from_secs(15);

/// Dial `mailbox.server:mailbox.port`, wrap in TLS when `mailbox.use_tls` is
/// set, and `LOGIN`. Both transports are supported: `use_tls` is a per-user
/// flag on the mailbox record, not a blanket policy the core enforces.
pub async fn connect_authenticated(mailbox: &Mailbox) -> Result<ImapSession, WatcherError> {
    let tcp = TcpStream::connect((mailbox.server.as_str(), mailbox.port))
        .await
        .map_err(|source| WatcherError::Connect {
            server: mailbox.server.clone(),
            port: mailbox.port,
            source,
        })?;

    let stream = if mailbox.use_tls {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));

        let server_name =
            ServerName::try_from(mailbox.server.clone()).map_err(|_| WatcherError::Tls {
                server: mailbox.server.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "invalid hostname for TLS SNI",
                ),
            })?;

        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|source| WatcherError::Tls {
                server: mailbox.server.clone(),
                source,
            })?;
        MailStream::Tls(tls_stream)
    } else {
        MailStream::Plain(tcp)
    };

    let client = Client::new(stream);
    let password = mailbox.password.expose_secret();
    client
        .login(mailbox.email.as_str(), password)
        .await
        .map_err(|_| WatcherError::AuthFailed {
            email: mailbox.email.clone(),
        })
}

/// `SELECT INBOX` in read-write mode, required so the watcher can later
/// `STORE \Seen`.
pub async fn select_inbox(session: &mut ImapSession) -> Result<(), WatcherError> {
    session.select("INBOX").await?;
    Ok(())
}

/// Build the `UID SEARCH` criteria for one fetch cycle: messages from the
/// last 24 hours, unseen, optionally restricted to a subject filter.
///
/// Subject disjunction is a right-leaning `OR` tree so that, byte for byte,
/// the criteria string matches what a human would write by hand for a short
/// subject list: `OR (HEADER SUBJECT "a") (OR (HEADER SUBJECT "b") (HEADER SUBJECT "c"))`.
pub fn build_search_criteria(subjects: &[String]) -> String {
    let since = (Local::now() - ChronoDuration::hours(24))
        .format("%d-%b-%Y")
        .to_string();

    let mut criteria = format!("SINCE {since} NOT SEEN");
    if !subjects.is_empty() {
        criteria.push(' ');
        criteria.push_str(&subject_disjunction(subjects));
    }
    criteria
}

fn subject_disjunction(subjects: &[String]) -> String {
    match subjects {
        [] => String::new(),
        [only] => format!("HEADER SUBJECT \"{only}\""),
        [head, rest @ ..] => format!(
            "OR (HEADER SUBJECT \"{head}\") ({})",
            subject_disjunction(rest)
        ),
    }
}

/// Run `UID SEARCH` with the given criteria, returning matching UIDs in
/// whatever order the server returned them.
pub async fn uid_search(session: &mut ImapSession, criteria: &str) -> Result<Vec<u32>, WatcherError> {
    let uids = session.uid_search(criteria).await?;
    Ok(uids.into_iter().collect())
}

/// One fetched candidate message: its body text, envelope sender, and UID
/// (for the later `STORE`).
pub struct FetchedMessage {
    pub uid: u32,
    pub body: Vec<u8>,
    pub sender: String,
}

/// `UID FETCH <uids> (BODY.PEEK[TEXT] INTERNALDATE ENVELOPE)`.
///
/// `BODY.PEEK` is used deliberately: fetching must never mark a message
/// seen on its own, only an explicit `STORE` after successful extraction
/// does that.
pub async fn fetch_candidates(
    session: &mut ImapSession,
    uids: &[u32],
) -> Result<Vec<FetchedMessage>, WatcherError> {
    if uids.is_empty() {
        return Ok(Vec::new());
    }

    let sequence_set = uids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let stream = session
        .uid_fetch(sequence_set, "(BODY.PEEK[TEXT] INTERNALDATE ENVELOPE)")
        .await?;
    let fetches: Vec<Fetch> = stream.try_collect().await?;

    Ok(fetches
        .iter()
        .filter_map(|fetch| {
            let uid = fetch.uid?;
            let body = fetch.text().or_else(|| fetch.body())?.to_vec();
            let sender = envelope_sender(fetch);
            Some(FetchedMessage { uid, body, sender })
        })
        .collect())
}

fn envelope_sender(fetch: &Fetch) -> String {
    fetch
        .envelope()
        .and_then(|envelope| envelope.from.as_ref())
        .and_then(|addresses| addresses.first())
        .map(|address| {
            let mailbox = address
                .mailbox
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned());
            let host = address
                .host
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned());
            match (mailbox, host) {
                (Some(mailbox), Some(host)) => format!("{mailbox}@{host}"),
                (Some(mailbox), None) => mailbox,
                _ => String::new(),
            }
        })
        .unwrap_or_default()
}

/// `UID STORE <uids> +FLAGS.SILENT (\Seen)` for every UID whose message
/// yielded a code this cycle.
pub async fn mark_seen(session: &mut ImapSession, uids: &[u32]) -> Result<(), WatcherError> {
    if uids.is_empty() {
        return Ok(());
    }

    let sequence_set = uids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let stream = session
        .uid_store(sequence_set, "+FLAGS.SILENT (\\Seen)")
        .await?;
    let _: Vec<Fetch> = stream.try_collect().await?;
    Ok(())
}

/// Outcome of a single IDLE wait, already collapsed out of `IdleResponse`
/// into the cases the watcher loop cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    NewData,
    TimedOut,
    ManualInterrupt,
    Stopped,
}

/// Run one IDLE cycle: `IDLE`, wait for a server push, a timeout, or `stop`
/// being notified, then `DONE` exactly once (unless IDLE itself failed, in
/// which case the connection is already unusable and no `DONE` is sent).
///
/// `session` is consumed and, on success, handed back recovered from the
/// `Handle`; `async-imap` models the IDLE command as taking ownership of the
/// session for its duration.
pub async fn idle_once(
    session: ImapSession,
    idle_timeout: Duration,
    stop: &mut mpsc::Receiver<()>,
) -> Result<(ImapSession, IdleOutcome), WatcherError> {
    let mut handle = session.idle();
    handle
        .init()
        .await
        .map_err(|e| WatcherError::Idle(e.to_string()))?;
    handle.as_mut().set_read_timeout(None);

    let (idle_wait, interrupt) = handle.wait_with_timeout(idle_timeout);

    let outcome = match futures::future::select(Box::pin(idle_wait), Box::pin(stop.recv())).await {
        Either::Left((Ok(IdleResponse::NewData(_)), _)) => IdleOutcome::NewData,
        Either::Left((Ok(IdleResponse::Timeout), _)) => IdleOutcome::TimedOut,
        Either::Left((Ok(IdleResponse::ManualInterrupt), _)) => IdleOutcome::ManualInterrupt,
        Either::Left((Err(e), _)) => return Err(WatcherError::Idle(e.to_string())),
        Either::Right((_, _)) => {
            // dropping `interrupt` unwinds the in-flight IDLE; the
            // now-abandoned idle_wait future is never polled again.
            drop(interrupt);
            IdleOutcome::Stopped
        }
    };

    let session = timeout(IDLE_DONE_TIMEOUT, handle.done())
        .await
        .map_err(|_| WatcherError::Idle("DONE timed out".to_owned()))?
        .map_err(|e| WatcherError::Idle(e.to_string()))?;

    Ok((session, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_subject_list_has_no_subject_clause() {
        let criteria = build_search_criteria(&[]);
        assert!(criteria.starts_with("SINCE "));
        assert!(criteria.ends_with("NOT SEEN"));
    }

    #[test]
    fn single_subject_is_a_bare_header_clause() {
        let subjects = vec!["Your code".to_owned()];
        let criteria = build_search_criteria(&subjects);
        assert!(criteria.ends_with("NOT SEEN HEADER SUBJECT \"Your code\""));
    }

    #[test]
    fn two_subjects_produce_one_or() {
        let subjects = vec!["Your code".to_owned(), "Verification".to_owned()];
        let criteria = build_search_criteria(&subjects);
        assert!(criteria.ends_with(
            "NOT SEEN OR (HEADER SUBJECT \"Your code\") (HEADER SUBJECT \"Verification\")"
        ));
    }

    #[test]
    fn four_subjects_produce_a_right_leaning_or_tree() {
        let subjects = vec!["s1".to_owned(), "s2".to_owned(), "s3".to_owned(), "s4".to_owned()];
        let tree = subject_disjunction(&subjects);
        assert_eq!(
            tree,
            "OR (HEADER SUBJECT \"s1\") (OR (HEADER SUBJECT \"s2\") (OR (HEADER SUBJECT \"s3\") (HEADER SUBJECT \"s4\")))"
        );
    }

    #[test]
    fn five_subjects_nest_one_level_deeper() {
        let subjects = vec![
            "s1".to_owned(),
            "s2".to_owned(),
            "s3".to_owned(),
            "s4".to_owned(),
            "s5".to_owned(),
        ];
        let tree = subject_disjunction(&subjects);
        assert_eq!(
            tree,
            "OR (HEADER SUBJECT \"s1\") (OR (HEADER SUBJECT \"s2\") (OR (HEADER SUBJECT \"s3\") (OR (HEADER SUBJECT \"s4\") (HEADER SUBJECT \"s5\"))))"
        );
    }
}
