//! mailwatcher: watches IMAP mailboxes for verification-code emails and
//! broadcasts extracted codes over a local control socket
//!
//! # Architecture
//!
//! - [`config`]: YAML configuration loader (database path, subjects, extractor rules)
//! - [`errors`]: per-concern typed error hierarchies
//! - [`extractor`]: ordered-regex verification-code extraction
//! - [`mailbox`]: the `Mailbox` record and the `MailboxStore` contract (SQLite + in-memory)
//! - [`imap`]: IMAP transport (connect, SELECT, SEARCH/FETCH/STORE, IDLE)
//! - [`watcher`]: one mailbox's IDLE/SEARCH/FETCH/STORE loop
//! - [`supervisor`]: owns the active-watcher map, enforces at-most-one-per-mailbox
//! - [`protocol`]: control-socket wire format and typed messages
//! - [`broadcaster`]: single-writer fan-out of code events to subscribers
//! - [`control_server`]: Unix-domain-socket listener tying the above together

pub mod broadcaster;
pub mod config;
pub mod control_server;
pub mod errors;
pub mod extractor;
pub mod imap;
pub mod mailbox;
pub mod protocol;
pub mod supervisor;
pub mod watcher;
