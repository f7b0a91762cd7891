//! Mailbox registry: the `Mailbox` record and the `MailboxStore` contract
//!
//! The core never persists mailboxes itself; it consumes a `MailboxStore`
//! implementation. Two are provided: a SQLite-backed one for production use
//! and an in-memory one for tests that don't need a real database.

use std::collections::BTreeMap;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use secrecy::SecretString;

use crate::errors::{StoreError, StoreResult};

/// IMAP endpoint + credentials identifying one account to watch.
///
/// Equality is by `email` alone, matching the spec's primary-key semantics.
#[derive(Debug, Clone)]
pub struct Mailbox {
    pub email: String,
    pub password: SecretString,
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
}

impl PartialEq for Mailbox {
    fn eq(&self, other: &Self) -> bool {
        self.email == other.email
    }
}

impl Eq for Mailbox {}

/// Persistent registry of mailboxes, consumed by the supervisor.
///
/// Implementations must guarantee `email` uniqueness. Single-call atomicity
/// is required; cross-call transactionality is not.
pub trait MailboxStore: Send + Sync {
    /// All mailboxes, ordered by `email`.
    fn get_all(&self) -> StoreResult<Vec<Mailbox>>;
    /// A single mailbox by `email`.
    fn get(&self, email: &str) -> StoreResult<Mailbox>;
    /// Insert a new mailbox. Fails with `Conflict` if `email` already exists.
    fn add(&self, mailbox: Mailbox) -> StoreResult<()>;
    /// Remove a mailbox by `email`. Fails with `NotFound` if absent.
    fn remove(&self, email: &str) -> StoreResult<()>;
}

/// SQLite-backed `MailboxStore`.
///
/// Guards the connection behind a `Mutex` since `rusqlite::Connection` is
/// `!Sync`; operations are short, synchronous row reads/writes, so holding
/// the lock across them is cheap.
pub struct SqliteMailboxStore {
    conn: Mutex<Connection>,
}

impl SqliteMailboxStore {
    /// Open (or create) the mailbox database at `path` and ensure the schema
    /// exists.
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> StoreResult<()> {
        let conn = self.conn.lock().expect("mailbox db mutex poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS mailboxes (
                email   TEXT PRIMARY KEY,
                password TEXT NOT NULL,
                server  TEXT NOT NULL,
                port    INTEGER NOT NULL,
                usessl  BOOLEAN NOT NULL DEFAULT TRUE
            );
            "#,
        )
        .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

impl MailboxStore for SqliteMailboxStore {
    fn get_all(&self) -> StoreResult<Vec<Mailbox>> {
        let conn = self.conn.lock().expect("mailbox db mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT email, password, server, port, usessl FROM mailboxes ORDER BY email")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_mailbox)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn get(&self, email: &str) -> StoreResult<Mailbox> {
        let conn = self.conn.lock().expect("mailbox db mutex poisoned");
        conn.query_row(
            "SELECT email, password, server, port, usessl FROM mailboxes WHERE email = ?1",
            params![email],
            row_to_mailbox,
        )
        .optional()
        .map_err(|e| StoreError::Backend(e.to_string()))?
        .ok_or_else(|| StoreError::NotFound(email.to_owned()))
    }

    fn add(&self, mailbox: Mailbox) -> StoreResult<()> {
        use secrecy::ExposeSecret;

        let conn = self.conn.lock().expect("mailbox db mutex poisoned");
        let result = conn.execute(
            "INSERT INTO mailboxes (email, password, server, port, usessl) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                mailbox.email,
                mailbox.password.expose_secret(),
                mailbox.server,
                mailbox.port,
                mailbox.use_tls,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Conflict(mailbox.email))
            }
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    fn remove(&self, email: &str) -> StoreResult<()> {
        let conn = self.conn.lock().expect("mailbox db mutex poisoned");
        let changed = conn
            .execute("DELETE FROM mailboxes WHERE email = ?1", params![email])
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if changed == 0 {
            Err(StoreError::NotFound(email.to_owned()))
        } else {
            Ok(())
        }
    }
}

fn row_to_mailbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<Mailbox> {
    let password: String = row.get(1)?;
    Ok(Mailbox {
        email: row.get(0)?,
        password: SecretString::new(password.into()),
        server: row.get(2)?,
        port: row.get(3)?,
        use_tls: row.get(4)?,
    })
}

/// In-memory `MailboxStore`, useful for supervisor/broadcaster tests that
/// don't need a real database.
#[derive(Default)]
pub struct InMemoryMailboxStore {
    mailboxes: Mutex<BTreeMap<String, Mailbox>>,
}

impl InMemoryMailboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MailboxStore for InMemoryMailboxStore {
    fn get_all(&self) -> StoreResult<Vec<Mailbox>> {
        Ok(self
            .mailboxes
            .lock()
            .expect("mailbox map mutex poisoned")
            .values()
            .cloned()
            .collect())
    }

    fn get(&self, email: &str) -> StoreResult<Mailbox> {
        self.mailboxes
            .lock()
            .expect("mailbox map mutex poisoned")
            .get(email)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(email.to_owned()))
    }

    fn add(&self, mailbox: Mailbox) -> StoreResult<()> {
        let mut mailboxes = self.mailboxes.lock().expect("mailbox map mutex poisoned");
        if mailboxes.contains_key(&mailbox.email) {
            return Err(StoreError::Conflict(mailbox.email));
        }
        mailboxes.insert(mailbox.email.clone(), mailbox);
        Ok(())
    }

    fn remove(&self, email: &str) -> StoreResult<()> {
        let mut mailboxes = self.mailboxes.lock().expect("mailbox map mutex poisoned");
        if mailboxes.remove(email).is_none() {
            Err(StoreError::NotFound(email.to_owned()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox(email: &str) -> Mailbox {
        Mailbox {
            email: email.to_owned(),
            password: SecretString::new("hunter2".to_owned().into()),
            server: "imap.example.com".to_owned(),
            port: 993,
            use_tls: true,
        }
    }

    #[test]
    fn in_memory_store_add_get_remove() {
        let store = InMemoryMailboxStore::new();
        store.add(mailbox("a@example.com")).unwrap();
        assert_eq!(store.get("a@example.com").unwrap().server, "imap.example.com");
        store.remove("a@example.com").unwrap();
        assert!(matches!(
            store.get("a@example.com"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn in_memory_store_rejects_duplicate_email() {
        let store = InMemoryMailboxStore::new();
        store.add(mailbox("a@example.com")).unwrap();
        let err = store.add(mailbox("a@example.com")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn sqlite_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailboxes.db");
        let store = SqliteMailboxStore::open(path.to_str().unwrap()).unwrap();

        store.add(mailbox("a@example.com")).unwrap();
        store.add(mailbox("b@example.com")).unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].email, "a@example.com");

        store.remove("a@example.com").unwrap();
        assert_eq!(store.get_all().unwrap().len(), 1);
        assert!(matches!(
            store.remove("a@example.com"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn sqlite_store_rejects_duplicate_email() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailboxes.db");
        let store = SqliteMailboxStore::open(path.to_str().unwrap()).unwrap();

        store.add(mailbox("a@example.com")).unwrap();
        let err = store.add(mailbox("a@example.com")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
