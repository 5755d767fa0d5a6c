//! Cancellation of in-flight reads.
//!
//! A `CancelToken` is attached to a `Store` handle with `Store::with_cancel`.
//! Every read connection borrowed through that handle registers its SQLite
//! interrupt handle for as long as it is held; `cancel` interrupts whatever
//! statement is running on those connections and refuses new borrows.

use rusqlite::{Connection, InterruptHandle};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::store::DbError;

#[derive(Default)]
struct Registry {
    cancelled: bool,
    active: HashMap<u64, InterruptHandle>,
}

/// Shared cancellation signal for reads issued through one store handle.
#[derive(Clone, Default)]
pub struct CancelToken {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt running reads and fail later borrows with `DbError::Cancelled`.
    pub fn cancel(&self) {
        let mut registry = match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.cancelled = true;
        for handle in registry.active.values() {
            handle.interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.registry.lock().map(|r| r.cancelled).unwrap_or(true)
    }

    fn register(&self, handle: InterruptHandle) -> Result<u64, DbError> {
        let mut registry = self.registry.lock().map_err(|_| DbError::Poisoned)?;
        if registry.cancelled {
            return Err(DbError::Cancelled);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        registry.active.insert(id, handle);
        Ok(id)
    }

    fn deregister(&self, id: u64) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.active.remove(&id);
        }
    }

    fn active_count(&self) -> usize {
        self.registry.lock().map(|r| r.active.len()).unwrap_or(0)
    }
}

/// A borrowed read connection. Dropping it releases the connection and
/// detaches it from the cancel token.
pub struct ReadConn<'a> {
    conn: MutexGuard<'a, Connection>,
    registration: Option<(&'a CancelToken, u64)>,
}

impl<'a> ReadConn<'a> {
    pub(crate) fn new(conn: MutexGuard<'a, Connection>, cancel: Option<&'a CancelToken>) -> Result<Self, DbError> {
        let registration = match cancel {
            Some(token) => Some((token, token.register(conn.get_interrupt_handle())?)),
            None => None,
        };
        Ok(Self { conn, registration })
    }
}

impl Deref for ReadConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for ReadConn<'_> {
    fn drop(&mut self) {
        if let Some((token, id)) = self.registration.take() {
            token.deregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_store;
    use std::time::Duration;

    const SLOW_COUNT: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 500000000)
                              SELECT COUNT(*) FROM c";

    #[test]
    fn test_cancel_interrupts_running_read() {
        let (_tmp, store) = temp_store();
        let token = CancelToken::new();
        let cancellable = store.with_cancel(&token);

        let worker = std::thread::spawn(move || -> Result<i64, DbError> {
            let conn = cancellable.reader()?;
            Ok(conn.query_row(SLOW_COUNT, [], |row| row.get(0))?)
        });

        std::thread::sleep(Duration::from_millis(50));
        token.cancel();

        match worker.join().unwrap() {
            Err(DbError::Sqlite(e)) => {
                assert_eq!(e.sqlite_error_code(), Some(rusqlite::ErrorCode::OperationInterrupted));
            }
            Err(DbError::Cancelled) => {}
            other => panic!("read was not cancelled: {:?}", other),
        }
        assert_eq!(token.active_count(), 0);

        // The connection went back to the pool and is usable by others.
        let conn = store.reader().unwrap();
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn test_cancelled_token_refuses_new_reads() {
        let (_tmp, store) = temp_store();
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());

        let cancellable = store.with_cancel(&token);
        assert!(matches!(cancellable.reader(), Err(DbError::Cancelled)));
        assert!(matches!(cancellable.list_clients(), Err(DbError::Cancelled)));

        // Handles without the token are unaffected.
        assert!(store.list_clients().unwrap().is_empty());
    }

    #[test]
    fn test_registration_released_on_drop() {
        let (_tmp, store) = temp_store();
        let token = CancelToken::new();
        let cancellable = store.with_cancel(&token);

        {
            let _conn = cancellable.reader().unwrap();
            assert_eq!(token.active_count(), 1);
        }
        assert_eq!(token.active_count(), 0);
    }
}
