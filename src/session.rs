// ABOUTME: Per-connection registry of logical database sessions keyed by connection id
// ABOUTME: Lazy creation with race resolution, and the orderly close sequence

use crate::config::SERVER_RESULT_SET_FETCH_SIZE;
use crate::engine::{ConnectionInfo, Session, SessionFactory};
use crate::error::DbError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Maps the wire's logical `connection_id` to a live session.
///
/// Sessions are created on first use from the connection's stored
/// [`ConnectionInfo`]. The factory runs outside the registry lock (it may
/// hit disk), so two callers can race on the same id; the loser closes its
/// freshly built session and adopts the winner's.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<i32, Arc<dyn Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, conn_id: i32) -> Option<Arc<dyn Session>> {
        self.sessions.lock().unwrap().get(&conn_id).cloned()
    }

    pub fn get_or_create(
        &self,
        conn_id: i32,
        factory: &Arc<dyn SessionFactory>,
        info: &ConnectionInfo,
    ) -> Result<Arc<dyn Session>, DbError> {
        if let Some(session) = self.get(conn_id) {
            return Ok(session);
        }
        let created = factory.create_session(info)?;
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get(&conn_id) {
            Some(winner) => {
                let winner = Arc::clone(winner);
                drop(sessions);
                if let Err(err) = created.close() {
                    tracing::debug!(conn_id, %err, "closing session that lost the creation race");
                }
                Ok(winner)
            }
            None => {
                sessions.insert(conn_id, Arc::clone(&created));
                Ok(created)
            }
        }
    }

    pub fn remove(&self, conn_id: i32) -> Option<Arc<dyn Session>> {
        self.sessions.lock().unwrap().remove(&conn_id)
    }

    /// Take every session out of the registry, for connection teardown.
    pub fn drain(&self) -> Vec<Arc<dyn Session>> {
        self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        SessionRegistry::new()
    }
}

/// Close a session the orderly way: roll back whatever is in flight
/// through a regular prepared statement, then close. The first error seen
/// is retained and returned; resources are released regardless.
pub fn close_session(session: &Arc<dyn Session>) -> Result<(), DbError> {
    let mut first_err: Option<DbError> = None;
    match session.prepare_statement("ROLLBACK", SERVER_RESULT_SET_FETCH_SIZE) {
        Ok(stmt) => {
            if let Err(err) = stmt.update() {
                first_err.get_or_insert(err);
            }
            stmt.close();
        }
        Err(err) => {
            first_err.get_or_insert(err);
        }
    }
    if let Err(err) = session.close() {
        first_err.get_or_insert(err);
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
