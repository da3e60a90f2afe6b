// ABOUTME: Bounded per-connection cache of server objects addressed by client-assigned ids
// ABOUTME: Statements and result sets share one flat id space; eviction closes the victim

use crate::engine::{PreparedStatement, QueryResult};
use crate::error::DbError;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// A cached server object. The id space on the wire is flat; the opcode
/// context tells which variant a request expects.
pub enum CacheEntry {
    Statement(Arc<dyn PreparedStatement>),
    Result(Box<dyn QueryResult>),
}

impl CacheEntry {
    fn close(self) {
        match self {
            CacheEntry::Statement(stmt) => stmt.close(),
            CacheEntry::Result(mut result) => result.close(),
        }
    }
}

/// Small LRU map from object id to server object.
///
/// Ids are assigned by the client and scoped to one connection; an id is
/// never reused by the server without an explicit close or
/// `RESULT_CHANGE_ID`. Whatever falls off the cache is closed.
pub struct ObjectCache {
    entries: LruCache<i32, CacheEntry>,
}

impl ObjectCache {
    pub fn new(capacity: usize) -> Self {
        ObjectCache {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_statement(&mut self, id: i32, stmt: Arc<dyn PreparedStatement>) {
        self.add(id, CacheEntry::Statement(stmt));
    }

    pub fn add_result(&mut self, id: i32, result: Box<dyn QueryResult>) {
        self.add(id, CacheEntry::Result(result));
    }

    fn add(&mut self, id: i32, entry: CacheEntry) {
        if let Some((victim, old)) = self.entries.push(id, entry) {
            if victim != id {
                tracing::debug!(id = victim, "evicting cached object");
            }
            old.close();
        }
    }

    /// Statement lookup; a miss is an error because the request addressed
    /// an object the client never installed (or already freed).
    pub fn statement(&mut self, id: i32) -> Result<Arc<dyn PreparedStatement>, DbError> {
        self.statement_if_cached(id).ok_or_else(|| DbError::object_not_found(id))
    }

    /// Statement lookup tolerating a miss.
    pub fn statement_if_cached(&mut self, id: i32) -> Option<Arc<dyn PreparedStatement>> {
        match self.entries.get(&id) {
            Some(CacheEntry::Statement(stmt)) => Some(Arc::clone(stmt)),
            _ => None,
        }
    }

    /// Result lookup; a miss is an error.
    pub fn result(&mut self, id: i32) -> Result<&mut (dyn QueryResult + 'static), DbError> {
        match self.entries.get_mut(&id) {
            Some(CacheEntry::Result(result)) => Ok(result.as_mut()),
            _ => Err(DbError::object_not_found(id)),
        }
    }

    /// Remove and return an entry without closing it.
    pub fn remove(&mut self, id: i32) -> Option<CacheEntry> {
        self.entries.pop(&id)
    }

    /// Remove an entry and release its resources.
    pub fn free(&mut self, id: i32) {
        if let Some(entry) = self.remove(id) {
            entry.close();
        }
    }

    /// Re-key an entry, as done by `RESULT_CHANGE_ID`. Whatever previously
    /// lived under the new id is closed.
    pub fn rename(&mut self, old_id: i32, new_id: i32) -> Result<(), DbError> {
        let entry = self.remove(old_id).ok_or_else(|| DbError::object_not_found(old_id))?;
        self.add(new_id, entry);
        Ok(())
    }

    /// Close everything; called at connection teardown.
    pub fn clear(&mut self) {
        while let Some((_, entry)) = self.entries.pop_lru() {
            entry.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ColumnMeta;
    use crate::value::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ClosableResult {
        closed: Arc<AtomicBool>,
        columns: Vec<ColumnMeta>,
    }

    impl QueryResult for ClosableResult {
        fn column_count(&self) -> usize {
            0
        }
        fn row_count(&self) -> i32 {
            0
        }
        fn columns(&self) -> &[ColumnMeta] {
            &self.columns
        }
        fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
            Ok(None)
        }
        fn reset(&mut self) {}
        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn result_entry() -> (Box<dyn QueryResult>, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (
            Box::new(ClosableResult {
                closed: Arc::clone(&closed),
                columns: Vec::new(),
            }),
            closed,
        )
    }

    #[test]
    fn eviction_closes_least_recently_used() {
        let mut cache = ObjectCache::new(2);
        let (r1, closed1) = result_entry();
        let (r2, closed2) = result_entry();
        let (r3, closed3) = result_entry();

        cache.add_result(1, r1);
        cache.add_result(2, r2);
        cache.result(1).unwrap(); // touch 1, making 2 the LRU
        cache.add_result(3, r3);

        assert!(closed2.load(Ordering::SeqCst));
        assert!(!closed1.load(Ordering::SeqCst));
        assert!(!closed3.load(Ordering::SeqCst));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn rename_moves_entry_and_closes_displaced() {
        let mut cache = ObjectCache::new(8);
        let (r1, closed1) = result_entry();
        let (r2, closed2) = result_entry();
        cache.add_result(1, r1);
        cache.add_result(2, r2);

        cache.rename(1, 2).unwrap();
        assert!(closed2.load(Ordering::SeqCst), "displaced entry must be closed");
        assert!(!closed1.load(Ordering::SeqCst));
        assert!(cache.result(2).is_ok());
        assert!(cache.result(1).is_err());
    }

    #[test]
    fn miss_reports_object_not_found() {
        let mut cache = ObjectCache::new(4);
        let err = cache.statement(5).unwrap_err();
        assert_eq!(err.error_code, crate::error::error_code::OBJECT_NOT_FOUND);
        assert!(cache.statement_if_cached(5).is_none());
    }

    #[test]
    fn clear_closes_all() {
        let mut cache = ObjectCache::new(4);
        let (r1, closed1) = result_entry();
        cache.add_result(9, r1);
        cache.clear();
        assert!(closed1.load(Ordering::SeqCst));
        assert!(cache.is_empty());
    }
}
