// ABOUTME: Facade traits for the SQL/storage engine consumed by the connection handler
// ABOUTME: Sessions, prepared statements, result sets, storage maps, LOB storage, transactions

use crate::error::DbError;
use crate::value::{TypeTag, Value};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

/// Parameters collected during session setup, used to construct a
/// database session. Server-side overrides (`base_dir`, `if_exists`) are
/// applied before the factory ever sees it.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub database: String,
    pub url: String,
    pub user: String,
    pub user_password_hash: Vec<u8>,
    pub file_password_hash: Vec<u8>,
    pub file_encryption_key: Option<Vec<u8>>,
    pub properties: HashMap<String, String>,
    pub base_dir: Option<String>,
    pub if_exists: bool,
}

impl ConnectionInfo {
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn bool_property(&self, name: &str) -> bool {
        matches!(self.property(name), Some("true") | Some("TRUE") | Some("1"))
    }
}

/// Creates database sessions. One factory serves every connection of a
/// server.
pub trait SessionFactory: Send + Sync {
    fn create_session(&self, info: &ConnectionInfo) -> Result<Arc<dyn Session>, DbError>;
}

/// A logical database session.
///
/// Implementations use interior mutability: a session is shared between
/// the connection's read loop and a command worker, and flags like
/// auto-commit are flipped from either side.
pub trait Session: Send + Sync {
    fn prepare_statement(
        &self,
        sql: &str,
        fetch_size: i32,
    ) -> Result<Arc<dyn PreparedStatement>, DbError>;

    fn storage_map(&self, name: &str) -> Result<Arc<dyn StorageMap>, DbError>;

    fn lob_storage(&self) -> Arc<dyn LobStorage>;

    /// The transaction this session currently participates in, if any.
    fn transaction(&self) -> Option<Arc<dyn Transaction>>;

    fn set_auto_commit(&self, auto_commit: bool);
    fn is_auto_commit(&self) -> bool;

    /// Mark whether this session is the root of a distributed transaction.
    fn set_root(&self, root: bool);

    /// Hint that the peer is co-located and replication can be skipped.
    fn set_local(&self, local: bool);

    /// Name under which the next replicated write is tracked.
    fn set_replication_name(&self, name: &str);

    /// Monotonic counter bumped by state-affecting operations. Compared
    /// before and after a request to decide `STATUS_OK_STATE_CHANGED`.
    fn modification_id(&self) -> u64;

    fn is_closed(&self) -> bool;
    fn close(&self) -> Result<(), DbError>;

    fn commit(&self, local: bool, tx_names: Option<&str>) -> Result<(), DbError>;
    fn rollback(&self) -> Result<(), DbError>;
    fn add_savepoint(&self, name: &str) -> Result<(), DbError>;
    fn rollback_to_savepoint(&self, name: &str) -> Result<(), DbError>;
    fn validate_transaction(&self, tx_name: &str) -> Result<bool, DbError>;
}

/// Branch bookkeeping of a distributed transaction.
pub trait Transaction: Send + Sync {
    /// Comma-separated branch identifiers, echoed in distributed replies so
    /// the coordinator can track participants.
    fn local_transaction_names(&self) -> String;
}

/// A parsed, executable statement.
pub trait PreparedStatement: Send + Sync + std::fmt::Debug {
    fn is_query(&self) -> bool;

    fn query(&self, max_rows: i32, scrollable: bool) -> Result<Box<dyn QueryResult>, DbError>;

    fn update(&self) -> Result<i32, DbError>;

    /// Column metadata of the statement, materialized as an empty result.
    fn metadata(&self) -> Result<Box<dyn QueryResult>, DbError>;

    fn parameters(&self) -> Vec<ParameterMeta>;

    fn set_parameter_values(&self, values: Vec<Value>) -> Result<(), DbError>;

    fn set_fetch_size(&self, fetch_size: i32);

    /// Cooperative cancellation; the executing worker observes it inside
    /// the engine.
    fn cancel(&self);

    /// Release the statement. Closing an already closed statement is a
    /// no-op; a handle can be reached both through the object cache and a
    /// queued command.
    fn close(&self);
}

/// A server-side result set, consumed row by row.
pub trait QueryResult: Send {
    fn column_count(&self) -> usize;
    fn row_count(&self) -> i32;
    fn columns(&self) -> &[ColumnMeta];
    fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError>;
    fn reset(&mut self);
    fn close(&mut self);
}

/// Codec for keys and values of a storage map. The wire carries raw byte
/// blobs; the map's own types give them meaning.
pub trait DataType: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Value, DbError>;
    fn encode(&self, value: &Value) -> Result<Vec<u8>, DbError>;
}

/// A named key/value map of the storage engine.
pub trait StorageMap: Send + Sync {
    fn name(&self) -> &str;
    fn key_type(&self) -> &dyn DataType;
    fn value_type(&self) -> &dyn DataType;
    fn get(&self, key: &Value) -> Result<Option<Value>, DbError>;
    fn put(&self, key: Value, value: Value) -> Result<Option<Value>, DbError>;

    /// Replication capability, when the map supports leaf-page shipping.
    fn replication(&self) -> Option<&dyn Replication> {
        None
    }
}

/// Optional leaf-page replication interface of a storage map.
pub trait Replication: Send + Sync {
    fn add_leaf_page(&self, split_key: &[u8], page: &[u8]) -> Result<(), DbError>;
    fn remove_leaf_page(&self, key: &[u8]) -> Result<(), DbError>;
}

/// Streaming access to large objects.
pub trait LobStorage: Send + Sync {
    /// Open a stream over the LOB's bytes from the beginning. `length` is
    /// a hint; -1 means unknown.
    fn open_input_stream(
        &self,
        lob_id: i64,
        hmac: &[u8],
        length: i64,
    ) -> Result<Box<dyn io::Read + Send>, DbError>;
}

/// Column metadata as written in query and metadata responses.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub alias: String,
    pub schema_name: String,
    pub table_name: String,
    pub column_name: String,
    pub data_type: TypeTag,
    pub precision: i64,
    pub scale: i32,
    pub display_size: i32,
    pub auto_increment: bool,
    /// JDBC-style nullability: 0 no nulls, 1 nullable, 2 unknown.
    pub nullable: i32,
}

impl ColumnMeta {
    /// Minimal metadata for a computed column.
    pub fn unnamed(name: &str, data_type: TypeTag) -> Self {
        ColumnMeta {
            alias: name.to_string(),
            schema_name: String::new(),
            table_name: String::new(),
            column_name: name.to_string(),
            data_type,
            precision: 0,
            scale: 0,
            display_size: 0,
            auto_increment: false,
            nullable: 1,
        }
    }
}

/// Parameter metadata returned by `COMMAND_PREPARE_READ_PARAMS`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterMeta {
    pub data_type: TypeTag,
    pub precision: i64,
    pub scale: i32,
    pub nullable: i32,
}
