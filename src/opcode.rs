// ABOUTME: Defines the Granite TCP protocol operation codes and response statuses
// ABOUTME: Implements the request/response direction bit and opcode routing predicates

use num_enum::TryFromPrimitive;

/// Granite TCP protocol operations.
///
/// Every packet payload starts with an `i32` header whose low bit is the
/// direction (0 = request, 1 = response) and whose upper bits are the
/// opcode. The numeric values below are part of the wire ABI and must match
/// the peer exactly.
#[derive(TryFromPrimitive)]
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Session lifecycle
    SessionInit = 0,
    SessionClose = 1,
    SessionSetId = 2,
    SessionSetAutoCommit = 3,
    SessionCancelStatement = 4,

    // SQL statement handling
    CommandPrepare = 5,
    CommandPrepareReadParams = 6,
    CommandQuery = 7,
    CommandPreparedQuery = 8,
    CommandUpdate = 9,
    CommandPreparedUpdate = 10,
    CommandReplicationUpdate = 11,
    CommandReplicationPreparedUpdate = 12,

    // Distributed transaction variants share the body of their plain
    // counterparts after forcing the session out of auto-commit.
    CommandDistributedQuery = 13,
    CommandDistributedPreparedQuery = 14,
    CommandDistributedUpdate = 15,
    CommandDistributedPreparedUpdate = 16,
    CommandDistributedCommit = 17,
    CommandDistributedRollback = 18,
    CommandDistributedAddSavepoint = 19,
    CommandDistributedRollbackSavepoint = 20,
    CommandDistributedValidate = 21,

    CommandBatchUpdate = 22,
    CommandBatchPreparedUpdate = 23,

    CommandClose = 24,
    CommandGetMetaData = 25,
    CommandReadLob = 26,

    // KV storage access
    CommandStoragePut = 27,
    CommandStorageGet = 28,
    CommandStorageDistributedPut = 29,
    CommandStorageDistributedGet = 30,
    CommandStorageReplicationPut = 31,
    CommandStorageMoveLeafPage = 32,
    CommandStorageRemoveLeafPage = 33,

    // Server-side result set navigation
    ResultFetchRows = 34,
    ResultReset = 35,
    ResultClose = 36,
    ResultChangeId = 37,
}

impl Opcode {
    /// Header value for a request packet carrying this opcode.
    pub fn request_header(self) -> i32 {
        (self as i32) << 1
    }

    /// Header value for a response packet carrying this opcode.
    pub fn response_header(self) -> i32 {
        ((self as i32) << 1) | 1
    }

    /// Split a raw packet header into `(opcode, is_response)`.
    pub fn split_header(header: i32) -> (i32, bool) {
        (header >> 1, header & 1 == 1)
    }

    /// True for operations executed through the shared command queue
    /// instead of directly on the connection's read loop.
    pub fn is_deferred(self) -> bool {
        matches!(
            self,
            Opcode::CommandQuery
                | Opcode::CommandPreparedQuery
                | Opcode::CommandUpdate
                | Opcode::CommandPreparedUpdate
                | Opcode::CommandReplicationUpdate
                | Opcode::CommandReplicationPreparedUpdate
                | Opcode::CommandDistributedQuery
                | Opcode::CommandDistributedPreparedQuery
                | Opcode::CommandDistributedUpdate
                | Opcode::CommandDistributedPreparedUpdate
                | Opcode::CommandBatchUpdate
                | Opcode::CommandBatchPreparedUpdate
        )
    }

    /// True when the request leads with a client-assigned `i32` id that the
    /// response echoes directly after the status. Responses without an id
    /// are correlated in FIFO order on the client side.
    pub fn echoes_id(self) -> bool {
        matches!(
            self,
            Opcode::CommandPrepare
                | Opcode::CommandPrepareReadParams
                | Opcode::CommandQuery
                | Opcode::CommandPreparedQuery
                | Opcode::CommandUpdate
                | Opcode::CommandPreparedUpdate
                | Opcode::CommandReplicationUpdate
                | Opcode::CommandReplicationPreparedUpdate
                | Opcode::CommandDistributedQuery
                | Opcode::CommandDistributedPreparedQuery
                | Opcode::CommandDistributedUpdate
                | Opcode::CommandDistributedPreparedUpdate
                | Opcode::CommandBatchUpdate
                | Opcode::CommandBatchPreparedUpdate
                | Opcode::CommandClose
                | Opcode::CommandGetMetaData
                | Opcode::ResultFetchRows
                | Opcode::ResultReset
                | Opcode::ResultClose
                | Opcode::ResultChangeId
        )
    }
}

/// Status prefix of every response payload. The numeric values are
/// contractual.
#[derive(TryFromPrimitive)]
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok = 1,
    Error = 2,
    Closed = 3,
    OkStateChanged = 4,
}

/// Sentinel update count for a failed item inside a batch.
pub const EXECUTE_FAILED: i32 = -3;
