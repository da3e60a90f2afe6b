// ABOUTME: Tunable constants for the Granite TCP transport layer
// ABOUTME: Protocol version bounds, cache capacities, and I/O sizing knobs

/// Capacity of the per-connection object cache (statements and result sets).
pub const SERVER_CACHED_OBJECTS: usize = 64;

/// Default number of rows shipped in the initial batch of a query response.
pub const SERVER_RESULT_SET_FETCH_SIZE: i32 = 100;

/// Base unit for socket and LOB read buffers.
pub const IO_BUFFER_SIZE: usize = 4 * 1024;

/// Upper bound for a single `COMMAND_READ_LOB` chunk.
pub const MAX_LOB_CHUNK: usize = 16 * IO_BUFFER_SIZE;

/// Largest packet a peer may declare. Anything above this is treated as a
/// protocol violation and the connection is torn down.
pub const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// First protocol revision. Error frames carry no stack trace text.
pub const TCP_PROTOCOL_VERSION_1: i32 = 1;

/// Second protocol revision. Adds the trailing trace field to error frames.
pub const TCP_PROTOCOL_VERSION_2: i32 = 2;

pub const TCP_PROTOCOL_VERSION_MIN: i32 = TCP_PROTOCOL_VERSION_1;
pub const TCP_PROTOCOL_VERSION_MAX: i32 = TCP_PROTOCOL_VERSION_2;
pub const TCP_PROTOCOL_VERSION_CURRENT: i32 = TCP_PROTOCOL_VERSION_2;

/// Workers draining the shared command queue.
pub const DEFAULT_COMMAND_HANDLERS: usize = 4;

/// Capacity of the per-connection LOB read cache.
pub fn lob_cache_capacity() -> usize {
    SERVER_CACHED_OBJECTS.max(5 * SERVER_RESULT_SET_FETCH_SIZE as usize)
}

/// Server-side settings applied to every accepted connection.
///
/// `base_dir` and `if_exists` override what the client sent in its
/// connection parameters; they are enforced here so a remote peer cannot
/// escape the configured database root or create databases implicitly.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Directory prepended to relative database names.
    pub base_dir: Option<String>,
    /// Only open databases that already exist.
    pub if_exists: bool,
}
