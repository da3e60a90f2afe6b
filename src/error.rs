// ABOUTME: Error types for the Granite wire layer
// ABOUTME: Protocol-level violations plus the database error record carried in error frames

use std::fmt;
use thiserror::Error;

/// Numeric error codes carried in the wire error frame.
///
/// `CONNECTION_BROKEN` doubles as the explicit "reconnect permitted"
/// signal on the client parse path.
pub mod error_code {
    pub const GENERAL_ERROR: i32 = 50000;
    pub const STATEMENT_CANCELED: i32 = 57014;
    pub const PROTOCOL_VIOLATION: i32 = 90040;
    pub const UNSUPPORTED_PROTOCOL_VERSION: i32 = 90041;
    pub const OBJECT_NOT_FOUND: i32 = 90042;
    pub const LOB_MAC_MISMATCH: i32 = 90043;
    pub const SESSION_NOT_INITIALIZED: i32 = 90044;
    pub const CONNECTION_BROKEN: i32 = 90067;
}

/// Violations detected while parsing or framing packets.
///
/// `Incomplete` is an expected runtime state while a frame is still being
/// reassembled; everything else terminates the current connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("incomplete packet: need more data")]
    Incomplete,

    #[error("invalid opcode: {0:#x}")]
    InvalidOpcode(i32),

    #[error("invalid status: {0}")]
    InvalidStatus(i32),

    #[error("packet length {length} exceeds limit {max}")]
    PacketTooLarge { length: u32, max: u32 },

    #[error("invalid value tag: {0:#x}")]
    InvalidTag(u8),

    #[error("negative length {0} for field '{1}'")]
    NegativeLength(i32, &'static str),

    #[error("MAC check failed for lob {0}")]
    LobMacMismatch(i64),

    #[error("client version {requested} outside supported range {min}..={max}")]
    UnsupportedVersion { requested: i32, min: i32, max: i32 },

    #[error("UTF-8 decoding error in field '{field}'")]
    Utf8 {
        field: &'static str,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The database error record as it crosses the wire: SQLSTATE, message,
/// the offending SQL if any, a numeric code, and a rendered trace.
///
/// Engine collaborators return this type; the dispatcher packs it into an
/// error frame. The trace text is a best-effort diagnostic; peers must
/// tolerate its absence (protocol v1 never ships it).
#[derive(Debug, Clone, PartialEq)]
pub struct DbError {
    pub sql_state: String,
    pub message: String,
    pub sql: Option<String>,
    pub error_code: i32,
    pub trace: String,
}

impl DbError {
    pub fn new(error_code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        DbError {
            sql_state: error_code.to_string(),
            trace: String::new(),
            message,
            sql: None,
            error_code,
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        DbError::new(error_code::GENERAL_ERROR, message)
    }

    pub fn object_not_found(id: i32) -> Self {
        DbError::new(error_code::OBJECT_NOT_FOUND, format!("object {id} not found"))
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Rendered cause text for the trace field of the error frame.
    pub fn render_trace(&self) -> String {
        if !self.trace.is_empty() {
            return self.trace.clone();
        }
        match &self.sql {
            Some(sql) => format!("{}: {}\n  at: {sql}", self.sql_state, self.message),
            None => format!("{}: {}", self.sql_state, self.message),
        }
    }

    /// True when the peer is allowed to transparently reconnect.
    pub fn is_connection_broken(&self) -> bool {
        self.error_code == error_code::CONNECTION_BROKEN
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}-{}]", self.message, self.sql_state, self.error_code)
    }
}

impl std::error::Error for DbError {}

impl From<ProtocolError> for DbError {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::UnsupportedVersion { .. } => error_code::UNSUPPORTED_PROTOCOL_VERSION,
            ProtocolError::LobMacMismatch(_) => error_code::LOB_MAC_MISMATCH,
            ProtocolError::Io(_) => error_code::CONNECTION_BROKEN,
            _ => error_code::PROTOCOL_VIOLATION,
        };
        DbError::new(code, err.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::new(error_code::CONNECTION_BROKEN, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_error_render_trace() {
        let err = DbError::general("table T not found").with_sql("SELECT * FROM T");
        assert_eq!(err.error_code, error_code::GENERAL_ERROR);
        assert_eq!(err.sql_state, "50000");
        assert!(err.render_trace().contains("SELECT * FROM T"));
    }

    #[test]
    fn protocol_error_maps_to_codes() {
        let err: DbError = ProtocolError::UnsupportedVersion {
            requested: 9,
            min: 1,
            max: 2,
        }
        .into();
        assert_eq!(err.error_code, error_code::UNSUPPORTED_PROTOCOL_VERSION);

        let err: DbError = ProtocolError::InvalidOpcode(99).into();
        assert_eq!(err.error_code, error_code::PROTOCOL_VIOLATION);
    }

    #[test]
    fn connection_broken_signal() {
        let err = DbError::new(error_code::CONNECTION_BROKEN, "peer went away");
        assert!(err.is_connection_broken());
        assert!(!DbError::general("boom").is_connection_broken());
    }
}
