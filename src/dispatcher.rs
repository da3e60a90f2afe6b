// ABOUTME: The opcode state machine: decodes request tuples, drives the engine, writes replies
// ABOUTME: Direct operations answer on the read loop; query/update families go through workers

use crate::command::PreparedCommand;
use crate::config::{
    MAX_LOB_CHUNK, SERVER_RESULT_SET_FETCH_SIZE, TCP_PROTOCOL_VERSION_2, TCP_PROTOCOL_VERSION_CURRENT,
    TCP_PROTOCOL_VERSION_MAX, TCP_PROTOCOL_VERSION_MIN, lob_cache_capacity,
};
use crate::connection::ConnState;
use crate::engine::{ColumnMeta, ConnectionInfo, PreparedStatement, QueryResult, Session};
use crate::error::{DbError, ProtocolError, error_code};
use crate::lob::{CachedLobStream, LobReadCache};
use crate::opcode::{EXECUTE_FAILED, Opcode, Status};
use crate::transfer::{TransferIn, TransferOut, verify_lob_mac};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A request that could not be answered normally. `fatal` marks protocol
/// violations that must tear the connection down after the error frame.
struct Failure {
    id: i32,
    error: DbError,
    fatal: bool,
}

fn violation(err: ProtocolError) -> Failure {
    Failure {
        id: -1,
        error: err.into(),
        fatal: true,
    }
}

fn soft(id: i32, error: DbError) -> Failure {
    Failure {
        id,
        error,
        fatal: false,
    }
}

type HandlerResult = Result<(), Failure>;

/// Entry point for one reassembled packet. Always produces exactly one
/// reply frame per request (plus a trailing error frame when a result
/// stream breaks mid-row).
pub(crate) fn dispatch_packet(state: &Arc<ConnState>, packet: &[u8]) {
    let mut t = TransferIn::new(packet);
    let header = match t.read_i32() {
        Ok(header) => header,
        Err(_) => {
            emit_error_raw(
                state,
                -1,
                -1,
                &DbError::new(error_code::PROTOCOL_VIOLATION, "truncated packet header"),
            );
            state.request_stop();
            return;
        }
    };
    let (raw_op, is_response) = Opcode::split_header(header);
    if is_response {
        emit_error_raw(
            state,
            raw_op,
            -1,
            &DbError::new(
                error_code::PROTOCOL_VIOLATION,
                "response frame on a server connection",
            ),
        );
        state.request_stop();
        return;
    }
    let op = match Opcode::try_from(raw_op) {
        Ok(op) => op,
        Err(_) => {
            emit_error_raw(state, raw_op, -1, &ProtocolError::InvalidOpcode(raw_op).into());
            state.request_stop();
            return;
        }
    };

    let outcome = match op {
        Opcode::SessionInit => session_init(state, &mut t),
        Opcode::SessionClose => session_close(state, &mut t),
        Opcode::SessionSetId => session_set_id(state, &mut t),
        Opcode::SessionSetAutoCommit => session_set_auto_commit(state, &mut t),
        Opcode::SessionCancelStatement => session_cancel_statement(state, &mut t),

        Opcode::CommandPrepare => command_prepare(state, &mut t, false),
        Opcode::CommandPrepareReadParams => command_prepare(state, &mut t, true),

        Opcode::CommandQuery => command_query(state, &mut t, op, false, false),
        Opcode::CommandPreparedQuery => command_query(state, &mut t, op, true, false),
        Opcode::CommandDistributedQuery => command_query(state, &mut t, op, false, true),
        Opcode::CommandDistributedPreparedQuery => command_query(state, &mut t, op, true, true),

        Opcode::CommandUpdate => command_update(state, &mut t, op, false, false, false),
        Opcode::CommandPreparedUpdate => command_update(state, &mut t, op, true, false, false),
        Opcode::CommandReplicationUpdate => command_update(state, &mut t, op, false, false, true),
        Opcode::CommandReplicationPreparedUpdate => {
            command_update(state, &mut t, op, true, false, true)
        }
        Opcode::CommandDistributedUpdate => command_update(state, &mut t, op, false, true, false),
        Opcode::CommandDistributedPreparedUpdate => {
            command_update(state, &mut t, op, true, true, false)
        }

        Opcode::CommandDistributedCommit => distributed_commit(state, &mut t),
        Opcode::CommandDistributedRollback => distributed_rollback(state, &mut t),
        Opcode::CommandDistributedAddSavepoint => distributed_savepoint(state, &mut t, op, true),
        Opcode::CommandDistributedRollbackSavepoint => {
            distributed_savepoint(state, &mut t, op, false)
        }
        Opcode::CommandDistributedValidate => distributed_validate(state, &mut t),

        Opcode::CommandBatchUpdate => command_batch_update(state, &mut t),
        Opcode::CommandBatchPreparedUpdate => command_batch_prepared_update(state, &mut t),

        Opcode::CommandClose => command_close(state, &mut t),
        Opcode::CommandGetMetaData => command_get_meta_data(state, &mut t),
        Opcode::CommandReadLob => command_read_lob(state, &mut t),

        Opcode::CommandStoragePut => storage_put(state, &mut t, op, false, false),
        Opcode::CommandStorageDistributedPut => storage_put(state, &mut t, op, true, false),
        Opcode::CommandStorageReplicationPut => storage_put(state, &mut t, op, false, true),
        Opcode::CommandStorageGet => storage_get(state, &mut t, op, false),
        Opcode::CommandStorageDistributedGet => storage_get(state, &mut t, op, true),
        Opcode::CommandStorageMoveLeafPage => storage_leaf_page(state, &mut t, op, false),
        Opcode::CommandStorageRemoveLeafPage => storage_leaf_page(state, &mut t, op, true),

        Opcode::ResultFetchRows => result_fetch_rows(state, &mut t),
        Opcode::ResultReset => result_reset(state, &mut t),
        Opcode::ResultClose => result_close(state, &mut t),
        Opcode::ResultChangeId => result_change_id(state, &mut t),
    };

    if let Err(failure) = outcome {
        tracing::debug!(?op, id = failure.id, error = %failure.error, "request failed");
        emit_error(state, op, failure.id, &failure.error);
        if failure.fatal {
            state.request_stop();
        }
    }
}

// ---------------------------------------------------------------- replies

fn write_error_body(out: &mut TransferOut, version: i32, id: i32, err: &DbError) {
    out.write_status(Status::Error);
    out.write_i32(id);
    out.write_string(Some(&err.sql_state));
    out.write_string(Some(&err.message));
    out.write_string(err.sql.as_deref());
    out.write_i32(err.error_code);
    if version >= TCP_PROTOCOL_VERSION_2 {
        out.write_string(Some(&err.render_trace()));
    }
}

/// Error frame for an opcode value that may not have parsed.
pub(crate) fn emit_error_raw(state: &ConnState, raw_op: i32, id: i32, err: &DbError) {
    let mut out = TransferOut::new();
    out.write_raw_response_header(raw_op);
    write_error_body(&mut out, state.version(), id, err);
    state.send(out.finish());
}

fn emit_error(state: &ConnState, op: Opcode, id: i32, err: &DbError) {
    emit_error_raw(state, op as i32, id, err);
}

/// Replace a half-written response with an error frame, reusing the same
/// outbound packet so nothing partial ever reaches the wire.
fn emit_error_in(state: &ConnState, mut out: TransferOut, op: Opcode, id: i32, err: &DbError) {
    out.reset();
    out.write_response_header(op);
    write_error_body(&mut out, state.version(), id, err);
    state.send(out.finish());
}

/// Status for a reply: compare the session's modification counter with the
/// snapshot taken at request entry.
fn session_state(session: &Arc<dyn Session>, old_modification_id: u64) -> Status {
    if session.is_closed() {
        Status::Closed
    } else if session.modification_id() == old_modification_id {
        Status::Ok
    } else {
        Status::OkStateChanged
    }
}

fn write_tx_names(out: &mut TransferOut, session: &Arc<dyn Session>) {
    let names = session.transaction().map(|tx| tx.local_transaction_names());
    out.write_string(names.as_deref());
}

fn write_column(out: &mut TransferOut, column: &ColumnMeta) {
    out.write_string(Some(&column.alias));
    out.write_string(Some(&column.schema_name));
    out.write_string(Some(&column.table_name));
    out.write_string(Some(&column.column_name));
    out.write_i32(column.data_type as i32);
    out.write_i64(column.precision);
    out.write_i32(column.scale);
    out.write_i32(column.display_size);
    out.write_bool(column.auto_increment);
    out.write_i32(column.nullable);
}

/// Row protocol: up to `count` rows, each prefixed with `true`; a `false`
/// terminator when the result runs out first. A failing fetch still
/// terminates the frame before the caller emits the error frame, so a
/// result-bearing frame is always self-terminating.
fn write_rows(
    out: &mut TransferOut,
    result: &mut dyn QueryResult,
    count: i32,
    mac_key: &[u8],
) -> Result<(), DbError> {
    for _ in 0..count {
        match result.next_row() {
            Ok(Some(row)) => {
                out.write_bool(true);
                for value in &row {
                    out.write_value(value, Some(mac_key));
                }
            }
            Ok(None) => {
                out.write_bool(false);
                break;
            }
            Err(err) => {
                out.write_bool(false);
                return Err(err);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------- session

fn session_init(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let mut setup = || -> Result<i32, DbError> {
        let min_client_version = t.read_i32()?;
        let max_client_version = t.read_i32()?;
        if min_client_version < TCP_PROTOCOL_VERSION_MIN
            || min_client_version > TCP_PROTOCOL_VERSION_MAX
        {
            return Err(ProtocolError::UnsupportedVersion {
                requested: min_client_version,
                min: TCP_PROTOCOL_VERSION_MIN,
                max: TCP_PROTOCOL_VERSION_MAX,
            }
            .into());
        }
        let version = if max_client_version >= TCP_PROTOCOL_VERSION_CURRENT {
            TCP_PROTOCOL_VERSION_CURRENT
        } else {
            min_client_version
        };

        let database = t.read_string()?.unwrap_or_default();
        let url = t.read_string()?.unwrap_or_default();
        let user = t.read_string()?.unwrap_or_default().to_uppercase();
        let user_password_hash = t.read_bytes()?.unwrap_or_default();
        let file_password_hash = t.read_bytes()?.unwrap_or_default();
        let file_encryption_key = t.read_bytes()?;
        let n = t.read_i32()?;
        if n < 0 {
            return Err(ProtocolError::NegativeLength(n, "properties").into());
        }
        let mut properties = HashMap::with_capacity(n as usize);
        for _ in 0..n {
            let key = t.read_string()?.unwrap_or_default();
            let value = t.read_string()?.unwrap_or_default();
            properties.insert(key, value);
        }

        let info = ConnectionInfo {
            database,
            url,
            user,
            user_password_hash,
            file_password_hash,
            file_encryption_key,
            properties,
            base_dir: state.options.base_dir.clone(),
            if_exists: state.options.if_exists,
        };
        let session = state.factory.create_session(&info)?;
        if info.bool_property("IS_LOCAL") {
            session.set_local(true);
        }
        state.set_control_session(session, info);
        state.set_version(version);
        Ok(version)
    };

    match setup() {
        Ok(version) => {
            tracing::debug!(version, "session established");
            let mut out = TransferOut::response(Opcode::SessionInit);
            out.write_status(Status::Ok);
            out.write_i32(version);
            state.send(out.finish());
            Ok(())
        }
        Err(error) => Err(Failure {
            id: -1,
            error,
            fatal: true,
        }),
    }
}

fn session_set_id(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let session_id = t.read_string().map_err(violation)?;
    let control = state.control_session().map_err(|e| soft(-1, e))?;
    state.set_peer_session_id(session_id);
    let mut out = TransferOut::response(Opcode::SessionSetId);
    out.write_status(Status::Ok);
    out.write_bool(control.is_auto_commit());
    state.send(out.finish());
    Ok(())
}

fn session_set_auto_commit(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let conn_id = t.read_i32().map_err(violation)?;
    let auto_commit = t.read_bool().map_err(violation)?;
    let session = state.session(conn_id).map_err(|e| soft(-1, e))?;
    let old = session.modification_id();
    session.set_auto_commit(auto_commit);
    let mut out = TransferOut::response(Opcode::SessionSetAutoCommit);
    out.write_status(session_state(&session, old));
    state.send(out.finish());
    Ok(())
}

fn session_close(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let conn_id = t.read_i32().map_err(violation)?;
    if let Some(session) = state.sessions.remove(conn_id) {
        crate::session::close_session(&session).map_err(|e| soft(-1, e))?;
    }
    let mut out = TransferOut::response(Opcode::SessionClose);
    out.write_status(Status::Ok);
    state.send(out.finish());
    Ok(())
}

fn session_cancel_statement(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let id = t.read_i32().map_err(violation)?;
    let statement = {
        let mut objects = state.objects.lock().unwrap();
        let statement = objects.statement_if_cached(id);
        if statement.is_some() {
            objects.remove(id);
        }
        statement
    };
    if let Some(statement) = statement {
        statement.cancel();
        statement.close();
    }
    let mut out = TransferOut::response(Opcode::SessionCancelStatement);
    out.write_status(Status::Ok);
    state.send(out.finish());
    Ok(())
}

// --------------------------------------------------------------- prepare

fn command_prepare(state: &Arc<ConnState>, t: &mut TransferIn<'_>, read_params: bool) -> HandlerResult {
    let op = if read_params {
        Opcode::CommandPrepareReadParams
    } else {
        Opcode::CommandPrepare
    };
    let id = t.read_i32().map_err(violation)?;
    let conn_id = t.read_i32().map_err(violation)?;
    let sql = t.read_string().map_err(violation)?.unwrap_or_default();

    let session = state.session(conn_id).map_err(|e| soft(id, e))?;
    let old = session.modification_id();
    let statement = session
        .prepare_statement(&sql, SERVER_RESULT_SET_FETCH_SIZE)
        .map_err(|e| soft(id, e.with_sql(&sql)))?;
    let is_query = statement.is_query();
    let params = read_params.then(|| statement.parameters());
    state.objects.lock().unwrap().add_statement(id, statement);

    let mut out = TransferOut::response(op);
    out.write_status(session_state(&session, old));
    out.write_i32(id);
    out.write_bool(is_query);
    if let Some(params) = params {
        out.write_i32(params.len() as i32);
        for p in &params {
            out.write_i32(p.data_type as i32);
            out.write_i64(p.precision);
            out.write_i32(p.scale);
            out.write_i32(p.nullable);
        }
    }
    state.send(out.finish());
    Ok(())
}

// ---------------------------------------------------------- query/update

fn read_parameter_values(
    state: &ConnState,
    t: &mut TransferIn<'_>,
) -> Result<Vec<Value>, ProtocolError> {
    let n = t.read_i32()?;
    if n < 0 {
        return Err(ProtocolError::NegativeLength(n, "parameters"));
    }
    let mut values = Vec::with_capacity(n as usize);
    for _ in 0..n {
        values.push(t.read_value(Some(&state.lob_mac_key))?);
    }
    Ok(values)
}

/// Resolve the statement a query/update acts on: the cached one for
/// prepared variants (with fresh parameter values bound), or an ephemeral
/// one prepared from the SQL text in the request.
fn resolve_statement(
    state: &Arc<ConnState>,
    t: &mut TransferIn<'_>,
    session: &Arc<dyn Session>,
    id: i32,
    prepared: bool,
    fetch_size: i32,
) -> Result<(Arc<dyn PreparedStatement>, bool), Failure> {
    if prepared {
        let statement = state
            .objects
            .lock()
            .unwrap()
            .statement(id)
            .map_err(|e| soft(id, e))?;
        let values = read_parameter_values(state, t).map_err(violation)?;
        statement.set_parameter_values(values).map_err(|e| soft(id, e))?;
        statement.set_fetch_size(fetch_size);
        Ok((statement, false))
    } else {
        let sql = t.read_string().map_err(violation)?.unwrap_or_default();
        let statement = session
            .prepare_statement(&sql, fetch_size)
            .map_err(|e| soft(id, e.with_sql(&sql)))?;
        Ok((statement, true))
    }
}

fn command_query(
    state: &Arc<ConnState>,
    t: &mut TransferIn<'_>,
    op: Opcode,
    prepared: bool,
    distributed: bool,
) -> HandlerResult {
    let id = t.read_i32().map_err(violation)?;
    let conn_id = t.read_i32().map_err(violation)?;
    let object_id = t.read_i32().map_err(violation)?;
    let max_rows = t.read_i32().map_err(violation)?;
    let fetch_size = t.read_i32().map_err(violation)?;

    let session = state.session(conn_id).map_err(|e| soft(id, e))?;
    if distributed {
        session.set_auto_commit(false);
        session.set_root(false);
    }
    let (statement, ephemeral) = resolve_statement(state, t, &session, id, prepared, fetch_size)?;
    let old = session.modification_id();

    let worker_state = Arc::clone(state);
    let worker_session = Arc::clone(&session);
    let worker_statement = Arc::clone(&statement);
    let action = Box::new(move || {
        execute_query(
            worker_state,
            op,
            id,
            object_id,
            worker_session,
            worker_statement,
            max_rows,
            fetch_size,
            distributed,
            old,
            ephemeral,
        );
    });
    state.enqueue(PreparedCommand::new(session, Some(statement), action));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn execute_query(
    state: Arc<ConnState>,
    op: Opcode,
    id: i32,
    object_id: i32,
    session: Arc<dyn Session>,
    statement: Arc<dyn PreparedStatement>,
    max_rows: i32,
    fetch_size: i32,
    distributed: bool,
    old_modification_id: u64,
    ephemeral: bool,
) {
    match statement.query(max_rows, false) {
        Ok(mut result) => {
            let mut out = TransferOut::response(op);
            out.write_status(session_state(&session, old_modification_id));
            out.write_i32(id);
            if distributed {
                write_tx_names(&mut out, &session);
            }
            let row_count = result.row_count();
            let columns = result.columns().to_vec();
            out.write_i32(columns.len() as i32);
            out.write_i32(row_count);
            for column in &columns {
                write_column(&mut out, column);
            }
            let batch = if row_count < 0 {
                fetch_size
            } else {
                row_count.min(fetch_size)
            };
            let row_err = write_rows(&mut out, result.as_mut(), batch, &state.lob_mac_key);
            state.send(out.finish());
            if let Err(err) = row_err {
                emit_error(&state, op, id, &err);
            }
            state.objects.lock().unwrap().add_result(object_id, result);
        }
        Err(err) => emit_error(&state, op, id, &err),
    }
    if ephemeral {
        statement.close();
    }
}

fn command_update(
    state: &Arc<ConnState>,
    t: &mut TransferIn<'_>,
    op: Opcode,
    prepared: bool,
    distributed: bool,
    replication: bool,
) -> HandlerResult {
    let id = t.read_i32().map_err(violation)?;
    let conn_id = t.read_i32().map_err(violation)?;

    let session = state.session(conn_id).map_err(|e| soft(id, e))?;
    if distributed {
        session.set_auto_commit(false);
        session.set_root(false);
    }
    if replication {
        let name = t.read_string().map_err(violation)?.unwrap_or_default();
        session.set_replication_name(&name);
    }
    let (statement, ephemeral) =
        resolve_statement(state, t, &session, id, prepared, SERVER_RESULT_SET_FETCH_SIZE)?;
    let old = session.modification_id();

    let worker_state = Arc::clone(state);
    let worker_session = Arc::clone(&session);
    let worker_statement = Arc::clone(&statement);
    let action = Box::new(move || {
        match worker_statement.update() {
            Ok(update_count) => {
                let mut out = TransferOut::response(op);
                out.write_status(session_state(&worker_session, old));
                out.write_i32(id);
                if distributed {
                    write_tx_names(&mut out, &worker_session);
                }
                out.write_i32(update_count);
                worker_state.send(out.finish());
            }
            Err(err) => emit_error(&worker_state, op, id, &err),
        }
        if ephemeral {
            worker_statement.close();
        }
    });
    state.enqueue(PreparedCommand::new(session, Some(statement), action));
    Ok(())
}

// ----------------------------------------------------------------- batch

fn command_batch_update(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let op = Opcode::CommandBatchUpdate;
    let id = t.read_i32().map_err(violation)?;
    let conn_id = t.read_i32().map_err(violation)?;
    let size = t.read_i32().map_err(violation)?;
    if size < 0 {
        return Err(violation(ProtocolError::NegativeLength(size, "batch")));
    }
    let mut statements = Vec::with_capacity(size as usize);
    for _ in 0..size {
        statements.push(t.read_string().map_err(violation)?.unwrap_or_default());
    }
    let session = state.session(conn_id).map_err(|e| soft(id, e))?;
    let old = session.modification_id();

    let worker_state = Arc::clone(state);
    let worker_session = Arc::clone(&session);
    let action = Box::new(move || {
        let mut counts = Vec::with_capacity(statements.len());
        for sql in &statements {
            // One bad item must not abort the rest of the batch.
            let count = worker_session
                .prepare_statement(sql, SERVER_RESULT_SET_FETCH_SIZE)
                .and_then(|stmt| {
                    let count = stmt.update();
                    stmt.close();
                    count
                })
                .unwrap_or(EXECUTE_FAILED);
            counts.push(count);
        }
        let mut out = TransferOut::response(op);
        out.write_status(session_state(&worker_session, old));
        out.write_i32(id);
        for count in counts {
            out.write_i32(count);
        }
        worker_state.send(out.finish());
    });
    state.enqueue(PreparedCommand::new(session, None, action));
    Ok(())
}

fn command_batch_prepared_update(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let op = Opcode::CommandBatchPreparedUpdate;
    let id = t.read_i32().map_err(violation)?;
    let conn_id = t.read_i32().map_err(violation)?;
    let size = t.read_i32().map_err(violation)?;
    if size < 0 {
        return Err(violation(ProtocolError::NegativeLength(size, "batch")));
    }
    let mut rows = Vec::with_capacity(size as usize);
    for _ in 0..size {
        rows.push(read_parameter_values(state, t).map_err(violation)?);
    }
    let session = state.session(conn_id).map_err(|e| soft(id, e))?;
    let statement = state
        .objects
        .lock()
        .unwrap()
        .statement(id)
        .map_err(|e| soft(id, e))?;
    let old = session.modification_id();

    let worker_state = Arc::clone(state);
    let worker_session = Arc::clone(&session);
    let worker_statement = Arc::clone(&statement);
    let action = Box::new(move || {
        let mut counts = Vec::with_capacity(rows.len());
        for values in rows {
            let count = worker_statement
                .set_parameter_values(values)
                .and_then(|()| worker_statement.update())
                .unwrap_or(EXECUTE_FAILED);
            counts.push(count);
        }
        let mut out = TransferOut::response(op);
        out.write_status(session_state(&worker_session, old));
        out.write_i32(id);
        for count in counts {
            out.write_i32(count);
        }
        worker_state.send(out.finish());
    });
    state.enqueue(PreparedCommand::new(session, Some(statement), action));
    Ok(())
}

// ---------------------------------------------------- distributed control

fn distributed_commit(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let conn_id = t.read_i32().map_err(violation)?;
    let tx_names = t.read_string().map_err(violation)?;
    let session = state.session(conn_id).map_err(|e| soft(-1, e))?;
    let old = session.modification_id();
    session
        .commit(tx_names.is_none(), tx_names.as_deref())
        .map_err(|e| soft(-1, e))?;
    let mut out = TransferOut::response(Opcode::CommandDistributedCommit);
    out.write_status(session_state(&session, old));
    state.send(out.finish());
    Ok(())
}

fn distributed_rollback(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let conn_id = t.read_i32().map_err(violation)?;
    let session = state.session(conn_id).map_err(|e| soft(-1, e))?;
    let old = session.modification_id();
    session.rollback().map_err(|e| soft(-1, e))?;
    let mut out = TransferOut::response(Opcode::CommandDistributedRollback);
    out.write_status(session_state(&session, old));
    state.send(out.finish());
    Ok(())
}

fn distributed_savepoint(
    state: &Arc<ConnState>,
    t: &mut TransferIn<'_>,
    op: Opcode,
    add: bool,
) -> HandlerResult {
    let conn_id = t.read_i32().map_err(violation)?;
    let name = t.read_string().map_err(violation)?.unwrap_or_default();
    let session = state.session(conn_id).map_err(|e| soft(-1, e))?;
    let old = session.modification_id();
    let result = if add {
        session.add_savepoint(&name)
    } else {
        session.rollback_to_savepoint(&name)
    };
    result.map_err(|e| soft(-1, e))?;
    let mut out = TransferOut::response(op);
    out.write_status(session_state(&session, old));
    state.send(out.finish());
    Ok(())
}

fn distributed_validate(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let conn_id = t.read_i32().map_err(violation)?;
    let tx_name = t.read_string().map_err(violation)?.unwrap_or_default();
    let session = state.session(conn_id).map_err(|e| soft(-1, e))?;
    let old = session.modification_id();
    let valid = session.validate_transaction(&tx_name).map_err(|e| soft(-1, e))?;
    let mut out = TransferOut::response(Opcode::CommandDistributedValidate);
    out.write_status(session_state(&session, old));
    out.write_bool(valid);
    state.send(out.finish());
    Ok(())
}

// --------------------------------------------------------------- objects

fn command_close(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let id = t.read_i32().map_err(violation)?;
    state.objects.lock().unwrap().free(id);
    let mut out = TransferOut::response(Opcode::CommandClose);
    out.write_status(Status::Ok);
    out.write_i32(id);
    state.send(out.finish());
    Ok(())
}

fn command_get_meta_data(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let id = t.read_i32().map_err(violation)?;
    let object_id = t.read_i32().map_err(violation)?;
    let statement = state
        .objects
        .lock()
        .unwrap()
        .statement(id)
        .map_err(|e| soft(id, e))?;
    let meta = statement.metadata().map_err(|e| soft(id, e))?;
    let columns = meta.columns().to_vec();
    state.objects.lock().unwrap().add_result(object_id, meta);

    let mut out = TransferOut::response(Opcode::CommandGetMetaData);
    out.write_status(Status::Ok);
    out.write_i32(id);
    out.write_i32(columns.len() as i32);
    for column in &columns {
        write_column(&mut out, column);
    }
    state.send(out.finish());
    Ok(())
}

fn result_fetch_rows(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let op = Opcode::ResultFetchRows;
    let id = t.read_i32().map_err(violation)?;
    let count = t.read_i32().map_err(violation)?;

    let mut out = TransferOut::response(op);
    out.write_status(Status::Ok);
    out.write_i32(id);
    let row_err = {
        let mut objects = state.objects.lock().unwrap();
        let result = objects.result(id).map_err(|e| soft(id, e))?;
        write_rows(&mut out, result, count, &state.lob_mac_key)
    };
    state.send(out.finish());
    if let Err(err) = row_err {
        emit_error(state, op, id, &err);
    }
    Ok(())
}

fn result_reset(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let id = t.read_i32().map_err(violation)?;
    state
        .objects
        .lock()
        .unwrap()
        .result(id)
        .map_err(|e| soft(id, e))?
        .reset();
    let mut out = TransferOut::response(Opcode::ResultReset);
    out.write_status(Status::Ok);
    out.write_i32(id);
    state.send(out.finish());
    Ok(())
}

fn result_close(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let id = t.read_i32().map_err(violation)?;
    state.objects.lock().unwrap().free(id);
    let mut out = TransferOut::response(Opcode::ResultClose);
    out.write_status(Status::Ok);
    out.write_i32(id);
    state.send(out.finish());
    Ok(())
}

fn result_change_id(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let old_id = t.read_i32().map_err(violation)?;
    let new_id = t.read_i32().map_err(violation)?;
    state
        .objects
        .lock()
        .unwrap()
        .rename(old_id, new_id)
        .map_err(|e| soft(old_id, e))?;
    let mut out = TransferOut::response(Opcode::ResultChangeId);
    out.write_status(Status::Ok);
    out.write_i32(old_id);
    state.send(out.finish());
    Ok(())
}

// --------------------------------------------------------------- storage

fn storage_put(
    state: &Arc<ConnState>,
    t: &mut TransferIn<'_>,
    op: Opcode,
    distributed: bool,
    replication: bool,
) -> HandlerResult {
    let conn_id = t.read_i32().map_err(violation)?;
    let map_name = t.read_string().map_err(violation)?.unwrap_or_default();
    let replication_name = if replication {
        Some(t.read_string().map_err(violation)?.unwrap_or_default())
    } else {
        None
    };
    let key_bytes = t.read_buffer().map_err(violation)?;
    let value_bytes = t.read_buffer().map_err(violation)?;

    let session = state.session(conn_id).map_err(|e| soft(-1, e))?;
    if distributed {
        session.set_auto_commit(false);
        session.set_root(false);
    }
    if let Some(name) = replication_name {
        session.set_replication_name(&name);
    }
    let old = session.modification_id();

    let mut out = TransferOut::response(op);
    let body = (|| -> Result<(), DbError> {
        let map = session.storage_map(&map_name)?;
        let key = map.key_type().decode(&key_bytes)?;
        let value = map.value_type().decode(&value_bytes)?;
        let previous = map.put(key, value)?;
        out.write_status(session_state(&session, old));
        if distributed {
            write_tx_names(&mut out, &session);
        }
        match previous {
            Some(previous) => {
                let encoded = map.value_type().encode(&previous)?;
                out.write_bytes(Some(&encoded));
            }
            None => out.write_bytes(None),
        }
        Ok(())
    })();
    match body {
        Ok(()) => state.send(out.finish()),
        Err(err) => emit_error_in(state, out, op, -1, &err),
    }
    Ok(())
}

fn storage_get(
    state: &Arc<ConnState>,
    t: &mut TransferIn<'_>,
    op: Opcode,
    distributed: bool,
) -> HandlerResult {
    let conn_id = t.read_i32().map_err(violation)?;
    let map_name = t.read_string().map_err(violation)?.unwrap_or_default();
    let key_bytes = t.read_buffer().map_err(violation)?;

    let session = state.session(conn_id).map_err(|e| soft(-1, e))?;
    if distributed {
        session.set_auto_commit(false);
        session.set_root(false);
    }
    let old = session.modification_id();

    let mut out = TransferOut::response(op);
    let body = (|| -> Result<(), DbError> {
        let map = session.storage_map(&map_name)?;
        let key = map.key_type().decode(&key_bytes)?;
        let found = map.get(&key)?;
        out.write_status(session_state(&session, old));
        if distributed {
            write_tx_names(&mut out, &session);
        }
        match found {
            Some(found) => {
                let encoded = map.value_type().encode(&found)?;
                out.write_bytes(Some(&encoded));
            }
            None => out.write_bytes(None),
        }
        Ok(())
    })();
    match body {
        Ok(()) => state.send(out.finish()),
        Err(err) => emit_error_in(state, out, op, -1, &err),
    }
    Ok(())
}

fn storage_leaf_page(
    state: &Arc<ConnState>,
    t: &mut TransferIn<'_>,
    op: Opcode,
    remove: bool,
) -> HandlerResult {
    let conn_id = t.read_i32().map_err(violation)?;
    let map_name = t.read_string().map_err(violation)?.unwrap_or_default();
    let session = state.session(conn_id).map_err(|e| soft(-1, e))?;
    let old = session.modification_id();
    let map = session.storage_map(&map_name).map_err(|e| soft(-1, e))?;
    if remove {
        let key = t.read_buffer().map_err(violation)?;
        if let Some(replication) = map.replication() {
            replication.remove_leaf_page(&key).map_err(|e| soft(-1, e))?;
        }
    } else {
        let split_key = t.read_buffer().map_err(violation)?;
        let page = t.read_buffer().map_err(violation)?;
        if let Some(replication) = map.replication() {
            replication.add_leaf_page(&split_key, &page).map_err(|e| soft(-1, e))?;
        }
    }
    // Maps without the replication capability silently accept the page.
    let mut out = TransferOut::response(op);
    out.write_status(session_state(&session, old));
    state.send(out.finish());
    Ok(())
}

// ------------------------------------------------------------------ lobs

fn command_read_lob(state: &Arc<ConnState>, t: &mut TransferIn<'_>) -> HandlerResult {
    let lob_id = t.read_i64().map_err(violation)?;
    let hmac = t.read_buffer().map_err(violation)?;
    let offset = t.read_i64().map_err(violation)?;
    let length = t.read_i32().map_err(violation)?;

    verify_lob_mac(&state.lob_mac_key, lob_id, &hmac)
        .map_err(|e| soft(-1, e.into()))?;
    let length = (length.max(0) as usize).min(MAX_LOB_CHUNK);
    let control = state.control_session().map_err(|e| soft(-1, e))?;

    let cached = state
        .lobs
        .lock()
        .unwrap()
        .get_or_insert_with(|| LobReadCache::new(lob_cache_capacity()))
        .take(lob_id);

    let read = (|| -> Result<(CachedLobStream, Vec<u8>), DbError> {
        let mut stream = match cached {
            Some(stream) if stream.pos() == offset as u64 => stream,
            _ => {
                // Cold or non-contiguous: reopen from storage and skip.
                let raw = control.lob_storage().open_input_stream(lob_id, &hmac, -1)?;
                let mut stream = CachedLobStream::new(raw);
                stream.skip(offset as u64)?;
                stream
            }
        };
        let data = stream.read_up_to(length)?;
        Ok((stream, data))
    })();

    match read {
        Ok((stream, data)) => {
            state
                .lobs
                .lock()
                .unwrap()
                .get_or_insert_with(|| LobReadCache::new(lob_cache_capacity()))
                .insert(lob_id, stream);
            let mut out = TransferOut::response(Opcode::CommandReadLob);
            out.write_status(Status::Ok);
            out.write_i32(data.len() as i32);
            out.write_raw(&data);
            state.send(out.finish());
            Ok(())
        }
        Err(error) => Err(soft(-1, error)),
    }
}
