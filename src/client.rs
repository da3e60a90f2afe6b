// ABOUTME: Client role of the wire protocol: sends requests, correlates responses
// ABOUTME: Id-keyed callback table for queued operations, FIFO expectations for direct ones

use crate::config::{TCP_PROTOCOL_VERSION_CURRENT, TCP_PROTOCOL_VERSION_MIN};
use crate::engine::ConnectionInfo;
use crate::error::{DbError, error_code};
use crate::opcode::{Opcode, Status};
use crate::reassembler::PacketReassembler;
use crate::transfer::{TransferIn, TransferOut};
use crate::value::LobRef;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};

fn broken(message: &str) -> DbError {
    DbError::new(error_code::CONNECTION_BROKEN, message)
}

/// A single-shot handler for one pending response.
///
/// Two shapes exist: one materializes the integer update count, the other
/// hands the raw payload (positioned right after the echoed id) to the
/// caller.
pub enum AsyncCallback {
    UpdateCount(oneshot::Sender<Result<i32, DbError>>),
    Transfer(Box<dyn FnOnce(Result<(Status, Bytes), DbError>) + Send>),
}

impl AsyncCallback {
    fn complete(self, status: Status, payload: Bytes) {
        match self {
            AsyncCallback::UpdateCount(tx) => {
                let mut t = TransferIn::new(&payload);
                let _ = tx.send(t.read_i32().map_err(Into::into));
            }
            AsyncCallback::Transfer(handler) => handler(Ok((status, payload))),
        }
    }

    fn fail(self, err: DbError) {
        match self {
            AsyncCallback::UpdateCount(tx) => {
                let _ = tx.send(Err(err));
            }
            AsyncCallback::Transfer(handler) => handler(Err(err)),
        }
    }
}

/// Correlation table from request id to pending handler. Entries are
/// removed when fulfilled, so responses may return in any order.
#[derive(Default)]
pub struct CallbackTable {
    pending: Mutex<HashMap<i32, AsyncCallback>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        CallbackTable::default()
    }

    pub fn register(&self, id: i32, callback: AsyncCallback) -> Result<(), DbError> {
        let mut pending = self.pending.lock().unwrap();
        if pending.contains_key(&id) {
            return Err(DbError::general(format!("request id {id} already in flight")));
        }
        pending.insert(id, callback);
        Ok(())
    }

    pub fn take(&self, id: i32) -> Option<AsyncCallback> {
        self.pending.lock().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&self) -> Vec<AsyncCallback> {
        self.pending.lock().unwrap().drain().map(|(_, cb)| cb).collect()
    }
}

type SessionExpectation = oneshot::Sender<Result<(Status, Bytes), DbError>>;

struct ClientShared {
    callbacks: CallbackTable,
    session_ops: Mutex<VecDeque<SessionExpectation>>,
    version: AtomicI32,
    reconnect_permitted: AtomicBool,
}

impl ClientShared {
    fn fail_all(&self, err: &DbError) {
        for callback in self.callbacks.drain() {
            callback.fail(err.clone());
        }
        for expectation in self.session_ops.lock().unwrap().drain(..) {
            let _ = expectation.send(Err(err.clone()));
        }
    }
}

/// Client end of one database connection.
///
/// Queued operations (query/update/batch families) are correlated by
/// request id through the callback table. Direct operations (session,
/// storage, LOB) are answered by the server in dispatch order, so their
/// expectations form a simple FIFO.
pub struct ClientConnection {
    shared: Arc<ClientShared>,
    writer: mpsc::UnboundedSender<Bytes>,
    next_id: AtomicI32,
}

impl ClientConnection {
    /// Connect and run the session-setup handshake. The returned value is
    /// ready for use: the one-shot readiness signal has fired and the
    /// negotiated protocol version is recorded.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        info: &ConnectionInfo,
    ) -> Result<Self, DbError> {
        let socket = TcpStream::connect(addr).await?;
        ClientConnection::handshake(socket, info).await
    }

    async fn handshake(socket: TcpStream, info: &ConnectionInfo) -> Result<Self, DbError> {
        let (mut read_half, write_half) = socket.into_split();
        let (writer, mut writer_rx) = mpsc::unbounded_channel::<Bytes>();
        tokio::spawn(async move {
            let mut stream = BufWriter::new(write_half);
            while let Some(frame) = writer_rx.recv().await {
                if stream.write_all(&frame).await.is_err() {
                    break;
                }
                if stream.flush().await.is_err() {
                    break;
                }
            }
            let _ = stream.shutdown().await;
        });

        let shared = Arc::new(ClientShared {
            callbacks: CallbackTable::new(),
            session_ops: Mutex::new(VecDeque::new()),
            version: AtomicI32::new(TCP_PROTOCOL_VERSION_MIN),
            reconnect_permitted: AtomicBool::new(false),
        });

        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut reassembler = PacketReassembler::new();
            let mut buf = BytesMut::with_capacity(crate::config::IO_BUFFER_SIZE);
            loop {
                match read_half.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let chunk = buf.split();
                match reassembler.feed(&chunk) {
                    Ok(packets) => {
                        for packet in packets {
                            handle_response(&reader_shared, &packet);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "bad frame from server");
                        break;
                    }
                }
            }
            reader_shared.reconnect_permitted.store(true, Ordering::SeqCst);
            reader_shared.fail_all(&broken("connection closed"));
        });

        let client = ClientConnection {
            shared,
            writer,
            next_id: AtomicI32::new(1),
        };

        let mut out = TransferOut::request(Opcode::SessionInit);
        out.write_i32(TCP_PROTOCOL_VERSION_MIN);
        out.write_i32(TCP_PROTOCOL_VERSION_CURRENT);
        out.write_string(Some(&info.database));
        out.write_string(Some(&info.url));
        out.write_string(Some(&info.user));
        out.write_bytes(Some(&info.user_password_hash));
        out.write_bytes(Some(&info.file_password_hash));
        out.write_bytes(info.file_encryption_key.as_deref());
        out.write_i32(info.properties.len() as i32);
        for (key, value) in &info.properties {
            out.write_string(Some(key));
            out.write_string(Some(value));
        }
        let (_, payload) = client.session_request(out).await?;
        let version = TransferIn::new(&payload).read_i32()?;
        client.shared.version.store(version, Ordering::SeqCst);
        tracing::debug!(version, "connected");
        Ok(client)
    }

    /// Protocol version agreed with the server.
    pub fn protocol_version(&self) -> i32 {
        self.shared.version.load(Ordering::SeqCst)
    }

    /// True once the server (or the transport) signalled that this
    /// connection is broken and a reconnect is allowed.
    pub fn reconnect_permitted(&self) -> bool {
        self.shared.reconnect_permitted.load(Ordering::SeqCst)
    }

    /// Allocate a request id for a queued operation.
    pub fn next_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send_frame(&self, frame: Bytes) -> Result<(), DbError> {
        self.writer
            .send(frame)
            .map_err(|_| broken("connection closed"))
    }

    /// Issue a direct (non-queued) request and await its in-order reply.
    async fn session_request(&self, out: TransferOut) -> Result<(Status, Bytes), DbError> {
        let (tx, rx) = oneshot::channel();
        // Registered before the frame leaves, so the FIFO matches wire order.
        self.shared.session_ops.lock().unwrap().push_back(tx);
        self.send_frame(out.finish())?;
        rx.await.map_err(|_| broken("connection closed"))?
    }

    /// Tell the server the id under which this session is tracked.
    /// Returns the server's auto-commit flag.
    pub async fn set_session_id(&self, session_id: &str) -> Result<bool, DbError> {
        let mut out = TransferOut::request(Opcode::SessionSetId);
        out.write_string(Some(session_id));
        let (_, payload) = self.session_request(out).await?;
        TransferIn::new(&payload).read_bool().map_err(Into::into)
    }

    pub async fn set_auto_commit(&self, conn_id: i32, auto_commit: bool) -> Result<Status, DbError> {
        let mut out = TransferOut::request(Opcode::SessionSetAutoCommit);
        out.write_i32(conn_id);
        out.write_bool(auto_commit);
        let (status, _) = self.session_request(out).await?;
        Ok(status)
    }

    pub async fn close_session(&self, conn_id: i32) -> Result<(), DbError> {
        let mut out = TransferOut::request(Opcode::SessionClose);
        out.write_i32(conn_id);
        self.session_request(out).await.map(|_| ())
    }

    /// Stream a slice of a LOB the server has shown us.
    pub async fn read_lob(&self, lob: &LobRef, offset: i64, length: i32) -> Result<Vec<u8>, DbError> {
        let mut out = TransferOut::request(Opcode::CommandReadLob);
        out.write_i64(lob.lob_id);
        out.write_buffer(&lob.hmac);
        out.write_i64(offset);
        out.write_i32(length);
        let (_, payload) = self.session_request(out).await?;
        let mut t = TransferIn::new(&payload);
        let n = t.read_i32()?;
        Ok(t.read_raw(n.max(0) as usize)?)
    }

    /// Queued request with a raw-payload callback. `build` writes the
    /// request body after the leading id.
    pub async fn send_command(
        &self,
        op: Opcode,
        build: impl FnOnce(&mut TransferOut),
    ) -> Result<(Status, Bytes), DbError> {
        let id = self.next_id();
        self.send_command_with_id(op, id, build).await
    }

    pub async fn send_command_with_id(
        &self,
        op: Opcode,
        id: i32,
        build: impl FnOnce(&mut TransferOut),
    ) -> Result<(Status, Bytes), DbError> {
        let (tx, rx) = oneshot::channel();
        self.shared.callbacks.register(
            id,
            AsyncCallback::Transfer(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        )?;
        let mut out = TransferOut::request(op);
        out.write_i32(id);
        build(&mut out);
        if let Err(err) = self.send_frame(out.finish()) {
            self.shared.callbacks.take(id);
            return Err(err);
        }
        rx.await.map_err(|_| broken("connection closed"))?
    }

    /// Execute a one-shot update statement; resolves to the update count.
    pub async fn execute_update(&self, conn_id: i32, sql: &str) -> Result<i32, DbError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.shared
            .callbacks
            .register(id, AsyncCallback::UpdateCount(tx))?;
        let mut out = TransferOut::request(Opcode::CommandUpdate);
        out.write_i32(id);
        out.write_i32(conn_id);
        out.write_string(Some(sql));
        if let Err(err) = self.send_frame(out.finish()) {
            self.shared.callbacks.take(id);
            return Err(err);
        }
        rx.await.map_err(|_| broken("connection closed"))?
    }

    /// Execute a one-shot query; resolves to the raw response payload
    /// after the echoed id (tx-names for distributed variants, column and
    /// row data).
    pub async fn execute_query(
        &self,
        conn_id: i32,
        object_id: i32,
        max_rows: i32,
        fetch_size: i32,
        sql: &str,
    ) -> Result<(Status, Bytes), DbError> {
        let sql = sql.to_string();
        self.send_command(Opcode::CommandQuery, move |out| {
            out.write_i32(conn_id);
            out.write_i32(object_id);
            out.write_i32(max_rows);
            out.write_i32(fetch_size);
            out.write_string(Some(&sql));
        })
        .await
    }
}

fn handle_response(shared: &Arc<ClientShared>, packet: &[u8]) {
    let mut t = TransferIn::new(packet);
    let Ok(header) = t.read_i32() else {
        tracing::warn!("truncated response header");
        return;
    };
    let (raw_op, is_response) = Opcode::split_header(header);
    if !is_response {
        tracing::warn!(raw_op, "request frame on a client connection");
        return;
    }
    let Ok(op) = Opcode::try_from(raw_op) else {
        tracing::warn!(raw_op, "unknown opcode in response");
        return;
    };
    let Ok(status) = t.read_status() else {
        tracing::warn!(?op, "unreadable status");
        return;
    };

    if op.echoes_id() {
        let Ok(id) = t.read_i32() else {
            tracing::warn!(?op, "response without correlation id");
            return;
        };
        let Some(callback) = shared.callbacks.take(id) else {
            tracing::warn!(?op, id, "response for unknown request id");
            return;
        };
        if status == Status::Error {
            callback.fail(read_error_body(shared, &mut t));
        } else {
            callback.complete(status, Bytes::from(t.read_rest()));
        }
    } else {
        let Some(expectation) = shared.session_ops.lock().unwrap().pop_front() else {
            tracing::warn!(?op, "unexpected direct response");
            return;
        };
        if status == Status::Error {
            let _ = t.read_i32(); // id slot, always -1 for direct operations
            let _ = expectation.send(Err(read_error_body(shared, &mut t)));
        } else {
            let _ = expectation.send(Ok((status, Bytes::from(t.read_rest()))));
        }
    }
}

fn read_error_body(shared: &ClientShared, t: &mut TransferIn<'_>) -> DbError {
    let parsed = (|| -> Result<DbError, crate::error::ProtocolError> {
        let sql_state = t.read_string()?.unwrap_or_default();
        let message = t.read_string()?.unwrap_or_default();
        let sql = t.read_string()?;
        let error_code = t.read_i32()?;
        // Protocol v1 peers do not send the trace field.
        let trace = if t.remaining() > 0 {
            t.read_string()?.unwrap_or_default()
        } else {
            String::new()
        };
        Ok(DbError {
            sql_state,
            message,
            sql,
            error_code,
            trace,
        })
    })();
    let err = parsed.unwrap_or_else(|_| broken("unreadable error frame"));
    if err.is_connection_broken() {
        shared.reconnect_permitted.store(true, Ordering::SeqCst);
    }
    err
}
