// ABOUTME: Server-side connection: socket read loop, serialized writer, shared state
// ABOUTME: Owns the codec, reassembler, caches, session registry, and command queue

use crate::cache::ObjectCache;
use crate::command::{CommandHandlerPool, CommandQueue, PreparedCommand};
use crate::config::{IO_BUFFER_SIZE, SERVER_CACHED_OBJECTS, ServerOptions, TCP_PROTOCOL_VERSION_MIN};
use crate::dispatcher;
use crate::engine::{ConnectionInfo, Session, SessionFactory};
use crate::error::{DbError, ProtocolError, error_code};
use crate::lob::LobReadCache;
use crate::reassembler::PacketReassembler;
use crate::session::{SessionRegistry, close_session};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

static NEXT_AFFINITY: AtomicU64 = AtomicU64::new(0);

/// Shared per-connection state, reachable from the read loop and from
/// command workers. Everything here is scoped to one connection and never
/// leaks across connections.
pub(crate) struct ConnState {
    pub(crate) factory: Arc<dyn SessionFactory>,
    pub(crate) options: ServerOptions,
    pool: Arc<CommandHandlerPool>,
    queue: Arc<CommandQueue>,
    affinity: u64,
    writer: mpsc::UnboundedSender<Bytes>,
    pub(crate) objects: Mutex<ObjectCache>,
    pub(crate) sessions: SessionRegistry,
    pub(crate) lobs: Mutex<Option<LobReadCache>>,
    control: Mutex<Option<Arc<dyn Session>>>,
    conn_info: Mutex<Option<Arc<ConnectionInfo>>>,
    peer_session_id: Mutex<Option<String>>,
    version: AtomicI32,
    stop: AtomicBool,
    pub(crate) lob_mac_key: [u8; 32],
}

impl ConnState {
    /// Enqueue a whole response frame. Frames are written to the socket in
    /// enqueue order by a single writer task, which is what makes the
    /// codec's write side mutually exclusive per connection.
    pub(crate) fn send(&self, frame: Bytes) {
        if self.writer.send(frame).is_err() {
            // Transport is gone; no further writes will be attempted.
            self.request_stop();
        }
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn version(&self) -> i32 {
        self.version.load(Ordering::SeqCst)
    }

    pub(crate) fn set_version(&self, version: i32) {
        self.version.store(version, Ordering::SeqCst);
    }

    pub(crate) fn set_control_session(&self, session: Arc<dyn Session>, info: ConnectionInfo) {
        *self.control.lock().unwrap() = Some(session);
        *self.conn_info.lock().unwrap() = Some(Arc::new(info));
    }

    pub(crate) fn control_session(&self) -> Result<Arc<dyn Session>, DbError> {
        self.control.lock().unwrap().clone().ok_or_else(|| {
            DbError::new(error_code::SESSION_NOT_INITIALIZED, "session not initialized")
        })
    }

    pub(crate) fn connection_info(&self) -> Result<Arc<ConnectionInfo>, DbError> {
        self.conn_info.lock().unwrap().clone().ok_or_else(|| {
            DbError::new(error_code::SESSION_NOT_INITIALIZED, "session not initialized")
        })
    }

    pub(crate) fn set_peer_session_id(&self, id: Option<String>) {
        *self.peer_session_id.lock().unwrap() = id;
    }

    pub(crate) fn peer_session_id(&self) -> Option<String> {
        self.peer_session_id.lock().unwrap().clone()
    }

    /// Resolve the logical session for a wire connection id, creating it
    /// on first use from the stored connection parameters.
    pub(crate) fn session(&self, conn_id: i32) -> Result<Arc<dyn Session>, DbError> {
        let info = self.connection_info()?;
        self.sessions.get_or_create(conn_id, &self.factory, &info)
    }

    /// Queue a deferred command and wake this connection's affine worker.
    pub(crate) fn enqueue(&self, command: PreparedCommand) {
        self.queue.push(command);
        self.pool.submit(self.affinity, Arc::clone(&self.queue));
    }
}

/// One accepted socket. Created by the acceptor, driven by
/// [`Connection::run`] until the peer goes away or a protocol violation
/// stops it.
pub struct Connection {
    state: Arc<ConnState>,
    reassembler: PacketReassembler,
    writer_rx: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl Connection {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        options: ServerOptions,
        pool: Arc<CommandHandlerPool>,
    ) -> Self {
        let (writer, writer_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ConnState {
            factory,
            options,
            pool,
            queue: Arc::new(CommandQueue::new()),
            affinity: NEXT_AFFINITY.fetch_add(1, Ordering::Relaxed),
            writer,
            objects: Mutex::new(ObjectCache::new(SERVER_CACHED_OBJECTS)),
            sessions: SessionRegistry::new(),
            lobs: Mutex::new(None),
            control: Mutex::new(None),
            conn_info: Mutex::new(None),
            peer_session_id: Mutex::new(None),
            version: AtomicI32::new(TCP_PROTOCOL_VERSION_MIN),
            stop: AtomicBool::new(false),
            lob_mac_key: rand::random(),
        });
        Connection {
            state,
            reassembler: PacketReassembler::new(),
            writer_rx: Some(writer_rx),
        }
    }

    /// Service the connection until EOF, error, or stop.
    pub async fn run(mut self, socket: TcpStream) -> crate::Result<()> {
        let Some(mut writer_rx) = self.writer_rx.take() else {
            return Ok(()); // already running
        };
        let peer = socket.peer_addr().ok();
        tracing::debug!(?peer, "connection accepted");

        let (mut read_half, write_half) = socket.into_split();
        let writer_task = tokio::spawn(async move {
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

        let mut buf = BytesMut::with_capacity(IO_BUFFER_SIZE);
        let result = loop {
            if self.state.stopped() {
                break Ok(());
            }
            let n = match read_half.read_buf(&mut buf).await {
                Ok(n) => n,
                Err(err) => break Err(ProtocolError::from(err)),
            };
            if n == 0 {
                if self.reassembler.pending_len() > 0 {
                    tracing::warn!(?peer, "peer closed the socket mid-frame");
                }
                break Ok(());
            }
            let chunk = buf.split();
            if let Err(err) = self.process_chunk(&chunk) {
                // Oversized or unparseable framing: one error frame, then stop.
                dispatcher::emit_error_raw(&self.state, -1, -1, &DbError::from(err));
                self.state.request_stop();
                break Ok(());
            }
        };

        let session_id = self.state.peer_session_id();
        self.teardown();
        drop(self.state);
        let _ = writer_task.await;
        tracing::debug!(?peer, ?session_id, "connection closed");
        result
    }

    /// Feed one chunk of socket bytes through the reassembler and dispatch
    /// every completed packet, in wire order.
    pub(crate) fn process_chunk(&mut self, chunk: &[u8]) -> Result<(), ProtocolError> {
        for packet in self.reassembler.feed(chunk)? {
            dispatcher::dispatch_packet(&self.state, &packet);
            if self.state.stopped() {
                break;
            }
        }
        Ok(())
    }

    fn teardown(&self) {
        self.state.request_stop();
        self.state.queue.cancel_all();
        for session in self.state.sessions.drain() {
            if let Err(err) = close_session(&session) {
                tracing::debug!(%err, "error closing logical session");
            }
        }
        if let Some(control) = self.state.control.lock().unwrap().take() {
            if let Err(err) = close_session(&control) {
                tracing::debug!(%err, "error closing control session");
            }
        }
        self.state.objects.lock().unwrap().clear();
        if let Some(lobs) = self.state.lobs.lock().unwrap().as_mut() {
            lobs.clear();
        }
        self.state.set_peer_session_id(None);
    }
}
