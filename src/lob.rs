// ABOUTME: Per-connection cache of open LOB input streams for sequential continuation
// ABOUTME: Position-tracked streams; non-contiguous reads reopen from storage

use lru::LruCache;
use std::io::{self, Read};
use std::num::NonZeroUsize;

/// An open LOB stream plus the byte position reached so far.
///
/// Invariant: `pos` equals the total number of bytes handed out of this
/// stream (skips included), so a follow-up request for the next contiguous
/// offset can continue without reopening.
pub struct CachedLobStream {
    stream: Box<dyn Read + Send>,
    pos: u64,
}

impl CachedLobStream {
    pub fn new(stream: Box<dyn Read + Send>) -> Self {
        CachedLobStream { stream, pos: 0 }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Discard `n` bytes. Fails if the stream ends first.
    pub fn skip(&mut self, n: u64) -> io::Result<()> {
        let copied = io::copy(&mut self.stream.by_ref().take(n), &mut io::sink())?;
        self.pos += copied;
        if copied < n {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("lob ended {} bytes before requested offset", n - copied),
            ));
        }
        Ok(())
    }

    /// Read up to `len` bytes; returns fewer only at end of stream.
    pub fn read_up_to(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.stream.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        self.pos += filled as u64;
        Ok(buf)
    }
}

/// LRU cache of LOB streams keyed by lob id. Evicting or replacing an
/// entry drops the stream, which closes the underlying storage handle.
pub struct LobReadCache {
    streams: LruCache<i64, CachedLobStream>,
}

impl LobReadCache {
    pub fn new(capacity: usize) -> Self {
        LobReadCache {
            streams: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Take the cached stream for `lob_id` out of the cache, if present.
    /// The caller puts it back with [`LobReadCache::insert`] once done.
    pub fn take(&mut self, lob_id: i64) -> Option<CachedLobStream> {
        self.streams.pop(&lob_id)
    }

    pub fn insert(&mut self, lob_id: i64, stream: CachedLobStream) {
        if let Some((victim, _stream)) = self.streams.push(lob_id, stream) {
            if victim != lob_id {
                tracing::debug!(lob_id = victim, "evicting cached lob stream");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }
}
