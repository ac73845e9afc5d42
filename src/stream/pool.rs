// Size-classed buffer pool and chunk pool. Reuses allocations across
// streams; anything larger than the biggest class bypasses pooling.

use bytes::Bytes;
use std::sync::Mutex;
use std::sync::OnceLock;

const SMALL_BUFFER_SIZE: usize = 4 * 1024;
const MEDIUM_BUFFER_SIZE: usize = 64 * 1024;
const LARGE_BUFFER_SIZE: usize = 1024 * 1024;

/// Max buffers retained per size class.
const MAX_POOLED: usize = 64;

pub struct BufferPool {
    small: Mutex<Vec<Vec<u8>>>,
    medium: Mutex<Vec<Vec<u8>>>,
    large: Mutex<Vec<Vec<u8>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            small: Mutex::new(Vec::new()),
            medium: Mutex::new(Vec::new()),
            large: Mutex::new(Vec::new()),
        }
    }

    /// The process-wide default pool.
    pub fn global() -> &'static BufferPool {
        static GLOBAL: OnceLock<BufferPool> = OnceLock::new();
        GLOBAL.get_or_init(BufferPool::new)
    }

    /// Returns an empty buffer with capacity >= `size`.
    pub fn get(&self, size: usize) -> Vec<u8> {
        let (class, class_size) = if size <= SMALL_BUFFER_SIZE {
            (&self.small, SMALL_BUFFER_SIZE)
        } else if size <= MEDIUM_BUFFER_SIZE {
            (&self.medium, MEDIUM_BUFFER_SIZE)
        } else if size <= LARGE_BUFFER_SIZE {
            (&self.large, LARGE_BUFFER_SIZE)
        } else {
            // Oversize request: allocate directly, never pooled.
            return Vec::with_capacity(size);
        };

        if let Some(buf) = class.lock().unwrap().pop() {
            return buf;
        }
        Vec::with_capacity(class_size)
    }

    /// Returns a buffer to the pool, cleared. A buffer always lands in the
    /// class its capacity satisfies, never a smaller one.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let cap = buf.capacity();
        let class = if cap > LARGE_BUFFER_SIZE {
            return; // oversize, drop
        } else if cap >= LARGE_BUFFER_SIZE {
            &self.large
        } else if cap >= MEDIUM_BUFFER_SIZE {
            &self.medium
        } else if cap >= SMALL_BUFFER_SIZE {
            &self.small
        } else {
            return; // under the smallest class, drop
        };

        let mut pooled = class.lock().unwrap();
        if pooled.len() < MAX_POOLED {
            pooled.push(buf);
        }
    }

    /// Drop all retained buffers. For tests.
    pub fn clear(&self) {
        self.small.lock().unwrap().clear();
        self.medium.lock().unwrap().clear();
        self.large.lock().unwrap().clear();
    }
}

/// Stream envelope carried between the pipeline and the HTTP writer.
#[derive(Debug, Default)]
pub struct Chunk {
    pub payload: Option<Bytes>,
    pub err: Option<String>,
}

pub struct ChunkPool {
    pool: Mutex<Vec<Box<Chunk>>>,
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkPool {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn global() -> &'static ChunkPool {
        static GLOBAL: OnceLock<ChunkPool> = OnceLock::new();
        GLOBAL.get_or_init(ChunkPool::new)
    }

    pub fn get(&self) -> Box<Chunk> {
        self.pool
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Box::new(Chunk::default()))
    }

    /// Payload fields are cleared before the chunk returns to the pool so
    /// pooled chunks never retain stream data.
    pub fn put(&self, mut chunk: Box<Chunk>) {
        chunk.payload = None;
        chunk.err = None;
        let mut pooled = self.pool.lock().unwrap();
        if pooled.len() < MAX_POOLED {
            pooled.push(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_has_zero_len_and_capacity() {
        let pool = BufferPool::new();
        let buf = pool.get(100);
        assert_eq!(buf.len(), 0);
        assert!(buf.capacity() >= 100);
    }

    #[test]
    fn test_put_reuses_buffer() {
        let pool = BufferPool::new();
        let mut buf = pool.get(SMALL_BUFFER_SIZE);
        buf.extend_from_slice(b"data");
        let cap = buf.capacity();
        pool.put(buf);

        let again = pool.get(SMALL_BUFFER_SIZE);
        assert_eq!(again.len(), 0);
        assert_eq!(again.capacity(), cap);
    }

    #[test]
    fn test_oversize_not_pooled() {
        let pool = BufferPool::new();
        let buf = pool.get(LARGE_BUFFER_SIZE * 2);
        assert!(buf.capacity() >= LARGE_BUFFER_SIZE * 2);
        pool.put(buf);
        // A fresh large-class get must not return the oversize buffer.
        let next = pool.get(LARGE_BUFFER_SIZE);
        assert!(next.capacity() <= LARGE_BUFFER_SIZE * 2 - 1);
    }

    #[test]
    fn test_medium_capacity_never_lands_in_small() {
        let pool = BufferPool::new();
        let buf = pool.get(MEDIUM_BUFFER_SIZE);
        pool.put(buf);
        // Small-class get allocates fresh rather than handing out the
        // medium buffer.
        assert!(pool.small.lock().unwrap().is_empty());
        assert_eq!(pool.medium.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_chunk_pool_clears_fields() {
        let pool = ChunkPool::new();
        let mut chunk = pool.get();
        chunk.payload = Some(Bytes::from_static(b"x"));
        chunk.err = Some("e".to_string());
        pool.put(chunk);

        let again = pool.get();
        assert!(again.payload.is_none());
        assert!(again.err.is_none());
    }
}
