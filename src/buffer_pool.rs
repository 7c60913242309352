use std::sync::Arc;
use tokio::sync::Mutex;

/// Size of every relay buffer handed out by the pool
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

const MAX_POOL_SIZE: usize = 256;

/// Pool of fixed-size relay buffers shared by all copy operations of a server.
///
/// Owned by the server instance and passed to the relays that need it.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    /// Create a pool of [`RELAY_BUFFER_SIZE`] buffers
    pub fn new() -> Self {
        Self::with_buffer_size(RELAY_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
            buffer_size,
            max_pooled: MAX_POOL_SIZE,
        }
    }

    /// Get a buffer from the pool or create a new one
    pub async fn get_buffer(&self) -> Vec<u8> {
        let size = self.buffer_size;
        let mut pool = self.buffers.lock().await;

        match pool.pop() {
            Some(mut buffer) => {
                debug_assert!(buffer.capacity() >= size);
                buffer.resize(size, 0);
                buffer
            }
            None => vec![0u8; size],
        }
    }

    /// Return a buffer to the pool for reuse
    pub async fn return_buffer(&self, mut buffer: Vec<u8>) {
        let expected_size = self.buffer_size;

        // Reject buffers with wrong capacity to avoid memory bloat
        if buffer.capacity() < expected_size || buffer.capacity() > expected_size * 2 {
            return;
        }

        // Zero the buffer on return to avoid leaking data between sessions
        buffer.clear();
        buffer.resize(expected_size, 0);

        let mut pool = self.buffers.lock().await;
        if pool.len() < self.max_pooled {
            pool.push(buffer);
        }
    }

    /// Lease a buffer that goes back to the pool when dropped
    pub async fn lease(self: &Arc<Self>) -> BufferLease {
        let buffer = self.get_buffer().await;
        BufferLease {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    pub async fn stats(&self) -> BufferPoolStats {
        let available = self.buffers.lock().await.len();
        BufferPoolStats {
            buffers_available: available,
            total_memory_pooled: available * self.buffer_size,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    pub buffers_available: usize,
    pub total_memory_pooled: usize,
}

/// RAII lease that returns the buffer to its pool on drop
pub struct BufferLease {
    buffer: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl BufferLease {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.buffer.as_mut() {
            Some(buffer) => buffer.as_mut_slice(),
            None => &mut [],
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let pool = Arc::clone(&self.pool);
            // Return the buffer asynchronously without blocking drop
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    pool.return_buffer(buffer).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffer_pool_basic_operations() {
        let pool = BufferPool::new();

        let buf = pool.get_buffer().await;
        assert_eq!(buf.len(), RELAY_BUFFER_SIZE);

        pool.return_buffer(buf).await;
        assert_eq!(pool.stats().await.buffers_available, 1);

        // Should reuse the pooled buffer
        let reused = pool.get_buffer().await;
        assert_eq!(reused.len(), RELAY_BUFFER_SIZE);
        assert_eq!(pool.stats().await.buffers_available, 0);
    }

    #[tokio::test]
    async fn test_buffer_pool_size_limit() {
        let pool = BufferPool::with_buffer_size(1024);

        let buffers: Vec<Vec<u8>> = (0..MAX_POOL_SIZE + 50).map(|_| vec![0u8; 1024]).collect();
        for buf in buffers {
            pool.return_buffer(buf).await;
        }

        let stats = pool.stats().await;
        assert_eq!(stats.buffers_available, MAX_POOL_SIZE);
        assert_eq!(stats.total_memory_pooled, MAX_POOL_SIZE * 1024);
    }

    #[tokio::test]
    async fn test_buffer_pool_wrong_size_rejection() {
        let pool = BufferPool::new();

        pool.return_buffer(vec![0u8; 4_096]).await;

        assert_eq!(pool.stats().await.buffers_available, 0);
    }

    #[tokio::test]
    async fn test_reused_buffer_length_and_zeroing() {
        let pool = BufferPool::with_buffer_size(512);

        let mut buf = pool.get_buffer().await;
        let capacity = buf.capacity();

        // Modify contents and shrink length to simulate consumer behavior
        buf.fill(0xAA);
        buf.truncate(128);

        pool.return_buffer(buf).await;

        let reused = pool.get_buffer().await;
        assert_eq!(reused.len(), 512);
        assert_eq!(reused.capacity(), capacity);
        assert!(reused.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_lease_returns_buffer_on_drop() {
        let pool = Arc::new(BufferPool::with_buffer_size(256));

        {
            let mut lease = pool.lease().await;
            assert_eq!(lease.as_mut_slice().len(), 256);
            lease.as_mut_slice()[0] = 1;
        }

        // The return happens on a spawned task
        for _ in 0..50 {
            if pool.stats().await.buffers_available == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.stats().await.buffers_available, 1);
    }
}
