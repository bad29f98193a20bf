//! Reusable receive buffers.
//!
//! Every in-flight request holds one buffer of `packet_buf_size` bytes.
//! Returning buffers to a free list keeps the hot path allocation-free at
//! steady state; the list is capped so a burst does not pin memory forever.

use tokio::sync::Mutex;

const MAX_IDLE_BUFFERS: usize = 1024;

pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
}

impl BufferPool {
    pub fn new(buf_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buf_size,
        }
    }

    /// Take a buffer, allocating a fresh one when the free list is empty.
    /// The buffer's full length is usable as a receive target.
    pub async fn get(&self) -> Vec<u8> {
        match self.free.lock().await.pop() {
            Some(buf) => buf,
            None => vec![0u8; self.buf_size],
        }
    }

    /// Return a buffer. Safe from any task, including after a panic was
    /// caught; oversized or undersized buffers are dropped instead.
    pub async fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.buf_size {
            return;
        }
        let mut free = self.free.lock().await;
        if free.len() < MAX_IDLE_BUFFERS {
            free.push(buf);
        }
    }

    pub async fn idle(&self) -> usize {
        self.free.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_allocates_and_put_recycles() {
        let pool = BufferPool::new(512);
        let buf = pool.get().await;
        assert_eq!(buf.len(), 512);
        assert_eq!(pool.idle().await, 0);

        pool.put(buf).await;
        assert_eq!(pool.idle().await, 1);

        let again = pool.get().await;
        assert_eq!(again.len(), 512);
        assert_eq!(pool.idle().await, 0);
    }

    #[tokio::test]
    async fn test_foreign_buffer_is_dropped() {
        let pool = BufferPool::new(512);
        pool.put(vec![0u8; 64]).await;
        assert_eq!(pool.idle().await, 0);
    }
}
