//! Per-thread buffer pool management.
//!
//! Each connection of an event loop owns one fixed-size buffer for as long as
//! it is open. Buffers are recycled through a free list instead of being
//! allocated per connection. The pool grows when the free list runs dry, so
//! the number of connections is never capped by it.
//!
//! Buffer storage never moves once allocated, which is what lets io_uring
//! hold raw pointers into it across submissions.

/// Per-thread buffer pool with fixed-size buffers.
pub struct BufferPool {
    /// Actual buffer storage.
    buffers: Vec<Box<[u8]>>,
    /// Stack of available buffer indices (LIFO for cache locality).
    free_list: Vec<usize>,
    /// Size of each buffer.
    buffer_size: usize,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `count` - Number of buffers to pre-allocate
    /// * `size` - Size of each buffer in bytes
    pub fn new(count: usize, size: usize) -> Self {
        let mut buffers = Vec::with_capacity(count);
        let mut free_list = Vec::with_capacity(count);

        for i in 0..count {
            buffers.push(vec![0u8; size].into_boxed_slice());
            free_list.push(i);
        }

        Self {
            buffers,
            free_list,
            buffer_size: size,
        }
    }

    /// Allocate a buffer from the pool, growing it if none are free.
    pub fn alloc(&mut self) -> usize {
        match self.free_list.pop() {
            Some(idx) => idx,
            None => {
                self.buffers
                    .push(vec![0u8; self.buffer_size].into_boxed_slice());
                self.buffers.len() - 1
            }
        }
    }

    /// Return a buffer to the pool.
    pub fn free(&mut self, idx: usize) {
        debug_assert!(idx < self.buffers.len(), "buffer index out of bounds");
        self.free_list.push(idx);
    }

    /// Get an immutable reference to a buffer.
    ///
    /// # Panics
    /// Panics if `idx` is out of bounds.
    pub fn get(&self, idx: usize) -> &[u8] {
        &self.buffers[idx]
    }

    /// Get a mutable reference to a buffer.
    ///
    /// # Panics
    /// Panics if `idx` is out of bounds.
    pub fn get_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.buffers[idx]
    }

    /// Get a mutable pointer to a buffer for FFI.
    ///
    /// The pointer stays valid until the pool is dropped, even if the pool
    /// grows in the meantime.
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    pub fn get_ptr(&mut self, idx: usize) -> *mut u8 {
        self.buffers[idx].as_mut_ptr()
    }

    /// Get the size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}
