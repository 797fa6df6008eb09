//! Pooled owned byte buffers for data in flight.
//!
//! A [LogicalPacket] is one application-level message (or one coalesced group of
//!  them). It is held by `Arc` so the send queue and any physical-packet fragment
//!  descriptors can share it without copying - a fragment is just an offset and
//!  length into its parent. The backing `Vec` goes back to the pool's bounded
//!  free list once the last reference drops.

use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

pub struct PacketPool {
    max_pooled: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl PacketPool {
    pub fn new(max_pooled: usize) -> Arc<PacketPool> {
        Arc::new(PacketPool {
            max_pooled,
            buffers: Mutex::new(Vec::new()),
        })
    }

    /// Creates a logical packet holding a copy of `data`, reusing a pooled
    ///  buffer when one is available.
    pub fn get(self: &Arc<Self>, data: &[u8]) -> LogicalPacket {
        let mut buf = self.take_buffer();
        buf.extend_from_slice(data);
        LogicalPacket {
            data: buf,
            pool: Arc::downgrade(self),
        }
    }

    /// Like [PacketPool::get] but the caller fills the buffer through the
    ///  returned packet's `data_mut`.
    pub fn get_empty(self: &Arc<Self>) -> LogicalPacket {
        LogicalPacket {
            data: self.take_buffer(),
            pool: Arc::downgrade(self),
        }
    }

    fn take_buffer(&self) -> Vec<u8> {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(buffer) = buffers.pop() {
            trace!("returning buffer from pool");
            return buffer;
        }
        drop(buffers);
        Vec::new()
    }

    fn recycle(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if buffers.len() < self.max_pooled {
            buffers.push(buffer);
        }
        // discarded otherwise
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub struct LogicalPacket {
    data: Vec<u8>,
    pool: Weak<PacketPool>,
}

impl LogicalPacket {
    /// A packet without pool affiliation, for tests and one-off buffers.
    pub fn from_vec(data: Vec<u8>) -> LogicalPacket {
        LogicalPacket {
            data,
            pool: Weak::new(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for LogicalPacket {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}
