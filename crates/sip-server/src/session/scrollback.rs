//! Circular buffer for output replay on attach.
//!
//! Stores the last N bytes of PTY output so that a newly attached client
//! sees what was on screen without the command having to redraw it.

/// A fixed-capacity circular byte buffer.
#[derive(Debug)]
pub struct ScrollbackBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Next write position (wraps around).
    write_pos: usize,
    /// Total bytes ever appended (used to detect wrap).
    total_written: u64,
}

impl ScrollbackBuffer {
    /// Create a new buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            total_written: 0,
        }
    }

    /// Append output, overwriting the oldest bytes once full.
    pub fn append(&mut self, data: &[u8]) {
        self.total_written += data.len() as u64;
        if self.capacity == 0 {
            return;
        }

        // Only the tail can survive an append longer than the buffer.
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let first = data.len().min(self.capacity - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&data[first..]);
        }
        self.write_pos = (self.write_pos + data.len()) % self.capacity;
    }

    /// Buffered contents in emission order.
    pub fn snapshot(&self) -> Vec<u8> {
        let len = self.len();
        let mut out = Vec::with_capacity(len);
        if len < self.capacity {
            out.extend_from_slice(&self.buf[..len]);
        } else {
            // Full: oldest byte sits at write_pos.
            out.extend_from_slice(&self.buf[self.write_pos..]);
            out.extend_from_slice(&self.buf[..self.write_pos]);
        }
        out
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        if self.total_written >= self.capacity as u64 {
            self.capacity
        } else {
            self.total_written as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes ever appended, including those since overwritten.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}
