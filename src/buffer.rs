//! Pooled buffers and the control block layout.
//!
//! The connection engine takes two buffers from an injected pool: a small
//! control block carved into fixed sub-ranges for header scratch and control
//! frame traffic, and a larger send buffer whose first bytes are reserved so
//! a frame header can be prepended without copying the payload. Both return
//! to the pool exactly once when the connection is disposed.

use std::sync::Mutex;

/// Reserved prefix in front of every outbound payload slice, large enough for
/// the biggest frame header (14 bytes on the wire).
pub const HEADER_PREFIX: usize = 16;

pub(crate) const HEADER_SCRATCH_SIZE: usize = 16;
pub(crate) const OUT_PING_SIZE: usize = 144;
pub(crate) const OUT_PONG_SIZE: usize = 144;
pub(crate) const IN_PING_SIZE: usize = 128;
pub(crate) const IN_PONG_SIZE: usize = 128;
pub(crate) const OUT_CLOSE_SIZE: usize = 18;
pub(crate) const IN_CLOSE_SIZE: usize = 16;

/// Size of the pooled control block.
pub const CONTROL_BLOCK_SIZE: usize = HEADER_SCRATCH_SIZE
    + OUT_PING_SIZE
    + OUT_PONG_SIZE
    + IN_PING_SIZE
    + IN_PONG_SIZE
    + OUT_CLOSE_SIZE
    + IN_CLOSE_SIZE;

/// Source of reusable byte buffers, injected into the connection engine.
///
/// `acquire` must hand out a zero-initialized buffer of exactly `size` bytes;
/// `release` takes it back for reuse.
pub trait BufferPool: Send + Sync {
    fn acquire(&self, size: usize) -> Vec<u8>;
    fn release(&self, buffer: Vec<u8>);
}

/// Simple vector-backed buffer pool.
///
/// Stores returned buffers and hands back the first one large enough on the
/// next acquire, resized to the requested length.
#[derive(Default, Debug)]
pub struct VecBufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl VecBufferPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferPool for VecBufferPool {
    fn acquire(&self, size: usize) -> Vec<u8> {
        let mut buffers = self.buffers.lock().unwrap();
        let at = buffers.iter().position(|b| b.capacity() >= size);
        match at {
            Some(at) => {
                let mut bytes = buffers.swap_remove(at);
                bytes.clear();
                bytes.resize(size, 0u8);
                bytes
            }
            None => vec![0u8; size],
        }
    }

    fn release(&self, buffer: Vec<u8>) {
        self.buffers.lock().unwrap().push(buffer);
    }
}

/// Raw parts of a leaked control block, kept so the block can be reassembled
/// and returned to the pool at disposal.
#[derive(Debug)]
pub(crate) struct RawBlock {
    ptr: *mut u8,
    len: usize,
}

// The pointer is only dereferenced through the carved slices and the one
// reassembly site; moving the handle between threads is fine.
unsafe impl Send for RawBlock {}

/// Control block carved into its disjoint sub-ranges. Each slice is owned by
/// the lock domain that uses it, so concurrent reader, writer and ping
/// traffic never alias.
pub(crate) struct ControlSlices {
    pub header_scratch: &'static mut [u8],
    pub out_ping: &'static mut [u8],
    pub out_pong: &'static mut [u8],
    pub in_ping: &'static mut [u8],
    pub in_pong: &'static mut [u8],
    pub out_close: &'static mut [u8],
    pub in_close: &'static mut [u8],
}

/// Splits a pooled block into the control sub-ranges plus the raw handle
/// needed to reassemble it.
pub(crate) fn carve_control_block(block: Vec<u8>) -> (ControlSlices, RawBlock) {
    assert_eq!(CONTROL_BLOCK_SIZE, block.len(), "control block has unexpected size");
    let leaked: &'static mut [u8] = Box::leak(block.into_boxed_slice());
    let raw = RawBlock {
        ptr: leaked.as_mut_ptr(),
        len: leaked.len(),
    };
    let (header_scratch, rest) = leaked.split_at_mut(HEADER_SCRATCH_SIZE);
    let (out_ping, rest) = rest.split_at_mut(OUT_PING_SIZE);
    let (out_pong, rest) = rest.split_at_mut(OUT_PONG_SIZE);
    let (in_ping, rest) = rest.split_at_mut(IN_PING_SIZE);
    let (in_pong, rest) = rest.split_at_mut(IN_PONG_SIZE);
    let (out_close, in_close) = rest.split_at_mut(OUT_CLOSE_SIZE);
    (
        ControlSlices {
            header_scratch,
            out_ping,
            out_pong,
            in_ping,
            in_pong,
            out_close,
            in_close,
        },
        raw,
    )
}

/// Reassembles a carved control block into the vector originally taken from
/// the pool.
///
/// # Safety
/// Every slice produced by [`carve_control_block`] for this block must have
/// been replaced with an empty slice first, and no copy of them may be used
/// afterwards.
pub(crate) unsafe fn reassemble_control_block(raw: RawBlock) -> Vec<u8> {
    unsafe { Vec::from_raw_parts(raw.ptr, raw.len, raw.len) }
}
