//! Explicitly freed transfer buffers
//!
//! A [`TransferBuffer`] is the memory a read fills or a write drains. It is
//! shared between the caller and the command engine by cloning the handle,
//! but its lifetime is controlled by an explicit [`TransferBuffer::free`]:
//! once freed, every access fails with [`ClientError::UseAfterFree`] no matter
//! which clone is used. The region is a tagged `Live`/`Freed` state checked at
//! every entry point.

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::trace;

use crate::error::{ClientError, ClientResult, CommandError};

/// Zero-copy window over a live buffer
///
/// Holding a view locks the buffer; the engine reports
/// [`CommandError::BufferBusy`] if it needs the buffer meanwhile.
pub type BufferView<'a> = MappedMutexGuard<'a, [u8]>;

enum Region {
    Live(BytesMut),
    Freed,
}

/// Explicitly owned, explicitly freed memory for read/write payloads
#[derive(Clone)]
pub struct TransferBuffer {
    region: Arc<Mutex<Region>>,
    len: usize,
}

impl TransferBuffer {
    /// Allocate a buffer whose contents the caller must not rely on
    ///
    /// Safe Rust cannot hand out uninitialized memory, so the region is
    /// zero-filled like [`TransferBuffer::allocate_zeroed`].
    pub fn allocate(len: usize) -> Self {
        Self::from_region(BytesMut::zeroed(len))
    }

    /// Allocate a zero-filled buffer
    pub fn allocate_zeroed(len: usize) -> Self {
        Self::from_region(BytesMut::zeroed(len))
    }

    /// Allocate a buffer holding a copy of `data`
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::from_region(BytesMut::from(data))
    }

    fn from_region(bytes: BytesMut) -> Self {
        let len = bytes.len();
        Self {
            region: Arc::new(Mutex::new(Region::Live(bytes))),
            len,
        }
    }

    /// Size the buffer was allocated with (still reported after free)
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has zero length
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `free()` has been called on any clone
    pub fn is_freed(&self) -> bool {
        matches!(*self.region.lock(), Region::Freed)
    }

    /// Zero-copy mutable window over the live region
    ///
    /// Writes through the view are visible to later reads of this buffer.
    pub fn view(&self) -> ClientResult<BufferView<'_>> {
        MutexGuard::try_map(self.region.lock(), |region| match region {
            Region::Live(bytes) => Some(&mut bytes[..]),
            Region::Freed => None,
        })
        .map_err(|_| ClientError::UseAfterFree)
    }

    /// Copy the current contents into caller-owned memory
    pub fn snapshot(&self) -> ClientResult<BytesMut> {
        match &*self.region.lock() {
            Region::Live(bytes) => Ok(BytesMut::from(&bytes[..])),
            Region::Freed => Err(ClientError::UseAfterFree),
        }
    }

    /// Read one byte
    pub fn get(&self, index: usize) -> ClientResult<u8> {
        match &*self.region.lock() {
            Region::Live(bytes) => bytes.get(index).copied().ok_or(ClientError::OutOfRange {
                index,
                count: bytes.len(),
            }),
            Region::Freed => Err(ClientError::UseAfterFree),
        }
    }

    /// Write one byte
    pub fn set(&self, index: usize, value: u8) -> ClientResult<()> {
        match &mut *self.region.lock() {
            Region::Live(bytes) => {
                let count = bytes.len();
                let slot = bytes
                    .get_mut(index)
                    .ok_or(ClientError::OutOfRange { index, count })?;
                *slot = value;
                Ok(())
            }
            Region::Freed => Err(ClientError::UseAfterFree),
        }
    }

    /// Release the region; freeing twice is a no-op
    pub fn free(&self) {
        let mut guard = self.region.lock();
        if let Region::Live(_) = *guard {
            trace!(len = self.len, "freeing transfer buffer");
            *guard = Region::Freed;
        }
    }

    /// Copy `data` into the region at `offset` on behalf of a read command
    pub(crate) fn fill_from(&self, offset: usize, data: &[u8]) -> Result<(), CommandError> {
        self.with_region(|bytes| match bytes.get_mut(offset..offset + data.len()) {
            Some(dst) => {
                dst.copy_from_slice(data);
                Ok(())
            }
            None => Err(CommandError::Malformed(format!(
                "{} bytes at offset {} overrun a {} byte buffer",
                data.len(),
                offset,
                bytes.len()
            ))),
        })
    }

    /// Zero `len` bytes at `offset` (read hole)
    pub(crate) fn fill_zero(&self, offset: usize, len: usize) -> Result<(), CommandError> {
        self.with_region(|bytes| match bytes.get_mut(offset..offset + len) {
            Some(dst) => {
                dst.fill(0);
                Ok(())
            }
            None => Err(CommandError::Malformed(format!(
                "hole of {} bytes at offset {} overruns a {} byte buffer",
                len,
                offset,
                bytes.len()
            ))),
        })
    }

    /// Copy `len` bytes starting at `offset` out of the region (write payload)
    pub(crate) fn read_into(
        &self,
        offset: usize,
        out: &mut BytesMut,
        len: usize,
    ) -> Result<(), CommandError> {
        self.with_region(|bytes| match bytes.get(offset..offset + len) {
            Some(src) => {
                out.extend_from_slice(src);
                Ok(())
            }
            None => Err(CommandError::Malformed(format!(
                "payload of {} bytes at offset {} overruns a {} byte buffer",
                len,
                offset,
                bytes.len()
            ))),
        })
    }

    fn with_region<R>(
        &self,
        f: impl FnOnce(&mut BytesMut) -> Result<R, CommandError>,
    ) -> Result<R, CommandError> {
        let mut guard = self.region.try_lock().ok_or(CommandError::BufferBusy)?;
        match &mut *guard {
            Region::Live(bytes) => f(bytes),
            Region::Freed => Err(CommandError::BufferFreed),
        }
    }
}

impl fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("len", &self.len)
            .field("freed", &self.is_freed())
            .finish()
    }
}
