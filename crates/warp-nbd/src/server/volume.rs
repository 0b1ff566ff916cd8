//! Backing storage for served exports

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::NbdError;
use crate::wire::{extent_flags, Extent};

/// Volume result type; errors are the errno sent back to the client
pub type VolumeResult<T> = Result<T, NbdError>;

/// Granularity at which [`MemoryVolume`] reports holes
pub const HOLE_GRANULARITY: u64 = 4096;

/// Volume I/O trait for NBD operations
#[async_trait]
pub trait VolumeIO: Send + Sync {
    /// Size in bytes
    fn size(&self) -> u64;

    /// Read data from the volume
    async fn read(&self, offset: u64, length: u32) -> VolumeResult<Vec<u8>>;

    /// Write data to the volume
    async fn write(&self, offset: u64, data: &[u8]) -> VolumeResult<()>;

    /// Flush pending writes
    async fn flush(&self) -> VolumeResult<()> {
        Ok(())
    }

    /// Trim/discard a range
    async fn trim(&self, offset: u64, length: u32) -> VolumeResult<()>;

    /// Write zeros to a range
    async fn write_zeroes(&self, offset: u64, length: u32, fast: bool) -> VolumeResult<()>;

    /// Allocation map of a range, as reported for `base:allocation`
    fn extents(&self, _offset: u64, length: u32) -> Vec<Extent> {
        vec![Extent { length, flags: 0 }]
    }
}

fn check_range(size: u64, offset: u64, length: u64) -> VolumeResult<()> {
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(NbdError::Inval),
    }
}

/// RAM-backed volume
pub struct MemoryVolume {
    data: RwLock<Vec<u8>>,
    flush_count: AtomicU64,
}

impl MemoryVolume {
    /// Zero-filled volume
    pub fn new(size: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size as usize]),
            flush_count: AtomicU64::new(0),
        }
    }

    /// Volume holding a copy of `data`
    pub fn with_data(data: &[u8]) -> Self {
        Self {
            data: RwLock::new(data.to_vec()),
            flush_count: AtomicU64::new(0),
        }
    }

    /// Copy of the current contents
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Number of flushes received
    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }

    fn zero(&self, offset: u64, length: u32) -> VolumeResult<()> {
        let mut storage = self.data.write();
        check_range(storage.len() as u64, offset, length as u64)?;
        let start = offset as usize;
        storage[start..start + length as usize].fill(0);
        Ok(())
    }
}

#[async_trait]
impl VolumeIO for MemoryVolume {
    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    async fn read(&self, offset: u64, length: u32) -> VolumeResult<Vec<u8>> {
        let data = self.data.read();
        check_range(data.len() as u64, offset, length as u64)?;
        let start = offset as usize;
        Ok(data[start..start + length as usize].to_vec())
    }

    async fn write(&self, offset: u64, data: &[u8]) -> VolumeResult<()> {
        let mut storage = self.data.write();
        check_range(storage.len() as u64, offset, data.len() as u64)?;
        let start = offset as usize;
        storage[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn flush(&self) -> VolumeResult<()> {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn trim(&self, offset: u64, length: u32) -> VolumeResult<()> {
        self.zero(offset, length)
    }

    async fn write_zeroes(&self, offset: u64, length: u32, _fast: bool) -> VolumeResult<()> {
        self.zero(offset, length)
    }

    /// All-zero blocks are reported as holes
    fn extents(&self, offset: u64, length: u32) -> Vec<Extent> {
        let data = self.data.read();
        let end = offset.saturating_add(length as u64).min(data.len() as u64);
        let mut extents: Vec<Extent> = Vec::new();
        let mut pos = offset;
        while pos < end {
            let block_end = ((pos / HOLE_GRANULARITY + 1) * HOLE_GRANULARITY).min(end);
            let zero = data[pos as usize..block_end as usize].iter().all(|&b| b == 0);
            let flags = if zero {
                extent_flags::STATE_HOLE | extent_flags::STATE_ZERO
            } else {
                0
            };
            let len = (block_end - pos) as u32;
            match extents.last_mut() {
                Some(last) if last.flags == flags => last.length += len,
                _ => extents.push(Extent { length: len, flags }),
            }
            pos = block_end;
        }
        extents
    }
}

/// Byte at `offset` of the pattern: every 8-byte word holds its own
/// offset, big-endian
pub fn pattern_byte(offset: u64) -> u8 {
    (offset & !7).to_be_bytes()[(offset & 7) as usize]
}

/// Fill `buf` with the pattern starting at `offset`
pub fn fill_pattern(offset: u64, buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = pattern_byte(offset + i as u64);
    }
}

/// Read-only volume of deterministic content (see [`pattern_byte`])
pub struct PatternVolume {
    size: u64,
}

impl PatternVolume {
    /// Create a pattern volume
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

#[async_trait]
impl VolumeIO for PatternVolume {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read(&self, offset: u64, length: u32) -> VolumeResult<Vec<u8>> {
        check_range(self.size, offset, length as u64)?;
        let mut data = vec![0u8; length as usize];
        fill_pattern(offset, &mut data);
        Ok(data)
    }

    async fn write(&self, _offset: u64, _data: &[u8]) -> VolumeResult<()> {
        Err(NbdError::Perm)
    }

    async fn trim(&self, _offset: u64, _length: u32) -> VolumeResult<()> {
        Err(NbdError::Perm)
    }

    async fn write_zeroes(&self, _offset: u64, _length: u32, _fast: bool) -> VolumeResult<()> {
        Err(NbdError::Perm)
    }
}

/// Write-only sink that checks incoming data against the pattern
///
/// Nothing is stored; the sink records the offset of every write in
/// arrival order along with the number of bytes that did not match.
pub struct VerifyingSink {
    size: u64,
    offsets: Mutex<Vec<u64>>,
    bytes_written: AtomicU64,
    mismatched: AtomicU64,
    flush_count: AtomicU64,
}

impl VerifyingSink {
    /// Create a sink
    pub fn new(size: u64) -> Self {
        Self {
            size,
            offsets: Mutex::new(Vec::new()),
            bytes_written: AtomicU64::new(0),
            mismatched: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
        }
    }

    /// Write offsets in the order they arrived
    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().clone()
    }

    /// Whether writes arrived in strictly ascending offset order
    pub fn is_ascending(&self) -> bool {
        self.offsets.lock().windows(2).all(|w| w[0] < w[1])
    }

    /// Total bytes written
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Bytes that differed from the pattern
    pub fn mismatched(&self) -> u64 {
        self.mismatched.load(Ordering::Relaxed)
    }

    /// Number of flushes received
    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl VolumeIO for VerifyingSink {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read(&self, offset: u64, length: u32) -> VolumeResult<Vec<u8>> {
        check_range(self.size, offset, length as u64)?;
        Ok(vec![0u8; length as usize])
    }

    async fn write(&self, offset: u64, data: &[u8]) -> VolumeResult<()> {
        check_range(self.size, offset, data.len() as u64)?;
        let bad = data
            .iter()
            .enumerate()
            .filter(|&(i, &b)| b != pattern_byte(offset + i as u64))
            .count();
        self.offsets.lock().push(offset);
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.mismatched.fetch_add(bad as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> VolumeResult<()> {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn trim(&self, _offset: u64, _length: u32) -> VolumeResult<()> {
        Err(NbdError::NotSup)
    }

    async fn write_zeroes(&self, _offset: u64, _length: u32, _fast: bool) -> VolumeResult<()> {
        Err(NbdError::NotSup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_volume_read_write() {
        let volume = MemoryVolume::new(4096);

        let data = b"hello world";
        volume.write(0, data).await.unwrap();

        let result = volume.read(0, data.len() as u32).await.unwrap();
        assert_eq!(result, data);
    }

    #[tokio::test]
    async fn test_memory_volume_trim() {
        let volume = MemoryVolume::new(4096);

        volume.write(0, &[0xFF; 100]).await.unwrap();
        volume.trim(0, 100).await.unwrap();

        let result = volume.read(0, 100).await.unwrap();
        assert!(result.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_memory_volume_flush() {
        let volume = MemoryVolume::new(4096);

        volume.flush().await.unwrap();
        volume.flush().await.unwrap();

        assert_eq!(volume.flush_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_volume_bounds_check() {
        let volume = MemoryVolume::new(100);

        assert_eq!(volume.read(50, 100).await, Err(NbdError::Inval));
        assert_eq!(volume.write(50, &[0; 100]).await, Err(NbdError::Inval));
        assert_eq!(volume.read(u64::MAX, 1).await, Err(NbdError::Inval));
    }

    #[tokio::test]
    async fn test_memory_volume_extents_merge() {
        let volume = MemoryVolume::new(4 * HOLE_GRANULARITY);
        volume.write(HOLE_GRANULARITY, &[1]).await.unwrap();
        volume.write(2 * HOLE_GRANULARITY, &[1]).await.unwrap();

        let hole = extent_flags::STATE_HOLE | extent_flags::STATE_ZERO;
        let extents = volume.extents(0, 4 * HOLE_GRANULARITY as u32);
        assert_eq!(
            extents,
            vec![
                Extent { length: 4096, flags: hole },
                Extent { length: 8192, flags: 0 },
                Extent { length: 4096, flags: hole },
            ]
        );

        let partial = volume.extents(100, 3000);
        assert_eq!(partial, vec![Extent { length: 3000, flags: hole }]);

        // 100..4100 crosses into the written block at 4096
        let straddling = volume.extents(100, 4000);
        assert_eq!(
            straddling,
            vec![
                Extent { length: 3996, flags: hole },
                Extent { length: 4, flags: 0 },
            ]
        );
    }

    #[test]
    fn test_pattern_words_hold_offsets() {
        let mut buf = [0u8; 16];
        fill_pattern(4096, &mut buf);
        assert_eq!(&buf[..8], &4096u64.to_be_bytes());
        assert_eq!(&buf[8..], &4104u64.to_be_bytes());

        let mut unaligned = [0u8; 3];
        fill_pattern(4102, &mut unaligned);
        assert_eq!(unaligned, [buf[6], buf[7], buf[8]]);
    }

    #[tokio::test]
    async fn test_pattern_volume_is_read_only() {
        let volume = PatternVolume::new(1 << 20);
        assert_eq!(volume.write(0, &[0]).await, Err(NbdError::Perm));
        let data = volume.read(8, 8).await.unwrap();
        assert_eq!(data, 8u64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_verifying_sink_tracks_order_and_content() {
        let sink = VerifyingSink::new(1 << 20);
        let mut good = vec![0u8; 512];
        fill_pattern(0, &mut good);
        sink.write(0, &good).await.unwrap();

        let mut shifted = vec![0u8; 512];
        fill_pattern(0, &mut shifted);
        sink.write(4096, &shifted).await.unwrap();
        sink.write(1024, &good[..8]).await.unwrap();

        assert_eq!(sink.offsets(), vec![0, 4096, 1024]);
        assert!(!sink.is_ascending());
        assert_eq!(sink.bytes_written(), 1032);
        assert!(sink.mismatched() > 0);
    }
}
