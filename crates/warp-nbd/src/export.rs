//! Export information and export listings
//!
//! [`ExportInfoCache`] holds what INFO or GO reported for the currently
//! selected export name. It is either valid for that name or empty; there is
//! no stale state in between.

use crate::error::{ClientError, ClientResult};
use crate::wire::TransmissionFlags;

/// Block size constraints advertised with `NBD_INFO_BLOCK_SIZE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizes {
    /// Minimum block size
    pub minimum: u32,
    /// Preferred block size
    pub preferred: u32,
    /// Maximum payload size
    pub maximum: u32,
}

impl Default for BlockSizes {
    fn default() -> Self {
        Self {
            minimum: 1,
            preferred: 4096,
            maximum: 32 * 1024 * 1024, // 32 MB
        }
    }
}

/// Which block size to query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSizeKind {
    /// Minimum block size
    Minimum,
    /// Preferred block size
    Preferred,
    /// Maximum payload size
    Maximum,
}

/// What the server reported about one export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    /// Export name the info was fetched for
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Transmission flags
    pub flags: TransmissionFlags,
    /// Block sizes, if the server sent them
    pub block_sizes: Option<BlockSizes>,
    /// Canonical name (`NBD_INFO_NAME`)
    pub canonical_name: Option<String>,
    /// Description (`NBD_INFO_DESCRIPTION`)
    pub description: Option<String>,
}

impl ExportInfo {
    /// Create export info with only size and flags known
    pub fn new(name: impl Into<String>, size: u64, flags: TransmissionFlags) -> Self {
        Self {
            name: name.into(),
            size,
            flags,
            block_sizes: None,
            canonical_name: None,
            description: None,
        }
    }

    /// Whether the export is read-only
    pub fn is_read_only(&self) -> bool {
        self.flags.has(TransmissionFlags::READ_ONLY)
    }
}

/// Cached export info tied to the selected export name
#[derive(Debug, Default)]
pub struct ExportInfoCache {
    info: Option<ExportInfo>,
}

impl ExportInfoCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached info, or `NotNegotiated` if none is valid
    pub fn get(&self) -> ClientResult<&ExportInfo> {
        self.info.as_ref().ok_or_else(|| {
            ClientError::NotNegotiated(
                "server has not returned export info for the current export name".to_string(),
            )
        })
    }

    /// Whether the cache holds valid info
    pub fn is_valid(&self) -> bool {
        self.info.is_some()
    }

    /// Store info from a successful INFO or GO
    pub(crate) fn populate(&mut self, info: ExportInfo) {
        self.info = Some(info);
    }

    /// Clear the cache
    pub(crate) fn invalidate(&mut self) {
        self.info = None;
    }

    /// Transmission flag lookup
    pub(crate) fn flag(&self, flag: u16) -> ClientResult<bool> {
        Ok(self.get()?.flags.has(flag))
    }
}

/// One export advertised by `NBD_OPT_LIST`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    /// Export name
    pub name: String,
    /// Description (may be empty)
    pub description: String,
}

/// Result of listing exports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportList {
    entries: Vec<ExportEntry>,
}

impl ExportList {
    pub(crate) fn new(entries: Vec<ExportEntry>) -> Self {
        Self { entries }
    }

    /// Number of exports
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the server listed nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name at `index`
    pub fn name(&self, index: usize) -> ClientResult<&str> {
        self.entry(index).map(|e| e.name.as_str())
    }

    /// Description at `index`
    pub fn description(&self, index: usize) -> ClientResult<&str> {
        self.entry(index).map(|e| e.description.as_str())
    }

    /// Entry at `index`
    pub fn entry(&self, index: usize) -> ClientResult<&ExportEntry> {
        self.entries.get(index).ok_or(ClientError::OutOfRange {
            index,
            count: self.entries.len(),
        })
    }

    /// Iterate entries in server order
    pub fn iter(&self) -> impl Iterator<Item = &ExportEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_invalid_until_populated() {
        let mut cache = ExportInfoCache::new();
        assert!(matches!(cache.get(), Err(ClientError::NotNegotiated(_))));

        cache.populate(ExportInfo::new("a", 4, TransmissionFlags::default_ro()));
        assert_eq!(cache.get().unwrap().size, 4);
        assert!(cache.get().unwrap().is_read_only());
        assert!(cache.flag(TransmissionFlags::READ_ONLY).unwrap());
        assert!(!cache.flag(TransmissionFlags::SEND_TRIM).unwrap());

        cache.invalidate();
        assert!(!cache.is_valid());
        assert!(cache.flag(TransmissionFlags::READ_ONLY).is_err());
    }

    #[test]
    fn test_export_list_index() {
        let list = ExportList::new(vec![
            ExportEntry {
                name: "a".into(),
                description: String::new(),
            },
            ExportEntry {
                name: "b".into(),
                description: "second".into(),
            },
        ]);
        assert_eq!(list.len(), 2);
        assert_eq!(list.name(1).unwrap(), "b");
        assert_eq!(list.description(1).unwrap(), "second");
        assert!(matches!(
            list.name(2),
            Err(ClientError::OutOfRange { index: 2, count: 2 })
        ));
        assert_eq!(list.iter().count(), 2);
    }

    #[test]
    fn test_block_sizes_default() {
        let sizes = BlockSizes::default();
        assert_eq!(sizes.minimum, 1);
        assert_eq!(sizes.preferred, 4096);
        assert_eq!(sizes.maximum, 32 * 1024 * 1024);
    }
}
