//! In-process NBD server
//!
//! A small fixed-newstyle server on `tokio`, used as the peer for the
//! client engine in tests and demos. Each server runs its own runtime on a
//! background thread so blocking client code can talk to it directly.
//!
//! ```text
//! ┌──────────────┐   accept   ┌───────────────┐   VolumeIO   ┌──────────────┐
//! │  NbdServer   │───────────▶│ NbdConnection │─────────────▶│ MemoryVolume │
//! │ (tcp / unix) │            │ options, cmds │              │ PatternVolume│
//! └──────────────┘            └───────────────┘              │ VerifyingSink│
//!                                                            └──────────────┘
//! ```

mod connection;
mod listener;
mod volume;

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wire::TransmissionFlags;

pub use listener::{NbdServer, ServerAddress, ServerHandle};
pub use volume::{
    fill_pattern, pattern_byte, MemoryVolume, PatternVolume, VerifyingSink, VolumeIO,
    VolumeResult, HOLE_GRANULARITY,
};

/// Server result type
pub type ServerResult<T> = Result<T, ServerError>;

/// Server-side failures; these end a connection rather than a command
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The client broke the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server could not be started
    #[error("Startup failed: {0}")]
    Startup(String),
}

/// Server-wide behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Accept `NBD_OPT_STRUCTURED_REPLY`
    pub structured_replies: bool,
    /// Meta contexts offered for every export; ids are 1-based positions
    pub meta_contexts: Vec<String>,
    /// Serve reads concurrently so replies may arrive out of order
    pub reorder_reads: bool,
    /// Upper bound of the per-read delay when reordering
    pub max_jitter_us: u64,
    /// Worker threads of the server runtime
    pub worker_threads: usize,
    /// Answer every `NBD_OPT_GO` with `NBD_REP_ERR_POLICY`
    pub refuse_go: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            structured_replies: true,
            meta_contexts: vec![crate::meta::CONTEXT_BASE_ALLOCATION.to_string()],
            reorder_reads: false,
            max_jitter_us: 500,
            worker_threads: 2,
            refuse_go: false,
        }
    }
}

impl ServerConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse structured replies
    pub fn no_structured_replies(mut self) -> Self {
        self.structured_replies = false;
        self
    }

    /// Offer an additional meta context
    pub fn meta_context(mut self, name: impl Into<String>) -> Self {
        self.meta_contexts.push(name.into());
        self
    }

    /// Refuse to enter transmission; INFO still succeeds
    pub fn refuse_go(mut self) -> Self {
        self.refuse_go = true;
        self
    }

    /// Serve reads out of order with up to `max_jitter_us` of delay each
    pub fn reorder_reads(mut self, max_jitter_us: u64) -> Self {
        self.reorder_reads = true;
        self.max_jitter_us = max_jitter_us;
        self
    }
}

/// One export as advertised to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Export name
    pub name: String,
    /// Free-form description (LIST and `NBD_INFO_DESCRIPTION`)
    pub description: Option<String>,
    /// Reject writes, trims and zeroes
    pub read_only: bool,
    /// Advertise SEND_FLUSH
    pub flush: bool,
    /// Advertise SEND_FUA
    pub fua: bool,
    /// Advertise SEND_TRIM
    pub trim: bool,
    /// Advertise SEND_WRITE_ZEROES
    pub write_zeroes: bool,
    /// Advertise SEND_FAST_ZERO
    pub fast_zero: bool,
    /// Advertise SEND_CACHE
    pub cache: bool,
    /// Advertise CAN_MULTI_CONN
    pub multi_conn: bool,
    /// Advertise ROTATIONAL
    pub rotational: bool,
    /// Minimum block size
    pub min_block_size: u32,
    /// Preferred block size
    pub preferred_block_size: u32,
    /// Maximum payload size
    pub max_block_size: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            read_only: false,
            flush: true,
            fua: true,
            trim: true,
            write_zeroes: true,
            fast_zero: false,
            cache: true,
            multi_conn: false,
            rotational: false,
            min_block_size: 1,
            preferred_block_size: 4096,
            max_block_size: 32 * 1024 * 1024,
        }
    }
}

impl ExportConfig {
    /// Create a writable export
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Make the export read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Set block size constraints
    pub fn block_sizes(mut self, min: u32, preferred: u32, max: u32) -> Self {
        self.min_block_size = min;
        self.preferred_block_size = preferred;
        self.max_block_size = max;
        self
    }

    /// Transmission flags sent with INFO, GO and EXPORT_NAME
    pub fn transmission_flags(&self) -> TransmissionFlags {
        let mut flags = TransmissionFlags::HAS_FLAGS;
        let mut set = |enabled: bool, flag: u16| {
            if enabled {
                flags |= flag;
            }
        };
        set(self.read_only, TransmissionFlags::READ_ONLY);
        set(self.flush, TransmissionFlags::SEND_FLUSH);
        set(self.fua, TransmissionFlags::SEND_FUA);
        set(self.rotational, TransmissionFlags::ROTATIONAL);
        set(self.trim && !self.read_only, TransmissionFlags::SEND_TRIM);
        set(
            self.write_zeroes && !self.read_only,
            TransmissionFlags::SEND_WRITE_ZEROES,
        );
        set(self.multi_conn, TransmissionFlags::CAN_MULTI_CONN);
        set(self.cache, TransmissionFlags::SEND_CACHE);
        set(
            self.fast_zero && self.write_zeroes && !self.read_only,
            TransmissionFlags::SEND_FAST_ZERO,
        );
        TransmissionFlags::new(flags)
    }
}

/// An export bound to its storage
pub(crate) struct Export {
    pub(crate) config: ExportConfig,
    pub(crate) volume: Arc<dyn VolumeIO>,
}

impl Export {
    pub(crate) fn size(&self) -> u64 {
        self.volume.size()
    }
}

/// State shared by every connection of one server
pub(crate) struct ServerState {
    pub(crate) config: ServerConfig,
    pub(crate) exports: Vec<Arc<Export>>,
}

impl ServerState {
    pub(crate) fn find(&self, name: &str) -> Option<Arc<Export>> {
        self.exports.iter().find(|e| e.config.name == name).cloned()
    }

    /// 1-based id of a meta context name
    pub(crate) fn context_id(&self, name: &str) -> Option<u32> {
        self.config
            .meta_contexts
            .iter()
            .position(|c| c == name)
            .map(|i| i as u32 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_export_flags() {
        let flags = ExportConfig::new("disk").transmission_flags();
        assert!(flags.has(TransmissionFlags::HAS_FLAGS));
        assert!(flags.has(TransmissionFlags::SEND_FLUSH));
        assert!(flags.has(TransmissionFlags::SEND_TRIM));
        assert!(!flags.has(TransmissionFlags::READ_ONLY));
        assert!(!flags.has(TransmissionFlags::SEND_FAST_ZERO));
    }

    #[test]
    fn test_read_only_export_hides_write_capabilities() {
        let flags = ExportConfig::new("ro").read_only().transmission_flags();
        assert!(flags.has(TransmissionFlags::READ_ONLY));
        assert!(!flags.has(TransmissionFlags::SEND_TRIM));
        assert!(!flags.has(TransmissionFlags::SEND_WRITE_ZEROES));
    }

    #[test]
    fn test_context_ids_are_one_based() {
        let state = ServerState {
            config: ServerConfig::new().meta_context("qemu:dirty-bitmap:a"),
            exports: Vec::new(),
        };
        assert_eq!(state.context_id("base:allocation"), Some(1));
        assert_eq!(state.context_id("qemu:dirty-bitmap:a"), Some(2));
        assert_eq!(state.context_id("base:"), None);
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"reorder_reads": true}"#).unwrap();
        assert!(config.reorder_reads);
        assert!(config.structured_replies);
        assert_eq!(config.meta_contexts, vec!["base:allocation".to_string()]);

        let export: ExportConfig = serde_json::from_str(r#"{"name": "x", "read_only": true}"#).unwrap();
        assert_eq!(export.name, "x");
        assert_eq!(export.max_block_size, 32 * 1024 * 1024);
    }
}
