//! Client configuration
//!
//! Configuration types for NBD handles and the copy orchestrator.

use serde::{Deserialize, Serialize};

/// Handle configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleConfig {
    /// Name used as the context of debug messages
    pub handle_name: String,
    /// Export to select when committing
    pub export_name: String,
    /// Stop in the negotiating phase after connecting
    pub opt_mode: bool,
    /// Ask for structured replies during the handshake
    pub request_structured_replies: bool,
    /// Select the requested meta contexts automatically during INFO/GO
    pub request_meta_context: bool,
    /// Ask for canonical name and description with INFO/GO
    pub full_info: bool,
    /// Initially requested meta contexts
    pub meta_contexts: Vec<String>,
    /// Reject requests beyond the export size before sending them
    pub strict_bounds: bool,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            handle_name: "nbd".to_string(),
            export_name: String::new(),
            opt_mode: false,
            request_structured_replies: true,
            request_meta_context: true,
            full_info: false,
            meta_contexts: Vec::new(),
            strict_bounds: true,
        }
    }
}

impl HandleConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set handle name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.handle_name = name.into();
        self
    }

    /// Set export name
    pub fn export(mut self, name: impl Into<String>) -> Self {
        self.export_name = name.into();
        self
    }

    /// Enable option mode
    pub fn opt_mode(mut self) -> Self {
        self.opt_mode = true;
        self
    }

    /// Disable structured replies
    pub fn no_structured_replies(mut self) -> Self {
        self.request_structured_replies = false;
        self
    }

    /// Disable automatic meta context selection
    pub fn no_meta_request(mut self) -> Self {
        self.request_meta_context = false;
        self
    }

    /// Request canonical name and description
    pub fn full_info(mut self) -> Self {
        self.full_info = true;
        self
    }

    /// Add a meta context to the requested list
    pub fn meta_context(mut self, name: impl Into<String>) -> Self {
        self.meta_contexts.push(name.into());
        self
    }
}

/// Copy orchestrator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    /// Bytes per read request
    pub request_size: u32,
    /// Maximum number of reads outstanding at once
    pub max_in_flight: usize,
    /// Flush the destination once everything is written
    pub flush: bool,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            request_size: 256 * 1024,
            max_in_flight: 16,
            flush: true,
        }
    }
}

impl CopyConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set request size
    pub fn request_size(mut self, size: u32) -> Self {
        self.request_size = size;
        self
    }

    /// Set in-flight cap
    pub fn max_in_flight(mut self, count: usize) -> Self {
        self.max_in_flight = count;
        self
    }

    /// Skip the final flush
    pub fn no_flush(mut self) -> Self {
        self.flush = false;
        self
    }
}
