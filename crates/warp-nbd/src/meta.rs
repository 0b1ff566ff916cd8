//! Meta context bookkeeping
//!
//! The registry keeps two sets apart: the contexts the caller *requested*
//! (an ordered, index-addressable list of names or queries) and the contexts
//! the server *negotiated* for the active export. Only a selecting operation
//! replaces the negotiated set; listing never touches it.

use crate::error::{ClientError, ClientResult};

/// Allocation status context every server is expected to offer
pub const CONTEXT_BASE_ALLOCATION: &str = "base:allocation";

/// A context the server agreed to, with the id it uses in block status replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaContext {
    /// Server-assigned context id
    pub id: u32,
    /// Context name
    pub name: String,
}

/// Requested and negotiated meta contexts for one handle
#[derive(Debug, Default)]
pub struct MetaContextRegistry {
    requested: Vec<String>,
    negotiated: Option<Vec<MetaContext>>,
}

impl MetaContextRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a name or query to the requested list
    pub fn add_requested(&mut self, name: impl Into<String>) {
        self.requested.push(name.into());
    }

    /// Empty the requested list
    pub fn clear_requested(&mut self) {
        self.requested.clear();
    }

    /// Number of requested names
    pub fn requested_count(&self) -> usize {
        self.requested.len()
    }

    /// Requested name at `index` (insertion order)
    pub fn requested(&self, index: usize) -> ClientResult<&str> {
        self.requested
            .get(index)
            .map(String::as_str)
            .ok_or(ClientError::OutOfRange {
                index,
                count: self.requested.len(),
            })
    }

    /// All requested names in insertion order
    pub fn requested_names(&self) -> &[String] {
        &self.requested
    }

    /// Whether a selection has happened for the active export
    pub fn is_negotiated(&self) -> bool {
        self.negotiated.is_some()
    }

    /// Whether the server agreed to `name` for the active export
    pub fn negotiated_contains(&self, name: &str) -> ClientResult<bool> {
        match &self.negotiated {
            Some(contexts) => Ok(contexts.iter().any(|c| c.name == name)),
            None => Err(ClientError::NotNegotiated(format!(
                "meta context {:?} queried before any context selection for this export",
                name
            ))),
        }
    }

    /// Negotiated contexts, if a selection has happened
    pub fn negotiated(&self) -> Option<&[MetaContext]> {
        self.negotiated.as_deref()
    }

    /// Name for a server context id
    pub fn context_name(&self, id: u32) -> Option<&str> {
        self.negotiated
            .as_ref()?
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.name.as_str())
    }

    /// Replace the negotiated set with the result of a selection
    pub(crate) fn set_negotiated(&mut self, contexts: Vec<MetaContext>) {
        self.negotiated = Some(contexts);
    }

    /// Forget the negotiated set (export changed)
    pub(crate) fn invalidate(&mut self) {
        self.negotiated = None;
    }

    /// Freeze on entry to transmission: no selection means nothing is active
    pub(crate) fn freeze(&mut self) {
        if self.negotiated.is_none() {
            self.negotiated = Some(Vec::new());
        }
    }
}
