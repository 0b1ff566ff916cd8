//! Client-side NBD engine for WARP
//!
//! This crate speaks the fixed-newstyle Network Block Device protocol from
//! the client side: option negotiation, an asynchronous command queue with
//! caller-controlled completion, and explicitly freed transfer buffers.
//!
//! # Features
//!
//! - Option haggling (`INFO`, `GO`, `LIST`, structured replies, meta contexts)
//! - Cached export info, invalidated whenever the selected export changes
//! - Non-blocking command engine driven by external readiness
//! - Pipelined, order-preserving copy between two handles
//! - In-process NBD server for tests (feature `server`)
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                  Handle                    │
//! │  ┌────────────┐ ┌──────────┐ ┌──────────┐  │
//! │  │ negotiation│ │ExportInfo│ │MetaCtx   │  │
//! │  │  (options) │ │  Cache   │ │ Registry │  │
//! │  └─────┬──────┘ └──────────┘ └──────────┘  │
//! │        │        ┌──────────────────────┐   │
//! │        │        │ CommandQueue (aio)   │◀──┼── TransferBuffer
//! │        │        └──────────┬───────────┘   │
//! └────────┼───────────────────┼───────────────┘
//!          │     Transport     │
//!          └─────────┬─────────┘
//!                    │  reactor::wait (poll)
//!             ┌──────▼──────┐
//!             │ NBD server  │
//!             └─────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use warp_nbd::{Handle, HandleConfig};
//!
//! let mut handle = Handle::new(HandleConfig::new().export("disk"));
//! handle.connect_uri("nbd://localhost/disk")?;
//! let mut data = vec![0u8; 4096];
//! handle.pread(&mut data, 0)?;
//! handle.shutdown()?;
//! # Ok::<(), warp_nbd::ClientError>(())
//! ```

#![warn(missing_docs)]

pub mod aio;
pub mod buffer;
pub mod config;
pub mod copy;
pub mod error;
pub mod export;
pub mod handle;
pub mod meta;
mod negotiate;
pub mod reactor;
#[cfg(feature = "server")]
pub mod server;
pub mod stats;
pub mod transport;
pub mod uri;
pub mod wire;

pub use aio::{CompletionCallback, Cookie, ExtentCallback};
pub use buffer::{BufferView, TransferBuffer};
pub use config::{CopyConfig, HandleConfig};
pub use copy::{Copier, CopyReport};
pub use error::{ClientError, ClientResult, CommandError, NbdError, OptionReplyError, ServerReason};
pub use export::{BlockSizeKind, BlockSizes, ExportEntry, ExportInfo, ExportList};
pub use handle::{Handle, Phase};
pub use meta::{MetaContext, MetaContextRegistry, CONTEXT_BASE_ALLOCATION};
pub use reactor::{Direction, Interest, Readiness};
pub use stats::Stats;
pub use transport::Transport;
pub use uri::{NbdAddress, NbdUri};
pub use wire::{CommandFlags, Extent, TransmissionFlags};
