//! NBD client handle
//!
//! A [`Handle`] owns one connection: its phase, the export it negotiates,
//! the [`ExportInfoCache`] and [`MetaContextRegistry`] for that export, and
//! the queue of in-flight commands. Option haggling lives in `negotiate.rs`
//! and the command engine in `aio.rs`; both are `impl Handle` blocks.
//!
//! ```text
//! Created ──connect──▶ Negotiating ──opt_go──▶ Transmission
//!    │                     │  ▲                    │
//!    │                     │  └─ opt_info/list     │ EOF / error /
//!    │                 opt_abort                   │ shutdown / close
//!    └──────── close ──────┴──────────▶ Closed ◀───┘
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, info, warn};

use crate::aio::CommandQueue;
use crate::config::HandleConfig;
use crate::error::{ClientError, ClientResult, CommandError, ServerReason};
use crate::export::{BlockSizeKind, BlockSizes, ExportInfoCache};
use crate::meta::MetaContextRegistry;
use crate::reactor::{self, Direction, Interest, Readiness};
use crate::stats::Stats;
use crate::transport::Transport;
use crate::uri::{NbdAddress, NbdUri};
use crate::wire::{
    ClientFlags, GlobalFlags, TransmissionFlags, GREETING_SIZE, MAX_STRING_LEN, NBD_CLISERV_MAGIC,
    NBD_INIT_MAGIC, NBD_OPTS_MAGIC,
};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No transport yet
    Created,
    /// Transport open, export not yet committed
    Negotiating,
    /// Export committed, commands legal
    Transmission,
    /// Transport released; the handle cannot be reused
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Created => write!(f, "created"),
            Phase::Negotiating => write!(f, "negotiating"),
            Phase::Transmission => write!(f, "transmission"),
            Phase::Closed => write!(f, "closed"),
        }
    }
}

type DebugCallback = Box<dyn FnMut(&str, &str) + Send>;

/// One NBD connection
pub struct Handle {
    pub(crate) config: HandleConfig,
    pub(crate) phase: Phase,
    pub(crate) transport: Option<Box<dyn Transport>>,
    pub(crate) structured_replies: bool,
    pub(crate) info: ExportInfoCache,
    pub(crate) meta: MetaContextRegistry,
    pub(crate) engine: CommandQueue,
    pub(crate) stats: Stats,
    debug_callback: Option<DebugCallback>,
    debug_enabled: bool,
}

impl Handle {
    /// Create a handle; nothing is connected yet
    pub fn new(config: HandleConfig) -> Self {
        let mut meta = MetaContextRegistry::new();
        for name in &config.meta_contexts {
            meta.add_requested(name.clone());
        }
        Self {
            config,
            phase: Phase::Created,
            transport: None,
            structured_replies: false,
            info: ExportInfoCache::new(),
            meta,
            engine: CommandQueue::default(),
            stats: Stats::default(),
            debug_callback: None,
            debug_enabled: false,
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Name used as the context of debug messages
    pub fn handle_name(&self) -> &str {
        &self.config.handle_name
    }

    /// Change the debug context name
    pub fn set_handle_name(&mut self, name: impl Into<String>) {
        self.config.handle_name = name.into();
    }

    /// Configuration the handle currently runs with
    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    // ---- debug sink ----

    /// Route debug messages to `callback` as `(context, message)` and enable them
    pub fn set_debug_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&str, &str) + Send + 'static,
    {
        self.debug_callback = Some(Box::new(callback));
        self.debug_enabled = true;
    }

    /// Drop the debug callback
    pub fn clear_debug_callback(&mut self) {
        self.debug_callback = None;
    }

    /// Toggle delivery to the debug callback
    pub fn set_debug(&mut self, enabled: bool) {
        self.debug_enabled = enabled;
    }

    /// Whether the debug callback receives messages
    pub fn debug(&self) -> bool {
        self.debug_enabled
    }

    pub(crate) fn emit_debug(&mut self, message: String) {
        debug!(handle = %self.config.handle_name, "{}", message);
        if self.debug_enabled {
            if let Some(callback) = self.debug_callback.as_mut() {
                callback(&self.config.handle_name, &message);
            }
        }
    }

    // ---- settings ----

    /// Stop in the negotiating phase after connecting
    pub fn set_opt_mode(&mut self, enabled: bool) -> ClientResult<()> {
        self.require_phase(&[Phase::Created], "set_opt_mode")?;
        self.config.opt_mode = enabled;
        Ok(())
    }

    /// Whether option mode is on
    pub fn opt_mode(&self) -> bool {
        self.config.opt_mode
    }

    /// Ask for structured replies during the handshake
    pub fn set_request_structured_replies(&mut self, enabled: bool) -> ClientResult<()> {
        self.require_phase(&[Phase::Created], "set_request_structured_replies")?;
        self.config.request_structured_replies = enabled;
        Ok(())
    }

    /// Whether structured replies are requested on connect
    pub fn request_structured_replies(&self) -> bool {
        self.config.request_structured_replies
    }

    /// Select the requested meta contexts automatically during INFO/GO
    pub fn set_request_meta_context(&mut self, enabled: bool) -> ClientResult<()> {
        self.require_phase(
            &[Phase::Created, Phase::Negotiating],
            "set_request_meta_context",
        )?;
        self.config.request_meta_context = enabled;
        Ok(())
    }

    /// Whether INFO/GO select the requested contexts
    pub fn request_meta_context(&self) -> bool {
        self.config.request_meta_context
    }

    /// Ask for canonical name and description with INFO/GO
    pub fn set_full_info(&mut self, enabled: bool) -> ClientResult<()> {
        self.require_phase(&[Phase::Created, Phase::Negotiating], "set_full_info")?;
        self.config.full_info = enabled;
        Ok(())
    }

    /// Whether full info is requested
    pub fn full_info(&self) -> bool {
        self.config.full_info
    }

    /// Currently selected export name
    pub fn export_name(&self) -> &str {
        &self.config.export_name
    }

    // ---- requested meta contexts ----

    /// Append a context name or query to the requested list
    pub fn add_meta_context(&mut self, name: impl Into<String>) -> ClientResult<()> {
        self.require_phase(&[Phase::Created, Phase::Negotiating], "add_meta_context")?;
        let name = name.into();
        check_string(&name, "meta context name")?;
        self.meta.add_requested(name);
        Ok(())
    }

    /// Empty the requested list
    pub fn clear_meta_contexts(&mut self) -> ClientResult<()> {
        self.require_phase(&[Phase::Created, Phase::Negotiating], "clear_meta_contexts")?;
        self.meta.clear_requested();
        Ok(())
    }

    /// Number of requested contexts
    pub fn meta_context_count(&self) -> usize {
        self.meta.requested_count()
    }

    /// Requested context at `index`
    pub fn meta_context(&self, index: usize) -> ClientResult<&str> {
        self.meta.requested(index)
    }

    /// Requested and negotiated contexts
    pub fn meta_contexts(&self) -> &MetaContextRegistry {
        &self.meta
    }

    /// Whether the server agreed to `name` for the active export
    pub fn can_meta_context(&self, name: &str) -> ClientResult<bool> {
        self.meta.negotiated_contains(name)
    }

    // ---- connection ----

    /// Connect over TCP
    pub fn connect_tcp(&mut self, addr: impl ToSocketAddrs) -> ClientResult<()> {
        self.require_phase(&[Phase::Created], "connect")?;
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        self.connect_socket(stream)
    }

    /// Connect to a Unix domain socket
    pub fn connect_unix(&mut self, path: impl AsRef<Path>) -> ClientResult<()> {
        self.require_phase(&[Phase::Created], "connect")?;
        let stream = UnixStream::connect(path)?;
        self.connect_socket(stream)
    }

    /// Connect to the server and export named by an NBD URI
    pub fn connect_uri(&mut self, uri: &str) -> ClientResult<()> {
        self.require_phase(&[Phase::Created], "connect")?;
        let uri = NbdUri::parse(uri)?;
        self.set_export_name(uri.export.clone())?;
        match &uri.address {
            NbdAddress::Tcp { host, port } => self.connect_tcp((host.as_str(), *port)),
            NbdAddress::Unix(path) => self.connect_unix(path),
        }
    }

    /// Run the handshake over an already connected transport
    ///
    /// Unless option mode is on, the configured export is committed right
    /// away; a failed commit closes the handle.
    pub fn connect_socket<T>(&mut self, transport: T) -> ClientResult<()>
    where
        T: Transport + 'static,
    {
        self.require_phase(&[Phase::Created], "connect")?;
        transport.set_nonblocking(true)?;
        self.transport = Some(Box::new(transport));
        self.phase = Phase::Negotiating;

        let result = self.handshake();
        self.guard(result)?;

        if self.config.request_structured_replies {
            self.opt_structured_reply()?;
        }

        if !self.config.opt_mode {
            if let Err(e) = self.opt_go() {
                self.emit_debug(format!("automatic GO failed: {}", e));
                self.close_transport(CommandError::Terminated);
                return Err(e);
            }
        }
        Ok(())
    }

    fn handshake(&mut self) -> ClientResult<()> {
        let mut greeting = self.recv_blocking(GREETING_SIZE)?;
        self.stats.chunk_received();

        let magic = greeting.get_u64();
        if magic != NBD_INIT_MAGIC {
            return Err(ClientError::violation(format!(
                "Invalid server magic: {:016x}",
                magic
            )));
        }
        let version = greeting.get_u64();
        if version == NBD_CLISERV_MAGIC {
            return Err(ClientError::violation("Server speaks the oldstyle protocol"));
        }
        if version != NBD_OPTS_MAGIC {
            return Err(ClientError::violation(format!(
                "Invalid newstyle magic: {:016x}",
                version
            )));
        }

        let global = GlobalFlags::new(greeting.get_u16());
        if !global.fixed_newstyle() {
            return Err(ClientError::violation(
                "Server does not support fixed newstyle negotiation",
            ));
        }

        let client = ClientFlags::for_server(global);
        let mut reply = BytesMut::with_capacity(4);
        reply.put_u32(client.bits());
        self.send_blocking(&reply)?;

        self.emit_debug(format!(
            "handshake complete, global flags {:#06x}",
            global.bits()
        ));
        Ok(())
    }

    /// Protocol spoken on this connection
    pub fn protocol(&self) -> Option<&'static str> {
        match self.phase {
            Phase::Negotiating | Phase::Transmission => Some("newstyle-fixed"),
            _ => None,
        }
    }

    /// Whether structured replies are active
    pub fn structured_replies_negotiated(&self) -> bool {
        self.structured_replies
    }

    /// Whether a transport is attached
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Raw descriptor of the transport
    pub fn fd(&self) -> Option<RawFd> {
        self.transport.as_ref().map(|t| t.as_raw_fd())
    }

    /// Descriptor and direction to hand to [`reactor::wait`]
    pub fn interest(&self) -> Interest {
        Interest {
            fd: self.fd().unwrap_or(-1),
            direction: self.poll_direction(),
        }
    }

    /// Feed readiness observed by [`reactor::wait`] back into the engine
    pub fn dispatch(&mut self, readiness: Readiness) -> ClientResult<()> {
        if readiness.writable {
            self.notify_writable()?;
        }
        if readiness.readable {
            self.notify_readable()?;
        }
        Ok(())
    }

    /// Wait for this handle alone and dispatch
    ///
    /// Returns `false` without waiting when the handle has nothing to do, or
    /// when the timeout expired.
    pub fn poll(&mut self, timeout: Option<Duration>) -> ClientResult<bool> {
        let interest = self.interest();
        if interest.direction == Direction::None {
            return Ok(false);
        }
        let ready = reactor::wait(&[interest], timeout)?;
        let readiness = ready.first().copied().unwrap_or_default();
        self.dispatch(readiness)?;
        Ok(readiness.is_ready())
    }

    /// Close the connection
    ///
    /// Commands still pending complete with [`CommandError::Terminated`]
    /// before the transport is released.
    pub fn close(mut self) {
        self.close_transport(CommandError::Terminated);
    }

    // ---- statistics ----

    /// Snapshot of the traffic counters
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Bytes written to the transport
    pub fn bytes_sent(&self) -> u64 {
        self.stats.bytes_sent
    }

    /// Messages written to the transport
    pub fn chunks_sent(&self) -> u64 {
        self.stats.chunks_sent
    }

    /// Bytes read from the transport
    pub fn bytes_received(&self) -> u64 {
        self.stats.bytes_received
    }

    /// Messages read from the transport
    pub fn chunks_received(&self) -> u64 {
        self.stats.chunks_received
    }

    // ---- export info ----

    /// Export size in bytes
    pub fn size(&self) -> ClientResult<u64> {
        Ok(self.info.get()?.size)
    }

    /// Whether the export is read-only
    pub fn is_read_only(&self) -> ClientResult<bool> {
        self.info.flag(TransmissionFlags::READ_ONLY)
    }

    /// Whether FLUSH is supported
    pub fn can_flush(&self) -> ClientResult<bool> {
        self.info.flag(TransmissionFlags::SEND_FLUSH)
    }

    /// Whether the FUA flag is supported
    pub fn can_fua(&self) -> ClientResult<bool> {
        self.info.flag(TransmissionFlags::SEND_FUA)
    }

    /// Whether TRIM is supported
    pub fn can_trim(&self) -> ClientResult<bool> {
        self.info.flag(TransmissionFlags::SEND_TRIM)
    }

    /// Whether WRITE_ZEROES is supported
    pub fn can_zero(&self) -> ClientResult<bool> {
        self.info.flag(TransmissionFlags::SEND_WRITE_ZEROES)
    }

    /// Whether the fast-zero flag is supported
    pub fn can_fast_zero(&self) -> ClientResult<bool> {
        self.info.flag(TransmissionFlags::SEND_FAST_ZERO)
    }

    /// Whether several connections to this export are consistent
    pub fn can_multi_conn(&self) -> ClientResult<bool> {
        self.info.flag(TransmissionFlags::CAN_MULTI_CONN)
    }

    /// Whether CACHE is supported
    pub fn can_cache(&self) -> ClientResult<bool> {
        self.info.flag(TransmissionFlags::SEND_CACHE)
    }

    /// Whether the export is backed by rotational media
    pub fn is_rotational(&self) -> ClientResult<bool> {
        self.info.flag(TransmissionFlags::ROTATIONAL)
    }

    /// Block size constraint; defaults apply if the server sent none
    pub fn block_size(&self, kind: BlockSizeKind) -> ClientResult<u32> {
        let sizes = self.info.get()?.block_sizes.unwrap_or_default();
        Ok(match kind {
            BlockSizeKind::Minimum => sizes.minimum,
            BlockSizeKind::Preferred => sizes.preferred,
            BlockSizeKind::Maximum => sizes.maximum,
        })
    }

    /// Canonical export name, if full info was requested and sent
    pub fn canonical_name(&self) -> ClientResult<Option<&str>> {
        Ok(self.info.get()?.canonical_name.as_deref())
    }

    /// Export description, if full info was requested and sent
    pub fn description(&self) -> ClientResult<Option<&str>> {
        Ok(self.info.get()?.description.as_deref())
    }

    pub(crate) fn max_payload(&self) -> u32 {
        self.info
            .get()
            .ok()
            .and_then(|i| i.block_sizes)
            .unwrap_or_else(BlockSizes::default)
            .maximum
    }

    // ---- internals shared by negotiation and the engine ----

    pub(crate) fn require_phase(&self, allowed: &[Phase], operation: &str) -> ClientResult<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(ClientError::InvalidState(format!(
                "{} is not allowed in the {} phase",
                operation, self.phase
            )))
        }
    }

    /// Close the handle if `result` failed in a way that desynchronises the stream
    pub(crate) fn guard<T>(&mut self, result: ClientResult<T>) -> ClientResult<T> {
        if let Err(e) = &result {
            let fatal = matches!(
                e,
                ClientError::Connection(_)
                    | ClientError::Protocol {
                        reason: ServerReason::Violation,
                        ..
                    }
            );
            if fatal {
                warn!(handle = %self.config.handle_name, error = %e, "closing connection");
                self.close_transport(CommandError::Terminated);
            }
        }
        result
    }

    /// Fail every pending command with `error` and release the transport
    pub(crate) fn close_transport(&mut self, error: CommandError) {
        self.engine.fail_pending(&error);
        if let Some(transport) = self.transport.take() {
            let _ = transport.shutdown_both();
        }
        if self.phase != Phase::Closed {
            info!(handle = %self.config.handle_name, from = %self.phase, "connection closed");
            self.phase = Phase::Closed;
        }
    }

    fn wait_for(&self, direction: Direction) -> ClientResult<()> {
        let fd = self.fd().ok_or_else(not_connected)?;
        reactor::wait(&[Interest { fd, direction }], None)?;
        Ok(())
    }

    /// Write one whole message, waiting for writability as needed
    pub(crate) fn send_blocking(&mut self, data: &[u8]) -> ClientResult<()> {
        let mut written = 0;
        while written < data.len() {
            let transport = self.transport.as_mut().ok_or_else(not_connected)?;
            match transport.write(&data[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    written += n;
                    self.stats.record_sent(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_for(Direction::Write)?
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.stats.chunk_sent();
        Ok(())
    }

    /// Read exactly `len` bytes, waiting for readability as needed
    pub(crate) fn recv_blocking(&mut self, len: usize) -> ClientResult<BytesMut> {
        let mut buf = BytesMut::zeroed(len);
        let mut filled = 0;
        while filled < len {
            let transport = self.transport.as_mut().ok_or_else(not_connected)?;
            match transport.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the connection during negotiation",
                    )
                    .into())
                }
                Ok(n) => {
                    filled += n;
                    self.stats.record_received(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_for(Direction::Read)?
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new(HandleConfig::default())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close_transport(CommandError::Terminated);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.config.handle_name)
            .field("phase", &self.phase)
            .field("export", &self.config.export_name)
            .field("structured_replies", &self.structured_replies)
            .field("queued", &self.engine.len())
            .finish()
    }
}

pub(crate) fn not_connected() -> ClientError {
    ClientError::InvalidState("handle is not connected".to_string())
}

pub(crate) fn check_string(value: &str, what: &str) -> ClientResult<()> {
    if value.len() > MAX_STRING_LEN {
        return Err(ClientError::InvalidArgument(format!(
            "{} is {} bytes, longer than {}",
            what,
            value.len(),
            MAX_STRING_LEN
        )));
    }
    Ok(())
}
