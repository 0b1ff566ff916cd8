//! Asynchronous command engine
//!
//! Commands are issued without blocking and tracked in a queue that keeps
//! issue order. Progress happens only inside [`Handle::notify_writable`] and
//! [`Handle::notify_readable`], which the caller invokes after a readiness
//! wait; one call may send several requests and complete several commands.
//!
//! Every issued command completes exactly once. Its completion callback
//! decides whether it is retired immediately (`true`) or held in the queue
//! until the caller retires it with [`Handle::command_completed`].

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};
use tracing::{trace, warn};

use crate::buffer::TransferBuffer;
use crate::error::{ClientError, ClientResult, CommandError, NbdError};
use crate::handle::{Handle, Phase};
use crate::meta::MetaContextRegistry;
use crate::reactor::Direction;
use crate::stats::Stats;
use crate::wire::{
    chunk, CommandFlags, Extent, NbdCommand, NbdReply, NbdRequest, StructuredReplyHeader,
    TransmissionFlags, NBD_REPLY_MAGIC, NBD_STRUCTURED_REPLY_MAGIC,
};

/// Identifies one issued command
pub type Cookie = u64;

/// Runs once when a command completes; `true` retires it immediately
pub type CompletionCallback = Box<dyn FnOnce(Result<(), &CommandError>) -> bool + Send>;

/// Receives `(context, offset, extents)` for each block status chunk
pub type ExtentCallback = Box<dyn FnMut(&str, u64, &[Extent]) + Send>;

/// Bytes requested from the transport per read call
const READ_CHUNK: usize = 256 * 1024;

/// Largest structured chunk payload accepted
const MAX_CHUNK_PAYLOAD: u32 = 64 * 1024 * 1024;

enum CommandState {
    Pending,
    Completed(Result<(), CommandError>),
}

struct AioCommand {
    cookie: Cookie,
    command: NbdCommand,
    flags: CommandFlags,
    offset: u64,
    length: u32,
    buffer: Option<TransferBuffer>,
    on_extent: Option<ExtentCallback>,
    on_complete: Option<CompletionCallback>,
    error: Option<CommandError>,
    sent: bool,
    state: CommandState,
}

impl AioCommand {
    fn is_pending(&self) -> bool {
        matches!(self.state, CommandState::Pending)
    }

    fn awaits_reply(&self) -> bool {
        self.sent && self.is_pending() && self.command != NbdCommand::Disc
    }

    /// First failure wins
    fn record_error(&mut self, error: CommandError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Move to `Completed` and run the callback; returns whether to retire
    fn complete(&mut self, result: Result<(), CommandError>) -> bool {
        self.buffer = None;
        self.on_extent = None;
        let retire = match self.on_complete.take() {
            Some(callback) => callback(result.as_ref().map(|_| ())),
            None => false,
        };
        self.state = CommandState::Completed(result);
        retire
    }
}

/// Per-connection command state
#[derive(Default)]
pub(crate) struct CommandQueue {
    commands: VecDeque<AioCommand>,
    unsent: VecDeque<Cookie>,
    out: BytesMut,
    out_cookie: Option<Cookie>,
    rx: BytesMut,
    next_cookie: Cookie,
    disconnecting: bool,
}

impl CommandQueue {
    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    fn position(&self, cookie: Cookie) -> Option<usize> {
        self.commands.iter().position(|c| c.cookie == cookie)
    }

    fn push(&mut self, mut command: AioCommand) -> Cookie {
        self.next_cookie += 1;
        command.cookie = self.next_cookie;
        self.unsent.push_back(command.cookie);
        self.commands.push_back(command);
        self.next_cookie
    }

    fn finish(&mut self, index: usize, result: Result<(), CommandError>) {
        if self.commands[index].complete(result) {
            self.commands.remove(index);
        }
    }

    /// Complete every pending command with `error`
    pub(crate) fn fail_pending(&mut self, error: &CommandError) {
        let mut index = 0;
        while index < self.commands.len() {
            if self.commands[index].is_pending() && self.commands[index].complete(Err(error.clone()))
            {
                self.commands.remove(index);
                continue;
            }
            index += 1;
        }
        self.unsent.clear();
        self.out.clear();
        self.out_cookie = None;
        self.rx.clear();
    }

    fn wants_read(&self) -> bool {
        self.disconnecting || self.commands.iter().any(AioCommand::awaits_reply)
    }

    fn wants_write(&self) -> bool {
        !self.out.is_empty() || !self.unsent.is_empty()
    }

    /// Build the next request frame into `out`
    ///
    /// A write whose buffer cannot be read completes with that error and
    /// produces no frame.
    fn prepare_next_frame(&mut self) -> bool {
        while let Some(cookie) = self.unsent.pop_front() {
            let Some(index) = self.position(cookie) else {
                continue;
            };
            let command = &self.commands[index];
            let request = NbdRequest {
                flags: command.flags,
                command: command.command,
                handle: command.cookie,
                offset: command.offset,
                length: command.length,
            };
            request.encode(&mut self.out);
            if command.command == NbdCommand::Write {
                if let Some(buffer) = &command.buffer {
                    if let Err(e) = buffer.read_into(0, &mut self.out, command.length as usize) {
                        self.out.clear();
                        self.finish(index, Err(e));
                        continue;
                    }
                }
            }
            self.out_cookie = Some(cookie);
            return true;
        }
        false
    }

    /// The frame at the head of `out` has been written in full
    fn frame_sent(&mut self, cookie: Cookie) {
        if let Some(index) = self.position(cookie) {
            self.commands[index].sent = true;
            if self.commands[index].command == NbdCommand::Disc {
                self.finish(index, Ok(()));
            }
        }
    }
}

/// What went wrong while parsing replies
struct Violation {
    cookie: Option<Cookie>,
    message: String,
}

impl Violation {
    fn new(cookie: Option<Cookie>, message: impl Into<String>) -> Self {
        Self {
            cookie,
            message: message.into(),
        }
    }
}

impl Handle {
    /// Issue a read into `buffer` starting at `offset`
    ///
    /// The buffer belongs to the engine until the command completes.
    pub fn issue_read<F>(
        &mut self,
        buffer: &TransferBuffer,
        offset: u64,
        on_complete: F,
    ) -> ClientResult<Cookie>
    where
        F: FnOnce(Result<(), &CommandError>) -> bool + Send + 'static,
    {
        let length = self.check_buffer(buffer)?;
        self.check_issue(NbdCommand::Read, offset, length, CommandFlags::default())?;
        Ok(self.enqueue(
            NbdCommand::Read,
            CommandFlags::default(),
            offset,
            length,
            Some(buffer.clone()),
            None,
            on_complete,
        ))
    }

    /// Issue a write of `buffer` at `offset`
    ///
    /// The caller must not modify the buffer until the command completes.
    pub fn issue_write<F>(
        &mut self,
        buffer: &TransferBuffer,
        offset: u64,
        flags: CommandFlags,
        on_complete: F,
    ) -> ClientResult<Cookie>
    where
        F: FnOnce(Result<(), &CommandError>) -> bool + Send + 'static,
    {
        let length = self.check_buffer(buffer)?;
        self.check_issue(NbdCommand::Write, offset, length, flags)?;
        Ok(self.enqueue(
            NbdCommand::Write,
            flags,
            offset,
            length,
            Some(buffer.clone()),
            None,
            on_complete,
        ))
    }

    /// Issue a block status query over `length` bytes at `offset`
    ///
    /// `on_extent` runs once per block status chunk, before `on_complete`.
    pub fn issue_status<E, F>(
        &mut self,
        length: u32,
        offset: u64,
        flags: CommandFlags,
        on_extent: E,
        on_complete: F,
    ) -> ClientResult<Cookie>
    where
        E: FnMut(&str, u64, &[Extent]) + Send + 'static,
        F: FnOnce(Result<(), &CommandError>) -> bool + Send + 'static,
    {
        self.check_issue(NbdCommand::BlockStatus, offset, length, flags)?;
        Ok(self.enqueue(
            NbdCommand::BlockStatus,
            flags,
            offset,
            length,
            None,
            Some(Box::new(on_extent)),
            on_complete,
        ))
    }

    /// Issue a flush
    pub fn issue_flush<F>(&mut self, on_complete: F) -> ClientResult<Cookie>
    where
        F: FnOnce(Result<(), &CommandError>) -> bool + Send + 'static,
    {
        self.check_issue(NbdCommand::Flush, 0, 0, CommandFlags::default())?;
        Ok(self.enqueue(
            NbdCommand::Flush,
            CommandFlags::default(),
            0,
            0,
            None,
            None,
            on_complete,
        ))
    }

    /// Issue a trim (discard)
    pub fn issue_trim<F>(
        &mut self,
        length: u32,
        offset: u64,
        flags: CommandFlags,
        on_complete: F,
    ) -> ClientResult<Cookie>
    where
        F: FnOnce(Result<(), &CommandError>) -> bool + Send + 'static,
    {
        self.check_issue(NbdCommand::Trim, offset, length, flags)?;
        Ok(self.enqueue(NbdCommand::Trim, flags, offset, length, None, None, on_complete))
    }

    /// Issue a write of zeroes
    pub fn issue_zero<F>(
        &mut self,
        length: u32,
        offset: u64,
        flags: CommandFlags,
        on_complete: F,
    ) -> ClientResult<Cookie>
    where
        F: FnOnce(Result<(), &CommandError>) -> bool + Send + 'static,
    {
        self.check_issue(NbdCommand::WriteZeroes, offset, length, flags)?;
        Ok(self.enqueue(
            NbdCommand::WriteZeroes,
            flags,
            offset,
            length,
            None,
            None,
            on_complete,
        ))
    }

    /// Issue an advisory cache (prefetch) request
    pub fn issue_cache<F>(&mut self, length: u32, offset: u64, on_complete: F) -> ClientResult<Cookie>
    where
        F: FnOnce(Result<(), &CommandError>) -> bool + Send + 'static,
    {
        self.check_issue(NbdCommand::Cache, offset, length, CommandFlags::default())?;
        Ok(self.enqueue(
            NbdCommand::Cache,
            CommandFlags::default(),
            offset,
            length,
            None,
            None,
            on_complete,
        ))
    }

    /// Ask the server to close the connection once earlier commands are done
    ///
    /// The returned command completes when the request has been sent. No
    /// further commands can be issued.
    pub fn issue_disconnect(&mut self) -> ClientResult<Cookie> {
        self.check_issue(NbdCommand::Disc, 0, 0, CommandFlags::default())?;
        self.engine.disconnecting = true;
        self.emit_debug("disconnect requested".to_string());
        Ok(self.enqueue(
            NbdCommand::Disc,
            CommandFlags::default(),
            0,
            0,
            None,
            None,
            |_| true,
        ))
    }

    /// Commands issued but not yet completed
    pub fn in_flight_count(&self) -> usize {
        self.engine
            .commands
            .iter()
            .filter(|c| c.is_pending())
            .count()
    }

    /// Commands in the queue, including completed ones not yet retired
    pub fn queue_len(&self) -> usize {
        self.engine.len()
    }

    /// What the connection needs next to make progress
    pub fn poll_direction(&self) -> Direction {
        if self.transport.is_none() {
            return Direction::None;
        }
        match self.phase {
            Phase::Transmission => {
                Direction::from_flags(self.engine.wants_read(), self.engine.wants_write())
            }
            Phase::Created | Phase::Negotiating | Phase::Closed => Direction::None,
        }
    }

    /// Whether `cookie` has completed, retiring it if so
    ///
    /// `Ok(false)` while pending. A completed command is removed from the
    /// queue and reported as `Ok(true)`, or as the error it completed with.
    pub fn command_completed(&mut self, cookie: Cookie) -> ClientResult<bool> {
        let index = self.engine.position(cookie).ok_or_else(|| {
            ClientError::InvalidArgument(format!("no command with cookie {}", cookie))
        })?;
        if self.engine.commands[index].is_pending() {
            return Ok(false);
        }
        let command = self.engine.commands.remove(index);
        match command.map(|c| c.state) {
            Some(CommandState::Completed(Err(e))) => Err(e.into()),
            _ => Ok(true),
        }
    }

    /// Oldest completed command still held in the queue
    pub fn peek_completed(&self) -> Option<Cookie> {
        self.engine
            .commands
            .iter()
            .find(|c| !c.is_pending())
            .map(|c| c.cookie)
    }

    /// Send as much queued request data as the transport accepts
    pub fn notify_writable(&mut self) -> ClientResult<()> {
        if self.phase != Phase::Transmission {
            return Ok(());
        }
        loop {
            if self.engine.out.is_empty() && !self.engine.prepare_next_frame() {
                break;
            }
            let Some(transport) = self.transport.as_mut() else {
                break;
            };
            match transport.write(&self.engine.out) {
                Ok(0) => return self.lost(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.stats.record_sent(n);
                    self.engine.out.advance(n);
                    if self.engine.out.is_empty() {
                        self.stats.chunk_sent();
                        if let Some(cookie) = self.engine.out_cookie.take() {
                            self.engine.frame_sent(cookie);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.lost(e),
            }
        }
        Ok(())
    }

    /// Read and process whatever replies the transport has
    pub fn notify_readable(&mut self) -> ClientResult<()> {
        if self.phase != Phase::Transmission {
            return Ok(());
        }
        loop {
            let Some(transport) = self.transport.as_mut() else {
                return Ok(());
            };
            let rx = &mut self.engine.rx;
            let start = rx.len();
            rx.resize(start + READ_CHUNK, 0);
            let result = transport.read(&mut rx[start..]);
            match result {
                Ok(0) => {
                    rx.truncate(start);
                    return self.eof();
                }
                Ok(n) => {
                    rx.truncate(start + n);
                    self.stats.record_received(n);
                    self.process_replies()?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    rx.truncate(start);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => rx.truncate(start),
                Err(e) => {
                    rx.truncate(start);
                    return self.lost(e);
                }
            }
        }
    }

    fn process_replies(&mut self) -> ClientResult<()> {
        loop {
            let parsed = next_reply(
                &mut self.engine,
                &self.meta,
                &mut self.stats,
                self.structured_replies,
            );
            match parsed {
                Ok(Some(consumed)) => self.engine.rx.advance(consumed),
                Ok(None) => return Ok(()),
                Err(violation) => return self.violated(violation),
            }
        }
    }

    fn eof(&mut self) -> ClientResult<()> {
        if self.engine.disconnecting {
            self.emit_debug("server closed the connection after disconnect".to_string());
            self.close_transport(CommandError::Terminated);
            return Ok(());
        }
        self.lost(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "server closed the connection",
        ))
    }

    fn lost(&mut self, error: io::Error) -> ClientResult<()> {
        warn!(handle = %self.config.handle_name, error = %error, "connection lost");
        self.close_transport(CommandError::Terminated);
        Err(error.into())
    }

    fn violated(&mut self, violation: Violation) -> ClientResult<()> {
        warn!(
            handle = %self.config.handle_name,
            message = %violation.message,
            "server protocol violation"
        );
        if let Some(index) = violation.cookie.and_then(|c| self.engine.position(c)) {
            if self.engine.commands[index].is_pending() {
                self.engine
                    .finish(index, Err(CommandError::Malformed(violation.message.clone())));
            }
        }
        self.close_transport(CommandError::Terminated);
        Err(ClientError::violation(violation.message))
    }

    fn check_buffer(&self, buffer: &TransferBuffer) -> ClientResult<u32> {
        if buffer.is_freed() {
            return Err(ClientError::UseAfterFree);
        }
        u32::try_from(buffer.len()).map_err(|_| {
            ClientError::InvalidArgument(format!("buffer of {} bytes is too large", buffer.len()))
        })
    }

    /// Phase, capability and range checks done before a command exists
    fn check_issue(
        &self,
        command: NbdCommand,
        offset: u64,
        length: u32,
        flags: CommandFlags,
    ) -> ClientResult<()> {
        self.require_phase(&[Phase::Transmission], "issuing a command")?;
        if self.engine.disconnecting {
            return Err(ClientError::InvalidState(
                "disconnect already requested".to_string(),
            ));
        }
        let info = self.info.get()?;
        let need = |flag: u16, what: &str| -> ClientResult<()> {
            if info.flags.has(flag) {
                Ok(())
            } else {
                Err(ClientError::Unsupported(format!(
                    "server does not support {}",
                    what
                )))
            }
        };
        let writable = || -> ClientResult<()> {
            if info.is_read_only() {
                Err(ClientError::Unsupported("export is read-only".to_string()))
            } else {
                Ok(())
            }
        };

        match command {
            NbdCommand::Write => writable()?,
            NbdCommand::Trim => {
                writable()?;
                need(TransmissionFlags::SEND_TRIM, "trim")?;
            }
            NbdCommand::WriteZeroes => {
                writable()?;
                need(TransmissionFlags::SEND_WRITE_ZEROES, "write zeroes")?;
                if flags.has_fast_zero() {
                    need(TransmissionFlags::SEND_FAST_ZERO, "fast zero")?;
                }
            }
            NbdCommand::Flush => need(TransmissionFlags::SEND_FLUSH, "flush")?,
            NbdCommand::Cache => need(TransmissionFlags::SEND_CACHE, "cache")?,
            NbdCommand::BlockStatus => {
                if !self.structured_replies {
                    return Err(ClientError::NotNegotiated(
                        "block status requires structured replies".to_string(),
                    ));
                }
                if self.meta.negotiated().map_or(true, |c| c.is_empty()) {
                    return Err(ClientError::NotNegotiated(
                        "block status requires a negotiated meta context".to_string(),
                    ));
                }
            }
            _ => {}
        }
        if flags.has_fua() {
            need(TransmissionFlags::SEND_FUA, "FUA")?;
        }

        let ranged = !matches!(command, NbdCommand::Flush | NbdCommand::Disc);
        if ranged && offset.checked_add(length as u64).is_none() {
            return Err(ClientError::InvalidArgument(format!(
                "request of {} bytes at offset {} wraps the address space",
                length, offset
            )));
        }
        if ranged && self.config.strict_bounds {
            if length == 0 {
                return Err(ClientError::InvalidArgument(
                    "zero-length request".to_string(),
                ));
            }
            let end = offset.checked_add(length as u64);
            if end.map_or(true, |end| end > info.size) {
                return Err(ClientError::InvalidArgument(format!(
                    "request of {} bytes at offset {} exceeds export size {}",
                    length, offset, info.size
                )));
            }
            let carries_payload = matches!(command, NbdCommand::Read | NbdCommand::Write);
            if carries_payload && length > self.max_payload() {
                return Err(ClientError::InvalidArgument(format!(
                    "request of {} bytes exceeds maximum payload {}",
                    length,
                    self.max_payload()
                )));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue<F>(
        &mut self,
        command: NbdCommand,
        flags: CommandFlags,
        offset: u64,
        length: u32,
        buffer: Option<TransferBuffer>,
        on_extent: Option<ExtentCallback>,
        on_complete: F,
    ) -> Cookie
    where
        F: FnOnce(Result<(), &CommandError>) -> bool + Send + 'static,
    {
        let cookie = self.engine.push(AioCommand {
            cookie: 0,
            command,
            flags,
            offset,
            length,
            buffer,
            on_extent,
            on_complete: Some(Box::new(on_complete)),
            error: None,
            sent: false,
            state: CommandState::Pending,
        });
        trace!(cookie, ?command, offset, length, "issued");
        cookie
    }

    // ---- synchronous wrappers ----

    /// Drive the connection until `cookie` completes, then retire it
    pub fn wait_command(&mut self, cookie: Cookie) -> ClientResult<()> {
        loop {
            match self.command_completed(cookie) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => return Err(e),
            }
            if let Err(e) = self.poll(None) {
                // the command was failed by the teardown; prefer its error
                return match self.command_completed(cookie) {
                    Err(ClientError::InvalidArgument(_)) | Ok(_) => Err(e),
                    Err(command_error) => Err(command_error),
                };
            }
        }
    }

    /// Read `buf.len()` bytes at `offset`
    pub fn pread(&mut self, buf: &mut [u8], offset: u64) -> ClientResult<()> {
        let buffer = TransferBuffer::allocate(buf.len());
        let result = self
            .issue_read(&buffer, offset, |_| false)
            .and_then(|cookie| self.wait_command(cookie))
            .and_then(|()| {
                buf.copy_from_slice(&buffer.view()?);
                Ok(())
            });
        buffer.free();
        result
    }

    /// Write `data` at `offset`
    pub fn pwrite(&mut self, data: &[u8], offset: u64, flags: CommandFlags) -> ClientResult<()> {
        let buffer = TransferBuffer::from_bytes(data);
        let result = self
            .issue_write(&buffer, offset, flags, |_| false)
            .and_then(|cookie| self.wait_command(cookie));
        buffer.free();
        result
    }

    /// Flush the export
    pub fn flush(&mut self) -> ClientResult<()> {
        let cookie = self.issue_flush(|_| false)?;
        self.wait_command(cookie)
    }

    /// Discard a range
    pub fn trim(&mut self, length: u32, offset: u64, flags: CommandFlags) -> ClientResult<()> {
        let cookie = self.issue_trim(length, offset, flags, |_| false)?;
        self.wait_command(cookie)
    }

    /// Zero a range
    pub fn zero(&mut self, length: u32, offset: u64, flags: CommandFlags) -> ClientResult<()> {
        let cookie = self.issue_zero(length, offset, flags, |_| false)?;
        self.wait_command(cookie)
    }

    /// Query block status, delivering extents to `on_extent`
    pub fn block_status<E>(
        &mut self,
        length: u32,
        offset: u64,
        flags: CommandFlags,
        on_extent: E,
    ) -> ClientResult<()>
    where
        E: FnMut(&str, u64, &[Extent]) + Send + 'static,
    {
        let cookie = self.issue_status(length, offset, flags, on_extent, |_| false)?;
        self.wait_command(cookie)
    }

    /// Disconnect gracefully and wait for the server to close
    pub fn shutdown(&mut self) -> ClientResult<()> {
        if self.phase != Phase::Transmission {
            self.close_transport(CommandError::Terminated);
            return Ok(());
        }
        self.issue_disconnect()?;
        while self.phase == Phase::Transmission {
            match self.poll(None) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    // the goal was a closed connection anyway
                    self.emit_debug(format!("connection ended uncleanly: {}", e));
                    break;
                }
            }
        }
        self.close_transport(CommandError::Terminated);
        Ok(())
    }
}

/// Parse one reply from the head of `rx`
///
/// Returns the number of bytes consumed, or `None` if the reply is not
/// complete yet.
fn next_reply(
    engine: &mut CommandQueue,
    meta: &MetaContextRegistry,
    stats: &mut Stats,
    structured: bool,
) -> Result<Option<usize>, Violation> {
    let CommandQueue { commands, rx, .. } = engine;
    if rx.len() < 4 {
        return Ok(None);
    }
    let magic = u32::from_be_bytes([rx[0], rx[1], rx[2], rx[3]]);

    match magic {
        NBD_REPLY_MAGIC => {
            if rx.len() < NbdReply::SIZE {
                return Ok(None);
            }
            let reply = NbdReply::parse(&rx[..NbdReply::SIZE]);
            let index = awaiting(commands, reply.handle)?;
            let command = &commands[index];
            let payload_len = if command.command == NbdCommand::Read && reply.error == 0 {
                command.length as usize
            } else {
                0
            };
            let total = NbdReply::SIZE + payload_len;
            if rx.len() < total {
                return Ok(None);
            }
            stats.chunk_received();
            trace!(cookie = reply.handle, error = reply.error, "simple reply");

            let result = if reply.error != 0 {
                Err(CommandError::Server {
                    errno: NbdError::from_errno(reply.error),
                    message: String::new(),
                })
            } else {
                match &command.buffer {
                    Some(buffer) if payload_len > 0 => {
                        buffer.fill_from(0, &rx[NbdReply::SIZE..total])
                    }
                    _ => Ok(()),
                }
            };
            if commands[index].complete(result) {
                commands.remove(index);
            }
            Ok(Some(total))
        }
        NBD_STRUCTURED_REPLY_MAGIC => {
            if !structured {
                return Err(Violation::new(
                    None,
                    "structured reply without structured replies negotiated",
                ));
            }
            if rx.len() < StructuredReplyHeader::SIZE {
                return Ok(None);
            }
            let header = StructuredReplyHeader::parse(&rx[..StructuredReplyHeader::SIZE]);
            if header.length > MAX_CHUNK_PAYLOAD {
                return Err(Violation::new(
                    Some(header.handle),
                    format!("chunk payload of {} bytes is too large", header.length),
                ));
            }
            let total = StructuredReplyHeader::SIZE + header.length as usize;
            if rx.len() < total {
                return Ok(None);
            }
            let index = awaiting(commands, header.handle)?;
            stats.chunk_received();
            trace!(
                cookie = header.handle,
                kind = header.kind,
                length = header.length,
                done = header.is_done(),
                "structured chunk"
            );

            let command = &mut commands[index];
            apply_chunk(
                command,
                meta,
                &header,
                &rx[StructuredReplyHeader::SIZE..total],
            )
            .map_err(|message| Violation::new(Some(header.handle), message))?;

            if header.is_done() {
                let result = match command.error.take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
                if command.complete(result) {
                    commands.remove(index);
                }
            }
            Ok(Some(total))
        }
        other => Err(Violation::new(
            None,
            format!("invalid reply magic {:08x}", other),
        )),
    }
}

fn awaiting(commands: &VecDeque<AioCommand>, cookie: Cookie) -> Result<usize, Violation> {
    commands
        .iter()
        .position(|c| c.cookie == cookie && c.awaits_reply())
        .ok_or_else(|| Violation::new(None, format!("reply for unknown cookie {}", cookie)))
}

/// Apply one structured chunk to its command
///
/// Errors that leave the stream in sync (buffer freed, unknown context) are
/// recorded on the command; `Err` means the server broke the protocol.
fn apply_chunk(
    command: &mut AioCommand,
    meta: &MetaContextRegistry,
    header: &StructuredReplyHeader,
    mut payload: &[u8],
) -> Result<(), String> {
    let start = command.offset;
    let end = start
        .checked_add(command.length as u64)
        .ok_or_else(|| format!("request {}+{} wraps", start, command.length))?;

    match header.kind {
        chunk::NONE => {
            if !header.is_done() || !payload.is_empty() {
                return Err("NONE chunk must be empty and final".to_string());
            }
        }
        chunk::OFFSET_DATA => {
            if command.command != NbdCommand::Read || payload.len() < 8 {
                return Err("unexpected OFFSET_DATA chunk".to_string());
            }
            let offset = payload.get_u64();
            let within = offset
                .checked_add(payload.len() as u64)
                .map_or(false, |chunk_end| chunk_end <= end);
            if offset < start || !within {
                return Err(format!(
                    "data at {}+{} outside request {}+{}",
                    offset,
                    payload.len(),
                    start,
                    command.length
                ));
            }
            if let Some(buffer) = &command.buffer {
                if let Err(e) = buffer.fill_from((offset - start) as usize, payload) {
                    command.record_error(e);
                }
            }
        }
        chunk::OFFSET_HOLE => {
            if command.command != NbdCommand::Read || payload.len() != 12 {
                return Err("unexpected OFFSET_HOLE chunk".to_string());
            }
            let offset = payload.get_u64();
            let length = payload.get_u32() as u64;
            let within = offset
                .checked_add(length)
                .map_or(false, |chunk_end| chunk_end <= end);
            if offset < start || !within {
                return Err(format!(
                    "hole at {}+{} outside request {}+{}",
                    offset, length, start, command.length
                ));
            }
            if let Some(buffer) = &command.buffer {
                if let Err(e) = buffer.fill_zero((offset - start) as usize, length as usize) {
                    command.record_error(e);
                }
            }
        }
        chunk::BLOCK_STATUS => {
            if command.command != NbdCommand::BlockStatus
                || payload.len() < 4
                || (payload.len() - 4) % 8 != 0
            {
                return Err("unexpected BLOCK_STATUS chunk".to_string());
            }
            let id = payload.get_u32();
            let mut extents = Vec::with_capacity(payload.len() / 8);
            while payload.remaining() >= 8 {
                extents.push(Extent {
                    length: payload.get_u32(),
                    flags: payload.get_u32(),
                });
            }
            match meta.context_name(id) {
                Some(name) => {
                    if let Some(callback) = command.on_extent.as_mut() {
                        callback(name, start, &extents);
                    }
                }
                None => command.record_error(CommandError::Malformed(format!(
                    "block status for unknown context id {}",
                    id
                ))),
            }
        }
        kind if chunk::is_error(kind) => {
            if payload.len() < 6 {
                return Err("error chunk too short".to_string());
            }
            let errno = payload.get_u32();
            let message_len = payload.get_u16() as usize;
            if message_len > payload.len() {
                return Err("error message overruns chunk".to_string());
            }
            let message = String::from_utf8_lossy(&payload[..message_len]).into_owned();
            command.record_error(CommandError::Server {
                errno: if errno == 0 {
                    NbdError::Io
                } else {
                    NbdError::from_errno(errno)
                },
                message,
            });
        }
        other => return Err(format!("unknown chunk type {}", other)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::BufMut;

    use crate::meta::MetaContext;

    fn read_command(offset: u64, length: u32, buffer: &TransferBuffer) -> AioCommand {
        AioCommand {
            cookie: 0,
            command: NbdCommand::Read,
            flags: CommandFlags::default(),
            offset,
            length,
            buffer: Some(buffer.clone()),
            on_extent: None,
            on_complete: None,
            error: None,
            sent: true,
            state: CommandState::Pending,
        }
    }

    fn chunk_bytes(kind: u16, flags: u16, cookie: Cookie, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        StructuredReplyHeader {
            flags,
            kind,
            handle: cookie,
            length: payload.len() as u32,
        }
        .encode(&mut buf);
        buf.put_slice(payload);
        buf
    }

    #[test]
    fn test_structured_read_with_hole() {
        let buffer = TransferBuffer::from_bytes(&[0xff; 8]);
        let mut engine = CommandQueue::default();
        let cookie = engine.push(read_command(100, 8, &buffer));
        engine.commands[0].sent = true;
        engine.unsent.clear();

        let mut data = BytesMut::new();
        data.put_u64(100);
        data.put_slice(&[1, 2, 3, 4]);
        engine.rx.extend_from_slice(&chunk_bytes(chunk::OFFSET_DATA, 0, cookie, &data));
        let mut hole = BytesMut::new();
        hole.put_u64(104);
        hole.put_u32(4);
        engine
            .rx
            .extend_from_slice(&chunk_bytes(chunk::OFFSET_HOLE, chunk::FLAG_DONE, cookie, &hole));

        let meta = MetaContextRegistry::new();
        let mut stats = Stats::default();
        let first = next_reply(&mut engine, &meta, &mut stats, true).ok().flatten().unwrap();
        engine.rx.advance(first);
        assert!(engine.commands[0].is_pending());
        let second = next_reply(&mut engine, &meta, &mut stats, true).ok().flatten().unwrap();
        engine.rx.advance(second);

        assert!(!engine.commands[0].is_pending());
        assert_eq!(stats.chunks_received, 2);
        assert_eq!(&buffer.snapshot().unwrap()[..], &[1, 2, 3, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn test_partial_reply_waits_for_more() {
        let buffer = TransferBuffer::allocate(4);
        let mut engine = CommandQueue::default();
        let cookie = engine.push(read_command(0, 4, &buffer));
        engine.commands[0].sent = true;

        let mut reply = BytesMut::new();
        NbdReply::ok(cookie).encode(&mut reply);
        reply.put_slice(&[9, 9]);
        engine.rx.extend_from_slice(&reply);

        let meta = MetaContextRegistry::new();
        let mut stats = Stats::default();
        assert!(matches!(
            next_reply(&mut engine, &meta, &mut stats, false),
            Ok(None)
        ));
        engine.rx.extend_from_slice(&[9, 9]);
        assert!(matches!(
            next_reply(&mut engine, &meta, &mut stats, false),
            Ok(Some(20))
        ));
        assert_eq!(&buffer.snapshot().unwrap()[..], &[9, 9, 9, 9]);
    }

    #[test]
    fn test_first_error_chunk_wins() {
        let buffer = TransferBuffer::allocate(4);
        let mut engine = CommandQueue::default();
        let cookie = engine.push(read_command(0, 4, &buffer));
        engine.commands[0].sent = true;

        let mut first = BytesMut::new();
        first.put_u32(NbdError::Io.code());
        first.put_u16(4);
        first.put_slice(b"disk");
        let mut second = BytesMut::new();
        second.put_u32(NbdError::Perm.code());
        second.put_u16(0);
        engine.rx.extend_from_slice(&chunk_bytes(chunk::ERROR, 0, cookie, &first));
        engine
            .rx
            .extend_from_slice(&chunk_bytes(chunk::ERROR, chunk::FLAG_DONE, cookie, &second));

        let meta = MetaContextRegistry::new();
        let mut stats = Stats::default();
        while let Ok(Some(n)) = next_reply(&mut engine, &meta, &mut stats, true) {
            engine.rx.advance(n);
        }
        match &engine.commands[0].state {
            CommandState::Completed(Err(CommandError::Server { errno, message })) => {
                assert_eq!(*errno, NbdError::Io);
                assert_eq!(message, "disk");
            }
            _ => panic!("command should have failed"),
        }
    }

    #[test]
    fn test_block_status_extents_reach_callback() {
        let mut meta = MetaContextRegistry::new();
        meta.set_negotiated(vec![MetaContext {
            id: 7,
            name: "base:allocation".into(),
        }]);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let mut engine = CommandQueue::default();
        let cookie = engine.push(AioCommand {
            cookie: 0,
            command: NbdCommand::BlockStatus,
            flags: CommandFlags::default(),
            offset: 0,
            length: 4096,
            buffer: None,
            on_extent: Some(Box::new(move |context: &str, offset: u64, extents: &[Extent]| {
                assert_eq!(context, "base:allocation");
                assert_eq!(offset, 0);
                counter.fetch_add(extents.len(), Ordering::SeqCst);
            })),
            on_complete: Some(Box::new(|result: Result<(), &CommandError>| {
                assert!(result.is_ok());
                true
            })),
            error: None,
            sent: true,
            state: CommandState::Pending,
        });

        let mut payload = BytesMut::new();
        payload.put_u32(7);
        payload.put_u32(2048);
        payload.put_u32(0);
        payload.put_u32(2048);
        payload.put_u32(3);
        engine.rx.extend_from_slice(&chunk_bytes(
            chunk::BLOCK_STATUS,
            chunk::FLAG_DONE,
            cookie,
            &payload,
        ));

        let mut stats = Stats::default();
        let consumed = next_reply(&mut engine, &meta, &mut stats, true).ok().flatten();
        assert!(consumed.is_some());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(engine.len(), 0, "callback returned true so the command retired");
    }

    #[test]
    fn test_chunk_offset_overflow_is_violation() {
        let meta = MetaContextRegistry::new();
        let mut stats = Stats::default();
        let buffer = TransferBuffer::allocate(4);

        let mut engine = CommandQueue::default();
        let cookie = engine.push(read_command(0, 4, &buffer));
        let mut data = BytesMut::new();
        data.put_u64(u64::MAX - 2);
        data.put_slice(&[1, 2, 3, 4]);
        engine
            .rx
            .extend_from_slice(&chunk_bytes(chunk::OFFSET_DATA, chunk::FLAG_DONE, cookie, &data));
        assert!(next_reply(&mut engine, &meta, &mut stats, true).is_err());

        let mut engine = CommandQueue::default();
        let cookie = engine.push(read_command(0, 4, &buffer));
        let mut hole = BytesMut::new();
        hole.put_u64(u64::MAX);
        hole.put_u32(u32::MAX);
        engine
            .rx
            .extend_from_slice(&chunk_bytes(chunk::OFFSET_HOLE, chunk::FLAG_DONE, cookie, &hole));
        assert!(next_reply(&mut engine, &meta, &mut stats, true).is_err());

        // A request that already wraps is rejected rather than overflowing
        let mut engine = CommandQueue::default();
        let cookie = engine.push(read_command(u64::MAX - 1, 4, &buffer));
        let mut error = BytesMut::new();
        error.put_u32(NbdError::Inval.code());
        error.put_u16(0);
        engine
            .rx
            .extend_from_slice(&chunk_bytes(chunk::ERROR, chunk::FLAG_DONE, cookie, &error));
        assert!(next_reply(&mut engine, &meta, &mut stats, true).is_err());
        buffer.free();
    }

    #[test]
    fn test_unknown_cookie_is_violation() {
        let mut engine = CommandQueue::default();
        let mut reply = BytesMut::new();
        NbdReply::ok(42).encode(&mut reply);
        engine.rx.extend_from_slice(&reply);
        let meta = MetaContextRegistry::new();
        let mut stats = Stats::default();
        assert!(next_reply(&mut engine, &meta, &mut stats, false).is_err());
    }

    #[test]
    fn test_write_with_freed_buffer_fails_before_send() {
        let buffer = TransferBuffer::allocate(4);
        let failed = Arc::new(AtomicUsize::new(0));
        let flag = failed.clone();
        let mut engine = CommandQueue::default();
        engine.push(AioCommand {
            cookie: 0,
            command: NbdCommand::Write,
            flags: CommandFlags::default(),
            offset: 0,
            length: 4,
            buffer: Some(buffer.clone()),
            on_extent: None,
            on_complete: Some(Box::new(move |result: Result<(), &CommandError>| {
                assert_eq!(result, Err(&CommandError::BufferFreed));
                flag.fetch_add(1, Ordering::SeqCst);
                false
            })),
            error: None,
            sent: false,
            state: CommandState::Pending,
        });
        buffer.free();

        assert!(!engine.prepare_next_frame());
        assert!(engine.out.is_empty());
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert_eq!(engine.len(), 1, "held until retired");
    }

    #[test]
    fn test_fail_pending_runs_every_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut engine = CommandQueue::default();
        for _ in 0..3 {
            let calls = calls.clone();
            let buffer = TransferBuffer::allocate(1);
            let mut command = read_command(0, 1, &buffer);
            command.on_complete = Some(Box::new(move |result: Result<(), &CommandError>| {
                assert_eq!(result, Err(&CommandError::Terminated));
                calls.fetch_add(1, Ordering::SeqCst);
                true
            }));
            engine.push(command);
        }
        engine.fail_pending(&CommandError::Terminated);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.len(), 0);
        assert!(!engine.wants_write());
    }
}
