//! NBD connection handler
//!
//! Handles the NBD protocol for a single client connection.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use super::{Export, ServerError, ServerResult, ServerState};
use crate::error::NbdError;
use crate::meta::CONTEXT_BASE_ALLOCATION;
use crate::wire::{
    chunk, encode_option_reply, extent_flags, get_string, ClientFlags, CommandFlags, Extent,
    GlobalFlags, InfoType, NbdCommand, NbdOption, NbdReply, NbdReplyType, NbdRequest,
    StructuredReplyHeader, NBD_INIT_MAGIC, NBD_OPTS_MAGIC,
};

/// Largest option payload accepted
const MAX_OPTION_LEN: u32 = 64 * 1024;

/// Largest write payload accepted
const MAX_WRITE_LEN: u32 = 64 * 1024 * 1024;

/// Contexts chosen by SET_META_CONTEXT, tied to the export they were set for
struct ContextSelection {
    export: String,
    contexts: Vec<(u32, String)>,
}

/// NBD connection handler
pub(crate) struct NbdConnection<S> {
    stream: S,
    client_flags: ClientFlags,
    structured_reply: bool,
    selection: Option<ContextSelection>,
}

impl<S> NbdConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a new connection handler
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            client_flags: ClientFlags::new(0),
            structured_reply: false,
            selection: None,
        }
    }

    /// Run the connection to completion
    pub(crate) async fn run(mut self, server: Arc<ServerState>) -> ServerResult<()> {
        // Phase 1: Initial handshake
        self.send_server_greeting().await?;
        self.receive_client_flags().await?;

        // Phase 2: Option negotiation
        let export = loop {
            match self.handle_option(&server).await? {
                OptionResult::Continue => continue,
                OptionResult::GoToTransmission(export) => break export,
                OptionResult::Abort => return Ok(()),
            }
        };

        // Phase 3: Transmission
        info!("Entering transmission phase for export: {:?}", export.config.name);
        let contexts = self
            .selection
            .take()
            .filter(|s| s.export == export.config.name)
            .map(|s| s.contexts)
            .unwrap_or_default();
        let session = Session {
            export,
            structured: self.structured_reply,
            contexts,
            jitter: server
                .config
                .reorder_reads
                .then(|| Duration::from_micros(server.config.max_jitter_us)),
        };
        session.run(self.stream).await
    }

    /// Send server greeting (newstyle negotiation)
    async fn send_server_greeting(&mut self) -> ServerResult<()> {
        let mut buf = BytesMut::with_capacity(18);
        buf.put_u64(NBD_INIT_MAGIC);
        buf.put_u64(NBD_OPTS_MAGIC);
        buf.put_u16(GlobalFlags::server_default().bits());

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        debug!("Sent server greeting");
        Ok(())
    }

    /// Receive client flags
    async fn receive_client_flags(&mut self) -> ServerResult<()> {
        let flags = self.stream.read_u32().await?;
        self.client_flags = ClientFlags::new(flags);
        debug!("Received client flags: {:08x}", flags);
        Ok(())
    }

    /// Handle an option request
    async fn handle_option(&mut self, server: &ServerState) -> ServerResult<OptionResult> {
        let magic = self.stream.read_u64().await?;
        if magic != NBD_OPTS_MAGIC {
            return Err(ServerError::Protocol(format!(
                "Invalid option magic: {:016x}",
                magic
            )));
        }

        let option_code = self.stream.read_u32().await?;
        let data_len = self.stream.read_u32().await?;
        if data_len > MAX_OPTION_LEN {
            return Err(ServerError::Protocol(format!(
                "Option {} carries {} bytes",
                option_code, data_len
            )));
        }

        let mut data = vec![0u8; data_len as usize];
        if data_len > 0 {
            self.stream.read_exact(&mut data).await?;
        }

        trace!("Received option: {} (data len: {})", option_code, data_len);

        match NbdOption::try_from(option_code) {
            Ok(NbdOption::ExportName) => {
                let name = String::from_utf8_lossy(&data).to_string();
                self.handle_export_name(&name, server).await
            }
            Ok(NbdOption::Abort) => {
                debug!("Client requested abort");
                // The client may already have hung up
                let _ = self
                    .send_option_reply(option_code, NbdReplyType::Ack, &[])
                    .await;
                Ok(OptionResult::Abort)
            }
            Ok(NbdOption::List) => {
                if data.is_empty() {
                    self.send_export_list(server).await?;
                } else {
                    self.send_error(option_code, NbdReplyType::ErrInvalid, "LIST takes no data")
                        .await?;
                }
                Ok(OptionResult::Continue)
            }
            Ok(option @ (NbdOption::Info | NbdOption::Go)) => {
                self.handle_info_or_go(option, &data, server).await
            }
            Ok(NbdOption::StructuredReply) => {
                self.handle_structured_reply(&data, server).await?;
                Ok(OptionResult::Continue)
            }
            Ok(option @ (NbdOption::ListMetaContext | NbdOption::SetMetaContext)) => {
                self.handle_meta_context(option, &data, server).await?;
                Ok(OptionResult::Continue)
            }
            _ => {
                self.send_option_reply(option_code, NbdReplyType::ErrUnsup, &[])
                    .await?;
                Ok(OptionResult::Continue)
            }
        }
    }

    /// Handle NBD_OPT_EXPORT_NAME
    async fn handle_export_name(
        &mut self,
        name: &str,
        server: &ServerState,
    ) -> ServerResult<OptionResult> {
        // No error reply exists for this option; the connection just ends
        let export = server
            .find(name)
            .ok_or_else(|| ServerError::Protocol(format!("Unknown export: {:?}", name)))?;

        let mut buf = BytesMut::with_capacity(134);
        buf.put_u64(export.size());
        buf.put_u16(export.config.transmission_flags().bits());

        if self.client_flags.bits() & ClientFlags::NO_ZEROES == 0 {
            buf.put_bytes(0, 124);
        }

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        info!("Client connected to export: {}", name);
        Ok(OptionResult::GoToTransmission(export))
    }

    /// Handle NBD_OPT_INFO and NBD_OPT_GO
    async fn handle_info_or_go(
        &mut self,
        option: NbdOption,
        data: &[u8],
        server: &ServerState,
    ) -> ServerResult<OptionResult> {
        let code = option.code();
        let Some((name, requests)) = parse_export_request(data) else {
            self.send_error(code, NbdReplyType::ErrInvalid, "malformed request")
                .await?;
            return Ok(OptionResult::Continue);
        };

        let Some(export) = server.find(&name) else {
            self.send_error(code, NbdReplyType::ErrUnknown, &format!("unknown export {:?}", name))
                .await?;
            return Ok(OptionResult::Continue);
        };
        if option == NbdOption::Go && server.config.refuse_go {
            self.send_error(code, NbdReplyType::ErrPolicy, "transmission refused by policy")
                .await?;
            return Ok(OptionResult::Continue);
        }

        self.send_export_info_reply(code, &export, &requests).await?;
        self.send_option_reply(code, NbdReplyType::Ack, &[]).await?;

        if option == NbdOption::Go {
            info!("Client connected to export via GO: {}", name);
            Ok(OptionResult::GoToTransmission(export))
        } else {
            Ok(OptionResult::Continue)
        }
    }

    /// Handle NBD_OPT_STRUCTURED_REPLY
    async fn handle_structured_reply(&mut self, data: &[u8], server: &ServerState) -> ServerResult<()> {
        let code = NbdOption::StructuredReply.code();
        if !data.is_empty() {
            return self
                .send_error(code, NbdReplyType::ErrInvalid, "option takes no data")
                .await;
        }
        if !server.config.structured_replies {
            return self.send_option_reply(code, NbdReplyType::ErrUnsup, &[]).await;
        }
        if self.structured_reply {
            return self
                .send_error(code, NbdReplyType::ErrInvalid, "structured replies already enabled")
                .await;
        }
        self.structured_reply = true;
        self.send_option_reply(code, NbdReplyType::Ack, &[]).await?;
        debug!("Enabled structured replies");
        Ok(())
    }

    /// Handle NBD_OPT_LIST_META_CONTEXT and NBD_OPT_SET_META_CONTEXT
    async fn handle_meta_context(
        &mut self,
        option: NbdOption,
        data: &[u8],
        server: &ServerState,
    ) -> ServerResult<()> {
        let code = option.code();
        let setting = option == NbdOption::SetMetaContext;
        if setting && !self.structured_reply {
            return self
                .send_error(code, NbdReplyType::ErrInvalid, "structured replies not negotiated")
                .await;
        }
        let Some((name, queries)) = parse_meta_request(data) else {
            return self
                .send_error(code, NbdReplyType::ErrInvalid, "malformed request")
                .await;
        };
        if server.find(&name).is_none() {
            return self
                .send_error(code, NbdReplyType::ErrUnknown, &format!("unknown export {:?}", name))
                .await;
        }

        let offered = &server.config.meta_contexts;
        let mut matched: Vec<(u32, String)> = Vec::new();
        if setting {
            for query in &queries {
                if let Some(id) = server.context_id(query) {
                    if !matched.iter().any(|(i, _)| *i == id) {
                        matched.push((id, query.clone()));
                    }
                }
            }
        } else {
            for (i, context) in offered.iter().enumerate() {
                let hit = queries.is_empty() || queries.iter().any(|q| query_matches(q, context));
                if hit {
                    matched.push((i as u32 + 1, context.clone()));
                }
            }
        }

        for (id, context) in &matched {
            let mut payload = BytesMut::with_capacity(4 + context.len());
            payload.put_u32(*id);
            payload.put_slice(context.as_bytes());
            self.send_option_reply(code, NbdReplyType::MetaContext, &payload)
                .await?;
        }
        self.send_option_reply(code, NbdReplyType::Ack, &[]).await?;

        debug!(
            "{:?} for {:?}: {} queries, {} contexts",
            option,
            name,
            queries.len(),
            matched.len()
        );
        if setting {
            self.selection = Some(ContextSelection {
                export: name,
                contexts: matched,
            });
        }
        Ok(())
    }

    /// Send export list
    async fn send_export_list(&mut self, server: &ServerState) -> ServerResult<()> {
        for export in &server.exports {
            let name_bytes = export.config.name.as_bytes();
            let description = export.config.description.as_deref().unwrap_or("");
            let mut data = BytesMut::with_capacity(4 + name_bytes.len() + description.len());
            data.put_u32(name_bytes.len() as u32);
            data.put_slice(name_bytes);
            data.put_slice(description.as_bytes());
            self.send_option_reply(NbdOption::List.code(), NbdReplyType::Server, &data)
                .await?;
        }
        self.send_option_reply(NbdOption::List.code(), NbdReplyType::Ack, &[])
            .await?;
        Ok(())
    }

    /// Send export info replies
    async fn send_export_info_reply(
        &mut self,
        option: u32,
        export: &Export,
        requests: &[InfoType],
    ) -> ServerResult<()> {
        // NBD_INFO_EXPORT
        let mut data = BytesMut::with_capacity(12);
        data.put_u16(InfoType::Export as u16);
        data.put_u64(export.size());
        data.put_u16(export.config.transmission_flags().bits());
        self.send_option_reply(option, NbdReplyType::Info, &data)
            .await?;

        if requests.contains(&InfoType::Name) {
            let mut data = BytesMut::new();
            data.put_u16(InfoType::Name as u16);
            data.put_slice(export.config.name.as_bytes());
            self.send_option_reply(option, NbdReplyType::Info, &data)
                .await?;
        }

        if let Some(description) = export
            .config
            .description
            .as_deref()
            .filter(|_| requests.contains(&InfoType::Description))
        {
            let mut data = BytesMut::new();
            data.put_u16(InfoType::Description as u16);
            data.put_slice(description.as_bytes());
            self.send_option_reply(option, NbdReplyType::Info, &data)
                .await?;
        }

        // NBD_INFO_BLOCK_SIZE
        let mut data = BytesMut::with_capacity(14);
        data.put_u16(InfoType::BlockSize as u16);
        data.put_u32(export.config.min_block_size);
        data.put_u32(export.config.preferred_block_size);
        data.put_u32(export.config.max_block_size);
        self.send_option_reply(option, NbdReplyType::Info, &data)
            .await?;

        Ok(())
    }

    async fn send_error(
        &mut self,
        option: u32,
        reply_type: NbdReplyType,
        message: &str,
    ) -> ServerResult<()> {
        debug!("Option {} failed: {}", option, message);
        self.send_option_reply(option, reply_type, message.as_bytes())
            .await
    }

    /// Send option reply
    async fn send_option_reply(
        &mut self,
        option: u32,
        reply_type: NbdReplyType,
        data: &[u8],
    ) -> ServerResult<()> {
        let mut buf = BytesMut::new();
        encode_option_reply(&mut buf, option, reply_type.code(), data);

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Result of option handling
enum OptionResult {
    Continue,
    GoToTransmission(Arc<Export>),
    Abort,
}

fn parse_export_request(data: &[u8]) -> Option<(String, Vec<InfoType>)> {
    let mut cursor = data;
    let name = get_string(&mut cursor).ok()?;
    if cursor.remaining() < 2 {
        return None;
    }
    let count = cursor.get_u16() as usize;
    if cursor.remaining() != count * 2 {
        return None;
    }
    let requests = (0..count)
        .filter_map(|_| InfoType::from_u16(cursor.get_u16()))
        .collect();
    Some((name, requests))
}

fn parse_meta_request(data: &[u8]) -> Option<(String, Vec<String>)> {
    let mut cursor = data;
    let name = get_string(&mut cursor).ok()?;
    if cursor.remaining() < 4 {
        return None;
    }
    let count = cursor.get_u32();
    let mut queries = Vec::new();
    for _ in 0..count {
        queries.push(get_string(&mut cursor).ok()?);
    }
    if cursor.has_remaining() {
        return None;
    }
    Some((name, queries))
}

/// A query ending in `:` selects every context in that namespace
fn query_matches(query: &str, context: &str) -> bool {
    if query.ends_with(':') {
        context.starts_with(query)
    } else {
        context == query
    }
}

/// Transmission phase of one connection
struct Session {
    export: Arc<Export>,
    structured: bool,
    contexts: Vec<(u32, String)>,
    jitter: Option<Duration>,
}

impl Session {
    /// Run the transmission loop
    async fn run<S>(self, stream: S) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<BytesMut>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                writer.write_all(&frame).await?;
            }
            writer.flush().await?;
            Ok::<_, std::io::Error>(())
        });

        let session = Arc::new(self);
        let mut reads = JoinSet::new();
        let mut request_buf = [0u8; NbdRequest::SIZE];
        let result = loop {
            match reader.read_exact(&mut request_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("Client disconnected");
                    break Ok(());
                }
                Err(e) => break Err(e.into()),
            }

            let request = match NbdRequest::parse(&request_buf) {
                Ok(request) => request,
                Err(e) => break Err(ServerError::Protocol(e.to_string())),
            };
            trace!(
                "Request: {:?} offset={} len={}",
                request.command,
                request.offset,
                request.length
            );

            if request.command == NbdCommand::Read {
                while reads.try_join_next().is_some() {}
                match session.jitter {
                    Some(max) => {
                        let session = session.clone();
                        let tx = tx.clone();
                        reads.spawn(async move {
                            tokio::time::sleep(jitter_for(request.handle, max)).await;
                            let _ = tx.send(session.read_reply(&request).await);
                        });
                    }
                    None => {
                        let _ = tx.send(session.read_reply(&request).await);
                    }
                }
                continue;
            }

            // Everything else waits for outstanding reads
            while reads.join_next().await.is_some() {}

            if request.command == NbdCommand::Disc {
                debug!("Client requested disconnect");
                break Ok(());
            }

            let payload = if request.command == NbdCommand::Write {
                if request.length > MAX_WRITE_LEN {
                    break Err(ServerError::Protocol(format!(
                        "Write of {} bytes exceeds the limit",
                        request.length
                    )));
                }
                let mut data = vec![0u8; request.length as usize];
                if let Err(e) = reader.read_exact(&mut data).await {
                    break Err(e.into());
                }
                data
            } else {
                Vec::new()
            };

            let frame = match session.handle_command(&request, &payload).await {
                Ok(frame) => frame,
                Err(errno) => {
                    warn!("Command {:?} failed: {}", request.command, errno);
                    session.error_reply(&request, errno)
                }
            };
            let _ = tx.send(frame);
        };

        while reads.join_next().await.is_some() {}
        drop(tx);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Reply writer stopped: {}", e),
            Err(e) => warn!("Reply writer task failed: {}", e),
        }
        result
    }

    /// Handle a non-read command, returning its reply frame
    async fn handle_command(&self, request: &NbdRequest, payload: &[u8]) -> Result<BytesMut, NbdError> {
        let config = &self.export.config;
        let volume = &self.export.volume;
        let flags = request.flags;
        let writing = matches!(
            request.command,
            NbdCommand::Write | NbdCommand::Trim | NbdCommand::WriteZeroes
        );
        if writing && config.read_only {
            return Err(NbdError::Perm);
        }
        if request.command != NbdCommand::Flush && !self.in_bounds(request) {
            return Err(if writing { NbdError::NoSpc } else { NbdError::Inval });
        }

        match request.command {
            NbdCommand::Write => {
                volume.write(request.offset, payload).await?;
                self.flush_if_fua(flags).await?;
            }
            NbdCommand::Flush => volume.flush().await?,
            NbdCommand::Trim => {
                volume.trim(request.offset, request.length).await?;
                self.flush_if_fua(flags).await?;
            }
            NbdCommand::WriteZeroes => {
                if flags.has_fast_zero() && !config.fast_zero {
                    return Err(NbdError::NotSup);
                }
                volume
                    .write_zeroes(request.offset, request.length, flags.has_fast_zero())
                    .await?;
                self.flush_if_fua(flags).await?;
            }
            NbdCommand::Cache => {}
            NbdCommand::BlockStatus => return self.block_status_reply(request),
            _ => return Err(NbdError::Inval),
        }

        let mut buf = BytesMut::with_capacity(NbdReply::SIZE);
        NbdReply::ok(request.handle).encode(&mut buf);
        Ok(buf)
    }

    async fn flush_if_fua(&self, flags: CommandFlags) -> Result<(), NbdError> {
        if flags.has_fua() {
            self.export.volume.flush().await?;
        }
        Ok(())
    }

    fn in_bounds(&self, request: &NbdRequest) -> bool {
        request
            .offset
            .checked_add(request.length as u64)
            .is_some_and(|end| end <= self.export.size())
    }

    /// Reply frame(s) for a read
    async fn read_reply(&self, request: &NbdRequest) -> BytesMut {
        if !self.in_bounds(request) {
            return self.error_reply(request, NbdError::Inval);
        }
        let data = match self
            .export
            .volume
            .read(request.offset, request.length)
            .await
        {
            Ok(data) => data,
            Err(errno) => return self.error_reply(request, errno),
        };

        let mut buf = BytesMut::new();
        if !self.structured {
            NbdReply::ok(request.handle).encode(&mut buf);
            buf.put_slice(&data);
            return buf;
        }
        if data.is_empty() {
            put_chunk(&mut buf, chunk::FLAG_DONE, chunk::NONE, request.handle, &[]);
            return buf;
        }

        let extents = if request.flags.has_df() {
            vec![Extent {
                length: request.length,
                flags: 0,
            }]
        } else {
            self.export.volume.extents(request.offset, request.length)
        };
        let segments = segments(&extents, request.length);
        let last = segments.len() - 1;
        for (i, (start, length, hole)) in segments.into_iter().enumerate() {
            let flags = if i == last { chunk::FLAG_DONE } else { 0 };
            let offset = request.offset + start as u64;
            let mut payload = BytesMut::new();
            payload.put_u64(offset);
            if hole {
                payload.put_u32(length as u32);
                put_chunk(&mut buf, flags, chunk::OFFSET_HOLE, request.handle, &payload);
            } else {
                payload.put_slice(&data[start..start + length]);
                put_chunk(&mut buf, flags, chunk::OFFSET_DATA, request.handle, &payload);
            }
        }
        buf
    }

    fn block_status_reply(&self, request: &NbdRequest) -> Result<BytesMut, NbdError> {
        if !self.structured || self.contexts.is_empty() || request.length == 0 {
            return Err(NbdError::Inval);
        }
        let mut buf = BytesMut::new();
        let last = self.contexts.len() - 1;
        for (i, (id, name)) in self.contexts.iter().enumerate() {
            let mut extents = if name == CONTEXT_BASE_ALLOCATION {
                self.export.volume.extents(request.offset, request.length)
            } else {
                vec![Extent {
                    length: request.length,
                    flags: 0,
                }]
            };
            if request.flags.has_req_one() {
                extents.truncate(1);
            }
            let mut payload = BytesMut::with_capacity(4 + 8 * extents.len());
            payload.put_u32(*id);
            for extent in &extents {
                payload.put_u32(extent.length);
                payload.put_u32(extent.flags);
            }
            let flags = if i == last { chunk::FLAG_DONE } else { 0 };
            put_chunk(&mut buf, flags, chunk::BLOCK_STATUS, request.handle, &payload);
        }
        Ok(buf)
    }

    /// Error reply; structured only where a structured reply was expected
    fn error_reply(&self, request: &NbdRequest, errno: NbdError) -> BytesMut {
        let mut buf = BytesMut::new();
        let structured_command = matches!(
            request.command,
            NbdCommand::Read | NbdCommand::BlockStatus
        );
        if self.structured && structured_command {
            let message = errno.to_string();
            let mut payload = BytesMut::with_capacity(6 + message.len());
            payload.put_u32(errno.code());
            payload.put_u16(message.len() as u16);
            payload.put_slice(message.as_bytes());
            put_chunk(&mut buf, chunk::FLAG_DONE, chunk::ERROR, request.handle, &payload);
        } else {
            NbdReply::new(request.handle, errno.code()).encode(&mut buf);
        }
        buf
    }
}

fn put_chunk(buf: &mut BytesMut, flags: u16, kind: u16, handle: u64, payload: &[u8]) {
    StructuredReplyHeader {
        flags,
        kind,
        handle,
        length: payload.len() as u32,
    }
    .encode(buf);
    buf.put_slice(payload);
}

/// Split a read into `(start, length, is_hole)` pieces covering `length`
fn segments(extents: &[Extent], length: u32) -> Vec<(usize, usize, bool)> {
    let total = length as usize;
    let mut pieces = Vec::new();
    let mut pos = 0usize;
    for extent in extents {
        if pos >= total {
            break;
        }
        let len = (extent.length as usize).min(total - pos);
        if len == 0 {
            continue;
        }
        pieces.push((pos, len, extent.flags & extent_flags::STATE_ZERO != 0));
        pos += len;
    }
    if pos < total {
        pieces.push((pos, total - pos, false));
    }
    pieces
}

/// Deterministic per-cookie delay in `[0, max)`
fn jitter_for(handle: u64, max: Duration) -> Duration {
    let max_us = max.as_micros() as u64;
    if max_us == 0 {
        return Duration::ZERO;
    }
    let mixed = handle.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
    Duration::from_micros(mixed % max_us)
}
