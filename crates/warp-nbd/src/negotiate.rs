//! Option haggling
//!
//! Everything a handle does between the handshake and `opt_go`. The rules
//! that matter:
//!
//! - Listing (exports or meta contexts) is stateless.
//! - Only a selection (`opt_set_meta_context*`, or the implicit selection
//!   `opt_info`/`opt_go` make when `request_meta_context` is on) replaces the
//!   negotiated context set, and only when the whole exchange succeeds.
//! - Changing the export name drops both the export info cache and the
//!   negotiated set; a failed INFO/GO drops the cache but keeps the set.

use bytes::{Buf, BytesMut};

use crate::error::{ClientError, ClientResult, OptionReplyError, ServerReason};
use crate::export::{BlockSizes, ExportEntry, ExportInfo, ExportList};
use crate::handle::{check_string, Handle, Phase};
use crate::meta::MetaContext;
use crate::wire::{
    encode_option, export_request_payload, get_string, meta_request_payload, InfoType, NbdOption,
    NbdReplyType, OptionReplyHeader, TransmissionFlags,
};

/// Largest option reply payload accepted
const MAX_OPTION_REPLY: u32 = 64 * 1024;

impl Handle {
    /// Select the export that INFO and GO refer to
    ///
    /// A different name drops the cached export info and any negotiated
    /// meta contexts; the requested list is kept. Re-setting the current
    /// name changes nothing.
    pub fn set_export_name(&mut self, name: impl Into<String>) -> ClientResult<()> {
        self.require_phase(&[Phase::Created, Phase::Negotiating], "set_export_name")?;
        let name = name.into();
        check_string(&name, "export name")?;
        if name == self.config.export_name {
            return Ok(());
        }
        self.emit_debug(format!("export name set to {:?}", name));
        self.config.export_name = name;
        self.info.invalidate();
        self.meta.invalidate();
        Ok(())
    }

    /// Negotiate structured replies explicitly
    ///
    /// Returns `false` if the server refused, which includes asking again
    /// once they are already active.
    pub fn opt_structured_reply(&mut self) -> ClientResult<bool> {
        self.require_phase(&[Phase::Negotiating], "opt_structured_reply")?;
        let result = self.structured_reply_exchange();
        self.guard(result)
    }

    /// Fetch size and flags for the current export without committing to it
    pub fn opt_info(&mut self) -> ClientResult<()> {
        self.require_phase(&[Phase::Negotiating], "opt_info")?;
        let result = self.export_exchange(NbdOption::Info);
        self.guard(result)
    }

    /// Commit the current export and enter the transmission phase
    ///
    /// On failure the handle stays in the negotiating phase.
    pub fn opt_go(&mut self) -> ClientResult<()> {
        self.require_phase(&[Phase::Negotiating], "opt_go")?;
        let result = self.export_exchange(NbdOption::Go);
        self.guard(result)
    }

    /// List the exports the server is willing to advertise
    pub fn opt_list(&mut self) -> ClientResult<ExportList> {
        self.require_phase(&[Phase::Negotiating], "opt_list")?;
        let result = self.list_exchange();
        self.guard(result)
    }

    /// List contexts matching the requested list (everything if it is empty)
    pub fn opt_list_meta_context<F>(&mut self, callback: F) -> ClientResult<usize>
    where
        F: FnMut(&str),
    {
        let queries = self.meta.requested_names().to_vec();
        self.opt_list_meta_context_queries(&queries, callback)
    }

    /// List contexts matching `queries`
    ///
    /// An empty `queries` falls back to the requested list. Queries ending in
    /// `:` are prefix wildcards for the server to expand. The negotiated set
    /// is never touched.
    pub fn opt_list_meta_context_queries<S, F>(
        &mut self,
        queries: &[S],
        mut callback: F,
    ) -> ClientResult<usize>
    where
        S: AsRef<str>,
        F: FnMut(&str),
    {
        self.require_phase(&[Phase::Negotiating], "opt_list_meta_context")?;
        let queries: Vec<String> = if queries.is_empty() {
            self.meta.requested_names().to_vec()
        } else {
            queries.iter().map(|q| q.as_ref().to_string()).collect()
        };
        for query in &queries {
            check_string(query, "meta context query")?;
        }

        let result = self.meta_exchange(NbdOption::ListMetaContext, &queries);
        let contexts = self.guard(result)?;
        for context in &contexts {
            callback(&context.name);
        }
        Ok(contexts.len())
    }

    /// Select the requested contexts for the current export
    pub fn opt_set_meta_context<F>(&mut self, callback: F) -> ClientResult<usize>
    where
        F: FnMut(&str),
    {
        let queries = self.meta.requested_names().to_vec();
        self.opt_set_meta_context_queries(&queries, callback)
    }

    /// Select exactly `queries` for the current export
    ///
    /// An empty list selects nothing. Names must match exactly; the server
    /// does not expand wildcards here. Requires structured replies.
    pub fn opt_set_meta_context_queries<S, F>(
        &mut self,
        queries: &[S],
        mut callback: F,
    ) -> ClientResult<usize>
    where
        S: AsRef<str>,
        F: FnMut(&str),
    {
        self.require_phase(&[Phase::Negotiating], "opt_set_meta_context")?;
        if !self.structured_replies {
            return Err(ClientError::NotNegotiated(
                "selecting meta contexts requires structured replies".to_string(),
            ));
        }
        let queries: Vec<String> = queries.iter().map(|q| q.as_ref().to_string()).collect();
        for query in &queries {
            check_string(query, "meta context query")?;
        }

        let result = self.meta_exchange(NbdOption::SetMetaContext, &queries);
        let contexts = self.guard(result)?;
        for context in &contexts {
            callback(&context.name);
        }
        let count = contexts.len();
        self.emit_debug(format!("{} meta contexts selected", count));
        self.meta.set_negotiated(contexts);
        Ok(count)
    }

    /// Abandon negotiation and close the connection
    pub fn opt_abort(&mut self) -> ClientResult<()> {
        self.require_phase(&[Phase::Negotiating], "opt_abort")?;
        if let Err(e) = self.send_option(NbdOption::Abort, &[]) {
            self.emit_debug(format!("sending abort failed: {}", e));
        }
        self.emit_debug("negotiation aborted".to_string());
        self.close_transport(crate::error::CommandError::Terminated);
        Ok(())
    }

    fn send_option(&mut self, option: NbdOption, data: &[u8]) -> ClientResult<()> {
        let mut buf = BytesMut::new();
        encode_option(&mut buf, option, data);
        self.send_blocking(&buf)
    }

    fn recv_option_reply(&mut self, option: NbdOption) -> ClientResult<(u32, BytesMut)> {
        let header = self.recv_blocking(OptionReplyHeader::SIZE)?;
        let header = OptionReplyHeader::parse(&header)?;
        if header.option != option.code() {
            return Err(ClientError::violation(format!(
                "Reply for option {} while waiting for {:?}",
                header.option, option
            )));
        }
        if header.length > MAX_OPTION_REPLY {
            return Err(ClientError::violation(format!(
                "Option reply of {} bytes is too large",
                header.length
            )));
        }
        let payload = if header.length > 0 {
            self.recv_blocking(header.length as usize)?
        } else {
            BytesMut::new()
        };
        self.stats.chunk_received();
        Ok((header.reply_type, payload))
    }

    fn structured_reply_exchange(&mut self) -> ClientResult<bool> {
        self.send_option(NbdOption::StructuredReply, &[])?;
        let (reply_type, payload) = self.recv_option_reply(NbdOption::StructuredReply)?;
        if reply_type == NbdReplyType::Ack.code() {
            self.structured_replies = true;
            self.emit_debug("structured replies enabled".to_string());
            Ok(true)
        } else if NbdReplyType::is_error(reply_type) {
            let err = option_error(NbdOption::StructuredReply, reply_type, &payload);
            self.emit_debug(format!("structured replies refused: {}", err));
            Ok(false)
        } else {
            Err(unexpected_reply(NbdOption::StructuredReply, reply_type))
        }
    }

    fn export_exchange(&mut self, option: NbdOption) -> ClientResult<()> {
        let auto_select = self.config.request_meta_context
            && self.structured_replies
            && self.meta.requested_count() > 0;
        let selection = if auto_select {
            let queries = self.meta.requested_names().to_vec();
            match self.meta_exchange(NbdOption::SetMetaContext, &queries) {
                Ok(contexts) => Some(contexts),
                Err(ClientError::Protocol {
                    reason: ServerReason::OptionReply(reply),
                    ..
                }) => {
                    self.emit_debug(format!("implicit context selection refused: {}", reply));
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let mut requests = vec![InfoType::BlockSize];
        if self.config.full_info {
            requests.push(InfoType::Name);
            requests.push(InfoType::Description);
        }
        let name = self.config.export_name.clone();
        self.send_option(option, &export_request_payload(&name, &requests))?;

        let mut reported = ReportedInfo::default();
        loop {
            let (reply_type, payload) = self.recv_option_reply(option)?;
            if reply_type == NbdReplyType::Ack.code() {
                break;
            } else if reply_type == NbdReplyType::Info.code() {
                reported.absorb(payload)?;
            } else if NbdReplyType::is_error(reply_type) {
                self.info.invalidate();
                let err = option_error(option, reply_type, &payload);
                self.emit_debug(format!("{:?} for {:?} failed: {}", option, name, err));
                return Err(err);
            } else {
                return Err(unexpected_reply(option, reply_type));
            }
        }

        let info = reported.into_info(name)?;
        self.emit_debug(format!(
            "export {:?}: size {} flags {:#06x}",
            info.name,
            info.size,
            info.flags.bits()
        ));
        self.info.populate(info);
        if let Some(contexts) = selection {
            self.meta.set_negotiated(contexts);
        }

        if option == NbdOption::Go {
            self.meta.freeze();
            self.phase = Phase::Transmission;
            tracing::info!(
                handle = %self.config.handle_name,
                export = %self.config.export_name,
                "entered transmission phase"
            );
        }
        Ok(())
    }

    fn list_exchange(&mut self) -> ClientResult<ExportList> {
        self.send_option(NbdOption::List, &[])?;
        let mut entries = Vec::new();
        loop {
            let (reply_type, payload) = self.recv_option_reply(NbdOption::List)?;
            if reply_type == NbdReplyType::Ack.code() {
                break;
            } else if reply_type == NbdReplyType::Server.code() {
                let mut cursor = &payload[..];
                let name = get_string(&mut cursor)?;
                let description = String::from_utf8_lossy(cursor).into_owned();
                entries.push(ExportEntry { name, description });
            } else if NbdReplyType::is_error(reply_type) {
                return Err(option_error(NbdOption::List, reply_type, &payload));
            } else {
                return Err(unexpected_reply(NbdOption::List, reply_type));
            }
        }
        self.emit_debug(format!("server listed {} exports", entries.len()));
        Ok(ExportList::new(entries))
    }

    fn meta_exchange(
        &mut self,
        option: NbdOption,
        queries: &[String],
    ) -> ClientResult<Vec<MetaContext>> {
        let payload = meta_request_payload(&self.config.export_name, queries);
        self.send_option(option, &payload)?;

        let mut contexts = Vec::new();
        loop {
            let (reply_type, payload) = self.recv_option_reply(option)?;
            if reply_type == NbdReplyType::Ack.code() {
                break;
            } else if reply_type == NbdReplyType::MetaContext.code() {
                let mut cursor = &payload[..];
                if cursor.remaining() < 4 {
                    return Err(ClientError::violation("Meta context reply too short"));
                }
                let id = cursor.get_u32();
                let name = String::from_utf8_lossy(cursor).into_owned();
                contexts.push(MetaContext { id, name });
            } else if NbdReplyType::is_error(reply_type) {
                return Err(option_error(option, reply_type, &payload));
            } else {
                return Err(unexpected_reply(option, reply_type));
            }
        }
        Ok(contexts)
    }
}

/// Pieces of export info collected from `NBD_REP_INFO` replies
#[derive(Default)]
struct ReportedInfo {
    export: Option<(u64, TransmissionFlags)>,
    block_sizes: Option<BlockSizes>,
    canonical_name: Option<String>,
    description: Option<String>,
}

impl ReportedInfo {
    fn absorb(&mut self, payload: BytesMut) -> ClientResult<()> {
        let mut data = &payload[..];
        if data.remaining() < 2 {
            return Err(ClientError::violation("Info reply too short"));
        }
        let kind = data.get_u16();
        match InfoType::from_u16(kind) {
            Some(InfoType::Export) => {
                if data.remaining() != 10 {
                    return Err(ClientError::violation("NBD_INFO_EXPORT has wrong length"));
                }
                let size = data.get_u64();
                let flags = TransmissionFlags::new(data.get_u16());
                self.export = Some((size, flags));
            }
            Some(InfoType::Name) => {
                self.canonical_name = Some(String::from_utf8_lossy(data).into_owned());
            }
            Some(InfoType::Description) => {
                self.description = Some(String::from_utf8_lossy(data).into_owned());
            }
            Some(InfoType::BlockSize) => {
                if data.remaining() != 12 {
                    return Err(ClientError::violation(
                        "NBD_INFO_BLOCK_SIZE has wrong length",
                    ));
                }
                self.block_sizes = Some(BlockSizes {
                    minimum: data.get_u32(),
                    preferred: data.get_u32(),
                    maximum: data.get_u32(),
                });
            }
            None => tracing::trace!(kind, "ignoring unknown info type"),
        }
        Ok(())
    }

    fn into_info(self, name: String) -> ClientResult<ExportInfo> {
        let (size, flags) = self.export.ok_or_else(|| {
            ClientError::violation("Server acknowledged without sending NBD_INFO_EXPORT")
        })?;
        let mut info = ExportInfo::new(name, size, flags);
        info.block_sizes = self.block_sizes;
        info.canonical_name = self.canonical_name;
        info.description = self.description;
        Ok(info)
    }
}

fn option_error(option: NbdOption, reply_type: u32, payload: &[u8]) -> ClientError {
    let reply = OptionReplyError(reply_type);
    let message = if payload.is_empty() {
        format!("{:?} rejected", option)
    } else {
        String::from_utf8_lossy(payload).into_owned()
    };
    ClientError::Protocol {
        reason: ServerReason::OptionReply(reply),
        message,
    }
}

fn unexpected_reply(option: NbdOption, reply_type: u32) -> ClientError {
    ClientError::violation(format!(
        "Unexpected reply type {:#x} to {:?}",
        reply_type, option
    ))
}
