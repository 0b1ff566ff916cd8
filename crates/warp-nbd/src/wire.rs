//! NBD (Network Block Device) wire format
//!
//! Encoders and decoders for the fixed-newstyle handshake, option haggling
//! and transmission messages, as specified in:
//! https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! Everything here is big-endian and allocation-light; the handle and the
//! in-process server both build on these helpers.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ClientError, ClientResult};

/// NBD magic numbers
pub const NBD_INIT_MAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
pub const NBD_CLISERV_MAGIC: u64 = 0x00420281861253; // Old-style
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054; // "IHAVEOPT"
pub const NBD_REP_MAGIC: u64 = 0x0003e889045565a9;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;
pub const NBD_STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

/// Server greeting size (magic, opts magic, global flags)
pub const GREETING_SIZE: usize = 18;

/// Longest export name or context name accepted by the protocol
pub const MAX_STRING_LEN: usize = 4096;

/// NBD protocol flags (global)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalFlags(u16);

impl GlobalFlags {
    /// Fixed newstyle negotiation
    pub const FIXED_NEWSTYLE: u16 = 1 << 0;
    /// No zeroes padding
    pub const NO_ZEROES: u16 = 1 << 1;

    /// Create new flags
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Default flags for server
    pub fn server_default() -> Self {
        Self(Self::FIXED_NEWSTYLE | Self::NO_ZEROES)
    }

    /// Server speaks fixed newstyle
    pub fn fixed_newstyle(&self) -> bool {
        self.0 & Self::FIXED_NEWSTYLE != 0
    }

    /// Server allows omitting the 124 bytes of zero padding
    pub fn no_zeroes(&self) -> bool {
        self.0 & Self::NO_ZEROES != 0
    }
}

/// NBD client flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientFlags(u32);

impl ClientFlags {
    /// Fixed newstyle
    pub const FIXED_NEWSTYLE: u32 = 1 << 0;
    /// No zeroes
    pub const NO_ZEROES: u32 = 1 << 1;

    /// Create new flags
    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Flags a client answers with, given what the server offered
    pub fn for_server(server: GlobalFlags) -> Self {
        let mut flags = Self::FIXED_NEWSTYLE;
        if server.no_zeroes() {
            flags |= Self::NO_ZEROES;
        }
        Self(flags)
    }
}

/// NBD transmission flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransmissionFlags(u16);

impl TransmissionFlags {
    /// Has flags (always set)
    pub const HAS_FLAGS: u16 = 1 << 0;
    /// Read-only export
    pub const READ_ONLY: u16 = 1 << 1;
    /// Send FLUSH command
    pub const SEND_FLUSH: u16 = 1 << 2;
    /// Send FUA (Force Unit Access)
    pub const SEND_FUA: u16 = 1 << 3;
    /// Rotational media (not SSD)
    pub const ROTATIONAL: u16 = 1 << 4;
    /// Send TRIM command
    pub const SEND_TRIM: u16 = 1 << 5;
    /// Send WRITE_ZEROES command
    pub const SEND_WRITE_ZEROES: u16 = 1 << 6;
    /// Send DF (Don't Fragment)
    pub const SEND_DF: u16 = 1 << 7;
    /// Can multi-conn
    pub const CAN_MULTI_CONN: u16 = 1 << 8;
    /// Send resize
    pub const SEND_RESIZE: u16 = 1 << 9;
    /// Send cache
    pub const SEND_CACHE: u16 = 1 << 10;
    /// Send fast zero
    pub const SEND_FAST_ZERO: u16 = 1 << 11;

    /// Create new flags
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Check a single flag
    pub fn has(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    /// Default flags for writable volume
    pub fn default_rw() -> Self {
        Self(
            Self::HAS_FLAGS
                | Self::SEND_FLUSH
                | Self::SEND_FUA
                | Self::SEND_TRIM
                | Self::SEND_WRITE_ZEROES
                | Self::CAN_MULTI_CONN
                | Self::SEND_CACHE
                | Self::SEND_FAST_ZERO,
        )
    }

    /// Default flags for read-only volume
    pub fn default_ro() -> Self {
        Self(Self::HAS_FLAGS | Self::READ_ONLY | Self::CAN_MULTI_CONN | Self::SEND_CACHE)
    }
}

/// NBD option codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdOption {
    /// Export name
    ExportName = 1,
    /// Abort
    Abort = 2,
    /// List exports
    List = 3,
    /// Peek export (deprecated)
    PeekExport = 4,
    /// Starttls
    StartTls = 5,
    /// Info
    Info = 6,
    /// Go (finish negotiation)
    Go = 7,
    /// Structured reply
    StructuredReply = 8,
    /// List meta context
    ListMetaContext = 9,
    /// Set meta context
    SetMetaContext = 10,
}

impl NbdOption {
    /// Raw option code
    pub fn code(&self) -> u32 {
        *self as u32
    }
}

impl TryFrom<u32> for NbdOption {
    type Error = ClientError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ExportName),
            2 => Ok(Self::Abort),
            3 => Ok(Self::List),
            4 => Ok(Self::PeekExport),
            5 => Ok(Self::StartTls),
            6 => Ok(Self::Info),
            7 => Ok(Self::Go),
            8 => Ok(Self::StructuredReply),
            9 => Ok(Self::ListMetaContext),
            10 => Ok(Self::SetMetaContext),
            _ => Err(ClientError::violation(format!("Unknown option: {}", value))),
        }
    }
}

/// NBD option reply types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdReplyType {
    /// Acknowledge
    Ack = 1,
    /// Server info
    Server = 2,
    /// Info (export info)
    Info = 3,
    /// Meta context id/name pair
    MetaContext = 4,
    /// Error: unsupported option
    ErrUnsup = (1 << 31) | 1,
    /// Error: policy
    ErrPolicy = (1 << 31) | 2,
    /// Error: invalid
    ErrInvalid = (1 << 31) | 3,
    /// Error: platform
    ErrPlatform = (1 << 31) | 4,
    /// Error: TLS required
    ErrTlsReqd = (1 << 31) | 5,
    /// Error: unknown export
    ErrUnknown = (1 << 31) | 6,
    /// Error: shutdown
    ErrShutdown = (1 << 31) | 7,
    /// Error: block size required
    ErrBlockSizeReqd = (1 << 31) | 8,
    /// Error: too big
    ErrTooBig = (1 << 31) | 9,
}

impl NbdReplyType {
    /// Bit set on every error reply type
    pub const ERROR_BIT: u32 = 1 << 31;

    /// Raw reply type
    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// Whether a raw reply type denotes an error
    pub fn is_error(raw: u32) -> bool {
        raw & Self::ERROR_BIT != 0
    }
}

/// `NBD_INFO_*` items requested by and returned for INFO/GO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InfoType {
    /// Size and transmission flags
    Export = 0,
    /// Canonical export name
    Name = 1,
    /// Free-form description
    Description = 2,
    /// Minimum, preferred and maximum block size
    BlockSize = 3,
}

impl InfoType {
    /// Parse a raw info type
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Export),
            1 => Some(Self::Name),
            2 => Some(Self::Description),
            3 => Some(Self::BlockSize),
            _ => None,
        }
    }
}

/// NBD command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NbdCommand {
    /// Read
    Read = 0,
    /// Write
    Write = 1,
    /// Disconnect
    Disc = 2,
    /// Flush
    Flush = 3,
    /// Trim
    Trim = 4,
    /// Cache (advisory)
    Cache = 5,
    /// Write zeroes
    WriteZeroes = 6,
    /// Block status
    BlockStatus = 7,
    /// Resize
    Resize = 8,
}

impl TryFrom<u16> for NbdCommand {
    type Error = ClientError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::Disc),
            3 => Ok(Self::Flush),
            4 => Ok(Self::Trim),
            5 => Ok(Self::Cache),
            6 => Ok(Self::WriteZeroes),
            7 => Ok(Self::BlockStatus),
            8 => Ok(Self::Resize),
            _ => Err(ClientError::violation(format!("Unknown command: {}", value))),
        }
    }
}

/// NBD command flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandFlags(u16);

impl CommandFlags {
    /// Force unit access (write-through)
    pub const FUA: u16 = 1 << 0;
    /// Don't punch holes (for write zeroes)
    pub const NO_HOLE: u16 = 1 << 1;
    /// Don't fragment (for structured reply)
    pub const DF: u16 = 1 << 2;
    /// Request one (for block status)
    pub const REQ_ONE: u16 = 1 << 3;
    /// Fast zero (for write zeroes)
    pub const FAST_ZERO: u16 = 1 << 4;

    /// Create new flags
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Check FUA flag
    pub fn has_fua(&self) -> bool {
        self.0 & Self::FUA != 0
    }

    /// Check DF flag
    pub fn has_df(&self) -> bool {
        self.0 & Self::DF != 0
    }

    /// Check REQ_ONE flag
    pub fn has_req_one(&self) -> bool {
        self.0 & Self::REQ_ONE != 0
    }

    /// Check fast zero flag
    pub fn has_fast_zero(&self) -> bool {
        self.0 & Self::FAST_ZERO != 0
    }
}

/// NBD request
#[derive(Debug, Clone)]
pub struct NbdRequest {
    /// Command flags
    pub flags: CommandFlags,
    /// Command type
    pub command: NbdCommand,
    /// Handle (cookie for matching reply)
    pub handle: u64,
    /// Offset
    pub offset: u64,
    /// Length
    pub length: u32,
}

impl NbdRequest {
    /// Parse from bytes
    pub fn parse(data: &[u8]) -> ClientResult<Self> {
        if data.len() < Self::SIZE {
            return Err(ClientError::violation("Request too short"));
        }

        let mut buf = data;
        let magic = buf.get_u32();
        if magic != NBD_REQUEST_MAGIC {
            return Err(ClientError::violation(format!(
                "Invalid request magic: {:08x}",
                magic
            )));
        }

        let flags = CommandFlags::new(buf.get_u16());
        let cmd_type = buf.get_u16();
        let command = NbdCommand::try_from(cmd_type)?;
        let handle = buf.get_u64();
        let offset = buf.get_u64();
        let length = buf.get_u32();

        Ok(Self {
            flags,
            command,
            handle,
            offset,
            length,
        })
    }

    /// Encode the fixed-size header; write payloads follow separately
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        buf.put_u32(NBD_REQUEST_MAGIC);
        buf.put_u16(self.flags.bits());
        buf.put_u16(self.command as u16);
        buf.put_u64(self.handle);
        buf.put_u64(self.offset);
        buf.put_u32(self.length);
    }

    /// Request size (always 28 bytes)
    pub const SIZE: usize = 28;
}

/// NBD simple reply
#[derive(Debug, Clone)]
pub struct NbdReply {
    /// Error code
    pub error: u32,
    /// Handle (matches request)
    pub handle: u64,
}

impl NbdReply {
    /// Create a new reply
    pub fn new(handle: u64, error: u32) -> Self {
        Self { error, handle }
    }

    /// Create a success reply
    pub fn ok(handle: u64) -> Self {
        Self { error: 0, handle }
    }

    /// Encode to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(NBD_REPLY_MAGIC);
        buf.put_u32(self.error);
        buf.put_u64(self.handle);
    }

    /// Decode the 16-byte header (magic already checked by the caller)
    pub fn parse(mut data: &[u8]) -> Self {
        let _magic = data.get_u32();
        let error = data.get_u32();
        let handle = data.get_u64();
        Self { error, handle }
    }

    /// Reply size (always 16 bytes)
    pub const SIZE: usize = 16;
}

/// Structured reply chunk types
pub mod chunk {
    /// No payload; normally carries the DONE flag
    pub const NONE: u16 = 0;
    /// Data at an offset
    pub const OFFSET_DATA: u16 = 1;
    /// Hole (reads as zero) at an offset
    pub const OFFSET_HOLE: u16 = 2;
    /// Block status extents for one meta context
    pub const BLOCK_STATUS: u16 = 5;
    /// Error without offset
    pub const ERROR: u16 = (1 << 15) | 1;
    /// Error tied to an offset
    pub const ERROR_OFFSET: u16 = (1 << 15) | 2;

    /// Final chunk for this cookie
    pub const FLAG_DONE: u16 = 1 << 0;

    /// Whether a chunk type is an error
    pub fn is_error(kind: u16) -> bool {
        kind & (1 << 15) != 0
    }
}

/// Structured reply chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuredReplyHeader {
    /// Chunk flags (`FLAG_DONE`)
    pub flags: u16,
    /// Chunk type
    pub kind: u16,
    /// Cookie of the request this chunk belongs to
    pub handle: u64,
    /// Payload length
    pub length: u32,
}

impl StructuredReplyHeader {
    /// Header size (always 20 bytes)
    pub const SIZE: usize = 20;

    /// Decode the header (magic already checked by the caller)
    pub fn parse(mut data: &[u8]) -> Self {
        let _magic = data.get_u32();
        Self {
            flags: data.get_u16(),
            kind: data.get_u16(),
            handle: data.get_u64(),
            length: data.get_u32(),
        }
    }

    /// Encode to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(NBD_STRUCTURED_REPLY_MAGIC);
        buf.put_u16(self.flags);
        buf.put_u16(self.kind);
        buf.put_u64(self.handle);
        buf.put_u32(self.length);
    }

    /// Whether this is the last chunk for its cookie
    pub fn is_done(&self) -> bool {
        self.flags & chunk::FLAG_DONE != 0
    }
}

/// Block status extent flags for `base:allocation`
pub mod extent_flags {
    /// Region is not allocated
    pub const STATE_HOLE: u32 = 1 << 0;
    /// Region reads as zeroes
    pub const STATE_ZERO: u32 = 1 << 1;
}

/// One extent of a block status reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Length in bytes
    pub length: u32,
    /// Context-specific flags
    pub flags: u32,
}

/// Option reply header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionReplyHeader {
    /// Option this reply answers
    pub option: u32,
    /// Raw reply type
    pub reply_type: u32,
    /// Payload length
    pub length: u32,
}

impl OptionReplyHeader {
    /// Header size (always 20 bytes)
    pub const SIZE: usize = 20;

    /// Parse from bytes, checking the magic
    pub fn parse(mut data: &[u8]) -> ClientResult<Self> {
        let magic = data.get_u64();
        if magic != NBD_REP_MAGIC {
            return Err(ClientError::violation(format!(
                "Invalid option reply magic: {:016x}",
                magic
            )));
        }
        Ok(Self {
            option: data.get_u32(),
            reply_type: data.get_u32(),
            length: data.get_u32(),
        })
    }
}

/// Encode an option request
pub fn encode_option(buf: &mut BytesMut, option: NbdOption, data: &[u8]) {
    buf.reserve(16 + data.len());
    buf.put_u64(NBD_OPTS_MAGIC);
    buf.put_u32(option.code());
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Encode an option reply (server side)
pub fn encode_option_reply(buf: &mut BytesMut, option: u32, reply_type: u32, data: &[u8]) {
    buf.reserve(OptionReplyHeader::SIZE + data.len());
    buf.put_u64(NBD_REP_MAGIC);
    buf.put_u32(option);
    buf.put_u32(reply_type);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Payload of an INFO or GO request
pub fn export_request_payload(name: &str, info: &[InfoType]) -> BytesMut {
    let mut data = BytesMut::with_capacity(6 + name.len() + 2 * info.len());
    data.put_u32(name.len() as u32);
    data.put_slice(name.as_bytes());
    data.put_u16(info.len() as u16);
    for item in info {
        data.put_u16(*item as u16);
    }
    data
}

/// Payload of a LIST_META_CONTEXT or SET_META_CONTEXT request
pub fn meta_request_payload<S: AsRef<str>>(name: &str, queries: &[S]) -> BytesMut {
    let mut data = BytesMut::with_capacity(8 + name.len());
    data.put_u32(name.len() as u32);
    data.put_slice(name.as_bytes());
    data.put_u32(queries.len() as u32);
    for query in queries {
        let query = query.as_ref();
        data.put_u32(query.len() as u32);
        data.put_slice(query.as_bytes());
    }
    data
}

/// Read a length-prefixed (u32) string
pub fn get_string(data: &mut &[u8]) -> ClientResult<String> {
    if data.remaining() < 4 {
        return Err(ClientError::violation("String length truncated"));
    }
    let len = data.get_u32() as usize;
    if len > MAX_STRING_LEN || data.remaining() < len {
        return Err(ClientError::violation(format!(
            "String of length {} does not fit",
            len
        )));
    }
    let s = String::from_utf8_lossy(&data[..len]).into_owned();
    data.advance(len);
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags() {
        let flags = GlobalFlags::server_default();
        assert!(flags.fixed_newstyle());
        assert!(flags.no_zeroes());

        let client = ClientFlags::for_server(GlobalFlags::new(GlobalFlags::FIXED_NEWSTYLE));
        assert_eq!(client.bits(), ClientFlags::FIXED_NEWSTYLE);
    }

    #[test]
    fn test_transmission_flags() {
        let rw = TransmissionFlags::default_rw();
        assert!(rw.has(TransmissionFlags::HAS_FLAGS));
        assert!(!rw.has(TransmissionFlags::READ_ONLY));

        let ro = TransmissionFlags::default_ro();
        assert!(ro.has(TransmissionFlags::READ_ONLY));
    }

    #[test]
    fn test_command_flags() {
        let flags = CommandFlags::new(CommandFlags::FUA | CommandFlags::FAST_ZERO);
        assert!(flags.has_fua());
        assert!(flags.has_fast_zero());
        assert!(!flags.has_df());
        assert!(!flags.has_req_one());
    }

    #[test]
    fn test_request_encode_matches_parse() {
        let request = NbdRequest {
            flags: CommandFlags::new(CommandFlags::FUA),
            command: NbdCommand::Write,
            handle: 0xdead_beef,
            offset: 4096,
            length: 512,
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        assert_eq!(buf.len(), NbdRequest::SIZE);
        assert_eq!(&buf[0..4], &NBD_REQUEST_MAGIC.to_be_bytes());

        let parsed = NbdRequest::parse(&buf).unwrap();
        assert_eq!(parsed.command, NbdCommand::Write);
        assert_eq!(parsed.handle, 0xdead_beef);
        assert_eq!(parsed.offset, 4096);
        assert_eq!(parsed.length, 512);
        assert!(parsed.flags.has_fua());
    }

    #[test]
    fn test_nbd_reply() {
        let reply = NbdReply::ok(12345);
        let mut buf = BytesMut::new();
        reply.encode(&mut buf);

        assert_eq!(buf.len(), NbdReply::SIZE);
        assert_eq!(&buf[0..4], &NBD_REPLY_MAGIC.to_be_bytes());
        let parsed = NbdReply::parse(&buf);
        assert_eq!(parsed.handle, 12345);
        assert_eq!(parsed.error, 0);
    }

    #[test]
    fn test_structured_header_done_flag() {
        let header = StructuredReplyHeader {
            flags: chunk::FLAG_DONE,
            kind: chunk::OFFSET_DATA,
            handle: 7,
            length: 8 + 512,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), StructuredReplyHeader::SIZE);
        let parsed = StructuredReplyHeader::parse(&buf);
        assert!(parsed.is_done());
        assert_eq!(parsed, header);
        assert!(chunk::is_error(chunk::ERROR_OFFSET));
        assert!(!chunk::is_error(chunk::BLOCK_STATUS));
    }

    #[test]
    fn test_option_reply_header_rejects_bad_magic() {
        let mut buf = BytesMut::new();
        encode_option_reply(&mut buf, NbdOption::Go.code(), NbdReplyType::Ack.code(), &[]);
        let header = OptionReplyHeader::parse(&buf).unwrap();
        assert_eq!(header.option, NbdOption::Go.code());
        assert_eq!(header.length, 0);

        buf[0] ^= 0xff;
        assert!(OptionReplyHeader::parse(&buf).is_err());
    }

    #[test]
    fn test_meta_request_payload_layout() {
        let data = meta_request_payload("disk", &["base:allocation"]);
        let mut cursor = &data[..];
        assert_eq!(get_string(&mut cursor).unwrap(), "disk");
        assert_eq!(cursor.get_u32(), 1);
        assert_eq!(get_string(&mut cursor).unwrap(), "base:allocation");
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_export_request_payload_layout() {
        let data = export_request_payload("", &[InfoType::BlockSize, InfoType::Name]);
        assert_eq!(data.len(), 4 + 2 + 4);
        assert_eq!(&data[4..6], &2u16.to_be_bytes());
        assert_eq!(InfoType::from_u16(3), Some(InfoType::BlockSize));
        assert_eq!(InfoType::from_u16(9), None);
    }

    #[test]
    fn test_get_string_truncated() {
        let data = [0u8, 0, 0, 10, b'a'];
        assert!(get_string(&mut &data[..]).is_err());
    }
}
