//! Pipelined copy between a source handle and a destination
//!
//! Reads are issued up to a fixed cap and held in the source's queue after
//! they complete. Only the read at the front of the queue is forwarded, so
//! the destination sees data in ascending offset order however the server
//! orders its replies. Both handles are driven from one readiness wait.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::aio::Cookie;
use crate::buffer::TransferBuffer;
use crate::config::CopyConfig;
use crate::error::{ClientError, ClientResult, CommandError};
use crate::handle::Handle;
use crate::reactor::{self, Direction, Interest, Readiness};
use crate::wire::CommandFlags;

/// What a copy did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopyReport {
    /// Bytes read from the source
    pub bytes_read: u64,
    /// Bytes accepted by the destination
    pub bytes_written: u64,
    /// Read requests issued
    pub requests: u64,
    /// Highest number of reads outstanding at once
    pub max_reads_in_flight: usize,
    /// Reads that completed ahead of an earlier-issued read
    pub reordered_completions: u64,
}

/// Copy orchestrator
#[derive(Debug, Clone, Default)]
pub struct Copier {
    config: CopyConfig,
}

impl Copier {
    /// Create a copier
    pub fn new(config: CopyConfig) -> Self {
        Self { config }
    }

    /// Copy the whole source export into the destination export
    pub fn copy_to_handle(&self, src: &mut Handle, dst: &mut Handle) -> ClientResult<CopyReport> {
        let size = src.size()?;
        let dst_size = dst.size()?;
        if dst_size < size {
            return Err(ClientError::InvalidArgument(format!(
                "destination of {} bytes is smaller than source of {} bytes",
                dst_size, size
            )));
        }
        if dst.is_read_only()? {
            return Err(ClientError::Unsupported("destination export is read-only".to_string()));
        }
        let mut sink = HandleSink {
            handle: dst,
            written: Arc::new(AtomicU64::new(0)),
            failure: Arc::new(Mutex::new(None)),
            cap: self.config.max_in_flight,
            flush: self.config.flush,
        };
        self.run(src, &mut sink)
    }

    /// Copy the whole source export into a byte stream
    pub fn copy_to_writer<W: Write>(&self, src: &mut Handle, dst: &mut W) -> ClientResult<CopyReport> {
        let mut sink = WriterSink {
            writer: dst,
            written: 0,
        };
        self.run(src, &mut sink)
    }

    fn run(&self, src: &mut Handle, sink: &mut dyn Sink) -> ClientResult<CopyReport> {
        if self.config.request_size == 0 || self.config.max_in_flight == 0 {
            return Err(ClientError::InvalidArgument(
                "request size and in-flight cap must be non-zero".to_string(),
            ));
        }
        let size = src.size()?;
        let log = Arc::new(Mutex::new(CompletionLog::default()));
        let mut reads: VecDeque<PendingRead> = VecDeque::new();
        let mut next_offset = 0u64;
        let mut report = CopyReport::default();
        info!(size, request_size = self.config.request_size, cap = self.config.max_in_flight, "starting copy");

        let result = 'copy: loop {
            while next_offset < size && reads.len() < self.config.max_in_flight {
                let length = (size - next_offset).min(self.config.request_size as u64) as usize;
                let buffer = TransferBuffer::allocate(length);
                let sequence = report.requests;
                let completions = log.clone();
                let cookie = match src.issue_read(&buffer, next_offset, move |_| {
                    completions.lock().record(sequence);
                    false
                }) {
                    Ok(cookie) => cookie,
                    Err(e) => {
                        buffer.free();
                        break 'copy Err(e);
                    }
                };
                reads.push_back(PendingRead {
                    cookie,
                    buffer,
                    offset: next_offset,
                });
                next_offset += length as u64;
                report.requests += 1;
                report.max_reads_in_flight = report.max_reads_in_flight.max(src.in_flight_count());
            }

            if let Err(e) = self.drain_front(src, sink, &mut reads, &mut report) {
                break Err(e);
            }
            if let Err(e) = sink.check() {
                break Err(e);
            }
            if next_offset >= size && reads.is_empty() {
                break Ok(());
            }

            let interests = [src.interest(), sink.interest()];
            if interests.iter().all(|i| i.direction == Direction::None) {
                break Err(ClientError::InvalidState(
                    "copy stalled: neither handle can make progress".to_string(),
                ));
            }
            let ready = match reactor::wait(&interests, None) {
                Ok(ready) => ready,
                Err(e) => break Err(e),
            };
            if let Err(e) = src.dispatch(ready[0]) {
                break Err(e);
            }
            if let Err(e) = sink.dispatch(ready[1]) {
                break Err(e);
            }
        };

        if let Err(e) = result {
            // Buffers of reads still in flight stay with the source engine
            for read in reads.drain(..) {
                if !matches!(src.command_completed(read.cookie), Ok(false)) {
                    read.buffer.free();
                }
            }
            return Err(e);
        }

        sink.finish()?;
        report.bytes_written = sink.bytes_written();
        report.reordered_completions = log.lock().reordered;
        debug!(?report, "copy finished");
        Ok(report)
    }

    /// Forward completed reads from the front of the queue, in issue order
    fn drain_front(
        &self,
        src: &mut Handle,
        sink: &mut dyn Sink,
        reads: &mut VecDeque<PendingRead>,
        report: &mut CopyReport,
    ) -> ClientResult<()> {
        while let Some(front) = reads.front() {
            if !sink.has_capacity() {
                break;
            }
            if !src.command_completed(front.cookie)? {
                break;
            }
            if let Some(read) = reads.pop_front() {
                report.bytes_read += read.buffer.len() as u64;
                sink.emit(read.buffer, read.offset)?;
            }
        }
        Ok(())
    }
}

struct PendingRead {
    cookie: Cookie,
    buffer: TransferBuffer,
    offset: u64,
}

/// Order in which read callbacks fired
#[derive(Default)]
struct CompletionLog {
    completed: u64,
    reordered: u64,
}

impl CompletionLog {
    fn record(&mut self, sequence: u64) {
        if sequence != self.completed {
            self.reordered += 1;
        }
        self.completed += 1;
    }
}

/// Where completed reads go
trait Sink {
    /// Take ownership of a filled buffer
    fn emit(&mut self, buffer: TransferBuffer, offset: u64) -> ClientResult<()>;
    /// Whether another buffer can be accepted now
    fn has_capacity(&self) -> bool;
    /// Readiness interest, if the sink is a connection
    fn interest(&self) -> Interest;
    /// Feed readiness back
    fn dispatch(&mut self, readiness: Readiness) -> ClientResult<()>;
    /// Surface asynchronous failures
    fn check(&self) -> ClientResult<()>;
    /// Wait for outstanding work and flush
    fn finish(&mut self) -> ClientResult<()>;
    /// Bytes accepted so far
    fn bytes_written(&self) -> u64;
}

struct HandleSink<'a> {
    handle: &'a mut Handle,
    written: Arc<AtomicU64>,
    failure: Arc<Mutex<Option<CommandError>>>,
    cap: usize,
    flush: bool,
}

impl Sink for HandleSink<'_> {
    fn emit(&mut self, buffer: TransferBuffer, offset: u64) -> ClientResult<()> {
        let written = self.written.clone();
        let failure = self.failure.clone();
        let owned = buffer.clone();
        let length = buffer.len() as u64;
        let issued = self
            .handle
            .issue_write(&buffer, offset, CommandFlags::default(), move |result| {
                match result {
                    Ok(()) => {
                        written.fetch_add(length, Ordering::Relaxed);
                    }
                    Err(e) => {
                        failure.lock().get_or_insert_with(|| e.clone());
                    }
                }
                owned.free();
                true
            });
        if issued.is_err() {
            buffer.free();
        }
        issued.map(|_| ())
    }

    fn has_capacity(&self) -> bool {
        self.handle.in_flight_count() < self.cap
    }

    fn interest(&self) -> Interest {
        self.handle.interest()
    }

    fn dispatch(&mut self, readiness: Readiness) -> ClientResult<()> {
        self.handle.dispatch(readiness)
    }

    fn check(&self) -> ClientResult<()> {
        match self.failure.lock().as_ref() {
            Some(e) => Err(e.clone().into()),
            None => Ok(()),
        }
    }

    fn finish(&mut self) -> ClientResult<()> {
        while self.handle.in_flight_count() > 0 {
            self.handle.poll(None)?;
            self.check()?;
        }
        self.check()?;
        if self.flush && self.handle.can_flush()? {
            self.handle.flush()?;
        }
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

struct WriterSink<'a, W: Write> {
    writer: &'a mut W,
    written: u64,
}

impl<W: Write> Sink for WriterSink<'_, W> {
    fn emit(&mut self, buffer: TransferBuffer, _offset: u64) -> ClientResult<()> {
        let result = buffer
            .view()
            .and_then(|data| self.writer.write_all(&data).map_err(ClientError::from));
        if result.is_ok() {
            self.written += buffer.len() as u64;
        }
        buffer.free();
        result
    }

    fn has_capacity(&self) -> bool {
        true
    }

    fn interest(&self) -> Interest {
        Interest {
            fd: -1,
            direction: Direction::None,
        }
    }

    fn dispatch(&mut self, _readiness: Readiness) -> ClientResult<()> {
        Ok(())
    }

    fn check(&self) -> ClientResult<()> {
        Ok(())
    }

    fn finish(&mut self) -> ClientResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }
}
