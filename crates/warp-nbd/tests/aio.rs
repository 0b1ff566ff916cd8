//! Command engine against the in-process server

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use common::{connect, start_server, KIB, MIB};
use warp_nbd::server::{
    fill_pattern, ExportConfig, MemoryVolume, PatternVolume, ServerConfig, ServerHandle,
    VerifyingSink, VolumeIO, HOLE_GRANULARITY,
};
use warp_nbd::wire::extent_flags;
use warp_nbd::{
    ClientError, CommandError, CommandFlags, Extent, HandleConfig, NbdError, Phase, ServerReason,
    TransferBuffer,
};

fn memory_server(volume: Arc<MemoryVolume>, config: ServerConfig) -> ServerHandle {
    start_server(config, vec![(ExportConfig::new("mem"), volume as Arc<dyn VolumeIO>)])
}

/// Drive `handle` until nothing is in flight
fn drain(handle: &mut warp_nbd::Handle) {
    while handle.in_flight_count() > 0 {
        handle.poll(Some(Duration::from_secs(5))).unwrap();
    }
}

/// Test write then read back through the synchronous wrappers
#[test]
fn test_pwrite_pread_roundtrip() {
    let volume = Arc::new(MemoryVolume::new(MIB));
    let server = memory_server(volume.clone(), ServerConfig::default());
    let mut handle = connect(&server, HandleConfig::new().export("mem"));

    let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    handle.pwrite(&data, 4096, CommandFlags::default()).unwrap();

    let mut back = vec![0u8; data.len()];
    handle.pread(&mut back, 4096).unwrap();
    assert_eq!(back, data);
    assert_eq!(&volume.contents()[4096..4096 + data.len()], &data[..]);
}

/// Test FUA writes and explicit flushes reach the volume
#[test]
fn test_fua_and_flush() {
    let volume = Arc::new(MemoryVolume::new(MIB));
    let server = memory_server(volume.clone(), ServerConfig::default());
    let mut handle = connect(&server, HandleConfig::new().export("mem"));
    assert!(handle.can_fua().unwrap());

    handle
        .pwrite(&[1; 512], 0, CommandFlags::new(CommandFlags::FUA))
        .unwrap();
    handle.flush().unwrap();
    assert_eq!(volume.flush_count(), 2);
}

/// Test trim and zero clear data
#[test]
fn test_trim_and_zero() {
    let volume = Arc::new(MemoryVolume::with_data(&vec![0xEE; 64 * KIB as usize]));
    let server = memory_server(volume.clone(), ServerConfig::default());
    let mut handle = connect(&server, HandleConfig::new().export("mem"));

    handle.trim(4096, 0, CommandFlags::default()).unwrap();
    handle.zero(4096, 8192, CommandFlags::default()).unwrap();

    let contents = volume.contents();
    assert!(contents[..4096].iter().all(|&b| b == 0));
    assert!(contents[4096..8192].iter().all(|&b| b == 0xEE));
    assert!(contents[8192..12288].iter().all(|&b| b == 0));
}

/// Test holes in a structured read are zero-filled into the buffer
#[test]
fn test_structured_read_fills_holes() {
    let volume = Arc::new(MemoryVolume::new(MIB));
    let server = memory_server(volume.clone(), ServerConfig::default());
    let mut handle = connect(&server, HandleConfig::new().export("mem"));
    handle
        .pwrite(&[7; 4096], HOLE_GRANULARITY, CommandFlags::default())
        .unwrap();

    // Start from garbage so zero-filling is visible
    let buffer = TransferBuffer::from_bytes(&[0xAA; 3 * 4096]);
    let cookie = handle.issue_read(&buffer, 0, |_| false).unwrap();
    handle.wait_command(cookie).unwrap();

    let data = buffer.snapshot().unwrap();
    assert!(data[..4096].iter().all(|&b| b == 0));
    assert!(data[4096..8192].iter().all(|&b| b == 7));
    assert!(data[8192..].iter().all(|&b| b == 0));
    buffer.free();
}

/// Test reads with simple replies
#[test]
fn test_read_without_structured_replies() {
    let volume = Arc::new(MemoryVolume::with_data(&[3; 8192]));
    let server = memory_server(volume, ServerConfig::new().no_structured_replies());
    let mut handle = connect(&server, HandleConfig::new().export("mem"));
    assert!(!handle.structured_replies_negotiated());

    let mut data = vec![0u8; 8192];
    handle.pread(&mut data, 0).unwrap();
    assert!(data.iter().all(|&b| b == 3));
}

/// Test block status extents for base:allocation
#[test]
fn test_block_status_reports_holes() {
    let volume = Arc::new(MemoryVolume::new(MIB));
    let server = memory_server(volume, ServerConfig::default());
    let mut handle = connect(
        &server,
        HandleConfig::new()
            .export("mem")
            .meta_context(warp_nbd::CONTEXT_BASE_ALLOCATION),
    );
    handle
        .pwrite(&[1; 4096], 4096, CommandFlags::default())
        .unwrap();

    let seen: Arc<Mutex<Vec<(String, u64, Vec<Extent>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    handle
        .block_status(3 * 4096, 0, CommandFlags::default(), move |context: &str, offset: u64, extents: &[Extent]| {
            sink.lock().push((context.to_string(), offset, extents.to_vec()));
        })
        .unwrap();

    let hole = extent_flags::STATE_HOLE | extent_flags::STATE_ZERO;
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "base:allocation");
    assert_eq!(seen[0].1, 0);
    assert_eq!(
        seen[0].2,
        vec![
            Extent { length: 4096, flags: hole },
            Extent { length: 4096, flags: 0 },
            Extent { length: 4096, flags: hole },
        ]
    );
}

/// Test out-of-order replies complete the right commands
#[test]
fn test_out_of_order_completion() {
    let server = start_server(
        ServerConfig::new().reorder_reads(3000),
        vec![(
            ExportConfig::new("pattern").read_only(),
            Arc::new(PatternVolume::new(MIB)) as Arc<dyn VolumeIO>,
        )],
    );
    let mut handle = connect(&server, HandleConfig::new().export("pattern"));

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut issued = Vec::new();
    for i in 0..32u64 {
        let buffer = TransferBuffer::allocate(4096);
        let record = order.clone();
        let cookie = handle
            .issue_read(&buffer, i * 4096, move |result: Result<(), &CommandError>| {
                assert!(result.is_ok());
                record.lock().push(i);
                false
            })
            .unwrap();
        issued.push((cookie, buffer, i * 4096));
    }
    assert_eq!(handle.in_flight_count(), 32);

    drain(&mut handle);
    assert_eq!(handle.queue_len(), 32);
    assert_eq!(order.lock().len(), 32);
    assert_eq!(handle.peek_completed(), Some(issued[0].0));

    for (cookie, buffer, offset) in issued {
        assert!(handle.command_completed(cookie).unwrap());
        let mut expected = vec![0u8; 4096];
        fill_pattern(offset, &mut expected);
        assert_eq!(&buffer.snapshot().unwrap()[..], &expected[..]);
        buffer.free();
    }
    assert_eq!(handle.queue_len(), 0);
    assert!(matches!(
        handle.command_completed(1),
        Err(ClientError::InvalidArgument(_))
    ));
}

/// Test a server errno reaches the completion callback
#[test]
fn test_server_error_delivered() {
    let server = start_server(
        ServerConfig::default(),
        vec![(
            ExportConfig::new("sink"),
            Arc::new(VerifyingSink::new(MIB)) as Arc<dyn VolumeIO>,
        )],
    );
    let mut handle = connect(&server, HandleConfig::new().export("sink"));

    let failure = Arc::new(Mutex::new(None));
    let slot = failure.clone();
    let cookie = handle
        .issue_trim(4096, 0, CommandFlags::default(), move |result: Result<(), &CommandError>| {
            *slot.lock() = result.err().cloned();
            false
        })
        .unwrap();

    let err = handle.wait_command(cookie).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Protocol {
            reason: ServerReason::Errno(NbdError::NotSup),
            ..
        }
    ));
    assert!(matches!(
        failure.lock().clone(),
        Some(CommandError::Server {
            errno: NbdError::NotSup,
            ..
        })
    ));

    // The connection survives a failed command
    handle.flush().unwrap();
}

/// Test capability and bounds checks before anything is sent
#[test]
fn test_issue_time_checks() {
    let server = start_server(
        ServerConfig::default(),
        vec![(
            ExportConfig::new("ro").read_only(),
            Arc::new(PatternVolume::new(MIB)) as Arc<dyn VolumeIO>,
        )],
    );
    let mut handle = connect(&server, HandleConfig::new().export("ro"));
    let sent = handle.bytes_sent();

    let buffer = TransferBuffer::allocate(4096);
    assert!(matches!(
        handle.issue_write(&buffer, 0, CommandFlags::default(), |_| true),
        Err(ClientError::Unsupported(_))
    ));
    assert!(matches!(
        handle.issue_trim(4096, 0, CommandFlags::default(), |_| true),
        Err(ClientError::Unsupported(_))
    ));
    assert!(matches!(
        handle.issue_read(&buffer, MIB - 1024, |_| true),
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        handle.issue_status(4096, 0, CommandFlags::default(), |_: &str, _: u64, _: &[Extent]| {}, |_| true),
        Err(ClientError::NotNegotiated(_))
    ));

    buffer.free();
    assert!(matches!(
        handle.issue_read(&buffer, 0, |_| true),
        Err(ClientError::UseAfterFree)
    ));
    buffer.free();

    assert_eq!(handle.bytes_sent(), sent);
    assert_eq!(handle.queue_len(), 0);
}

/// Test relaxed bounds still refuse wrapping ranges and surface server errors
#[test]
fn test_unchecked_bounds() {
    let volume = Arc::new(MemoryVolume::new(MIB));
    let server = memory_server(volume, ServerConfig::default());
    let mut config = HandleConfig::new().export("mem");
    config.strict_bounds = false;
    let mut handle = connect(&server, config);

    let buffer = TransferBuffer::allocate(4096);
    assert!(matches!(
        handle.issue_read(&buffer, u64::MAX - 10, |_| true),
        Err(ClientError::InvalidArgument(_))
    ));
    assert_eq!(handle.queue_len(), 0);

    let failure = Arc::new(Mutex::new(None));
    let slot = failure.clone();
    let cookie = handle
        .issue_read(&buffer, MIB, move |result: Result<(), &CommandError>| {
            *slot.lock() = result.err().cloned();
            false
        })
        .unwrap();
    assert!(handle.wait_command(cookie).is_err());
    assert!(matches!(
        failure.lock().clone(),
        Some(CommandError::Server {
            errno: NbdError::Inval,
            ..
        })
    ));
    assert!(handle.is_connected());
    buffer.free();
}

/// Test closing a handle terminates commands that never got a reply
#[test]
fn test_close_terminates_pending() {
    let volume = Arc::new(MemoryVolume::new(MIB));
    let server = memory_server(volume, ServerConfig::default());
    let mut handle = connect(&server, HandleConfig::new().export("mem"));

    let outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    let buffer = TransferBuffer::allocate(4096);
    handle
        .issue_read(&buffer, 0, move |result: Result<(), &CommandError>| {
            *slot.lock() = Some(result.map_err(Clone::clone));
            true
        })
        .unwrap();

    handle.close();
    assert_eq!(*outcome.lock(), Some(Err(CommandError::Terminated)));
    buffer.free();
}

/// Test graceful shutdown
#[test]
fn test_shutdown() {
    let volume = Arc::new(MemoryVolume::new(MIB));
    let server = memory_server(volume, ServerConfig::default());
    let mut handle = connect(&server, HandleConfig::new().export("mem"));

    handle.shutdown().unwrap();
    assert_eq!(handle.phase(), Phase::Closed);
    assert!(!handle.is_connected());
    assert!(matches!(
        handle.flush(),
        Err(ClientError::InvalidState(_))
    ));
    // Stats stay readable after close
    assert!(handle.chunks_sent() > 0);
}

/// Test a server that goes away fails every pending command
#[test]
fn test_server_shutdown_terminates_pending() {
    let volume = Arc::new(MemoryVolume::new(MIB));
    let server = memory_server(volume, ServerConfig::default());
    let mut handle = connect(&server, HandleConfig::new().export("mem"));
    drop(server);

    let mut data = vec![0u8; 4096];
    let err = handle.pread(&mut data, 0).unwrap_err();
    assert!(matches!(err, ClientError::Connection(_)));
    assert_eq!(handle.phase(), Phase::Closed);
}
