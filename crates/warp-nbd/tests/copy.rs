//! Copy orchestrator end to end

mod common;

use std::sync::Arc;

use common::{connect, start_server, KIB, MIB};
use warp_nbd::server::{
    fill_pattern, ExportConfig, MemoryVolume, PatternVolume, ServerConfig, VerifyingSink,
    VolumeIO,
};
use warp_nbd::{ClientError, Copier, CopyConfig, HandleConfig, NbdError, ServerReason};

/// Test copying 1 MiB into a memory export
#[test]
fn test_copy_into_memory() {
    let dst_volume = Arc::new(MemoryVolume::new(MIB));
    let server = start_server(
        ServerConfig::default(),
        vec![
            (
                ExportConfig::new("src").read_only(),
                Arc::new(PatternVolume::new(MIB)) as Arc<dyn VolumeIO>,
            ),
            (ExportConfig::new("dst"), dst_volume.clone() as Arc<dyn VolumeIO>),
        ],
    );
    let mut src = connect(&server, HandleConfig::new().export("src"));
    let mut dst = connect(&server, HandleConfig::new().export("dst"));

    let report = Copier::new(CopyConfig::new().request_size(64 * KIB as u32))
        .copy_to_handle(&mut src, &mut dst)
        .unwrap();

    assert_eq!(report.bytes_read, MIB);
    assert_eq!(report.bytes_written, MIB);
    assert_eq!(report.requests, 16);
    assert!(report.max_reads_in_flight <= 16);

    let mut expected = vec![0u8; MIB as usize];
    fill_pattern(0, &mut expected);
    assert!(dst_volume.contents() == expected);
    assert_eq!(dst_volume.flush_count(), 1);
}

/// Test 512 MiB with reordered read replies arrives in ascending order
#[test]
fn test_copy_preserves_order_under_reordering() {
    const SIZE: u64 = 512 * MIB;
    let sink = Arc::new(VerifyingSink::new(SIZE));
    let server = start_server(
        ServerConfig::new().reorder_reads(3000),
        vec![
            (
                ExportConfig::new("src").read_only(),
                Arc::new(PatternVolume::new(SIZE)) as Arc<dyn VolumeIO>,
            ),
            (ExportConfig::new("dst"), sink.clone() as Arc<dyn VolumeIO>),
        ],
    );
    let mut src = connect(&server, HandleConfig::new().export("src"));
    let mut dst = connect(&server, HandleConfig::new().export("dst"));

    let config = CopyConfig::new()
        .request_size(64 * KIB as u32)
        .max_in_flight(16);
    let report = Copier::new(config).copy_to_handle(&mut src, &mut dst).unwrap();

    assert_eq!(report.bytes_read, SIZE);
    assert_eq!(report.bytes_written, SIZE);
    assert_eq!(report.requests, SIZE / (64 * KIB));
    assert!(report.max_reads_in_flight <= 16);
    assert!(report.reordered_completions > 0);

    assert_eq!(sink.bytes_written(), SIZE);
    assert_eq!(sink.mismatched(), 0);
    assert!(sink.is_ascending());
    assert_eq!(sink.offsets().len() as u64, SIZE / (64 * KIB));
    assert_eq!(sink.flush_count(), 1);

    src.shutdown().unwrap();
    dst.shutdown().unwrap();
}

/// Test copying to a byte stream with a size that is not a multiple of the request
#[test]
fn test_copy_to_writer() {
    let size = 300 * KIB + 17;
    let server = start_server(
        ServerConfig::default(),
        vec![(
            ExportConfig::new("src").read_only(),
            Arc::new(PatternVolume::new(size)) as Arc<dyn VolumeIO>,
        )],
    );
    let mut src = connect(&server, HandleConfig::new().export("src"));

    let mut out = Vec::new();
    let report = Copier::new(CopyConfig::new().request_size(64 * KIB as u32).max_in_flight(4))
        .copy_to_writer(&mut src, &mut out)
        .unwrap();

    assert_eq!(report.bytes_read, size);
    assert_eq!(report.bytes_written, size);
    assert_eq!(report.requests, 5);
    let mut expected = vec![0u8; size as usize];
    fill_pattern(0, &mut expected);
    assert!(out == expected);
}

/// Test a destination smaller than the source is rejected up front
#[test]
fn test_copy_rejects_small_destination() {
    let server = start_server(
        ServerConfig::default(),
        vec![
            (
                ExportConfig::new("src").read_only(),
                Arc::new(PatternVolume::new(MIB)) as Arc<dyn VolumeIO>,
            ),
            (
                ExportConfig::new("dst"),
                Arc::new(MemoryVolume::new(MIB / 2)) as Arc<dyn VolumeIO>,
            ),
        ],
    );
    let mut src = connect(&server, HandleConfig::new().export("src"));
    let mut dst = connect(&server, HandleConfig::new().export("dst"));

    let err = Copier::default()
        .copy_to_handle(&mut src, &mut dst)
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)));
    assert_eq!(src.in_flight_count(), 0);
    assert_eq!(dst.in_flight_count(), 0);
}

/// Test a read-only destination fails the copy
#[test]
fn test_copy_into_read_only_fails() {
    let server = start_server(
        ServerConfig::default(),
        vec![
            (
                ExportConfig::new("src").read_only(),
                Arc::new(PatternVolume::new(MIB)) as Arc<dyn VolumeIO>,
            ),
            (
                ExportConfig::new("dst").read_only(),
                Arc::new(PatternVolume::new(MIB)) as Arc<dyn VolumeIO>,
            ),
        ],
    );
    let mut src = connect(&server, HandleConfig::new().export("src"));
    let mut dst = connect(&server, HandleConfig::new().export("dst"));

    let err = Copier::default()
        .copy_to_handle(&mut src, &mut dst)
        .unwrap_err();
    assert!(matches!(err, ClientError::Unsupported(_)));
}

/// Test a failing destination leaves in-flight source reads intact
#[test]
fn test_copy_destination_failure_keeps_source_reads() {
    let server = start_server(
        ServerConfig::new().reorder_reads(3000),
        vec![
            (
                ExportConfig::new("src").read_only(),
                Arc::new(PatternVolume::new(8 * MIB)) as Arc<dyn VolumeIO>,
            ),
            // Advertised writable, but every write fails with EPERM
            (
                ExportConfig::new("dst"),
                Arc::new(PatternVolume::new(8 * MIB)) as Arc<dyn VolumeIO>,
            ),
        ],
    );
    let mut src = connect(&server, HandleConfig::new().export("src"));
    let mut dst = connect(&server, HandleConfig::new().export("dst"));

    let config = CopyConfig::new()
        .request_size(64 * KIB as u32)
        .max_in_flight(16);
    let err = Copier::new(config)
        .copy_to_handle(&mut src, &mut dst)
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Protocol {
            reason: ServerReason::Errno(NbdError::Perm),
            ..
        }
    ));

    // Reads that were still outstanding complete with their real outcome
    assert!(src.is_connected());
    while src.in_flight_count() > 0 {
        src.poll(Some(std::time::Duration::from_secs(5))).unwrap();
    }
    while let Some(cookie) = src.peek_completed() {
        assert!(src.command_completed(cookie).unwrap());
    }
    assert_eq!(src.queue_len(), 0);
}
