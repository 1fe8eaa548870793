//! Basic append, commit, read, and scan behavior.

use pagelog::constants::FIRST_VALID_ADDRESS;
use pagelog::device::FileSystemDisk;
use pagelog::{Address, LocalCommitManager, PageLog, PageLogConfig, ScanBuffering, Status};
use tempfile::tempdir;

fn create_config() -> PageLogConfig {
    PageLogConfig {
        page_size: 4096,
        memory_pages: 8,
        segment_size: 1 << 20,
        auto_commit_ms: 0,
    }
}

fn open_log(dir: &std::path::Path, config: PageLogConfig) -> PageLog<FileSystemDisk> {
    let device = FileSystemDisk::single_file(dir.join("log.dat")).unwrap();
    let commits = Box::new(LocalCommitManager::new(dir.join("log.commit")).unwrap());
    PageLog::open(config, device, commits).unwrap()
}

#[test]
fn test_single_append_and_commit() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path(), create_config());
    let rt = tokio::runtime::Runtime::new().unwrap();

    let addr = log.enqueue(&[0x01, 0x02, 0x03]).unwrap();
    assert_eq!(addr, FIRST_VALID_ADDRESS);

    log.commit(true).unwrap();

    // 3 payload bytes pad to 4, plus the 4-byte header.
    assert!(log.committed_until_address() >= addr + 8);

    let data = rt.block_on(log.read_async(addr, 0)).unwrap().unwrap();
    assert_eq!(data, vec![0x01, 0x02, 0x03]);
}

#[test]
fn test_batch_is_contiguous() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path(), create_config());
    let rt = tokio::runtime::Runtime::new().unwrap();

    let batch: [&[u8]; 3] = [&[0xAA], &[0xBB, 0xBB], &[0xCC, 0xCC, 0xCC, 0xCC]];
    let (addr, allocated) = log.enqueue_batch(&batch).unwrap();
    assert_eq!(addr, FIRST_VALID_ADDRESS);
    assert_eq!(allocated, 24);

    log.commit(true).unwrap();

    let first = rt.block_on(log.read_async(addr, 0)).unwrap().unwrap();
    assert_eq!(first, vec![0xAA]);
    let second = rt.block_on(log.read_async(addr + 8, 0)).unwrap().unwrap();
    assert_eq!(second, vec![0xBB, 0xBB]);
    let third = rt.block_on(log.read_async(addr + 16, 0)).unwrap().unwrap();
    assert_eq!(third, vec![0xCC, 0xCC, 0xCC, 0xCC]);
}

#[test]
fn test_read_with_estimated_length() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path(), create_config());
    let rt = tokio::runtime::Runtime::new().unwrap();

    let payload = vec![0x5A; 300];
    let addr = log.enqueue(&payload).unwrap();
    log.commit(true).unwrap();

    // Overestimate: one read. Underestimate: size discovery re-read.
    let over = rt.block_on(log.read_async(addr, 512)).unwrap().unwrap();
    assert_eq!(over, payload);
    let under = rt.block_on(log.read_async(addr, 8)).unwrap().unwrap();
    assert_eq!(under, payload);
}

#[test]
fn test_read_out_of_range_returns_none() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path(), create_config());
    let rt = tokio::runtime::Runtime::new().unwrap();

    let addr = log.enqueue(b"committed").unwrap();

    // Nothing committed yet: the address is not readable.
    assert!(rt.block_on(log.read_async(addr, 0)).unwrap().is_none());

    log.commit(true).unwrap();
    assert!(rt.block_on(log.read_async(addr, 0)).unwrap().is_some());

    // At or past the committed watermark.
    let tail = log.tail_address();
    assert!(rt.block_on(log.read_async(tail, 0)).unwrap().is_none());

    // Below the first valid address.
    assert!(rt
        .block_on(log.read_async(Address::from_control(4), 0))
        .unwrap()
        .is_none());
}

#[test]
fn test_scan_returns_entries_in_order() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path(), create_config());

    let entries = ["alpha", "beta", "gamma", "delta"];
    for entry in &entries {
        log.enqueue(entry.as_bytes()).unwrap();
    }
    log.commit(true).unwrap();

    let scanned: Vec<String> = log
        .scan_all()
        .map(|(_, data)| String::from_utf8(data).unwrap())
        .collect();
    assert_eq!(scanned, entries);

    // Addresses come back strictly increasing.
    let addrs: Vec<Address> = log.scan_all().map(|(addr, _)| addr).collect();
    assert!(addrs.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_scan_across_pages() {
    let dir = tempdir().unwrap();
    let config = PageLogConfig {
        page_size: 512,
        memory_pages: 8,
        segment_size: 1 << 20,
        auto_commit_ms: 0,
    };
    let log = open_log(dir.path(), config);

    // Each entry fills most of a page, forcing page-end padding skips.
    let entries: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 300]).collect();
    for entry in &entries {
        log.enqueue(entry).unwrap();
    }
    log.commit(true).unwrap();

    for buffering in [ScanBuffering::SinglePage, ScanBuffering::DoublePage] {
        let scanned: Vec<Vec<u8>> = log
            .scan(Address::NONE, Address::MAX, buffering)
            .map(|(_, data)| data)
            .collect();
        assert_eq!(scanned, entries);
    }
}

#[test]
fn test_scan_follows_tail_across_commits() {
    let dir = tempdir().unwrap();
    let config = PageLogConfig {
        page_size: 512,
        memory_pages: 8,
        segment_size: 1 << 20,
        auto_commit_ms: 0,
    };
    let log = open_log(dir.path(), config);

    log.enqueue(b"first").unwrap();
    log.commit(true).unwrap();

    // A tail-following iterator: drain what is committed, then continue the
    // SAME iterator after more commits land (including on the same page).
    let mut iter = log.scan(Address::NONE, Address::MAX, ScanBuffering::SinglePage);
    assert_eq!(iter.next().unwrap().1, b"first");
    assert!(iter.next().is_none());

    log.enqueue(b"second").unwrap();
    log.enqueue(b"third").unwrap();
    log.commit(true).unwrap();

    assert_eq!(iter.next().unwrap().1, b"second");
    assert_eq!(iter.next().unwrap().1, b"third");
    assert!(iter.next().is_none());
}

#[test]
fn test_empty_and_oversized_entries_rejected() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path(), create_config());

    assert_eq!(log.try_enqueue(&[]).unwrap_err(), Status::InvalidArgument);

    let oversized = vec![0u8; 4096];
    assert_eq!(
        log.try_enqueue(&oversized).unwrap_err(),
        Status::InvalidArgument
    );

    // A batch that cannot fit one page is rejected up front.
    let batch: Vec<Vec<u8>> = (0..3).map(|_| vec![0u8; 2000]).collect();
    assert_eq!(
        log.try_enqueue_batch(&batch).unwrap_err(),
        Status::InvalidArgument
    );
}

#[test]
fn test_watermark_ordering() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path(), create_config());

    for i in 0..50 {
        log.enqueue(format!("entry-{i}").as_bytes()).unwrap();

        let committed_begin = log.committed_begin_address();
        let committed_until = log.committed_until_address();
        let flushed = log.flushed_until_address();
        let tail = log.tail_address();
        assert!(committed_begin <= committed_until);
        assert!(committed_until <= flushed);
        assert!(flushed <= tail);
        assert!(log.begin_address() >= committed_begin);
    }

    log.commit(true).unwrap();
    assert_eq!(log.committed_until_address(), log.tail_address());
}

#[test]
fn test_stats_snapshot() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path(), create_config());

    log.enqueue(b"stats test").unwrap();
    log.commit(true).unwrap();

    let stats = log.stats();
    assert_eq!(stats.page_size, 4096);
    assert_eq!(stats.buffer_pages, 8);
    assert!(stats.committed_until_address > FIRST_VALID_ADDRESS);
    assert_eq!(stats.tail_address, log.tail_address());

    let rendered = format!("{stats}");
    assert!(rendered.contains("Committed until"));
}

#[test]
fn test_close_rejects_new_operations() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path(), create_config());

    log.enqueue(b"before close").unwrap();
    log.close();
    assert!(log.is_closed());

    assert_eq!(log.try_enqueue(b"after close").unwrap_err(), Status::Aborted);
    assert_eq!(log.commit(false).unwrap_err(), Status::Aborted);
}

#[test]
fn test_wait_for_commit_default_means_tail() {
    let dir = tempdir().unwrap();
    let config = create_config().with_auto_commit_ms(5);
    let log = open_log(dir.path(), config);

    for i in 0..20 {
        log.enqueue(format!("auto-{i}").as_bytes()).unwrap();
    }

    // Auto-commit drives the watermark to the tail captured at call time.
    log.wait_for_commit(Address::NONE).unwrap();
    assert!(log.committed_until_address() >= log.tail_address());
}

#[test]
fn test_enqueue_and_wait_for_commit_with_auto_commit() {
    let dir = tempdir().unwrap();
    let config = create_config().with_auto_commit_ms(5);
    let log = open_log(dir.path(), config);
    let rt = tokio::runtime::Runtime::new().unwrap();

    let addr = log.enqueue_and_wait_for_commit(b"durable now").unwrap();
    assert!(log.committed_until_address() >= addr + 16);

    let data = rt.block_on(log.read_async(addr, 0)).unwrap().unwrap();
    assert_eq!(data, b"durable now");
}

#[test]
fn test_segmented_device_roundtrip() {
    let dir = tempdir().unwrap();
    let config = PageLogConfig {
        page_size: 512,
        memory_pages: 4,
        segment_size: 2048,
        auto_commit_ms: 0,
    };

    let device =
        FileSystemDisk::segmented(dir.path().join("segments"), "log", config.segment_size).unwrap();
    let commits = Box::new(LocalCommitManager::new(dir.path().join("log.commit")).unwrap());
    let log = PageLog::open(config.clone(), device, commits).unwrap();

    let entries: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 400]).collect();
    for entry in &entries {
        log.enqueue(entry).unwrap();
    }
    log.commit(true).unwrap();
    log.close();

    let device =
        FileSystemDisk::segmented(dir.path().join("segments"), "log", config.segment_size).unwrap();
    let commits = Box::new(LocalCommitManager::new(dir.path().join("log.commit")).unwrap());
    let reopened = PageLog::open(config, device, commits).unwrap();

    let scanned: Vec<Vec<u8>> = reopened.scan_all().map(|(_, data)| data).collect();
    assert_eq!(scanned, entries);
}
