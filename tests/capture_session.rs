//! Capture session lifecycle tests driven by scripted packet sources.
//!
//! No privileges needed: every session reads from an in-process source.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use igmpcheck::capture::{
    CaptureConfig, CaptureManager, CapturedPacket, PacketSource, SessionState, StopPredicate,
};
use igmpcheck::error::IgmpError;
use igmpcheck::packet::LinkType;
use igmpcheck::pcap::CaptureReader;

/// What a scripted source does once its packets run out.
#[derive(Clone, Copy)]
enum Then {
    Idle,
    Panic,
    Fail,
    /// Ignore the poll timeout and block for this long per poll.
    Hang(Duration),
}

struct Script {
    packets: VecDeque<CapturedPacket>,
    then: Then,
}

impl PacketSource for Script {
    fn poll_packet(&mut self, timeout: Duration) -> Result<Option<CapturedPacket>, IgmpError> {
        if let Some(p) = self.packets.pop_front() {
            return Ok(Some(p));
        }
        match self.then {
            Then::Idle => {
                thread::sleep(timeout);
                Ok(None)
            }
            Then::Panic => panic!("scripted source crashed"),
            Then::Fail => Err(IgmpError::CaptureDevice("link went away".to_string())),
            Then::Hang(d) => {
                thread::sleep(d);
                Ok(None)
            }
        }
    }

    fn link_type(&self) -> LinkType {
        LinkType::Ethernet
    }

    fn interface(&self) -> &str {
        "script0"
    }
}

fn script(packets: &[&str], then: Then) -> Box<dyn PacketSource> {
    Box::new(Script {
        packets: packets
            .iter()
            .enumerate()
            .map(|(i, d)| CapturedPacket {
                timestamp: 1_700_000_000_000_000 + i as u64 * 1000,
                data: d.as_bytes().to_vec(),
            })
            .collect(),
        then,
    })
}

fn config() -> CaptureConfig {
    CaptureConfig {
        ready_timeout: Duration::from_secs(2),
        graceful_stop: Duration::from_millis(500),
        kill_settle: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
    }
}

fn name_in(dir: &Path, file: &str) -> String {
    dir.join(file).to_str().unwrap().to_string()
}

#[test]
fn duplicate_session_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let name = name_in(dir.path(), "dup.pcap");
    let mgr = CaptureManager::new(config());

    mgr.start_with_source(&name, script(&[], Then::Idle), None)
        .unwrap();
    let err = mgr
        .start_with_source(&name, script(&[], Then::Idle), None)
        .unwrap_err();
    assert!(matches!(err, IgmpError::DuplicateSession(ref n) if *n == name));

    // The first session is untouched.
    assert!(mgr.is_active(&name));
    mgr.stop(&name).unwrap();
    assert!(!mgr.is_active(&name));
}

#[test]
fn concurrent_starts_of_one_name_admit_exactly_one() {
    const STARTERS: usize = 8;

    let dir = tempfile::tempdir().unwrap();
    let name = name_in(dir.path(), "race.pcap");
    let mgr = Arc::new(CaptureManager::new(config()));
    let barrier = Arc::new(Barrier::new(STARTERS));

    let handles: Vec<_> = (0..STARTERS)
        .map(|_| {
            let mgr = Arc::clone(&mgr);
            let barrier = Arc::clone(&barrier);
            let name = name.clone();
            thread::spawn(move || {
                barrier.wait();
                mgr.start_with_source(&name, script(&[], Then::Idle), None)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.into_iter().filter_map(Result::err) {
        assert!(matches!(err, IgmpError::DuplicateSession(ref n) if *n == name), "got {err}");
    }
    assert_eq!(mgr.active_sessions(), vec![name.clone()]);
    mgr.stop(&name).unwrap();
}

#[test]
fn crashed_worker_reports_exit_code_and_frees_name() {
    let dir = tempfile::tempdir().unwrap();
    let name = name_in(dir.path(), "crash.pcap");
    let mgr = CaptureManager::new(config());

    mgr.start_with_source(&name, script(&["frame"], Then::Panic), None)
        .unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(mgr.state(&name), Some(SessionState::Exited));

    let err = mgr.stop(&name).unwrap_err();
    assert!(
        matches!(err, IgmpError::WorkerCrashed { exit_code: 101, .. }),
        "got {err}"
    );
    assert!(!mgr.is_active(&name));

    // Packets written before the crash survive.
    assert_eq!(CaptureReader::open(&name).unwrap().count(), 1);

    // The name can be reused immediately.
    mgr.start_with_source(&name, script(&[], Then::Idle), None)
        .unwrap();
    mgr.stop(&name).unwrap();
}

#[test]
fn worker_error_is_reraised_at_stop() {
    let dir = tempfile::tempdir().unwrap();
    let name = name_in(dir.path(), "fail.pcap");
    let mgr = CaptureManager::new(config());

    mgr.start_with_source(&name, script(&[], Then::Fail), None)
        .unwrap();
    thread::sleep(Duration::from_millis(100));

    let err = mgr.stop(&name).unwrap_err();
    let IgmpError::Worker(failure) = err else {
        panic!("expected worker failure, got {err}");
    };
    assert_eq!(failure.kind, "capture-device");
    assert!(failure.detail.contains("link went away"));
    assert!(!mgr.is_active(&name));
}

#[test]
fn wait_for_returns_early_on_predicate_match() {
    let dir = tempfile::tempdir().unwrap();
    let name = name_in(dir.path(), "early.pcap");
    let mgr = CaptureManager::new(config());

    let predicate: StopPredicate = Box::new(|data: &[u8]| data.starts_with(b"report"));
    mgr.start_with_source(
        &name,
        script(&["query", "noise", "report 1", "report 2"], Then::Idle),
        Some(predicate),
    )
    .unwrap();

    let started = Instant::now();
    let timed_out = mgr.wait_for(&name, Some(Duration::from_secs(10))).unwrap();
    assert!(!timed_out);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!mgr.is_active(&name));

    // Everything up to and including the matching packet is on disk.
    let frames: Vec<_> = CaptureReader::open(&name)
        .unwrap()
        .map(|f| f.unwrap().data)
        .collect();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[2], b"report 1".to_vec());
}

#[test]
fn wait_for_times_out_then_stops() {
    let dir = tempfile::tempdir().unwrap();
    let name = name_in(dir.path(), "timeout.pcap");
    let mgr = CaptureManager::new(config());

    mgr.start_with_source(&name, script(&["x"], Then::Idle), None)
        .unwrap();
    let timed_out = mgr
        .wait_for(&name, Some(Duration::from_millis(100)))
        .unwrap();
    assert!(timed_out);
    assert!(!mgr.is_active(&name));
}

#[test]
fn idle_worker_stops_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let name = name_in(dir.path(), "idle.pcap");
    let mgr = CaptureManager::new(config());

    mgr.start_with_source(&name, script(&[], Then::Idle), None)
        .unwrap();
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    mgr.stop(&name).unwrap();
    // Bounded by the poll interval, far below the graceful stop window.
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(CaptureReader::open(&name).unwrap().count(), 0);
}

#[test]
fn unresponsive_worker_is_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let name = name_in(dir.path(), "hang.pcap");
    let mgr = CaptureManager::new(CaptureConfig {
        graceful_stop: Duration::from_millis(50),
        ..config()
    });

    mgr.start_with_source(
        &name,
        script(&[], Then::Hang(Duration::from_millis(300))),
        None,
    )
    .unwrap();

    let err = mgr.stop(&name).unwrap_err();
    assert!(
        matches!(err, IgmpError::WorkerCrashed { exit_code: 143, .. }),
        "got {err}"
    );
    assert!(!mgr.is_active(&name));
}

#[test]
fn independent_sessions_run_side_by_side() {
    let dir = tempfile::tempdir().unwrap();
    let a = name_in(dir.path(), "a.pcap");
    let b = name_in(dir.path(), "b.pcap");
    let mgr = CaptureManager::new(config());

    mgr.start_with_source(&b, script(&["b1"], Then::Idle), None)
        .unwrap();
    mgr.start_with_source(&a, script(&["a1", "a2"], Then::Idle), None)
        .unwrap();
    assert_eq!(mgr.active_sessions(), vec![a.clone(), b.clone()]);

    thread::sleep(Duration::from_millis(50));
    mgr.stop(&a).unwrap();
    assert_eq!(mgr.active_sessions(), vec![b.clone()]);
    mgr.stop(&b).unwrap();

    assert_eq!(CaptureReader::open(&a).unwrap().count(), 2);
    assert_eq!(CaptureReader::open(&b).unwrap().count(), 1);
}

#[test]
fn stopping_twice_reports_unknown_session() {
    let dir = tempfile::tempdir().unwrap();
    let name = name_in(dir.path(), "twice.pcap");
    let mgr = CaptureManager::new(config());

    mgr.start_with_source(&name, script(&[], Then::Idle), None)
        .unwrap();
    mgr.stop(&name).unwrap();
    assert!(matches!(
        mgr.stop(&name),
        Err(IgmpError::SessionNotFound(_))
    ));
}

#[test]
fn unwritable_capture_file_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let name = name_in(dir.path(), "missing-dir/out.pcap");
    let mgr = CaptureManager::new(config());

    let err = mgr
        .start_with_source(&name, script(&[], Then::Idle), None)
        .unwrap_err();
    let IgmpError::Worker(failure) = err else {
        panic!("expected worker failure, got {err}");
    };
    assert_eq!(failure.kind, "io");
    assert!(!mgr.is_active(&name));
}

#[test]
fn invalid_filter_is_rejected_before_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let name = name_in(dir.path(), "filter.pcap");
    let mgr = CaptureManager::new(config());

    let err = mgr
        .start("lo", &name, Some("igmp or udp"), None)
        .unwrap_err();
    assert!(matches!(err, IgmpError::InvalidFilter { .. }));
    assert!(!mgr.is_active(&name));
}

/// Idle source that records when the worker lets go of it.
struct Tracked {
    released: Arc<AtomicBool>,
}

impl PacketSource for Tracked {
    fn poll_packet(&mut self, timeout: Duration) -> Result<Option<CapturedPacket>, IgmpError> {
        thread::sleep(timeout);
        Ok(None)
    }

    fn link_type(&self) -> LinkType {
        LinkType::Ethernet
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[test]
fn dropping_the_manager_waits_for_workers() {
    let dir = tempfile::tempdir().unwrap();
    let name = name_in(dir.path(), "shutdown.pcap");
    let released = Arc::new(AtomicBool::new(false));

    let mgr = CaptureManager::new(config());
    mgr.start_with_source(
        &name,
        Box::new(Tracked {
            released: Arc::clone(&released),
        }),
        None,
    )
    .unwrap();
    drop(mgr);

    assert!(released.load(Ordering::SeqCst));
    assert_eq!(CaptureReader::open(&name).unwrap().count(), 0);
}
