// Isolated capture sessions.
//
// Each session runs one worker thread that reads from a packet source and
// appends every packet to a pcap file named after the session. The caller
// stays synchronous: it starts a session, does its own work (sending a
// query, sleeping) and then stops or waits for it. Worker failures travel
// back over a one-slot channel and are re-raised at the next observation
// point.
//
// On Linux the live source is an AF_PACKET socket. Other platforms can only
// drive sessions from caller-supplied sources.

pub mod filter;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::{AfPacketSource, check_capture_access};
#[cfg(target_os = "linux")]
pub(crate) use linux::if_nametoindex;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{IgmpError, WorkerFailure};
use crate::igmp::Timestamp;
use crate::packet::LinkType;
use crate::pcap::PcapWriter;

use self::filter::BpfInsn;

/// Worker left the loop on a stop request or a matching stop predicate.
pub const EXIT_OK: i32 = 0;
/// Worker hit an error; the failure was sent on the error channel.
pub const EXIT_LOOP_ERROR: i32 = 1;
/// Worker panicked.
pub const EXIT_PANIC: i32 = 101;
/// Worker honoured a forced termination (128 + SIGTERM).
pub const EXIT_TERMINATED: i32 = 143;
/// Worker did not exit within the settle bound.
pub const EXIT_UNKNOWN: i32 = -1;

/// One packet handed to the worker by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub timestamp: Timestamp,
    pub data: Vec<u8>,
}

/// Where a capture worker gets its packets from.
pub trait PacketSource: Send {
    /// Wait at most `timeout` for the next packet. `Ok(None)` means nothing
    /// arrived in time; the worker then re-checks its stop flags.
    fn poll_packet(&mut self, timeout: Duration) -> Result<Option<CapturedPacket>, IgmpError>;

    /// Link-layer framing of the packets, written into the file header.
    fn link_type(&self) -> LinkType;

    /// Interface name for logging.
    fn interface(&self) -> &str {
        "custom"
    }
}

/// Per-packet predicate; the session ends after the first packet for which
/// it returns `true` (that packet is still written).
pub type StopPredicate = Box<dyn FnMut(&[u8]) -> bool + Send>;

type SourceOpener = Box<dyn FnOnce() -> Result<Box<dyn PacketSource>, IgmpError> + Send>;

/// Bounded waits used by the manager.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// How long `start` waits for the worker to report readiness.
    pub ready_timeout: Duration,
    /// How long `stop` waits after a cooperative stop request.
    pub graceful_stop: Duration,
    /// How long `stop` waits after a forced termination request.
    pub kill_settle: Duration,
    /// Upper bound on a single source poll inside the worker.
    pub poll_interval: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            graceful_stop: Duration::from_secs(1),
            kill_settle: Duration::from_secs(8),
            poll_interval: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Exited,
}

/// Flags shared between a session and its worker.
struct WorkerControl {
    stop: AtomicBool,
    terminate: AtomicBool,
    exited: AtomicBool,
    exit_code: AtomicI32,
}

impl WorkerControl {
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            exit_code: AtomicI32::new(EXIT_UNKNOWN),
        }
    }
}

struct CaptureSession {
    interface: String,
    state: SessionState,
    control: Arc<WorkerControl>,
    handle: Option<thread::JoinHandle<()>>,
    /// Disconnects when the worker thread ends.
    done: Receiver<()>,
    errors: Receiver<WorkerFailure>,
    failure: Option<WorkerFailure>,
}

impl CaptureSession {
    /// First failure the worker reported, cached once received.
    fn take_failure(&mut self) -> Option<WorkerFailure> {
        if self.failure.is_none()
            && let Ok(failure) = self.errors.try_recv()
        {
            self.failure = Some(failure);
        }
        self.failure.clone()
    }

    /// Wait up to `timeout` for the worker thread to end.
    fn wait_exit(&self, timeout: Duration) -> bool {
        !matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    fn state(&self) -> SessionState {
        if self.control.exited.load(Ordering::Acquire) {
            SessionState::Exited
        } else {
            self.state
        }
    }

    /// Stop the worker with escalation and turn its outcome into a result.
    fn finish(mut self, name: &str, config: &CaptureConfig) -> Result<(), IgmpError> {
        self.control.stop.store(true, Ordering::Release);
        let mut exited = self.wait_exit(config.graceful_stop);
        if !exited {
            log::warn!(
                "capture '{}' on {} ignored the stop request, terminating",
                name,
                self.interface
            );
            self.control.terminate.store(true, Ordering::Release);
            exited = self.wait_exit(config.kill_settle);
        }

        let exit_code = if exited {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            self.control.exit_code.load(Ordering::Acquire)
        } else {
            log::warn!(
                "capture '{}' did not exit within {:?}, leaving worker detached",
                name,
                config.kill_settle
            );
            EXIT_UNKNOWN
        };

        if let Some(failure) = self.take_failure() {
            return Err(IgmpError::Worker(failure));
        }
        if exit_code != EXIT_OK {
            return Err(IgmpError::WorkerCrashed {
                name: name.to_string(),
                exit_code,
            });
        }
        log::info!("capture '{}' on {} stopped", name, self.interface);
        Ok(())
    }
}

/// Registry of running capture sessions, keyed by capture file path.
pub struct CaptureManager {
    config: CaptureConfig,
    sessions: Mutex<FxHashMap<String, CaptureSession>>,
}

impl CaptureManager {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(FxHashMap::default()),
        }
    }

    /// Start a live capture on `interface` into the file `name`.
    ///
    /// Returns once the worker has opened the interface and created the
    /// file, so packets sent afterwards are captured.
    pub fn start(
        &self,
        interface: &str,
        name: &str,
        filter: Option<&str>,
        stop_predicate: Option<StopPredicate>,
    ) -> Result<(), IgmpError> {
        let program = filter.map(filter::compile).transpose()?;
        let iface = interface.to_string();
        let opener: SourceOpener = Box::new(move || open_live(&iface, program.as_deref()));
        self.spawn(interface, name, opener, stop_predicate)
    }

    /// Start a session reading from a caller-supplied source.
    pub fn start_with_source(
        &self,
        name: &str,
        source: Box<dyn PacketSource>,
        stop_predicate: Option<StopPredicate>,
    ) -> Result<(), IgmpError> {
        let interface = source.interface().to_string();
        self.spawn(&interface, name, Box::new(move || Ok(source)), stop_predicate)
    }

    fn spawn(
        &self,
        interface: &str,
        name: &str,
        opener: SourceOpener,
        stop_predicate: Option<StopPredicate>,
    ) -> Result<(), IgmpError> {
        let (ready_tx, ready_rx) = bounded::<()>(1);
        let (err_tx, err_rx) = bounded::<WorkerFailure>(1);
        let (done_tx, done_rx) = bounded::<()>(0);
        let control = Arc::new(WorkerControl::new());

        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(name) {
                return Err(IgmpError::DuplicateSession(name.to_string()));
            }

            let worker = Worker {
                name: name.to_string(),
                control: Arc::clone(&control),
                poll_interval: self.config.poll_interval,
                ready: ready_tx,
                errors: err_tx,
                stop_predicate,
            };
            let worker_control = Arc::clone(&control);
            let handle = thread::Builder::new()
                .name("igmpcheck-capture".into())
                .spawn(move || {
                    let _done = done_tx;
                    let code = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                        || worker.run(opener),
                    )) {
                        Ok(code) => code,
                        Err(_) => {
                            log::error!("capture worker panicked");
                            EXIT_PANIC
                        }
                    };
                    worker_control.exit_code.store(code, Ordering::Release);
                    worker_control.exited.store(true, Ordering::Release);
                })
                .map_err(|e| {
                    IgmpError::CaptureDevice(format!("spawn capture thread for '{name}': {e}"))
                })?;

            sessions.insert(
                name.to_string(),
                CaptureSession {
                    interface: interface.to_string(),
                    state: SessionState::Starting,
                    control,
                    handle: Some(handle),
                    done: done_rx,
                    errors: err_rx.clone(),
                    failure: None,
                },
            );
        }

        let failure = select! {
            recv(ready_rx) -> msg => match msg {
                Ok(()) => None,
                // Worker ended before signalling; its error, if any, is queued.
                Err(_) => Some(self.startup_failure(name, &err_rx)),
            },
            recv(err_rx) -> msg => Some(match msg {
                Ok(failure) => IgmpError::Worker(failure),
                Err(_) => self.startup_failure(name, &err_rx),
            }),
            default(self.config.ready_timeout) => Some(IgmpError::WorkerStartupTimeout {
                name: name.to_string(),
                timeout_ms: self.config.ready_timeout.as_millis() as u64,
            }),
        };

        if let Some(err) = failure {
            if let Some(session) = self.sessions.lock().remove(name) {
                session.control.stop.store(true, Ordering::Release);
                session.control.terminate.store(true, Ordering::Release);
                if !session.wait_exit(self.config.graceful_stop) {
                    log::warn!("capture '{name}' still running after failed start");
                }
            }
            return Err(err);
        }

        if let Some(session) = self.sessions.lock().get_mut(name) {
            session.state = SessionState::Running;
        }
        log::info!("capture '{}' running on {}", name, interface);
        Ok(())
    }

    fn startup_failure(&self, name: &str, errors: &Receiver<WorkerFailure>) -> IgmpError {
        if let Ok(failure) = errors.try_recv() {
            return IgmpError::Worker(failure);
        }
        let worker = self
            .sessions
            .lock()
            .get(name)
            .map(|s| (s.done.clone(), Arc::clone(&s.control)));
        let exit_code = match worker {
            Some((done, control)) => {
                let _ = done.recv_timeout(self.config.graceful_stop);
                control.exit_code.load(Ordering::Acquire)
            }
            None => EXIT_UNKNOWN,
        };
        IgmpError::WorkerCrashed {
            name: name.to_string(),
            exit_code,
        }
    }

    /// Stop the session and reap its worker.
    ///
    /// The name is unregistered before anything else, so it can be reused
    /// whatever the outcome.
    pub fn stop(&self, name: &str) -> Result<(), IgmpError> {
        let session = self
            .sessions
            .lock()
            .remove(name)
            .ok_or_else(|| IgmpError::SessionNotFound(name.to_string()))?;
        session.finish(name, &self.config)
    }

    /// Wait for the worker to end on its own (stop predicate, source
    /// exhausted, error), at most `timeout` if given, then stop the session.
    ///
    /// Returns `true` if the wait timed out.
    pub fn wait_for(&self, name: &str, timeout: Option<Duration>) -> Result<bool, IgmpError> {
        let done = self
            .sessions
            .lock()
            .get(name)
            .map(|s| s.done.clone())
            .ok_or_else(|| IgmpError::SessionNotFound(name.to_string()))?;

        let timed_out = match timeout {
            Some(t) => matches!(done.recv_timeout(t), Err(RecvTimeoutError::Timeout)),
            None => {
                let _ = done.recv();
                false
            }
        };
        if timed_out {
            log::debug!("capture '{}' still running after {:?}", name, timeout);
        }

        self.stop(name)?;
        Ok(timed_out)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.sessions.lock().contains_key(name)
    }

    pub fn state(&self, name: &str) -> Option<SessionState> {
        self.sessions.lock().get(name).map(CaptureSession::state)
    }

    /// Names of all registered sessions, sorted.
    pub fn active_sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CaptureManager {
    fn default() -> Self {
        Self::new(CaptureConfig::default())
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        let sessions: Vec<_> = self.sessions.get_mut().drain().collect();
        for (name, session) in &sessions {
            log::warn!("capture '{name}' still registered at shutdown, stopping");
            session.control.stop.store(true, Ordering::Release);
        }
        // Workers flush and close their files on the way out.
        for (name, mut session) in sessions {
            if session.wait_exit(self.config.graceful_stop) {
                if let Some(handle) = session.handle.take() {
                    let _ = handle.join();
                }
            } else {
                log::warn!("capture '{name}' did not stop at shutdown, leaving worker detached");
            }
        }
    }
}

struct Worker {
    name: String,
    control: Arc<WorkerControl>,
    poll_interval: Duration,
    ready: Sender<()>,
    errors: Sender<WorkerFailure>,
    stop_predicate: Option<StopPredicate>,
}

impl Worker {
    /// Worker body; returns the exit code.
    fn run(mut self, opener: SourceOpener) -> i32 {
        match self.capture(opener) {
            Ok(code) => code,
            Err(e) => {
                log::error!("capture '{}' failed: {}", self.name, e);
                // Only the first failure is kept.
                let _ = self.errors.try_send(WorkerFailure::from(&e));
                EXIT_LOOP_ERROR
            }
        }
    }

    fn capture(&mut self, opener: SourceOpener) -> Result<i32, IgmpError> {
        let mut source = opener()?;
        let mut writer = PcapWriter::create(Path::new(&self.name), source.link_type().linktype())?;
        let _ = self.ready.send(());

        loop {
            if self.control.terminate.load(Ordering::Acquire) {
                log::warn!("capture '{}' terminated", self.name);
                return Ok(EXIT_TERMINATED);
            }
            if self.control.stop.load(Ordering::Acquire) {
                break;
            }

            let Some(packet) = source.poll_packet(self.poll_interval)? else {
                continue;
            };
            writer.write_packet(packet.timestamp, &packet.data)?;
            log::debug!(
                "capture '{}': packet {} ({} bytes)",
                self.name,
                writer.packets(),
                packet.data.len()
            );

            if let Some(predicate) = self.stop_predicate.as_mut()
                && predicate(&packet.data)
            {
                log::debug!("capture '{}': stop predicate matched", self.name);
                break;
            }
        }

        log::info!(
            "capture '{}' on {} finished: {} packets",
            self.name,
            source.interface(),
            writer.packets()
        );
        Ok(EXIT_OK)
    }
}

#[cfg(target_os = "linux")]
fn open_live(
    interface: &str,
    program: Option<&[BpfInsn]>,
) -> Result<Box<dyn PacketSource>, IgmpError> {
    Ok(Box::new(AfPacketSource::open(interface, program)?))
}

#[cfg(not(target_os = "linux"))]
fn open_live(
    interface: &str,
    _program: Option<&[BpfInsn]>,
) -> Result<Box<dyn PacketSource>, IgmpError> {
    Err(IgmpError::CaptureDevice(format!(
        "live capture on {interface} is only supported on Linux"
    )))
}

/// Capture access check for platforms without a live source.
#[cfg(not(target_os = "linux"))]
pub fn check_capture_access() -> Result<(), IgmpError> {
    Err(IgmpError::InsufficientPermission(
        "live capture is only supported on Linux".to_string(),
    ))
}
