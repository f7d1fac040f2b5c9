use std::fmt;
use std::net::Ipv4Addr;

/// Failure raised inside a capture worker and handed back to the controlling
/// caller at the next observation point (start, stop or wait).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    /// Short error category, e.g. `capture-device` or `io`.
    pub kind: String,
    /// Full diagnostic text from the worker.
    pub detail: String,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl From<&IgmpError> for WorkerFailure {
    fn from(err: &IgmpError) -> Self {
        Self {
            kind: err.kind().to_string(),
            detail: err.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IgmpError {
    #[error("capture '{0}' is already running")]
    DuplicateSession(String),
    #[error("capture '{0}' was never started")]
    SessionNotFound(String),
    #[error("capture '{name}' did not become ready within {timeout_ms}ms")]
    WorkerStartupTimeout { name: String, timeout_ms: u64 },
    #[error("capture '{name}': worker exited abnormally ({exit_code})")]
    WorkerCrashed { name: String, exit_code: i32 },
    #[error("capture worker failed: {0}")]
    Worker(WorkerFailure),
    #[error("cannot read capture {path}: {reason}")]
    CaptureUnreadable { path: String, reason: String },
    #[error("capture device error: {0}")]
    CaptureDevice(String),
    #[error("invalid capture filter '{expr}': {reason}")]
    InvalidFilter { expr: String, reason: String },
    #[error("{0}")]
    InsufficientPermission(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("interrupted")]
    Interrupted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("structural violation: {0}")]
    Structural(#[from] StructuralViolation),
    #[error("timing violation: {0}")]
    Timing(#[from] TimingViolation),
    #[error("volume violation: {0}")]
    Volume(#[from] VolumeViolation),
}

impl IgmpError {
    /// Short category name, used when the error crosses the worker boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            IgmpError::DuplicateSession(_) => "duplicate-session",
            IgmpError::SessionNotFound(_) => "session-not-found",
            IgmpError::WorkerStartupTimeout { .. } => "startup-timeout",
            IgmpError::WorkerCrashed { .. } => "worker-crashed",
            IgmpError::Worker(_) => "worker",
            IgmpError::CaptureUnreadable { .. } => "capture-unreadable",
            IgmpError::CaptureDevice(_) => "capture-device",
            IgmpError::InvalidFilter { .. } => "invalid-filter",
            IgmpError::InsufficientPermission(_) => "permission",
            IgmpError::Config(_) => "config",
            IgmpError::Interrupted => "interrupted",
            IgmpError::Io(_) => "io",
            IgmpError::Structural(_) => "structural",
            IgmpError::Timing(_) => "timing",
            IgmpError::Volume(_) => "volume",
        }
    }

    /// Whether this error is a protocol-conformance failure of the DUT rather
    /// than a harness or environment problem.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            IgmpError::Structural(_) | IgmpError::Timing(_) | IgmpError::Volume(_)
        )
    }
}

/// Packet content or packet set that breaks an addressing or layout rule.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StructuralViolation {
    #[error("found no IGMP membership reports, expected at least 1")]
    NoReports,
    #[error("found {found} membership queries in the capture, expected exactly 1")]
    QueryCount { found: usize },
    #[error(
        "membership report from {src} is addressed to {dst}, which is not its group address {group}"
    )]
    DestinationMismatch {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        group: Ipv4Addr,
    },
    #[error("duplicate membership report for {group} (second one from {src})")]
    DuplicateGroup { src: Ipv4Addr, group: Ipv4Addr },
    #[error("specific query for {queried} answered with reports for {reported:?}")]
    SpecificQueryMismatch {
        queried: Ipv4Addr,
        reported: Vec<Ipv4Addr>,
    },
    #[error("IGMPv3 report from {src} is addressed to {dst}, expected 224.0.0.22")]
    V3Destination { src: Ipv4Addr, dst: Ipv4Addr },
    #[error("IGMPv3 report from {src} carries {count} group records, expected 1 for a specific query")]
    GroupRecordCount { src: Ipv4Addr, count: usize },
    #[error("no membership report announces {group}")]
    GroupNotReported { group: Ipv4Addr },
    #[error("IGMPv3 {message} from {src} has reserved field set to {value:#x}")]
    ReservedFieldSet {
        src: Ipv4Addr,
        message: &'static str,
        value: u32,
    },
    #[error("found {count} unsolicited membership reports, none were expected")]
    UnsolicitedReports { count: usize },
    #[error("found no IGMP leave messages")]
    NoLeaves,
    #[error("leave from {src} is addressed to {dst}, expected 224.0.0.2")]
    LeaveDestination { src: Ipv4Addr, dst: Ipv4Addr },
    #[error("leave from {src} carries the unspecified group address")]
    LeaveUnspecifiedGroup { src: Ipv4Addr },
    #[error("no leave for {group} was sent")]
    GroupNotLeft { group: Ipv4Addr },
}

/// Reply timing that breaks a response-time rule.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TimingViolation {
    #[error(
        "membership report from {src} arrived after {elapsed:.3}s, but the maximum is {allowed:.3}s"
    )]
    LateReport {
        src: Ipv4Addr,
        elapsed: f64,
        allowed: f64,
    },
    #[error(
        "membership reports are sent in a burst: median spacing is {median_gap:.6}s over {reports} reports"
    )]
    Burst { median_gap: f64, reports: usize },
    #[error("need at least 2 response times to measure variance, got {samples}")]
    InsufficientSamples { samples: usize },
    #[error(
        "response times do not look randomly distributed: variance {variance:.4} is not above {minimum:.4}"
    )]
    InsufficientVariance { variance: f64, minimum: f64 },
}

/// Too many reports from a single host.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VolumeViolation {
    #[error("{src} sent {count} membership reports, the ceiling is {ceiling}")]
    TooManyReports {
        src: Ipv4Addr,
        count: usize,
        ceiling: usize,
    },
}
