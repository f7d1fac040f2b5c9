use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use igmpcheck::capture::{self, CaptureManager};
use igmpcheck::cli::{
    AnnounceArgs, ChangeArgs, CheckArgs, Cli, Command, ProbeArgs, SilenceArgs, TimingArgs,
};
use igmpcheck::config::Config;
use igmpcheck::error::IgmpError;
use igmpcheck::igmp::builder::QueryBuilder;
use igmpcheck::igmp::{IgmpVersion, decode};
use igmpcheck::transmit::{self, FrameSender};
use igmpcheck::validate::{ValidationResult, Validator};

/// Global shutdown flag, set by signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Capture filter for every live run. Sees our own queries as well.
const CAPTURE_FILTER: &str = "igmp";

/// Extra listening time after the advertised maximum response time.
const RESPONSE_MARGIN: Duration = Duration::from_secs(1);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGTERM,
            signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            signal_handler as *const () as libc::sighandler_t,
        );
    }
}

/// 1: the DUT failed a check. 2: bad configuration. 3: missing privileges.
/// 4: anything else (harness or environment failure).
fn exit_code(err: &IgmpError) -> i32 {
    match err {
        e if e.is_violation() => 1,
        IgmpError::Config(_) | IgmpError::InvalidFilter { .. } => 2,
        IgmpError::InsufficientPermission(_) => 3,
        IgmpError::Interrupted => 130,
        _ => 4,
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(cli)));

    match result {
        Ok(Ok(())) => std::process::exit(0),
        Ok(Err(e)) => {
            if e.is_violation() {
                eprintln!("FAIL: {e}");
            } else {
                eprintln!("error: {e}");
            }
            std::process::exit(exit_code(&e));
        }
        Err(_) => {
            eprintln!("error: fatal: unexpected panic");
            std::process::exit(4);
        }
    }
}

fn run(cli: Cli) -> Result<(), IgmpError> {
    install_signal_handlers();

    match cli.command {
        Command::Check(args) => run_check(&args),
        Command::Probe(args) => run_probe(&args),
        Command::Timing(args) => run_timing(&args),
        Command::Silence(args) => run_silence(&args),
        Command::Announce(args) => run_announce(&args),
        Command::Change(args) => run_change(&args),
    }
}

// ---------------------------------------------------------------------------
// Offline check
// ---------------------------------------------------------------------------

fn run_check(args: &CheckArgs) -> Result<(), IgmpError> {
    let config = args.config();
    config.validate_offline()?;

    let validator = Validator::new(config.validation.clone());
    let result = validator.validate_capture(&args.pcap, args.igmp_version)?;
    print_result(&args.pcap, args.igmp_version, &result);
    Ok(())
}

// ---------------------------------------------------------------------------
// Live runs
// ---------------------------------------------------------------------------

/// Common preconditions for anything that touches the interface.
fn prepare_live(config: &Config) -> Result<(), IgmpError> {
    config.validate()?;
    capture::check_capture_access()?;
    if !transmit::link_is_up(&config.interface)? {
        return Err(IgmpError::Config(format!(
            "link on {} is down; connect the DUT first",
            config.interface
        )));
    }
    config.ensure_output_dir()?;
    Ok(())
}

fn run_probe(args: &ProbeArgs) -> Result<(), IgmpError> {
    let mut config = args.harness.config(Some(&args.limits));
    prepare_live(&config)?;

    let mut query = QueryBuilder::new(args.igmp_version)
        .src_mac(transmit::interface_mac(&config.interface)?)
        .source(args.source_ip)
        .router_alert(!args.no_router_alert)
        .max_response_deciseconds(deciseconds(args.max_response_time));
    let kind = if args.specific {
        query = query.group(config.group);
        "specific"
    } else {
        "general"
    };
    if args.igmp_version == IgmpVersion::V3 && !args.specific {
        config.validation.target_group = Some(config.group);
    }

    let mgr = CaptureManager::new(config.capture.clone());
    let stem = format!("{}_{}_query_response", version_slug(args.igmp_version), kind);
    let path = config.capture_path(&stem);
    let result = probe_once(&mgr, &config, &path, &query)?;
    print_result(&path, args.igmp_version, &result);
    Ok(())
}

fn run_timing(args: &TimingArgs) -> Result<(), IgmpError> {
    let mut config = args.harness.config(Some(&args.limits));
    prepare_live(&config)?;
    if args.igmp_version == IgmpVersion::V3 {
        config.validation.target_group = Some(config.group);
    }

    let mgr = CaptureManager::new(config.capture.clone());
    let validator = Validator::new(config.validation.clone());
    let mac = transmit::interface_mac(&config.interface)?;

    let mut latencies = Vec::with_capacity(args.times.len());
    for &time in &args.times {
        let query = QueryBuilder::new(args.igmp_version)
            .src_mac(mac)
            .max_response_deciseconds(deciseconds(time));
        let stem = format!(
            "{}_maximum_response_time_{}_sec",
            version_slug(args.igmp_version),
            time
        );
        let path = config.capture_path(&stem);
        let result = probe_once(&mgr, &config, &path, &query)?;
        println!(
            "max response {:>7.1}s: first report after {:.3}s ({} reports)",
            time,
            result.first_latency(),
            result.reports().len()
        );
        latencies.push(result.first_latency());
    }

    let variance = validator.check_latency_variance(&latencies)?;
    println!(
        "PASS: response times vary (variance {:.3} over {} queries)",
        variance,
        latencies.len()
    );
    Ok(())
}

fn run_silence(args: &SilenceArgs) -> Result<(), IgmpError> {
    let config = args.harness.config(None);
    prepare_live(&config)?;

    let path = config.capture_path("unsolicited_membership_reports");
    let mgr = CaptureManager::new(config.capture.clone());
    println!(
        "Listening on {} for {}s without querying",
        config.interface, args.duration
    );
    listen(&mgr, &config, &path, Duration::from_secs(args.duration))?;

    Validator::new(config.validation.clone()).check_silence(&path)?;
    println!("PASS: no unsolicited membership reports ({})", path.display());
    Ok(())
}

fn run_announce(args: &AnnounceArgs) -> Result<(), IgmpError> {
    let config = args.harness.config(None);
    prepare_live(&config)?;

    let path = config.capture_path("report_on_link");
    let mgr = CaptureManager::new(config.capture.clone());
    println!(
        "Listening on {} for {}s: power-cycle the DUT or reconnect its cable now",
        config.interface, args.duration
    );
    listen(&mgr, &config, &path, Duration::from_secs(args.duration))?;

    Validator::new(config.validation.clone()).check_group_announced(&path, config.group)?;
    println!("PASS: DUT announced {} ({})", config.group, path.display());
    Ok(())
}

fn run_change(args: &ChangeArgs) -> Result<(), IgmpError> {
    let mut config = args.harness.config(None);
    config.secondary_group = Some(args.secondary_group);
    prepare_live(&config)?;

    let path = config.capture_path("leave_on_config_change");
    let mgr = CaptureManager::new(config.capture.clone());
    println!(
        "Listening on {} for {}s: reconfigure the DUT from {} to {} now",
        config.interface, args.duration, config.group, args.secondary_group
    );
    listen(&mgr, &config, &path, Duration::from_secs(args.duration))?;

    Validator::new(config.validation.clone()).check_group_change(
        &path,
        config.group,
        args.secondary_group,
    )?;
    println!(
        "PASS: DUT left {} and joined {} ({})",
        config.group,
        args.secondary_group,
        path.display()
    );
    Ok(())
}

/// Capture, send `query`, wait out the response window, stop and validate.
fn probe_once(
    mgr: &CaptureManager,
    config: &Config,
    path: &Path,
    query: &QueryBuilder,
) -> Result<ValidationResult, IgmpError> {
    let name = capture_name(path)?;
    let window = decode::max_response_time(query.max_resp_code_value(), query.version());

    log::info!(
        "sending {} query (code {}) on {}",
        query.version(),
        query.max_resp_code_value(),
        config.interface
    );
    mgr.start(&config.interface, name, Some(CAPTURE_FILTER), None)?;
    let outcome = FrameSender::open(&config.interface)
        .and_then(|sender| sender.send(&query.build()))
        .and_then(|()| sleep_interruptible(window + RESPONSE_MARGIN));
    if let Err(e) = outcome {
        if let Err(stop_err) = mgr.stop(name) {
            log::warn!("stopping capture after failure: {stop_err}");
        }
        return Err(e);
    }
    mgr.stop(name)?;

    Validator::new(config.validation.clone()).validate_capture(path, query.version())
}

/// Capture for `duration` without transmitting anything.
fn listen(
    mgr: &CaptureManager,
    config: &Config,
    path: &Path,
    duration: Duration,
) -> Result<(), IgmpError> {
    let name = capture_name(path)?;
    mgr.start(&config.interface, name, Some(CAPTURE_FILTER), None)?;
    if let Err(e) = sleep_interruptible(duration) {
        if let Err(stop_err) = mgr.stop(name) {
            log::warn!("stopping capture after interrupt: {stop_err}");
        }
        return Err(e);
    }
    mgr.stop(name)
}

fn capture_name(path: &Path) -> Result<&str, IgmpError> {
    path.to_str()
        .ok_or_else(|| IgmpError::Config(format!("{} is not valid UTF-8", path.display())))
}

/// Sleep in short steps so Ctrl-C is honoured promptly.
fn sleep_interruptible(duration: Duration) -> Result<(), IgmpError> {
    let start = Instant::now();
    while start.elapsed() < duration {
        if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            return Err(IgmpError::Interrupted);
        }
        let left = duration.saturating_sub(start.elapsed());
        thread::sleep(left.min(Duration::from_millis(100)));
    }
    Ok(())
}

fn deciseconds(seconds: f64) -> u32 {
    (seconds * 10.0).round() as u32
}

fn version_slug(version: IgmpVersion) -> &'static str {
    match version {
        IgmpVersion::V2 => "v2",
        IgmpVersion::V3 => "v3",
    }
}

fn print_result(path: &Path, version: IgmpVersion, result: &ValidationResult) {
    for advisory in result.advisories() {
        println!("NOTE: {advisory}");
    }
    let groups: Vec<String> = result.groups().iter().map(ToString::to_string).collect();
    println!(
        "PASS: {} {} membership reports for {}, first after {:.3}s ({})",
        result.reports().len(),
        version,
        groups.join(", "),
        result.first_latency(),
        path.display()
    );
}
