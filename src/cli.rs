use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{Config, DEFAULT_OUTPUT_DIR};
use crate::igmp::IgmpVersion;
use crate::validate::ValidationConfig;

#[derive(Parser, Debug)]
#[command(
    name = "igmpcheck",
    version,
    about = "IGMPv2/IGMPv3 membership report conformance checks"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Validate an existing capture holding one query and its replies
    Check(CheckArgs),
    /// Send one membership query, capture the replies and validate them
    Probe(ProbeArgs),
    /// Probe with increasing response times and check the delays look random
    Timing(TimingArgs),
    /// Capture without querying and check the DUT stays silent
    Silence(SilenceArgs),
    /// Capture while the DUT's link flaps or it reboots, then check it announced the group
    Announce(AnnounceArgs),
    /// Capture while the DUT is moved to the secondary group, then check leave + join
    Change(ChangeArgs),
}

/// Interface and output location shared by all live commands.
#[derive(Args, Debug, Clone)]
pub struct HarnessArgs {
    /// Network interface the DUT is connected to
    #[arg(long, short = 'i')]
    pub interface: String,

    /// Multicast group the DUT is configured to receive
    #[arg(long, default_value = "239.255.0.1", value_parser = parse_multicast)]
    pub group: Ipv4Addr,

    /// Directory for capture files
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: PathBuf,
}

/// Report volume limits.
#[derive(Args, Debug, Clone)]
pub struct LimitArgs {
    /// Reports from one host above this count fail the check
    #[arg(long, default_value_t = 256, value_parser = validate_count)]
    pub report_ceiling: usize,

    /// Reports from one host above this count are flagged (informational)
    #[arg(long, default_value_t = 64, value_parser = validate_count)]
    pub advisory_threshold: usize,
}

impl Default for LimitArgs {
    fn default() -> Self {
        Self {
            report_ceiling: 256,
            advisory_threshold: 64,
        }
    }
}

impl LimitArgs {
    fn apply(&self, validation: &mut ValidationConfig) {
        validation.report_ceiling = self.report_ceiling;
        validation.report_advisory_threshold = self.advisory_threshold;
    }
}

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    /// Capture file (pcap or pcapng)
    #[arg(long)]
    pub pcap: PathBuf,

    /// Version of the query in the capture
    #[arg(long, default_value = "v2")]
    pub igmp_version: IgmpVersion,

    /// Group an IGMPv3 DUT must announce
    #[arg(long, value_parser = parse_multicast)]
    pub group: Option<Ipv4Addr>,

    #[command(flatten)]
    pub limits: LimitArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub harness: HarnessArgs,

    #[command(flatten)]
    pub limits: LimitArgs,

    #[arg(long, default_value = "v2")]
    pub igmp_version: IgmpVersion,

    /// Send a group-specific query for --group instead of a general query
    #[arg(long)]
    pub specific: bool,

    /// Querier source address
    #[arg(long, default_value = "2.0.0.1")]
    pub source_ip: Ipv4Addr,

    /// Leave out the IP Router Alert option
    #[arg(long)]
    pub no_router_alert: bool,

    /// Maximum response time advertised in the query, in seconds
    #[arg(long, default_value_t = 1.0, value_parser = validate_response_time)]
    pub max_response_time: f64,
}

#[derive(Args, Debug, Clone)]
pub struct TimingArgs {
    #[command(flatten)]
    pub harness: HarnessArgs,

    #[command(flatten)]
    pub limits: LimitArgs,

    #[arg(long, default_value = "v2")]
    pub igmp_version: IgmpVersion,

    /// Maximum response times to probe with, in seconds
    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = [1.0, 3.0, 5.0, 10.0, 20.0],
        value_parser = validate_response_time
    )]
    pub times: Vec<f64>,
}

#[derive(Args, Debug, Clone)]
pub struct SilenceArgs {
    #[command(flatten)]
    pub harness: HarnessArgs,

    /// How long to listen, in seconds (default query interval + margin)
    #[arg(long, default_value_t = 130, value_parser = validate_listen)]
    pub duration: u64,
}

#[derive(Args, Debug, Clone)]
pub struct AnnounceArgs {
    #[command(flatten)]
    pub harness: HarnessArgs,

    /// How long to listen while the DUT comes up, in seconds
    #[arg(long, default_value_t = 30, value_parser = validate_listen)]
    pub duration: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ChangeArgs {
    #[command(flatten)]
    pub harness: HarnessArgs,

    /// Group the DUT is reconfigured to receive
    #[arg(long, default_value = "239.255.0.2", value_parser = parse_multicast)]
    pub secondary_group: Ipv4Addr,

    /// How long to listen while the DUT is reconfigured, in seconds
    #[arg(long, default_value_t = 30, value_parser = validate_listen)]
    pub duration: u64,
}

fn parse_multicast(s: &str) -> Result<Ipv4Addr, String> {
    let addr: Ipv4Addr = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid IPv4 address"))?;
    if !addr.is_multicast() {
        return Err(format!("{addr} is not a multicast address"));
    }
    Ok(addr)
}

fn validate_response_time(s: &str) -> Result<f64, String> {
    let val: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if !(0.1..=3174.4).contains(&val) {
        Err("response time must be between 0.1 and 3174.4 seconds".to_string())
    } else {
        Ok(val)
    }
}

fn validate_listen(s: &str) -> Result<u64, String> {
    let val: u64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val == 0 {
        Err("duration must be at least 1 second".to_string())
    } else if val > 3600 {
        Err("duration must be at most 3600 seconds".to_string())
    } else {
        Ok(val)
    }
}

fn validate_count(s: &str) -> Result<usize, String> {
    let val: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val == 0 {
        Err("count must be at least 1".to_string())
    } else {
        Ok(val)
    }
}

impl HarnessArgs {
    /// Harness configuration for a live command.
    pub fn config(&self, limits: Option<&LimitArgs>) -> Config {
        let mut config = Config {
            interface: self.interface.clone(),
            group: self.group,
            output_dir: self.output_dir.clone(),
            ..Config::default()
        };
        if let Some(limits) = limits {
            limits.apply(&mut config.validation);
        }
        config
    }
}

impl CheckArgs {
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        self.limits.apply(&mut config.validation);
        if let Some(group) = self.group {
            config.group = group;
            config.validation.target_group = Some(group);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(args)
    }

    fn probe(args: &[&str]) -> ProbeArgs {
        let mut full = vec!["igmpcheck", "probe", "-i", "eth0"];
        full.extend_from_slice(args);
        match parse(&full).unwrap().command {
            Command::Probe(p) => p,
            other => panic!("expected probe, got {other:?}"),
        }
    }

    #[test]
    fn subcommand_is_required() {
        assert!(parse(&["igmpcheck"]).is_err());
    }

    #[test]
    fn probe_defaults() {
        let p = probe(&[]);
        assert_eq!(p.igmp_version, IgmpVersion::V2);
        assert_eq!(p.source_ip, Ipv4Addr::new(2, 0, 0, 1));
        assert_eq!(p.max_response_time, 1.0);
        assert!(!p.no_router_alert);
        assert!(!p.specific);
        assert_eq!(p.harness.group, Ipv4Addr::new(239, 255, 0, 1));
        assert_eq!(p.limits.report_ceiling, 256);
    }

    #[test]
    fn probe_requires_interface() {
        assert!(parse(&["igmpcheck", "probe"]).is_err());
    }

    #[test]
    fn probe_options() {
        let p = probe(&[
            "--igmp-version",
            "v3",
            "--specific",
            "--source-ip",
            "0.0.0.0",
            "--no-router-alert",
            "--max-response-time",
            "12.8",
        ]);
        assert_eq!(p.igmp_version, IgmpVersion::V3);
        assert!(p.specific);
        assert!(p.source_ip.is_unspecified());
        assert!(p.no_router_alert);
        assert_eq!(p.max_response_time, 12.8);
    }

    #[test]
    fn response_time_bounds() {
        for bad in ["0.05", "4000", "fast"] {
            let result = parse(&[
                "igmpcheck",
                "probe",
                "-i",
                "eth0",
                "--max-response-time",
                bad,
            ]);
            assert!(result.is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn group_must_be_multicast() {
        let result = parse(&["igmpcheck", "probe", "-i", "eth0", "--group", "10.0.0.1"]);
        assert!(result.is_err());
    }

    #[test]
    fn timing_times_list() {
        let cli = parse(&["igmpcheck", "timing", "-i", "eth0", "--times", "1,2,4"]).unwrap();
        let Command::Timing(t) = cli.command else {
            panic!("expected timing");
        };
        assert_eq!(t.times, vec![1.0, 2.0, 4.0]);

        let cli = parse(&["igmpcheck", "timing", "-i", "eth0"]).unwrap();
        let Command::Timing(t) = cli.command else {
            panic!("expected timing");
        };
        assert_eq!(t.times, vec![1.0, 3.0, 5.0, 10.0, 20.0]);
    }

    #[test]
    fn silence_duration() {
        let cli = parse(&["igmpcheck", "silence", "-i", "eth0"]).unwrap();
        let Command::Silence(s) = cli.command else {
            panic!("expected silence");
        };
        assert_eq!(s.duration, 130);
        assert!(parse(&["igmpcheck", "silence", "-i", "eth0", "--duration", "0"]).is_err());
    }

    #[test]
    fn check_builds_offline_config() {
        let cli = parse(&[
            "igmpcheck",
            "check",
            "--pcap",
            "out.pcap",
            "--igmp-version",
            "v3",
            "--group",
            "239.1.2.3",
            "--report-ceiling",
            "10",
            "--advisory-threshold",
            "5",
        ])
        .unwrap();
        let Command::Check(c) = cli.command else {
            panic!("expected check");
        };
        let config = c.config();
        assert_eq!(config.validation.target_group, Some(Ipv4Addr::new(239, 1, 2, 3)));
        assert_eq!(config.validation.report_ceiling, 10);
        assert_eq!(config.validation.report_advisory_threshold, 5);
        assert!(config.validate_offline().is_ok());
    }

    #[test]
    fn check_rejects_zero_ceiling() {
        let result = parse(&[
            "igmpcheck",
            "check",
            "--pcap",
            "out.pcap",
            "--report-ceiling",
            "0",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn change_defaults() {
        let cli = parse(&["igmpcheck", "change", "-i", "eth0"]).unwrap();
        let Command::Change(c) = cli.command else {
            panic!("expected change");
        };
        assert_eq!(c.secondary_group, Ipv4Addr::new(239, 255, 0, 2));
        let config = c.harness.config(None);
        assert_eq!(config.interface, "eth0");
        assert_eq!(config.output_dir, PathBuf::from("output"));
    }
}
