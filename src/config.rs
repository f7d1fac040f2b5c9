// Harness configuration: which interface the DUT hangs off, which groups it
// is expected to join and where captures are written.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::capture::CaptureConfig;
use crate::error::IgmpError;
use crate::validate::ValidationConfig;

/// sACN universe 1.
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);
/// sACN universe 2.
pub const DEFAULT_SECONDARY_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 2);
pub const DEFAULT_OUTPUT_DIR: &str = "output";

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL).
const MAX_INTERFACE_LEN: usize = 15;

#[derive(Debug, Clone)]
pub struct Config {
    /// Interface the DUT is connected to. May be empty for offline checks.
    pub interface: String,
    /// Group the DUT is configured to receive.
    pub group: Ipv4Addr,
    /// Group the DUT is reconfigured to in the group-change check.
    pub secondary_group: Option<Ipv4Addr>,
    pub output_dir: PathBuf,
    pub validation: ValidationConfig,
    pub capture: CaptureConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: String::new(),
            group: DEFAULT_GROUP,
            secondary_group: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            validation: ValidationConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

impl Config {
    /// Settings needed for live runs: a usable interface name, multicast
    /// groups and sane validation limits.
    pub fn validate(&self) -> Result<(), IgmpError> {
        if self.interface.is_empty() {
            return Err(IgmpError::Config(
                "no interface configured; pass --interface with the port the DUT is connected to"
                    .to_string(),
            ));
        }
        if self.interface.len() > MAX_INTERFACE_LEN
            || self.interface.contains(['/', ' ', '\0'])
        {
            return Err(IgmpError::Config(format!(
                "'{}' is not a valid interface name",
                self.interface
            )));
        }
        self.validate_groups()?;
        self.validate_limits()
    }

    /// Checks that do not involve the interface, for offline analysis.
    pub fn validate_offline(&self) -> Result<(), IgmpError> {
        self.validate_groups()?;
        self.validate_limits()
    }

    fn validate_groups(&self) -> Result<(), IgmpError> {
        check_multicast("group", self.group)?;
        if let Some(secondary) = self.secondary_group {
            check_multicast("secondary group", secondary)?;
            if secondary == self.group {
                return Err(IgmpError::Config(format!(
                    "secondary group must differ from the group ({secondary})"
                )));
            }
        }
        Ok(())
    }

    fn validate_limits(&self) -> Result<(), IgmpError> {
        let v = &self.validation;
        if v.report_ceiling == 0 {
            return Err(IgmpError::Config("report ceiling must be at least 1".to_string()));
        }
        if v.report_advisory_threshold > v.report_ceiling {
            return Err(IgmpError::Config(format!(
                "advisory threshold {} is above the report ceiling {}",
                v.report_advisory_threshold, v.report_ceiling
            )));
        }
        if v.tolerance.is_nan() || v.tolerance < 0.0 {
            return Err(IgmpError::Config(format!(
                "tolerance must not be negative, got {}",
                v.tolerance
            )));
        }
        Ok(())
    }

    /// Capture file for one test run, `<output_dir>/<stem>.pcap`.
    pub fn capture_path(&self, stem: &str) -> PathBuf {
        self.output_dir.join(format!("{stem}.pcap"))
    }

    pub fn ensure_output_dir(&self) -> Result<&Path, IgmpError> {
        std::fs::create_dir_all(&self.output_dir)?;
        Ok(&self.output_dir)
    }
}

fn check_multicast(what: &str, addr: Ipv4Addr) -> Result<(), IgmpError> {
    if !addr.is_multicast() {
        return Err(IgmpError::Config(format!(
            "{what} {addr} is not an IPv4 multicast address (224.0.0.0 - 239.255.255.255)"
        )));
    }
    Ok(())
}
