//! Conformance checks over captured membership reports.
//!
//! A validation run goes through extraction, structural checks, timing
//! checks and volume checks, in that order, and stops at the first
//! violation. Advisories (non-fatal findings) are collected along the way
//! and returned with the verdict.

pub mod stats;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{IgmpError, StructuralViolation, TimingViolation, VolumeViolation};
use crate::extract;
use crate::igmp::{
    ALL_IGMPV3_ROUTERS, ALL_ROUTERS, IgmpVersion, MembershipQuery, MembershipReport,
    seconds_between,
};

/// Thresholds used by the validator.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Added to the advertised maximum response time to absorb capture and
    /// timestamp jitter, in seconds.
    pub tolerance: f64,
    /// The median inter-report gap must be above this, in seconds.
    pub min_median_gap: f64,
    /// More reports than this from one host is a failure.
    pub report_ceiling: usize,
    /// More reports than this from one host is reported as an advisory.
    pub report_advisory_threshold: usize,
    /// Minimum variance of representative latencies across queries (s²).
    pub min_latency_variance: f64,
    /// Group the DUT is expected to announce in IGMPv3 sessions.
    pub target_group: Option<Ipv4Addr>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.1,
            min_median_gap: 0.001,
            report_ceiling: 256,
            report_advisory_threshold: 64,
            min_latency_variance: 0.2,
            target_group: None,
        }
    }
}

/// Non-fatal finding. Never changes the verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum Advisory {
    /// An IGMPv3 query was answered with IGMPv2 reports only.
    V2Fallback { v2_reports: usize },
    /// A host sent more reports than the informational threshold.
    HighReportVolume {
        src: Ipv4Addr,
        count: usize,
        threshold: usize,
    },
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::V2Fallback { v2_reports } => write!(
                f,
                "DUT responded with {v2_reports} IGMPv2 membership reports to an IGMPv3 query"
            ),
            Advisory::HighReportVolume {
                src,
                count,
                threshold,
            } => write!(
                f,
                "{src} sent {count} membership reports (informational threshold {threshold})"
            ),
        }
    }
}

/// Verdict of one successful validation run.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    reports: Vec<MembershipReport>,
    first_latency: f64,
    advisories: Vec<Advisory>,
}

impl ValidationResult {
    /// Reports accepted for the session, in arrival order.
    pub fn reports(&self) -> &[MembershipReport] {
        &self.reports
    }

    /// Latency of the first report after the query, in seconds.
    pub fn first_latency(&self) -> f64 {
        self.first_latency
    }

    pub fn advisories(&self) -> &[Advisory] {
        &self.advisories
    }

    /// Groups announced by the accepted reports, in first-seen order.
    pub fn groups(&self) -> Vec<Ipv4Addr> {
        announced_groups(&self.reports)
    }
}

pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Validate a capture holding one query interval: exactly one query of
    /// `version` and the reports sent in reply to it.
    pub fn validate_capture(
        &self,
        path: impl AsRef<Path>,
        version: IgmpVersion,
    ) -> Result<ValidationResult, IgmpError> {
        let path = path.as_ref();
        let mut queries = extract::queries_of(path, version)?;
        if queries.len() != 1 {
            return Err(StructuralViolation::QueryCount {
                found: queries.len(),
            }
            .into());
        }
        let query = queries.remove(0);

        let mut reports = extract::v2_reports(path)?;
        if version == IgmpVersion::V3 {
            reports.extend(extract::v3_reports(path)?);
        }
        log::debug!(
            "{}: {} query from {} (code {}), {} reports",
            path.display(),
            version,
            query.src,
            query.max_resp_code,
            reports.len()
        );
        self.validate(&query, reports)
    }

    /// Validate `reports` as the replies to `query`.
    ///
    /// For an IGMPv2 query only v2 reports are considered; for IGMPv3 both
    /// v2-style and v3 reports count as replies.
    pub fn validate(
        &self,
        query: &MembershipQuery,
        mut reports: Vec<MembershipReport>,
    ) -> Result<ValidationResult, IgmpError> {
        if query.version == IgmpVersion::V2 {
            reports.retain(|r| r.version == IgmpVersion::V2);
        }
        reports.sort_by_key(|r| r.timestamp);

        let mut advisories = Vec::new();
        match query.version {
            IgmpVersion::V2 => self.check_structure_v2(query, &reports)?,
            IgmpVersion::V3 => self.check_structure_v3(query, &reports, &mut advisories)?,
        }
        let first_latency = self.check_timing(query, &reports)?;
        self.check_volume(&reports, &mut advisories)?;

        for advisory in &advisories {
            log::warn!("{advisory}");
        }
        log::info!(
            "{} validation passed: {} reports, first response after {:.3}s",
            query.version,
            reports.len(),
            first_latency
        );

        Ok(ValidationResult {
            reports,
            first_latency,
            advisories,
        })
    }

    fn check_structure_v2(
        &self,
        query: &MembershipQuery,
        reports: &[MembershipReport],
    ) -> Result<(), StructuralViolation> {
        if reports.is_empty() {
            return Err(StructuralViolation::NoReports);
        }

        let mut seen = Vec::with_capacity(reports.len());
        for report in reports {
            let Some(group) = report.group() else {
                continue;
            };
            if report.dst != group {
                return Err(StructuralViolation::DestinationMismatch {
                    src: report.src,
                    dst: report.dst,
                    group,
                });
            }
            if seen.contains(&group) {
                return Err(StructuralViolation::DuplicateGroup {
                    src: report.src,
                    group,
                });
            }
            seen.push(group);
        }

        if let Some(queried) = query.queried_group() {
            if !seen.contains(&queried) {
                return Err(StructuralViolation::GroupNotReported { group: queried });
            }
            if seen.len() != 1 {
                return Err(StructuralViolation::SpecificQueryMismatch {
                    queried,
                    reported: seen,
                });
            }
        }
        Ok(())
    }

    fn check_structure_v3(
        &self,
        query: &MembershipQuery,
        reports: &[MembershipReport],
        advisories: &mut Vec<Advisory>,
    ) -> Result<(), StructuralViolation> {
        if reports.is_empty() {
            return Err(StructuralViolation::NoReports);
        }

        let (v3, v2): (Vec<&MembershipReport>, Vec<&MembershipReport>) = reports
            .iter()
            .partition(|r| r.version == IgmpVersion::V3);
        if v3.is_empty() {
            advisories.push(Advisory::V2Fallback {
                v2_reports: v2.len(),
            });
        }

        // Only v2-style replies for the group under test are held to the
        // group-address destination rule.
        let target = query.queried_group().or(self.config.target_group);
        if let Some(target) = target {
            for report in v2.iter().filter(|r| r.announces(target)) {
                if report.dst != target {
                    return Err(StructuralViolation::DestinationMismatch {
                        src: report.src,
                        dst: report.dst,
                        group: target,
                    });
                }
            }
        }

        let specific = query.queried_group().is_some();
        for report in &v3 {
            if report.dst != ALL_IGMPV3_ROUTERS {
                return Err(StructuralViolation::V3Destination {
                    src: report.src,
                    dst: report.dst,
                });
            }
            if specific && report.records().len() != 1 {
                return Err(StructuralViolation::GroupRecordCount {
                    src: report.src,
                    count: report.records().len(),
                });
            }
        }

        if let Some(target) = target
            && !reports.iter().any(|r| r.announces(target))
        {
            return Err(StructuralViolation::GroupNotReported { group: target });
        }
        Ok(())
    }

    /// Deadline and burst checks. Returns the first report's latency.
    fn check_timing(
        &self,
        query: &MembershipQuery,
        reports: &[MembershipReport],
    ) -> Result<f64, TimingViolation> {
        let max_response = query.max_response_secs();
        let allowed = max_response + self.config.tolerance;

        for report in reports {
            let elapsed = seconds_between(query.timestamp, report.timestamp);
            log::debug!(
                "report from {} after {:.6}s (max {:.1}s)",
                report.src,
                elapsed,
                max_response
            );
            if elapsed >= allowed {
                return Err(TimingViolation::LateReport {
                    src: report.src,
                    elapsed,
                    allowed,
                });
            }
        }

        let arrivals: Vec<_> = reports.iter().map(|r| r.timestamp).collect();
        let gaps = stats::inter_arrival_gaps(query.timestamp, &arrivals);
        let median_gap = stats::median(&gaps).unwrap_or(0.0);
        if median_gap <= self.config.min_median_gap {
            return Err(TimingViolation::Burst {
                median_gap,
                reports: reports.len(),
            });
        }

        Ok(gaps.first().copied().unwrap_or(0.0))
    }

    fn check_volume(
        &self,
        reports: &[MembershipReport],
        advisories: &mut Vec<Advisory>,
    ) -> Result<(), VolumeViolation> {
        let mut per_source: BTreeMap<Ipv4Addr, usize> = BTreeMap::new();
        for report in reports {
            *per_source.entry(report.src).or_default() += 1;
        }

        for (&src, &count) in &per_source {
            if count > self.config.report_ceiling {
                return Err(VolumeViolation::TooManyReports {
                    src,
                    count,
                    ceiling: self.config.report_ceiling,
                });
            }
            if count > self.config.report_advisory_threshold {
                advisories.push(Advisory::HighReportVolume {
                    src,
                    count,
                    threshold: self.config.report_advisory_threshold,
                });
            }
        }
        Ok(())
    }

    /// Cross-query randomization check over representative latencies.
    pub fn check_latency_variance(&self, latencies: &[f64]) -> Result<f64, IgmpError> {
        check_latency_variance(latencies, self.config.min_latency_variance)
    }

    /// The capture contains no membership reports at all.
    pub fn check_silence(&self, path: impl AsRef<Path>) -> Result<(), IgmpError> {
        let path = path.as_ref();
        let count = extract::v2_reports(path)?.len() + extract::v3_reports(path)?.len();
        if count > 0 {
            return Err(StructuralViolation::UnsolicitedReports { count }.into());
        }
        Ok(())
    }

    /// The capture contains a correctly addressed announcement of `group`.
    pub fn check_group_announced(
        &self,
        path: impl AsRef<Path>,
        group: Ipv4Addr,
    ) -> Result<(), IgmpError> {
        let path = path.as_ref();
        let v2 = extract::v2_reports(path)?;
        let v3 = extract::v3_reports(path)?;
        if v2.is_empty() && v3.is_empty() {
            return Err(StructuralViolation::NoReports.into());
        }

        let mut found = false;
        for report in v2.iter().filter(|r| r.announces(group)) {
            found = true;
            if report.dst != group {
                return Err(StructuralViolation::DestinationMismatch {
                    src: report.src,
                    dst: report.dst,
                    group,
                }
                .into());
            }
        }
        for report in &v3 {
            if report.dst != ALL_IGMPV3_ROUTERS {
                return Err(StructuralViolation::V3Destination {
                    src: report.src,
                    dst: report.dst,
                }
                .into());
            }
            found |= report.announces(group);
        }

        if !found {
            return Err(StructuralViolation::GroupNotReported { group }.into());
        }
        Ok(())
    }

    /// The DUT left `old` and joined `new` (IGMPv2 leave + report).
    pub fn check_group_change(
        &self,
        path: impl AsRef<Path>,
        old: Ipv4Addr,
        new: Ipv4Addr,
    ) -> Result<(), IgmpError> {
        let path = path.as_ref();
        let leaves = extract::leaves(path)?;
        let reports = extract::v2_reports(path)?;
        if leaves.is_empty() {
            return Err(StructuralViolation::NoLeaves.into());
        }
        if reports.is_empty() {
            return Err(StructuralViolation::NoReports.into());
        }

        let mut left_old = false;
        for leave in &leaves {
            if leave.dst != ALL_ROUTERS {
                return Err(StructuralViolation::LeaveDestination {
                    src: leave.src,
                    dst: leave.dst,
                }
                .into());
            }
            if leave.group.is_unspecified() {
                return Err(StructuralViolation::LeaveUnspecifiedGroup { src: leave.src }.into());
            }
            left_old |= leave.group == old;
        }
        if !left_old {
            return Err(StructuralViolation::GroupNotLeft { group: old }.into());
        }

        let mut joined_new = false;
        for report in reports.iter().filter(|r| r.announces(new)) {
            joined_new = true;
            if report.dst != new {
                return Err(StructuralViolation::DestinationMismatch {
                    src: report.src,
                    dst: report.dst,
                    group: new,
                }
                .into());
            }
        }
        if !joined_new {
            return Err(StructuralViolation::GroupNotReported { group: new }.into());
        }
        Ok(())
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

/// Sample variance of `latencies`, which must exceed `minimum`.
pub fn check_latency_variance(latencies: &[f64], minimum: f64) -> Result<f64, IgmpError> {
    let Some(variance) = stats::sample_variance(latencies) else {
        return Err(TimingViolation::InsufficientSamples {
            samples: latencies.len(),
        }
        .into());
    };
    if variance <= minimum {
        return Err(TimingViolation::InsufficientVariance { variance, minimum }.into());
    }
    Ok(variance)
}

fn announced_groups(reports: &[MembershipReport]) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for report in reports {
        let groups = report
            .group()
            .into_iter()
            .chain(report.records().iter().map(|r| r.multicast));
        for g in groups {
            if seen.insert(g) {
                out.push(g);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::igmp::{GroupRecord, RecordType, ReportBody, Timestamp};

    const T0: Timestamp = 1_700_000_000_000_000;

    fn dut() -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, 50)
    }

    fn group(n: u8) -> Ipv4Addr {
        Ipv4Addr::new(239, 255, 0, n)
    }

    fn query(version: IgmpVersion, code: u8, group: Option<Ipv4Addr>) -> MembershipQuery {
        MembershipQuery {
            version,
            src: Ipv4Addr::new(2, 0, 0, 1),
            dst: Ipv4Addr::new(224, 0, 0, 1),
            group: group.unwrap_or(Ipv4Addr::UNSPECIFIED),
            max_resp_code: code,
            router_alert: true,
            suppress_router_processing: false,
            qrv: 2,
            qqic: 125,
            sources: Vec::new(),
            timestamp: T0,
        }
    }

    fn v2(g: Ipv4Addr, after_ms: u64) -> MembershipReport {
        MembershipReport {
            version: IgmpVersion::V2,
            src: dut(),
            dst: g,
            body: ReportBody::Group(g),
            timestamp: T0 + after_ms * 1000,
        }
    }

    fn v3(groups: &[Ipv4Addr], after_ms: u64) -> MembershipReport {
        MembershipReport {
            version: IgmpVersion::V3,
            src: dut(),
            dst: ALL_IGMPV3_ROUTERS,
            body: ReportBody::Records(
                groups
                    .iter()
                    .map(|&g| GroupRecord {
                        record_type: RecordType::ModeIsExclude,
                        multicast: g,
                        sources: vec![],
                    })
                    .collect(),
            ),
            timestamp: T0 + after_ms * 1000,
        }
    }

    fn structural(err: IgmpError) -> StructuralViolation {
        match err {
            IgmpError::Structural(v) => v,
            other => panic!("expected structural violation, got {other}"),
        }
    }

    #[test]
    fn v2_session_passes_and_records_first_latency() {
        let reports = vec![v2(group(2), 500), v2(group(1), 200), v2(group(3), 900)];
        let result = Validator::default()
            .validate(&query(IgmpVersion::V2, 10, None), reports)
            .unwrap();
        assert!((result.first_latency() - 0.2).abs() < 1e-9);
        assert_eq!(result.reports()[0].group(), Some(group(1)));
        assert!(result.advisories().is_empty());
    }

    #[test]
    fn v2_destination_must_match_group() {
        let mut report = v2(group(1), 200);
        report.dst = Ipv4Addr::new(224, 0, 0, 2);
        let err = Validator::default()
            .validate(&query(IgmpVersion::V2, 10, None), vec![report])
            .unwrap_err();
        assert!(matches!(
            structural(err),
            StructuralViolation::DestinationMismatch { .. }
        ));
    }

    #[test]
    fn v2_duplicate_group_fails() {
        let reports = vec![v2(group(1), 200), v2(group(1), 600)];
        let err = Validator::default()
            .validate(&query(IgmpVersion::V2, 10, None), reports)
            .unwrap_err();
        assert_eq!(
            structural(err),
            StructuralViolation::DuplicateGroup {
                src: dut(),
                group: group(1)
            }
        );
    }

    #[test]
    fn v2_no_reports_fails() {
        let err = Validator::default()
            .validate(&query(IgmpVersion::V2, 10, Some(group(1))), vec![])
            .unwrap_err();
        assert_eq!(structural(err), StructuralViolation::NoReports);
    }

    #[test]
    fn v2_specific_query_needs_exactly_that_group() {
        let v = Validator::default();
        let q = query(IgmpVersion::V2, 10, Some(group(1)));
        assert!(v.validate(&q, vec![v2(group(1), 300)]).is_ok());

        let err = v
            .validate(&q, vec![v2(group(1), 300), v2(group(2), 600)])
            .unwrap_err();
        assert!(matches!(
            structural(err),
            StructuralViolation::SpecificQueryMismatch { .. }
        ));

        let err = v.validate(&q, vec![v2(group(2), 300)]).unwrap_err();
        assert_eq!(
            structural(err),
            StructuralViolation::GroupNotReported { group: group(1) }
        );
    }

    #[test]
    fn v2_query_ignores_v3_reports() {
        let err = Validator::default()
            .validate(&query(IgmpVersion::V2, 10, None), vec![v3(&[group(1)], 300)])
            .unwrap_err();
        assert_eq!(structural(err), StructuralViolation::NoReports);
    }

    #[test]
    fn late_report_fails() {
        // 1.0s max response, report at +1.2s is beyond the 0.1s tolerance.
        let err = Validator::default()
            .validate(&query(IgmpVersion::V2, 10, None), vec![v2(group(1), 1200)])
            .unwrap_err();
        let IgmpError::Timing(TimingViolation::LateReport { src, elapsed, .. }) = err else {
            panic!("expected late report, got {err}");
        };
        assert_eq!(src, dut());
        assert!((elapsed - 1.2).abs() < 1e-9);
    }

    #[test]
    fn report_within_tolerance_passes() {
        assert!(
            Validator::default()
                .validate(&query(IgmpVersion::V2, 10, None), vec![v2(group(1), 1050)])
                .is_ok()
        );
    }

    #[test]
    fn simultaneous_reports_are_a_burst() {
        let reports = vec![v2(group(1), 400), v2(group(2), 400), v2(group(3), 400)];
        let err = Validator::default()
            .validate(&query(IgmpVersion::V2, 10, None), reports)
            .unwrap_err();
        assert!(matches!(
            err,
            IgmpError::Timing(TimingViolation::Burst { reports: 3, .. })
        ));
    }

    fn spread_reports(n: usize) -> Vec<MembershipReport> {
        (0..n)
            .map(|i| v2(Ipv4Addr::new(239, 1, (i / 256) as u8, (i % 256) as u8), 10 + i as u64 * 5))
            .collect()
    }

    #[test]
    fn volume_ceiling_is_inclusive() {
        let v = Validator::new(ValidationConfig {
            report_ceiling: 4,
            report_advisory_threshold: 2,
            ..ValidationConfig::default()
        });
        let q = query(IgmpVersion::V2, 10, None);

        let ok = v.validate(&q, spread_reports(4)).unwrap();
        assert_eq!(
            ok.advisories(),
            &[Advisory::HighReportVolume {
                src: dut(),
                count: 4,
                threshold: 2
            }]
        );

        let err = v.validate(&q, spread_reports(5)).unwrap_err();
        assert!(matches!(
            err,
            IgmpError::Volume(VolumeViolation::TooManyReports {
                count: 5,
                ceiling: 4,
                ..
            })
        ));
    }

    #[test]
    fn v3_session_with_target_group() {
        let v = Validator::new(ValidationConfig {
            target_group: Some(group(1)),
            ..ValidationConfig::default()
        });
        let q = query(IgmpVersion::V3, 10, None);
        let result = v
            .validate(&q, vec![v3(&[group(1), group(2)], 300)])
            .unwrap();
        assert!(result.advisories().is_empty());

        let err = v.validate(&q, vec![v3(&[group(2)], 300)]).unwrap_err();
        assert_eq!(
            structural(err),
            StructuralViolation::GroupNotReported { group: group(1) }
        );
    }

    #[test]
    fn v3_session_only_checks_v2_destination_for_target_group() {
        let v = Validator::new(ValidationConfig {
            target_group: Some(group(1)),
            ..ValidationConfig::default()
        });
        let q = query(IgmpVersion::V3, 10, None);

        let mut other = v2(Ipv4Addr::new(239, 1, 1, 1), 600);
        other.dst = ALL_ROUTERS;
        assert!(v.validate(&q, vec![v3(&[group(1)], 300), other]).is_ok());

        let mut target = v2(group(1), 600);
        target.dst = ALL_ROUTERS;
        let err = v
            .validate(&q, vec![v3(&[group(2)], 300), target])
            .unwrap_err();
        assert_eq!(
            structural(err),
            StructuralViolation::DestinationMismatch {
                src: dut(),
                dst: ALL_ROUTERS,
                group: group(1)
            }
        );
    }

    #[test]
    fn v3_report_must_go_to_all_igmpv3_routers() {
        let mut report = v3(&[group(1)], 300);
        report.dst = group(1);
        let err = Validator::default()
            .validate(&query(IgmpVersion::V3, 10, None), vec![report])
            .unwrap_err();
        assert!(matches!(
            structural(err),
            StructuralViolation::V3Destination { .. }
        ));
    }

    #[test]
    fn v3_specific_query_expects_one_record() {
        let q = query(IgmpVersion::V3, 10, Some(group(1)));
        let err = Validator::default()
            .validate(&q, vec![v3(&[group(1), group(2)], 300)])
            .unwrap_err();
        assert_eq!(
            structural(err),
            StructuralViolation::GroupRecordCount {
                src: dut(),
                count: 2
            }
        );
        assert!(Validator::default().validate(&q, vec![v3(&[group(1)], 300)]).is_ok());
    }

    #[test]
    fn v3_query_answered_with_v2_is_advisory() {
        let q = query(IgmpVersion::V3, 10, Some(group(1)));
        let result = Validator::default()
            .validate(&q, vec![v2(group(1), 300)])
            .unwrap();
        assert_eq!(result.advisories(), &[Advisory::V2Fallback { v2_reports: 1 }]);
    }

    #[test]
    fn v3_float_code_extends_deadline() {
        // 0x80 decodes to 12.8s in IGMPv3.
        let q = query(IgmpVersion::V3, 0x80, None);
        assert!(
            Validator::default()
                .validate(&q, vec![v3(&[group(1)], 12_000)])
                .is_ok()
        );
    }

    #[test]
    fn latency_variance() {
        assert!(check_latency_variance(&[0.2, 1.5, 4.0, 7.5, 16.0], 0.2).is_ok());
        assert!(matches!(
            check_latency_variance(&[0.5, 0.5, 0.6], 0.2),
            Err(IgmpError::Timing(TimingViolation::InsufficientVariance { .. }))
        ));
        assert!(matches!(
            check_latency_variance(&[0.5], 0.2),
            Err(IgmpError::Timing(TimingViolation::InsufficientSamples { samples: 1 }))
        ));
    }

    #[test]
    fn announced_groups_dedups() {
        let reports = vec![v2(group(1), 1), v3(&[group(2), group(1)], 2)];
        assert_eq!(announced_groups(&reports), vec![group(1), group(2)]);
    }
}
