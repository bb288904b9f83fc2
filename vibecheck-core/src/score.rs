//! Finding aggregation and health scoring.
//!
//! Both functions are local and deterministic: no provider is consulted.
//! [`score`] only looks at severity counts, so it is independent of the
//! order of its input.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{Finding, RepoStats, Severity};

/// Flatten per-stage finding lists into one canonical list.
///
/// Findings without an id are malformed and omitted. Duplicate ids coming
/// from different stages are all kept; stage order and in-stage order are
/// preserved.
pub fn merge<I>(sources: I) -> Vec<Finding>
where
    I: IntoIterator<Item = Vec<Finding>>,
{
    sources
        .into_iter()
        .flatten()
        .filter(Finding::is_well_formed)
        .collect()
}

/// Per-severity counts of a finding list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingsSummary {
    pub critical: u32,
    pub warning: u32,
    pub info: u32,
    pub total: u32,
}

impl FindingsSummary {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut summary = Self::default();
        for finding in findings {
            match finding.severity {
                Severity::Critical => summary.critical += 1,
                Severity::Warning => summary.warning += 1,
                Severity::Info => summary.info += 1,
            }
        }
        summary.total = summary.critical + summary.warning + summary.info;
        summary
    }
}

/// Health of one scoring category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub score: u32,
    pub max: u32,
    pub status: CategoryStatus,
}

impl CategoryScore {
    fn new(score: i64, status: CategoryStatus) -> Self {
        Self {
            score: score.clamp(0, CATEGORY_MAX as i64) as u32,
            max: CATEGORY_MAX,
            status,
        }
    }
}

/// Composite repository health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthScore {
    /// 0..=100
    pub overall: u32,
    pub letter_grade: String,
    pub breakdown: BTreeMap<String, CategoryScore>,
    pub confidence: f64,
}

const CATEGORY_MAX: u32 = 10;
/// Baseline for categories no stage scores directly yet.
const UNSCORED_CATEGORY: i64 = 7;
const SCORE_CONFIDENCE: f64 = 0.85;

/// Penalty weights in tenths so the arithmetic stays exact:
/// 3 per critical, 1 per warning, 0.2 per info.
const CRITICAL_WEIGHT_TENTHS: i64 = 30;
const WARNING_WEIGHT_TENTHS: i64 = 10;
const INFO_WEIGHT_TENTHS: i64 = 2;

/// Compute the health score of a finding set.
///
/// `overall = clamp(0, 100, round(100 - 2 * penalty))` with
/// `penalty = 3*critical + warning + 0.2*info`.
pub fn score(findings: &[Finding], _stats: &RepoStats) -> HealthScore {
    let summary = FindingsSummary::from_findings(findings);
    let critical = i64::from(summary.critical);
    let warning = i64::from(summary.warning);
    let info = i64::from(summary.info);

    let penalty_tenths = critical * CRITICAL_WEIGHT_TENTHS
        + warning * WARNING_WEIGHT_TENTHS
        + info * INFO_WEIGHT_TENTHS;
    let overall_tenths = 1000 - 2 * penalty_tenths;
    let overall = ((overall_tenths as f64) / 10.0).round().clamp(0.0, 100.0) as u32;

    let mut breakdown = BTreeMap::new();
    breakdown.insert(
        "codeQuality".to_string(),
        CategoryScore::new(
            10 - warning,
            if warning > 3 {
                CategoryStatus::Warning
            } else {
                CategoryStatus::Healthy
            },
        ),
    );
    breakdown.insert(
        "security".to_string(),
        CategoryScore::new(
            10 - critical * 3,
            if critical > 0 {
                CategoryStatus::Critical
            } else {
                CategoryStatus::Healthy
            },
        ),
    );
    breakdown.insert(
        "dependencies".to_string(),
        CategoryScore::new(
            10 - critical,
            if critical > 0 {
                CategoryStatus::Warning
            } else {
                CategoryStatus::Healthy
            },
        ),
    );
    breakdown.insert(
        "patterns".to_string(),
        CategoryScore::new(UNSCORED_CATEGORY, CategoryStatus::Healthy),
    );
    breakdown.insert(
        "architecture".to_string(),
        CategoryScore::new(UNSCORED_CATEGORY, CategoryStatus::Healthy),
    );

    HealthScore {
        overall,
        letter_grade: letter_grade(overall).to_string(),
        breakdown,
        confidence: SCORE_CONFIDENCE,
    }
}

/// Letter grade for an overall score.
pub fn letter_grade(overall: u32) -> &'static str {
    const THRESHOLDS: [(u32, &str); 10] = [
        (97, "A+"),
        (93, "A"),
        (90, "A-"),
        (87, "B+"),
        (83, "B"),
        (80, "B-"),
        (77, "C+"),
        (73, "C"),
        (70, "C-"),
        (60, "D"),
    ];
    THRESHOLDS
        .iter()
        .find(|(min, _)| overall >= *min)
        .map(|(_, grade)| *grade)
        .unwrap_or("F")
}
