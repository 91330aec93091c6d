//! Structured results of a test session
//!
//! [`TestRunReport`] is the only thing handed to renderers. Summary counts
//! are derived from the runs when the report is serialized and are never
//! stored in the model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::Path;

use feditest_common::{
    Error, ErrorKind, InteropLevel, NodeInstance, Result, SpecLevel, UnsatisfiedRole,
};

/// Document type tag written into every saved report
pub const REPORT_TYPE: &str = "feditest-testrunreport";

/// Current report format version; newer files are refused
pub const REPORT_VERSION: u32 = 1;

/// Terminal outcome of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
    Errored,
    Skipped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Errored => "errored",
            RunStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One entry in a run's event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    Provisioned {
        role: String,
        driver: String,
        hostname: String,
    },
    StepStarted {
        step: String,
    },
    StepFinished {
        step: String,
        duration_ms: u64,
        status: RunStatus,
    },
    DriverCall {
        role: String,
        driver: String,
        operation: String,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    InboundAwaited {
        recipient: String,
        matcher: String,
        duration_ms: u64,
        matched: bool,
    },
    Assertion {
        message: String,
        passed: bool,
        spec_level: SpecLevel,
        interop_level: InteropLevel,
    },
    Deprovisioned {
        role: String,
        driver: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Why a run did not pass: kind, message and originating operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_level: Option<SpecLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interop_level: Option<InteropLevel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsatisfied_roles: Vec<UnsatisfiedRole>,
}

impl FailureDetail {
    pub fn from_error(err: &Error, step: Option<&str>) -> Self {
        let assertion = err.assertion();
        let unsatisfied_roles = match err {
            Error::UnsatisfiableRole { roles } => roles.clone(),
            _ => Vec::new(),
        };

        Self {
            kind: err.kind(),
            message: err.to_string(),
            operation: err.operation().map(str::to_string),
            step: step.map(str::to_string),
            spec_level: assertion.map(|a| a.spec_level),
            interop_level: assertion.map(|a| a.interop_level),
            unsatisfied_roles,
        }
    }
}

/// The participant a run used for one role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub role: String,
    pub driver: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    pub externally_managed: bool,
}

impl From<&NodeInstance> for NodeSummary {
    fn from(node: &NodeInstance) -> Self {
        Self {
            role: node.role.clone(),
            driver: node.driver.clone(),
            hostname: node.hostname.clone(),
            app: node.app.clone(),
            app_version: node.app_version.clone(),
            externally_managed: node.externally_managed,
        }
    }
}

/// Outcome of one (test, constellation) execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub run_id: String,
    pub test: String,
    pub package: String,
    pub constellation: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<RunStatus>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub nodes: Vec<NodeSummary>,
    #[serde(default)]
    pub events: Vec<StepEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
}

impl TestRunResult {
    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Declared an expected status and ended with a different one
    pub fn is_unexpected(&self) -> bool {
        self.expected_status
            .map(|expected| expected != self.status)
            .unwrap_or(false)
    }
}

/// Derived counts over a report's runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    pub unexpected: usize,
    pub failed_by_spec_level: BTreeMap<SpecLevel, usize>,
}

impl RunSummary {
    pub fn of(runs: &[TestRunResult]) -> Self {
        let mut summary = Self {
            total: runs.len(),
            ..Self::default()
        };
        for run in runs {
            match run.status {
                RunStatus::Passed => summary.passed += 1,
                RunStatus::Failed => {
                    summary.failed += 1;
                    let level = run
                        .failure
                        .as_ref()
                        .and_then(|f| f.spec_level)
                        .unwrap_or_default();
                    *summary.failed_by_spec_level.entry(level).or_default() += 1;
                }
                RunStatus::Errored => summary.errored += 1,
                RunStatus::Skipped => summary.skipped += 1,
            }
            if run.is_unexpected() {
                summary.unexpected += 1;
            }
        }
        summary
    }
}

/// Where and with what the session ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub hostname: Option<String>,
    pub platform: String,
    pub feditest_version: String,
}

impl ReportMetadata {
    pub fn collect() -> Self {
        Self {
            hostname: hostname::get().ok().and_then(|h| h.into_string().ok()),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            feditest_version: feditest_common::VERSION.to_string(),
        }
    }
}

/// Report id: UTC start time with microseconds
pub fn report_id(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// All runs of one session, in scheduling order
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "StoredReport")]
pub struct TestRunReport {
    pub id: String,
    pub session: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub metadata: ReportMetadata,
    pub runs: Vec<TestRunResult>,
}

impl TestRunReport {
    pub fn summary(&self) -> RunSummary {
        RunSummary::of(&self.runs)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn runs_with_status(&self, status: RunStatus) -> impl Iterator<Item = &TestRunResult> {
        self.runs.iter().filter(move |r| r.status == status)
    }
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    #[serde(rename = "type")]
    type_tag: &'static str,
    version: u32,
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
    started_at: &'a DateTime<Utc>,
    ended_at: &'a DateTime<Utc>,
    metadata: &'a ReportMetadata,
    summary: RunSummary,
    runs: &'a [TestRunResult],
}

impl Serialize for TestRunReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ReportDocument {
            type_tag: REPORT_TYPE,
            version: REPORT_VERSION,
            id: &self.id,
            session: self.session.as_deref(),
            started_at: &self.started_at,
            ended_at: &self.ended_at,
            metadata: &self.metadata,
            summary: self.summary(),
            runs: &self.runs,
        }
        .serialize(serializer)
    }
}

#[derive(Deserialize)]
struct StoredReport {
    #[serde(rename = "type")]
    type_tag: String,
    version: u32,
    id: String,
    #[serde(default)]
    session: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    metadata: ReportMetadata,
    runs: Vec<TestRunResult>,
}

impl TryFrom<StoredReport> for TestRunReport {
    type Error = String;

    fn try_from(stored: StoredReport) -> std::result::Result<Self, Self::Error> {
        if stored.type_tag != REPORT_TYPE {
            return Err(format!("not a test run report: type {}", stored.type_tag));
        }
        if stored.version > REPORT_VERSION {
            return Err(format!(
                "report version {} is newer than supported version {}",
                stored.version, REPORT_VERSION
            ));
        }
        Ok(Self {
            id: stored.id,
            session: stored.session,
            started_at: stored.started_at,
            ended_at: stored.ended_at,
            metadata: stored.metadata,
            runs: stored.runs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feditest_common::AssertionFailure;

    fn result(test: &str, status: RunStatus) -> TestRunResult {
        let now = Utc::now();
        TestRunResult {
            run_id: format!("run-{}", test),
            test: test.to_string(),
            package: "pkg".to_string(),
            constellation: "c".to_string(),
            status,
            expected_status: None,
            started_at: now,
            ended_at: now,
            nodes: Vec::new(),
            events: vec![StepEvent {
                at: now,
                kind: EventKind::StepStarted {
                    step: "body".to_string(),
                },
            }],
            failure: None,
        }
    }

    fn report(runs: Vec<TestRunResult>) -> TestRunReport {
        let now = Utc::now();
        TestRunReport {
            id: report_id(now),
            session: Some("session".to_string()),
            started_at: now,
            ended_at: now,
            metadata: ReportMetadata::collect(),
            runs,
        }
    }

    #[test]
    fn test_summary_is_derived() {
        let mut failed = result("b", RunStatus::Failed);
        let err = Error::from(
            AssertionFailure::new("no follow").with_levels(SpecLevel::Must, InteropLevel::Problem),
        );
        failed.failure = Some(FailureDetail::from_error(&err, Some("body")));
        let mut known = result("d", RunStatus::Skipped);
        known.expected_status = Some(RunStatus::Passed);

        let report = report(vec![
            result("a", RunStatus::Passed),
            failed,
            result("c", RunStatus::Errored),
            known,
        ]);
        let summary = report.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.unexpected, 1);
        assert_eq!(summary.failed_by_spec_level[&SpecLevel::Must], 1);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], REPORT_TYPE);
        assert_eq!(json["summary"]["failed"], 1);
        assert_eq!(json["runs"][1]["failure"]["kind"], "assertion");
        assert_eq!(json["runs"][1]["failure"]["spec_level"], "must");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("session.json");
        let report = report(vec![result("a", RunStatus::Passed)]);

        report.save(&path).unwrap();
        let loaded = TestRunReport::load(&path).unwrap();
        assert_eq!(loaded, report);
    }

    #[test]
    fn test_load_rejects_incompatible() {
        let report = report(Vec::new());
        let mut json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        json["version"] = serde_json::json!(REPORT_VERSION + 1);
        assert!(TestRunReport::from_json(&json.to_string()).is_err());

        json["version"] = serde_json::json!(REPORT_VERSION);
        json["type"] = serde_json::json!("something-else");
        assert!(TestRunReport::from_json(&json.to_string()).is_err());
    }

    #[test]
    fn test_report_id_format() {
        let at = DateTime::parse_from_rfc3339("2024-05-06T07:08:09.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(report_id(at), "2024-05-06T07:08:09.123456");
    }
}
