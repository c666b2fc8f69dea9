#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Allow,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    UnknownOperator,
    UnknownSeries,
    TypeMismatch,
    TimezoneMismatch,
    PrimaryConflict,
    RenameConflict,
    MalformedBinding,
    Cycle,
    Registered,
    Renamed,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityIssue {
    pub kind: IssueKind,
    pub subject: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub ts_unix_ms: u64,
    pub mode: RuntimeMode,
    pub action: DecisionAction,
    pub issue: CompatibilityIssue,
}

impl DecisionRecord {
    #[must_use]
    pub fn render_plain(&self) -> String {
        format!(
            "[{}::{:?}] {:?}: {}",
            self.issue.subject, self.action, self.issue.kind, self.issue.detail
        )
    }
}

/// Append-only log of the decisions taken while registering, renaming and
/// binding formulas.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceLedger {
    records: Vec<DecisionRecord>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: DecisionRecord) {
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[DecisionRecord] {
        &self.records
    }

    #[must_use]
    pub fn last(&self) -> Option<&DecisionRecord> {
        self.records.last()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePolicy {
    pub mode: RuntimeMode,
    /// Refuse formulas referring to series that do not exist (yet).
    pub reject_unknown_series: bool,
}

impl RuntimePolicy {
    #[must_use]
    pub fn strict() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            reject_unknown_series: true,
        }
    }

    #[must_use]
    pub fn hardened() -> Self {
        Self {
            mode: RuntimeMode::Hardened,
            reject_unknown_series: false,
        }
    }

    /// Whether a formula may reference `missing` series. An explicit caller
    /// choice overrides the policy default.
    pub fn decide_unknown_series(
        &self,
        subject: impl Into<String>,
        missing: &[String],
        reject_override: Option<bool>,
        ledger: &mut EvidenceLedger,
    ) -> DecisionAction {
        let reject = reject_override.unwrap_or(self.reject_unknown_series);
        let action = if reject {
            DecisionAction::Reject
        } else {
            DecisionAction::Allow
        };
        self.record(
            IssueKind::UnknownSeries,
            subject,
            format!("missing={}", missing.join(",")),
            action,
            ledger,
        );
        action
    }

    pub fn reject(
        &self,
        kind: IssueKind,
        subject: impl Into<String>,
        detail: impl Into<String>,
        ledger: &mut EvidenceLedger,
    ) -> DecisionAction {
        self.record(kind, subject, detail, DecisionAction::Reject, ledger)
    }

    pub fn allow(
        &self,
        kind: IssueKind,
        subject: impl Into<String>,
        detail: impl Into<String>,
        ledger: &mut EvidenceLedger,
    ) -> DecisionAction {
        self.record(kind, subject, detail, DecisionAction::Allow, ledger)
    }

    fn record(
        &self,
        kind: IssueKind,
        subject: impl Into<String>,
        detail: impl Into<String>,
        action: DecisionAction,
        ledger: &mut EvidenceLedger,
    ) -> DecisionAction {
        ledger.push(DecisionRecord {
            ts_unix_ms: now_unix_ms().unwrap_or_default(),
            mode: self.mode,
            action,
            issue: CompatibilityIssue {
                kind,
                subject: subject.into(),
                detail: detail.into(),
            },
        });
        action
    }
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self::strict()
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
    #[error("invalid engine configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("max_depth must be greater than zero")]
    ZeroDepth,
}

fn now_unix_ms() -> Result<u64, RuntimeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::ClockSkew)?
        .as_millis();
    Ok(ms as u64)
}

pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Engine-wide settings. Every field has a default so partial JSON
/// documents are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub namespace: String,
    pub policy: RuntimePolicy,
    /// Nesting bound for formula expansion and nested evaluation.
    pub max_depth: usize,
    /// Use the per-leaf staircase when every operator allows it.
    pub fast_staircase: bool,
}

impl EngineConfig {
    #[must_use]
    pub fn default_namespace() -> Self {
        Self {
            namespace: "tsh".to_owned(),
            policy: RuntimePolicy::strict(),
            max_depth: DEFAULT_MAX_DEPTH,
            fast_staircase: true,
        }
    }

    pub fn from_json_str(input: &str) -> Result<Self, RuntimeError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_depth == 0 {
            return Err(RuntimeError::ZeroDepth);
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_namespace()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DEFAULT_MAX_DEPTH, DecisionAction, EngineConfig, EvidenceLedger, IssueKind, RuntimeError,
        RuntimeMode, RuntimePolicy,
    };

    #[test]
    fn strict_mode_rejects_unknown_series() {
        let mut ledger = EvidenceLedger::new();
        let policy = RuntimePolicy::strict();

        let action =
            policy.decide_unknown_series("f", &["missing".to_owned()], None, &mut ledger);
        assert_eq!(action, DecisionAction::Reject);
        assert_eq!(ledger.records()[0].mode, RuntimeMode::Strict);
        assert_eq!(ledger.records()[0].issue.detail, "missing=missing");
    }

    #[test]
    fn explicit_choice_overrides_policy() {
        let mut ledger = EvidenceLedger::new();
        let strict = RuntimePolicy::strict();
        let hardened = RuntimePolicy::hardened();

        assert_eq!(
            strict.decide_unknown_series("f", &[], Some(false), &mut ledger),
            DecisionAction::Allow
        );
        assert_eq!(
            hardened.decide_unknown_series("f", &[], None, &mut ledger),
            DecisionAction::Allow
        );
        assert_eq!(
            hardened.decide_unknown_series("f", &[], Some(true), &mut ledger),
            DecisionAction::Reject
        );
        assert_eq!(ledger.records().len(), 3);
    }

    #[test]
    fn rejection_records_render_plainly() {
        let mut ledger = EvidenceLedger::new();
        RuntimePolicy::strict().reject(IssueKind::TypeMismatch, "f", "expected series", &mut ledger);
        let rendered = ledger.last().expect("record").render_plain();
        assert!(rendered.contains("f::Reject"));
        assert!(rendered.contains("TypeMismatch"));
    }

    #[test]
    fn config_accepts_partial_json() {
        let config = EngineConfig::from_json_str(r#"{"namespace": "other", "policy": {"mode": "hardened", "reject_unknown_series": false}}"#)
            .expect("config");
        assert_eq!(config.namespace, "other");
        assert_eq!(config.policy, RuntimePolicy::hardened());
        assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);
        assert!(config.fast_staircase);
    }

    #[test]
    fn config_rejects_zero_depth() {
        let err = EngineConfig::from_json_str(r#"{"max_depth": 0}"#).expect_err("zero depth");
        assert!(matches!(err, RuntimeError::ZeroDepth));
    }
}
