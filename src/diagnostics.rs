//! Diagnostics Module for Lumen Build
//!
//! Collects compiler and transform diagnostics across all pipeline stages
//! and merges them in stage order for host reporting.

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// STAGES
// ═══════════════════════════════════════════════════════════════════════════════

pub const STAGE_CONFIGURATION: &str = "configuration";
pub const STAGE_SYNTACTIC: &str = "syntactic";
pub const STAGE_SEMANTIC: &str = "semantic";
pub const STAGE_TRANSFORM: &str = "transform";

/// Reporting order. Program-configuration diagnostics come first, then per-unit
/// syntactic, then semantic, then transform-stage diagnostics.
const STAGE_ORDER: [&str; 4] = [
    STAGE_CONFIGURATION,
    STAGE_SYNTACTIC,
    STAGE_SEMANTIC,
    STAGE_TRANSFORM,
];

// ═══════════════════════════════════════════════════════════════════════════════
// DIAGNOSTIC
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A single reportable message. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub stage: String,
    pub file: Option<String>,
}

impl Diagnostic {
    pub fn error(stage: &str, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            stage: stage.to_string(),
            file: None,
        }
    }

    pub fn warning(stage: &str, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
            stage: stage.to_string(),
            file: None,
        }
    }

    pub fn info(stage: &str, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Info,
            message: message.into(),
            stage: stage.to_string(),
            file: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AGGREGATOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-build diagnostic sink. Diagnostics are recorded under the stage that
/// produced them and read back merged in stage order.
#[derive(Debug, Default)]
pub struct DiagnosticsAggregator {
    entries: Vec<Diagnostic>,
    /// Hosts without a native info channel get info downgraded to warning.
    /// Documented fallback, not a bug.
    host_has_info_sink: bool,
}

impl DiagnosticsAggregator {
    pub fn new(host_has_info_sink: bool) -> Self {
        DiagnosticsAggregator {
            entries: Vec::new(),
            host_has_info_sink,
        }
    }

    pub fn report(&mut self, mut diagnostic: Diagnostic) {
        if diagnostic.severity == Severity::Info && !self.host_has_info_sink {
            diagnostic.severity = Severity::Warning;
        }
        self.entries.push(diagnostic);
    }

    pub fn report_all(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for d in diagnostics {
            self.report(d);
        }
    }

    /// Diagnostics recorded for one stage, in report order.
    pub fn collect<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a Diagnostic> {
        self.entries.iter().filter(move |d| d.stage == stage)
    }

    /// All diagnostics merged in stage order. Stages outside the known order
    /// (custom collaborator stages) trail in report order.
    pub fn merged(&self) -> Vec<Diagnostic> {
        let mut out = Vec::with_capacity(self.entries.len());
        for stage in STAGE_ORDER {
            out.extend(self.collect(stage).cloned());
        }
        out.extend(
            self.entries
                .iter()
                .filter(|d| !STAGE_ORDER.contains(&d.stage.as_str()))
                .cloned(),
        );
        out
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merged_stage_order() {
        let mut agg = DiagnosticsAggregator::new(true);
        agg.report(Diagnostic::error(STAGE_TRANSFORM, "t"));
        agg.report(Diagnostic::error(STAGE_CONFIGURATION, "c"));
        agg.report(Diagnostic::error(STAGE_SEMANTIC, "sem"));
        agg.report(Diagnostic::error(STAGE_SYNTACTIC, "syn"));

        let merged: Vec<String> = agg.merged().into_iter().map(|d| d.message).collect();
        assert_eq!(merged, vec!["c", "syn", "sem", "t"]);
    }

    #[test]
    fn test_info_downgraded_without_sink() {
        let mut agg = DiagnosticsAggregator::new(false);
        agg.report(Diagnostic::info(STAGE_TRANSFORM, "fyi"));
        assert_eq!(agg.merged()[0].severity, Severity::Warning);
    }

    #[test]
    fn test_info_kept_with_sink() {
        let mut agg = DiagnosticsAggregator::new(true);
        agg.report(Diagnostic::info(STAGE_TRANSFORM, "fyi"));
        assert_eq!(agg.merged()[0].severity, Severity::Info);
    }

    #[test]
    fn test_has_errors() {
        let mut agg = DiagnosticsAggregator::new(true);
        agg.report(Diagnostic::warning(STAGE_TRANSFORM, "w"));
        assert!(!agg.has_errors());
        agg.report(Diagnostic::error(STAGE_TRANSFORM, "e").with_file("a.lum"));
        assert!(agg.has_errors());
    }
}
