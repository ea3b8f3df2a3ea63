use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSeverity {
    /// Informational; the documented replacement/default rule was applied.
    Notice,
    /// A single level, resource entry or segment was skipped or defaulted.
    Malformed,
    /// A whole series or path was aborted.
    Structural,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCode {
    SourceUnreadable,
    UnsupportedShape,
    MissingLevelZero,
    EmptyPath,
    DuplicatePath,
    MalformedLevel,
    MalformedResource,
    LevelOutOfRange,
    EmptyLevel,
    MalformedSegment,
    UnknownScalingMode,
    UnknownCustomFunction,
    ValueOutOfRange,
    MaxLevelOutOfRange,
    UnseededResource,
    NonContiguousSegment,
    SegmentBeyondMaxLevel,
    SeriesIncomplete,
    UnresolvedSentinel,
}

impl DiagnosticCode {
    pub fn severity(self) -> DiagnosticSeverity {
        match self {
            DiagnosticCode::DuplicatePath | DiagnosticCode::EmptyLevel => {
                DiagnosticSeverity::Notice
            }
            DiagnosticCode::MalformedLevel
            | DiagnosticCode::MalformedResource
            | DiagnosticCode::LevelOutOfRange
            | DiagnosticCode::MalformedSegment
            | DiagnosticCode::UnknownScalingMode
            | DiagnosticCode::UnknownCustomFunction
            | DiagnosticCode::ValueOutOfRange
            | DiagnosticCode::UnresolvedSentinel => DiagnosticSeverity::Malformed,
            DiagnosticCode::SourceUnreadable
            | DiagnosticCode::UnsupportedShape
            | DiagnosticCode::MissingLevelZero
            | DiagnosticCode::EmptyPath
            | DiagnosticCode::MaxLevelOutOfRange
            | DiagnosticCode::UnseededResource
            | DiagnosticCode::NonContiguousSegment
            | DiagnosticCode::SegmentBeyondMaxLevel
            | DiagnosticCode::SeriesIncomplete => DiagnosticSeverity::Structural,
        }
    }
}

/// A problem found while loading or compiling catalog data. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileDiagnostic {
    pub code: DiagnosticCode,
    pub severity: DiagnosticSeverity,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_id: Option<String>,
    pub message: String,
}

impl CompileDiagnostic {
    pub fn new(
        code: DiagnosticCode,
        origin: impl Into<String>,
        path_id: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            severity: code.severity(),
            origin: origin.into(),
            path_id: path_id.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn is_structural(&self) -> bool {
        self.severity == DiagnosticSeverity::Structural
    }
}

impl fmt::Display for CompileDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path_id {
            Some(path_id) => write!(
                f,
                "[{:?}] {} ({}): {}",
                self.code, path_id, self.origin, self.message
            ),
            None => write!(f, "[{:?}] {}: {}", self.code, self.origin, self.message),
        }
    }
}

/// Collects diagnostics and mirrors each one into the log as it arrives.
#[derive(Debug, Default)]
pub(crate) struct DiagnosticSink {
    entries: Vec<CompileDiagnostic>,
}

impl DiagnosticSink {
    pub(crate) fn push(&mut self, diagnostic: CompileDiagnostic) {
        match diagnostic.severity {
            DiagnosticSeverity::Notice => tracing::info!(
                target: "upgrade::catalog",
                code = ?diagnostic.code,
                origin = %diagnostic.origin,
                path_id = diagnostic.path_id.as_deref().unwrap_or("-"),
                "{}",
                diagnostic.message
            ),
            DiagnosticSeverity::Malformed => tracing::warn!(
                target: "upgrade::catalog",
                code = ?diagnostic.code,
                origin = %diagnostic.origin,
                path_id = diagnostic.path_id.as_deref().unwrap_or("-"),
                "{}",
                diagnostic.message
            ),
            DiagnosticSeverity::Structural => tracing::error!(
                target: "upgrade::catalog",
                code = ?diagnostic.code,
                origin = %diagnostic.origin,
                path_id = diagnostic.path_id.as_deref().unwrap_or("-"),
                "{}",
                diagnostic.message
            ),
        }
        self.entries.push(diagnostic);
    }

    pub(crate) fn extend(&mut self, diagnostics: impl IntoIterator<Item = CompileDiagnostic>) {
        self.entries.extend(diagnostics);
    }

    pub(crate) fn into_inner(self) -> Vec<CompileDiagnostic> {
        self.entries
    }
}
