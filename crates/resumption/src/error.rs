use std::fmt;

/// Result type alias for continuation generation.
pub type ResumeResult<T> = Result<T, ResumeError>;

/// Error returned when a resume unit cannot be generated.
///
/// All three kinds describe a contract violation between the requesting frontend and
/// the generator. None of them is retried: the frontend is expected to abandon the
/// compilation attempt for the unit and fall back to running the original code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeError {
    /// The unit is generator-like, is not in the optimized calling convention, or was
    /// assembled for a different instruction-format era than the cache serves.
    UnsupportedUnitKind {
        /// Qualified name of the rejected unit.
        unit: String,
        /// Which requirement the unit failed.
        reason: String,
    },
    /// A re-entry snippet lacks the placeholder (or guard marker) it must contain.
    ///
    /// This is an authoring defect in a snippet template, never a runtime condition.
    TemplateMarkerNotFound {
        /// Name of the snippet that was being expanded.
        snippet: &'static str,
        /// The marker that could not be located.
        marker: String,
    },
    /// The resume key or an instruction handle disagrees with the real structure of
    /// the unit: missing offsets, dangling handles, or an unresolvable lineage redirect.
    StructuralInconsistency {
        /// Qualified name of the unit being transformed.
        unit: String,
        /// Description of the mismatch.
        detail: String,
    },
}

impl ResumeError {
    pub(crate) fn unsupported(unit: &str, reason: impl Into<String>) -> Self {
        Self::UnsupportedUnitKind {
            unit: unit.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn marker_not_found(snippet: &'static str, marker: impl Into<String>) -> Self {
        Self::TemplateMarkerNotFound {
            snippet,
            marker: marker.into(),
        }
    }

    pub(crate) fn inconsistent(unit: &str, detail: impl Into<String>) -> Self {
        Self::StructuralInconsistency {
            unit: unit.to_owned(),
            detail: detail.into(),
        }
    }

    /// Short, stable name of the error kind, used by tracers.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedUnitKind { .. } => "UnsupportedUnitKind",
            Self::TemplateMarkerNotFound { .. } => "TemplateMarkerNotFound",
            Self::StructuralInconsistency { .. } => "StructuralInconsistency",
        }
    }
}

impl fmt::Display for ResumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedUnitKind { unit, reason } => {
                write!(f, "cannot resume `{unit}`: {reason}")
            }
            Self::TemplateMarkerNotFound { snippet, marker } => {
                write!(f, "snippet `{snippet}` has no `{marker}` marker")
            }
            Self::StructuralInconsistency { unit, detail } => {
                write!(f, "structural inconsistency in `{unit}`: {detail}")
            }
        }
    }
}

impl std::error::Error for ResumeError {}
