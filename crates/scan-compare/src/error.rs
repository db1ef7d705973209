//! Error types for surface comparison operations.
//!
//! All fatal failures surface as [`CompareError`] variants carrying enough
//! context to identify the failing stage (which mesh, which operation).
//! Non-fatal conditions, such as refinement hitting its iteration cap, are not
//! errors; they are reported through result flags and `tracing::warn!`.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for comparison operations.
pub type CompareResult<T> = Result<T, CompareError>;

/// Which input a stage was operating on when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSide {
    /// The as-built object (first input).
    Source,
    /// The reference object (second input).
    Target,
}

impl std::fmt::Display for InputSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputSide::Source => write!(f, "source"),
            InputSide::Target => write!(f, "target"),
        }
    }
}

/// Errors that can occur during surface comparison.
#[derive(Debug, Error, Diagnostic)]
pub enum CompareError {
    /// Malformed or empty geometry.
    #[error("invalid mesh: {details}")]
    #[diagnostic(
        code(compare::mesh::invalid),
        help("The mesh must have at least one face with non-zero area. Check the export settings of the scanning software.")
    )]
    InvalidMesh { details: String },

    /// Fewer than two distinct points where a pair is required.
    #[error("degenerate input: {details}")]
    #[diagnostic(
        code(compare::input::degenerate),
        help("At least two distinct points are required. The input may have collapsed to a single location.")
    )]
    DegenerateInput { details: String },

    /// Coarse registration could not find enough local features.
    #[error("insufficient features on {side} input: {count} down-sampled points, need at least {required}")]
    #[diagnostic(
        code(compare::registration::features),
        help("Try a larger sample count or check that both inputs cover comparable surface area.")
    )]
    InsufficientFeatures {
        side: InputSide,
        count: usize,
        required: usize,
    },

    /// Divergence computation against an empty reference set.
    #[error("cannot compute divergence against an empty reference point set")]
    #[diagnostic(
        code(compare::divergence::empty_reference),
        help("The reference surface produced no sample points; the mesh may be degenerate.")
    )]
    EmptyReference,

    /// Error reading from a file.
    #[error("failed to read mesh from {path}")]
    #[diagnostic(
        code(compare::io::read),
        help("Check that the file exists and is readable.")
    )]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error writing to a file.
    #[error("failed to write mesh to {path}")]
    #[diagnostic(
        code(compare::io::write),
        help("Check that the directory exists and is writable.")
    )]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error parsing a mesh file.
    #[error("failed to parse mesh from {path}: {details}")]
    #[diagnostic(
        code(compare::io::parse),
        help("The file may be corrupted or in an unsupported format variant. Try re-exporting from the original software.")
    )]
    Parse { path: PathBuf, details: String },

    /// Unsupported file format.
    #[error("unsupported mesh format: {extension:?}")]
    #[diagnostic(
        code(compare::io::format),
        help("Supported formats: STL, OBJ, PLY")
    )]
    UnsupportedFormat { extension: Option<String> },
}

impl CompareError {
    /// Create an InvalidMesh error.
    pub fn invalid_mesh(details: impl Into<String>) -> Self {
        CompareError::InvalidMesh {
            details: details.into(),
        }
    }

    /// Create a DegenerateInput error.
    pub fn degenerate_input(details: impl Into<String>) -> Self {
        CompareError::DegenerateInput {
            details: details.into(),
        }
    }

    /// Create an InsufficientFeatures error.
    pub fn insufficient_features(side: InputSide, count: usize, required: usize) -> Self {
        CompareError::InsufficientFeatures {
            side,
            count,
            required,
        }
    }

    /// Create an IoRead error.
    pub fn io_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CompareError::IoRead {
            path: path.into(),
            source,
        }
    }

    /// Create an IoWrite error.
    pub fn io_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CompareError::IoWrite {
            path: path.into(),
            source,
        }
    }

    /// Create a Parse error.
    pub fn parse(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        CompareError::Parse {
            path: path.into(),
            details: details.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_identifies_side() {
        let err = CompareError::insufficient_features(InputSide::Target, 4, 10);
        let display = format!("{}", err);
        assert!(display.contains("target"));
        assert!(display.contains("4"));
        assert!(display.contains("10"));
    }

    #[test]
    fn test_constructor_helpers() {
        let err = CompareError::invalid_mesh("no faces");
        assert!(matches!(err, CompareError::InvalidMesh { .. }));

        let err = CompareError::degenerate_input("all points identical");
        assert!(matches!(err, CompareError::DegenerateInput { .. }));
    }
}
