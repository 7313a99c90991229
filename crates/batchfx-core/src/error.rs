//! Typed error hierarchy for the engine seam and the batching core.
//!
//! Uses `thiserror` for library-grade errors.
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`Error::error_code`] so
//! process exit status and structured telemetry never depend on string
//! parsing.  The namespace is flat: one code per failure class, regardless
//! of which layer surfaced it.  Layers add context with [`Error::at_stage`],
//! which names the failing stage but never swallows the underlying code.

use crate::image::{ComponentType, Layout, PixelFormat};

/// All errors originating from the batchfx core and pipeline layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ── Configuration / selector ─────────────────────────────────────
    #[error("Bad parameter: {0}")]
    Parameter(String),

    #[error("Unknown selector: {0:?}")]
    Selector(String),

    #[error("Unsupported pixel format: {format:?}/{component:?}/{layout:?}")]
    PixelFormat {
        format: PixelFormat,
        component: ComponentType,
        layout: Layout,
    },

    #[error("Unsupported resolution: {0}")]
    Resolution(String),

    #[error("Mismatch: {0}")]
    Mismatch(String),

    #[error("Missing input: {0}")]
    MissingInput(String),

    // ── Resources ────────────────────────────────────────────────────
    #[error("Host allocation failed: {0} bytes")]
    Memory(usize),

    #[error("Device allocation failed: {0} bytes")]
    DeviceMemory(usize),

    // ── Effect engine ────────────────────────────────────────────────
    #[error("Unknown or invalid effect: {0}")]
    Effect(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Effect library unavailable: {0}")]
    Library(String),

    #[error("Accelerator initialization failed: {0}")]
    Initialization(String),

    #[error("Accelerator launch failed: {0}")]
    Launch(String),

    #[error("Accelerator driver failure: {0}")]
    Driver(String),

    #[error("Unsupported accelerator device: {0}")]
    UnsupportedDevice(String),

    // ── I/O ──────────────────────────────────────────────────────────
    #[error("Read error: {0}")]
    Read(String),

    #[error("Write error: {0}")]
    Write(String),

    // ── Stage annotation ─────────────────────────────────────────────
    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Stable integer error code.
    ///
    /// Codes are grouped by category:
    /// - 1xx: configuration / selector / format contracts
    /// - 2xx: memory exhaustion (host and device separately)
    /// - 3xx: effect engine
    /// - 4xx: I/O
    ///
    /// A [`Error::Stage`] wrapper is transparent: it reports the code of the
    /// error it annotates.
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Parameter(_) => 100,
            Self::Selector(_) => 101,
            Self::PixelFormat { .. } => 102,
            Self::Resolution(_) => 103,
            Self::Mismatch(_) => 104,
            Self::MissingInput(_) => 105,
            Self::Memory(_) => 200,
            Self::DeviceMemory(_) => 201,
            Self::Effect(_) => 300,
            Self::Model(_) => 301,
            Self::Library(_) => 302,
            Self::Initialization(_) => 303,
            Self::Launch(_) => 304,
            Self::Driver(_) => 305,
            Self::UnsupportedDevice(_) => 306,
            Self::Read(_) => 400,
            Self::Write(_) => 401,
            Self::Stage { source, .. } => source.error_code(),
        }
    }

    /// Annotate this error with the pipeline stage that surfaced it.
    ///
    /// Nested annotations keep the innermost code; the outermost stage name
    /// wins in the rendered message, which matches how the invocation driver
    /// reports bind/run failures.
    pub fn at_stage(self, stage: &'static str) -> Self {
        Self::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// The stage annotation, if any.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            Self::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
