// src/capture/error.rs
//! Typed capture-layer errors, in the teacher/pack's `SourceError` shape
//! (`liveshark-core::source::SourceError`): an `Io` variant via `#[from]`
//! plus named variants for the fatal-at-startup cases (§7: "Configuration"/
//! "Permission" error kinds).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pcap parse error: {0}")]
    Pcap(String),
    #[error("capture interface not found: {0}")]
    InterfaceNotFound(String),
    #[error("permission denied opening capture device: {0}")]
    PermissionDenied(String),
    #[error("transient capture error: {0}")]
    Transient(String),
}

impl CaptureError {
    /// True for the two error kinds that are fatal at startup (§7); all
    /// others are surfaced as a `capture_error` observer event and halt
    /// only the source, leaving aggregated state intact.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, CaptureError::InterfaceNotFound(_) | CaptureError::PermissionDenied(_))
    }
}
