use thiserror::Error;

use crate::catalog::DstPattern;
use crate::hooks::WritePath;
use crate::key::RegisterKey;

/// Failures surfaced by the engine. Only `ShadowOverrun` and
/// `UnterminatedPayload` fault the session; everything else is local to the
/// call that raised it.
#[derive(Debug, Error)]
pub enum EngineError {
    /// One firmware call carried more entries than a shadow buffer holds.
    /// There is no safe way to forward a truncated burst, so the session is
    /// faulted and later writes pass through untouched.
    #[error("shadow buffer overrun on {path:?}: burst exceeds {capacity} entries")]
    ShadowOverrun { path: WritePath, capacity: usize },

    /// A terminated payload ended without its terminator.
    #[error("unterminated register payload on {path:?}")]
    UnterminatedPayload { path: WritePath },

    /// Changing the key grouping while records exist would make their keys
    /// ambiguous.
    #[error("cannot change grouping mode while {records} records are live")]
    GroupingLocked { records: usize },

    /// The presentation layer named a key nothing has written to yet.
    #[error("no record tracked for key {key:?}")]
    UnknownRegister { key: RegisterKey },

    /// The patch service could not hook every configured write path.
    #[error("hook installation failed")]
    Install(#[from] InstallError),
}

/// Startup validation failures in the known-register catalog.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("duplicate catalog entry for ({dst}, {reg:#06x})")]
    DuplicateEntry { dst: DstPattern, reg: u16 },
}

/// Reported by the hook installation service when a patch cannot be applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("could not install {path:?} hook at {address:#010x}: {reason}")]
pub struct InstallError {
    pub path: WritePath,
    pub address: u32,
    pub reason: String,
}
