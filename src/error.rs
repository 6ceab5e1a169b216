//! Crate-level convenience error.
//!
//! A thin wrapper over the per-module capability errors, with a transience
//! classifier the retry layer keys off.

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::endpoint::EndpointError;
use crate::journal::JournalError;
use crate::lock::LockError;
use crate::pipeline::TransferError;
use crate::restore::RestoreError;
use crate::transport::{TransportError, TransportErrorKind};

/// Whether retrying may succeed without changing inputs or state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    Permanent,
    Retryable,
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Journal(#[from] JournalError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Config(_) => Transience::Permanent,
            Error::Endpoint(e) => endpoint_transience(e),
            Error::Transport(e) => transport_transience(e),
            Error::Catalog(CatalogError::Endpoint(e)) => endpoint_transience(e),
            Error::Catalog(_) => Transience::Permanent,
            Error::Transfer(e) => e.transience(),
            Error::Restore(_) => Transience::Permanent,
            Error::Lock(LockError::Held { .. }) => Transience::Unknown,
            Error::Lock(_) => Transience::Permanent,
            Error::Journal(_) => Transience::Permanent,
        }
    }
}

fn endpoint_transience(err: &EndpointError) -> Transience {
    match err {
        EndpointError::Transport(t) => transport_transience(t),
        EndpointError::Io { .. } | EndpointError::CommandFailed { .. } => Transience::Unknown,
        _ => Transience::Permanent,
    }
}

fn transport_transience(err: &TransportError) -> Transience {
    match err.kind {
        TransportErrorKind::Unreachable => Transience::Retryable,
        TransportErrorKind::Protocol => Transience::Unknown,
        _ => Transience::Permanent,
    }
}
