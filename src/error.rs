use thiserror::Error;

use crate::daemon::{HttpError, OpError};
use crate::pkg::PkgError;
use crate::txn::StoreError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Op(#[from] OpError),

    #[error(transparent)]
    Pkg(#[from] PkgError),

    #[error(transparent)]
    Http(#[from] HttpError),
}
