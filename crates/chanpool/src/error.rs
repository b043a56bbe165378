//! Error types for pool construction and shutdown.
//!
//! Call errors are never represented here: [`invoke`] and [`open_stream`]
//! hand back the selected channel's [`tonic::Status`]. The one exception is
//! `Closed`, which a closed connection raises in place of sending the call
//! and which tonic then reports as a status.
//!
//! ## Error Cases
//! - `ZeroCount`: a pool was requested with zero connections.
//! - `Dial`: establishing one of the connections failed.
//! - `Cancelled`: the caller's cancellation token fired while dialing.
//! - `Closed`: a call was made on a connection after it was closed.
//!
//! [`CloseError`] is returned separately by [`ConnectionPool::close`] and
//! aggregates every connection that failed to close.
//!
//! [`invoke`]: crate::ConnectionPool::invoke
//! [`open_stream`]: crate::ConnectionPool::open_stream
//! [`ConnectionPool::close`]: crate::ConnectionPool::close

use core::fmt;
use tower::BoxError;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors raised while building a [`ConnectionPool`](crate::ConnectionPool)
/// or using one of its connections after shutdown.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The requested number of connections was zero.
    #[error("count must be greater than zero")]
    ZeroCount,

    /// Dialing the connection at `index` failed. Connections dialed before it
    /// have already been closed.
    #[error("failed to dial connection {index}: {source}")]
    Dial {
        index: usize,
        #[source]
        source: BoxError,
    },

    /// The cancellation token was triggered before every connection was
    /// established.
    #[error("dial cancelled")]
    Cancelled,

    /// The connection was closed; no further calls are accepted on it.
    #[error("connection is closed")]
    Closed,
}

/// One or more connections failed to close.
///
/// Every connection in the pool was still asked to close; this value holds
/// the failures only, each tagged with the position of its connection.
#[derive(Debug, Default)]
pub struct CloseError {
    errors: Vec<(usize, BoxError)>,
}

impl CloseError {
    pub(crate) fn push(&mut self, index: usize, err: BoxError) {
        self.errors.push((index, err));
    }

    /// Collapses an empty accumulator into `Ok(())`.
    pub(crate) fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Failures as `(connection position, error)` pairs, in pool order.
    pub fn errors(&self) -> &[(usize, BoxError)] {
        &self.errors
    }

    /// Number of connections that failed to close. Always at least one.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Always `false` for a returned error; present for API symmetry with
    /// [`len`](Self::len).
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_errors(self) -> Vec<(usize, BoxError)> {
        self.errors
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} connection(s) failed to close", self.errors.len())?;
        for (index, err) in &self.errors {
            write!(f, "; connection {index}: {err}")?;
        }
        Ok(())
    }
}

impl core::error::Error for CloseError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        self.errors
            .first()
            .map(|(_, err)| &**err as &(dyn core::error::Error + 'static))
    }
}
