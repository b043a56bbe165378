//! The transport capability a [`ConnectionPool`](crate::ConnectionPool) is
//! built from.
//!
//! A [`Connection`] is anything tonic's generated clients can already talk
//! to, i.e. a `tower` service from HTTP requests with a [`Body`] to HTTP
//! responses with a [`Body`], plus a way to shut it down.
//! [`PooledChannel`], a closable wrapper around a tonic [`Channel`], is the
//! production implementation.

use crate::Error;
use core::{
    future::Future,
    task::{Context, Poll},
};
use futures::future::{Either, ErrInto, Ready, TryFutureExt, ready};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::{
    body::Body,
    codegen::http,
    transport::{Channel, channel::ResponseFuture},
};
use tower::{BoxError, Service};

/// A cheaply clonable handle to one established RPC connection.
///
/// Clones must refer to the same underlying connection: the pool clones a
/// handle for every call it delegates, and closing any clone closes them all.
pub trait Connection:
    Service<
        http::Request<Body>,
        Response = http::Response<Body>,
        Error: Into<BoxError> + Send,
        Future: Send + 'static,
    > + Clone
    + Send
    + Sync
    + 'static
{
    /// Shuts the connection down.
    fn close(&self) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// A tonic [`Channel`] that every clone can shut down.
///
/// tonic has no explicit shutdown for a [`Channel`]: its background
/// connection task runs until the last handle is dropped. All clones of a
/// `PooledChannel` share a single slot holding the channel, and each clone
/// only checks out its own handle from that slot when it is first polled.
/// [`Connection::close`] empties the slot, so once calls already in flight
/// finish no handle remains and the transport stops. Every call made after
/// closing, through any clone, fails with [`Error::Closed`].
#[derive(Debug)]
pub struct PooledChannel {
    slot: Arc<Mutex<Option<Channel>>>,
    closed: CancellationToken,
    handle: Option<Channel>,
}

impl PooledChannel {
    pub fn new(channel: Channel) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(channel))),
            closed: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Clone for PooledChannel {
    // Readiness belongs to a handle, so clones start without one.
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            closed: self.closed.clone(),
            handle: None,
        }
    }
}

impl From<Channel> for PooledChannel {
    fn from(channel: Channel) -> Self {
        Self::new(channel)
    }
}

impl Service<http::Request<Body>> for PooledChannel {
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future = Either<
        ErrInto<ResponseFuture, BoxError>,
        Ready<Result<http::Response<Body>, BoxError>>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.closed.is_cancelled() {
            self.handle = None;
            return Poll::Ready(Err(Error::Closed.into()));
        }
        if self.handle.is_none() {
            self.handle = self.slot.lock().clone();
        }
        match &mut self.handle {
            Some(channel) => channel.poll_ready(cx).map_err(Into::into),
            None => Poll::Ready(Err(Error::Closed.into())),
        }
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        match self.handle.as_mut() {
            Some(channel) if !self.closed.is_cancelled() => {
                Either::Left(channel.call(req).err_into())
            }
            _ => Either::Right(ready(Err(Error::Closed.into()))),
        }
    }
}

impl Connection for PooledChannel {
    async fn close(&self) -> Result<(), BoxError> {
        self.closed.cancel();
        let channel = self.slot.lock().take();
        drop(channel);
        Ok(())
    }
}
