//! Round-robin pool of RPC connections.
//!
//! This module defines [`ConnectionPool`], which owns a fixed set of
//! established [`Connection`]s and hands one out per call in rotation. The
//! rotation cursor is a single atomic counter, so selection never locks and
//! never blocks.
//!
//! The pool is usable in two ways:
//!
//! - Explicitly, via [`ConnectionPool::conn`], [`ConnectionPool::invoke`] and
//!   [`ConnectionPool::open_stream`].
//! - Transparently, as a `tower` [`Service`]. tonic's generated clients accept
//!   any such service, so `FooClient::new(pool)` works wherever
//!   `FooClient::new(channel)` does.

use crate::{CloseError, Connection};
use core::{
    fmt,
    task::{Context, Poll},
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tonic::{
    IntoRequest, IntoStreamingRequest, Response, Status, Streaming,
    body::Body,
    client::Grpc,
    codec::Codec,
    codegen::http::{self, uri::PathAndQuery},
};
use tower::{BoxError, Service, ServiceExt, util::Oneshot};

/// A fixed-size pool of connections to one logical endpoint.
///
/// Cloning the pool is cheap: clones share both the connections and the
/// rotation cursor, so calls made through any clone continue the same
/// rotation.
pub struct ConnectionPool<C> {
    conns: Arc<[C]>,
    idx: Arc<AtomicUsize>,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            conns: Arc::clone(&self.conns),
            idx: Arc::clone(&self.idx),
        }
    }
}

impl<C> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("num_connections", &self.conns.len())
            .field("idx", &self.idx.load(Ordering::Relaxed))
            .finish()
    }
}

impl<C: Connection> ConnectionPool<C> {
    /// Builds a pool that owns `conns`, in the given order.
    ///
    /// Returns `None` when `conns` is empty; a pool always holds at least one
    /// connection.
    pub fn new(conns: Vec<C>) -> Option<Self> {
        if conns.is_empty() {
            return None;
        }
        Some(Self {
            conns: conns.into(),
            idx: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Advances the rotation cursor and returns its new value.
    ///
    /// Uses a relaxed atomic increment: only the atomicity of the counter
    /// matters, not its ordering relative to other memory. Wraps on overflow.
    fn advance(&self) -> usize {
        self.idx.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Returns the next connection in round-robin order.
    ///
    /// Connections are not checked out; the returned handle is shared with
    /// every other caller that lands on the same position.
    pub fn conn(&self) -> &C {
        &self.conns[self.advance() % self.conns.len()]
    }

    /// Number of connections in the pool. Fixed at construction.
    pub fn num_connections(&self) -> usize {
        self.conns.len()
    }

    /// Performs a unary call on the next connection.
    ///
    /// `path` is the full method path (e.g. `/pkg.Service/Method`) and `codec`
    /// the message codec, exactly as generated client code would pass them to
    /// [`Grpc::unary`]. The selected connection's response or status is
    /// returned without retrying on another connection.
    ///
    /// If the connection fails to become ready, the failure is reported as
    /// `Status::unknown("Service was not ready: ..")`, the same status
    /// tonic's generated clients produce in that case.
    pub async fn invoke<M1, M2, Cd>(
        &self,
        request: impl IntoRequest<M1>,
        path: PathAndQuery,
        codec: Cd,
    ) -> Result<Response<M2>, Status>
    where
        Cd: Codec<Encode = M1, Decode = M2>,
        M1: Send + Sync + 'static,
        M2: Send + Sync + 'static,
    {
        let mut grpc = self.ready_grpc().await?;
        grpc.unary(request.into_request(), path, codec).await
    }

    /// Opens a streaming call on the next connection.
    ///
    /// The request is a stream of outbound messages, which covers client
    /// streaming and bidirectional calls; a single-message stream (e.g.
    /// [`tokio_stream::once`]) opens a server-streaming call. The selected
    /// connection's response stream or status is returned; readiness failures
    /// are reported as for [`invoke`](Self::invoke).
    ///
    /// [`tokio_stream::once`]: https://docs.rs/tokio-stream/latest/tokio_stream/fn.once.html
    pub async fn open_stream<R, M2, Cd>(
        &self,
        request: R,
        path: PathAndQuery,
        codec: Cd,
    ) -> Result<Response<Streaming<M2>>, Status>
    where
        R: IntoStreamingRequest,
        R::Message: Send + Sync + 'static,
        Cd: Codec<Encode = R::Message, Decode = M2>,
        M2: Send + Sync + 'static,
    {
        let mut grpc = self.ready_grpc().await?;
        grpc.streaming(request.into_streaming_request(), path, codec)
            .await
    }

    async fn ready_grpc(&self) -> Result<Grpc<C>, Status> {
        let mut grpc = Grpc::new(self.conn().clone());
        grpc.ready().await.map_err(|e| {
            Status::unknown(format!(
                "Service was not ready: {}",
                Into::<BoxError>::into(e)
            ))
        })?;
        Ok(grpc)
    }

    /// Closes every connection in the pool.
    ///
    /// Each connection is asked to close even if an earlier one failed. All
    /// failures are collected into the returned [`CloseError`]; `Ok(())`
    /// means every connection closed cleanly.
    ///
    /// Calls still in flight on other clones of this pool are not waited for.
    /// Whether later calls through those clones are rejected depends on the
    /// connection; a [`PooledChannel`](crate::PooledChannel) rejects them.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(num_connections = self.conns.len())))]
    pub async fn close(self) -> Result<(), CloseError> {
        close_all(&self.conns).await
    }
}

/// Closes each connection in order, accumulating failures.
pub(crate) async fn close_all<C: Connection>(conns: &[C]) -> Result<(), CloseError> {
    let mut errs = CloseError::default();
    for (index, conn) in conns.iter().enumerate() {
        if let Err(e) = conn.close().await {
            #[cfg(feature = "tracing")]
            tracing::warn!("Connection {index} failed to close: {e}");
            errs.push(index, e);
        }
    }
    errs.into_result()
}

impl<C: Connection> Service<http::Request<Body>> for ConnectionPool<C> {
    type Response = http::Response<Body>;
    type Error = <C as Service<http::Request<Body>>>::Error;
    type Future = Oneshot<C, http::Request<Body>>;

    /// Always ready. Readiness of the connection actually chosen is awaited
    /// inside the returned future.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        self.conn().clone().oneshot(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnection;
    use std::collections::HashSet;
    use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};
    use tonic_prost::ProstCodec;

    type HealthCodec = ProstCodec<HealthCheckRequest, HealthCheckResponse>;

    fn ids(pool: &ConnectionPool<MockConnection>, n: usize) -> Vec<usize> {
        (0..n).map(|_| pool.conn().id()).collect()
    }

    fn call_counts(conns: &[MockConnection]) -> Vec<usize> {
        conns.iter().map(MockConnection::calls).collect()
    }

    /// The id of the single connection whose call count rose since `before`.
    fn served_since(conns: &[MockConnection], before: &[usize]) -> usize {
        let served: Vec<_> = conns
            .iter()
            .zip(before)
            .filter(|(conn, before)| conn.calls() > **before)
            .map(|(conn, _)| conn.id())
            .collect();
        assert_eq!(served.len(), 1, "expected exactly one serving connection");
        served[0]
    }

    fn check_request() -> HealthCheckRequest {
        HealthCheckRequest {
            service: String::new(),
        }
    }

    #[test]
    fn empty_pool_is_none() {
        assert!(ConnectionPool::<MockConnection>::new(Vec::new()).is_none());
    }

    #[test]
    fn first_selection_skips_position_zero() {
        let pool = ConnectionPool::new(MockConnection::many(3)).unwrap();
        assert_eq!(ids(&pool, 3), [1, 2, 0]);
    }

    #[test]
    fn two_connections_alternate() {
        let pool = ConnectionPool::new(MockConnection::many(2)).unwrap();
        assert_eq!(ids(&pool, 5), [1, 0, 1, 0, 1]);
    }

    #[test]
    fn rotation_has_period_n() {
        for n in 1..=7 {
            let pool = ConnectionPool::new(MockConnection::many(n)).unwrap();
            let seen = ids(&pool, 4 * n);
            for (i, id) in seen.iter().enumerate() {
                assert_eq!(*id, (i + 1) % n, "pool of {n}, selection {i}");
            }
            for period in seen.chunks_exact(n) {
                let unique: HashSet<_> = period.iter().collect();
                assert_eq!(unique.len(), n);
            }
        }
    }

    #[test]
    fn num_connections_is_fixed() {
        let pool = ConnectionPool::new(MockConnection::many(4)).unwrap();
        assert_eq!(pool.num_connections(), 4);
        ids(&pool, 103);
        assert_eq!(pool.num_connections(), 4);
    }

    #[test]
    fn clones_share_the_cursor() {
        let pool = ConnectionPool::new(MockConnection::many(3)).unwrap();
        let other = pool.clone();
        assert_eq!(pool.conn().id(), 1);
        assert_eq!(other.conn().id(), 2);
        assert_eq!(pool.conn().id(), 0);
    }

    #[test]
    fn concurrent_selections_never_share_a_cursor_value() {
        const THREADS: usize = 16;
        const PER_THREAD: usize = 1_000;
        const CONNS: usize = 4;

        let pool = ConnectionPool::new(MockConnection::many(CONNS)).unwrap();
        let pool = &pool;
        let values: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(move || {
                        (0..PER_THREAD)
                            .map(|_| pool.advance())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        let unique: HashSet<_> = values.iter().copied().collect();
        assert_eq!(values.len(), THREADS * PER_THREAD);
        assert_eq!(unique.len(), values.len());
        assert_eq!(unique, (1..=THREADS * PER_THREAD).collect());
    }

    #[test]
    fn concurrent_selections_spread_evenly() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 300;
        const CONNS: usize = 3;

        let conns = MockConnection::many(CONNS);
        let pool = ConnectionPool::new(conns.clone()).unwrap();
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..PER_THREAD {
                        pool.conn().record_call();
                    }
                });
            }
        });

        for conn in &conns {
            assert_eq!(conn.calls(), THREADS * PER_THREAD / CONNS);
        }
    }

    #[tokio::test]
    async fn close_succeeds_when_every_connection_closes() {
        let conns = MockConnection::many(3);
        let pool = ConnectionPool::new(conns.clone()).unwrap();

        pool.close().await.unwrap();
        for conn in &conns {
            assert_eq!(conn.closes(), 1);
        }
    }

    #[tokio::test]
    async fn close_attempts_every_connection_and_reports_each_failure() {
        let conns: Vec<_> = (0..4)
            .map(|id| MockConnection::new(id).fail_close_if(id % 2 == 1))
            .collect();
        let pool = ConnectionPool::new(conns.clone()).unwrap();

        let err = pool.close().await.unwrap_err();

        for conn in &conns {
            assert_eq!(conn.closes(), 1, "connection {}", conn.id());
        }
        assert_eq!(err.len(), 2);
        let positions: Vec<_> = err.errors().iter().map(|(i, _)| *i).collect();
        assert_eq!(positions, [1, 3]);
        assert_eq!(
            err.errors()[0].1.to_string(),
            "connection 1 refused to close"
        );
    }

    #[tokio::test]
    async fn service_calls_rotate_across_connections() {
        let conns = MockConnection::many(3);
        let pool = ConnectionPool::new(conns.clone()).unwrap();

        let mut served = Vec::new();
        for _ in 0..6 {
            let resp = pool
                .clone()
                .oneshot(http::Request::new(Body::empty()))
                .await
                .unwrap();
            served.push(MockConnection::served_by(&resp));
        }

        assert_eq!(served, [1, 2, 0, 1, 2, 0]);
        for conn in &conns {
            assert_eq!(conn.calls(), 2);
        }
    }

    // The mock replies with an empty body, so calls end in a status; only
    // which connection carried them matters here.
    #[tokio::test]
    async fn invoke_rotates_across_connections() {
        let conns = MockConnection::many(3);
        let pool = ConnectionPool::new(conns.clone()).unwrap();

        let mut served = Vec::new();
        for _ in 0..6 {
            let before = call_counts(&conns);
            let _ = pool
                .invoke(
                    check_request(),
                    PathAndQuery::from_static("/grpc.health.v1.Health/Check"),
                    HealthCodec::default(),
                )
                .await;
            served.push(served_since(&conns, &before));
        }

        assert_eq!(served, [1, 2, 0, 1, 2, 0]);
        assert_eq!(pool.num_connections(), 3);
    }

    #[tokio::test]
    async fn open_stream_rotates_across_connections() {
        let conns = MockConnection::many(3);
        let pool = ConnectionPool::new(conns.clone()).unwrap();

        let mut served = Vec::new();
        for _ in 0..4 {
            let before = call_counts(&conns);
            let _ = pool
                .open_stream(
                    tokio_stream::once(check_request()),
                    PathAndQuery::from_static("/grpc.health.v1.Health/Watch"),
                    HealthCodec::default(),
                )
                .await;
            served.push(served_since(&conns, &before));
        }

        assert_eq!(served, [1, 2, 0, 1]);
        assert_eq!(pool.num_connections(), 3);
    }

    #[tokio::test]
    async fn calls_of_every_kind_share_one_rotation() {
        let conns = MockConnection::many(3);
        let pool = ConnectionPool::new(conns.clone()).unwrap();

        assert_eq!(pool.conn().id(), 1);

        let before = call_counts(&conns);
        let _ = pool
            .invoke(
                check_request(),
                PathAndQuery::from_static("/grpc.health.v1.Health/Check"),
                HealthCodec::default(),
            )
            .await;
        assert_eq!(served_since(&conns, &before), 2);

        let resp = pool
            .clone()
            .oneshot(http::Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(MockConnection::served_by(&resp), 0);

        assert_eq!(pool.conn().id(), 1);
        assert_eq!(pool.num_connections(), 3);
    }
}
