//! Building a [`ConnectionPool`] by dialing a target several times.
//!
//! [`dial_n`] and [`dial`] open `count` independent tonic channels to the
//! same target, each wrapped in a closable [`PooledChannel`]. [`dial_n_with`]
//! does the same through any [`Dialer`], which is how custom transports (or
//! tests) plug in.
//!
//! Dials run one after another. The first failure aborts construction; any
//! connections opened before it are closed before the error is returned, so
//! a failed dial never leaks connections.

use crate::{Connection, ConnectionPool, Error, PooledChannel, Result, pool::close_all};
use core::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tower::BoxError;

/// Establishes a single connection to a target.
pub trait Dialer {
    type Connection: Connection;

    fn dial(&self, target: &str) -> impl Future<Output = Result<Self::Connection, BoxError>> + Send;
}

/// Transport settings applied to every channel dialed by [`TonicDialer`].
///
/// Unset fields keep tonic's defaults. Options are passed through to
/// [`Endpoint`] unchanged; the pool never inspects them.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub connect_timeout: Option<Duration>,
    pub timeout: Option<Duration>,
    pub tcp_nodelay: Option<bool>,
    pub tcp_keepalive: Option<Duration>,
    pub http2_keep_alive_interval: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
    pub keep_alive_while_idle: Option<bool>,
    pub concurrency_limit: Option<usize>,
    pub initial_stream_window_size: Option<u32>,
    pub initial_connection_window_size: Option<u32>,
    pub http2_adaptive_window: Option<bool>,
    pub user_agent: Option<String>,
    /// Create channels without connecting. The first call on each channel
    /// establishes the connection, so unreachable targets only surface as
    /// call errors.
    pub lazy: bool,
}

impl DialOptions {
    pub const fn new() -> Self {
        Self {
            connect_timeout: None,
            timeout: None,
            tcp_nodelay: None,
            tcp_keepalive: None,
            http2_keep_alive_interval: None,
            keep_alive_timeout: None,
            keep_alive_while_idle: None,
            concurrency_limit: None,
            initial_stream_window_size: None,
            initial_connection_window_size: None,
            http2_adaptive_window: None,
            user_agent: None,
            lazy: false,
        }
    }

    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Deadline applied to every request sent over the channel.
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub const fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = Some(enabled);
        self
    }

    pub const fn with_tcp_keepalive(mut self, interval: Duration) -> Self {
        self.tcp_keepalive = Some(interval);
        self
    }

    pub const fn with_http2_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.http2_keep_alive_interval = Some(interval);
        self
    }

    pub const fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = Some(timeout);
        self
    }

    pub const fn with_keep_alive_while_idle(mut self, enabled: bool) -> Self {
        self.keep_alive_while_idle = Some(enabled);
        self
    }

    /// Maximum number of in-flight requests per channel.
    pub const fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub const fn with_initial_stream_window_size(mut self, size: u32) -> Self {
        self.initial_stream_window_size = Some(size);
        self
    }

    pub const fn with_initial_connection_window_size(mut self, size: u32) -> Self {
        self.initial_connection_window_size = Some(size);
        self
    }

    pub const fn with_http2_adaptive_window(mut self, enabled: bool) -> Self {
        self.http2_adaptive_window = Some(enabled);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub const fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Applies every set option to `endpoint`.
    ///
    /// # Errors
    ///
    /// Fails if the user agent is not a valid header value.
    pub fn apply(&self, mut endpoint: Endpoint) -> Result<Endpoint, tonic::transport::Error> {
        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        if let Some(timeout) = self.timeout {
            endpoint = endpoint.timeout(timeout);
        }
        if let Some(enabled) = self.tcp_nodelay {
            endpoint = endpoint.tcp_nodelay(enabled);
        }
        if let Some(interval) = self.tcp_keepalive {
            endpoint = endpoint.tcp_keepalive(Some(interval));
        }
        if let Some(interval) = self.http2_keep_alive_interval {
            endpoint = endpoint.http2_keep_alive_interval(interval);
        }
        if let Some(timeout) = self.keep_alive_timeout {
            endpoint = endpoint.keep_alive_timeout(timeout);
        }
        if let Some(enabled) = self.keep_alive_while_idle {
            endpoint = endpoint.keep_alive_while_idle(enabled);
        }
        if let Some(limit) = self.concurrency_limit {
            endpoint = endpoint.concurrency_limit(limit);
        }
        if let Some(size) = self.initial_stream_window_size {
            endpoint = endpoint.initial_stream_window_size(size);
        }
        if let Some(size) = self.initial_connection_window_size {
            endpoint = endpoint.initial_connection_window_size(size);
        }
        if let Some(enabled) = self.http2_adaptive_window {
            endpoint = endpoint.http2_adaptive_window(enabled);
        }
        if let Some(user_agent) = &self.user_agent {
            endpoint = endpoint.user_agent(user_agent.clone())?;
        }
        Ok(endpoint)
    }
}

/// Dials tonic [`Channel`]s with a fixed set of [`DialOptions`] and wraps each
/// in a [`PooledChannel`].
#[derive(Debug, Clone, Default)]
pub struct TonicDialer {
    options: DialOptions,
}

impl TonicDialer {
    pub const fn new(options: DialOptions) -> Self {
        Self { options }
    }

    pub const fn options(&self) -> &DialOptions {
        &self.options
    }
}

impl Dialer for TonicDialer {
    type Connection = PooledChannel;

    async fn dial(&self, target: &str) -> Result<PooledChannel, BoxError> {
        let endpoint = self.options.apply(Endpoint::from_shared(target.to_string())?)?;
        let channel: Channel = if self.options.lazy {
            endpoint.connect_lazy()
        } else {
            endpoint.connect().await?
        };
        Ok(PooledChannel::new(channel))
    }
}

/// Opens `count` connections to `target` through `dialer` and pools them.
///
/// Connections are dialed sequentially. If `cancel` fires while a dial is
/// pending, construction stops with [`Error::Cancelled`].
///
/// # Errors
///
/// - [`Error::ZeroCount`] if `count` is zero.
/// - [`Error::Dial`] with the dialer's error for the first dial that fails.
/// - [`Error::Cancelled`] if `cancel` is triggered.
///
/// On any error, connections dialed so far are closed before returning.
#[cfg_attr(feature = "tracing", tracing::instrument(skip(dialer, cancel)))]
pub async fn dial_n_with<D: Dialer>(
    dialer: &D,
    cancel: &CancellationToken,
    target: &str,
    count: usize,
) -> Result<ConnectionPool<D::Connection>> {
    if count == 0 {
        return Err(Error::ZeroCount);
    }

    let mut conns = Vec::with_capacity(count);
    for index in 0..count {
        let dialed = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            res = dialer.dial(target) => res.map_err(|source| Error::Dial { index, source }),
        };

        match dialed {
            Ok(conn) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Dialed connection {index}");
                conns.push(conn);
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Dial aborted at connection {index}: {e}");
                release(&conns).await;
                return Err(e);
            }
        }
    }

    ConnectionPool::new(conns).ok_or(Error::ZeroCount)
}

/// Best-effort close of connections from an aborted dial.
async fn release<C: Connection>(conns: &[C]) {
    if conns.is_empty() {
        return;
    }
    #[cfg(feature = "tracing")]
    tracing::debug!("Closing {} connection(s) from aborted dial", conns.len());
    if let Err(_e) = close_all(conns).await {
        #[cfg(feature = "tracing")]
        tracing::warn!("Cleanup after aborted dial: {_e}");
    }
}

/// Opens `count` tonic channels to `target` with `options`.
///
/// `target` is a URI such as `http://127.0.0.1:50051`. See [`dial_n_with`]
/// for error and cancellation behavior.
pub async fn dial_n(
    cancel: &CancellationToken,
    target: &str,
    count: usize,
    options: DialOptions,
) -> Result<ConnectionPool<PooledChannel>> {
    dial_n_with(&TonicDialer::new(options), cancel, target, count).await
}

/// [`dial_n`] without cancellation.
pub async fn dial(
    target: &str,
    count: usize,
    options: DialOptions,
) -> Result<ConnectionPool<PooledChannel>> {
    dial_n(&CancellationToken::new(), target, count, options).await
}
