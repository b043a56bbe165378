//! Local gRPC health server used as a load target with `--serve`.

use tokio::{net::TcpListener, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::server::HealthReporter;

/// A running health server and the handle needed to stop it.
pub struct LocalServer {
    pub addr: String,
    // Serving status handle, held for the lifetime of the server.
    _reporter: HealthReporter,
    handle: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl LocalServer {
    /// Binds `addr` and serves `grpc.health.v1.Health` until `shutdown` fires.
    ///
    /// The overall server status (empty service name) reports `SERVING`.
    pub async fn start(addr: &str, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?.to_string();
        let (reporter, health_service) = tonic_health::server::health_reporter();

        let handle = tokio::spawn(async move {
            Server::builder()
                .http2_adaptive_window(Some(true))
                .add_service(health_service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    shutdown.cancelled().await;
                    tracing::info!("Local health server shutting down");
                })
                .await
        });

        tracing::info!("Serving gRPC health checks on {addr}");
        Ok(Self {
            addr,
            _reporter: reporter,
            handle,
        })
    }

    /// Waits for the server task to finish after its shutdown token fired.
    pub async fn join(self) -> anyhow::Result<()> {
        self.handle.await??;
        Ok(())
    }
}
