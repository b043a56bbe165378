use anyhow::{Context, bail};
use chanpool::DialOptions;
use clap::Parser;
use core::time::Duration;
use tonic::transport::Uri;

/// Runtime configuration for the `chanpool-bench` binary.
///
/// Every setting can be given as a CLI flag or an environment variable (a
/// `.env` file in the working directory is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "chanpool-bench",
    version,
    about = "Drive gRPC health checks through a round-robin connection pool"
)]
pub struct CliArgs {
    /// URI of the gRPC server to call.
    ///
    /// Environment variable: `CHANPOOL_TARGET`
    #[arg(long, env = "CHANPOOL_TARGET", default_value_t = String::from("http://127.0.0.1:50051"))]
    pub target: String,

    /// Number of connections in the pool.
    ///
    /// Environment variable: `CHANPOOL_CONNECTIONS`
    #[arg(long, env = "CHANPOOL_CONNECTIONS", default_value_t = 4)]
    pub connections: usize,

    /// Number of concurrent callers sharing the pool.
    ///
    /// Environment variable: `CHANPOOL_CONCURRENCY`
    #[arg(long, env = "CHANPOOL_CONCURRENCY", default_value_t = 64)]
    pub concurrency: usize,

    /// Total number of health checks to issue across all callers.
    ///
    /// Environment variable: `CHANPOOL_REQUESTS`
    #[arg(long, env = "CHANPOOL_REQUESTS", default_value_t = 100_000)]
    pub requests: usize,

    /// Timeout for establishing each connection, in milliseconds.
    ///
    /// Environment variable: `CHANPOOL_CONNECT_TIMEOUT_MS`
    #[arg(long, env = "CHANPOOL_CONNECT_TIMEOUT_MS", default_value_t = 5_000)]
    pub connect_timeout_ms: u64,

    /// Deadline applied to every call, in milliseconds. Unset means no
    /// deadline.
    ///
    /// Environment variable: `CHANPOOL_REQUEST_TIMEOUT_MS`
    #[arg(long, env = "CHANPOOL_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Host a gRPC health server on the target's address before dialing.
    #[arg(short, long, default_value_t = false)]
    pub serve: bool,
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub target: String,
    pub connections: usize,
    pub concurrency: usize,
    pub requests: usize,
    pub dial_options: DialOptions,
    /// Socket address to host the local server on, when `--serve` is set.
    pub serve_addr: Option<String>,
}

impl TryFrom<CliArgs> for BenchConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.connections == 0 {
            bail!("CHANPOOL_CONNECTIONS must be greater than 0");
        }
        if args.concurrency == 0 {
            bail!("CHANPOOL_CONCURRENCY must be greater than 0");
        }
        if args.requests == 0 {
            bail!("CHANPOOL_REQUESTS must be greater than 0");
        }

        let uri: Uri = args
            .target
            .parse()
            .with_context(|| format!("invalid CHANPOOL_TARGET `{}`", args.target))?;

        let serve_addr = if args.serve {
            let authority = uri
                .authority()
                .with_context(|| format!("CHANPOOL_TARGET `{}` has no host:port", args.target))?;
            Some(authority.as_str().to_string())
        } else {
            None
        };

        let mut dial_options = DialOptions::new()
            .with_connect_timeout(Duration::from_millis(args.connect_timeout_ms))
            .with_tcp_nodelay(true);
        if let Some(ms) = args.request_timeout_ms {
            dial_options = dial_options.with_timeout(Duration::from_millis(ms));
        }

        Ok(Self {
            target: args.target,
            connections: args.connections,
            concurrency: args.concurrency,
            requests: args.requests,
            dial_options,
            serve_addr,
        })
    }
}
