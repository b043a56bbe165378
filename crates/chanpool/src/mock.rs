use crate::Connection;
use core::task::{Context, Poll};
use futures::future::{Ready, ready};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tonic::{body::Body, codegen::http};
use tower::{BoxError, Service};

const SERVED_BY: &str = "x-served-by";

/// An in-memory [`Connection`] that counts calls and closes, and tags every
/// response with its own id.
#[derive(Clone, Debug)]
pub(crate) struct MockConnection {
    id: usize,
    fail_close: bool,
    calls: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl MockConnection {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            fail_close: false,
            calls: Arc::default(),
            closes: Arc::default(),
        }
    }

    pub(crate) fn many(n: usize) -> Vec<Self> {
        (0..n).map(Self::new).collect()
    }

    pub(crate) fn fail_close_if(mut self, fail: bool) -> Self {
        self.fail_close = fail;
        self
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }

    pub(crate) fn served_by(resp: &http::Response<Body>) -> usize {
        resp.headers()[SERVED_BY]
            .to_str()
            .unwrap()
            .parse()
            .unwrap()
    }
}

impl Service<http::Request<Body>> for MockConnection {
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: http::Request<Body>) -> Self::Future {
        self.record_call();
        let mut resp = http::Response::new(Body::empty());
        resp.headers_mut()
            .insert(SERVED_BY, http::HeaderValue::from(self.id));
        ready(Ok(resp))
    }
}

impl Connection for MockConnection {
    async fn close(&self) -> Result<(), BoxError> {
        self.closes.fetch_add(1, Ordering::Relaxed);
        if self.fail_close {
            Err(format!("connection {} refused to close", self.id).into())
        } else {
            Ok(())
        }
    }
}
