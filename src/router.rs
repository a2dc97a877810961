// HTTP route table
// Patterns ending in '/' match every path below them; the longest match wins

use crate::error::ServerError;
use bytes::Bytes;
use http::{Request, Response, StatusCode, header};
use http_body_util::Full;
use hyper::body::Incoming;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type ResponseBody = Full<Bytes>;
pub type HttpResponse = Response<ResponseBody>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HttpResponse> + Send>>;

pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request<Incoming>) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    fn call(&self, request: Request<Incoming>) -> HandlerFuture {
        Box::pin(self(request))
    }
}

pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[derive(Default, Clone)]
pub struct RouteTable {
    exact: HashMap<String, Arc<dyn Handler>>,
    // Kept sorted longest-first so the first hit is the most specific one
    prefixes: Vec<(String, Arc<dyn Handler>)>,
}

impl RouteTable {
    pub fn new() -> Self {
        RouteTable::default()
    }

    pub fn insert<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<(), ServerError> {
        self.insert_shared(pattern, Arc::new(handler))
    }

    pub fn insert_shared(
        &mut self,
        pattern: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), ServerError> {
        if !pattern.starts_with('/') {
            return Err(ServerError::config(format!(
                "route pattern {:?} must start with '/'",
                pattern
            )));
        }

        if self.contains(pattern) {
            return Err(ServerError::config(format!(
                "route pattern {:?} is already registered",
                pattern
            )));
        }

        if pattern.ends_with('/') {
            self.prefixes.push((pattern.to_string(), handler));
            self.prefixes
                .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
        } else {
            self.exact.insert(pattern.to_string(), handler);
        }

        Ok(())
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.exact.contains_key(pattern) || self.prefixes.iter().any(|(p, _)| p == pattern)
    }

    /// Resolves a request path to its registered pattern and handler.
    pub fn lookup(&self, path: &str) -> Option<(&str, &Arc<dyn Handler>)> {
        if let Some((pattern, handler)) = self.exact.get_key_value(path) {
            return Some((pattern.as_str(), handler));
        }

        self.prefixes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(prefix, handler)| (prefix.as_str(), handler))
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
