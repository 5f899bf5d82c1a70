//! Read-only local administrative socket (spec §4.6). A `tower::Layer`
//! wraps the gRPC router bound to the Unix socket listener and rejects any
//! call whose method name doesn't start with an allowed verb or isn't on
//! the explicit allow-list, before the request reaches the service impl.

use std::task::{Context, Poll};

use tonic::body::BoxBody;
use tonic::Status;
use tower::{Layer, Service};

const ALLOWED_PREFIXES: &[&str] = &["List", "Get", "Inspect", "Watch", "Describe", "Show"];
const ALLOWED_METHODS: &[&str] = &["StreamEvents", "GetClusterInfo", "GetNodeInfo", "GetServiceInfo"];

fn method_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_read_only(path: &str) -> bool {
    let method = method_name(path);
    ALLOWED_PREFIXES.iter().any(|p| method.starts_with(p)) || ALLOWED_METHODS.contains(&method)
}

#[derive(Clone)]
pub struct ReadOnlyLayer;

impl<S> Layer<S> for ReadOnlyLayer {
    type Service = ReadOnlyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ReadOnlyService { inner }
    }
}

#[derive(Clone)]
pub struct ReadOnlyService<S> {
    inner: S,
}

impl<S> Service<http::Request<BoxBody>> for ReadOnlyService<S>
where
    S: Service<http::Request<BoxBody>, Response = http::Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<BoxBody>) -> Self::Future {
        if is_read_only(req.uri().path()) {
            let mut inner = self.inner.clone();
            Box::pin(async move { inner.call(req).await })
        } else {
            Box::pin(async move {
                let status = Status::permission_denied(
                    "write RPCs are not permitted on the local admin socket; authenticate over TCP + mTLS",
                );
                Ok(status.to_http())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_list_and_get_prefixed_methods() {
        assert!(is_read_only("/warren.ClusterService/ListServices"));
        assert!(is_read_only("/warren.ClusterService/GetService"));
    }

    #[test]
    fn allows_explicit_allow_list_entries() {
        assert!(is_read_only("/warren.ClusterService/StreamEvents"));
        assert!(is_read_only("/warren.ClusterService/GetClusterInfo"));
    }

    #[test]
    fn rejects_write_methods() {
        assert!(!is_read_only("/warren.ClusterService/CreateService"));
        assert!(!is_read_only("/warren.ClusterService/DeleteSecret"));
    }
}
