//! Target-forwarding executor used by the tunnel client binary.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HOST;
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::error::BoxError;
use crate::tunnel::RoundTripper;

/// Re-executes tunneled requests against a private HTTP target.
///
/// Rewrites the request URI onto the configured authority and forwards it
/// with a pooled hyper client.
pub struct ForwardingRoundTripper {
    client: Client<HttpConnector, Full<Bytes>>,
    authority: Authority,
}

impl ForwardingRoundTripper {
    pub fn new(authority: Authority) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client, authority }
    }
}

#[async_trait]
impl RoundTripper for ForwardingRoundTripper {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>, BoxError> {
        let mut parts = request.uri().clone().into_parts();
        parts.scheme = Some(Scheme::HTTP);
        parts.authority = Some(self.authority.clone());
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        let uri = Uri::from_parts(parts)?;

        let (mut head, body) = request.into_parts();
        head.uri = uri;
        // The Host header still names the public endpoint; the connector
        // derives the right one from the rewritten URI.
        head.headers.remove(HOST);
        let request = Request::from_parts(head, Full::new(body));

        tracing::debug!(uri = %request.uri(), "forwarding request to target");
        let response = self.client.request(request).await?;

        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(Response::from_parts(parts, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_forwards_to_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let body = "from target";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let authority: Authority = addr.to_string().parse().unwrap();
        let forwarder = ForwardingRoundTripper::new(authority);

        let request = Request::builder()
            .method(Method::GET)
            .uri("/some/path")
            .header(HOST, "public.example.com")
            .body(Bytes::new())
            .unwrap();

        let response = forwarder.round_trip(request).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.body().as_ref(), b"from target");
    }
}
