//! Minimal HTTP/1.1 client over [`ConnectionArgs`]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tracing::{debug, instrument};

use crate::error::{Result, RotaError};
use crate::proxy::headers::HeaderSet;
use crate::proxy::transport::{with_deadline, ConnectionArgs};

/// Hop-by-hop headers that are never forwarded
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Send one request over a fresh connection from `args` and collect the response
#[instrument(skip(args, body), fields(method = %args.method, path = %args.path))]
pub async fn send_request(args: &ConnectionArgs, body: Bytes) -> Result<Response<Bytes>> {
    let stream = args.create_connection().await?;

    let io = TokioIo::new(stream);
    let mut builder = hyper::client::conn::http1::Builder::new();
    builder.title_case_headers(true);
    let (mut sender, conn) = with_deadline(args.timeout, async {
        builder
            .handshake::<_, Full<Bytes>>(io)
            .await
            .map_err(RotaError::from)
    })
    .await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Connection ended: {}", e);
        }
    });

    let mut request = Request::builder()
        .method(args.method.clone())
        .uri(args.path.as_str())
        .body(Full::new(body))
        .map_err(|e| RotaError::Http(format!("Failed to build request: {}", e)))?;

    let headers = args
        .headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop_header(name))
        .collect::<HeaderSet>();
    *request.headers_mut() = headers.to_header_map()?;

    let response = with_deadline(args.timeout, async {
        sender.send_request(request).await.map_err(RotaError::from)
    })
    .await?;

    let (parts, body) = response.into_parts();
    let body = with_deadline(args.timeout, async {
        body.collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(RotaError::from)
    })
    .await?;

    debug!(status = parts.status.as_u16(), bytes = body.len(), "Response received");
    Ok(Response::from_parts(parts, body))
}
