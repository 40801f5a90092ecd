use std::time::Duration;

use axum::{body::Body, response::Response};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, Method};
use url::Url;

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

// Connection-level headers, plus those recomputed for the new hop.
const NOT_FORWARDED: [HeaderName; 10] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
    header::CONTENT_LENGTH,
    HeaderName::from_static("keep-alive"),
];

/// Forwards matched requests to their route target.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Sends the request and relays status, headers and body unchanged.
    pub async fn forward(
        &self,
        method: Method,
        target: Url,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, reqwest::Error> {
        let upstream = self
            .client
            .request(method, target)
            .headers(forwardable(headers))
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let headers = forwardable(upstream.headers());
        let body = upstream.bytes().await?;

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in NOT_FORWARDED.iter() {
        forwarded.remove(name);
    }
    forwarded
}
