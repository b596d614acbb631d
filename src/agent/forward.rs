use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use reqwest::Client;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::RequestFailure;
use crate::protocol::RequestSpec;

/// Headers that describe a single hop and must not be relayed
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Local response whose headers are known and whose body is still streaming
pub struct LocalResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Read with [`reqwest::Response::chunk`]; dropping it closes the connection
    pub body: reqwest::Response,
}

/// Executes relayed requests against `localhost:{port}`
pub struct LocalForwarder {
    client: Client,
    port: u16,
}

impl LocalForwarder {
    pub fn new(port: u16, connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self { client, port })
    }

    pub fn authority(&self) -> String {
        format!("localhost:{}", self.port)
    }

    /// Send the request and return as soon as response headers arrive.
    ///
    /// Any failure before headers is reported as
    /// [`RequestFailure::LocalConnectionRefused`]; it is never retried.
    pub async fn send(&self, spec: RequestSpec) -> Result<LocalResponse, RequestFailure> {
        let authority = self.authority();
        let url = format!("http://{}{}", authority, spec.path);

        let mut header_map = HeaderMap::with_capacity(spec.headers.len() + 1);
        for (name, value) in spec.headers {
            if is_hop_by_hop(&name) || name.eq_ignore_ascii_case("host") {
                continue;
            }

            if let (Ok(header_name), Ok(header_value)) =
                (HeaderName::from_str(&name), HeaderValue::from_str(&value))
            {
                header_map.append(header_name, header_value);
            } else {
                debug!("{}: dropping unrepresentable header {}", spec.id, name);
            }
        }
        if let Ok(host) = HeaderValue::from_str(&authority) {
            header_map.insert(HOST, host);
        }

        let mut request = self.client.request(spec.method, &url).headers(header_map);
        if let Some(body) = spec.body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| {
            let kind = if e.is_connect() {
                "connect"
            } else if e.is_timeout() {
                "timeout"
            } else {
                "request"
            };
            RequestFailure::LocalConnectionRefused(format!("{} error: {}", kind, e))
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(LocalResponse {
            status,
            headers,
            body: response,
        })
    }
}
