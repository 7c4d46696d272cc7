//! HTTP probe implementation.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{Prober, RawResponse, TransportError, TransportErrorKind};
use crate::db::{HttpMethod, Service};

/// Matches the default service timeout.
const DEFAULT_TIMEOUT_S: u32 = 5;

/// Prober backed by shared `reqwest::Client`s, one per distinct timeout.
///
/// Redirects are followed and TLS certificates are verified. The timeout
/// bounds connecting and each read separately, so a stalled connect is
/// reported as a connect timeout and a stalled response as a read timeout.
#[derive(Clone)]
pub struct HttpProber {
    clients: Arc<Mutex<HashMap<u32, reqwest::Client>>>,
}

impl HttpProber {
    pub fn new() -> Result<Self, reqwest::Error> {
        // Built eagerly so a broken TLS setup fails at startup.
        let client = build_client(DEFAULT_TIMEOUT_S)?;
        Ok(Self {
            clients: Arc::new(Mutex::new(HashMap::from([(DEFAULT_TIMEOUT_S, client)]))),
        })
    }

    fn client(&self, timeout_s: u32) -> Result<reqwest::Client, reqwest::Error> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&timeout_s) {
            return Ok(client.clone());
        }
        let client = build_client(timeout_s)?;
        clients.insert(timeout_s, client.clone());
        Ok(client)
    }
}

fn build_client(timeout_s: u32) -> Result<reqwest::Client, reqwest::Error> {
    let timeout = Duration::from_secs(u64::from(timeout_s));
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent(concat!("healthtrail/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .build()
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, service: &Service) -> Result<RawResponse, TransportError> {
        let url = service.health_url();
        let parsed = reqwest::Url::parse(&url).map_err(|e| {
            TransportError::new(
                TransportErrorKind::NonTransport,
                format!("invalid URL {}: {}", url, e),
            )
        })?;
        let headers = build_headers(&service.headers)?;
        let timeout_s = service.timeout_s.max(1);
        let client = self.client(timeout_s).map_err(classify)?;

        let response = client
            .request(to_reqwest_method(service.method), parsed)
            .headers(headers)
            .send()
            .await
            .map_err(classify)?;

        let status_code = response.status().as_u16();
        let mut response_headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            response_headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        // Read the full body to measure complete transfer time
        response.bytes().await.map_err(classify)?;

        Ok(RawResponse {
            status_code,
            headers: response_headers,
        })
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
    }
}

fn build_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            TransportError::new(
                TransportErrorKind::NonTransport,
                format!("invalid header name {:?}", name),
            )
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|_| {
            TransportError::new(
                TransportErrorKind::NonTransport,
                format!("invalid value for header {:?}", name),
            )
        })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Map a reqwest failure onto the transport error taxonomy.
fn classify(err: reqwest::Error) -> TransportError {
    let kind = if err.is_builder() {
        TransportErrorKind::NonTransport
    } else if err.is_timeout() {
        if err.is_connect() {
            TransportErrorKind::ConnectTimeout
        } else {
            TransportErrorKind::ReadTimeout
        }
    } else if err.is_connect() {
        TransportErrorKind::ConnectError
    } else if err.is_body() || err.is_decode() {
        TransportErrorKind::ReadError
    } else if err.is_redirect() {
        TransportErrorKind::OtherTransport
    } else if err.is_request() {
        TransportErrorKind::ProtocolError
    } else {
        TransportErrorKind::OtherTransport
    };

    TransportError::new(kind, error_chain(&err))
}

fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
