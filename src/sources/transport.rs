use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{ResolveError, Result};

/// Header con la dirección de origen aleatoria.
pub const SOURCE_IP_HEADER: &str = "X-Forwarded-For";

/// Un GET a un mirror upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl UpstreamRequest {
    /// Construye una petición con una dirección de origen aleatoria nueva.
    pub fn new(url: Url, timeout: Duration) -> Self {
        Self {
            url,
            headers: vec![(SOURCE_IP_HEADER.to_string(), random_source_ip())],
            timeout,
        }
    }

    /// `scheme://host` del destino, usado en logs y errores.
    pub fn endpoint(&self) -> String {
        match self.url.host_str() {
            Some(host) => format!("{}://{}", self.url.scheme(), host),
            None => self.url.to_string(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Hace GETs al upstream y retorna el body JSON decodificado.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get_json(&self, request: UpstreamRequest) -> Result<Value>;
}

/// Dirección IPv4 aleatoria con aspecto público.
///
/// Se evitan primeros octetos privados, loopback y multicast para que los
/// mirrors que validan el header no lo descarten.
pub fn random_source_ip() -> String {
    let mut rng = rand::thread_rng();
    let first = loop {
        let candidate: u8 = rng.gen_range(1..=223);
        if !matches!(candidate, 10 | 100 | 127 | 169 | 172 | 192) {
            break candidate;
        }
    };
    format!(
        "{}.{}.{}.{}",
        first,
        rng.gen_range(0..=255u8),
        rng.gen_range(0..=255u8),
        rng.gen_range(1..=254u8)
    )
}

/// Transporte basado en reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get_json(&self, request: UpstreamRequest) -> Result<Value> {
        let endpoint = request.endpoint();
        debug!("🌐 GET {}", request.url);

        let mut builder = self
            .client
            .get(request.url.clone())
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&endpoint, e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ResolveError::RateLimited { endpoint });
        }
        if !status.is_success() {
            return Err(ResolveError::Status {
                endpoint,
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(&endpoint, e))?;

        serde_json::from_str(&body).map_err(|e| ResolveError::UnrecognizedShape {
            endpoint,
            detail: format!("body is not JSON ({}): {}", e, truncate(&body, 120)),
        })
    }
}

fn classify_reqwest_error(endpoint: &str, error: reqwest::Error) -> ResolveError {
    if error.is_timeout() {
        ResolveError::Timeout {
            endpoint: endpoint.to_string(),
        }
    } else {
        ResolveError::Network {
            endpoint: endpoint.to_string(),
            message: error.to_string(),
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
