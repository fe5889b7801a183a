use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use url::Url;

use super::{ApiPath, HttpError, Transport};

/// `Transport` over reqwest against a fixed API base.
pub struct HttpTransport {
    client: Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, HttpError> {
        let base = Url::parse(base)
            .map_err(|e| HttpError::transport(format!("invalid api base {}: {}", base, e)))?;
        if base.cannot_be_a_base() {
            return Err(HttpError::transport(format!("invalid api base {}", base)));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::transport(format!("http client setup failed: {}", e)))?;
        Ok(Self { client, base })
    }

    pub fn url_for(&self, path: &ApiPath) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segs) = url.path_segments_mut() {
            segs.pop_if_empty().extend(path.segments());
        }
        url
    }

    async fn send(&self, req: RequestBuilder) -> Result<Value, HttpError> {
        let resp = req
            .send()
            .await
            .map_err(|e| HttpError::transport(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| HttpError::transport(e.to_string()))?;

        if !status.is_success() {
            let body = serde_json::from_str(&text).unwrap_or(Value::Null);
            return Err(HttpError::from_response(status.as_u16(), &body));
        }
        serde_json::from_str(&text).map_err(HttpError::malformed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &ApiPath) -> Result<Value, HttpError> {
        self.send(self.client.get(self.url_for(path))).await
    }

    async fn post(&self, path: &ApiPath, body: Option<Value>) -> Result<Value, HttpError> {
        let mut req = self.client.post(self.url_for(path));
        if let Some(body) = body {
            req = req.json(&body);
        }
        self.send(req).await
    }
}
