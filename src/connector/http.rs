//! HTTP connector client.
//!
//! Talks to the stock connector daemon: commands are POSTed to
//! `/connector/api` as an octet stream and the status report is a GET of
//! `/connector/status`.

use std::future::Future;
use std::pin::Pin;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;

use crate::error::{HsmError, Result};

use super::{Connector, ConnectorStatus};

/// Connector over HTTP, addressed as `host:port`.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    base_url: String,
    client: reqwest::Client,
}

impl HttpConnector {
    /// Create a connector client for `addr` (`host:port`, no scheme).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            base_url: format!("http://{}", addr.into()),
            client: reqwest::Client::new(),
        }
    }

    /// The connector endpoint including scheme.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Connector for HttpConnector {
    fn request(
        &self,
        command: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + '_>> {
        Box::pin(async move {
            let response = self
                .client
                .post(format!("{}/connector/api", self.base_url))
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(command)
                .send()
                .await?;

            if response.status() != StatusCode::OK {
                return Err(HsmError::Transport(format!(
                    "connector returned status {}",
                    response.status()
                )));
            }

            Ok(response.bytes().await?.to_vec())
        })
    }

    fn status(&self) -> Pin<Box<dyn Future<Output = Result<ConnectorStatus>> + Send + '_>> {
        Box::pin(async move {
            let response = self
                .client
                .get(format!("{}/connector/status", self.base_url))
                .send()
                .await?;

            if response.status() != StatusCode::OK {
                return Err(HsmError::Transport(format!(
                    "connector returned status {}",
                    response.status()
                )));
            }

            ConnectorStatus::parse(&response.text().await?)
        })
    }
}
