//! Connector transport abstraction.
//!
//! The device does not speak IP itself; a connector daemon bridges between
//! HTTP (or USB) and the device. The secure channel only needs two verbs
//! from it, captured by the [`Connector`] trait, so the channel and pool
//! stay transport-agnostic.

mod http;

pub use http::HttpConnector;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::error::{HsmError, Result};

/// Transport trait for pluggable connector backends.
pub trait Connector: Send + Sync {
    /// Exchange one serialized command for one raw response frame.
    fn request(
        &self,
        command: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + '_>>;

    /// Fetch the connector's status report.
    fn status(&self) -> Pin<Box<dyn Future<Output = Result<ConnectorStatus>> + Send + '_>>;
}

/// Status report of a connector daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorStatus {
    pub status: String,
    pub serial: String,
    pub version: String,
    pub pid: String,
    pub address: String,
    pub port: String,
}

impl ConnectorStatus {
    /// Whether the connector reports a device attached and reachable.
    pub fn is_ok(&self) -> bool {
        self.status == "OK"
    }

    /// Parse the newline-separated `key=value` status body.
    pub fn parse(body: &str) -> Result<Self> {
        let pairs: HashMap<&str, &str> = body
            .lines()
            .filter_map(|line| line.split_once('='))
            .collect();

        let field = |key: &str| -> Result<String> {
            pairs
                .get(key)
                .map(|value| value.trim().to_string())
                .ok_or_else(|| HsmError::Transport(format!("status body is missing `{key}`")))
        };

        Ok(Self {
            status: field("status")?,
            serial: field("serial")?,
            version: field("version")?,
            pid: field("pid")?,
            address: field("address")?,
            port: field("port")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_body() {
        let body = "status=OK\nserial=*\nversion=2.2.0\npid=86955\naddress=localhost\nport=12345\n";
        let status = ConnectorStatus::parse(body).unwrap();

        assert!(status.is_ok());
        assert_eq!(status.version, "2.2.0");
        assert_eq!(status.address, "localhost");
        assert_eq!(status.port, "12345");
    }

    #[test]
    fn test_parse_status_missing_field() {
        let result = ConnectorStatus::parse("status=OK\nserial=*\n");
        assert!(matches!(result, Err(HsmError::Transport(_))));
    }

    #[test]
    fn test_parse_status_ignores_malformed_lines() {
        let body = "status=NO_DEVICE\nnoise\nserial=1\nversion=2\npid=3\naddress=4\nport=5";
        let status = ConnectorStatus::parse(body).unwrap();
        assert!(!status.is_ok());
        assert_eq!(status.status, "NO_DEVICE");
    }
}
