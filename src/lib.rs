//! # hsmlink - YubiHSM2 client over SCP03
//!
//! Host-side client for a YubiHSM2-compatible hardware security module.
//! The library authenticates against the device with the SCP03 secure
//! channel protocol, wraps every command in authenticated AES-CBC
//! encryption, and maintains a pool of live sessions that heals itself as
//! sessions expire or fail.
//!
//! ## Architecture
//!
//! ```text
//! caller                hsmlink                        connector daemon
//!   |                      |                                  |
//!   |  CommandMessage      |                                  |
//!   | -------------------> | SessionManager                   |
//!   |                      |   └─ SecureChannel (SCP03)       |
//!   |                      |        encrypt + CMAC chain      |
//!   |                      | ------- POST /connector/api ---> | --> HSM
//!   |                      | <------------- bytes ----------- | <-- HSM
//!   |                      |        verify + decrypt          |
//!   | <---- Response ----- |                                  |
//! ```
//!
//! The [`SessionManager`] owns up to 16 authenticated [`SecureChannel`]s.
//! A background housekeeper probes each channel every 15 seconds with an
//! echo, retires channels that fail the probe or approach the 10 000
//! message session cap, and authenticates replacements.
//!
//! ## Protocol Overview
//!
//! Session establishment is a two-command ceremony:
//!
//! | Command               | Direction     | Purpose                            |
//! |-----------------------|---------------|------------------------------------|
//! | CREATE_SESSION        | host → device | exchange challenges, get session id |
//! | AUTHENTICATE_SESSION  | host → device | prove key possession (cryptograms)  |
//! | SESSION_MESSAGE       | both          | encrypted, MAC-chained traffic      |
//! | CLOSE_SESSION         | host → device | retire the session                  |
//!
//! Both sides derive three AES-128 session keys (S-ENC, S-MAC, S-RMAC) from
//! the authentication key and the challenge pair via the SCP03 CMAC KDF.
//! Every subsequent command is encrypted under S-ENC with an IV derived
//! from the message counter and authenticated with a CMAC chained over the
//! previous message's full CMAC.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hsmlink::{CommandMessage, HttpConnector, SessionManager};
//! use std::sync::Arc;
//!
//! # async fn run() -> hsmlink::Result<()> {
//! let connector = Arc::new(HttpConnector::new("127.0.0.1:12345"));
//! let manager = SessionManager::new(connector, 1, "password", 4).await?;
//!
//! let response = manager
//!     .send_encrypted(&CommandMessage::sign_data_eddsa(2, b"my test message"))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Single-channel use without the pool:
//!
//! ```rust,ignore
//! use hsmlink::{CommandMessage, HttpConnector, SecureChannel};
//! use std::sync::Arc;
//!
//! # async fn run() -> hsmlink::Result<()> {
//! let connector = Arc::new(HttpConnector::new("127.0.0.1:12345"));
//! let mut channel = SecureChannel::new(connector, 1, "password");
//! channel.authenticate().await?;
//!
//! let echoed = channel.send_encrypted(&CommandMessage::echo(b"hello".to_vec())).await?;
//! channel.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`channel`]: SCP03 secure channel and key derivation
//! - [`pool`]: self-healing session pool
//! - [`command`]: command construction and typed response decoding
//! - [`connector`]: transport abstraction and the HTTP connector
//! - [`config`]: configuration loading
//! - [`error`]: error types and result alias

pub mod channel;
pub mod command;
pub mod config;
pub mod connector;
pub mod error;
pub mod pool;

// Re-exports for convenience
pub use channel::{AuthKey, SecureChannel, SecurityLevel, MAX_MESSAGES_PER_SESSION};
pub use command::{Algorithm, CommandCode, CommandMessage, ListFilter, ObjectType, Response};
pub use config::Config;
pub use connector::{Connector, ConnectorStatus, HttpConnector};
pub use error::{DeviceErrorCode, HsmError, Result};
pub use pool::{SessionManager, MAX_POOL_SIZE};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
