//! SCP03 secure channel.
//!
//! A channel is established in two steps: CREATE_SESSION carries the host
//! challenge and returns the card challenge plus a card cryptogram, then
//! AUTHENTICATE_SESSION proves the host holds the same authentication key.
//! Both cryptograms and the three session keys come out of the SCP03 KDF
//! over the challenge pair.
//!
//! After authentication every command is wrapped in a SESSION_MESSAGE:
//!
//! ```text
//! host                                          device
//!  |  05 | len | sid | AES-CBC(inner) | CMAC8     |
//!  | ----------------------------------------->  |
//!  |  85 | len | sid | AES-CBC(inner') | CMAC8    |
//!  | <-----------------------------------------  |
//! ```
//!
//! The CMACs chain: each one is computed over the full 16-byte CMAC of the
//! previous MACed message, which totally orders the traffic on a channel.
//! The CBC IV is the encrypted message counter, so the counter must advance
//! once per exchange even when the exchange itself fails.
//!
//! # State machine
//!
//! ```text
//!                 authenticate()
//! [Unauthenticated] ──────────> [Authenticated]
//!   (a failed ceremony leaves         │ close() / counter cap /
//!    the state unchanged)             v failed exchange
//!                                  [Closed]
//! ```

mod authkey;
mod crypto;
mod padding;

pub use authkey::{AuthKey, KeyChain, AUTH_KEY_LENGTH, KEY_LENGTH};
pub use padding::{pad, unpad, BLOCK_SIZE};

pub(crate) use crypto::{cbc_decrypt, cbc_encrypt, chained_mac, derive_iv, kdf, kdf_label};

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::command::{
    CommandCode, CommandMessage, Response, CHALLENGE_LENGTH, CRYPTOGRAM_LENGTH, MAC_LENGTH,
};
use crate::connector::Connector;
use crate::error::{HsmError, Result};

/// Hard cap on encrypted exchanges per session
pub const MAX_MESSAGES_PER_SESSION: u32 = 10_000;

/// Authentication state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    /// Constructed, no session established
    Unauthenticated,
    /// Mutual authentication completed; encrypted sends allowed
    Authenticated,
    /// Terminal: closed, exhausted, or poisoned by a failed exchange
    Closed,
}

/// One SCP03 session with the device.
///
/// A channel is single-writer: every mutating operation takes `&mut self`,
/// and the session pool wraps each channel in its own async mutex so one
/// MAC-chained exchange runs at a time.
pub struct SecureChannel {
    connector: Arc<dyn Connector>,
    auth_key_slot: u16,
    auth_key: AuthKey,
    keychain: Option<KeyChain>,

    session_id: u8,
    counter: u32,
    security_level: SecurityLevel,

    host_challenge: [u8; CHALLENGE_LENGTH],
    device_challenge: [u8; CHALLENGE_LENGTH],

    /// Full CMAC of the last MACed command, chained into the next one
    mac_chain_value: [u8; BLOCK_SIZE],
}

impl SecureChannel {
    /// Set up a channel against the auth key in `auth_key_slot`.
    ///
    /// Samples a fresh host challenge from the OS RNG. Call
    /// [`authenticate`](Self::authenticate) next to establish the session.
    pub fn new(connector: Arc<dyn Connector>, auth_key_slot: u16, password: &str) -> Self {
        Self::with_auth_key(connector, auth_key_slot, AuthKey::derive(password))
    }

    /// Like [`new`](Self::new) but with raw key material.
    pub fn with_auth_key(
        connector: Arc<dyn Connector>,
        auth_key_slot: u16,
        auth_key: AuthKey,
    ) -> Self {
        let mut host_challenge = [0u8; CHALLENGE_LENGTH];
        OsRng.fill_bytes(&mut host_challenge);

        Self {
            connector,
            auth_key_slot,
            auth_key,
            keychain: None,
            session_id: 0,
            counter: 0,
            security_level: SecurityLevel::Unauthenticated,
            host_challenge,
            device_challenge: [0u8; CHALLENGE_LENGTH],
            mac_chain_value: [0u8; BLOCK_SIZE],
        }
    }

    /// Session id assigned by the device; meaningful once authenticated.
    pub fn session_id(&self) -> u8 {
        self.session_id
    }

    /// Number of the next encrypted exchange on this session.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    /// Run the SCP03 authentication ceremony.
    ///
    /// On failure the channel stays `Unauthenticated` and the error is
    /// surfaced; callers that do not retry should drop the channel.
    pub async fn authenticate(&mut self) -> Result<()> {
        if self.security_level != SecurityLevel::Unauthenticated {
            return Err(HsmError::AuthFailed(
                "channel is not in the unauthenticated state".to_string(),
            ));
        }

        self.run_ceremony().await?;

        // Counter starts at 1 as specified by the protocol
        self.counter = 1;
        self.security_level = SecurityLevel::Authenticated;
        Ok(())
    }

    async fn run_ceremony(&mut self) -> Result<()> {
        let create = CommandMessage::create_session(self.auth_key_slot, &self.host_challenge);
        let response = self.send_plain(&create).await?;

        let (session_id, card_challenge, card_cryptogram) = match response {
            Response::CreateSession {
                session_id,
                card_challenge,
                card_cryptogram,
            } => (session_id, card_challenge, card_cryptogram),
            other => {
                return Err(HsmError::BadResponse(format!(
                    "expected create-session response, got {other:?}"
                )))
            }
        };

        self.session_id = session_id;
        self.device_challenge = card_challenge;

        let keychain = self.derive_keychain();

        // The card proves key possession first
        let expected = kdf(
            &keychain.mac,
            &self.host_challenge,
            &self.device_challenge,
            kdf_label::CARD_CRYPTOGRAM,
            CRYPTOGRAM_LENGTH,
        );
        if !bool::from(expected.ct_eq(&card_cryptogram)) {
            return Err(HsmError::AuthFailed(
                "device sent wrong card cryptogram".to_string(),
            ));
        }

        let host_cryptogram: [u8; CRYPTOGRAM_LENGTH] = kdf(
            &keychain.mac,
            &self.host_challenge,
            &self.device_challenge,
            kdf_label::HOST_CRYPTOGRAM,
            CRYPTOGRAM_LENGTH,
        )
        .try_into()
        .expect("kdf returns the requested length");

        self.keychain = Some(keychain);

        let response = self
            .send_mac_command(CommandMessage::authenticate_session(&host_cryptogram))
            .await?;
        match response {
            Response::AuthenticateSession => Ok(()),
            other => Err(HsmError::BadResponse(format!(
                "expected authenticate-session response, got {other:?}"
            ))),
        }
    }

    /// Send an encrypted, MAC-chained command and decrypt the response.
    ///
    /// The counter advances exactly once per call that produced a request
    /// MAC, success or not, so a failed exchange can never lead to IV reuse.
    /// A failed exchange also closes the channel; the pool replaces it.
    pub async fn send_encrypted(&mut self, command: &CommandMessage) -> Result<Response> {
        if self.security_level != SecurityLevel::Authenticated {
            return Err(HsmError::NotAuthenticated);
        }

        if self.counter >= MAX_MESSAGES_PER_SESSION {
            self.security_level = SecurityLevel::Closed;
            return Err(HsmError::SessionExhausted);
        }

        let result = self.exchange(command).await;

        // The request MAC exists from here on, whatever happened after it
        self.counter += 1;

        match result {
            Ok(response) => Ok(response),
            Err(err) => {
                self.security_level = SecurityLevel::Closed;
                Err(err)
            }
        }
    }

    async fn exchange(&mut self, command: &CommandMessage) -> Result<Response> {
        let keychain = self.keychain.as_ref().ok_or(HsmError::NotAuthenticated)?;
        let enc_key = keychain.enc;
        let rmac_key = keychain.rmac;

        let iv = derive_iv(&enc_key, self.counter);
        let ciphertext = cbc_encrypt(&enc_key, &iv, pad(command.serialize()));

        let wrapped = CommandMessage::new(CommandCode::SessionMessage, ciphertext);
        let response = self.send_mac_command(wrapped).await?;

        let (session_id, encrypted_data, mac) = match response {
            Response::SessionMessage {
                session_id,
                encrypted_data,
                mac,
            } => (session_id, encrypted_data, mac),
            other => {
                return Err(HsmError::BadResponse(format!(
                    "expected session message response, got {other:?}"
                )))
            }
        };

        // Response MAC chains off the updated chain value shared with the
        // request, keyed with S-RMAC
        let expected = chained_mac(
            &rmac_key,
            &self.mac_chain_value,
            CommandCode::SessionMessage.response_byte(),
            session_id,
            &encrypted_data,
        );
        if !bool::from(expected[..MAC_LENGTH].ct_eq(&mac)) {
            return Err(HsmError::BadResponseMac);
        }

        let plaintext = cbc_decrypt(&enc_key, &iv, encrypted_data)?;
        Response::parse(unpad(&plaintext))
    }

    /// Close the session on the device. Best-effort at shutdown: the channel
    /// is terminal afterwards either way.
    pub async fn close(&mut self) -> Result<()> {
        let result = self.send_encrypted(&CommandMessage::close_session()).await;
        self.security_level = SecurityLevel::Closed;

        match result {
            Ok(Response::CloseSession) => Ok(()),
            Ok(other) => Err(HsmError::BadResponse(format!(
                "expected close-session response, got {other:?}"
            ))),
            Err(err) => Err(err),
        }
    }

    /// Send a command outside the encrypted envelope and parse the reply.
    /// Only CREATE_SESSION legitimately travels this way.
    async fn send_plain(&self, command: &CommandMessage) -> Result<Response> {
        let raw = self.connector.request(command.serialize()).await?;
        Response::parse(&raw)
    }

    /// Attach this session's id and a chained MAC, then send in the clear.
    /// Used for AUTHENTICATE_SESSION and as the outer layer of every
    /// encrypted exchange.
    async fn send_mac_command(&mut self, mut command: CommandMessage) -> Result<Response> {
        let keychain = self.keychain.as_ref().ok_or(HsmError::NotAuthenticated)?;

        command.session_id = Some(self.session_id);

        let full_mac = chained_mac(
            &keychain.mac,
            &self.mac_chain_value,
            command.code as u8,
            self.session_id,
            &command.payload,
        );
        self.mac_chain_value = full_mac;
        command.mac = Some(
            full_mac[..MAC_LENGTH]
                .try_into()
                .expect("truncating a 16-byte tag to 8"),
        );

        self.send_plain(&command).await
    }

    fn derive_keychain(&self) -> KeyChain {
        let derive = |key: &[u8; KEY_LENGTH], label: u8| -> [u8; KEY_LENGTH] {
            kdf(
                key,
                &self.host_challenge,
                &self.device_challenge,
                label,
                KEY_LENGTH,
            )
            .try_into()
            .expect("kdf returns the requested length")
        };

        KeyChain {
            enc: derive(self.auth_key.enc_key(), kdf_label::S_ENC),
            mac: derive(self.auth_key.mac_key(), kdf_label::S_MAC),
            rmac: derive(self.auth_key.mac_key(), kdf_label::S_RMAC),
        }
    }

    /// Test hook: place the counter near the session cap.
    #[cfg(test)]
    pub(crate) fn seed_counter(&mut self, counter: u32) {
        self.counter = counter;
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("session_id", &self.session_id)
            .field("counter", &self.counter)
            .field("security_level", &self.security_level)
            .finish_non_exhaustive()
    }
}
