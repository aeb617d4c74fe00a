//! Command construction and wire serialization.
//!
//! Every exchange with the device uses the same outer frame:
//!
//! ```text
//! opcode:u8 || body_len:u16_be || [session_id:u8] || payload || [mac:8]
//! ```
//!
//! `body_len` covers everything after itself: the optional session id, the
//! payload, and the optional 8-byte MAC. Responses reuse the frame without
//! the session id / MAC fields and set the high bit of the opcode.
//!
//! Commands are built through the typed constructors on [`CommandMessage`];
//! the secure channel fills in `session_id` and `mac` when it wraps them.

mod response;

pub use response::{ObjectEntry, ObjectInfo, Response};

use bytes::{BufMut, BytesMut};

use crate::error::{HsmError, Result};

/// Truncated MAC length carried on the wire
pub const MAC_LENGTH: usize = 8;

/// Host and card challenge length
pub const CHALLENGE_LENGTH: usize = 8;

/// Card and host cryptogram length
pub const CRYPTOGRAM_LENGTH: usize = 8;

/// Object label length; shorter labels are zero padded
pub const LABEL_LENGTH: usize = 40;

/// High bit marking a response opcode
pub const RESPONSE_FLAG: u8 = 0x80;

/// Opcode of the device error frame
pub const ERROR_RESPONSE_CODE: u8 = 0xff;

/// Command opcodes understood by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    Echo = 0x01,
    CreateSession = 0x03,
    AuthenticateSession = 0x04,
    SessionMessage = 0x05,
    Reset = 0x08,
    CloseSession = 0x40,
    PutAsymmetricKey = 0x45,
    GenerateAsymmetricKey = 0x46,
    SignDataPkcs1 = 0x47,
    ListObjects = 0x48,
    GetObjectInfo = 0x4e,
    GetPseudoRandom = 0x51,
    GetPubKey = 0x54,
    SignDataEcdsa = 0x56,
    DeleteObject = 0x58,
    SignDataEddsa = 0x6a,
}

impl CommandCode {
    /// Map a wire byte back to an opcode.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Echo),
            0x03 => Some(Self::CreateSession),
            0x04 => Some(Self::AuthenticateSession),
            0x05 => Some(Self::SessionMessage),
            0x08 => Some(Self::Reset),
            0x40 => Some(Self::CloseSession),
            0x45 => Some(Self::PutAsymmetricKey),
            0x46 => Some(Self::GenerateAsymmetricKey),
            0x47 => Some(Self::SignDataPkcs1),
            0x48 => Some(Self::ListObjects),
            0x4e => Some(Self::GetObjectInfo),
            0x51 => Some(Self::GetPseudoRandom),
            0x54 => Some(Self::GetPubKey),
            0x56 => Some(Self::SignDataEcdsa),
            0x58 => Some(Self::DeleteObject),
            0x6a => Some(Self::SignDataEddsa),
            _ => None,
        }
    }

    /// The opcode of the matching response frame.
    pub fn response_byte(&self) -> u8 {
        *self as u8 | RESPONSE_FLAG
    }
}

/// Key algorithm identifiers used by the asymmetric operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    P256,
    Secp256k1,
    Ed25519,
    /// Identifier this client has no constructor for
    Other(u8),
}

impl Algorithm {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            12 => Self::P256,
            15 => Self::Secp256k1,
            46 => Self::Ed25519,
            other => Self::Other(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Self::P256 => 12,
            Self::Secp256k1 => 15,
            Self::Ed25519 => 46,
            Self::Other(byte) => *byte,
        }
    }
}

/// Object types stored on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    Opaque = 0x01,
    AuthenticationKey = 0x02,
    AsymmetricKey = 0x03,
    WrapKey = 0x04,
    HmacKey = 0x05,
    Template = 0x06,
    OtpAeadKey = 0x07,
}

/// Capability bits (subset this client's constructors touch).
pub mod capability {
    pub const PUT_ASYMMETRIC: u64 = 0x0000_0000_0000_0008;
    pub const ASYMMETRIC_GEN: u64 = 0x0000_0000_0000_0010;
    pub const ASYMMETRIC_SIGN_PKCS: u64 = 0x0000_0000_0000_0020;
    pub const ASYMMETRIC_SIGN_ECDSA: u64 = 0x0000_0000_0000_0080;
    pub const ASYMMETRIC_SIGN_EDDSA: u64 = 0x0000_0000_0000_0100;
    pub const EXPORT_WRAPPED: u64 = 0x0000_0000_0000_1000;
    pub const IMPORT_WRAPPED: u64 = 0x0000_0000_0000_2000;
    pub const GET_RANDOMNESS: u64 = 0x0000_0000_0008_0000;
    pub const DELETE_ASYMMETRIC: u64 = 0x0000_0200_0000_0000;
}

/// Domain bits. A key is visible in every domain whose bit is set.
pub mod domain {
    pub const DOMAIN_1: u16 = 0x0001;
    pub const DOMAIN_2: u16 = 0x0002;
    pub const DOMAIN_3: u16 = 0x0004;
    pub const DOMAIN_4: u16 = 0x0008;
    pub const DOMAIN_5: u16 = 0x0010;
    pub const DOMAIN_6: u16 = 0x0020;
    pub const DOMAIN_7: u16 = 0x0040;
    pub const DOMAIN_8: u16 = 0x0080;
    pub const DOMAIN_9: u16 = 0x0100;
    pub const DOMAIN_10: u16 = 0x0200;
    pub const DOMAIN_11: u16 = 0x0400;
    pub const DOMAIN_12: u16 = 0x0800;
    pub const DOMAIN_13: u16 = 0x1000;
    pub const DOMAIN_14: u16 = 0x2000;
    pub const DOMAIN_15: u16 = 0x4000;
    pub const DOMAIN_16: u16 = 0x8000;
    pub const ALL: u16 = 0xffff;
}

/// Filters for the list-objects command, encoded as `param:u8 || value`.
#[derive(Debug, Clone)]
pub enum ListFilter {
    /// Match a specific object id
    Id(u16),
    /// Match an object type
    Type(ObjectType),
    /// Match objects visible in any of the given domains
    Domains(u16),
    /// Match a label (zero padded to 40 bytes)
    Label(Vec<u8>),
}

const LIST_PARAM_ID: u8 = 0x01;
const LIST_PARAM_TYPE: u8 = 0x02;
const LIST_PARAM_DOMAINS: u8 = 0x03;
const LIST_PARAM_LABEL: u8 = 0x06;

/// A single command frame.
///
/// `session_id` and `mac` stay `None` until the secure channel wraps the
/// command for an authenticated exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub code: CommandCode,
    pub session_id: Option<u8>,
    pub payload: Vec<u8>,
    pub mac: Option<[u8; MAC_LENGTH]>,
}

impl CommandMessage {
    /// Create a command with a raw payload and no session fields.
    pub fn new(code: CommandCode, payload: Vec<u8>) -> Self {
        Self {
            code,
            session_id: None,
            payload,
            mac: None,
        }
    }

    /// Length of everything after the two length bytes.
    pub fn body_length(&self) -> u16 {
        let mut length = self.payload.len();
        if self.session_id.is_some() {
            length += 1;
        }
        if self.mac.is_some() {
            length += MAC_LENGTH;
        }
        length as u16
    }

    /// Encode the frame for the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(3 + usize::from(self.body_length()));

        buf.put_u8(self.code as u8);
        buf.put_u16(self.body_length());
        if let Some(session_id) = self.session_id {
            buf.put_u8(session_id);
        }
        buf.put_slice(&self.payload);
        if let Some(mac) = &self.mac {
            buf.put_slice(mac);
        }

        buf.to_vec()
    }

    // === Session lifecycle ===

    /// CREATE_SESSION with the auth key slot and the host challenge.
    pub fn create_session(auth_key_slot: u16, host_challenge: &[u8; CHALLENGE_LENGTH]) -> Self {
        let mut payload = BytesMut::with_capacity(2 + CHALLENGE_LENGTH);
        payload.put_u16(auth_key_slot);
        payload.put_slice(host_challenge);
        Self::new(CommandCode::CreateSession, payload.to_vec())
    }

    /// AUTHENTICATE_SESSION carrying the host cryptogram.
    pub fn authenticate_session(host_cryptogram: &[u8; CRYPTOGRAM_LENGTH]) -> Self {
        Self::new(CommandCode::AuthenticateSession, host_cryptogram.to_vec())
    }

    /// CLOSE_SESSION (empty payload, sent encrypted).
    pub fn close_session() -> Self {
        Self::new(CommandCode::CloseSession, Vec::new())
    }

    // === Device operations ===

    /// ECHO of arbitrary bytes.
    pub fn echo(data: impl Into<Vec<u8>>) -> Self {
        Self::new(CommandCode::Echo, data.into())
    }

    /// RESET the device to factory state.
    pub fn reset() -> Self {
        Self::new(CommandCode::Reset, Vec::new())
    }

    /// Generate an asymmetric key on the device.
    pub fn generate_asymmetric_key(
        key_id: u16,
        label: &[u8],
        domains: u16,
        capabilities: u64,
        algorithm: Algorithm,
    ) -> Result<Self> {
        let label = pad_label(label)?;

        let mut payload = BytesMut::with_capacity(2 + LABEL_LENGTH + 2 + 8 + 1);
        payload.put_u16(key_id);
        payload.put_slice(&label);
        payload.put_u16(domains);
        payload.put_u64(capabilities);
        payload.put_u8(algorithm.as_byte());

        Ok(Self::new(
            CommandCode::GenerateAsymmetricKey,
            payload.to_vec(),
        ))
    }

    /// Import an asymmetric key. `key_part2` is only present for key types
    /// that split their material (e.g. RSA primes).
    pub fn put_asymmetric_key(
        key_id: u16,
        label: &[u8],
        domains: u16,
        capabilities: u64,
        algorithm: Algorithm,
        key_part1: &[u8],
        key_part2: Option<&[u8]>,
    ) -> Result<Self> {
        let label = pad_label(label)?;

        let mut payload = BytesMut::new();
        payload.put_u16(key_id);
        payload.put_slice(&label);
        payload.put_u16(domains);
        payload.put_u64(capabilities);
        payload.put_u8(algorithm.as_byte());
        payload.put_slice(key_part1);
        if let Some(part2) = key_part2 {
            payload.put_slice(part2);
        }

        Ok(Self::new(CommandCode::PutAsymmetricKey, payload.to_vec()))
    }

    /// Sign raw data with an Ed25519 key.
    pub fn sign_data_eddsa(key_id: u16, data: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(2 + data.len());
        payload.put_u16(key_id);
        payload.put_slice(data);
        Self::new(CommandCode::SignDataEddsa, payload.to_vec())
    }

    /// Sign a digest with an ECDSA key.
    pub fn sign_data_ecdsa(key_id: u16, digest: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(2 + digest.len());
        payload.put_u16(key_id);
        payload.put_slice(digest);
        Self::new(CommandCode::SignDataEcdsa, payload.to_vec())
    }

    /// Sign a digest with RSASSA-PKCS#1 v1.5.
    pub fn sign_data_pkcs1(key_id: u16, digest: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(2 + digest.len());
        payload.put_u16(key_id);
        payload.put_slice(digest);
        Self::new(CommandCode::SignDataPkcs1, payload.to_vec())
    }

    /// List objects matching all the given filters.
    pub fn list_objects(filters: &[ListFilter]) -> Result<Self> {
        let mut payload = BytesMut::new();
        for filter in filters {
            match filter {
                ListFilter::Id(id) => {
                    payload.put_u8(LIST_PARAM_ID);
                    payload.put_u16(*id);
                }
                ListFilter::Type(object_type) => {
                    payload.put_u8(LIST_PARAM_TYPE);
                    payload.put_u8(*object_type as u8);
                }
                ListFilter::Domains(domains) => {
                    payload.put_u8(LIST_PARAM_DOMAINS);
                    payload.put_u16(*domains);
                }
                ListFilter::Label(label) => {
                    payload.put_u8(LIST_PARAM_LABEL);
                    payload.put_slice(&pad_label(label)?);
                }
            }
        }
        Ok(Self::new(CommandCode::ListObjects, payload.to_vec()))
    }

    /// Fetch the metadata record of an object.
    pub fn get_object_info(object_id: u16, object_type: ObjectType) -> Self {
        let mut payload = BytesMut::with_capacity(3);
        payload.put_u16(object_id);
        payload.put_u8(object_type as u8);
        Self::new(CommandCode::GetObjectInfo, payload.to_vec())
    }

    /// Fetch the public half of an asymmetric key.
    pub fn get_pub_key(key_id: u16) -> Self {
        let mut payload = BytesMut::with_capacity(2);
        payload.put_u16(key_id);
        Self::new(CommandCode::GetPubKey, payload.to_vec())
    }

    /// Delete an object.
    pub fn delete_object(object_id: u16, object_type: ObjectType) -> Self {
        let mut payload = BytesMut::with_capacity(3);
        payload.put_u16(object_id);
        payload.put_u8(object_type as u8);
        Self::new(CommandCode::DeleteObject, payload.to_vec())
    }

    /// Draw bytes from the device RNG.
    pub fn get_pseudo_random(num_bytes: u16) -> Self {
        let mut payload = BytesMut::with_capacity(2);
        payload.put_u16(num_bytes);
        Self::new(CommandCode::GetPseudoRandom, payload.to_vec())
    }
}

/// Zero pad a label to [`LABEL_LENGTH`], rejecting longer input.
fn pad_label(label: &[u8]) -> Result<[u8; LABEL_LENGTH]> {
    if label.len() > LABEL_LENGTH {
        return Err(HsmError::InvalidConfig(format!(
            "label is {} bytes, max {}",
            label.len(),
            LABEL_LENGTH
        )));
    }
    let mut padded = [0u8; LABEL_LENGTH];
    padded[..label.len()].copy_from_slice(label);
    Ok(padded)
}
