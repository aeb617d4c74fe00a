//! Typed response decoding.
//!
//! Responses arrive as `opcode:u8 || payload_len:u16_be || payload`, where
//! the opcode is the request opcode with the high bit set. The device error
//! frame uses opcode `0xff` with a one-byte error code as payload.

use crate::error::{DeviceErrorCode, HsmError, Result};

use super::{
    Algorithm, CommandCode, CHALLENGE_LENGTH, CRYPTOGRAM_LENGTH, ERROR_RESPONSE_CODE, LABEL_LENGTH,
    MAC_LENGTH, RESPONSE_FLAG,
};

/// One entry of a list-objects response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectEntry {
    pub object_id: u16,
    pub object_type: u8,
    pub sequence: u8,
}

/// The full metadata record returned by get-object-info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub capabilities: u64,
    pub object_id: u16,
    pub length: u16,
    pub domains: u16,
    pub object_type: u8,
    pub algorithm: Algorithm,
    pub sequence: u8,
    pub origin: u8,
    pub label: [u8; LABEL_LENGTH],
    pub delegated_capabilities: u64,
}

/// Decoded response variants, keyed by the request opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    CreateSession {
        session_id: u8,
        card_challenge: [u8; CHALLENGE_LENGTH],
        card_cryptogram: [u8; CRYPTOGRAM_LENGTH],
    },
    AuthenticateSession,
    SessionMessage {
        session_id: u8,
        encrypted_data: Vec<u8>,
        mac: [u8; MAC_LENGTH],
    },
    Echo(Vec<u8>),
    Reset,
    CloseSession,
    GenerateAsymmetricKey {
        key_id: u16,
    },
    PutAsymmetricKey {
        key_id: u16,
    },
    SignDataPkcs1 {
        signature: Vec<u8>,
    },
    SignDataEcdsa {
        signature: Vec<u8>,
    },
    SignDataEddsa {
        signature: Vec<u8>,
    },
    ListObjects(Vec<ObjectEntry>),
    ObjectInfo(ObjectInfo),
    GetPseudoRandom(Vec<u8>),
    GetPubKey {
        algorithm: Algorithm,
        key_data: Vec<u8>,
    },
    DeleteObject,
}

impl Response {
    /// Decode a raw response frame into its typed variant.
    ///
    /// A device error frame is surfaced as [`HsmError::Device`].
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 3 {
            return Err(HsmError::BadFrame(format!(
                "response is {} bytes, need at least 3",
                data.len()
            )));
        }

        let opcode = data[0];
        let payload_len = usize::from(u16::from_be_bytes([data[1], data[2]]));
        let payload = &data[3..];

        if payload.len() != payload_len {
            return Err(HsmError::BadFrame(format!(
                "payload is {} bytes but header says {payload_len}",
                payload.len()
            )));
        }

        if opcode == ERROR_RESPONSE_CODE {
            if payload.len() != 1 {
                return Err(HsmError::BadFrame(
                    "error frame payload must be one byte".to_string(),
                ));
            }
            return Err(HsmError::Device(DeviceErrorCode::from_byte(payload[0])));
        }

        // Strip the response bit to recover the request opcode
        let request_code = CommandCode::from_byte(opcode.wrapping_sub(RESPONSE_FLAG))
            .ok_or_else(|| HsmError::BadResponse(format!("unknown response opcode 0x{opcode:02x}")))?;

        match request_code {
            CommandCode::CreateSession => parse_create_session(payload),
            CommandCode::AuthenticateSession => Ok(Self::AuthenticateSession),
            CommandCode::SessionMessage => parse_session_message(payload),
            CommandCode::Echo => Ok(Self::Echo(payload.to_vec())),
            CommandCode::Reset => Ok(Self::Reset),
            CommandCode::CloseSession => Ok(Self::CloseSession),
            CommandCode::GenerateAsymmetricKey => {
                Ok(Self::GenerateAsymmetricKey {
                    key_id: parse_key_id(payload)?,
                })
            }
            CommandCode::PutAsymmetricKey => Ok(Self::PutAsymmetricKey {
                key_id: parse_key_id(payload)?,
            }),
            CommandCode::SignDataPkcs1 => Ok(Self::SignDataPkcs1 {
                signature: payload.to_vec(),
            }),
            CommandCode::SignDataEcdsa => Ok(Self::SignDataEcdsa {
                signature: payload.to_vec(),
            }),
            CommandCode::SignDataEddsa => Ok(Self::SignDataEddsa {
                signature: payload.to_vec(),
            }),
            CommandCode::ListObjects => parse_list_objects(payload),
            CommandCode::GetObjectInfo => parse_object_info(payload),
            CommandCode::GetPseudoRandom => Ok(Self::GetPseudoRandom(payload.to_vec())),
            CommandCode::GetPubKey => parse_get_pub_key(payload),
            CommandCode::DeleteObject => Ok(Self::DeleteObject),
        }
    }
}

fn parse_create_session(payload: &[u8]) -> Result<Response> {
    if payload.len() != 1 + CHALLENGE_LENGTH + CRYPTOGRAM_LENGTH {
        return Err(HsmError::BadResponse(format!(
            "create-session payload is {} bytes, expected 17",
            payload.len()
        )));
    }

    let mut card_challenge = [0u8; CHALLENGE_LENGTH];
    card_challenge.copy_from_slice(&payload[1..9]);
    let mut card_cryptogram = [0u8; CRYPTOGRAM_LENGTH];
    card_cryptogram.copy_from_slice(&payload[9..]);

    Ok(Response::CreateSession {
        session_id: payload[0],
        card_challenge,
        card_cryptogram,
    })
}

fn parse_session_message(payload: &[u8]) -> Result<Response> {
    if payload.len() < 1 + MAC_LENGTH {
        return Err(HsmError::BadResponse(format!(
            "session message payload is {} bytes, too short for session id and MAC",
            payload.len()
        )));
    }

    let mac_offset = payload.len() - MAC_LENGTH;
    let mut mac = [0u8; MAC_LENGTH];
    mac.copy_from_slice(&payload[mac_offset..]);

    Ok(Response::SessionMessage {
        session_id: payload[0],
        encrypted_data: payload[1..mac_offset].to_vec(),
        mac,
    })
}

fn parse_key_id(payload: &[u8]) -> Result<u16> {
    if payload.len() != 2 {
        return Err(HsmError::BadResponse(format!(
            "key id payload is {} bytes, expected 2",
            payload.len()
        )));
    }
    Ok(u16::from_be_bytes([payload[0], payload[1]]))
}

fn parse_list_objects(payload: &[u8]) -> Result<Response> {
    if payload.len() % 4 != 0 {
        return Err(HsmError::BadResponse(format!(
            "list-objects payload is {} bytes, not a multiple of 4",
            payload.len()
        )));
    }

    let entries = payload
        .chunks_exact(4)
        .map(|record| ObjectEntry {
            object_id: u16::from_be_bytes([record[0], record[1]]),
            object_type: record[2],
            sequence: record[3],
        })
        .collect();

    Ok(Response::ListObjects(entries))
}

fn parse_object_info(payload: &[u8]) -> Result<Response> {
    const INFO_LENGTH: usize = 8 + 2 + 2 + 2 + 1 + 1 + 1 + 1 + LABEL_LENGTH + 8;

    if payload.len() != INFO_LENGTH {
        return Err(HsmError::BadResponse(format!(
            "object-info payload is {} bytes, expected {INFO_LENGTH}",
            payload.len()
        )));
    }

    let mut label = [0u8; LABEL_LENGTH];
    label.copy_from_slice(&payload[18..18 + LABEL_LENGTH]);

    Ok(Response::ObjectInfo(ObjectInfo {
        capabilities: u64::from_be_bytes(payload[0..8].try_into().expect("sliced to 8 bytes")),
        object_id: u16::from_be_bytes([payload[8], payload[9]]),
        length: u16::from_be_bytes([payload[10], payload[11]]),
        domains: u16::from_be_bytes([payload[12], payload[13]]),
        object_type: payload[14],
        algorithm: Algorithm::from_byte(payload[15]),
        sequence: payload[16],
        origin: payload[17],
        label,
        delegated_capabilities: u64::from_be_bytes(
            payload[18 + LABEL_LENGTH..].try_into().expect("sliced to 8 bytes"),
        ),
    }))
}

fn parse_get_pub_key(payload: &[u8]) -> Result<Response> {
    if payload.is_empty() {
        return Err(HsmError::BadResponse(
            "get-pub-key payload is empty".to_string(),
        ));
    }
    Ok(Response::GetPubKey {
        algorithm: Algorithm::from_byte(payload[0]),
        key_data: payload[1..].to_vec(),
    })
}
