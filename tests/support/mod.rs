//! Scripted fake HSM for end-to-end tests.
//!
//! Implements the device side of SCP03 with its own primitive composition,
//! independent of the library internals, so both ends of the protocol are
//! exercised for real: the fake derives the same session keys, verifies the
//! host's MAC chain, decrypts commands and encrypts responses. Scripted
//! misbehavior (wrong cryptogram, tampered responses) drives the failure
//! scenarios.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use hsmlink::{Connector, ConnectorStatus, HsmError};

const BLOCK: usize = 16;
const MAC_LEN: usize = 8;

/// What the fake device should do to the next exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Honest,
    /// Corrupt the card cryptogram in the create-session response
    WrongCardCryptogram,
    /// Flip one bit of the session response MAC
    TamperResponseMac,
    /// Flip one bit of the session response ciphertext
    TamperResponseData,
}

struct DeviceSession {
    host_challenge: [u8; 8],
    card_challenge: [u8; 8],
    s_enc: [u8; BLOCK],
    s_mac: [u8; BLOCK],
    s_rmac: [u8; BLOCK],
    mac_chain: [u8; BLOCK],
    counter: u32,
}

struct State {
    script: Script,
    sessions: HashMap<u8, DeviceSession>,
    next_session_id: u8,
    reset_issued: bool,
}

pub struct FakeHsm {
    enc_key: [u8; BLOCK],
    mac_key: [u8; BLOCK],
    state: Mutex<State>,
}

impl FakeHsm {
    /// Device initialized with the auth key derived from `password`.
    /// Session ids start at 7.
    pub fn new(password: &str) -> Self {
        let mut auth_key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), b"Yubico", 10_000, &mut auth_key);

        Self {
            enc_key: auth_key[..BLOCK].try_into().unwrap(),
            mac_key: auth_key[BLOCK..].try_into().unwrap(),
            state: Mutex::new(State {
                script: Script::Honest,
                sessions: HashMap::new(),
                next_session_id: 7,
                reset_issued: false,
            }),
        }
    }

    pub fn set_script(&self, script: Script) {
        self.state.lock().unwrap().script = script;
    }

    fn handle(&self, command: &[u8]) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();

        match command[0] {
            0x03 => create_session(self, &mut state, command),
            0x04 => authenticate_session(&mut state, command),
            0x05 => {
                if state.reset_issued {
                    return error_frame(0x03); // invalid session
                }
                session_message(&mut state, command)
            }
            _ => error_frame(0x01), // invalid command
        }
    }
}

impl Connector for FakeHsm {
    fn request(
        &self,
        command: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = hsmlink::Result<Vec<u8>>> + Send + '_>> {
        let response = self.handle(&command);
        Box::pin(async move { Ok(response) })
    }

    fn status(
        &self,
    ) -> Pin<Box<dyn Future<Output = hsmlink::Result<ConnectorStatus>> + Send + '_>> {
        Box::pin(async {
            ConnectorStatus::parse(
                "status=OK\nserial=0007\nversion=2.2.0\npid=1\naddress=fake\nport=0",
            )
            .map_err(|_| HsmError::Transport("bad status".to_string()))
        })
    }
}

// === Command handlers ===

fn create_session(hsm: &FakeHsm, state: &mut State, command: &[u8]) -> Vec<u8> {
    // payload: auth key slot (2) || host challenge (8)
    let host_challenge: [u8; 8] = command[5..13].try_into().unwrap();

    let session_id = state.next_session_id;
    state.next_session_id = state.next_session_id.wrapping_add(1);
    let card_challenge: [u8; 8] = std::array::from_fn(|i| session_id ^ (0xa0 + i as u8));

    let session = DeviceSession {
        host_challenge,
        card_challenge,
        s_enc: derive_key(&hsm.enc_key, &host_challenge, &card_challenge, 0x04),
        s_mac: derive_key(&hsm.mac_key, &host_challenge, &card_challenge, 0x06),
        s_rmac: derive_key(&hsm.mac_key, &host_challenge, &card_challenge, 0x07),
        mac_chain: [0u8; BLOCK],
        counter: 1,
    };

    let mut card_cryptogram = [0u8; 8];
    card_cryptogram
        .copy_from_slice(&scp03_kdf(&session.s_mac, &host_challenge, &card_challenge, 0x00, 8));
    if state.script == Script::WrongCardCryptogram {
        card_cryptogram[0] ^= 0x01;
    }

    state.sessions.insert(session_id, session);

    let mut payload = vec![session_id];
    payload.extend_from_slice(&card_challenge);
    payload.extend_from_slice(&card_cryptogram);
    response_frame(0x83, &payload)
}

fn authenticate_session(state: &mut State, command: &[u8]) -> Vec<u8> {
    let session_id = command[3];
    let payload = &command[4..command.len() - MAC_LEN];
    let mac = &command[command.len() - MAC_LEN..];

    let session = match state.sessions.get_mut(&session_id) {
        Some(session) => session,
        None => return error_frame(0x03),
    };

    let full = chain_mac(&session.s_mac, &session.mac_chain, 0x04, session_id, payload);
    if &full[..MAC_LEN] != mac {
        return error_frame(0x04); // auth fail
    }
    session.mac_chain = full;

    // verify the host cryptogram itself
    let expected = scp03_kdf(
        &session.s_mac,
        &session.host_challenge,
        &session.card_challenge,
        0x01,
        8,
    );
    if payload != expected {
        return error_frame(0x04);
    }

    response_frame(0x84, &[])
}

fn session_message(state: &mut State, command: &[u8]) -> Vec<u8> {
    let script = state.script;
    let session_id = command[3];
    let ciphertext = &command[4..command.len() - MAC_LEN];
    let mac = &command[command.len() - MAC_LEN..];

    let session = match state.sessions.get_mut(&session_id) {
        Some(session) => session,
        None => return error_frame(0x03),
    };

    let full = chain_mac(&session.s_mac, &session.mac_chain, 0x05, session_id, ciphertext);
    if &full[..MAC_LEN] != mac {
        return error_frame(0x04);
    }
    session.mac_chain = full;

    let iv = derive_iv(&session.s_enc, session.counter);
    session.counter += 1;

    let inner = cbc_decrypt(&session.s_enc, &iv, ciphertext.to_vec());
    let inner = unpad(&inner);

    let mut reset = false;
    let mut close = false;
    let inner_response = match inner[0] {
        0x01 => response_frame(0x81, &inner[3..]), // echo
        0x08 => {
            reset = true;
            response_frame(0x88, &[])
        }
        0x40 => {
            close = true;
            response_frame(0xc0, &[])
        }
        0x6a => {
            // eddsa signature over whatever arrived: fixed-size blob
            response_frame(0xea, &[0x5a; 64])
        }
        code => response_frame(code | 0x80, &[]),
    };

    let mut wrapped = cbc_encrypt(&session.s_enc, &iv, pad(inner_response));
    let response_mac = chain_mac(
        &session.s_rmac,
        &session.mac_chain,
        0x85,
        session_id,
        &wrapped,
    );
    let mut mac_out = [0u8; MAC_LEN];
    mac_out.copy_from_slice(&response_mac[..MAC_LEN]);

    // Tampering happens "on the wire", after the device produced its MAC
    if script == Script::TamperResponseData {
        wrapped[0] ^= 0x01;
    }
    if script == Script::TamperResponseMac {
        mac_out[0] ^= 0x01;
    }

    let mut payload = vec![session_id];
    payload.extend_from_slice(&wrapped);
    payload.extend_from_slice(&mac_out);

    if close {
        state.sessions.remove(&session_id);
    }
    if reset {
        state.reset_issued = true;
    }

    response_frame(0x85, &payload)
}

// === Frame helpers ===

fn response_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![opcode];
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn error_frame(code: u8) -> Vec<u8> {
    response_frame(0xff, &[code])
}

// === Independent SCP03 primitives ===

fn cmac16(key: &[u8; BLOCK], chunks: &[&[u8]]) -> [u8; BLOCK] {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    for chunk in chunks {
        mac.update(chunk);
    }
    mac.finalize().into_bytes().into()
}

fn scp03_kdf(
    key: &[u8; BLOCK],
    host_challenge: &[u8; 8],
    card_challenge: &[u8; 8],
    label: u8,
    out_len: usize,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(32);
    data.extend_from_slice(&[0u8; 11]);
    data.push(label);
    data.push(0x00);
    data.extend_from_slice(&((out_len as u16) * 8).to_be_bytes());
    data.push(0x01);
    data.extend_from_slice(host_challenge);
    data.extend_from_slice(card_challenge);

    cmac16(key, &[&data])[..out_len].to_vec()
}

fn derive_key(
    key: &[u8; BLOCK],
    host_challenge: &[u8; 8],
    card_challenge: &[u8; 8],
    label: u8,
) -> [u8; BLOCK] {
    scp03_kdf(key, host_challenge, card_challenge, label, BLOCK)
        .try_into()
        .unwrap()
}

fn chain_mac(
    key: &[u8; BLOCK],
    chain: &[u8; BLOCK],
    opcode: u8,
    session_id: u8,
    data: &[u8],
) -> [u8; BLOCK] {
    let body_len = (1 + data.len() + MAC_LEN) as u16;
    cmac16(
        key,
        &[chain, &[opcode], &body_len.to_be_bytes(), &[session_id], data],
    )
}

fn derive_iv(key: &[u8; BLOCK], counter: u32) -> [u8; BLOCK] {
    let mut block = [0u8; BLOCK];
    block[12..].copy_from_slice(&counter.to_be_bytes());

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::from(block);
    cipher.encrypt_block(&mut block);
    block.into()
}

fn cbc_encrypt(key: &[u8; BLOCK], iv: &[u8; BLOCK], mut data: Vec<u8>) -> Vec<u8> {
    let mut cipher =
        cbc::Encryptor::<Aes128>::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
    for block in data.chunks_exact_mut(BLOCK) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    data
}

fn cbc_decrypt(key: &[u8; BLOCK], iv: &[u8; BLOCK], mut data: Vec<u8>) -> Vec<u8> {
    let mut cipher =
        cbc::Decryptor::<Aes128>::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
    for block in data.chunks_exact_mut(BLOCK) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    data
}

fn pad(mut data: Vec<u8>) -> Vec<u8> {
    let remainder = data.len() % BLOCK;
    if remainder == 0 {
        return data;
    }
    data.push(0x80);
    data.resize(data.len() + BLOCK - remainder - 1, 0x00);
    data
}

fn unpad(data: &[u8]) -> &[u8] {
    match data.last() {
        Some(0x00) | Some(0x80) => {}
        _ => return data,
    }
    let mut end = data.len();
    while end > 0 && data[end - 1] == 0x00 {
        end -= 1;
    }
    if end > 0 && data[end - 1] == 0x80 {
        &data[..end - 1]
    } else {
        data
    }
}
