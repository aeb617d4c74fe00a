//! SCP03 cryptographic primitives.
//!
//! AES-128 throughout: the KDF and the message MACs are AES-CMAC, the
//! session payload is AES-CBC under an IV derived by encrypting the message
//! counter, and all of it keys off the 16-byte halves produced by the KDF.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::command::MAC_LENGTH;
use crate::error::{HsmError, Result};

use super::authkey::KEY_LENGTH;
use super::padding::BLOCK_SIZE;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// KDF derivation constants from the SCP03 specification.
pub(crate) mod kdf_label {
    pub const CARD_CRYPTOGRAM: u8 = 0x00;
    pub const HOST_CRYPTOGRAM: u8 = 0x01;
    pub const S_ENC: u8 = 0x04;
    pub const S_MAC: u8 = 0x06;
    pub const S_RMAC: u8 = 0x07;
}

/// SCP03 counter-mode KDF.
///
/// Derivation data is
/// `11x00 || label || 00 || bits:u16_be || 01 || host_challenge || device_challenge`
/// (32 bytes), MACed with AES-CMAC under `key` and truncated to `out_len`.
pub(crate) fn kdf(
    key: &[u8; KEY_LENGTH],
    host_challenge: &[u8; 8],
    device_challenge: &[u8; 8],
    label: u8,
    out_len: usize,
) -> Vec<u8> {
    debug_assert!(out_len <= BLOCK_SIZE);

    let mut derivation_data = Vec::with_capacity(32);
    derivation_data.extend_from_slice(&[0u8; 11]);
    derivation_data.push(label);
    derivation_data.push(0x00);
    derivation_data.extend_from_slice(&((out_len as u16) * 8).to_be_bytes());
    derivation_data.push(0x01);
    derivation_data.extend_from_slice(host_challenge);
    derivation_data.extend_from_slice(device_challenge);

    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    mac.update(&derivation_data);
    mac.finalize().into_bytes()[..out_len].to_vec()
}

/// Chained AES-CMAC over one command or response frame.
///
/// The input is `chain || opcode || body_len:u16_be || session_id || data`
/// where `body_len` counts the session id, the data and the truncated MAC.
/// Returns the full 16-byte tag; the wire carries its first 8 bytes while
/// the full value seeds the next link of the chain.
pub(crate) fn chained_mac(
    key: &[u8; KEY_LENGTH],
    chain: &[u8; BLOCK_SIZE],
    opcode: u8,
    session_id: u8,
    data: &[u8],
) -> [u8; BLOCK_SIZE] {
    let body_len = (1 + data.len() + MAC_LENGTH) as u16;

    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    mac.update(chain);
    mac.update(&[opcode]);
    mac.update(&body_len.to_be_bytes());
    mac.update(&[session_id]);
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Derive the CBC IV for a message: AES-ECB of `12x00 || counter:u32_be`.
pub(crate) fn derive_iv(key: &[u8; KEY_LENGTH], counter: u32) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[12..].copy_from_slice(&counter.to_be_bytes());

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::from(block);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// AES-CBC encrypt already padded data in place.
pub(crate) fn cbc_encrypt(
    key: &[u8; KEY_LENGTH],
    iv: &[u8; BLOCK_SIZE],
    mut data: Vec<u8>,
) -> Vec<u8> {
    debug_assert_eq!(data.len() % BLOCK_SIZE, 0);

    let mut cipher = Aes128CbcEnc::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    data
}

/// AES-CBC decrypt; the ciphertext must be block aligned.
pub(crate) fn cbc_decrypt(
    key: &[u8; KEY_LENGTH],
    iv: &[u8; BLOCK_SIZE],
    mut data: Vec<u8>,
) -> Result<Vec<u8>> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(HsmError::BadResponse(format!(
            "ciphertext is {} bytes, not block aligned",
            data.len()
        )));
    }

    let mut cipher = Aes128CbcDec::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LENGTH] = [0x42; KEY_LENGTH];
    const HOST: [u8; 8] = [0x11; 8];
    const DEVICE: [u8; 8] = [0x22; 8];

    #[test]
    fn test_kdf_output_length_and_determinism() {
        for out_len in [4usize, 8, 16] {
            let a = kdf(&KEY, &HOST, &DEVICE, kdf_label::S_ENC, out_len);
            let b = kdf(&KEY, &HOST, &DEVICE, kdf_label::S_ENC, out_len);
            assert_eq!(a.len(), out_len);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_kdf_labels_separate_keys() {
        let enc = kdf(&KEY, &HOST, &DEVICE, kdf_label::S_ENC, KEY_LENGTH);
        let mac = kdf(&KEY, &HOST, &DEVICE, kdf_label::S_MAC, KEY_LENGTH);
        let rmac = kdf(&KEY, &HOST, &DEVICE, kdf_label::S_RMAC, KEY_LENGTH);
        assert_ne!(enc, mac);
        assert_ne!(mac, rmac);
        assert_ne!(enc, rmac);
    }

    #[test]
    fn test_kdf_challenges_bind_output() {
        let base = kdf(&KEY, &HOST, &DEVICE, kdf_label::S_MAC, 8);
        let other_host = kdf(&KEY, &[0x12; 8], &DEVICE, kdf_label::S_MAC, 8);
        let other_device = kdf(&KEY, &HOST, &[0x23; 8], kdf_label::S_MAC, 8);
        assert_ne!(base, other_host);
        assert_ne!(base, other_device);
    }

    #[test]
    fn test_chained_mac_depends_on_chain() {
        let a = chained_mac(&KEY, &[0u8; 16], 0x05, 1, b"data");
        let b = chained_mac(&KEY, &a, 0x05, 1, b"data");
        assert_ne!(a, b);
    }

    #[test]
    fn test_cbc_round_trip() {
        let iv = derive_iv(&KEY, 7);
        let plaintext = vec![0xabu8; 48];

        let ciphertext = cbc_encrypt(&KEY, &iv, plaintext.clone());
        assert_ne!(ciphertext, plaintext);

        let decrypted = cbc_decrypt(&KEY, &iv, ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_cbc_decrypt_rejects_ragged_input() {
        let iv = derive_iv(&KEY, 1);
        assert!(cbc_decrypt(&KEY, &iv, vec![0u8; 15]).is_err());
    }

    #[test]
    fn test_iv_varies_with_counter() {
        assert_ne!(derive_iv(&KEY, 1), derive_iv(&KEY, 2));
    }
}
