//! SCP03 block padding.
//!
//! Plaintext is padded with `0x80` followed by zeros up to the AES block
//! size. Input that is already block aligned is passed through unchanged:
//! this matches what the device peer implements, and both sides of the wire
//! must agree on it even though ISO/IEC 7816-4 proper always pads.

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Pad `data` out to a multiple of [`BLOCK_SIZE`].
pub fn pad(mut data: Vec<u8>) -> Vec<u8> {
    let remainder = data.len() % BLOCK_SIZE;
    if remainder == 0 {
        return data;
    }

    data.push(0x80);
    data.resize(data.len() + BLOCK_SIZE - remainder - 1, 0x00);
    data
}

/// Strip the padding applied by [`pad`].
///
/// If the last byte is neither `0x00` nor `0x80` the input carried no
/// padding and is returned unchanged. Trailing zeros without a terminating
/// `0x80` are not treated as padding either.
pub fn unpad(data: &[u8]) -> &[u8] {
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
