//! Payload ciphers
//!
//! Two schemes, both symmetric in structure with their decode paths:
//!
//! * a layer-index-keyed XOR stream cipher applied to compressed layer
//!   payloads; the key stream derives from a 32-bit seed stored in the
//!   file header, and a seed of zero disables the cipher entirely so the
//!   same container format has encrypted and plaintext variants
//! * raw RSA over fixed 64-byte blocks for embedded G-Code text, one
//!   block per command line
//!
//! Both compose with the layer image codecs without either side knowing
//! about the other: decrypt-then-decode on read, encode-then-encrypt on
//! write.

use num_bigint::BigUint;
use num_traits::Zero;

use resinkit_core::error::{GcodeError, IntegrityError, Result};

const KEY_INIT_XOR: u32 = 0x3FAD_2212;
const KEY_INIT_MUL: u32 = 0x4910_913D;
const KEY_STEP_MUL: u32 = 0x34A3_2231;

/// XOR a layer payload with its index-derived key stream, in place.
///
/// The transform is an involution: applying it twice restores the input.
/// A `seed` of zero means "encryption disabled" and leaves the payload
/// untouched.
pub fn crypt_layer(seed: u32, layer_index: u32, data: &mut [u8]) {
    if seed == 0 {
        return;
    }
    let mut key = (layer_index ^ KEY_INIT_XOR)
        .wrapping_mul(seed)
        .wrapping_mul(KEY_INIT_MUL);
    for (i, byte) in data.iter_mut().enumerate() {
        if i > 0 && i % 4 == 0 {
            key = key.wrapping_add(seed.wrapping_mul(KEY_STEP_MUL));
        }
        *byte ^= (key >> ((i % 4) * 8)) as u8;
    }
}

/// Size of one RSA block on the wire.
pub const RSA_BLOCK_LEN: usize = 64;
/// Padding prefix of a plaintext block.
const RSA_PREFIX: [u8; 3] = [0x00, 0x01, 0x00];
/// Bytes of line text a single block can carry.
pub const RSA_LINE_CAPACITY: usize = RSA_BLOCK_LEN - RSA_PREFIX.len();

/// Public modulus of the embedded G-Code keypair.
const RSA_MODULUS: [u8; RSA_BLOCK_LEN] = [
    0x8e, 0xe1, 0xbe, 0xcf, 0x8e, 0xf5, 0x45, 0x75, 0xd2, 0x61, 0xf7, 0x0a, 0x5f, 0xac, 0x30,
    0xb1, 0x2c, 0xf5, 0x2e, 0xf6, 0xba, 0x0e, 0x75, 0x4c, 0x4b, 0xf9, 0xd3, 0x23, 0xec, 0xa8,
    0x1f, 0x0c, 0xbe, 0x87, 0x89, 0xf4, 0x47, 0x02, 0x4b, 0xed, 0xd2, 0x32, 0x8c, 0x34, 0x70,
    0x2c, 0x90, 0xc1, 0x75, 0xe3, 0x7d, 0xd2, 0x47, 0x75, 0xa5, 0x63, 0x59, 0xbd, 0xef, 0xa4,
    0x9a, 0xe8, 0x71, 0xf3,
];

/// Private exponent of the embedded G-Code keypair.
const RSA_PRIVATE_EXPONENT: [u8; RSA_BLOCK_LEN] = [
    0x12, 0x8d, 0x42, 0x76, 0x8b, 0x5b, 0xfd, 0x5b, 0x81, 0xa8, 0x31, 0x53, 0x54, 0xd3, 0x74,
    0x09, 0xb7, 0xdf, 0x53, 0x41, 0xbb, 0x2c, 0x0a, 0xbe, 0xe5, 0x53, 0xd8, 0x13, 0xb4, 0xb3,
    0xff, 0x93, 0xe3, 0xab, 0x71, 0x63, 0x22, 0x5d, 0x74, 0x6e, 0x66, 0x59, 0xa9, 0x75, 0x5e,
    0x06, 0x5c, 0xac, 0xaf, 0xa8, 0x43, 0x18, 0x12, 0x5f, 0x82, 0xb5, 0xf5, 0xab, 0xe9, 0xe0,
    0xf2, 0x65, 0x57, 0x81,
];

/// Public exponent of the embedded G-Code keypair.
const RSA_PUBLIC_EXPONENT: u32 = 65537;

/// Pad one text line into a plaintext block and encrypt it with the
/// public key.
///
/// The block is `00 01 00`, then `FF` fill, then the UTF-8 line bytes at
/// the tail. Lines longer than [`RSA_LINE_CAPACITY`] are a hard error.
pub fn encrypt_gcode_line(line: &str, line_number: usize) -> Result<[u8; RSA_BLOCK_LEN]> {
    let text = line.as_bytes();
    if text.len() > RSA_LINE_CAPACITY {
        return Err(GcodeError::LineTooLong {
            line_number,
            length: text.len(),
            max: RSA_LINE_CAPACITY,
        }
        .into());
    }
    let mut block = [0xFFu8; RSA_BLOCK_LEN];
    block[..RSA_PREFIX.len()].copy_from_slice(&RSA_PREFIX);
    block[RSA_BLOCK_LEN - text.len()..].copy_from_slice(text);

    let message = BigUint::from_bytes_be(&block);
    let cipher = message.modpow(
        &BigUint::from(RSA_PUBLIC_EXPONENT),
        &BigUint::from_bytes_be(&RSA_MODULUS),
    );
    Ok(to_fixed_block(&cipher))
}

/// Decrypt one block with the private key and strip the padding back off.
pub fn decrypt_gcode_line(block: &[u8]) -> Result<String> {
    if block.len() != RSA_BLOCK_LEN {
        return Err(IntegrityError::InvalidBlock {
            reason: format!("cipher block is {} bytes, expected {}", block.len(), RSA_BLOCK_LEN),
        }
        .into());
    }
    let cipher = BigUint::from_bytes_be(block);
    let message = cipher.modpow(
        &BigUint::from_bytes_be(&RSA_PRIVATE_EXPONENT),
        &BigUint::from_bytes_be(&RSA_MODULUS),
    );
    let plain = to_fixed_block(&message);

    if plain[..RSA_PREFIX.len()] != RSA_PREFIX {
        return Err(IntegrityError::InvalidBlock {
            reason: "decrypted block has an invalid padding prefix".to_string(),
        }
        .into());
    }
    let mut start = RSA_PREFIX.len();
    while start < RSA_BLOCK_LEN && plain[start] == 0xFF {
        start += 1;
    }
    String::from_utf8(plain[start..].to_vec()).map_err(|_| {
        IntegrityError::InvalidBlock {
            reason: "decrypted block payload is not valid UTF-8".to_string(),
        }
        .into()
    })
}

fn to_fixed_block(value: &BigUint) -> [u8; RSA_BLOCK_LEN] {
    let mut block = [0u8; RSA_BLOCK_LEN];
    if value.is_zero() {
        return block;
    }
    let bytes = value.to_bytes_be();
    block[RSA_BLOCK_LEN - bytes.len()..].copy_from_slice(&bytes);
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypt_layer_involution() {
        let original: Vec<u8> = (0u32..257).map(|i| (i * 7) as u8).collect();
        for seed in [1u32, 0xDEAD_BEEF, 0x0000_0001, u32::MAX] {
            for index in [0u32, 1, 42, 9999] {
                let mut data = original.clone();
                crypt_layer(seed, index, &mut data);
                assert_ne!(data, original, "seed {seed} index {index} changed nothing");
                crypt_layer(seed, index, &mut data);
                assert_eq!(data, original);
            }
        }
    }

    #[test]
    fn test_crypt_layer_zero_seed_is_noop() {
        let original: Vec<u8> = (0..64).collect();
        let mut data = original.clone();
        crypt_layer(0, 3, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_crypt_layer_differs_by_index() {
        let original = vec![0u8; 16];
        let mut a = original.clone();
        let mut b = original;
        crypt_layer(77, 0, &mut a);
        crypt_layer(77, 1, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_rsa_line_round_trip() {
        for line in ["G1 Z5.05 F65.0", "M106 S255", "G4 P7000", ""] {
            let block = encrypt_gcode_line(line, 1).unwrap();
            assert_eq!(decrypt_gcode_line(&block).unwrap(), line);
        }
    }

    #[test]
    fn test_rsa_line_at_capacity() {
        let line = "X".repeat(RSA_LINE_CAPACITY);
        let block = encrypt_gcode_line(&line, 1).unwrap();
        assert_eq!(decrypt_gcode_line(&block).unwrap(), line);
    }

    #[test]
    fn test_rsa_line_too_long() {
        let line = "X".repeat(RSA_LINE_CAPACITY + 1);
        let err = encrypt_gcode_line(&line, 7).unwrap_err();
        assert!(matches!(
            err,
            resinkit_core::Error::Gcode(GcodeError::LineTooLong { line_number: 7, .. })
        ));
    }

    #[test]
    fn test_rsa_garbage_block_rejected() {
        let block = [0x5Au8; RSA_BLOCK_LEN];
        assert!(decrypt_gcode_line(&block).is_err());
    }
}
