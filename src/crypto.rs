use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Digest, Sha3_256, Shake256};

use crate::config::BLOCK_SIZE;
use crate::error::MixError;

// Unsigned-varint round number, zero-padded to 24 bytes.
pub fn round_nonce(round: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    put_uvarint(&mut nonce, round);
    nonce
}

fn put_uvarint(buf: &mut [u8], mut x: u64) -> usize {
    let mut i = 0;
    while x >= 0x80 {
        buf[i] = (x as u8) | 0x80;
        x >>= 7;
        i += 1;
    }
    buf[i] = x as u8;
    i + 1
}

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305, MixError> {
    if key.len() != 32 {
        return Err(MixError::ProtocolSequence(format!(
            "bad symmetric key length {}",
            key.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(Key::from_slice(key)))
}

pub fn seal_layer(key: &[u8], round: u64, plaintext: &[u8]) -> Result<Vec<u8>, MixError> {
    let nonce = round_nonce(round);
    cipher_for(key)?
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| MixError::ProtocolSequence("seal failed".into()))
}

// Server 0 opens first, so its layer is sealed last.
pub fn seal_onion(keys: &[Vec<u8>], round: u64, payload: &[u8]) -> Result<Vec<u8>, MixError> {
    let mut data = payload.to_vec();
    for key in keys.iter().rev() {
        data = seal_layer(key, round, &data)?;
    }
    Ok(data)
}

pub fn open_layer(
    key: &[u8],
    round: u64,
    ciphertext: &[u8],
    position: usize,
) -> Result<Vec<u8>, MixError> {
    let nonce = round_nonce(round);
    cipher_for(key)?
        .decrypt(XNonce::from_slice(&nonce), ciphertext)
        .map_err(|_| MixError::CryptoOpen { round, position })
}

pub fn prg_seed(seed: &[u8], out: &mut [u8]) {
    let mut xof = Shake256::default();
    xof.update(seed);
    xof.finalize_xof().read(out);
}

pub fn prg_advance(buf: &mut [u8]) {
    let mut next = vec![0u8; buf.len()];
    prg_seed(buf, &mut next);
    buf.copy_from_slice(&next);
}

pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

// XOR of the blocks whose little-endian mask bit is set, then the secret.
pub fn compute_response(blocks: &[Vec<u8>], mask: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut resp = vec![0u8; BLOCK_SIZE];
    for (i, block) in blocks.iter().enumerate() {
        if i / 8 < mask.len() && mask[i / 8] & (1 << (i % 8)) != 0 {
            xor_into(&mut resp, block);
        }
    }
    xor_into(&mut resp, secret);
    resp
}

pub fn hash_block(data: &[u8]) -> Vec<u8> {
    Sha3_256::digest(data).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_varint_round_zero_padded() {
        assert_eq!(round_nonce(0), [0u8; 24]);

        let n1 = round_nonce(1);
        assert_eq!(n1[0], 1);
        assert!(n1[1..].iter().all(|&b| b == 0));

        // 300 = 0b100101100 -> varint [0xac, 0x02]
        let n300 = round_nonce(300);
        assert_eq!(&n300[..2], &[0xac, 0x02]);
        assert!(n300[2..].iter().all(|&b| b == 0));

        // Rounds crossing a 2^k group boundary grow the varint by a byte.
        let lo = round_nonce((1 << 56) - 1);
        let hi = round_nonce(1 << 56);
        assert_eq!(lo[8], 0);
        assert_ne!(hi[8], 0);
    }

    #[test]
    fn layer_roundtrip_and_round_binding() {
        let key = vec![7u8; 32];
        let sealed = seal_layer(&key, 3, b"payload").unwrap();
        assert_eq!(open_layer(&key, 3, &sealed, 0).unwrap(), b"payload");
        // A different round derives a different nonce and must not open.
        assert!(matches!(
            open_layer(&key, 4, &sealed, 0),
            Err(MixError::CryptoOpen { round: 4, position: 0 })
        ));
    }

    #[test]
    fn onion_opens_in_chain_order() {
        let keys: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i + 1; 32]).collect();
        let mut data = seal_onion(&keys, 9, b"block").unwrap();
        for (i, key) in keys.iter().enumerate() {
            data = open_layer(key, 9, &data, i).unwrap();
        }
        assert_eq!(data, b"block");
    }

    #[test]
    fn prg_chain_is_reproducible() {
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        prg_seed(b"shared dh point", &mut a);
        prg_seed(b"shared dh point", &mut b);
        assert_eq!(a, b);

        prg_advance(&mut a);
        assert_ne!(a, b);
        prg_advance(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn response_xors_selected_blocks_and_secret() {
        let blocks: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; BLOCK_SIZE]).collect();
        let secret = vec![0x55u8; BLOCK_SIZE];
        // Select blocks 1 and 8: bits 1 and 8 of the little-endian mask.
        let mut mask = vec![0u8; 32];
        mask[0] = 1 << 1;
        mask[1] = 1 << 0;
        let resp = compute_response(&blocks, &mask, &secret);
        assert!(resp.iter().all(|&b| b == (1 ^ 8 ^ 0x55)));
    }

    #[test]
    fn paired_responses_cancel_to_one_block() {
        // Two servers with complementary masks reconstruct exactly the
        // target block once their secrets are cancelled.
        let blocks: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i + 10; BLOCK_SIZE]).collect();
        let target = 2usize;
        let mut m0 = vec![0u8; 32];
        prg_seed(b"mask seed", &mut m0);
        let mut m1 = m0.clone();
        m1[target / 8] ^= 1 << (target % 8);
        let mut s0 = vec![0u8; BLOCK_SIZE];
        let mut s1 = vec![0u8; BLOCK_SIZE];
        prg_seed(b"secret zero", &mut s0);
        prg_seed(b"secret one", &mut s1);

        let mut out = compute_response(&blocks, &m0, &s0);
        xor_into(&mut out, &compute_response(&blocks, &m1, &s1));
        xor_into(&mut out, &s0);
        xor_into(&mut out, &s1);
        assert_eq!(out, blocks[target]);
    }
}
