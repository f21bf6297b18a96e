//! Murmur3Partitioner as implemented by the server: the x64 128-bit variant
//! of MurmurHash3 with seed 0, keeping only the first half of the digest.
//! Tail bytes are sign-extended, which is where it departs from the
//! reference algorithm.

use std::num::Wrapping;

use bytes::Buf;

use super::Token;

const C1: Wrapping<i64> = Wrapping(0x87c3_7b91_1142_53d5_u64 as i64);
const C2: Wrapping<i64> = Wrapping(0x4cf5_ad43_2745_937f_u64 as i64);

#[inline]
fn rotl64(v: Wrapping<i64>, n: u32) -> Wrapping<i64> {
    Wrapping(v.0.rotate_left(n))
}

#[inline]
fn fmix(mut k: Wrapping<i64>) -> Wrapping<i64> {
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xff51_afd7_ed55_8ccd_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xc4ce_b9fe_1a85_ec53_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k
}

#[inline]
fn mix_k1(mut k1: Wrapping<i64>) -> Wrapping<i64> {
    k1 *= C1;
    k1 = rotl64(k1, 31);
    k1 * C2
}

#[inline]
fn mix_k2(mut k2: Wrapping<i64>) -> Wrapping<i64> {
    k2 *= C2;
    k2 = rotl64(k2, 33);
    k2 * C1
}

/// Computes the token of an already encoded routing key.
pub fn murmur3_token(data: &[u8]) -> Token {
    let mut h1 = Wrapping(0_i64);
    let mut h2 = Wrapping(0_i64);

    let mut blocks = data.chunks_exact(16);
    for mut block in &mut blocks {
        let k1 = Wrapping(block.get_i64_le());
        let k2 = Wrapping(block.get_i64_le());

        h1 ^= mix_k1(k1);
        h1 = rotl64(h1, 27);
        h1 += h2;
        h1 = h1 * Wrapping(5) + Wrapping(0x52dc_e729);

        h2 ^= mix_k2(k2);
        h2 = rotl64(h2, 31);
        h2 += h1;
        h2 = h2 * Wrapping(5) + Wrapping(0x3849_5ab5);
    }

    let tail = blocks.remainder();
    let mut k1 = Wrapping(0_i64);
    let mut k2 = Wrapping(0_i64);
    for (i, &byte) in tail.iter().enumerate().rev() {
        let signed = Wrapping(byte as i8 as i64);
        if i >= 8 {
            k2 ^= signed << ((i - 8) * 8);
        } else {
            k1 ^= signed << (i * 8);
        }
    }
    if tail.len() > 8 {
        h2 ^= mix_k2(k2);
    }
    if !tail.is_empty() {
        h1 ^= mix_k1(k1);
    }

    let len = Wrapping(data.len() as i64);
    h1 ^= len;
    h2 ^= len;

    h1 += h2;
    h2 += h1;

    h1 = fmix(h1);
    h2 = fmix(h2);

    h1 += h2;

    Token::new(h1.0)
}
