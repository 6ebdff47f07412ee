use std::iter::FromIterator;

use anyhow::{bail, Context, Result};
use prost::Message;
use sled::IVec;

/// Encode a byte + u32 prefix key.
///
/// This allows for efficient BTree prefix storage without the overhead of allocating additional
/// vectors, strings or other sorts of buffers.
///
/// NOTE: if any data in a tree is encoded with a prefix, then all data in that tree will need
/// to be encoded with a well-defined prefix as well in order to avoid unintended collisions
/// and or data corruption.
pub fn encode_byte_prefix_u32(prefix: &[u8; 1], val: u32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = prefix[0];
    key[1..].copy_from_slice(&encode_u32(val));
    key
}

/// Encode a byte + u32 prefix + arbitrary suffix key.
///
/// See `encode_byte_prefix_u32` for more details.
pub fn encode_byte_prefix_u32_suffix(prefix: &[u8; 1], val: u32, suffix: &[u8]) -> IVec {
    ivec_from_iter(encode_byte_prefix_u32(prefix, val).iter().copied().chain(suffix.iter().copied()))
}

/// Encode the given u64 as an array of big-endian bytes.
pub fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u64.
pub fn decode_u64(val: &[u8]) -> Result<u64> {
    match val {
        [b0, b1, b2, b3, b4, b5, b6, b7] => Ok(u64::from_be_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, *b7])),
        _ => bail!("invalid byte array given to decode as u64, invalid len {} needed 8", val.len()),
    }
}

/// Encode the given u32 as an array of big-endian bytes.
pub fn encode_u32(val: u32) -> [u8; 4] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u32.
pub fn decode_u32(val: &[u8]) -> Result<u32> {
    match val {
        [b0, b1, b2, b3] => Ok(u32::from_be_bytes([*b0, *b1, *b2, *b3])),
        _ => bail!("invalid byte array given to decode as u32, invalid len {} needed 4", val.len()),
    }
}

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Message>(model: &M) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(model.encoded_len());
    model.encode(&mut buf).context("error serializing data model")?;
    Ok(buf)
}

/// Decode an object from the given buffer.
pub fn decode_model<M: Message + Default>(data: &[u8]) -> Result<M> {
    M::decode(data).context("error decoding object from storage")
}

/// Encode the given bytes iterator as an IVec.
pub fn ivec_from_iter<T: IntoIterator<Item = u8>>(data: T) -> IVec {
    IVec::from_iter(data)
}
