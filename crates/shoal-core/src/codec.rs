//! Pluggable state serialization and binary delta capabilities.

use bytes::Bytes;
use serde_json::Value;

use crate::error::{ShardError, ShardResult};

pub trait StateCodec: Send + Sync {
    /// Must be deterministic: encoding an unchanged value twice yields
    /// identical bytes.
    fn encode(&self, value: &Value) -> ShardResult<Bytes>;
    fn decode(&self, bytes: &[u8]) -> ShardResult<Value>;
}

pub trait StateDelta: Send + Sync {
    fn diff(&self, old: &[u8], new: &[u8]) -> ShardResult<Bytes>;
    fn apply_patch(&self, old: &[u8], patch: &[u8]) -> ShardResult<Bytes>;
}

/// JSON codec. Object keys are kept sorted, which makes encodings of equal
/// values byte-identical.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl StateCodec for JsonCodec {
    fn encode(&self, value: &Value) -> ShardResult<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|err| ShardError::Codec(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> ShardResult<Value> {
        serde_json::from_slice(bytes).map_err(|err| ShardError::Codec(err.to_string()))
    }
}

/// Delta that replaces the span between the common prefix and common suffix
/// of two encodings.
///
/// Patch layout: `varint(prefix_len) varint(suffix_len) replacement...`
#[derive(Debug, Default, Clone, Copy)]
pub struct SpliceDelta;

impl StateDelta for SpliceDelta {
    fn diff(&self, old: &[u8], new: &[u8]) -> ShardResult<Bytes> {
        let prefix = old
            .iter()
            .zip(new.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = old.len().min(new.len()) - prefix;
        let suffix = old
            .iter()
            .rev()
            .zip(new.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let replacement = &new[prefix..new.len() - suffix];
        let mut buf = Vec::with_capacity(replacement.len() + 8);
        write_var_u64(&mut buf, prefix as u64);
        write_var_u64(&mut buf, suffix as u64);
        buf.extend_from_slice(replacement);
        Ok(Bytes::from(buf))
    }

    fn apply_patch(&self, old: &[u8], patch: &[u8]) -> ShardResult<Bytes> {
        let mut cursor = 0usize;
        let prefix = read_var_u64(patch, &mut cursor)? as usize;
        let suffix = read_var_u64(patch, &mut cursor)? as usize;
        if prefix.saturating_add(suffix) > old.len() {
            return Err(ShardError::Delta(format!(
                "patch keeps {prefix}+{suffix} bytes of a {} byte base",
                old.len()
            )));
        }
        let replacement = &patch[cursor..];
        let mut out = Vec::with_capacity(prefix + replacement.len() + suffix);
        out.extend_from_slice(&old[..prefix]);
        out.extend_from_slice(replacement);
        out.extend_from_slice(&old[old.len() - suffix..]);
        Ok(Bytes::from(out))
    }
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push(((value & 0x7f) as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn read_var_u64(bytes: &[u8], cursor: &mut usize) -> ShardResult<u64> {
    let mut shift = 0u32;
    let mut value = 0u64;
    loop {
        let byte = *bytes
            .get(*cursor)
            .ok_or_else(|| ShardError::Delta("unexpected end of patch".into()))?;
        *cursor += 1;
        if shift >= 64 {
            return Err(ShardError::Delta("varint overflow".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}
