use anyhow::{Context, Result};
use rand::{rngs::OsRng, RngCore};

/// Byte length of access and management ids (192 bits).
pub const SECRET_ID_BYTES: usize = 24;

/// Byte length of a viewing key (64 bits).
pub const VIEWING_KEY_BYTES: usize = 8;

/// Generate an opaque token of `byte_len` random bytes, hex encoded
/// (`byte_len * 2` characters).
///
/// Reads straight from the operating system's CSPRNG. A failing source means
/// the host is broken, so the error is returned rather than retried.
pub fn secure_id(byte_len: usize) -> Result<String> {
    let mut bytes = vec![0u8; byte_len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("read secure random source")?;
    Ok(hex::encode(bytes))
}
