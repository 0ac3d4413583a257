use rand::rngs::OsRng;
use rand::TryRngCore;

use crate::error::{Error, Result};

const SECRET_BYTES: usize = 8;

/// Generates the shared secret embedded in a new check's trap URL:
/// 16 lowercase hex characters drawn from the operating system's RNG.
pub fn make_secret() -> Result<String> {
    let mut buf = [0u8; SECRET_BYTES];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| Error::RandomSource(e.to_string()))?;
    Ok(hex::encode(buf))
}
