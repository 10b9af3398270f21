use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const CHUNK: usize = 8192;

pub(crate) fn sha256_hex_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; CHUNK];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Lowercase hex SHA-256 of a file's full contents.
pub(crate) fn sha256_file(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    sha256_hex_reader(BufReader::new(file))
}

/// Compare a stored hash with a computed one, accepting an optional `sha256:` prefix.
pub(crate) fn hashes_match(stored: &str, computed: &str) -> bool {
    normalize_hash(stored) == normalize_hash(computed)
}

pub(crate) fn normalize_hash(hash: &str) -> String {
    hash.trim()
        .strip_prefix("sha256:")
        .unwrap_or(hash.trim())
        .to_ascii_lowercase()
}

fn hmac_file(path: &Path, key: &[u8]) -> std::io::Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = [0_u8; CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        mac.update(&buf[..n]);
    }
    Ok(mac)
}

/// Base64 HMAC-SHA256 over a file's full contents.
pub(crate) fn hmac_sha256_file(path: &Path, key: &[u8]) -> std::io::Result<String> {
    let mac = hmac_file(path, key)?;
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Verify a base64 HMAC-SHA256 signature in constant time.
///
/// Returns `Ok(false)` for a signature that is not valid base64.
pub(crate) fn verify_hmac_sha256_file(
    path: &Path,
    key: &[u8],
    signature_b64: &str,
) -> std::io::Result<bool> {
    let Ok(expected) = BASE64.decode(signature_b64.trim()) else {
        return Ok(false);
    };
    let mac = hmac_file(path, key)?;
    Ok(mac.verify_slice(&expected).is_ok())
}
