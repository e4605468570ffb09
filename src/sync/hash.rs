//! Content digests for local files.
//!
//! MD5 is used because it is what S3 reports as the ETag of a single-part
//! upload, which makes local and remote digests directly comparable.

use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const BUFFER_SIZE: usize = 64 * 1024;

/// Hash bytes, returning lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    to_hex(&Md5::digest(data))
}

/// Hash a file in 64KB chunks.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(to_hex(&hasher.finalize()))
}

/// Normalize an S3 ETag into a digest, or `None` for multipart ETags.
pub fn digest_from_etag(etag: &str) -> Option<String> {
    let etag = etag.trim().trim_start_matches("W/").trim_matches('"');
    if etag.len() != 32 || etag.contains('-') || !etag.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(etag.to_ascii_lowercase())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
