// SHA-256 helpers shared by the pre-downloader, the executor's integrity
// recording, and the verifier. One hashing path for everything keeps the
// stored and recomputed digests trivially comparable.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::error::{Result, TsukuError};

/// Streams a file through SHA-256, returning the lowercase hex digest.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        TsukuError::Integrity(format!("cannot open {} for hashing: {e}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| {
        TsukuError::Integrity(format!("cannot read {} for hashing: {e}", path.display()))
    })?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hashes an in-memory buffer (recipe bytes, lockfile contents).
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Whether a string is a well-formed lowercase hex SHA-256 digest.
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Incremental hasher wrapper so the downloader can hash while streaming.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: io::Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, hasher: Sha256::new(), written: 0 }
    }

    pub fn finalize(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: io::Write> io::Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reads a stream into a writer while hashing, with a hard size cap.
/// Returns `(sha256_hex, bytes_copied)`; exceeding the cap is an error the
/// caller maps to its own taxonomy.
pub fn copy_hashed<R: Read, W: io::Write>(
    reader: &mut R,
    writer: &mut W,
    max_bytes: u64,
    mut on_chunk: impl FnMut() -> io::Result<()>,
) -> io::Result<(String, u64)> {
    let mut hashing = HashingWriter::new(writer);
    let mut buf = [0u8; 64 * 1024];
    loop {
        on_chunk()?;
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if hashing.written + n as u64 > max_bytes {
            return Err(io::Error::other(format!(
                "stream exceeds size cap of {max_bytes} bytes"
            )));
        }
        io::Write::write_all(&mut hashing, &buf[..n])?;
    }
    let (_, digest, written) = hashing.finalize();
    Ok((digest, written))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn file_and_buffer_digests_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"hello tsuku").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_bytes(b"hello tsuku"));
    }

    #[test]
    fn hex_shape_check() {
        assert!(is_sha256_hex(&"a".repeat(64)));
        assert!(!is_sha256_hex(&"A".repeat(64)));
        assert!(!is_sha256_hex("abc"));
        assert!(!is_sha256_hex(&"g".repeat(64)));
    }

    #[test]
    fn copy_hashed_enforces_the_cap() {
        let data = vec![0u8; 1024];
        let mut out = Vec::new();
        let err = copy_hashed(&mut &data[..], &mut out, 512, || Ok(())).unwrap_err();
        assert!(err.to_string().contains("size cap"));
    }

    #[test]
    fn copy_hashed_reports_digest_and_size() {
        let data = b"stream me".to_vec();
        let mut out = Vec::new();
        let (digest, size) = copy_hashed(&mut &data[..], &mut out, 1 << 20, || Ok(())).unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(digest, sha256_bytes(b"stream me"));
        assert_eq!(out, data);
    }
}
