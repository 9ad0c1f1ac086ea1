//! Streaming SHA-256

use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Canonical SHA-256 of zero bytes; zero-byte files are legal and carry it.
pub const EMPTY_SHA256: &str =
	"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Debug, Clone)]
pub struct HashedContent {
	/// 64 lowercase hex characters.
	pub sha256: String,
	pub bytes: u64,
}

/// Hash a file in fixed-size chunks, optionally pausing between chunks to
/// bound disk and CPU pressure. Memory use is one chunk regardless of file
/// size.
pub async fn hash_file(
	path: &Path,
	chunk_size: usize,
	pause: Option<Duration>,
) -> io::Result<HashedContent> {
	let mut file = tokio::fs::File::open(path).await?;
	let mut hasher = Sha256::new();
	let mut buf = vec![0u8; chunk_size.max(4096)];
	let mut bytes = 0u64;

	loop {
		let n = file.read(&mut buf).await?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
		bytes += n as u64;
		if let Some(pause) = pause {
			tokio::time::sleep(pause).await;
		}
	}

	Ok(HashedContent {
		sha256: hex::encode(hasher.finalize()),
		bytes,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn empty_file_has_canonical_hash() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("empty");
		std::fs::write(&path, b"").unwrap();

		let hashed = hash_file(&path, 1024, None).await.unwrap();
		assert_eq!(hashed.sha256, EMPTY_SHA256);
		assert_eq!(hashed.bytes, 0);
	}

	#[tokio::test]
	async fn known_vector() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("hello");
		std::fs::write(&path, b"hello").unwrap();

		let hashed = hash_file(&path, 1024 * 1024, None).await.unwrap();
		assert_eq!(
			hashed.sha256,
			"2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
		);
	}

	#[tokio::test]
	async fn chunking_does_not_change_the_digest() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("blob");
		let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
		std::fs::write(&path, &data).unwrap();

		let small = hash_file(&path, 4096, None).await.unwrap();
		let large = hash_file(&path, 1024 * 1024, None).await.unwrap();
		assert_eq!(small.sha256, large.sha256);
		assert_eq!(small.bytes, data.len() as u64);
		assert_eq!(small.sha256.len(), 64);
		assert!(small
			.sha256
			.chars()
			.all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
	}
}
