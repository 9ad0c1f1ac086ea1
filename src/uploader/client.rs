//! Remote server protocol client
//!
//! Thin reqwest wrapper over the three endpoints the daemon consumes:
//! `POST /api/login`, `POST /put_file` and `POST /upload_file/{sha256}`.
//! Content uploads stream straight from disk in 64 KiB reads; nothing ever
//! buffers a whole file.

use crate::store::StoreError;
use futures::TryStreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::io::ReaderStream;

const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
	#[error("no default server configured")]
	NoServer,

	#[error("file has no fingerprint yet")]
	NoFingerprint,

	#[error("network error: {0}")]
	Network(#[from] reqwest::Error),

	#[error("authentication rejected")]
	Unauthorized,

	#[error("server throttled the request")]
	Throttled { retry_after: Option<Duration> },

	#[error("server error: HTTP {0}")]
	Server(u16),

	#[error("request rejected: HTTP {status}: {detail}")]
	Rejected { status: u16, detail: String },

	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Store(#[from] StoreError),
}

impl UploadError {
	/// Transient failures go back on the queue with backoff; everything
	/// else is terminal for the entry.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			UploadError::Network(_)
				| UploadError::Throttled { .. }
				| UploadError::Server(_)
				| UploadError::NoServer
				| UploadError::Store(_)
		)
	}

	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			UploadError::Throttled { retry_after } => *retry_after,
			_ => None,
		}
	}
}

/// The metadata record shipped to `put_file`. File times are Unix
/// seconds-float on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
	pub filepath: String,
	pub hostname: String,
	pub ip_address: String,
	pub sha256: String,
	pub file_size: i64,
	pub file_mode: i32,
	pub file_uid: i64,
	pub file_gid: i64,
	pub file_mtime: f64,
	pub file_atime: f64,
	pub file_ctime: f64,
	pub is_symlink: bool,
	pub link_target: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginGrant {
	pub access_token: String,
	#[allow(dead_code)]
	#[serde(default)]
	pub token_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PutFileResponse {
	#[serde(default)]
	pub upload_required: bool,
	#[serde(default)]
	pub upload_url: Option<String>,
}

pub struct RemoteClient {
	http: reqwest::Client,
	base_url: String,
	metadata_timeout: Duration,
	upload_timeout: Duration,
}

impl RemoteClient {
	pub fn new(
		base_url: &str,
		metadata_timeout: Duration,
		upload_timeout: Duration,
	) -> Result<Self, UploadError> {
		Ok(Self {
			http: reqwest::Client::builder()
				.connect_timeout(Duration::from_secs(10))
				.build()?,
			base_url: base_url.trim_end_matches('/').to_string(),
			metadata_timeout,
			upload_timeout,
		})
	}

	pub async fn login(&self, username: &str, secret: &str) -> Result<LoginGrant, UploadError> {
		let resp = self
			.http
			.post(format!("{}/api/login", self.base_url))
			.json(&serde_json::json!({ "username": username, "password": secret }))
			.timeout(self.metadata_timeout)
			.send()
			.await?;
		Ok(checked(resp).await?.json().await?)
	}

	pub async fn put_file(
		&self,
		token: &str,
		record: &FileRecord,
	) -> Result<PutFileResponse, UploadError> {
		let resp = self
			.http
			.post(format!("{}/put_file", self.base_url))
			.bearer_auth(token)
			.json(record)
			.timeout(self.metadata_timeout)
			.send()
			.await?;
		Ok(checked(resp).await?.json().await?)
	}

	/// Stream `path` as the multipart `file` field. Cumulative byte counts
	/// are pushed to `progress` as chunks leave the disk; write-side
	/// backpressure pauses the reads, so memory stays bounded by one chunk.
	pub async fn upload_file(
		&self,
		token: &str,
		sha256: &str,
		hostname: &str,
		filepath: &str,
		path: &Path,
		size: u64,
		progress: UnboundedSender<u64>,
	) -> Result<(), UploadError> {
		let file = tokio::fs::File::open(path).await?;
		let mut sent = 0u64;
		let counted =
			ReaderStream::with_capacity(file, STREAM_CHUNK).inspect_ok(move |chunk| {
				sent += chunk.len() as u64;
				let _ = progress.send(sent);
			});

		let filename = path
			.file_name()
			.map(|n| n.to_string_lossy().to_string())
			.unwrap_or_else(|| "file".to_string());
		let part = Part::stream_with_length(reqwest::Body::wrap_stream(counted), size)
			.file_name(filename)
			.mime_str("application/octet-stream")?;

		let resp = self
			.http
			.post(format!("{}/upload_file/{}", self.base_url, sha256))
			.query(&[("hostname", hostname), ("filepath", filepath)])
			.bearer_auth(token)
			.multipart(Form::new().part("file", part))
			.timeout(self.upload_timeout)
			.send()
			.await?;
		checked(resp).await?;
		Ok(())
	}
}

/// Map a response status onto the retry taxonomy.
async fn checked(resp: reqwest::Response) -> Result<reqwest::Response, UploadError> {
	let status = resp.status();
	if status.is_success() {
		return Ok(resp);
	}

	match status {
		StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(UploadError::Unauthorized),
		StatusCode::TOO_MANY_REQUESTS => {
			let retry_after = resp
				.headers()
				.get(reqwest::header::RETRY_AFTER)
				.and_then(|v| v.to_str().ok())
				.and_then(|v| v.parse::<u64>().ok())
				.map(Duration::from_secs);
			Err(UploadError::Throttled { retry_after })
		}
		StatusCode::REQUEST_TIMEOUT => Err(UploadError::Server(status.as_u16())),
		s if s.is_server_error() => Err(UploadError::Server(status.as_u16())),
		s => {
			let detail = resp.text().await.unwrap_or_default();
			let detail = detail.chars().take(200).collect();
			Err(UploadError::Rejected {
				status: s.as_u16(),
				detail,
			})
		}
	}
}
