//! Image library references and verified downloads into the cache
//!
//! Only hash-tagged references are accepted (`...:sha256.<hex>`), so every
//! pull is reproducible and the tag doubles as the cache key.

use crate::cache::{ArtifactKind, Cache, CacheEntry};
use crate::error::{AgentError, AgentResult};
use sha2::{Digest, Sha256};
use std::io::{ErrorKind, Read, Write};
use tracing::{debug, info};

const LIBRARY_SCHEME: &str = "library:";
const HASH_PREFIX: &str = "sha256.";

/// Whether `tag` is a content hash of the form `sha256.<64 lowercase hex>`
pub fn is_image_hash(tag: &str) -> bool {
    tag.strip_prefix(HASH_PREFIX).is_some_and(|digest| {
        digest.len() == 64
            && digest
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    })
}

/// Architecture name as used by image libraries
pub fn library_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// Parsed `library:` image URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryRef {
    /// Library host, if the URI names one
    pub host: Option<String>,
    /// `entity/collection/container`
    pub path: String,
    /// Comma-separated tags after the last `:`
    pub tags: Vec<String>,
}

impl LibraryRef {
    /// Parse `library:[//[host/]]entity/collection/container[:tag[,tag...]]`
    ///
    /// With `//`, a fourth path segment means the first one is the host.
    pub fn parse(uri: &str) -> AgentResult<Self> {
        let invalid = |reason: &str| AgentError::InvalidImageUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let rest = uri
            .strip_prefix(LIBRARY_SCHEME)
            .ok_or_else(|| invalid("expected library: scheme"))?;

        let (authority, rest) = match rest.strip_prefix("//") {
            Some(rest) => (true, rest),
            None => (false, rest),
        };

        let (path, tags) = match rest.rsplit_once(':') {
            Some((path, tags)) if !tags.contains('/') => (
                path,
                tags.split(',')
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => (rest, Vec::new()),
        };

        let mut segments: Vec<&str> = path.split('/').collect();
        let host = if authority && segments.len() == 4 {
            let host = segments.remove(0);
            (!host.is_empty()).then(|| host.to_string())
        } else {
            None
        };
        if authority && segments.first() == Some(&"") {
            // library:///entity/... has an explicitly empty host
            segments.remove(0);
        }

        if segments.is_empty() || segments.len() > 3 || segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("expected entity/collection/container"));
        }

        Ok(Self {
            host,
            path: segments.join("/"),
            tags,
        })
    }

    /// The first tag, which must be an image hash
    pub fn image_hash(&self) -> AgentResult<&str> {
        let tag = self.tags.first().map(String::as_str).unwrap_or_default();
        if is_image_hash(tag) {
            Ok(tag)
        } else {
            Err(AgentError::InvalidImageHash(tag.to_string()))
        }
    }

    /// Image file endpoint for this reference on the library at `base_url`
    pub fn download_url(&self, base_url: &str, arch: &str) -> AgentResult<String> {
        Ok(format!(
            "{}/v1/imagefile/{}:{}?arch={}",
            base_url.trim_end_matches('/'),
            self.path,
            self.image_hash()?,
            arch
        ))
    }
}

/// Copy an artifact into `entry`, committing only if its SHA-256 matches
pub fn store_verified<R: Read>(
    entry: &CacheEntry,
    mut reader: R,
    expected_digest: &str,
) -> AgentResult<u64> {
    let mut partial = entry.begin_write()?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(AgentError::io("reading image", e)),
        };
        hasher.update(&buf[..n]);
        partial
            .write_all(&buf[..n])
            .map_err(|e| AgentError::io("writing image to cache", e))?;
        total += n as u64;
    }

    let actual = hex::encode(hasher.finalize());
    if actual != expected_digest {
        return Err(AgentError::DigestMismatch {
            expected: expected_digest.to_string(),
            actual,
        });
    }

    partial.commit()?;
    Ok(total)
}

/// Fetches library images into the cache
#[derive(Debug, Clone)]
pub struct ImageDownloader {
    cache: Cache,
    base_url: String,
}

impl ImageDownloader {
    pub fn new(cache: Cache, base_url: impl Into<String>) -> Self {
        Self {
            cache,
            base_url: base_url.into(),
        }
    }

    /// Download the image named by `uri` unless it is already cached
    pub async fn download(&self, uri: &str) -> AgentResult<CacheEntry> {
        let reference = LibraryRef::parse(uri)?;
        let hash = reference.image_hash()?.to_string();

        let entry = self.cache.entry(ArtifactKind::Sif, &hash);
        if entry.exists() {
            info!(hash = %hash, "image already cached");
            return Ok(entry);
        }

        let base_url = match &reference.host {
            Some(host) => format!("https://{}", host),
            None => self.base_url.clone(),
        };
        let url = reference.download_url(&base_url, library_arch())?;
        let expected = hash.trim_start_matches(HASH_PREFIX).to_string();

        debug!("Downloading {} from {}", uri, url);
        let target = entry.clone();
        let size = tokio::task::spawn_blocking(move || fetch(&url, &target, &expected))
            .await
            .map_err(|e| AgentError::Internal(format!("download task failed: {}", e)))??;

        info!(hash = %hash, bytes = size, "image downloaded");
        Ok(entry)
    }
}

fn fetch(url: &str, entry: &CacheEntry, expected_digest: &str) -> AgentResult<u64> {
    let response = ureq::get(url).call().map_err(|e| AgentError::Download {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    store_verified(entry, response.into_body().into_reader(), expected_digest)
}
