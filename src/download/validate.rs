//! Post-transfer integrity checks.
//!
//! A [`Validator`] runs after every segment of an attempt has finished and the
//! destination has been synced. It also runs once before any network activity
//! when the destination is already non-empty, so a file that already passes is
//! never fetched again.
//!
//! # Example
//!
//! ```
//! use resumable_fetch::download::{ChecksumValidator, HashAlgorithm};
//!
//! let validator = ChecksumValidator::new(
//!     HashAlgorithm::Sha1,
//!     "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d",
//! );
//! assert_eq!(validator.algorithm(), HashAlgorithm::Sha1);
//! ```

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, instrument};

use super::error::ValidationError;
use super::positional::read_at;

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Size of the zip end-of-central-directory record without its comment.
const EOCD_LEN: u64 = 22;

/// Longest possible zip archive comment.
const MAX_ZIP_COMMENT: u64 = u16::MAX as u64;

const ZIP_LOCAL_HEADER: [u8; 4] = *b"PK\x03\x04";
const ZIP_EOCD: [u8; 4] = *b"PK\x05\x06";

/// Integrity check for a downloaded file.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Checks the file behind `file` (located at `destination`, fetched from `url`).
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when the content is not acceptable.
    async fn validate(
        &self,
        file: &Arc<File>,
        destination: &Path,
        url: &str,
    ) -> Result<(), ValidationError>;
}

/// Accepts every file.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopValidator;

#[async_trait]
impl Validator for NoopValidator {
    async fn validate(
        &self,
        _file: &Arc<File>,
        _destination: &Path,
        _url: &str,
    ) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1, used by most launcher manifests.
    Sha1,
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl HashAlgorithm {
    /// Lowercase algorithm name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(format!("unsupported hash algorithm: {other}")),
        }
    }
}

/// Compares a streaming digest of the file with an expected hex digest.
#[derive(Debug, Clone)]
pub struct ChecksumValidator {
    algorithm: HashAlgorithm,
    expected: String,
}

impl ChecksumValidator {
    /// Creates a validator for `expected` (hex, any case).
    pub fn new(algorithm: HashAlgorithm, expected: impl Into<String>) -> Self {
        Self {
            algorithm,
            expected: expected.into().trim().to_ascii_lowercase(),
        }
    }

    /// The configured algorithm.
    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// The expected lowercase hex digest.
    #[must_use]
    pub fn expected(&self) -> &str {
        &self.expected
    }
}

#[async_trait]
impl Validator for ChecksumValidator {
    #[instrument(level = "debug", skip(self, file), fields(algorithm = %self.algorithm, path = %destination.display()))]
    async fn validate(
        &self,
        file: &Arc<File>,
        destination: &Path,
        _url: &str,
    ) -> Result<(), ValidationError> {
        let actual = file_digest(Arc::clone(file), destination.to_path_buf(), self.algorithm).await?;
        if actual != self.expected {
            return Err(ValidationError::ChecksumNotMatch {
                algorithm: self.algorithm.name(),
                expected: self.expected.clone(),
                actual,
                path: destination.to_path_buf(),
            });
        }
        debug!("checksum matches");
        Ok(())
    }
}

/// Computes the lowercase hex digest of a whole file.
///
/// # Errors
///
/// Returns [`ValidationError::Io`] if the file cannot be read.
pub async fn file_digest(
    file: Arc<File>,
    path: PathBuf,
    algorithm: HashAlgorithm,
) -> Result<String, ValidationError> {
    let worker_path = path.clone();
    tokio::task::spawn_blocking(move || match algorithm {
        HashAlgorithm::Sha1 => digest_blocking::<Sha1>(&file, &worker_path),
        HashAlgorithm::Sha256 => digest_blocking::<Sha256>(&file, &worker_path),
        HashAlgorithm::Sha512 => digest_blocking::<Sha512>(&file, &worker_path),
    })
    .await
    .map_err(|e| ValidationError::io(path, std::io::Error::other(e)))?
}

fn digest_blocking<D: Digest>(file: &File, path: &Path) -> Result<String, ValidationError>
where
    sha2::digest::Output<D>: fmt::LowerHex,
{
    let mut hasher = D::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut offset = 0u64;

    loop {
        let bytes_read =
            read_at(file, &mut buffer, offset).map_err(|e| ValidationError::io(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        offset += bytes_read as u64;
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Structural check that the file is a well-formed zip (jar) archive.
///
/// Verifies the leading signature and locates an end-of-central-directory
/// record whose comment length reaches exactly to the end of the file.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveValidator;

#[async_trait]
impl Validator for ArchiveValidator {
    #[instrument(level = "debug", skip(self, file), fields(path = %destination.display()))]
    async fn validate(
        &self,
        file: &Arc<File>,
        destination: &Path,
        _url: &str,
    ) -> Result<(), ValidationError> {
        let file = Arc::clone(file);
        let path = destination.to_path_buf();
        let worker_path = path.clone();
        tokio::task::spawn_blocking(move || check_zip_structure(&file, &worker_path))
            .await
            .map_err(|e| ValidationError::io(path, std::io::Error::other(e)))?
    }
}

fn check_zip_structure(file: &File, path: &Path) -> Result<(), ValidationError> {
    let len = file
        .metadata()
        .map_err(|e| ValidationError::io(path, e))?
        .len();
    let malformed = |reason| ValidationError::MalformedArchive {
        path: path.to_path_buf(),
        reason,
    };

    if len < EOCD_LEN {
        return Err(malformed("file too short"));
    }

    let mut signature = [0u8; 4];
    read_exact_at(file, &mut signature, 0).map_err(|e| ValidationError::io(path, e))?;
    if signature != ZIP_LOCAL_HEADER && signature != ZIP_EOCD {
        return Err(malformed("missing zip signature"));
    }

    let tail_len = len.min(EOCD_LEN + MAX_ZIP_COMMENT);
    let tail_start = len - tail_len;
    let mut tail = vec![0u8; usize::try_from(tail_len).unwrap_or(usize::MAX)];
    read_exact_at(file, &mut tail, tail_start).map_err(|e| ValidationError::io(path, e))?;

    let eocd_len = usize::try_from(EOCD_LEN).unwrap_or(usize::MAX);
    let found = (0..=tail.len() - eocd_len).rev().any(|pos| {
        if tail[pos..pos + 4] != ZIP_EOCD {
            return false;
        }
        let comment_len = usize::from(u16::from_le_bytes([tail[pos + 20], tail[pos + 21]]));
        pos + eocd_len + comment_len == tail.len()
    });

    if found {
        Ok(())
    } else {
        Err(malformed("end of central directory not found"))
    }
}

fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    while !buf.is_empty() {
        match read_at(file, buf, offset)? {
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

/// Runs several validators; all must pass, first failure wins.
#[derive(Clone, Default)]
pub struct ValidatorChain {
    validators: Vec<Arc<dyn Validator>>,
}

impl ValidatorChain {
    /// Creates an empty chain (accepts everything).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a validator.
    #[must_use]
    pub fn with(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }
}

impl fmt::Debug for ValidatorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorChain")
            .field("len", &self.validators.len())
            .finish()
    }
}

#[async_trait]
impl Validator for ValidatorChain {
    async fn validate(
        &self,
        file: &Arc<File>,
        destination: &Path,
        url: &str,
    ) -> Result<(), ValidationError> {
        for validator in &self.validators {
            validator.validate(file, destination, url).await?;
        }
        Ok(())
    }
}
