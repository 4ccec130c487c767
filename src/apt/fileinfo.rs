use std::io;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MD5_LEN: usize = 16;
pub const SHA1_LEN: usize = 20;
pub const SHA256_LEN: usize = 32;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Description of one archive file: its clean relative path, size and
/// whichever of the MD5/SHA1/SHA256 digests are known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FileInfoRepr", into = "FileInfoRepr")]
pub struct FileInfo {
    path: String,
    size: u64,
    md5: Option<[u8; MD5_LEN]>,
    sha1: Option<[u8; SHA1_LEN]>,
    sha256: Option<[u8; SHA256_LEN]>,
}

impl FileInfo {
    /// A FileInfo carrying only a size. Digests can be filled in later
    /// with [`FileInfo::calc_checksums`].
    pub fn no_checksum(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            md5: None,
            sha1: None,
            sha256: None,
        }
    }

    pub(crate) fn from_parts(
        path: String,
        size: u64,
        md5: Option<[u8; MD5_LEN]>,
        sha1: Option<[u8; SHA1_LEN]>,
        sha256: Option<[u8; SHA256_LEN]>,
    ) -> Self {
        Self {
            path,
            size,
            md5,
            sha1,
            sha256,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn has_checksum(&self) -> bool {
        self.md5.is_some() || self.sha1.is_some() || self.sha256.is_some()
    }

    pub fn calc_checksums(&mut self, data: &[u8]) {
        self.size = data.len() as u64;
        self.md5 = Some(Md5::digest(data).into());
        self.sha1 = Some(Sha1::digest(data).into());
        self.sha256 = Some(Sha256::digest(data).into());
    }

    /// Compares two FileInfo. Digests known on only one side are
    /// ignored, so a partially-known FileInfo from index metadata can
    /// be compared against a fully-hashed one.
    pub fn same(&self, other: &FileInfo) -> bool {
        if self.path != other.path || self.size != other.size {
            return false;
        }
        if let (Some(a), Some(b)) = (&self.md5, &other.md5) {
            if a != b {
                return false;
            }
        }
        if let (Some(a), Some(b)) = (&self.sha1, &other.sha1) {
            if a != b {
                return false;
            }
        }
        if let (Some(a), Some(b)) = (&self.sha256, &other.sha256) {
            if a != b {
                return false;
            }
        }
        true
    }

    pub fn md5sum_path(&self) -> Option<String> {
        self.hash_path("MD5Sum", self.md5.as_ref().map(|d| &d[..]))
    }

    pub fn sha1_path(&self) -> Option<String> {
        self.hash_path("SHA1", self.sha1.as_ref().map(|d| &d[..]))
    }

    pub fn sha256_path(&self) -> Option<String> {
        self.hash_path("SHA256", self.sha256.as_ref().map(|d| &d[..]))
    }

    fn hash_path(&self, algo: &str, digest: Option<&[u8]>) -> Option<String> {
        let digest = digest?;
        let hex = hex::encode(digest);
        Some(match self.path.rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/by-hash/{algo}/{hex}"),
            None => format!("by-hash/{algo}/{hex}"),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct FileInfoRepr {
    path: String,
    size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    md5sum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
}

impl From<FileInfo> for FileInfoRepr {
    fn from(fi: FileInfo) -> Self {
        Self {
            path: fi.path,
            size: fi.size,
            md5sum: fi.md5.map(hex::encode),
            sha1: fi.sha1.map(hex::encode),
            sha256: fi.sha256.map(hex::encode),
        }
    }
}

impl TryFrom<FileInfoRepr> for FileInfo {
    type Error = hex::FromHexError;

    fn try_from(repr: FileInfoRepr) -> Result<Self, Self::Error> {
        Ok(Self {
            path: repr.path,
            size: repr.size,
            md5: repr.md5sum.as_deref().map(decode_digest).transpose()?,
            sha1: repr.sha1.as_deref().map(decode_digest).transpose()?,
            sha256: repr.sha256.as_deref().map(decode_digest).transpose()?,
        })
    }
}

pub(crate) fn decode_digest<const N: usize>(hex_str: &str) -> Result<[u8; N], hex::FromHexError> {
    let mut out = [0u8; N];
    hex::decode_to_slice(hex_str, &mut out)?;
    Ok(out)
}

/// Streams `r` into `w` while accumulating MD5, SHA1, SHA256 and the
/// total size, and returns the fully-populated FileInfo for `path`.
pub async fn copy_with_file_info<R, W>(mut r: R, mut w: W, path: &str) -> io::Result<FileInfo>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut md5 = Md5::new();
    let mut sha1 = Sha1::new();
    let mut sha256 = Sha256::new();
    let mut size = 0u64;

    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        md5.update(chunk);
        sha1.update(chunk);
        sha256.update(chunk);
        w.write_all(chunk).await?;
        size += n as u64;
    }
    w.flush().await?;

    Ok(FileInfo {
        path: path.to_string(),
        size,
        md5: Some(md5.finalize().into()),
        sha1: Some(sha1.finalize().into()),
        sha256: Some(sha256.finalize().into()),
    })
}
