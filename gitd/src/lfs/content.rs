use std::fs::{File, Metadata};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Returns `true` for a well-formed LFS object id: 64 lowercase hex
/// characters (SHA-256).
pub fn is_valid_oid(oid: &str) -> bool {
    oid.len() == 64 && oid.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Content-addressed object store for Git LFS.
///
/// Objects live at `<base>/<oid[0:2]>/<oid[2:4]>/<oid>`; the pool is
/// global, so identical content pushed to different repositories is
/// stored once. Writes go through a temporary sibling that is verified
/// against the declared size and digest before an atomic rename.
#[derive(Debug, Clone)]
pub struct ContentStore {
    base: PathBuf,
}

impl ContentStore {
    /// Open a store rooted at `base`, creating the directory when absent.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base).map_err(|e| Error::io(&base, e))?;
        Ok(ContentStore { base })
    }

    /// On-disk path for `oid`. Keys shorter than five characters are
    /// stored unsharded.
    pub fn object_path(&self, oid: &str) -> PathBuf {
        if oid.len() < 5 {
            return self.base.join(oid);
        }
        self.base.join(&oid[0..2]).join(&oid[2..4]).join(oid)
    }

    /// Whether `oid` is present.
    pub fn exists(&self, oid: &str) -> bool {
        self.object_path(oid).is_file()
    }

    /// Metadata for a stored object.
    pub fn info(&self, oid: &str) -> Result<Metadata> {
        let path = self.object_path(oid);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(meta),
            Ok(_) => Err(Error::not_found(format!("object {}", oid))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("object {}", oid)))
            }
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    /// Open a stored object for reading.
    pub fn get(&self, oid: &str) -> Result<(File, Metadata)> {
        let meta = self.info(oid)?;
        let path = self.object_path(oid);
        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        Ok((file, meta))
    }

    /// Stream `reader` into the store as `oid`.
    ///
    /// The bytes are hashed while they are written to a temporary
    /// sibling; the write only becomes visible once both the byte count
    /// matches `declared_size` and the SHA-256 digest matches `oid`.
    /// Concurrent puts of the same oid are benign: each writes its own
    /// temp file and the last rename wins with identical content.
    ///
    /// # Errors
    /// [`Error::SizeMismatch`] or [`Error::HashMismatch`] on verification
    /// failure; the temp file is removed in both cases.
    pub fn put(&self, oid: &str, reader: &mut impl Read, declared_size: u64) -> Result<()> {
        let final_path = self.object_path(oid);
        if let Some(parent) = final_path.parent() {
            create_dir_0750(parent)?;
        }

        let tmp_path = final_path.with_extension(format!("{:08x}.tmp", rand::random::<u32>()));
        let mut tmp = File::create(&tmp_path).map_err(|e| Error::io(&tmp_path, e))?;

        let result = copy_verified(oid, reader, &mut tmp, declared_size);
        drop(tmp);

        match result {
            Ok(()) => {
                std::fs::rename(&tmp_path, &final_path).map_err(|e| Error::io(&final_path, e))
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }
}

fn copy_verified(
    oid: &str,
    reader: &mut impl Read,
    out: &mut File,
    declared_size: u64,
) -> Result<()> {
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n])?;
        written += n as u64;
    }
    out.flush()?;

    if written != declared_size {
        return Err(Error::SizeMismatch {
            declared: declared_size,
            actual: written,
        });
    }
    let actual = hex::encode(hasher.finalize());
    if actual != oid {
        return Err(Error::HashMismatch {
            expected: oid.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(unix)]
fn create_dir_0750(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(dir)
        .map_err(|e| Error::io(dir, e))
}

#[cfg(not(unix))]
fn create_dir_0750(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_oid_shape() {
        assert!(is_valid_oid(&"ab".repeat(32)));
        assert!(!is_valid_oid("ABCD"));
        assert!(!is_valid_oid(&"zz".repeat(32)));
        assert!(!is_valid_oid(""));
    }

    #[test]
    fn object_path_sharding() {
        let store = ContentStore {
            base: PathBuf::from("/lfs"),
        };
        assert_eq!(
            store.object_path("abcdef01"),
            PathBuf::from("/lfs/ab/cd/abcdef01")
        );
        assert_eq!(store.object_path("abcd"), PathBuf::from("/lfs/abcd"));
    }
}
