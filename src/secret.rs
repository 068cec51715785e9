//! Numeric secrets persisted beside the library (podcast feed and basic auth
//! password).

use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A random value stored in a file for persistent access.
#[derive(Debug, Clone)]
pub struct Secret {
    path: PathBuf,
}

impl Secret {
    /// Attach to a secret file, creating it when missing.
    ///
    /// Panics when the file cannot be created or read: the download root is
    /// unusable and nothing else can proceed.
    pub fn attach(path: impl Into<PathBuf>) -> Secret {
        let secret = Secret { path: path.into() };
        secret.get();
        secret
    }

    /// The secret value, created on first use.
    pub fn get(&self) -> String {
        if !self.path.exists() {
            if let Err(err) = self.reset() {
                panic!("secret {}: {}", self.path.display(), err);
            }
        }
        match std::fs::read_to_string(&self.path) {
            Ok(value) => value.trim().to_string(),
            Err(err) => panic!("secret {}: {}", self.path.display(), err),
        }
    }

    /// Generate and persist a new value.
    pub fn reset(&self) -> io::Result<()> {
        let value: u32 = rand::random();
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        writeln!(tmp, "{value}")?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stable_until_reset() {
        let tmp = tempdir().unwrap();
        let secret = Secret::attach(tmp.path().join(".feedsecret"));

        let first = secret.get();
        assert!(!first.is_empty());
        assert!(first.parse::<u32>().is_ok());
        assert_eq!(secret.get(), first);

        secret.reset().unwrap();
        // Overwhelmingly likely to differ; equal values would mean reset
        // produced the same 32-bit draw.
        assert!(secret.get().parse::<u32>().is_ok());
    }

    #[test]
    fn shared_between_handles() {
        let tmp = tempdir().unwrap();
        let a = Secret::attach(tmp.path().join(".password"));
        let b = Secret::attach(tmp.path().join(".password"));
        assert_eq!(a.get(), b.get());
    }
}
