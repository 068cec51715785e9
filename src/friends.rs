//! Friend peers: other instances allowed to pull downloads shared here.
//!
//! Friends persist either as zero-byte marker files under `.friends/` in the
//! download root, or through the link-local metadata service when the server
//! runs in metadata mode.

use crate::error::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const METADATA_LINKS_URL: &str = "http://169.254.169.254/v1/links";

#[derive(Debug, Clone, Serialize)]
pub struct Friend {
    pub id: String,
}

#[derive(Clone)]
pub struct Friends {
    store: Store,
    http: reqwest::Client,
}

#[derive(Clone)]
enum Store {
    /// `.friends/<host>` marker files.
    Dir(PathBuf),
    /// Delegated to the metadata service.
    Metadata,
}

impl Friends {
    /// Persist friends as files under `<root>/.friends`.
    pub fn file_store(root: &Path) -> Result<Friends> {
        let dir = root.join(".friends");
        std::fs::create_dir_all(&dir)?;
        Ok(Friends {
            store: Store::Dir(dir),
            http: Self::client(),
        })
    }

    /// Delegate persistence to the metadata service.
    pub fn metadata_store() -> Friends {
        Friends {
            store: Store::Metadata,
            http: Self::client(),
        }
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default()
    }

    pub async fn list(&self) -> Result<Vec<Friend>> {
        match &self.store {
            Store::Dir(dir) => {
                let mut friends = Vec::new();
                for entry in std::fs::read_dir(dir)? {
                    let entry = entry?;
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    friends.push(Friend {
                        id: entry.file_name().to_string_lossy().into_owned(),
                    });
                }
                friends.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(friends)
            }
            Store::Metadata => {
                let body = self.http.get(METADATA_LINKS_URL).send().await?;
                let text = body.text().await?;
                Ok(text
                    .split_whitespace()
                    .map(|host| Friend {
                        id: host.to_string(),
                    })
                    .collect())
            }
        }
    }

    pub async fn add(&self, host: &str) -> Result<()> {
        if !valid_host(host) {
            return Err(Error::InvalidFriendHost(host.to_string()));
        }
        match &self.store {
            Store::Dir(dir) => {
                std::fs::File::create(dir.join(host))?;
                Ok(())
            }
            Store::Metadata => {
                self.http
                    .post(format!("{METADATA_LINKS_URL}?host={}", urlencoding::encode(host)))
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(())
            }
        }
    }

    pub async fn remove(&self, host: &str) -> Result<()> {
        match &self.store {
            Store::Dir(dir) => {
                std::fs::remove_file(dir.join(host))?;
                Ok(())
            }
            Store::Metadata => {
                self.http
                    .delete(format!("{METADATA_LINKS_URL}?host={}", urlencoding::encode(host)))
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(())
            }
        }
    }

    pub async fn find(&self, host: &str) -> Result<Friend> {
        self.list()
            .await?
            .into_iter()
            .find(|friend| friend.id == host)
            .ok_or(Error::NotFound)
    }

    pub async fn contains(&self, host: &str) -> bool {
        self.find(host).await.is_ok()
    }
}

/// Hostname check: a leading alphanumeric followed by at least one more
/// alphanumeric, dot or dash.
pub fn valid_host(host: &str) -> bool {
    let mut chars = host.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    let mut rest = 0;
    for c in chars {
        if !(c.is_ascii_alphanumeric() || c == '.' || c == '-') {
            return false;
        }
        rest += 1;
    }
    rest > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn host_validation() {
        assert!(valid_host("example.com"));
        assert!(valid_host("a1-b.example.com"));
        assert!(valid_host("ab"));

        assert!(!valid_host(""));
        assert!(!valid_host("a"));
        assert!(!valid_host("-bad.example.com"));
        assert!(!valid_host(".bad"));
        assert!(!valid_host("bad host"));
        assert!(!valid_host("bad/host"));
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let tmp = tempdir().unwrap();
        let friends = Friends::file_store(tmp.path()).unwrap();

        friends.add("peer.example.com").await.unwrap();
        friends.add("other.example.com").await.unwrap();

        let ids: Vec<_> = friends.list().await.unwrap().into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["other.example.com", "peer.example.com"]);
        assert!(friends.contains("peer.example.com").await);

        friends.remove("peer.example.com").await.unwrap();
        assert!(!friends.contains("peer.example.com").await);
        assert!(matches!(
            friends.find("peer.example.com").await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn rejects_invalid_hosts() {
        let tmp = tempdir().unwrap();
        let friends = Friends::file_store(tmp.path()).unwrap();
        assert!(matches!(
            friends.add("../escape").await,
            Err(Error::InvalidFriendHost(_))
        ));
    }
}
