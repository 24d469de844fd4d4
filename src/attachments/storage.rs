use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::snowflake::Snowflake;
use crate::utils::SyncError;

const PART_SUFFIX: &str = ".part";
const MAX_NAME_CANDIDATES: usize = 10_000;

/// Where an attachment's file lives below the storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageLocation {
    pub community_id: Snowflake,
    pub channel_id: Snowflake,
    pub message_id: Snowflake,
}

impl StorageLocation {
    fn relative_dir(&self) -> String {
        format!(
            "{}/{}/{}",
            self.community_id, self.channel_id, self.message_id
        )
    }
}

/// Files are laid out as `{root}/{community}/{channel}/{message}/{filename}`.
/// Stored paths are relative to the root and always use `/`.
#[derive(Debug, Clone)]
pub struct AttachmentStorage {
    root: PathBuf,
}

impl AttachmentStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|segment| !segment.is_empty() && *segment != "..")
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    pub async fn exists(&self, relative: &str) -> bool {
        tokio::fs::try_exists(self.absolute(relative))
            .await
            .unwrap_or(false)
    }

    /// A fresh scratch file path next to the final location.
    pub async fn part_file(&self, location: &StorageLocation) -> Result<PathBuf, SyncError> {
        let dir = self.absolute(&location.relative_dir());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir.join(format!(".{}{}", uuid::Uuid::new_v4().simple(), PART_SUFFIX)))
    }

    /// Moves a finished part file to a unique name and returns its stored path.
    pub async fn commit(
        &self,
        part: &Path,
        location: &StorageLocation,
        filename: &str,
    ) -> Result<String, SyncError> {
        let relative_dir = location.relative_dir();
        let dir = self.absolute(&relative_dir);
        tokio::fs::create_dir_all(&dir).await?;
        let name = sanitize_filename(filename).unwrap_or_else(|| "attachment".to_string());

        for n in 0..MAX_NAME_CANDIDATES {
            let candidate = numbered_name(&name, n);
            let target = dir.join(&candidate);
            // Claim the name first so concurrent commits never overwrite each other.
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .await
            {
                Ok(_) => {
                    tokio::fs::rename(part, &target).await?;
                    return Ok(format!("{relative_dir}/{candidate}"));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(SyncError::Storage(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free file name for {name} in {relative_dir}"),
        )))
    }

    /// Best effort removal; a missing file is not an error.
    pub async fn remove(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove {}: {}", path.display(), err),
        }
    }
}

pub fn is_part_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(PART_SUFFIX)
}

fn numbered_name(name: &str, n: usize) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{n}.{ext}"),
        _ => format!("{name}_{n}"),
    }
}

/// Basename only, without control characters or leading dots.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let basename = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed).trim();
    let cleaned: String = basename
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}
