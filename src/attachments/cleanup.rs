use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use super::storage::{AttachmentStorage, is_part_file};
use crate::db::AttachmentStore;
use crate::utils::SyncError;

/// Scratch files of a live download are never younger than this when removed.
const PART_FILE_GRACE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub dry_run: bool,
    pub files_deleted: usize,
    pub bytes_reclaimed: u64,
    pub dirs_removed: usize,
    pub records_reset: usize,
    pub errors: Vec<String>,
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reconciliation{}: {} orphan file(s), {} bytes, {} empty dir(s), {} record(s) reset, {} error(s)",
            if self.dry_run { " (dry run)" } else { "" },
            self.files_deleted,
            self.bytes_reclaimed,
            self.dirs_removed,
            self.records_reset,
            self.errors.len()
        )
    }
}

struct StoredFile {
    relative: String,
    path: PathBuf,
    size: u64,
    age: Duration,
}

/// Brings storage and records back in line: deletes files nothing points at
/// and resets records whose file disappeared. Each side only touches what the
/// other side lacks, so it is safe to run next to active downloads.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn AttachmentStore>,
    storage: AttachmentStorage,
    retention: Duration,
}

impl Reconciler {
    /// A zero retention deletes orphans regardless of age.
    pub fn new(store: Arc<dyn AttachmentStore>, storage: AttachmentStorage, retention: Duration) -> Self {
        Self {
            store,
            storage,
            retention,
        }
    }

    pub fn from_days(
        store: Arc<dyn AttachmentStore>,
        storage: AttachmentStorage,
        retention_days: u64,
    ) -> Self {
        Self::new(
            store,
            storage,
            Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60)),
        )
    }

    pub async fn run(&self, dry_run: bool) -> Result<ReconcileReport, SyncError> {
        let mut report = ReconcileReport {
            dry_run,
            ..ReconcileReport::default()
        };
        self.remove_orphans(dry_run, &mut report).await?;
        self.reset_missing(dry_run, &mut report).await?;
        info!("{}", report);
        Ok(report)
    }

    async fn remove_orphans(&self, dry_run: bool, report: &mut ReconcileReport) -> Result<(), SyncError> {
        let root = self.storage.root().to_path_buf();
        if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
            return Ok(());
        }

        let referenced = self.store.list_local_paths().await?;
        let scan_root = root.clone();
        let (files, mut errors) = tokio::task::spawn_blocking(move || scan_files(&scan_root))
            .await
            .map_err(|e| SyncError::Storage(std::io::Error::other(e.to_string())))?;
        report.errors.append(&mut errors);

        for file in files {
            if referenced.contains(&file.relative) || !self.is_expired(&file) {
                continue;
            }
            debug!("orphaned attachment file {}", file.relative);
            if !dry_run {
                if let Err(err) = tokio::fs::remove_file(&file.path).await {
                    warn!("failed to delete orphan {}: {}", file.relative, err);
                    report.errors.push(format!("{}: {}", file.relative, err));
                    continue;
                }
            }
            report.files_deleted += 1;
            report.bytes_reclaimed += file.size;
        }

        if !dry_run {
            let (removed, mut errors) =
                tokio::task::spawn_blocking(move || remove_empty_dirs(&root))
                    .await
                    .map_err(|e| SyncError::Storage(std::io::Error::other(e.to_string())))?;
            report.dirs_removed = removed;
            report.errors.append(&mut errors);
        }
        Ok(())
    }

    async fn reset_missing(&self, dry_run: bool, report: &mut ReconcileReport) -> Result<(), SyncError> {
        for mut attachment in self.store.list_cached().await? {
            let present = match attachment.local_path.as_deref() {
                Some(path) => self.storage.exists(path).await,
                None => false,
            };
            if present {
                continue;
            }
            debug!("attachment {} lost its file, resetting", attachment.id);
            if !dry_run {
                attachment.reset_cache();
                self.store.update_attachment_tracking(&attachment).await?;
            }
            report.records_reset += 1;
        }
        Ok(())
    }

    fn is_expired(&self, file: &StoredFile) -> bool {
        let name = file.relative.rsplit('/').next().unwrap_or_default();
        let min_age = if is_part_file(name) {
            self.retention.max(PART_FILE_GRACE)
        } else {
            self.retention
        };
        min_age.is_zero() || file.age > min_age
    }
}

fn scan_files(root: &Path) -> (Vec<StoredFile>, Vec<String>) {
    let mut files = Vec::new();
    let mut errors = Vec::new();
    let mut stack = vec![(root.to_path_buf(), String::new())];
    let now = SystemTime::now();

    while let Some((dir, prefix)) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                errors.push(format!("{}: {}", dir.display(), err));
                continue;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    errors.push(format!("{relative}: {err}"));
                    continue;
                }
            };
            if metadata.is_dir() {
                stack.push((entry.path(), relative));
            } else if metadata.is_file() {
                let age = metadata
                    .modified()
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .unwrap_or_default();
                files.push(StoredFile {
                    relative,
                    path: entry.path(),
                    size: metadata.len(),
                    age,
                });
            }
        }
    }
    (files, errors)
}

// Depth first; the root itself is kept.
fn remove_empty_dirs(root: &Path) -> (usize, Vec<String>) {
    fn visit(dir: &Path, is_root: bool, removed: &mut usize, errors: &mut Vec<String>) -> bool {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };
        let mut empty = true;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if !visit(&path, false, removed, errors) {
                    empty = false;
                }
            } else {
                empty = false;
            }
        }
        if empty && !is_root {
            match std::fs::remove_dir(dir) {
                Ok(()) => {
                    *removed += 1;
                    return true;
                }
                Err(err) => {
                    errors.push(format!("{}: {}", dir.display(), err));
                    return false;
                }
            }
        }
        empty
    }

    let mut removed = 0;
    let mut errors = Vec::new();
    visit(root, true, &mut removed, &mut errors);
    (removed, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AttachmentStatus;
    use crate::services::{ReferenceMode, Services};
    use crate::test_support::{TestDb, attachment_dto, message_dto, seed_channel, sf};

    async fn setup() -> (TestDb, AttachmentStorage) {
        let db = TestDb::new().await;
        seed_channel(&db, 1, 10).await;
        let mut dto = message_dto(100, 10, 5);
        dto.attachments = vec![attachment_dto(7, 4), attachment_dto(8, 4)];
        Services::new(&db.manager)
            .messages
            .upsert(&dto, ReferenceMode::Deferred)
            .await
            .unwrap();
        let storage = AttachmentStorage::new(db.dir.path().join("files"));
        (db, storage)
    }

    async fn write(storage: &AttachmentStorage, relative: &str, body: &[u8]) {
        let path = storage.absolute(relative);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, body).await.unwrap();
    }

    async fn cache(db: &TestDb, id: u64, relative: &str) {
        let store = db.manager.attachment_store();
        let mut attachment = store.get_attachment(sf(id)).await.unwrap().unwrap();
        attachment.mark_cached(relative.to_string(), format!("hash-{id}"));
        store.update_attachment_tracking(&attachment).await.unwrap();
    }

    #[tokio::test]
    async fn orphans_are_deleted_and_missing_files_reset() {
        let (db, storage) = setup().await;
        write(&storage, "1/10/100/kept.png", b"kept").await;
        write(&storage, "1/10/100/orphan.png", b"orphan!").await;
        write(&storage, "9/9/9/stray.bin", b"xx").await;
        cache(&db, 7, "1/10/100/kept.png").await;
        cache(&db, 8, "1/10/100/gone.png").await;

        let reconciler = Reconciler::new(db.manager.attachment_store(), storage.clone(), Duration::ZERO);
        let report = reconciler.run(false).await.unwrap();

        assert_eq!(report.files_deleted, 2);
        assert_eq!(report.bytes_reclaimed, 9);
        assert_eq!(report.records_reset, 1);
        assert_eq!(report.dirs_removed, 3);
        assert!(storage.exists("1/10/100/kept.png").await);
        assert!(!storage.exists("1/10/100/orphan.png").await);

        let reset = db.manager.attachment_store().get_attachment(sf(8)).await.unwrap().unwrap();
        assert_eq!(reset.status, AttachmentStatus::Pending);
        assert!(!reset.cached);
        assert_eq!(reset.local_path, None);
    }

    #[tokio::test]
    async fn dry_run_changes_nothing() {
        let (db, storage) = setup().await;
        write(&storage, "1/10/100/orphan.png", b"orphan!").await;
        cache(&db, 8, "1/10/100/gone.png").await;

        let reconciler = Reconciler::new(db.manager.attachment_store(), storage.clone(), Duration::ZERO);
        let report = reconciler.run(true).await.unwrap();

        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.records_reset, 1);
        assert!(storage.exists("1/10/100/orphan.png").await);
        let untouched = db.manager.attachment_store().get_attachment(sf(8)).await.unwrap().unwrap();
        assert!(untouched.cached);
    }

    #[tokio::test]
    async fn fresh_orphans_survive_retention_window() {
        let (db, storage) = setup().await;
        write(&storage, "1/10/100/orphan.png", b"orphan!").await;
        write(&storage, "1/10/100/.abc.part", b"partial").await;

        let reconciler = Reconciler::from_days(db.manager.attachment_store(), storage.clone(), 30);
        let report = reconciler.run(false).await.unwrap();
        assert_eq!(report.files_deleted, 0);
        assert!(storage.exists("1/10/100/orphan.png").await);

        // Scratch files of running downloads are kept even without retention.
        let eager = Reconciler::new(db.manager.attachment_store(), storage.clone(), Duration::ZERO);
        eager.run(false).await.unwrap();
        assert!(storage.exists("1/10/100/.abc.part").await);
        assert!(!storage.exists("1/10/100/orphan.png").await);
    }

    #[test]
    fn report_renders_summary() {
        let report = ReconcileReport {
            dry_run: true,
            files_deleted: 2,
            ..ReconcileReport::default()
        };
        assert!(report.to_string().starts_with("reconciliation (dry run): 2 orphan"));
    }
}
