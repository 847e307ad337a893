//! Mount state machine
//!
//! Every transition is persisted before the mount action runs, so a crash in
//! the middle leaves an intermediate state that `reconcile` can finish:
//!
//! ```text
//! Unmounted/MountError --mount--> Requested --ok--> Mounted
//!                                           --err-> MountError
//! Mounted --unmount--> UnmountRequested --ok--> Unmounted
//!                                       --err-> Mounted (last_error set)
//! ```

use crate::concurrency::TreeLockManager;
use crate::error::DaemonError;
use crate::store::{ImageRecord, ImageRecordStore, MountState};
use crate::types::{is_tree_hash, TREE_HASH_LEN};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{info, warn};

/// Filesystem mount capability.
pub trait Mounter: Send + Sync {
    /// Mount the image identified by `fsid` at `mount_point`.
    fn mount(&self, fsid: &str, mount_point: &Path) -> Result<(), DaemonError>;
    fn unmount(&self, mount_point: &Path) -> Result<(), DaemonError>;
    fn is_mounted(&self, mount_point: &Path) -> Result<bool, DaemonError>;
}

/// Mounts erofs through mount(8) in our fscache domain.
pub struct SystemMounter {
    domain_id: String,
}

impl SystemMounter {
    pub fn new(domain_id: &str) -> Self {
        Self {
            domain_id: domain_id.to_string(),
        }
    }
}

fn run(cmd: &mut Command) -> Result<(), DaemonError> {
    let out = cmd.output()?;
    if !out.status.success() {
        return Err(DaemonError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "{:?} exited with {}: {}",
                cmd,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        )));
    }
    Ok(())
}

/// Undo the octal escapes mountinfo uses for whitespace and backslashes.
fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes[i] == b'\\'
            && i + 4 <= bytes.len()
            && bytes[i + 1..i + 4].iter().all(|c| (b'0'..=b'7').contains(c));
        if octal {
            let v = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, c| acc * 8 + (c - b'0') as u32);
            out.push(v as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points listed in a mountinfo table.
pub fn parse_mountinfo(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_mountinfo(field)))
        .collect()
}

impl Mounter for SystemMounter {
    fn mount(&self, fsid: &str, mount_point: &Path) -> Result<(), DaemonError> {
        std::fs::create_dir_all(mount_point)?;
        let opts = format!("domain_id={},fsid={}", self.domain_id, fsid);
        run(Command::new("mount")
            .args(["-t", "erofs", "-o", &opts, "none"])
            .arg(mount_point))
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), DaemonError> {
        run(Command::new("umount").arg(mount_point))
    }

    fn is_mounted(&self, mount_point: &Path) -> Result<bool, DaemonError> {
        let table = std::fs::read_to_string("/proc/self/mountinfo")?;
        Ok(parse_mountinfo(&table).iter().any(|p| p == mount_point))
    }
}

/// Extract the tree hash from `<abs store dir>/<hash>-<name>`.
pub fn parse_tree_path(tree_path: &str) -> Result<String, DaemonError> {
    let path = Path::new(tree_path);
    if !path.is_absolute() {
        return Err(DaemonError::InvalidRequest(format!("{} is not absolute", tree_path)));
    }
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DaemonError::InvalidRequest(format!("{} has no final component", tree_path)))?;
    let hash = base.get(..TREE_HASH_LEN).unwrap_or_default();
    let rest = base.get(TREE_HASH_LEN..).unwrap_or_default();
    if !is_tree_hash(hash) || !rest.starts_with('-') || rest.len() < 2 {
        return Err(DaemonError::InvalidRequest(format!(
            "{} is not <hash>-<name>",
            tree_path
        )));
    }
    Ok(hash.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    pub tree_path: String,
    pub upstream: String,
    pub mount_point: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub remounted: Vec<String>,
    pub unmounted: Vec<String>,
    pub failed: Vec<String>,
}

pub struct MountManager {
    records: Arc<dyn ImageRecordStore>,
    mounter: Arc<dyn Mounter>,
    locks: TreeLockManager,
}

impl MountManager {
    pub fn new(records: Arc<dyn ImageRecordStore>, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            records,
            mounter,
            locks: TreeLockManager::new(),
        }
    }

    fn save(&self, record: &mut ImageRecord, state: MountState) -> Result<(), DaemonError> {
        // image facts are written by the open path, possibly mid-mount
        if let Some(current) = self.records.get_image(&record.tree_hash)? {
            record.manifest_size = current.manifest_size;
            record.image_size = current.image_size;
        }
        record.mount_state = state;
        record.updated_at = Utc::now();
        self.records.put_image(record)?;
        Ok(())
    }

    /// Mount a tree. Blocks for the duration of the mount.
    pub fn request_mount(&self, req: &MountRequest) -> Result<ImageRecord, DaemonError> {
        let hash = parse_tree_path(&req.tree_path)?;
        if req.upstream.trim().is_empty() {
            return Err(DaemonError::InvalidRequest("missing upstream".to_string()));
        }
        if !Path::new(&req.mount_point).is_absolute() {
            return Err(DaemonError::InvalidRequest(format!(
                "mount point {} is not absolute",
                req.mount_point
            )));
        }

        let _guard = self.locks.lock(&hash);

        let mut record = match self.records.get_image(&hash)? {
            Some(existing) if existing.mount_state == MountState::Mounted => {
                return Err(DaemonError::Conflict(format!(
                    "{} already mounted at {}",
                    req.tree_path, existing.mount_point
                )));
            }
            Some(mut existing) => {
                existing.tree_path = req.tree_path.clone();
                existing.upstream = req.upstream.clone();
                existing.mount_point = req.mount_point.clone();
                existing
            }
            None => ImageRecord::new(&hash, &req.tree_path, &req.upstream, &req.mount_point),
        };
        record.last_error = None;
        self.save(&mut record, MountState::Requested)?;
        self.perform_mount(&mut record)?;
        Ok(record)
    }

    fn perform_mount(&self, record: &mut ImageRecord) -> Result<(), DaemonError> {
        match self.mounter.mount(&record.tree_hash, Path::new(&record.mount_point)) {
            Ok(()) => {
                record.last_error = None;
                self.save(record, MountState::Mounted)?;
                info!(tree = %record.tree_hash, mount_point = %record.mount_point, "Mounted");
                Ok(())
            }
            Err(e) => {
                record.last_error = Some(e.to_string());
                self.save(record, MountState::MountError)?;
                warn!(tree = %record.tree_hash, error = %e, "Mount failed");
                Err(e)
            }
        }
    }

    /// Unmount a tree. Rejected unless it is currently mounted.
    pub fn request_unmount(&self, tree_path: &str) -> Result<ImageRecord, DaemonError> {
        let hash = parse_tree_path(tree_path)?;
        let _guard = self.locks.lock(&hash);

        let mut record = self
            .records
            .get_image(&hash)?
            .ok_or_else(|| DaemonError::NotFound(format!("{} is not known", tree_path)))?;
        if record.mount_state != MountState::Mounted {
            return Err(DaemonError::Conflict(format!(
                "{} is {:?}, not mounted",
                tree_path, record.mount_state
            )));
        }
        self.save(&mut record, MountState::UnmountRequested)?;
        self.perform_unmount(&mut record)?;
        Ok(record)
    }

    fn perform_unmount(&self, record: &mut ImageRecord) -> Result<(), DaemonError> {
        match self.mounter.unmount(Path::new(&record.mount_point)) {
            Ok(()) => {
                record.last_error = None;
                self.save(record, MountState::Unmounted)?;
                info!(tree = %record.tree_hash, "Unmounted");
                Ok(())
            }
            Err(e) => {
                record.last_error = Some(e.to_string());
                self.save(record, MountState::Mounted)?;
                warn!(tree = %record.tree_hash, error = %e, "Unmount failed");
                Err(e)
            }
        }
    }

    /// Bring the system in line with persisted intent after a restart.
    pub fn reconcile(&self) -> Result<ReconcileReport, DaemonError> {
        let mut report = ReconcileReport::default();
        for record in self.records.list_images()? {
            let _guard = self.locks.lock(&record.tree_hash);
            let mut record = record;
            let mp = PathBuf::from(&record.mount_point);
            let outcome = match record.mount_state {
                MountState::Mounted if self.mounter.is_mounted(&mp)? => continue,
                MountState::Mounted | MountState::Requested => {
                    let r = self.perform_mount(&mut record);
                    if r.is_ok() {
                        report.remounted.push(record.tree_hash.clone());
                    }
                    r
                }
                MountState::UnmountRequested => {
                    let r = if self.mounter.is_mounted(&mp)? {
                        self.perform_unmount(&mut record)
                    } else {
                        record.last_error = None;
                        self.save(&mut record, MountState::Unmounted)
                    };
                    if r.is_ok() {
                        report.unmounted.push(record.tree_hash.clone());
                    }
                    r
                }
                MountState::Unmounted | MountState::MountError => continue,
            };
            if outcome.is_err() {
                report.failed.push(record.tree_hash.clone());
            }
        }
        info!(
            remounted = report.remounted.len(),
            unmounted = report.unmounted.len(),
            failed = report.failed.len(),
            "Reconciled mounts"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;
    use crate::types::GlobalParams;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeMounter {
        mounted: Mutex<HashSet<PathBuf>>,
        fail_mount: Mutex<bool>,
        fail_unmount: Mutex<bool>,
    }

    impl Mounter for FakeMounter {
        fn mount(&self, _fsid: &str, mp: &Path) -> Result<(), DaemonError> {
            if *self.fail_mount.lock() {
                return Err(DaemonError::Io(io::Error::new(io::ErrorKind::Other, "mount failed")));
            }
            self.mounted.lock().insert(mp.to_path_buf());
            Ok(())
        }

        fn unmount(&self, mp: &Path) -> Result<(), DaemonError> {
            if *self.fail_unmount.lock() {
                return Err(DaemonError::Io(io::Error::new(io::ErrorKind::Other, "busy")));
            }
            self.mounted.lock().remove(mp);
            Ok(())
        }

        fn is_mounted(&self, mp: &Path) -> Result<bool, DaemonError> {
            Ok(self.mounted.lock().contains(mp))
        }
    }

    const TREE: &str = "/nix/store/0123456789abcdfghijklmnpqrsvwxyz-hello-2.12";
    const HASH: &str = "0123456789abcdfghijklmnpqrsvwxyz";

    fn setup() -> (MountManager, SledStore, Arc<FakeMounter>) {
        let store = SledStore::temporary(&GlobalParams::default()).unwrap();
        let mounter = Arc::new(FakeMounter::default());
        let manager = MountManager::new(Arc::new(store.clone()), mounter.clone());
        (manager, store, mounter)
    }

    fn request(mp: &str) -> MountRequest {
        MountRequest {
            tree_path: TREE.to_string(),
            upstream: "https://cache.example.org".to_string(),
            mount_point: mp.to_string(),
        }
    }

    #[test]
    fn test_parse_tree_path() {
        assert_eq!(parse_tree_path(TREE).unwrap(), HASH);
        assert!(parse_tree_path("relative/0123456789abcdfghijklmnpqrsvwxyz-x").is_err());
        assert!(parse_tree_path("/nix/store/0123456789abcdfghijklmnpqrsvwxyz").is_err());
        assert!(parse_tree_path("/nix/store/0123456789abcdfghijklmnpqrsvwxye-x").is_err());
        assert!(parse_tree_path("/nix/store/short-x").is_err());
    }

    #[test]
    fn test_mount_then_conflict() {
        let (manager, store, _) = setup();
        let rec = manager.request_mount(&request("/mnt/a")).unwrap();
        assert_eq!(rec.mount_state, MountState::Mounted);
        assert_eq!(store.get_image(HASH).unwrap().unwrap().mount_state, MountState::Mounted);

        let err = manager.request_mount(&request("/mnt/b")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn test_mount_validation() {
        let (manager, _, _) = setup();
        let mut no_upstream = request("/mnt/a");
        no_upstream.upstream.clear();
        assert!(manager.request_mount(&no_upstream).is_err());
        assert!(manager.request_mount(&request("mnt/a")).is_err());
    }

    #[test]
    fn test_failed_mount_records_error() {
        let (manager, store, mounter) = setup();
        *mounter.fail_mount.lock() = true;
        assert!(manager.request_mount(&request("/mnt/a")).is_err());
        let rec = store.get_image(HASH).unwrap().unwrap();
        assert_eq!(rec.mount_state, MountState::MountError);
        assert!(rec.last_error.is_some());

        *mounter.fail_mount.lock() = false;
        let rec = manager.request_mount(&request("/mnt/a")).unwrap();
        assert_eq!(rec.mount_state, MountState::Mounted);
        assert!(rec.last_error.is_none());
    }

    #[test]
    fn test_unmount_transitions() {
        let (manager, store, mounter) = setup();
        assert!(manager.request_unmount(TREE).is_err());
        manager.request_mount(&request("/mnt/a")).unwrap();

        *mounter.fail_unmount.lock() = true;
        assert!(manager.request_unmount(TREE).is_err());
        let rec = store.get_image(HASH).unwrap().unwrap();
        assert_eq!(rec.mount_state, MountState::Mounted);
        assert!(rec.last_error.is_some());

        *mounter.fail_unmount.lock() = false;
        let rec = manager.request_unmount(TREE).unwrap();
        assert_eq!(rec.mount_state, MountState::Unmounted);
        assert!(manager.request_unmount(TREE).is_err());
    }

    #[test]
    fn test_reconcile_after_crash() {
        let (manager, store, mounter) = setup();
        // mounted before the crash, gone from the mount table after
        let mut a = ImageRecord::new(HASH, TREE, "up", "/mnt/a");
        a.mount_state = MountState::Mounted;
        store.put_image(&a).unwrap();
        // crashed between persisting intent and mounting
        let mut b = ImageRecord::new("1123456789abcdfghijklmnpqrsvwxyz", "/nix/store/1123456789abcdfghijklmnpqrsvwxyz-b", "up", "/mnt/b");
        b.mount_state = MountState::Requested;
        store.put_image(&b).unwrap();
        // crashed mid-unmount, still mounted
        let mut c = ImageRecord::new("2123456789abcdfghijklmnpqrsvwxyz", "/nix/store/2123456789abcdfghijklmnpqrsvwxyz-c", "up", "/mnt/c");
        c.mount_state = MountState::UnmountRequested;
        store.put_image(&c).unwrap();
        mounter.mounted.lock().insert(PathBuf::from("/mnt/c"));

        let report = manager.reconcile().unwrap();
        assert_eq!(report.remounted.len(), 2);
        assert_eq!(report.unmounted, vec![c.tree_hash.clone()]);
        assert!(report.failed.is_empty());

        assert!(mounter.is_mounted(Path::new("/mnt/a")).unwrap());
        assert!(mounter.is_mounted(Path::new("/mnt/b")).unwrap());
        assert!(!mounter.is_mounted(Path::new("/mnt/c")).unwrap());
        assert_eq!(store.get_image(&c.tree_hash).unwrap().unwrap().mount_state, MountState::Unmounted);
    }

    #[test]
    fn test_parse_mountinfo_escapes() {
        let table = "36 35 98:0 / /mnt/with\\040space rw,noatime - erofs none ro\n\
                     37 35 98:0 / /mnt/plain rw - erofs none ro\n";
        let points = parse_mountinfo(table);
        assert_eq!(points, vec![PathBuf::from("/mnt/with space"), PathBuf::from("/mnt/plain")]);
    }
}
