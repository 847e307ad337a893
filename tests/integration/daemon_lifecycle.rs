use crate::support::{wait_until, FakeDevice, FakeMounter, FakeUpstream};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cachefsd::config::DaemonConfig;
use cachefsd::control::{ControlClient, ControlRequest, DebugReport};
use cachefsd::daemon::{Daemon, DaemonDeps};
use cachefsd::kernel::wire::volume_key;
use cachefsd::kernel::{Command, Message};
use cachefsd::manifest::{
    chunk_digest, EnvelopeEntry, Manifest, ManifestEntry, SignedEnvelope, MANIFEST_CONTEXT,
};
use cachefsd::store::{ImageRecord, ImageRecordStore, MountState, SledStore};
use cachefsd::types::GlobalParams;
use ed25519_dalek::SigningKey;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const HASH: &str = "0123456789abcdfghijklmnpqrsvwxyz";
const DOMAIN: &str = "itest";

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[11u8; 32])
}

fn config(dir: &tempfile::TempDir) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.cache_path = dir.path().join("cache");
    config.domain_id = DOMAIN.to_string();
    config.workers = 4;
    config.poll_timeout_ms = 20;
    config.upstream = "https://cache.example".to_string();
    config.public_keys = vec![format!(
        "itest-1:{}",
        STANDARD.encode(signing_key().verifying_key().to_bytes())
    )];
    config
}

struct Fakes {
    device: Arc<FakeDevice>,
    upstream: Arc<FakeUpstream>,
    mounter: Arc<FakeMounter>,
}

impl Fakes {
    fn new() -> Self {
        Self {
            device: Arc::new(FakeDevice::default()),
            upstream: Arc::new(FakeUpstream::default()),
            mounter: Arc::new(FakeMounter::default()),
        }
    }

    fn deps(&self) -> DaemonDeps {
        DaemonDeps {
            device: self.device.clone(),
            upstream: self.upstream.clone(),
            mounter: self.mounter.clone(),
        }
    }

    /// Publish a tree with one chunked file; returns the file's single chunk.
    fn publish(&self) -> Vec<u8> {
        let params = GlobalParams::default();
        let data = vec![0x5au8; 20_000];
        let digest = chunk_digest(&data, params.digest_bytes());
        self.upstream.chunks.lock().insert(digest.clone(), data.clone());
        let manifest = Manifest {
            params: None,
            entries: vec![
                ManifestEntry::directory("/"),
                ManifestEntry::chunked_file("/data", data.len() as u64, &[digest], false),
            ],
        };
        let entry = EnvelopeEntry {
            size: 0,
            inline_data: manifest.encode().unwrap(),
            digests: Vec::new(),
            params: None,
        };
        let env = SignedEnvelope::sign(MANIFEST_CONTEXT, &entry, "itest-1", &signing_key()).unwrap();
        *self.upstream.envelope.lock() = Some(env.encode().unwrap());
        data
    }
}

fn open(msg_id: u32, object_id: u32, fd: u32, cookie: &str) -> Message {
    Message::Open {
        msg_id,
        object_id,
        fd,
        flags: 0,
        volume_key: volume_key(DOMAIN),
        cookie_key: cookie.as_bytes().to_vec(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn serves_a_tree_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let fakes = Fakes::new();
    let data = fakes.publish();

    let daemon = Daemon::start(config.clone(), fakes.deps()).await.unwrap();
    {
        let commands = fakes.device.commands.lock();
        assert_eq!(commands[0], Command::Dir(config.cache_path.display().to_string()));
        assert_eq!(commands[1], Command::Tag(config.cache_tag.clone()));
        assert_eq!(commands[2], Command::BindOndemand);
    }

    let client = ControlClient::new(config.socket_path());
    let tree_path = format!("/nix/store/{}-hello", HASH);
    let mount_point = dir.path().join("mnt").display().to_string();
    let resp = client
        .request(&ControlRequest::Mount {
            tree_path: tree_path.clone(),
            upstream: config.upstream.clone(),
            mount_point: mount_point.clone(),
        })
        .await
        .unwrap();
    assert!(resp.success, "{:?}", resp.error);
    assert_eq!(
        *fakes.mounter.mount_calls.lock(),
        vec![(HASH.to_string(), PathBuf::from(&mount_point))]
    );

    // the kernel opens the image, then reads it
    fakes.device.push(open(1, 1, 5, HASH));
    assert!(wait_until(|| fakes.device.copen_for(1).is_some()).await);
    let size = fakes.device.copen_for(1).unwrap();
    assert!(size > 0);
    fakes.device.push(Message::Read { msg_id: 2, object_id: 1, off: 0, len: 4096 });
    let image_file = fakes.device.file(5);
    assert!(wait_until(|| image_file.completions.lock().contains(&2)).await);
    assert_eq!(image_file.writes.lock()[0].1.len() as i64, size);

    // then the slab the image points at
    fakes.device.push(open(3, 2, 6, "_slab_0"));
    assert!(wait_until(|| fakes.device.copen_for(3).is_some()).await);
    let report: DebugReport = client
        .request(&ControlRequest::Debug {
            include_images: true,
            include_chunks: true,
        })
        .await
        .unwrap()
        .into_data()
        .unwrap();
    assert_eq!(report.chunks.len(), 1);
    assert_eq!(report.open_objects.len(), 2);
    let record = report.images.iter().find(|r| r.tree_hash == HASH).unwrap();
    assert_eq!(record.mount_state, MountState::Mounted);
    assert_eq!(record.image_size as i64, size);
    let base = (report.chunks[0].addr as u64) << 12;
    for (i, msg_id) in [4u32, 5, 6].iter().enumerate() {
        fakes.device.push(Message::Read {
            msg_id: *msg_id,
            object_id: 2,
            off: base + (i as u64) * 4096,
            len: 4096,
        });
    }
    let slab_file = fakes.device.file(6);
    assert!(wait_until(|| slab_file.completions.lock().len() == 3).await);
    let writes = slab_file.writes.lock().clone();
    assert!(writes.iter().all(|(off, _)| *off == base));
    assert_eq!(&writes[0].1[..data.len()], &data[..]);
    assert!(fakes.upstream.chunk_fetches.load(Ordering::SeqCst) <= 3);

    daemon.shutdown().await.unwrap();
    assert!(fakes.device.is_closed());
    assert!(!config.socket_path().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_reconciles_interrupted_mounts() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let tree = |h: &str| format!("/nix/store/{}-x", h);
    let mounted = HASH;
    let requested = "zyxwvsrqpnmlkjihgfdcba9876543210";
    let unmounting = "00000000000000000000000000000000";
    {
        tokio::fs::create_dir_all(&config.cache_path).await.unwrap();
        let store = SledStore::open(&config.db_path(), &config.params).unwrap();
        for (hash, state) in [
            (mounted, MountState::Mounted),
            (requested, MountState::Requested),
            (unmounting, MountState::UnmountRequested),
        ] {
            let mut rec = ImageRecord::new(hash, &tree(hash), "https://cache.example", &format!("/mnt/{}", hash));
            rec.mount_state = state;
            store.put_image(&rec).unwrap();
        }
        store.flush().await.unwrap();
    }

    let fakes = Fakes::new();
    let daemon = Daemon::start(config.clone(), fakes.deps()).await.unwrap();
    let report = daemon.reconcile_report().clone();
    let mut remounted = report.remounted.clone();
    remounted.sort();
    let mut expected = vec![mounted.to_string(), requested.to_string()];
    expected.sort();
    assert_eq!(remounted, expected);
    assert_eq!(report.unmounted, vec![unmounting.to_string()]);
    assert!(report.failed.is_empty());

    // a remounted tree conflicts with a fresh mount request
    let mounts = daemon.mounts();
    let err = tokio::task::spawn_blocking(move || {
        mounts.request_mount(&cachefsd::mount::MountRequest {
            tree_path: tree(HASH),
            upstream: "https://cache.example".to_string(),
            mount_point: "/mnt/other".to_string(),
        })
    })
    .await
    .unwrap()
    .unwrap_err();
    assert_eq!(err.kind(), cachefsd::error::ErrorKind::Conflict);

    daemon.shutdown().await.unwrap();
}
