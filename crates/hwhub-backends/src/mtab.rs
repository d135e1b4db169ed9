//! [`MountTableBackend`] – mount points from `fstab` and `mtab`.
//!
//! Every configured (`fstab`) or mounted (`mtab`) file system backed by a
//! real device or a network share becomes one device:
//!
//! * all of them expose **StorageAccess**, `accessible` being `true` while
//!   the mount point appears in `mtab`;
//! * NFS and SMB/CIFS shares additionally expose **NetworkShare** with a
//!   normalized `type` (`"nfs"` or `"cifs"`) and a URL.
//!
//! Both files are watched with `notify`; a change to either one triggers a
//! re-read and a diff against the previous table.  `/proc/self/mounts` does
//! not raise inotify events, so an optional periodic rescan covers systems
//! where `mtab` points there.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hwhub_registry::{BackendAdapter, EventSink};
use hwhub_types::{Capability, CapabilitySet, DeviceId, HubError, PropertyMap};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::snapshot::{Entry, Snapshot, changes_between};

/// Identifier root of every mount-table device.
pub const MTAB_UDI_ROOT: &str = "/org/hwhub/mtab";

/// Consecutive failed refreshes after which the backend reports itself failed.
const MAX_FAILED_REFRESHES: u32 = 3;

#[derive(Debug, Clone)]
pub struct MountTableConfig {
    pub fstab: PathBuf,
    pub mtab: PathBuf,
    /// Periodic rescan in addition to file notifications.
    pub rescan_interval: Option<Duration>,
    /// Upper bound on reading both tables.
    pub io_timeout: Duration,
}

impl Default for MountTableConfig {
    fn default() -> Self {
        Self {
            fstab: PathBuf::from("/etc/fstab"),
            mtab: PathBuf::from("/etc/mtab"),
            rescan_interval: Some(Duration::from_secs(10)),
            io_timeout: Duration::from_secs(1),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Table parsing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct MountLine {
    source: String,
    mount_point: String,
    fs_type: String,
}

/// Undo the octal escapes (`\040` for a space, …) used in mount tables.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let code = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(code as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_table(text: &str) -> Vec<MountLine> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(MountLine {
                source: unescape(fields.next()?),
                mount_point: unescape(fields.next()?),
                fs_type: fields.next()?.to_string(),
            })
        })
        .collect()
}

/// `"nfs"` or `"cifs"` for network file systems.
fn share_type(fs_type: &str) -> Option<&'static str> {
    match fs_type {
        "nfs" | "nfs4" => Some("nfs"),
        "cifs" | "smbfs" | "smb3" => Some("cifs"),
        _ => None,
    }
}

fn share_url(share: &str, source: &str) -> String {
    match share {
        // server:/export
        "nfs" => match source.split_once(':') {
            Some((server, export)) => format!("nfs://{server}{export}"),
            None => format!("nfs://{source}"),
        },
        // //server/share
        _ => format!("smb:{}", source.replace('\\', "/")),
    }
}

fn is_tracked(line: &MountLine) -> bool {
    if share_type(&line.fs_type).is_some() {
        return true;
    }
    let real_device = line.source.starts_with("/dev/")
        || line.source.starts_with("UUID=")
        || line.source.starts_with("LABEL=");
    real_device && line.fs_type != "swap" && line.mount_point.starts_with('/')
}

/// Separators become `_`; every other byte outside `[A-Za-z0-9.-]`,
/// including `_` itself, is written as `%XX`, so distinct mount points never
/// share an id.  The root file system is `%2F`.
fn device_id(mount_point: &str) -> DeviceId {
    let trimmed = mount_point.trim_matches('/');
    if trimmed.is_empty() {
        return DeviceId::new(format!("{MTAB_UDI_ROOT}/%2F"));
    }
    let mut name = String::with_capacity(trimmed.len());
    for byte in trimmed.bytes() {
        match byte {
            b'/' => name.push('_'),
            b if b.is_ascii_alphanumeric() || b == b'.' || b == b'-' => name.push(char::from(b)),
            b => name.push_str(&format!("%{b:02X}")),
        }
    }
    DeviceId::new(format!("{MTAB_UDI_ROOT}/{name}"))
}

fn build_snapshot(fstab: &[MountLine], mtab: &[MountLine]) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for line in fstab.iter().chain(mtab).filter(|line| is_tracked(line)) {
        let id = device_id(&line.mount_point);
        if snapshot.contains_key(&id) {
            continue;
        }
        let mounted = mtab.iter().any(|m| m.mount_point == line.mount_point);

        let mut capabilities: CapabilitySet = [Capability::StorageAccess].into_iter().collect();
        let mut properties = PropertyMap::new();
        properties.insert("accessible".into(), mounted.into());
        properties.insert("filePath".into(), line.mount_point.clone().into());
        properties.insert("ignored".into(), false.into());
        if let Some(share) = share_type(&line.fs_type) {
            capabilities.insert(Capability::NetworkShare);
            properties.insert("type".into(), share.into());
            properties.insert("url".into(), share_url(share, &line.source).into());
        }
        snapshot.insert(
            id,
            Entry {
                capabilities,
                properties,
            },
        );
    }
    snapshot
}

fn read_table(path: &Path) -> Result<Vec<MountLine>, HubError> {
    std::fs::read_to_string(path)
        .map(|text| parse_table(&text))
        .map_err(|e| HubError::Io(format!("cannot read {}: {e}", path.display())))
}

/// A missing `fstab` reads as empty; any other read error fails the whole
/// refresh so the previous table stays in place.
fn read_tables(fstab: &Path, mtab: &Path) -> Result<Snapshot, HubError> {
    let configured = match std::fs::metadata(fstab) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        _ => read_table(fstab)?,
    };
    Ok(build_snapshot(&configured, &read_table(mtab)?))
}

async fn read_tables_bounded(config: &MountTableConfig) -> Result<Snapshot, HubError> {
    let (fstab, mtab) = (config.fstab.clone(), config.mtab.clone());
    match tokio::time::timeout(
        config.io_timeout,
        tokio::task::spawn_blocking(move || read_tables(&fstab, &mtab)),
    )
    .await
    {
        Ok(Ok(read)) => read,
        Ok(Err(join)) => Err(HubError::Backend {
            backend: "mtab".to_string(),
            details: join.to_string(),
        }),
        Err(_) => Err(HubError::Timeout {
            operation: "reading mount tables".to_string(),
            after_ms: config.io_timeout.as_millis() as u64,
        }),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MountTableBackend
// ────────────────────────────────────────────────────────────────────────────

pub struct MountTableBackend {
    config: MountTableConfig,
    snapshot: Arc<Mutex<Snapshot>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl MountTableBackend {
    pub fn new(config: MountTableConfig) -> Self {
        Self {
            config,
            snapshot: Arc::new(Mutex::new(Snapshot::new())),
            watcher: Mutex::new(None),
            refresher: Mutex::new(None),
        }
    }

    fn watch(&self, tx: mpsc::UnboundedSender<()>) -> Result<RecommendedWatcher, HubError> {
        let tables = [self.config.fstab.clone(), self.config.mtab.clone()];
        let names: Vec<_> = tables
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_owned()))
            .collect();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name().is_some_and(|n| names.iter().any(|known| known == n)));
                    if relevant {
                        let _ = tx.send(());
                    }
                }
                Err(e) => error!(backend = "mtab", error = %e, "mount table watch error"),
            }
        })
        .map_err(|e| HubError::Io(format!("cannot create mount table watcher: {e}")))?;

        // Tables are often replaced by rename, so watch their directories.
        for table in &tables {
            let dir = table.parent().unwrap_or(Path::new("/"));
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|e| HubError::Io(format!("cannot watch {}: {e}", dir.display())))?;
        }
        Ok(watcher)
    }

    fn entry<R>(&self, id: &DeviceId, f: impl FnOnce(&Entry) -> R) -> Result<R, HubError> {
        self.snapshot
            .lock()
            .get(id)
            .map(f)
            .ok_or_else(|| HubError::DeviceNotFound(id.clone()))
    }
}

async fn refresh_loop(
    config: MountTableConfig,
    snapshot: Arc<Mutex<Snapshot>>,
    mut changed: mpsc::UnboundedReceiver<()>,
    sink: EventSink,
) {
    let mut rescan = config.rescan_interval.map(tokio::time::interval);
    let mut failures = 0;
    loop {
        tokio::select! {
            signal = changed.recv() => {
                if signal.is_none() {
                    return;
                }
            }
            _ = async {
                match rescan.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }

        let fresh = match read_tables_bounded(&config).await {
            Ok(fresh) => {
                failures = 0;
                fresh
            }
            Err(err) => {
                failures += 1;
                warn!(backend = "mtab", error = %err, failures, "mount table refresh failed");
                if failures >= MAX_FAILED_REFRESHES {
                    let _ = sink.report_failure(err.to_string());
                    return;
                }
                continue;
            }
        };
        let events = {
            let mut current = snapshot.lock();
            let events = changes_between(&current, &fresh);
            *current = fresh;
            events
        };
        for event in events {
            debug!(backend = "mtab", device = %event.id(), "mount table change");
            if sink.emit(event).is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl BackendAdapter for MountTableBackend {
    fn name(&self) -> &str {
        "mtab"
    }

    async fn start(&self, sink: EventSink) -> Result<(), HubError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = self.watch(tx)?;
        let initial = read_tables_bounded(&self.config).await?;
        info!(
            backend = "mtab",
            fstab = %self.config.fstab.display(),
            mtab = %self.config.mtab.display(),
            devices = initial.len(),
            "mount table backend started"
        );
        *self.snapshot.lock() = initial;
        *self.watcher.lock() = Some(watcher);
        let task = tokio::spawn(refresh_loop(
            self.config.clone(),
            Arc::clone(&self.snapshot),
            rx,
            sink,
        ));
        *self.refresher.lock() = Some(task);
        Ok(())
    }

    fn stop(&self) {
        self.watcher.lock().take();
        if let Some(task) = self.refresher.lock().take() {
            task.abort();
            debug!(backend = "mtab", "mount table watch released");
        }
    }

    fn list_devices(&self) -> Result<Vec<DeviceId>, HubError> {
        Ok(self.snapshot.lock().keys().cloned().collect())
    }

    fn resolve_interfaces(&self, id: &DeviceId) -> Result<CapabilitySet, HubError> {
        self.entry(id, |entry| entry.capabilities.clone())
    }

    fn properties(&self, id: &DeviceId) -> Result<PropertyMap, HubError> {
        self.entry(id, |entry| entry.properties.clone())
    }
}

impl Drop for MountTableBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwhub_registry::{BackendStatus, DeviceRegistry};
    use hwhub_types::PropertyValue;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;

    const FSTAB: &str = "\
# <file system> <mount point> <type> <options> <dump> <pass>
UUID=1234-ABCD  /            ext4  defaults  0 1
/dev/sda2       none         swap  sw        0 0
proc            /proc        proc  defaults  0 0
fileserver:/export/home  /mnt/home  nfs  defaults  0 0
//nas/media     /mnt/media   cifs  guest     0 0
";

    const MTAB: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
proc /proc proc rw 0 0
";

    fn tables() -> (TempDir, MountTableConfig) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("fstab"), FSTAB).unwrap();
        fs::write(dir.path().join("mtab"), MTAB).unwrap();
        let config = MountTableConfig {
            fstab: dir.path().join("fstab"),
            mtab: dir.path().join("mtab"),
            rescan_interval: Some(Duration::from_millis(30)),
            io_timeout: Duration::from_secs(1),
        };
        (dir, config)
    }

    #[test]
    fn octal_escapes_are_decoded() {
        assert_eq!(unescape(r"/mnt/my\040disk"), "/mnt/my disk");
        assert_eq!(unescape(r"plain"), "plain");
        assert_eq!(unescape(r"trailing\04"), r"trailing\04");
    }

    #[test]
    fn only_real_devices_and_shares_are_tracked() {
        let snapshot = build_snapshot(&parse_table(FSTAB), &parse_table(MTAB));
        let ids: Vec<_> = snapshot.keys().map(|id| id.as_str().to_string()).collect();
        assert_eq!(
            ids,
            vec![
                format!("{MTAB_UDI_ROOT}/%2F"),
                format!("{MTAB_UDI_ROOT}/mnt_home"),
                format!("{MTAB_UDI_ROOT}/mnt_media"),
            ]
        );
        let root = &snapshot[&device_id("/")];
        assert_eq!(root.properties["accessible"], PropertyValue::Bool(true));
        assert_eq!(root.capabilities.len(), 1);
    }

    #[test]
    fn distinct_mount_points_get_distinct_ids() {
        let points = ["/", "/root", "/a/b", "/a_b", "/a%5Fb", "/a/_b", "/a_/b", "/mnt/my disk"];
        let ids: BTreeSet<DeviceId> = points.iter().map(|p| device_id(p)).collect();
        assert_eq!(ids.len(), points.len());
        assert_eq!(device_id("/a/b").as_str(), format!("{MTAB_UDI_ROOT}/a_b"));
        assert_eq!(device_id("/a_b").as_str(), format!("{MTAB_UDI_ROOT}/a%5Fb"));
        assert_eq!(
            device_id("/mnt/my disk").as_str(),
            format!("{MTAB_UDI_ROOT}/mnt_my%20disk")
        );
    }

    #[test]
    fn missing_fstab_reads_as_empty_but_mtab_errors_propagate() {
        let (dir, config) = tables();
        let absent = dir.path().join("absent");
        let snapshot = read_tables(&absent, &config.mtab).unwrap();
        assert_eq!(snapshot.keys().cloned().collect::<Vec<_>>(), vec![device_id("/")]);
        assert!(read_tables(&config.fstab, &absent).is_err());
        // A directory where the table should be.
        assert!(read_tables(dir.path(), &config.mtab).is_err());
        assert!(read_tables(&config.fstab, dir.path()).is_err());
    }

    #[test]
    fn network_shares_are_normalized() {
        let snapshot = build_snapshot(&parse_table(FSTAB), &parse_table(MTAB));
        let home = &snapshot[&device_id("/mnt/home")];
        assert!(home.capabilities.contains(&Capability::NetworkShare));
        assert_eq!(home.properties["type"], PropertyValue::Text("nfs".into()));
        assert_eq!(
            home.properties["url"],
            PropertyValue::Text("nfs://fileserver/export/home".into())
        );
        assert_eq!(home.properties["accessible"], PropertyValue::Bool(false));

        let media = &snapshot[&device_id("/mnt/media")];
        assert_eq!(media.properties["type"], PropertyValue::Text("cifs".into()));
        assert_eq!(
            media.properties["url"],
            PropertyValue::Text("smb://nas/media".into())
        );
    }

    #[tokio::test]
    async fn mounting_a_share_flips_accessible() {
        let (_dir, config) = tables();
        let mtab = config.mtab.clone();
        let registry = DeviceRegistry::new();
        registry
            .register_backend(Arc::new(MountTableBackend::new(config)))
            .await;
        assert_eq!(registry.len(), 3);

        fs::write(
            &mtab,
            format!("{MTAB}fileserver:/export/home /mnt/home nfs4 rw 0 0\n"),
        )
        .unwrap();

        let home = device_id("/mnt/home");
        let mut accessible = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            registry.process_pending();
            accessible = registry.property(&home, "accessible").ok();
            if accessible == Some(PropertyValue::Bool(true)) {
                break;
            }
        }
        assert_eq!(accessible, Some(PropertyValue::Bool(true)));
        registry.shutdown();
    }

    /// Replace `mtab` with a symlink to `target` in one rename.
    fn repoint_mtab(dir: &Path, target: &Path) {
        let staged = dir.join("mtab.staged");
        std::os::unix::fs::symlink(target, &staged).unwrap();
        fs::rename(&staged, dir.join("mtab")).unwrap();
    }

    /// `tables()` with `mtab` turned into a symlink to `mtab.real`, plus a
    /// directory the link can be pointed at to make reads fail.
    fn linked_tables() -> (TempDir, MountTableConfig, PathBuf, PathBuf) {
        let (dir, config) = tables();
        let real = dir.path().join("mtab.real");
        fs::rename(&config.mtab, &real).unwrap();
        repoint_mtab(dir.path(), &real);
        let unreadable = dir.path().join("unreadable");
        fs::create_dir(&unreadable).unwrap();
        (dir, config, real, unreadable)
    }

    #[tokio::test]
    async fn failed_read_keeps_the_previous_table() {
        let (dir, mut config, real, unreadable) = linked_tables();
        config.rescan_interval = None;
        let registry = DeviceRegistry::new();
        let backend = registry
            .register_backend(Arc::new(MountTableBackend::new(config)))
            .await;
        let root = device_id("/");
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.property(&root, "accessible").ok(), Some(PropertyValue::Bool(true)));

        repoint_mtab(dir.path(), &unreadable);
        tokio::time::sleep(Duration::from_millis(150)).await;
        registry.process_pending();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.property(&root, "accessible").ok(), Some(PropertyValue::Bool(true)));
        assert!(matches!(registry.backend_status(backend), Some(BackendStatus::Active)));

        // The next good read is diffed against the retained table.
        fs::write(&real, format!("{MTAB}fileserver:/export/home /mnt/home nfs4 rw 0 0\n")).unwrap();
        repoint_mtab(dir.path(), &real);
        let home = device_id("/mnt/home");
        let mut accessible = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            registry.process_pending();
            accessible = registry.property(&home, "accessible").ok();
            if accessible == Some(PropertyValue::Bool(true)) {
                break;
            }
        }
        assert_eq!(accessible, Some(PropertyValue::Bool(true)));
        assert_eq!(registry.property(&root, "accessible").ok(), Some(PropertyValue::Bool(true)));
        registry.shutdown();
    }

    #[tokio::test]
    async fn repeated_read_failures_degrade_the_backend() {
        let (dir, config, _real, unreadable) = linked_tables();
        let registry = DeviceRegistry::new();
        let backend = registry
            .register_backend(Arc::new(MountTableBackend::new(config)))
            .await;
        assert_eq!(registry.len(), 3);

        repoint_mtab(dir.path(), &unreadable);
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            registry.process_pending();
            if matches!(registry.backend_status(backend), Some(BackendStatus::Degraded(_))) {
                break;
            }
        }
        assert!(matches!(registry.backend_status(backend), Some(BackendStatus::Degraded(_))));
        assert!(registry.is_empty());
        registry.shutdown();
    }

    #[tokio::test]
    async fn unmounted_entry_missing_from_fstab_disappears() {
        let (_dir, config) = tables();
        let mtab = config.mtab.clone();
        fs::write(&mtab, format!("{MTAB}/dev/sdb1 /media/usb vfat rw 0 0\n")).unwrap();
        let registry = DeviceRegistry::new();
        registry
            .register_backend(Arc::new(MountTableBackend::new(config)))
            .await;
        let usb = device_id("/media/usb");
        assert!(registry.contains(&usb));

        fs::write(&mtab, MTAB).unwrap();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            registry.process_pending();
            if !registry.contains(&usb) {
                break;
            }
        }
        assert!(!registry.contains(&usb));
        registry.shutdown();
    }
}
