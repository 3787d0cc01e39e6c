use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::stat::stat;
use tracing::trace;

/// Filesystem types that always mean "network mount". Everything else is
/// judged by whether the backing device looks remote.
const NETWORK_FSTYPES: &[&str] = &[
    "smbfs", "afpfs", "nfs", "webdav", "cifs", "smb", "ftp", "afp",
];

const CACHE_TTL: Duration = Duration::from_secs(5);

/// One row of the kernel mount table. Transient; re-read on every query
/// that misses the short cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub mount_point: String,
    /// e.g. `//user@host/share` or `host:/export`
    pub source: String,
    pub fs_type: String,
    pub is_local: bool,
    pub is_read_only: bool,
}

impl MountRecord {
    pub fn is_network(&self) -> bool {
        NETWORK_FSTYPES.contains(&self.fs_type.as_str()) || !self.is_local
    }
}

/// Source of mount-table rows. The system implementation parses the
/// kernel's enumeration; tests inject fixtures.
pub trait MountTable: Send + Sync {
    fn entries(&self) -> io::Result<Vec<MountRecord>>;
}

/// Reads the kernel mount enumeration from its procfs form.
pub struct ProcMountTable {
    path: PathBuf,
}

impl ProcMountTable {
    pub fn new() -> Self {
        Self { path: PathBuf::from("/proc/self/mounts") }
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Default for ProcMountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable for ProcMountTable {
    fn entries(&self) -> io::Result<Vec<MountRecord>> {
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(parse_mount_table(&raw))
    }
}

fn parse_mount_table(raw: &str) -> Vec<MountRecord> {
    let mut records = Vec::new();
    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let (Some(source), Some(target), Some(fstype), Some(options)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let source = decode_octal_escapes(source);
        let mount_point = decode_octal_escapes(target);
        let fs_type = fstype.to_string();
        let is_read_only = options.split(',').any(|opt| opt == "ro");
        let is_local =
            !NETWORK_FSTYPES.contains(&fs_type.as_str()) && !source_looks_remote(&source);
        records.push(MountRecord { mount_point, source, fs_type, is_local, is_read_only });
    }
    records
}

/// `//host/share`, `smb://…`, `host:/export` — anything with a remote
/// endpoint in the device field.
fn source_looks_remote(source: &str) -> bool {
    source.starts_with("//")
        || source.contains("://")
        || (source.contains(":/") && !source.starts_with('/'))
}

/// The kernel escapes space, tab, newline and backslash as \0dd octal.
fn decode_octal_escapes(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = u32::from(digits[0] - b'0') * 64
                    + u32::from(digits[1] - b'0') * 8
                    + u32::from(digits[2] - b'0');
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Clone)]
struct CacheSlot {
    record: Option<MountRecord>,
    read_at: Instant,
}

/// Answers "what is mounted where" with a short-lived cache. The
/// coordinator clears the cache whenever the outside world changes
/// (VPN/interface signals), so stale answers never cross such an event.
pub struct MountInspector {
    table: Arc<dyn MountTable>,
    cache: Mutex<HashMap<PathBuf, CacheSlot>>,
}

impl MountInspector {
    pub fn new(table: Arc<dyn MountTable>) -> Self {
        Self { table, cache: Mutex::new(HashMap::new()) }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(ProcMountTable::new()))
    }

    fn canonical(path: &Path) -> PathBuf {
        std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    pub fn get_mount_info(&self, path: &Path) -> Option<MountRecord> {
        let canonical = Self::canonical(path);

        {
            let cache = self.cache.lock().unwrap();
            if let Some(slot) = cache.get(&canonical) {
                if slot.read_at.elapsed() < CACHE_TTL {
                    trace!(path = %canonical.display(), "mount info from cache");
                    return slot.record.clone();
                }
            }
        }

        let record = self
            .table
            .entries()
            .unwrap_or_default()
            .into_iter()
            .find(|r| Path::new(&r.mount_point) == canonical);

        self.cache.lock().unwrap().insert(
            canonical,
            CacheSlot { record: record.clone(), read_at: Instant::now() },
        );
        record
    }

    /// True when the path is the root of a mount: either the mount table
    /// says so, or its device id differs from its parent's.
    pub fn is_mount_point(&self, path: &Path) -> bool {
        if self.get_mount_info(path).is_some() {
            return true;
        }

        let canonical = Self::canonical(path);
        let Some(parent) = canonical.parent() else { return false };
        match (stat(&canonical), stat(parent)) {
            (Ok(own), Ok(up)) => own.st_dev != up.st_dev,
            _ => false,
        }
    }

    pub fn is_network_mount(&self, path: &Path) -> bool {
        self.get_mount_info(path).is_some_and(|r| r.is_network())
    }

    pub fn list_all(&self) -> Vec<MountRecord> {
        self.table.entries().unwrap_or_default()
    }

    /// Locate a live mount of (server, share) regardless of where it is
    /// attached. Deliberately permissive substring matching: the source
    /// string format differs across protocols.
    pub fn find_mount(&self, server: &str, share: &str) -> Option<MountRecord> {
        let server = server.to_lowercase();
        let share = share.to_lowercase();
        self.list_all().into_iter().filter(|r| r.is_network()).find(|r| {
            let source = r.source.to_lowercase();
            source.contains(&server) && source.contains(&share)
        })
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }
}
