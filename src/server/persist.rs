use super::monotonic_ms;
use crate::shared::octal::OctalCode;
use crate::shared::octree::{Octree, VoxelColor};
use crate::shared::sync::SyncedOctree;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const PERSIST_MAGIC: &[u8; 4] = b"VWT1";
pub const PERSIST_FORMAT_VERSION: u32 = 1;
const FILE_HEADER_LEN: usize = 4 + 4 + 4 + 4;

/// How long the loop sleeps between bookkeeping passes. The configured
/// persistence interval gates the actual save check, not this.
const WORK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct SnapshotRecord {
    octants: Vec<u8>,
    color: [u8; 3],
}

/// On-disk body: every content-bearing cell by path. Rebuilding from these
/// records reproduces the tree exactly — intermediate nodes are recreated
/// and pruning rules keep the structure canonical.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct TreeSnapshot {
    records: Vec<SnapshotRecord>,
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Serialize the whole tree to `path` as a single blob:
/// `[magic][format_version: u32 LE][body_len: u32 LE][crc32: u32 LE][postcard body]`.
/// Writes a sibling temp file first and renames it into place so a failed
/// save never destroys the previous snapshot.
pub fn save_tree_to_file(tree: &Octree, path: &Path) -> io::Result<()> {
    let snapshot = TreeSnapshot {
        records: tree
            .collect_content()
            .into_iter()
            .map(|(code, color)| SnapshotRecord {
                octants: code.octants().to_vec(),
                color: color.0,
            })
            .collect(),
    };
    let body =
        postcard::to_stdvec(&snapshot).map_err(|error| invalid_data(error.to_string()))?;
    let mut hasher = Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(FILE_HEADER_LEN + body.len());
    out.extend_from_slice(PERSIST_MAGIC);
    out.extend_from_slice(&PERSIST_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&body);

    let temp_path = path.with_extension("vwt.tmp");
    fs::write(&temp_path, &out)?;
    fs::rename(&temp_path, path)
}

/// Replace the tree's contents with the snapshot at `path`. All-or-nothing:
/// any magic, version, length, checksum, or decode failure leaves the tree
/// exactly as it was. Returns the number of content records restored.
pub fn load_tree_from_file(tree: &mut Octree, path: &Path) -> io::Result<usize> {
    let bytes = fs::read(path)?;
    if bytes.len() < FILE_HEADER_LEN {
        return Err(invalid_data(format!(
            "snapshot file is {} bytes, header needs {FILE_HEADER_LEN}",
            bytes.len()
        )));
    }
    if &bytes[0..4] != PERSIST_MAGIC {
        return Err(invalid_data("bad snapshot magic".to_string()));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != PERSIST_FORMAT_VERSION {
        return Err(invalid_data(format!(
            "unsupported snapshot format version {version}"
        )));
    }
    let body_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let expected_crc = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    let body = bytes
        .get(FILE_HEADER_LEN..FILE_HEADER_LEN + body_len)
        .ok_or_else(|| invalid_data("snapshot body shorter than declared".to_string()))?;
    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != expected_crc {
        return Err(invalid_data("snapshot checksum mismatch".to_string()));
    }
    let snapshot: TreeSnapshot =
        postcard::from_bytes(body).map_err(|error| invalid_data(error.to_string()))?;

    // Decode the paths fully before touching the tree.
    let mut restored = Vec::with_capacity(snapshot.records.len());
    for record in &snapshot.records {
        let code = OctalCode::from_octants(&record.octants)
            .ok_or_else(|| invalid_data("snapshot contains an invalid path".to_string()))?;
        restored.push((code, VoxelColor(record.color)));
    }

    tree.erase_all();
    for (code, color) in &restored {
        tree.set_content(code, *color)
            .map_err(|error| invalid_data(error.to_string()))?;
    }
    Ok(restored.len())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    NotLoaded,
    Loading,
    Loaded,
}

/// Drives load-once-then-periodically-save against the shared tree.
///
/// The first `process()` call performs the load; afterwards each call is
/// one loop iteration: sleep, bookkeeping under the write lock, and a save
/// check when the configured interval has elapsed. Saving happens only when
/// the tree is dirty, and a failed save leaves the dirty bit set so the
/// next interval retries. `process()` keeps returning `true` until the
/// shutdown flag is observed, always at a lock boundary — an interrupted
/// cycle never leaves a partial write behind.
pub struct PersistenceManager {
    tree: SyncedOctree,
    file_path: PathBuf,
    check_interval: Duration,
    state: LoadState,
    last_check: Instant,
    load_duration: Option<Duration>,
    start: Instant,
}

impl PersistenceManager {
    pub fn new(tree: SyncedOctree, file_path: PathBuf, check_interval: Duration) -> Self {
        Self {
            tree,
            file_path,
            check_interval,
            state: LoadState::NotLoaded,
            last_check: Instant::now(),
            load_duration: None,
            start: Instant::now(),
        }
    }

    pub fn load_state(&self) -> LoadState {
        self.state
    }

    pub fn load_duration(&self) -> Option<Duration> {
        self.load_duration
    }

    pub fn process(&mut self, shutdown: &AtomicBool) -> bool {
        match self.state {
            LoadState::NotLoaded => self.run_initial_load(),
            LoadState::Loading => {}
            LoadState::Loaded => self.run_cycle(shutdown),
        }
        !shutdown.load(Ordering::Relaxed)
    }

    fn run_initial_load(&mut self) {
        self.state = LoadState::Loading;
        let load_started = Instant::now();
        {
            let mut tree = self.tree.write();
            match load_tree_from_file(&mut tree, &self.file_path) {
                Ok(records) => {
                    log::info!(
                        "loaded {} content records from {}",
                        records,
                        self.file_path.display()
                    );
                }
                Err(error) => {
                    log::warn!(
                        "could not load {}: {error}; starting with an empty tree",
                        self.file_path.display()
                    );
                }
            }
            // A freshly loaded tree — or an intentionally empty one — is
            // clean by definition.
            tree.clear_dirty_bit();
        }
        self.load_duration = Some(load_started.elapsed());
        self.last_check = Instant::now();
        self.state = LoadState::Loaded;
        log::info!(
            "tree load completed in {:.1} ms",
            load_started.elapsed().as_secs_f64() * 1000.0
        );
    }

    fn run_cycle(&mut self, shutdown: &AtomicBool) {
        thread::sleep(WORK_INTERVAL);
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        {
            let mut tree = self.tree.write();
            tree.update(monotonic_ms(self.start));
        }
        if self.last_check.elapsed() < self.check_interval {
            return;
        }
        self.last_check = Instant::now();
        let mut tree = self.tree.write();
        if !tree.is_dirty() {
            return;
        }
        match save_tree_to_file(&tree, &self.file_path) {
            Ok(()) => {
                tree.clear_dirty_bit();
                log::debug!("saved tree to {}", self.file_path.display());
            }
            Err(error) => {
                // Dirty bit stays set; the next interval retries.
                log::warn!("failed to save {}: {error}", self.file_path.display());
            }
        }
    }
}

pub fn spawn_persist_thread(
    tree: SyncedOctree,
    file_path: PathBuf,
    check_interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut manager = PersistenceManager::new(tree, file_path, check_interval);
        while manager.process(&shutdown) {}
        log::info!("persistence loop stopped");
    })
}
