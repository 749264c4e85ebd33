mod ingest;

pub mod config;
pub mod persist;

pub use self::config::RuntimeConfig;
pub use self::ingest::PeerSession;
pub use self::persist::{
    load_tree_from_file, save_tree_to_file, spawn_persist_thread, LoadState, PersistenceManager,
};

use crate::shared::octree::Octree;
use crate::shared::packet::PROTOCOL_VERSION;
use crate::shared::sync::SyncedOctree;
use std::io;
use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Milliseconds since the runtime's start instant; the monotonic time base
/// shared by ingest and persistence.
pub(crate) fn monotonic_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Bring up the whole runtime: shared tree, persistence thread, and the
/// TCP accept loop feeding one ingest thread per client. Runs until the
/// process is killed; the ingest and persistence threads watch the shutdown
/// flag and exit at their next lock boundary.
pub fn run_tcp_server(config: &RuntimeConfig) -> io::Result<()> {
    let tree = SyncedOctree::new(Octree::new(PROTOCOL_VERSION));
    let shutdown = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    spawn_persist_thread(
        tree.clone(),
        config.tree_file.clone(),
        Duration::from_secs(config.persist_interval_secs),
        shutdown.clone(),
    );

    let listener = TcpListener::bind(&config.bind)?;
    eprintln!(
        "voxelwire-server listening on {} (tree_file={}, persist_interval={}s, size_scale={}, boundary_level_adjust={})",
        config.bind,
        config.tree_file.display(),
        config.persist_interval_secs,
        config.lod.size_scale,
        config.lod.boundary_level_adjust,
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                ingest::spawn_client_thread(stream, tree.clone(), start);
            }
            Err(error) => {
                eprintln!("accept failed: {}", error);
            }
        }
    }

    Ok(())
}
