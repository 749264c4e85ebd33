use crate::shared::octree::Octree;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The one lock guarding a tree instance.
///
/// A single coarse reader/writer lock serializes the network-apply writer,
/// the persistence writer, and all traversal readers. Guards make release
/// structural — every exit path, early returns and panics included, gives
/// the lock back. Acquire once per top-level operation (once per packet,
/// once per persistence cycle, once per render pass); re-entrant
/// acquisition from the same thread is a caller bug, not something this
/// wrapper defends against.
#[derive(Clone, Debug)]
pub struct SyncedOctree {
    inner: Arc<RwLock<Octree>>,
}

impl SyncedOctree {
    pub fn new(tree: Octree) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tree)),
        }
    }

    /// Shared read access; excludes writers for the guard's lifetime.
    pub fn read(&self) -> RwLockReadGuard<'_, Octree> {
        self.inner.read().expect("octree lock poisoned")
    }

    /// Exclusive write access; excludes all readers and writers.
    pub fn write(&self) -> RwLockWriteGuard<'_, Octree> {
        self.inner.write().expect("octree lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::octal::OctalCode;
    use crate::shared::octree::VoxelColor;
    use crate::shared::packet::PROTOCOL_VERSION;
    use std::thread;

    /// Writers fill a whole octant batch under one write acquisition;
    /// readers must never observe a batch half-applied.
    #[test]
    fn readers_never_see_partial_batches() {
        let shared = SyncedOctree::new(Octree::new(PROTOCOL_VERSION));
        let writers: Vec<_> = (0..4u8)
            .map(|octant| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for round in 0..50u8 {
                        let mut tree = shared.write();
                        for sub in 0..8u8 {
                            let code = OctalCode::from_octants(&[octant, sub]).unwrap();
                            tree.set_content(&code, VoxelColor([round, round, round]))
                                .unwrap();
                        }
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let tree = shared.read();
                        for octant in 0..4u8 {
                            let colors: Vec<_> = (0..8u8)
                                .filter_map(|sub| {
                                    let code =
                                        OctalCode::from_octants(&[octant, sub]).unwrap();
                                    tree.content_at(&code)
                                })
                                .collect();
                            // Either the octant batch is absent entirely or
                            // all 8 cells agree on the round that wrote them.
                            assert!(colors.is_empty() || colors.len() == 8);
                            if let Some(first) = colors.first() {
                                assert!(colors.iter().all(|color| color == first));
                            }
                        }
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().expect("thread panicked");
        }
    }
}
