use crate::shared::traverse::LodParams;
use std::path::PathBuf;

/// Everything the runtime is told rather than decides: where to listen,
/// where the tree lives on disk, how often to consider saving it, and the
/// LOD parameters handed to consumers.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub bind: String,
    pub tree_file: PathBuf,
    pub persist_interval_secs: u64,
    pub lod: LodParams,
}

impl RuntimeConfig {
    pub fn with_defaults() -> Self {
        Self {
            bind: "0.0.0.0:4020".to_string(),
            tree_file: PathBuf::from("saves/tree.vwt"),
            persist_interval_secs: 30,
            lod: LodParams::default(),
        }
    }
}
