use clap::Parser;
use std::path::PathBuf;
use voxelwire::server::{run_tcp_server, RuntimeConfig};
use voxelwire::shared::traverse::{LodParams, DEFAULT_SIZE_SCALE};

#[derive(Parser, Debug)]
#[command(
    name = "voxelwire-server",
    about = "Octree synchronization and persistence runtime"
)]
struct Args {
    #[arg(long, default_value = "0.0.0.0:4020")]
    bind: String,
    #[arg(long, default_value = "saves/tree.vwt")]
    tree_file: PathBuf,
    #[arg(long, default_value_t = 30)]
    persist_interval_secs: u64,
    #[arg(long, default_value_t = DEFAULT_SIZE_SCALE)]
    size_scale: f32,
    #[arg(long, default_value_t = 0)]
    boundary_level_adjust: i32,
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = RuntimeConfig {
        bind: args.bind,
        tree_file: args.tree_file,
        persist_interval_secs: args.persist_interval_secs,
        lod: LodParams {
            size_scale: args.size_scale,
            boundary_level_adjust: args.boundary_level_adjust,
        },
    };
    run_tcp_server(&config)
}
