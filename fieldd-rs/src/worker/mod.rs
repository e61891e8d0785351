/* The three hosted workers. Each runs as its own process under the
 * supervisor and meets its peers over the shared store bus and the
 * per-worker RPC endpoints in the runtime directory. */

pub mod executor;
pub mod network;
pub mod sensor;

use std::path::{Path, PathBuf};

use crate::config::Options;

/* Shared store keys. */
pub const KEY_ALLIANCE: &str = "field.alliance";
pub const KEY_STARTING_ZONE: &str = "field.startingzone";
pub const KEY_MODE: &str = "field.mode";
pub const KEY_DEVICE_NAMES: &str = "smartsensor.names";
pub const KEY_CHALLENGE_SOLUTION: &str = "challenge.solution";

pub const SENSOR_WORKER: &str = "sensor";
pub const NETWORK_WORKER: &str = "network";
pub const EXECUTOR_WORKER: &str = "executor";

pub const ALL_WORKERS: [&str; 3] = [SENSOR_WORKER, NETWORK_WORKER, EXECUTOR_WORKER];

/* A worker's private RPC endpoint. */
pub fn endpoint_path(runtime_dir: &Path, worker: &str) -> PathBuf {
    runtime_dir.join(format!("rpc-{worker}.sock"))
}

pub async fn run(name: &str, options: Options) -> anyhow::Result<()> {
    match name {
        SENSOR_WORKER => sensor::run(options).await,
        NETWORK_WORKER => network::run(options).await,
        EXECUTOR_WORKER => executor::run(options).await,
        other => anyhow::bail!("unknown worker \"{other}\""),
    }
}
