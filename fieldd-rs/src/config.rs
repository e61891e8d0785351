/* Daemon options: command line flags plus an optional JSON overlay
 * file. The supervisor re-execs workers with the resolved options, so
 * `to_args` must round-trip everything a worker consumes. */

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::warn;

use crate::error::RuntimeError;
use crate::supervisor::SupervisorConfig;

#[derive(Debug, Clone, Parser)]
pub struct Options {
    /// Number of times to respawn a failing worker before giving up.
    #[arg(long, default_value_t = 3)]
    pub max_respawns: u32,

    /// Seconds before the worker failure counter is reset.
    #[arg(long, default_value_t = 120.0)]
    pub respawn_reset: f64,

    /// Seconds workers get to exit gracefully before SIGKILL.
    #[arg(long, default_value_t = 5.0)]
    pub terminate_timeout: f64,

    /// Hostname to bind servers to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// TCP port of the RPC surface.
    #[arg(long, default_value_t = 1234)]
    pub tcp: u16,

    /// UDP port streaming replies are sent to.
    #[arg(long, default_value_t = 1235)]
    pub udp_send: u16,

    /// UDP port streaming datagrams are received on.
    #[arg(long, default_value_t = 1236)]
    pub udp_recv: u16,

    /// Poll for hotplugged sensors instead of using udev events.
    /// Always set on platforms without udev.
    #[arg(long)]
    pub poll: bool,

    /// Hotplug polling period in seconds (clamped to >= 1).
    #[arg(long, default_value_t = 1.0)]
    pub poll_period: f64,

    /// Serial baud rate.
    #[arg(long, default_value_t = 115_200)]
    pub baud_rate: u32,

    /// Path to the sensor schema file (JSON).
    #[arg(long, default_value = "devices.json")]
    pub dev_schema: PathBuf,

    /// Path to the device names file (JSON).
    #[arg(long, default_value = "device_names.json")]
    pub dev_names: PathBuf,

    /// Optional file listing virtual device paths, one per line.
    #[arg(long)]
    pub virtual_devices: Option<PathBuf>,

    /// Directory for the shared store bus and worker endpoints.
    #[arg(long, default_value = "/tmp/fieldd")]
    pub runtime_dir: PathBuf,

    /// Lowest visible log level.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Optional JSON configuration file overriding these flags.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/* Every field optional: only the keys present override the flags. */
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    max_respawns: Option<u32>,
    respawn_reset: Option<f64>,
    terminate_timeout: Option<f64>,
    host: Option<String>,
    tcp: Option<u16>,
    udp_send: Option<u16>,
    udp_recv: Option<u16>,
    poll: Option<bool>,
    poll_period: Option<f64>,
    baud_rate: Option<u32>,
    dev_schema: Option<PathBuf>,
    dev_names: Option<PathBuf>,
    virtual_devices: Option<PathBuf>,
    runtime_dir: Option<PathBuf>,
    log_level: Option<String>,
}

impl Options {
    /* Overlay the config file (if any), then apply platform rules. */
    pub fn resolve(mut self) -> Result<Self, RuntimeError> {
        if let Some(path) = self.config.clone() {
            self.overlay(&path)?;
        }
        if !cfg!(target_os = "linux") && !self.poll {
            warn!("no udev on this platform, forcing polling hotplug");
            self.poll = true;
        }
        if self.poll_period < 1.0 {
            warn!(
                period = self.poll_period,
                "polling period too aggressive, clamping to 1s"
            );
            self.poll_period = 1.0;
        }
        Ok(self)
    }

    fn overlay(&mut self, path: &Path) -> Result<(), RuntimeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::config(path.display().to_string(), e.to_string()))?;
        let file: ConfigFile = serde_json::from_str(&text)
            .map_err(|e| RuntimeError::config(path.display().to_string(), e.to_string()))?;

        macro_rules! overlay_field {
            ($($field:ident),*) => {
                $(if let Some(value) = file.$field {
                    self.$field = value;
                })*
            };
        }
        overlay_field!(
            max_respawns,
            respawn_reset,
            terminate_timeout,
            host,
            tcp,
            udp_send,
            udp_recv,
            poll,
            poll_period,
            baud_rate,
            dev_schema,
            dev_names,
            runtime_dir,
            log_level
        );
        if file.virtual_devices.is_some() {
            self.virtual_devices = file.virtual_devices;
        }
        Ok(())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_respawns: self.max_respawns,
            respawn_reset: Duration::from_secs_f64(self.respawn_reset),
            terminate_timeout: Duration::from_secs_f64(self.terminate_timeout),
        }
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_secs_f64(self.poll_period)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.runtime_dir.join("store")
    }

    /* Flags handed to a re-exec'd worker process. */
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--max-respawns".into(),
            self.max_respawns.to_string(),
            "--respawn-reset".into(),
            self.respawn_reset.to_string(),
            "--terminate-timeout".into(),
            self.terminate_timeout.to_string(),
            "--host".into(),
            self.host.clone(),
            "--tcp".into(),
            self.tcp.to_string(),
            "--udp-send".into(),
            self.udp_send.to_string(),
            "--udp-recv".into(),
            self.udp_recv.to_string(),
            "--poll-period".into(),
            self.poll_period.to_string(),
            "--baud-rate".into(),
            self.baud_rate.to_string(),
            "--dev-schema".into(),
            self.dev_schema.display().to_string(),
            "--dev-names".into(),
            self.dev_names.display().to_string(),
            "--runtime-dir".into(),
            self.runtime_dir.display().to_string(),
            "--log-level".into(),
            self.log_level.clone(),
        ];
        if self.poll {
            args.push("--poll".into());
        }
        if let Some(path) = &self.virtual_devices {
            args.push("--virtual-devices".into());
            args.push(path.display().to_string());
        }
        args
    }
}
