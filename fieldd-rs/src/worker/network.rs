/* Network worker: the external RPC surface over TCP, the same service
 * on a Unix endpoint for peer workers, and the UDP streaming channel
 * the driver station polls. Field state lives in the shared store so
 * the other workers observe it without asking. */

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

use crate::config::Options;
use crate::rpc::{self, DeviceDescriptor, Request, Response, RpcClient, RpcService};
use crate::schema;
use crate::store::SharedStore;
use crate::worker::{
    endpoint_path, EXECUTOR_WORKER, KEY_ALLIANCE, KEY_DEVICE_NAMES, KEY_MODE, KEY_STARTING_ZONE,
    NETWORK_WORKER, SENSOR_WORKER,
};

const ALLIANCES: [&str; 3] = ["blue", "gold", "unknown"];
const STARTING_ZONES: [&str; 5] = ["left", "right", "vending", "shelf", "unknown"];
const MODES: [&str; 4] = ["idle", "auto", "teleop", "estop"];

pub async fn run(options: Options) -> anyhow::Result<()> {
    let store = Arc::new(
        SharedStore::open(&options.store_dir())
            .await
            .context("joining the shared store")?,
    );

    let service = Arc::new(FieldService {
        store: Arc::clone(&store),
        dev_names_path: options.dev_names.clone(),
        runtime_dir: options.runtime_dir.clone(),
        devices: Arc::new(Mutex::new(HashMap::new())),
    });

    let tcp = TcpListener::bind((options.host.as_str(), options.tcp))
        .await
        .with_context(|| format!("binding {}:{}", options.host, options.tcp))?;
    info!(host = %options.host, port = options.tcp, "RPC surface up");
    tokio::spawn(rpc::serve_tcp(tcp, Arc::clone(&service) as Arc<dyn RpcService>));

    let unix = rpc::bind_endpoint(&endpoint_path(&options.runtime_dir, NETWORK_WORKER))
        .context("binding the network endpoint")?;
    tokio::spawn(rpc::serve_unix(unix, Arc::clone(&service) as Arc<dyn RpcService>));

    let streaming = StreamingChannel {
        store: Arc::clone(&store),
        devices: Arc::clone(&service.devices),
        host: options.host.clone(),
        udp_recv: options.udp_recv,
        udp_send: options.udp_send,
    };
    tokio::spawn(async move {
        if let Err(err) = streaming.run().await {
            warn!(%err, "streaming channel stopped");
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing the SIGTERM handler")?;
    sigterm.recv().await;
    info!("network worker shutting down");
    Ok(())
}

struct FieldService {
    store: Arc<SharedStore>,
    dev_names_path: PathBuf,
    runtime_dir: PathBuf,
    /* Live descriptors, fed by sensor worker notifications. */
    devices: Arc<Mutex<HashMap<String, DeviceDescriptor>>>,
}

impl FieldService {
    fn field_value(&self, key: &str, fallback: &str) -> String {
        self.store
            .get_as::<String>(key)
            .unwrap_or_else(|| fallback.to_string())
    }

    fn set_choice(&self, key: &str, value: String, legal: &[&str]) -> Response {
        let value = value.to_lowercase();
        if !legal.contains(&value.as_str()) {
            return Response::error(format!("\"{value}\" is not one of {legal:?}"));
        }
        match self.store.set_as(key, &value) {
            Ok(()) => Response::Ok,
            Err(err) => Response::error(err.to_string()),
        }
    }

    fn device_names(&self) -> HashMap<String, String> {
        self.store
            .get_as::<HashMap<String, String>>(KEY_DEVICE_NAMES)
            .unwrap_or_default()
    }

    /* Persist the names map to disk and replicate it. */
    fn save_names(&self, names: HashMap<String, String>) -> Response {
        if let Err(err) = schema::save_device_names(&self.dev_names_path, &names) {
            warn!(%err, "unable to persist device names");
        }
        match self.store.set_as(KEY_DEVICE_NAMES, &names) {
            Ok(()) => Response::Ok,
            Err(err) => Response::error(err.to_string()),
        }
    }

    /* Forward a device or challenge method to the worker that owns it. */
    async fn proxy(&self, worker: &str, request: Request) -> Response {
        let path = endpoint_path(&self.runtime_dir, worker);
        match RpcClient::connect_unix(&path).await {
            Ok(mut client) => match client.call(&request).await {
                Ok(response) => response,
                Err(err) => Response::error(format!("{worker} worker call failed: {err}")),
            },
            Err(err) => Response::error(format!("{worker} worker unavailable: {err}")),
        }
    }
}

#[async_trait]
impl RpcService for FieldService {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::GetVersion => {
                let mut parts = env!("CARGO_PKG_VERSION")
                    .split('.')
                    .map(|part| part.parse().unwrap_or(0));
                Response::Version {
                    major: parts.next().unwrap_or(0),
                    minor: parts.next().unwrap_or(0),
                    patch: parts.next().unwrap_or(0),
                }
            }
            Request::GetTime => {
                let seconds = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                Response::Time { seconds }
            }
            Request::GetFieldParameters => Response::FieldParameters {
                alliance: self.field_value(KEY_ALLIANCE, "unknown"),
                starting_zone: self.field_value(KEY_STARTING_ZONE, "unknown"),
                mode: self.field_value(KEY_MODE, "idle"),
            },
            Request::SetAlliance { alliance } => {
                self.set_choice(KEY_ALLIANCE, alliance, &ALLIANCES)
            }
            Request::SetStartingZone { zone } => {
                self.set_choice(KEY_STARTING_ZONE, zone, &STARTING_ZONES)
            }
            Request::SetMode { mode } => self.set_choice(KEY_MODE, mode, &MODES),
            Request::GetDeviceNames => Response::DeviceNames {
                names: self.device_names(),
            },
            Request::SetDeviceName { name, uid } => {
                let mut names = self.device_names();
                names.insert(uid, name);
                self.save_names(names)
            }
            Request::DelDeviceName { uid } => {
                let mut names = self.device_names();
                names.remove(&uid);
                self.save_names(names)
            }
            Request::RegisterDevice { descriptor } => {
                debug!(uid = %descriptor.uid, "device registered");
                self.devices
                    .lock()
                    .unwrap()
                    .insert(descriptor.uid.clone(), descriptor);
                Response::Ok
            }
            Request::UnregisterDevice { uid } => {
                debug!(%uid, "device unregistered");
                self.devices.lock().unwrap().remove(&uid);
                Response::Ok
            }
            request @ (Request::RunChallenge { .. } | Request::GetChallengeSolution) => {
                self.proxy(EXECUTOR_WORKER, request).await
            }
            request @ (Request::ListDevices
            | Request::SubscribeDevice { .. }
            | Request::WriteParams { .. }
            | Request::ReadParams { .. }
            | Request::Enumerate
            | Request::DisableAll) => self.proxy(SENSOR_WORKER, request).await,
        }
    }
}

/* The driver station sends a periodic datagram; each one gets at most
 * one reply, sent before the next datagram is read, so there is never
 * more than one outstanding. Ingest semantics live elsewhere; only
 * the socket lifecycle is owned here. */
struct StreamingChannel {
    store: Arc<SharedStore>,
    devices: Arc<Mutex<HashMap<String, DeviceDescriptor>>>,
    host: String,
    udp_recv: u16,
    udp_send: u16,
}

#[derive(Serialize)]
struct StreamUpdate {
    alliance: String,
    mode: String,
    devices: Vec<String>,
}

impl StreamingChannel {
    async fn run(self) -> std::io::Result<()> {
        let socket = UdpSocket::bind((self.host.as_str(), self.udp_recv)).await?;
        info!(port = self.udp_recv, "streaming channel up");
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, peer) = socket.recv_from(&mut buf).await?;
            if rmp_serde::from_slice::<serde::de::IgnoredAny>(&buf[..n]).is_err() {
                debug!(%peer, "dropping malformed datagram");
                continue;
            }
            let update = StreamUpdate {
                alliance: self
                    .store
                    .get_as::<String>(KEY_ALLIANCE)
                    .unwrap_or_else(|| "unknown".into()),
                mode: self
                    .store
                    .get_as::<String>(KEY_MODE)
                    .unwrap_or_else(|| "idle".into()),
                devices: self.devices.lock().unwrap().keys().cloned().collect(),
            };
            match rmp_serde::to_vec_named(&update) {
                Ok(reply) => {
                    let _ = socket.send_to(&reply, (peer.ip(), self.udp_send)).await;
                }
                Err(err) => warn!(%err, "cannot encode stream update"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service(dir: &std::path::Path) -> FieldService {
        FieldService {
            store: Arc::new(SharedStore::open(&dir.join("store")).await.unwrap()),
            dev_names_path: dir.join("names.json"),
            runtime_dir: dir.to_path_buf(),
            devices: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[tokio::test]
    async fn test_field_parameters_default_and_update() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        match service.handle(Request::GetFieldParameters).await {
            Response::FieldParameters {
                alliance, mode, ..
            } => {
                assert_eq!(alliance, "unknown");
                assert_eq!(mode, "idle");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            service
                .handle(Request::SetAlliance {
                    alliance: "Blue".into()
                })
                .await,
            Response::Ok
        ));
        assert!(matches!(
            service
                .handle(Request::SetMode {
                    mode: "teleop".into()
                })
                .await,
            Response::Ok
        ));
        match service.handle(Request::GetFieldParameters).await {
            Response::FieldParameters { alliance, mode, .. } => {
                assert_eq!(alliance, "blue");
                assert_eq!(mode, "teleop");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_mode_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        assert!(matches!(
            service
                .handle(Request::SetMode {
                    mode: "warp".into()
                })
                .await,
            Response::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_device_names_persist() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let uid = "000d00000000000000000005".to_string();

        assert!(matches!(
            service
                .handle(Request::SetDeviceName {
                    name: "left_motor".into(),
                    uid: uid.clone()
                })
                .await,
            Response::Ok
        ));
        let on_disk = schema::load_device_names(&dir.path().join("names.json")).unwrap();
        assert_eq!(on_disk.get(&uid).map(String::as_str), Some("left_motor"));

        /* Deleting twice stays idempotent. */
        for _ in 0..2 {
            assert!(matches!(
                service
                    .handle(Request::DelDeviceName { uid: uid.clone() })
                    .await,
                Response::Ok
            ));
        }
        match service.handle(Request::GetDeviceNames).await {
            Response::DeviceNames { names } => assert!(names.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_notifications_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let descriptor = DeviceDescriptor {
            uid: "0007000000000000000000aa".into(),
            type_id: 7,
            type_name: "RFID".into(),
            params: vec!["mode".into()],
        };
        service
            .handle(Request::RegisterDevice {
                descriptor: descriptor.clone(),
            })
            .await;
        assert!(service.devices.lock().unwrap().contains_key(&descriptor.uid));
        service
            .handle(Request::UnregisterDevice {
                uid: descriptor.uid.clone(),
            })
            .await;
        assert!(service.devices.lock().unwrap().is_empty());
    }
}
