/* Sensor worker: hosts the hotplug observer, the sensor links and the
 * registry, and serves the device half of the RPC surface. Dependent
 * workers learn about registrations through RegisterDevice /
 * UnregisterDevice notifications on their own endpoints. */

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Options;
use crate::hotplug::{self, HotplugObserver, ObserverCommand, PortEvent, RegistryEvent, SerialOpener};
use crate::registry::SensorRegistry;
use crate::rpc::{self, DependentClient, DeviceDescriptor, DeviceSnapshot, Request, Response, RpcService};
use crate::schema::{self, DeviceSchema, Uid};
use crate::store::SharedStore;
use crate::worker::{
    endpoint_path, EXECUTOR_WORKER, KEY_DEVICE_NAMES, NETWORK_WORKER, SENSOR_WORKER,
};

pub async fn run(options: Options) -> anyhow::Result<()> {
    let schema = Arc::new(
        DeviceSchema::load(&options.dev_schema).context("loading the sensor schema")?,
    );
    let registry = Arc::new(SensorRegistry::new(schema));
    let store = SharedStore::open(&options.store_dir())
        .await
        .context("joining the shared store")?;

    /* Publish the configured sensor names so peers can resolve them. */
    match schema::load_device_names(&options.dev_names) {
        Ok(names) => {
            let _ = store.set_as(KEY_DEVICE_NAMES, &names);
        }
        Err(err) => warn!(%err, "unable to read the device names file"),
    }

    let (notify_tx, mut notify_rx) = mpsc::channel::<RegistryEvent>(64);
    let (port_tx, port_rx) = mpsc::channel::<PortEvent>(64);
    let (command_tx, command_rx) = mpsc::channel::<ObserverCommand>(64);

    let opener = Arc::new(SerialOpener {
        baud: options.baud_rate,
    });
    let mut observer = HotplugObserver::new(Arc::clone(&registry), opener, notify_tx);

    if options.poll {
        tokio::spawn(hotplug::run_polling(
            options.poll_period(),
            options.virtual_devices.clone(),
            port_tx.clone(),
        ));
    } else {
        hotplug::spawn_udev_monitor(port_tx.clone())?;
        let mut initial = hotplug::enumerate_initial_ports();
        if let Some(path) = options.virtual_devices.as_deref() {
            initial.extend(hotplug::read_virtual_devices(path));
        }
        for port in initial {
            let _ = port_tx.send(PortEvent::Add(port)).await;
        }
    }

    let listener = rpc::bind_endpoint(&endpoint_path(&options.runtime_dir, SENSOR_WORKER))
        .context("binding the sensor endpoint")?;
    let service = Arc::new(SensorService {
        registry: Arc::clone(&registry),
        commands: command_tx.clone(),
    });
    tokio::spawn(rpc::serve_unix(listener, service));

    /* Fan registrations out to the dependents. */
    let runtime_dir = options.runtime_dir.clone();
    let notify_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        let mut dependents = [
            DependentClient::new(endpoint_path(&runtime_dir, NETWORK_WORKER)),
            DependentClient::new(endpoint_path(&runtime_dir, EXECUTOR_WORKER)),
        ];
        while let Some(event) = notify_rx.recv().await {
            let request = match event {
                RegistryEvent::Registered(uid) => {
                    let Ok(snapshot) = notify_registry.snapshot(uid).await else {
                        continue;
                    };
                    Request::RegisterDevice {
                        descriptor: DeviceDescriptor {
                            uid: uid.to_hex(),
                            type_id: snapshot.type_id,
                            type_name: snapshot.type_name,
                            params: snapshot.params.iter().map(|(n, _, _)| n.clone()).collect(),
                        },
                    }
                }
                RegistryEvent::Unregistered(uid) => Request::UnregisterDevice {
                    uid: uid.to_hex(),
                },
            };
            for dependent in dependents.iter_mut() {
                dependent.notify(&request).await;
            }
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing the SIGTERM handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("sensor worker shutting down"),
        _ = observer.run(port_rx, command_rx) => {}
    }
    drop(store);
    Ok(())
}

/* The device half of the RPC surface. */
struct SensorService {
    registry: Arc<SensorRegistry>,
    commands: mpsc::Sender<ObserverCommand>,
}

#[async_trait]
impl RpcService for SensorService {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::ListDevices => {
                let mut devices = Vec::new();
                for uid in self.registry.uids().await {
                    if let Ok(snapshot) = self.registry.snapshot(uid).await {
                        devices.push(DeviceSnapshot {
                            uid: uid.to_hex(),
                            type_name: snapshot.type_name,
                            delay_ms: snapshot.delay_ms,
                            params: snapshot
                                .params
                                .into_iter()
                                .map(|(name, value, ts)| (name, value.into(), ts))
                                .collect(),
                        });
                    }
                }
                Response::Devices { devices }
            }
            Request::SubscribeDevice { uid, params, delay } => {
                let Some(uid) = Uid::from_hex(&uid) else {
                    return Response::error("malformed uid");
                };
                let _ = self
                    .commands
                    .send(ObserverCommand::Subscribe { uid, params, delay })
                    .await;
                Response::Ok
            }
            Request::WriteParams { uid, values } => {
                let Some(uid) = Uid::from_hex(&uid) else {
                    return Response::error("malformed uid");
                };
                /* A rejected value produces a structured error and no
                 * frame goes out. */
                for (name, value) in values {
                    if let Err(err) = self.registry.write(uid, &name, value).await {
                        return Response::error(err.to_string());
                    }
                }
                let _ = self
                    .commands
                    .send(ObserverCommand::WriteDirty { uid })
                    .await;
                Response::Ok
            }
            Request::ReadParams { uid, params } => {
                let Some(uid) = Uid::from_hex(&uid) else {
                    return Response::error("malformed uid");
                };
                let mut values = Vec::new();
                for name in &params {
                    match self.registry.read(uid, name).await {
                        Ok((value, ts)) => values.push((name.clone(), value.into(), ts)),
                        Err(err) => return Response::error(err.to_string()),
                    }
                }
                /* Also nudge the device for a fresh reading. */
                let _ = self
                    .commands
                    .send(ObserverCommand::ReadParams { uid, params })
                    .await;
                Response::Values { values }
            }
            Request::Enumerate => {
                let _ = self.commands.send(ObserverCommand::PingAll).await;
                Response::Ok
            }
            Request::DisableAll => {
                let _ = self.commands.send(ObserverCommand::DisableAll).await;
                Response::Ok
            }
            other => Response::error(format!("method not served here: {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::test_schema;
    use crate::schema::ParamValue;

    fn service() -> (SensorService, mpsc::Receiver<ObserverCommand>) {
        let registry = Arc::new(SensorRegistry::new(Arc::new(test_schema())));
        let (commands, command_rx) = mpsc::channel(16);
        (SensorService { registry, commands }, command_rx)
    }

    fn uid() -> Uid {
        Uid::new(13, 0, 5)
    }

    #[tokio::test]
    async fn test_write_params_flushes_once() {
        let (service, mut commands) = service();
        service.registry.register(uid()).await.unwrap();

        let response = service
            .handle(Request::WriteParams {
                uid: uid().to_hex(),
                values: vec![
                    ("duty_cycle".into(), ParamValue::Float(0.5)),
                    ("pid_enabled".into(), ParamValue::Bool(true)),
                ],
            })
            .await;
        assert!(matches!(response, Response::Ok));
        assert!(matches!(
            commands.try_recv().unwrap(),
            ObserverCommand::WriteDirty { .. }
        ));
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_out_of_bounds_write_sends_nothing() {
        let (service, mut commands) = service();
        service.registry.register(uid()).await.unwrap();

        let response = service
            .handle(Request::WriteParams {
                uid: uid().to_hex(),
                values: vec![("duty_cycle".into(), ParamValue::Float(1.5))],
            })
            .await;
        match response {
            Response::Error { message } => assert!(message.contains("not in bounds")),
            other => panic!("expected a validation error, got {other:?}"),
        }
        /* No flush command: nothing reaches the wire. */
        assert!(commands.try_recv().is_err());
        let (value, _) = service.registry.read(uid(), "duty_cycle").await.unwrap();
        assert_eq!(value, crate::schema::Value::F32(0.0));
    }

    #[tokio::test]
    async fn test_unknown_uid_is_an_error() {
        let (service, _commands) = service();
        let response = service
            .handle(Request::ReadParams {
                uid: Uid::new(13, 0, 99).to_hex(),
                params: vec!["duty_cycle".into()],
            })
            .await;
        assert!(matches!(response, Response::Error { .. }));
    }

    #[tokio::test]
    async fn test_list_devices_snapshots_registry() {
        let (service, _commands) = service();
        service.registry.register(uid()).await.unwrap();
        match service.handle(Request::ListDevices).await {
            Response::Devices { devices } => {
                assert_eq!(devices.len(), 1);
                assert_eq!(devices[0].uid, uid().to_hex());
                assert_eq!(devices[0].type_name, "YogiBear");
            }
            other => panic!("expected device list, got {other:?}"),
        }
    }
}
