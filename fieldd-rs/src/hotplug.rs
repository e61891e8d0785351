/* Hotplug observer: maintains the port -> link mapping.
 *
 * Two sources of port events feed the observer: a udev monitor
 * (preferred, Linux) filtered to the sensor boards' USB interface, and
 * a polling scanner used as the fallback and for virtual devices.
 *
 * Disconnects are debounced: a link's I/O failure produces a
 * `Disconnected(uid, nonce)` event which the observer holds for one
 * cycle. If the same uid reappears under a new instance nonce within
 * that cycle the disconnect was a flicker and is discarded; otherwise
 * the registry entry is torn down. Port closure itself can block for
 * seconds, so it happens on a dedicated cleanup task. */

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::link::{spawn_link, LinkCommand, LinkEvent, LinkHandle};
use crate::registry::SensorRegistry;
use crate::schema::Uid;
use crate::serial;

/* Arduino Micro in CDC-ACM mode. */
pub const SENSOR_VID: u16 = 0x2341;
pub const SENSOR_PID: u16 = 0x8037;

/* Floor for the polling period; the observer refuses to spin faster. */
pub const MIN_POLL_PERIOD: Duration = Duration::from_secs(1);

/* One observer cycle: pending disconnects survive exactly one tick. */
const DEBOUNCE_PERIOD: Duration = Duration::from_secs(1);

const DEV_PREFIXES: [&str; 3] = ["ttyACM", "ttyUSB", "tty.usbmodem"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    Add(PathBuf),
    Remove(PathBuf),
}

/* Registration changes surfaced to dependent workers. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(Uid),
    Unregistered(Uid),
}

/* Link-directed requests from the consumer interface (RPC). */
#[derive(Debug)]
pub enum ObserverCommand {
    Subscribe {
        uid: Uid,
        params: Vec<String>,
        delay: u16,
    },
    ReadParams {
        uid: Uid,
        params: Vec<String>,
    },
    /* Flush pending registry writes for one sensor. */
    WriteDirty {
        uid: Uid,
    },
    PingAll,
    DisableAll,
}

pub type PortReader = Box<dyn AsyncRead + Unpin + Send>;
pub type PortWriter = Box<dyn AsyncWrite + Unpin + Send + Sync>;

/* Seam between the observer and the transport, so scripted transports
 * can stand in for serial ports. */
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, path: &Path) -> Result<(PortReader, PortWriter), RuntimeError>;
}

pub struct SerialOpener {
    pub baud: u32,
}

#[async_trait]
impl PortOpener for SerialOpener {
    async fn open(&self, path: &Path) -> Result<(PortReader, PortWriter), RuntimeError> {
        let halves = serial::open(path.to_path_buf(), self.baud).await?;
        Ok((Box::new(halves.reader), Box::new(halves.writer)))
    }
}

/* ---------------------------------------------------------------------- */
/* Port scanning (polling mode + virtual devices)                         */
/* ---------------------------------------------------------------------- */

/* Paths listed in the virtual device file, whitespace-separated. */
pub fn read_virtual_devices(path: &Path) -> Vec<PathBuf> {
    match std::fs::read_to_string(path) {
        Ok(text) => text.split_whitespace().map(PathBuf::from).collect(),
        Err(err) => {
            debug!(path = %path.display(), %err, "no virtual device file");
            Vec::new()
        }
    }
}

/* Candidate serial ports: /dev entries with the usual CDC-ACM
 * prefixes, plus any paths listed in the virtual device file. */
pub fn scan_ports(virtual_devices: Option<&Path>) -> HashSet<PathBuf> {
    let mut ports = HashSet::new();
    if let Ok(entries) = std::fs::read_dir("/dev") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if DEV_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
                ports.insert(entry.path());
            }
        }
    }
    if let Some(path) = virtual_devices {
        ports.extend(read_virtual_devices(path));
    }
    ports
}

/* Polling fallback: diff the port set every `period` and emit
 * add/remove events. */
pub async fn run_polling(
    period: Duration,
    virtual_devices: Option<PathBuf>,
    events: mpsc::Sender<PortEvent>,
) {
    let period = period.max(MIN_POLL_PERIOD);
    let mut ticker = tokio::time::interval(period);
    let mut known: HashSet<PathBuf> = HashSet::new();
    loop {
        ticker.tick().await;
        let current = scan_ports(virtual_devices.as_deref());
        for port in current.difference(&known) {
            if events.send(PortEvent::Add(port.clone())).await.is_err() {
                return;
            }
        }
        for port in known.difference(&current) {
            if events.send(PortEvent::Remove(port.clone())).await.is_err() {
                return;
            }
        }
        known = current;
    }
}

/* ---------------------------------------------------------------------- */
/* udev monitor (event-driven mode)                                       */
/* ---------------------------------------------------------------------- */

/* True when the USB descriptor belongs to a sensor board. The PRODUCT
 * property reads "vid/pid/rev" in hex. */
fn is_sensor(device: &udev::Device) -> bool {
    let Some(product) = device.property_value("PRODUCT").and_then(|v| v.to_str()) else {
        return false;
    };
    let mut fields = product.split('/');
    let (Some(vid), Some(pid)) = (fields.next(), fields.next()) else {
        return false;
    };
    matches!(
        (u16::from_str_radix(vid, 16), u16::from_str_radix(pid, 16)),
        (Ok(SENSOR_VID), Ok(SENSOR_PID))
    )
}

/* Resolve a usb_interface device to the tty node it exposes. */
fn resolve_tty_node(syspath: &Path) -> Option<PathBuf> {
    let mut enumerator = udev::Enumerator::new().ok()?;
    enumerator.match_subsystem("tty").ok()?;
    for tty in enumerator.scan_devices().ok()? {
        if tty.syspath().starts_with(syspath) {
            if let Some(node) = tty.devnode() {
                return Some(node.to_path_buf());
            }
        }
    }
    None
}

/* Ports already present at startup. */
pub fn enumerate_initial_ports() -> Vec<PathBuf> {
    let mut ports = Vec::new();
    let Ok(mut enumerator) = udev::Enumerator::new() else {
        return ports;
    };
    if enumerator.match_subsystem("usb").is_err() {
        return ports;
    }
    if let Ok(devices) = enumerator.scan_devices() {
        for device in devices {
            if is_sensor(&device) {
                if let Some(node) = resolve_tty_node(device.syspath()) {
                    ports.push(node);
                }
            }
        }
    }
    ports
}

/* Subscribe to kernel USB events and translate them to port events.
 * Removal events can no longer resolve a tty node, so the monitor
 * remembers the syspath -> node mapping from the add side. */
pub fn spawn_udev_monitor(events: mpsc::Sender<PortEvent>) -> anyhow::Result<()> {
    use anyhow::Context;

    let socket = udev::MonitorBuilder::new()
        .context("creating udev monitor")?
        .match_subsystem_devtype("usb", "usb_interface")
        .context("filtering udev monitor")?
        .listen()
        .context("listening on udev monitor")?;

    tokio::spawn(async move {
        let fd = match tokio::io::unix::AsyncFd::new(socket) {
            Ok(fd) => fd,
            Err(err) => {
                warn!(%err, "udev monitor socket not pollable");
                return;
            }
        };
        let mut nodes: HashMap<PathBuf, PathBuf> = HashMap::new();
        loop {
            let mut guard = match fd.readable().await {
                Ok(guard) => guard,
                Err(err) => {
                    warn!(%err, "udev monitor failed");
                    return;
                }
            };
            for event in fd.get_ref().iter() {
                let device = event.device();
                match event.event_type() {
                    udev::EventType::Add if is_sensor(&device) => {
                        let syspath = device.syspath().to_path_buf();
                        if let Some(node) = resolve_tty_node(&syspath) {
                            nodes.insert(syspath, node.clone());
                            if events.send(PortEvent::Add(node)).await.is_err() {
                                return;
                            }
                        } else {
                            debug!(syspath = %syspath.display(), "sensor without a tty node");
                        }
                    }
                    udev::EventType::Remove => {
                        if let Some(node) = nodes.remove(device.syspath()) {
                            if events.send(PortEvent::Remove(node)).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ => {}
                }
            }
            guard.clear_ready();
        }
    });
    Ok(())
}

/* ---------------------------------------------------------------------- */
/* The observer                                                           */
/* ---------------------------------------------------------------------- */

struct PendingDisconnect {
    uid: Uid,
    nonce: u128,
    /* Set once the disconnect has survived a full cycle. */
    held: bool,
}

pub struct HotplugObserver {
    registry: Arc<SensorRegistry>,
    opener: Arc<dyn PortOpener>,
    notify: mpsc::Sender<RegistryEvent>,
    links: HashMap<PathBuf, LinkHandle>,
    by_uid: HashMap<Uid, (PathBuf, u128)>,
    pending: Vec<PendingDisconnect>,
    link_tx: mpsc::Sender<LinkEvent>,
    link_rx: mpsc::Receiver<LinkEvent>,
    cleanup_tx: mpsc::Sender<LinkHandle>,
}

impl HotplugObserver {
    pub fn new(
        registry: Arc<SensorRegistry>,
        opener: Arc<dyn PortOpener>,
        notify: mpsc::Sender<RegistryEvent>,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::channel(64);
        let cleanup_tx = spawn_cleanup_task();
        Self {
            registry,
            opener,
            notify,
            links: HashMap::new(),
            by_uid: HashMap::new(),
            pending: Vec::new(),
            link_tx,
            link_rx,
            cleanup_tx,
        }
    }

    pub fn link_for(&self, uid: Uid) -> Option<&LinkHandle> {
        let (port, _) = self.by_uid.get(&uid)?;
        self.links.get(port)
    }

    /* Main loop: multiplex port events, consumer commands, link
     * events and the debounce tick. Returns when the port event
     * source closes. */
    pub async fn run(
        &mut self,
        mut ports: mpsc::Receiver<PortEvent>,
        mut commands: mpsc::Receiver<ObserverCommand>,
    ) {
        let mut cycle = tokio::time::interval(DEBOUNCE_PERIOD);
        cycle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = ports.recv() => match maybe {
                    Some(PortEvent::Add(port)) => self.add_port(port).await,
                    Some(PortEvent::Remove(port)) => self.remove_port(port).await,
                    None => break,
                },
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(event) = self.link_rx.recv() => self.handle_link_event(event).await,
                _ = cycle.tick() => self.process_pending().await,
            }
        }
        self.shutdown().await;
    }

    pub async fn handle_command(&mut self, command: ObserverCommand) {
        match command {
            ObserverCommand::Subscribe { uid, params, delay } => {
                if let Some(link) = self.link_for(uid) {
                    link.send(LinkCommand::Subscribe { params, delay }).await;
                }
            }
            ObserverCommand::ReadParams { uid, params } => {
                if let Some(link) = self.link_for(uid) {
                    link.send(LinkCommand::ReadParams { params }).await;
                }
            }
            ObserverCommand::WriteDirty { uid } => {
                if let Some(link) = self.link_for(uid) {
                    link.send(LinkCommand::WriteDirty).await;
                }
            }
            ObserverCommand::PingAll => {
                for link in self.links.values() {
                    link.send(LinkCommand::Ping).await;
                }
            }
            ObserverCommand::DisableAll => {
                for link in self.links.values() {
                    link.send(LinkCommand::Disable).await;
                }
            }
        }
    }

    pub async fn add_port(&mut self, port: PathBuf) {
        if self.links.contains_key(&port) {
            return;
        }
        let (reader, writer) = match self.opener.open(&port).await {
            Ok(halves) => halves,
            Err(err) => {
                warn!(port = %port.display(), %err, "cannot open port");
                return;
            }
        };
        info!(port = %port.display(), "opening link");
        let handle = spawn_link(
            port.clone(),
            reader,
            writer,
            Arc::clone(&self.registry),
            self.link_tx.clone(),
        );
        self.links.insert(port, handle);
    }

    pub async fn remove_port(&mut self, port: PathBuf) {
        let Some(handle) = self.links.remove(&port) else {
            return;
        };
        debug!(port = %port.display(), "port removed");
        /* If the port had an identified sensor, run its teardown
         * through the same debounce as an I/O disconnect. */
        if let Some((uid, (_, nonce))) = self
            .by_uid
            .iter()
            .find(|(_, (p, _))| *p == port)
            .map(|(uid, entry)| (*uid, entry.clone()))
        {
            self.pending.push(PendingDisconnect {
                uid,
                nonce,
                held: false,
            });
        }
        let _ = self.cleanup_tx.send(handle).await;
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Identified { port, uid, nonce } => {
                self.by_uid.insert(uid, (port, nonce));
                let _ = self.notify.send(RegistryEvent::Registered(uid)).await;
            }
            LinkEvent::IdentifyTimeout { port, nonce } => {
                if let Some(handle) = self.links.get(&port) {
                    if handle.nonce == nonce {
                        info!(port = %port.display(), "no sensor identified, closing");
                        let handle = self.links.remove(&port).unwrap();
                        let _ = self.cleanup_tx.send(handle).await;
                    }
                }
            }
            LinkEvent::Disconnected { port, uid, nonce } => {
                if let Some(handle) = self.links.get(&port) {
                    if handle.nonce == nonce {
                        let handle = self.links.remove(&port).unwrap();
                        let _ = self.cleanup_tx.send(handle).await;
                    }
                }
                if let Some(uid) = uid {
                    self.pending.push(PendingDisconnect {
                        uid,
                        nonce,
                        held: false,
                    });
                }
            }
        }
    }

    /* Act on disconnects that survived a full cycle; discard the ones
     * whose uid has reappeared under a fresh nonce. */
    pub async fn process_pending(&mut self) {
        let mut still_pending = Vec::new();
        for mut item in self.pending.drain(..) {
            if !item.held {
                item.held = true;
                still_pending.push(item);
                continue;
            }
            match self.by_uid.get(&item.uid) {
                Some((_, nonce)) if *nonce != item.nonce => {
                    debug!(uid = %item.uid, "disconnect superseded by a reconnection");
                }
                _ => {
                    info!(uid = %item.uid, "sensor disconnected");
                    self.by_uid.remove(&item.uid);
                    self.registry.unregister(item.uid).await;
                    let _ = self
                        .notify
                        .send(RegistryEvent::Unregistered(item.uid))
                        .await;
                }
            }
        }
        self.pending = still_pending;
    }

    async fn shutdown(&mut self) {
        for (_, handle) in self.links.drain() {
            let _ = self.cleanup_tx.send(handle).await;
        }
    }
}

/* Closing a serial port may block for many seconds; a dedicated task
 * absorbs that so the observer stays responsive. */
fn spawn_cleanup_task() -> mpsc::Sender<LinkHandle> {
    let (tx, mut rx) = mpsc::channel::<LinkHandle>(32);
    tokio::spawn(async move {
        while let Some(handle) = rx.recv().await {
            debug!(port = %handle.port.display(), "cleaning up link");
            handle.shutdown().await;
        }
    });
    tx
}
