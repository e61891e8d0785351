/* Per-link protocol engine.
 *
 * Each open serial connection gets a pair of tasks: the RX task owns
 * the read half and is the only writer of device-originated registry
 * values; the TX task owns the write half and serializes outbound
 * frames through a FIFO command queue. Host writes are coalesced: the
 * TX task drains the registry's dirty set into a single DeviceWrite
 * whose bitmask is the union of the pending parameters.
 *
 * State machine: IdentifyPending (Ping sent, waiting for a
 * SubscriptionResponse within a bounded timeout) -> Active -> Closing
 * (drain TX with a short deadline, then release the port). */

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::FrameScanner;
use crate::error::RuntimeError;
use crate::message::{self, Message};
use crate::registry::SensorRegistry;
use crate::schema::Uid;

pub const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(1);

/* Deadline for flushing queued frames while Closing. */
const CLOSE_DRAIN: Duration = Duration::from_millis(250);

const COMMAND_DEPTH: usize = 32;
const READ_CHUNK: usize = 4096;

#[derive(Debug)]
pub enum LinkCommand {
    Ping,
    /* Subscribe by parameter name; an empty list with delay 0 silences
     * the device. */
    Subscribe { params: Vec<String>, delay: u16 },
    ReadParams { params: Vec<String> },
    /* Drain the registry dirty set into one DeviceWrite. */
    WriteDirty,
    HeartBeatResponse { id: u8 },
    Disable,
    Shutdown,
}

#[derive(Debug)]
pub enum LinkEvent {
    Identified {
        port: PathBuf,
        uid: Uid,
        nonce: u128,
    },
    IdentifyTimeout {
        port: PathBuf,
        nonce: u128,
    },
    Disconnected {
        port: PathBuf,
        uid: Option<Uid>,
        nonce: u128,
    },
}

/* Cloneable handle the hotplug observer keeps per open port. */
#[derive(Clone)]
pub struct LinkHandle {
    pub port: PathBuf,
    pub nonce: u128,
    cmd_tx: mpsc::Sender<LinkCommand>,
}

impl LinkHandle {
    pub async fn send(&self, command: LinkCommand) -> bool {
        self.cmd_tx.send(command).await.is_ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(LinkCommand::Shutdown).await;
    }
}

/* Spawn the RX/TX task pair for one port. The initial Ping is
 * enqueued before the handle is returned, so identification starts
 * immediately. */
pub fn spawn_link<R, W>(
    port: PathBuf,
    reader: R,
    writer: W,
    registry: Arc<SensorRegistry>,
    events: mpsc::Sender<LinkEvent>,
) -> LinkHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    let nonce: u128 = rand::random();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_DEPTH);
    let uid: Arc<OnceLock<Uid>> = Arc::new(OnceLock::new());

    let _ = cmd_tx.try_send(LinkCommand::Ping);

    let rx = RxTask {
        port: port.clone(),
        reader,
        registry: Arc::clone(&registry),
        events,
        nonce,
        uid: Arc::clone(&uid),
        cmd_tx: cmd_tx.clone(),
    };
    tokio::spawn(rx.run());

    let tx = TxTask {
        port: port.clone(),
        writer,
        registry,
        cmd_rx,
        uid,
    };
    tokio::spawn(tx.run());

    LinkHandle {
        port,
        nonce,
        cmd_tx,
    }
}

/* ---------------------------------------------------------------------- */
/* RX task                                                                */
/* ---------------------------------------------------------------------- */

struct RxTask<R> {
    port: PathBuf,
    reader: R,
    registry: Arc<SensorRegistry>,
    events: mpsc::Sender<LinkEvent>,
    nonce: u128,
    uid: Arc<OnceLock<Uid>>,
    cmd_tx: mpsc::Sender<LinkCommand>,
}

impl<R: AsyncRead + Unpin + Send + 'static> RxTask<R> {
    async fn run(mut self) {
        let mut scanner = FrameScanner::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let identify_deadline = tokio::time::Instant::now() + IDENTIFY_TIMEOUT;

        loop {
            let read = if self.uid.get().is_none() {
                match tokio::time::timeout_at(identify_deadline, self.reader.read(&mut buf)).await
                {
                    Ok(read) => read,
                    Err(_) => {
                        debug!(port = %self.port.display(), "no identification before deadline");
                        let _ = self
                            .events
                            .send(LinkEvent::IdentifyTimeout {
                                port: self.port.clone(),
                                nonce: self.nonce,
                            })
                            .await;
                        return;
                    }
                }
            } else {
                self.reader.read(&mut buf).await
            };

            let n = match read {
                Ok(0) => {
                    self.disconnected(None).await;
                    return;
                }
                Ok(n) => n,
                Err(source) => {
                    let err = RuntimeError::LinkIo {
                        port: self.port.display().to_string(),
                        source,
                    };
                    warn!(%err, "link read failed");
                    self.disconnected(Some(err)).await;
                    return;
                }
            };

            scanner.extend(&buf[..n]);
            while let Some(frame) = scanner.next_frame() {
                let raw = match frame {
                    Ok(raw) => raw,
                    Err(err) => {
                        debug!(port = %self.port.display(), %err, "dropped frame");
                        continue;
                    }
                };
                let msg = match Message::parse(&raw) {
                    Ok(msg) => msg,
                    Err(err) => {
                        debug!(port = %self.port.display(), %err, "unparseable frame");
                        continue;
                    }
                };
                self.dispatch(msg).await;
            }
        }
    }

    async fn dispatch(&mut self, msg: Message) {
        match msg {
            Message::SubscriptionResponse { delay, uid, .. } => match self.uid.get() {
                None => self.identify(uid, delay).await,
                Some(&current) if current == uid => {
                    self.registry.set_delay(uid, delay).await;
                }
                Some(current) => {
                    warn!(
                        port = %self.port.display(),
                        expected = %current,
                        got = %uid,
                        "subscription response from a different uid"
                    );
                }
            },
            Message::DeviceData { params, data } => {
                let Some(&uid) = self.uid.get() else {
                    debug!(port = %self.port.display(), "device data before identification");
                    return;
                };
                let Some(device_type) = self.registry.device_type(uid).await else {
                    return;
                };
                match message::unpack_params(&device_type, params, &data) {
                    Ok(values) => self.registry.apply_device_update(uid, &values).await,
                    Err(err) => debug!(port = %self.port.display(), %err, "bad device data"),
                }
            }
            /* Answered within the same event-loop turn. */
            Message::HeartBeatRequest { id } => {
                let _ = self.cmd_tx.send(LinkCommand::HeartBeatResponse { id }).await;
            }
            Message::Error { code } => {
                warn!(port = %self.port.display(), code, "device reported an error");
            }
            other => {
                debug!(
                    port = %self.port.display(),
                    message_id = other.message_id(),
                    "unexpected host-bound message"
                );
            }
        }
    }

    async fn identify(&mut self, uid: Uid, delay: u16) {
        if let Err(err) = self.registry.register(uid).await {
            warn!(port = %self.port.display(), %err, "cannot register sensor");
            return;
        }
        self.registry.set_delay(uid, delay).await;
        let _ = self.uid.set(uid);
        info!(port = %self.port.display(), uid = %uid, "sensor identified");

        /* Silence the device until a subscription is configured. */
        let _ = self
            .cmd_tx
            .send(LinkCommand::Subscribe {
                params: Vec::new(),
                delay: 0,
            })
            .await;
        let _ = self
            .events
            .send(LinkEvent::Identified {
                port: self.port.clone(),
                uid,
                nonce: self.nonce,
            })
            .await;
    }

    async fn disconnected(&mut self, _err: Option<RuntimeError>) {
        let _ = self
            .events
            .send(LinkEvent::Disconnected {
                port: self.port.clone(),
                uid: self.uid.get().copied(),
                nonce: self.nonce,
            })
            .await;
    }
}

/* ---------------------------------------------------------------------- */
/* TX task                                                                */
/* ---------------------------------------------------------------------- */

struct TxTask<W> {
    port: PathBuf,
    writer: W,
    registry: Arc<SensorRegistry>,
    cmd_rx: mpsc::Receiver<LinkCommand>,
    uid: Arc<OnceLock<Uid>>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> TxTask<W> {
    async fn run(mut self) {
        while let Some(command) = self.cmd_rx.recv().await {
            match command {
                LinkCommand::Shutdown => {
                    self.drain().await;
                    break;
                }
                other => {
                    if let Err(err) = self.handle(other).await {
                        debug!(port = %self.port.display(), %err, "link write failed");
                        break;
                    }
                }
            }
        }

        /* POSIX close on a serial port can block for seconds; keep it
         * off the event loop. */
        let writer = self.writer;
        tokio::task::spawn_blocking(move || drop(writer));
    }

    /* Closing: flush already-queued frames under a short deadline. */
    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + CLOSE_DRAIN;
        while let Ok(command) = self.cmd_rx.try_recv() {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            if matches!(command, LinkCommand::Shutdown) {
                continue;
            }
            if self.handle(command).await.is_err() {
                break;
            }
        }
    }

    async fn handle(&mut self, command: LinkCommand) -> Result<(), RuntimeError> {
        match command {
            LinkCommand::Ping => self.transmit(Message::Ping).await,
            LinkCommand::Disable => self.transmit(Message::Disable).await,
            LinkCommand::HeartBeatResponse { id } => {
                self.transmit(Message::HeartBeatResponse { id }).await
            }
            LinkCommand::Subscribe { params, delay } => {
                let Some(mask) = self.encode_mask(&params).await else {
                    return Ok(());
                };
                self.transmit(Message::SubscriptionRequest {
                    params: mask,
                    delay,
                })
                .await
            }
            LinkCommand::ReadParams { params } => {
                let Some(mask) = self.encode_mask(&params).await else {
                    return Ok(());
                };
                self.transmit(Message::DeviceRead { params: mask }).await
            }
            LinkCommand::WriteDirty => {
                let Some(&uid) = self.uid.get() else {
                    return Ok(());
                };
                let pending = self.registry.take_dirty(uid).await;
                if pending.is_empty() {
                    return Ok(());
                }
                let (mask, data) = message::pack_params(&pending);
                self.transmit(Message::DeviceWrite { params: mask, data })
                    .await
            }
            LinkCommand::Shutdown => Ok(()),
        }
    }

    async fn encode_mask(&self, params: &[String]) -> Option<u16> {
        let &uid = self.uid.get()?;
        let device_type = self.registry.device_type(uid).await?;
        match device_type.encode_params(params) {
            Ok(mask) => Some(mask),
            Err(err) => {
                warn!(port = %self.port.display(), %err, "bad parameter list");
                None
            }
        }
    }

    async fn transmit(&mut self, msg: Message) -> Result<(), RuntimeError> {
        let frame = msg.to_frame()?;
        let io_err = |source| RuntimeError::LinkIo {
            port: self.port.display().to_string(),
            source,
        };
        self.writer.write_all(&frame).await.map_err(io_err)?;
        self.writer.flush().await.map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::test_schema;
    use crate::schema::{ParamValue, Value};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    struct Harness {
        registry: Arc<SensorRegistry>,
        handle: LinkHandle,
        events: mpsc::Receiver<LinkEvent>,
        dev_reader: ReadHalf<DuplexStream>,
        dev_writer: WriteHalf<DuplexStream>,
        scanner: FrameScanner,
    }

    fn harness() -> Harness {
        let registry = Arc::new(SensorRegistry::new(Arc::new(test_schema())));
        let (host_side, device_side) = duplex(4096);
        let (link_reader, link_writer) = tokio::io::split(host_side);
        let (dev_reader, dev_writer) = tokio::io::split(device_side);
        let (events_tx, events) = mpsc::channel(16);
        let handle = spawn_link(
            PathBuf::from("/dev/ttyACM9"),
            link_reader,
            link_writer,
            Arc::clone(&registry),
            events_tx,
        );
        Harness {
            registry,
            handle,
            events,
            dev_reader,
            dev_writer,
            scanner: FrameScanner::new(),
        }
    }

    impl Harness {
        /* Read the next host-to-device message off the wire. */
        async fn recv(&mut self) -> Message {
            let mut buf = [0u8; 256];
            loop {
                if let Some(frame) = self.scanner.next_frame() {
                    return Message::parse(&frame.unwrap()).unwrap();
                }
                let n = self.dev_reader.read(&mut buf).await.unwrap();
                assert!(n > 0, "link closed the write side");
                self.scanner.extend(&buf[..n]);
            }
        }

        async fn send(&mut self, msg: Message) {
            self.dev_writer
                .write_all(&msg.to_frame().unwrap())
                .await
                .unwrap();
        }

        async fn identify(&mut self, uid: Uid) {
            assert_eq!(self.recv().await, Message::Ping);
            self.send(Message::SubscriptionResponse {
                params: 0,
                delay: 0,
                uid,
            })
            .await;
            match self.events.recv().await.unwrap() {
                LinkEvent::Identified { uid: got, .. } => assert_eq!(got, uid),
                other => panic!("expected Identified, got {other:?}"),
            }
            /* The engine silences the device right after identifying. */
            assert_eq!(
                self.recv().await,
                Message::SubscriptionRequest {
                    params: 0,
                    delay: 0
                }
            );
        }
    }

    fn yogi_uid() -> Uid {
        Uid::new(13, 0, 0x0123_4567_89ab_cdef)
    }

    #[tokio::test]
    async fn test_identification_registers_sensor() {
        let mut h = harness();
        h.identify(yogi_uid()).await;
        assert!(h.registry.contains(yogi_uid()).await);
        let snapshot = h.registry.snapshot(yogi_uid()).await.unwrap();
        assert_eq!(snapshot.type_name, "YogiBear");
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_timeout_reported() {
        let mut h = harness();
        /* Never answer the Ping. */
        match h.events.recv().await.unwrap() {
            LinkEvent::IdentifyTimeout { nonce, .. } => assert_eq!(nonce, h.handle.nonce),
            other => panic!("expected IdentifyTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_echoed() {
        let mut h = harness();
        h.identify(yogi_uid()).await;
        h.send(Message::HeartBeatRequest { id: 9 }).await;
        assert_eq!(h.recv().await, Message::HeartBeatResponse { id: 9 });
    }

    #[tokio::test]
    async fn test_device_data_lands_in_registry() {
        let mut h = harness();
        h.identify(yogi_uid()).await;
        let (mask, data) = message::pack_params(&[(1, Value::F64(360.5))]);
        h.send(Message::DeviceData { params: mask, data }).await;
        /* The RX task applies the update asynchronously. */
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let (value, _) = h.registry.read(yogi_uid(), "enc_pos").await.unwrap();
                if value == Value::F64(360.5) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_write_dirty_coalesces_into_one_frame() {
        let mut h = harness();
        h.identify(yogi_uid()).await;
        h.registry
            .write(yogi_uid(), "duty_cycle", ParamValue::Float(0.5))
            .await
            .unwrap();
        h.registry
            .write(yogi_uid(), "pid_enabled", ParamValue::Bool(true))
            .await
            .unwrap();
        h.handle.send(LinkCommand::WriteDirty).await;

        match h.recv().await {
            Message::DeviceWrite { params, data } => {
                assert_eq!(params, 0b101);
                assert_eq!(data, vec![0x00, 0x00, 0x00, 0x3f, 0x01]);
            }
            other => panic!("expected DeviceWrite, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_corrupt_frame_ignored() {
        let mut h = harness();
        h.identify(yogi_uid()).await;

        let mut frame = Message::SubscriptionResponse {
            params: 0,
            delay: 9,
            uid: yogi_uid(),
        }
        .to_frame()
        .unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        h.dev_writer.write_all(&frame).await.unwrap();

        /* A healthy heartbeat after the corrupt frame still gets its
         * echo, and the bad delay never landed. */
        h.send(Message::HeartBeatRequest { id: 3 }).await;
        assert_eq!(h.recv().await, Message::HeartBeatResponse { id: 3 });
        assert_eq!(h.registry.snapshot(yogi_uid()).await.unwrap().delay_ms, 0);
    }

    #[tokio::test]
    async fn test_disconnect_event_on_eof() {
        let mut h = harness();
        h.identify(yogi_uid()).await;
        drop(h.dev_writer);
        match h.events.recv().await.unwrap() {
            LinkEvent::Disconnected { uid, nonce, .. } => {
                assert_eq!(uid, Some(yogi_uid()));
                assert_eq!(nonce, h.handle.nonce);
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }
}
