/* MessagePack request/response RPC.
 *
 * Wire format: a u32 little-endian length prefix followed by one
 * MessagePack-encoded `Request` or `Response`. One request gets
 * exactly one response, in order, per connection. Served over TCP for
 * external consumers and over Unix sockets between workers. */

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::schema::ParamValue;

pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/* Frames above this are junk or an attack, not a legitimate call. */
const MAX_FRAME: usize = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub uid: String,
    pub type_id: u16,
    pub type_name: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub uid: String,
    pub type_name: String,
    pub delay_ms: u16,
    pub params: Vec<(String, ParamValue, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    GetVersion,
    GetTime,
    GetFieldParameters,
    SetAlliance { alliance: String },
    SetStartingZone { zone: String },
    SetMode { mode: String },
    GetDeviceNames,
    SetDeviceName { name: String, uid: String },
    DelDeviceName { uid: String },
    /* Notifications from the sensor worker to its dependents. */
    RegisterDevice { descriptor: DeviceDescriptor },
    UnregisterDevice { uid: String },
    RunChallenge { seed: i64, timeout: f64 },
    GetChallengeSolution,
    /* Device operations served by the sensor worker. */
    ListDevices,
    SubscribeDevice { uid: String, params: Vec<String>, delay: u16 },
    WriteParams { uid: String, values: Vec<(String, ParamValue)> },
    ReadParams { uid: String, params: Vec<String> },
    Enumerate,
    DisableAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Version { major: u16, minor: u16, patch: u16 },
    Time { seconds: f64 },
    FieldParameters { alliance: String, starting_zone: String, mode: String },
    DeviceNames { names: HashMap<String, String> },
    Devices { devices: Vec<DeviceSnapshot> },
    Values { values: Vec<(String, ParamValue, f64)> },
    ChallengeSolution { solution: Option<i64> },
    Error { message: String },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}

/* One service handles every method; unsupported methods answer with a
 * structured error. */
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/* ---------------------------------------------------------------------- */
/* Framing                                                                */
/* ---------------------------------------------------------------------- */

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = rmp_serde::to_vec_named(value).map_err(std::io::Error::other)?;
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

pub async fn read_frame<R, T>(reader: &mut R) -> std::io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME {
        return Err(std::io::Error::other("oversized RPC frame"));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    rmp_serde::from_slice(&body).map_err(std::io::Error::other)
}

/* ---------------------------------------------------------------------- */
/* Servers                                                                */
/* ---------------------------------------------------------------------- */

async fn serve_connection<S>(mut stream: S, service: Arc<dyn RpcService>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let request: Request = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return,
            Err(err) => {
                debug!(%err, "RPC connection dropped");
                return;
            }
        };
        let response = service.handle(request).await;
        if let Err(err) = write_frame(&mut stream, &response).await {
            debug!(%err, "RPC reply failed");
            return;
        }
    }
}

pub async fn serve_tcp(listener: TcpListener, service: Arc<dyn RpcService>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "RPC client connected");
                tokio::spawn(serve_connection(stream, Arc::clone(&service)));
            }
            Err(err) => {
                warn!(%err, "TCP accept failed");
                return;
            }
        }
    }
}

pub async fn serve_unix(listener: UnixListener, service: Arc<dyn RpcService>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(serve_connection(stream, Arc::clone(&service)));
            }
            Err(err) => {
                warn!(%err, "Unix socket accept failed");
                return;
            }
        }
    }
}

/* Bind a worker's private endpoint, replacing any stale socket. */
pub fn bind_endpoint(path: &Path) -> std::io::Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
}

/* ---------------------------------------------------------------------- */
/* Client                                                                 */
/* ---------------------------------------------------------------------- */

enum ClientStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

pub struct RpcClient {
    stream: ClientStream,
}

impl RpcClient {
    pub async fn connect_tcp(host: &str, port: u16) -> std::io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self {
            stream: ClientStream::Tcp(stream),
        })
    }

    pub async fn connect_unix(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self {
            stream: ClientStream::Unix(stream),
        })
    }

    pub async fn call(&mut self, request: &Request) -> std::io::Result<Response> {
        tokio::time::timeout(CALL_TIMEOUT, self.call_inner(request))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "RPC call timed out"))?
    }

    async fn call_inner(&mut self, request: &Request) -> std::io::Result<Response> {
        match &mut self.stream {
            ClientStream::Tcp(stream) => {
                write_frame(stream, request).await?;
                read_frame(stream).await
            }
            ClientStream::Unix(stream) => {
                write_frame(stream, request).await?;
                read_frame(stream).await
            }
        }
    }
}

/* A lazily-connected client for dependent endpoints that may not be
 * up yet; each call re-dials when the connection is missing or the
 * previous call failed. */
pub struct DependentClient {
    path: PathBuf,
    client: Option<RpcClient>,
}

impl DependentClient {
    pub fn new(path: PathBuf) -> Self {
        Self { path, client: None }
    }

    pub async fn notify(&mut self, request: &Request) {
        if self.client.is_none() {
            match RpcClient::connect_unix(&self.path).await {
                Ok(client) => self.client = Some(client),
                Err(err) => {
                    debug!(path = %self.path.display(), %err, "dependent not reachable");
                    return;
                }
            }
        }
        if let Some(client) = self.client.as_mut() {
            if let Err(err) = client.call(request).await {
                debug!(path = %self.path.display(), %err, "dependent call failed");
                self.client = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoService;

    #[async_trait]
    impl RpcService for EchoService {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::GetVersion => Response::Version {
                    major: 1,
                    minor: 0,
                    patch: 0,
                },
                Request::SetMode { mode } => {
                    if mode == "estop" {
                        Response::Ok
                    } else {
                        Response::error(format!("unexpected mode {mode}"))
                    }
                }
                _ => Response::error("unsupported"),
            }
        }
    }

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_tcp(listener, Arc::new(EchoService)));

        let mut client = RpcClient::connect_tcp("127.0.0.1", addr.port()).await.unwrap();
        match client.call(&Request::GetVersion).await.unwrap() {
            Response::Version { major, .. } => assert_eq!(major, 1),
            other => panic!("unexpected response {other:?}"),
        }
        /* Multiple calls share the connection. */
        match client
            .call(&Request::SetMode {
                mode: "estop".into(),
            })
            .await
            .unwrap()
        {
            Response::Ok => {}
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unix_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc-test.sock");
        let listener = bind_endpoint(&path).unwrap();
        tokio::spawn(serve_unix(listener, Arc::new(EchoService)));

        let mut client = RpcClient::connect_unix(&path).await.unwrap();
        match client.call(&Request::GetVersion).await.unwrap() {
            Response::Version { patch, .. } => assert_eq!(patch, 0),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_param_values_survive_the_wire() {
        let values = vec![
            ("duty_cycle".to_string(), ParamValue::Float(0.5)),
            ("mode".to_string(), ParamValue::Int(-3)),
            ("armed".to_string(), ParamValue::Bool(true)),
        ];
        let request = Request::WriteParams {
            uid: "0123".into(),
            values: values.clone(),
        };
        let bytes = rmp_serde::to_vec_named(&request).unwrap();
        match rmp_serde::from_slice(&bytes).unwrap() {
            Request::WriteParams { values: got, .. } => assert_eq!(got, values),
            other => panic!("unexpected request {other:?}"),
        }
    }
}
