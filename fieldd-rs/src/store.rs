/* Replicated shared key/value store.
 *
 * Every worker opens one bus endpoint: a Unix socket in a shared
 * directory, named after the process. Joining is serialized by an
 * exclusive file lock so a starting worker dials every existing
 * endpoint before listening, which keeps the mesh strongly connected.
 *
 * Mutations are broadcast as `(command, key, [value])` frames encoded
 * with MessagePack under a u32 length prefix; reads are purely local.
 * Remote peers apply updates eventually; a vanished peer is dropped
 * and the store continues with the rest. */

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::RuntimeError;

const JOIN_LOCK: &str = "join.lock";
const ENDPOINT_PREFIX: &str = "store-";
const ENDPOINT_SUFFIX: &str = ".sock";

/* Distinguishes endpoints of one process; several stores share a
 * directory in the test harness. */
static ENDPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
enum StoreCommand {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

pub type WatchCallback = Box<dyn Fn(&str, Option<&[u8]>) + Send + Sync>;

struct StoreShared {
    data: Mutex<HashMap<String, Vec<u8>>>,
    /* Pre-encoded frames fan out to one writer task per peer. */
    peers: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    watchers: Mutex<HashMap<String, Vec<WatchCallback>>>,
}

impl StoreShared {
    /* Apply a broadcast update locally and fire matching watchers. */
    fn apply_remote(&self, command: StoreCommand) {
        match command {
            StoreCommand::Set { key, value } => {
                self.data.lock().unwrap().insert(key.clone(), value.clone());
                self.fire(&key, Some(&value));
            }
            StoreCommand::Delete { key } => {
                self.data.lock().unwrap().remove(&key);
                self.fire(&key, None);
            }
        }
    }

    fn fire(&self, key: &str, value: Option<&[u8]>) {
        let watchers = self.watchers.lock().unwrap();
        if let Some(callbacks) = watchers.get(key) {
            for callback in callbacks {
                callback(key, value);
            }
        }
    }

    fn broadcast(&self, command: &StoreCommand) {
        let frame = match encode_frame(command) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "cannot encode store frame");
                return;
            }
        };
        self.peers
            .lock()
            .unwrap()
            .retain(|peer| peer.send(frame.clone()).is_ok());
    }
}

pub struct SharedStore {
    endpoint: PathBuf,
    shared: Arc<StoreShared>,
}

impl SharedStore {
    /* Join the bus in `dir`: dial every live endpoint, drop stale
     * ones, then listen. The whole join runs under the directory's
     * exclusive lock. */
    pub async fn open(dir: &Path) -> Result<SharedStore, RuntimeError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| RuntimeError::StoreTransport(format!("creating {dir:?}: {e}")))?;
        let name = format!(
            "{ENDPOINT_PREFIX}{}-{}{ENDPOINT_SUFFIX}",
            std::process::id(),
            ENDPOINT_SEQ.fetch_add(1, Ordering::Relaxed),
        );
        let endpoint = dir.join(name);

        let join_dir = dir.to_path_buf();
        let join_endpoint = endpoint.clone();
        let (listener, dialed) = tokio::task::spawn_blocking(move || {
            join_bus(&join_dir, &join_endpoint)
        })
        .await
        .map_err(|e| RuntimeError::StoreTransport(e.to_string()))??;

        let shared = Arc::new(StoreShared {
            data: Mutex::new(HashMap::new()),
            peers: Mutex::new(Vec::new()),
            watchers: Mutex::new(HashMap::new()),
        });

        for stream in dialed {
            stream
                .set_nonblocking(true)
                .map_err(|e| RuntimeError::StoreTransport(e.to_string()))?;
            let stream = UnixStream::from_std(stream)
                .map_err(|e| RuntimeError::StoreTransport(e.to_string()))?;
            attach_peer(&shared, stream);
        }

        listener
            .set_nonblocking(true)
            .map_err(|e| RuntimeError::StoreTransport(e.to_string()))?;
        let listener = UnixListener::from_std(listener)
            .map_err(|e| RuntimeError::StoreTransport(e.to_string()))?;
        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => attach_peer(&accept_shared, stream),
                    Err(err) => {
                        warn!(%err, "store endpoint accept failed");
                        return;
                    }
                }
            }
        });

        Ok(SharedStore { endpoint, shared })
    }

    /* Local read. */
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.shared.data.lock().unwrap().get(key).cloned()
    }

    /* Set locally and broadcast. Local watchers do not fire for the
     * worker's own writes. */
    pub fn set(&self, key: &str, value: Vec<u8>) {
        self.shared
            .data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.clone());
        self.shared.broadcast(&StoreCommand::Set {
            key: key.to_string(),
            value,
        });
    }

    pub fn delete(&self, key: &str) {
        self.shared.data.lock().unwrap().remove(key);
        self.shared.broadcast(&StoreCommand::Delete {
            key: key.to_string(),
        });
    }

    /* Register a callback fired on local apply of a broadcast update
     * for `key`: `Some(bytes)` for a set, `None` for a delete. */
    pub fn watch(&self, key: &str, callback: WatchCallback) {
        self.shared
            .watchers
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(callback);
    }

    /* MessagePack-typed convenience accessors. */
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key)?;
        rmp_serde::from_slice(&bytes).ok()
    }

    pub fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<(), RuntimeError> {
        let bytes =
            rmp_serde::to_vec(value).map_err(|e| RuntimeError::StoreTransport(e.to_string()))?;
        self.set(key, bytes);
        Ok(())
    }
}

impl Drop for SharedStore {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.endpoint);
    }
}

/* The locked join section: everything here is synchronous on purpose,
 * so the lock is held for the shortest possible window. */
#[allow(clippy::type_complexity)]
fn join_bus(
    dir: &Path,
    endpoint: &Path,
) -> Result<(std::os::unix::net::UnixListener, Vec<std::os::unix::net::UnixStream>), RuntimeError>
{
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(JOIN_LOCK))
        .map_err(|e| RuntimeError::StoreTransport(format!("opening join lock: {e}")))?;
    let lock = Flock::lock(lock_file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| RuntimeError::StoreTransport(format!("join lock: {errno}")))?;

    let mut dialed = Vec::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| RuntimeError::StoreTransport(format!("reading {dir:?}: {e}")))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path == endpoint {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(ENDPOINT_PREFIX) || !name.ends_with(ENDPOINT_SUFFIX) {
            continue;
        }
        match std::os::unix::net::UnixStream::connect(&path) {
            Ok(stream) => dialed.push(stream),
            Err(err) => {
                /* A socket nobody answers on belongs to a dead peer. */
                debug!(peer = %path.display(), %err, "removing stale endpoint");
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    let _ = std::fs::remove_file(endpoint);
    let listener = std::os::unix::net::UnixListener::bind(endpoint)
        .map_err(|e| RuntimeError::StoreTransport(format!("binding {endpoint:?}: {e}")))?;
    drop(lock);
    Ok((listener, dialed))
}

/* Spawn the reader/writer task pair for one peer connection. */
fn attach_peer(shared: &Arc<StoreShared>, stream: UnixStream) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    shared.peers.lock().unwrap().push(frames_tx);

    tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                return;
            }
        }
    });

    let reader_shared = Arc::clone(shared);
    tokio::spawn(async move {
        loop {
            let mut prefix = [0u8; 4];
            if read_half.read_exact(&mut prefix).await.is_err() {
                debug!("store peer went away");
                return;
            }
            let len = u32::from_le_bytes(prefix) as usize;
            let mut body = vec![0u8; len];
            if read_half.read_exact(&mut body).await.is_err() {
                debug!("store peer went away mid-frame");
                return;
            }
            match rmp_serde::from_slice::<StoreCommand>(&body) {
                Ok(command) => reader_shared.apply_remote(command),
                Err(err) => {
                    let err = RuntimeError::StoreTransport(format!("bad bus frame: {err}"));
                    warn!(%err, "dropping store frame");
                }
            }
        }
    });
}

fn encode_frame(command: &StoreCommand) -> Result<Vec<u8>, RuntimeError> {
    let body =
        rmp_serde::to_vec(command).map_err(|e| RuntimeError::StoreTransport(e.to_string()))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn converged<F: Fn() -> bool>(check: F) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_three_peers_converge() {
        let dir = tempfile::tempdir().unwrap();
        let a = SharedStore::open(dir.path()).await.unwrap();
        let b = SharedStore::open(dir.path()).await.unwrap();
        let c = SharedStore::open(dir.path()).await.unwrap();

        a.set("alpha", b"1".to_vec());
        b.set("beta", b"2".to_vec());
        c.set("gamma", b"3".to_vec());

        let all_present = |store: &SharedStore| {
            store.get("alpha").is_some()
                && store.get("beta").is_some()
                && store.get("gamma").is_some()
        };
        assert!(
            converged(|| all_present(&a) && all_present(&b) && all_present(&c)).await,
            "peers did not converge"
        );
    }

    #[tokio::test]
    async fn test_set_then_delete_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let a = SharedStore::open(dir.path()).await.unwrap();
        let b = SharedStore::open(dir.path()).await.unwrap();

        a.set("mode", b"auto".to_vec());
        assert!(converged(|| b.get("mode").is_some()).await);

        a.delete("mode");
        assert!(converged(|| b.get("mode").is_none()).await);
    }

    #[tokio::test]
    async fn test_watch_fires_on_remote_apply() {
        let dir = tempfile::tempdir().unwrap();
        let a = SharedStore::open(dir.path()).await.unwrap();
        let b = SharedStore::open(dir.path()).await.unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        b.watch(
            "field",
            Box::new(move |_key, value| {
                let _ = seen_tx.send(value.map(|v| v.to_vec()));
            }),
        );

        a.set("field", b"blue".to_vec());
        let first = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.as_deref(), Some(&b"blue"[..]));

        a.delete("field");
        let second = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn test_local_set_does_not_fire_own_watch() {
        let dir = tempfile::tempdir().unwrap();
        let a = SharedStore::open(dir.path()).await.unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        a.watch(
            "k",
            Box::new(move |_, _| {
                let _ = seen_tx.send(());
            }),
        );
        a.set("k", b"v".to_vec());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_typed_accessors_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let a = SharedStore::open(dir.path()).await.unwrap();
        a.set_as("names", &vec!["left".to_string(), "right".to_string()])
            .unwrap();
        assert_eq!(
            a.get_as::<Vec<String>>("names").unwrap(),
            vec!["left".to_string(), "right".to_string()]
        );
    }

    #[tokio::test]
    async fn test_peer_loss_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let a = SharedStore::open(dir.path()).await.unwrap();
        {
            let b = SharedStore::open(dir.path()).await.unwrap();
            a.set("before", b"x".to_vec());
            assert!(converged(|| b.get("before").is_some()).await);
        }
        /* b is gone; further sets must not wedge a. */
        a.set("after", b"y".to_vec());
        let c = SharedStore::open(dir.path()).await.unwrap();
        a.set("late", b"z".to_vec());
        assert!(converged(|| c.get("late").is_some()).await);
    }
}
