/* Executor worker: the student-code lifecycle envelope.
 *
 * The content of the student program is not the runtime's business;
 * this worker owns only the envelope around it: mode transitions
 * observed from the shared store (an estop or idle stops every
 * actuator), and the coding-challenge invocation with its
 * per-function timeout. */

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Options;
use crate::rpc::{self, DependentClient, Request, Response, RpcService};
use crate::store::SharedStore;
use crate::worker::{endpoint_path, EXECUTOR_WORKER, KEY_CHALLENGE_SOLUTION, KEY_MODE, SENSOR_WORKER};

pub const CHALLENGE_FN_TIMEOUT: Duration = Duration::from_secs(1);

/* A challenge step: previous solution in, next solution out. The
 * actual functions come from the student module; the default build
 * carries an empty chain and the envelope passes the seed through. */
pub type ChallengeFn = fn(i64) -> i64;

static CHALLENGES: &[ChallengeFn] = &[];

pub async fn run(options: Options) -> anyhow::Result<()> {
    let store = Arc::new(
        SharedStore::open(&options.store_dir())
            .await
            .context("joining the shared store")?,
    );

    let state = Arc::new(ExecutorState {
        store: Arc::clone(&store),
        solution: Mutex::new(None),
        devices: Mutex::new(HashSet::new()),
    });

    let listener = rpc::bind_endpoint(&endpoint_path(&options.runtime_dir, EXECUTOR_WORKER))
        .context("binding the executor endpoint")?;
    tokio::spawn(rpc::serve_unix(
        listener,
        Arc::new(ExecutorService {
            state: Arc::clone(&state),
        }) as Arc<dyn RpcService>,
    ));

    /* Mode transitions arrive as store updates from the network
     * worker. */
    let (mode_tx, mut mode_rx) = mpsc::unbounded_channel::<Option<String>>();
    store.watch(
        KEY_MODE,
        Box::new(move |_key, value| {
            let mode = value.and_then(|bytes| rmp_serde::from_slice::<String>(bytes).ok());
            let _ = mode_tx.send(mode);
        }),
    );
    let runtime_dir = options.runtime_dir.clone();
    tokio::spawn(async move {
        let mut sensor = DependentClient::new(endpoint_path(&runtime_dir, SENSOR_WORKER));
        let mut current = "idle".to_string();
        while let Some(mode) = mode_rx.recv().await {
            let mode = mode.unwrap_or_else(|| "idle".to_string());
            if mode == current {
                continue;
            }
            info!(from = %current, to = %mode, "mode transition");
            if mode == "estop" || mode == "idle" {
                /* Safety first: every actuator stops. */
                sensor.notify(&Request::DisableAll).await;
            }
            current = mode;
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing the SIGTERM handler")?;
    sigterm.recv().await;
    info!("executor worker shutting down");
    Ok(())
}

struct ExecutorState {
    store: Arc<SharedStore>,
    solution: Mutex<Option<i64>>,
    /* Devices the student program may address, per notifications. */
    devices: Mutex<HashSet<String>>,
}

struct ExecutorService {
    state: Arc<ExecutorState>,
}

#[async_trait]
impl RpcService for ExecutorService {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::RunChallenge { seed, timeout } => {
                /* A notification: the caller does not wait for the
                 * chain to finish. */
                let per_fn = if timeout > 0.0 {
                    Duration::from_secs_f64(timeout)
                } else {
                    CHALLENGE_FN_TIMEOUT
                };
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    *state.solution.lock().unwrap() = None;
                    match run_chain(seed, per_fn, CHALLENGES).await {
                        Ok(solution) => {
                            *state.solution.lock().unwrap() = Some(solution);
                            let _ = state.store.set_as(KEY_CHALLENGE_SOLUTION, &solution);
                        }
                        Err(err) => error!(%err, "challenge run failed"),
                    }
                });
                Response::Ok
            }
            Request::GetChallengeSolution => Response::ChallengeSolution {
                solution: *self.state.solution.lock().unwrap(),
            },
            Request::RegisterDevice { descriptor } => {
                self.state.devices.lock().unwrap().insert(descriptor.uid);
                Response::Ok
            }
            Request::UnregisterDevice { uid } => {
                self.state.devices.lock().unwrap().remove(&uid);
                Response::Ok
            }
            other => Response::error(format!("method not served here: {other:?}")),
        }
    }
}

/* Run the challenge chain, each function on the blocking pool under
 * its own deadline. The chain folds the seed through every step. */
pub async fn run_chain(
    seed: i64,
    per_fn_timeout: Duration,
    chain: &[ChallengeFn],
) -> Result<i64, String> {
    let mut solution = seed;
    for (index, step) in chain.iter().enumerate() {
        let step = *step;
        let input = solution;
        let handle = tokio::task::spawn_blocking(move || step(input));
        match tokio::time::timeout(per_fn_timeout, handle).await {
            Ok(Ok(next)) => solution = next,
            Ok(Err(join_err)) => {
                return Err(format!("challenge function {index} panicked: {join_err}"));
            }
            Err(_) => {
                warn!(index, "challenge function took too long to answer");
                return Err(format!("challenge function {index} timed out"));
            }
        }
    }
    Ok(solution)
}
