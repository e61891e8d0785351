/* fieldctl CLI: clap-driven client that talks to fieldd over its
 * MessagePack RPC socket to inspect field state, manage sensor names,
 * drive device subscriptions and writes, and run coding challenges. */
mod rpc_client;

use anyhow::Result;
use clap::{Parser, Subcommand};

use rpc_client::{parse_param_value, FieldClient, Request, Response};

/// fieldctl — drive the fieldd runtime daemon.
#[derive(Parser)]
#[command(name = "fieldctl", version, about)]
struct Cli {
    /// Daemon host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Daemon RPC port.
    #[arg(long, default_value_t = 1234)]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the daemon version.
    Version,

    /// Show the daemon clock.
    Time,

    /// Field-control state.
    #[command(subcommand)]
    Field(FieldCmd),

    /// Human-friendly sensor names.
    #[command(subcommand)]
    Name(NameCmd),

    /// Attached smart sensors.
    #[command(subcommand)]
    Device(DeviceCmd),

    /// Coding challenge.
    #[command(subcommand)]
    Challenge(ChallengeCmd),
}

#[derive(Subcommand)]
enum FieldCmd {
    /// Show alliance, starting zone and mode.
    Get,
    /// Set the alliance (blue, gold, unknown).
    Alliance { alliance: String },
    /// Set the starting zone.
    Zone { zone: String },
    /// Set the robot mode (idle, auto, teleop, estop).
    Mode { mode: String },
}

#[derive(Subcommand)]
enum NameCmd {
    /// List configured sensor names.
    List,
    /// Name a sensor by hex UID.
    Set { uid: String, name: String },
    /// Forget a sensor name.
    Del { uid: String },
}

#[derive(Subcommand)]
enum DeviceCmd {
    /// List attached sensors and their readable parameters.
    List,
    /// Subscribe to a sensor's parameters at a period in ms.
    Subscribe {
        uid: String,
        delay: u16,
        /// Parameter names; empty silences the device.
        params: Vec<String>,
    },
    /// Write parameters, e.g. `duty_cycle=0.5 pid_enabled=true`.
    Write {
        uid: String,
        /// name=value pairs.
        values: Vec<String>,
    },
    /// Read parameters by name.
    Read { uid: String, params: Vec<String> },
    /// Ping every attached sensor.
    Enumerate,
    /// Disable every attached sensor.
    DisableAll,
}

#[derive(Subcommand)]
enum ChallengeCmd {
    /// Start a challenge run from a seed.
    Run {
        seed: i64,
        /// Per-function timeout in seconds (0 = default).
        #[arg(long, default_value_t = 0.0)]
        timeout: f64,
    },
    /// Fetch the last challenge solution.
    Solution,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut client = FieldClient::connect(&cli.host, cli.port).await?;

    match cli.command {
        Commands::Version => match client.call(Request::GetVersion).await? {
            Response::Version {
                major,
                minor,
                patch,
            } => println!("{major}.{minor}.{patch}"),
            other => print_unexpected(other),
        },
        Commands::Time => match client.call(Request::GetTime).await? {
            Response::Time { seconds } => println!("{seconds:.3}"),
            other => print_unexpected(other),
        },
        Commands::Field(cmd) => run_field(&mut client, cmd).await?,
        Commands::Name(cmd) => run_name(&mut client, cmd).await?,
        Commands::Device(cmd) => run_device(&mut client, cmd).await?,
        Commands::Challenge(cmd) => run_challenge(&mut client, cmd).await?,
    }
    Ok(())
}

async fn run_field(client: &mut FieldClient, cmd: FieldCmd) -> Result<()> {
    let request = match cmd {
        FieldCmd::Get => {
            match client.call(Request::GetFieldParameters).await? {
                Response::FieldParameters {
                    alliance,
                    starting_zone,
                    mode,
                } => {
                    println!("alliance:      {alliance}");
                    println!("starting zone: {starting_zone}");
                    println!("mode:          {mode}");
                }
                other => print_unexpected(other),
            }
            return Ok(());
        }
        FieldCmd::Alliance { alliance } => Request::SetAlliance { alliance },
        FieldCmd::Zone { zone } => Request::SetStartingZone { zone },
        FieldCmd::Mode { mode } => Request::SetMode { mode },
    };
    client.call(request).await?;
    Ok(())
}

async fn run_name(client: &mut FieldClient, cmd: NameCmd) -> Result<()> {
    match cmd {
        NameCmd::List => match client.call(Request::GetDeviceNames).await? {
            Response::DeviceNames { names } => {
                let mut entries: Vec<_> = names.into_iter().collect();
                entries.sort();
                for (uid, name) in entries {
                    println!("{uid}  {name}");
                }
            }
            other => print_unexpected(other),
        },
        NameCmd::Set { uid, name } => {
            client.call(Request::SetDeviceName { name, uid }).await?;
        }
        NameCmd::Del { uid } => {
            client.call(Request::DelDeviceName { uid }).await?;
        }
    }
    Ok(())
}

async fn run_device(client: &mut FieldClient, cmd: DeviceCmd) -> Result<()> {
    match cmd {
        DeviceCmd::List => match client.call(Request::ListDevices).await? {
            Response::Devices { devices } => {
                for device in devices {
                    println!(
                        "{}  {}  (subscribed every {} ms)",
                        device.uid, device.type_name, device.delay_ms
                    );
                    for (name, value, ts) in device.params {
                        println!("    {name} = {value}  (t={ts:.3})");
                    }
                }
            }
            other => print_unexpected(other),
        },
        DeviceCmd::Subscribe { uid, delay, params } => {
            client
                .call(Request::SubscribeDevice { uid, params, delay })
                .await?;
        }
        DeviceCmd::Write { uid, values } => {
            let values = values
                .iter()
                .map(|pair| {
                    let (name, value) = pair
                        .split_once('=')
                        .ok_or_else(|| anyhow::anyhow!("expected name=value, got \"{pair}\""))?;
                    Ok((name.to_string(), parse_param_value(value)?))
                })
                .collect::<Result<Vec<_>>>()?;
            client.call(Request::WriteParams { uid, values }).await?;
        }
        DeviceCmd::Read { uid, params } => {
            match client.call(Request::ReadParams { uid, params }).await? {
                Response::Values { values } => {
                    for (name, value, ts) in values {
                        println!("{name} = {value}  (t={ts:.3})");
                    }
                }
                other => print_unexpected(other),
            }
        }
        DeviceCmd::Enumerate => {
            client.call(Request::Enumerate).await?;
        }
        DeviceCmd::DisableAll => {
            client.call(Request::DisableAll).await?;
        }
    }
    Ok(())
}

async fn run_challenge(client: &mut FieldClient, cmd: ChallengeCmd) -> Result<()> {
    match cmd {
        ChallengeCmd::Run { seed, timeout } => {
            client.call(Request::RunChallenge { seed, timeout }).await?;
        }
        ChallengeCmd::Solution => match client.call(Request::GetChallengeSolution).await? {
            Response::ChallengeSolution { solution: Some(s) } => println!("{s}"),
            Response::ChallengeSolution { solution: None } => println!("(no solution yet)"),
            other => print_unexpected(other),
        },
    }
    Ok(())
}

fn print_unexpected(response: Response) {
    eprintln!("unexpected response: {response:?}");
}
