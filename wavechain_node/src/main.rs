/// Wavechain node binary
///
/// Runs one node of the chain, or one end of the batch handshake, using the
/// shared topology file.
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use wavechain_core::batch::{read_batch_file, CsvRowSink};
use wavechain_core::communication::{send_to, AckGate, BatchConsumer, FeederConfig, MessageChannel};
use wavechain_core::hardware::{FileSensorPort, HardwareActuationPort, PairedPort, SimulatedPort};
use wavechain_core::message::{Envelope, SensorVector, TimeEncoding, Timestamp};
use wavechain_core::{bind_node, ChainTopology, NodeContext};

/// Vector sent by `send-test`
const TEST_PACKAGE: [f64; 30] = [
    123.0, 126.0, 100.0, 108.0, 124.0, 125.0, 77.0, 61.0, 127.0, 126.0, 120.0, 109.0, 125.0, 125.0,
    20.0, 20.0, 110.0, 110.0, 20.0, 20.0, 108.0, 108.0, 25.0, 28.0, 20.0, 107.0, 106.0, 23.0, 29.0,
    20.0,
];
const TEST_SIN: f64 = 0.8313819709444351;
const TEST_COS: f64 = 0.5557013751904403;

#[derive(Parser, Debug)]
#[command(name = "wavechain")]
#[command(about = "Wavechain relay node", long_about = None)]
struct Args {
    /// Topology file (YAML or TOML); searched in the standard locations if omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a chain node until interrupted
    Run {
        /// Node name in the topology
        #[arg(short, long)]
        node: String,

        /// Actuation port behind the state machine
        #[arg(long, value_enum, default_value_t = PortKind::Sim)]
        port: PortKind,

        /// Serial device for the wavemaker or servo board
        #[arg(long, default_value = "/dev/ttyACM0")]
        device: String,

        #[arg(long, default_value_t = 115200)]
        baud: u32,

        /// Movement CSV replayed as the node's sensor input
        #[arg(long)]
        replay: Option<PathBuf>,

        /// Scale replayed values into the motor range
        #[arg(long)]
        scale: bool,
    },

    /// Relay a movement CSV to a consumer, one row per ready signal
    Feed {
        /// Movement CSV to send
        #[arg(short, long)]
        file: PathBuf,

        /// Topology entry whose port receives ready signals
        #[arg(long, default_value = "builder")]
        name: String,

        /// Topology entry of the consumer
        #[arg(long, default_value = "trainer")]
        consumer: String,

        /// Seconds to wait for each ready signal; 0 waits forever
        #[arg(long)]
        ready_timeout: Option<u64>,

        /// Scale raw row values into the motor range
        #[arg(long)]
        scale: bool,
    },

    /// Store rows from a feeder and signal readiness after each one
    Consume {
        #[arg(long, default_value = "trainer")]
        name: String,

        /// Topology entry of the feeder to signal
        #[arg(long, default_value = "builder")]
        feeder: String,

        /// Training CSV rows are appended to
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Send the canned test movement package to a node
    SendTest {
        #[arg(short, long)]
        to: String,
    },

    /// Query the state of one node, or of every node in the topology
    Status {
        #[arg(short, long)]
        to: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PortKind {
    /// Record drives in memory
    Sim,
    /// Wavemaker motor controller on a serial port
    Wavemaker,
    /// Servo cube board on a serial port
    Servo,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "wavechain=debug,wavechain_core=debug,info"
    } else {
        "wavechain=info,wavechain_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .init();

    let topology = match &args.config {
        Some(path) => ChainTopology::from_file(path),
        None => ChainTopology::find_and_load(),
    }
    .context("loading chain topology")?;

    for (node, dest) in topology.dangling_routes() {
        warn!("Node '{}' routes to unknown node '{}'", node, dest);
    }

    // One cooperative thread per node process
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match args.command {
            Command::Run {
                node,
                port,
                device,
                baud,
                replay,
                scale,
            } => {
                let actuator = open_port(port, &device, baud)?;
                match replay {
                    Some(path) => {
                        let sensor = FileSensorPort::open(&path, scale)?;
                        run_node(&topology, &node, PairedPort::new(sensor, actuator)).await
                    }
                    None => run_node(&topology, &node, actuator).await,
                }
            }
            Command::Feed {
                file,
                name,
                consumer,
                ready_timeout,
                scale,
            } => feed(&topology, &file, &name, &consumer, ready_timeout, scale).await,
            Command::Consume {
                name,
                feeder,
                output,
            } => consume(&topology, &name, &feeder, output).await,
            Command::SendTest { to } => send_test(&topology, &to).await,
            Command::Status { to } => status(&topology, to).await,
        }
    })
}

fn open_port(kind: PortKind, device: &str, baud: u32) -> anyhow::Result<Box<dyn HardwareActuationPort>> {
    match kind {
        PortKind::Sim => Ok(Box::new(SimulatedPort::new())),
        #[cfg(feature = "serial-hardware")]
        PortKind::Wavemaker => {
            use wavechain_core::hardware::{WavemakerConfig, WavemakerPort};
            Ok(Box::new(WavemakerPort::open_serial(device, baud, WavemakerConfig::default())?))
        }
        #[cfg(feature = "serial-hardware")]
        PortKind::Servo => {
            use wavechain_core::hardware::{ServoArrayConfig, ServoArrayPort};
            Ok(Box::new(ServoArrayPort::open_serial(device, baud, ServoArrayConfig::default())?))
        }
        #[cfg(not(feature = "serial-hardware"))]
        PortKind::Wavemaker | PortKind::Servo => {
            let _ = (device, baud);
            Err(anyhow!(
                "{:?} port needs a build with the 'serial-hardware' feature",
                kind
            ))
        }
    }
}

async fn run_node<P>(topology: &ChainTopology, name: &str, port: P) -> anyhow::Result<()>
where
    P: HardwareActuationPort,
{
    let ctx = NodeContext::from_topology(topology, name)?;
    let bind = format!("{}:{}", topology.settings.bind_address, ctx.identity.port);
    info!(
        "Node '{}' ({:?}) on {}, next hop {:?}",
        name, ctx.identity.role, bind, ctx.route
    );

    let (runner, server) = bind_node(ctx, port, &bind).await?;
    let machine = runner
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for interrupt: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Interrupt received, shutting down");
        })
        .await;
    server.shutdown();

    info!(
        "Node '{}' stopped after {} cycles ({} failed sends)",
        name,
        machine.cycles(),
        machine.failed_sends()
    );
    Ok(())
}

async fn feed(
    topology: &ChainTopology,
    file: &Path,
    name: &str,
    consumer: &str,
    ready_timeout: Option<u64>,
    scale: bool,
) -> anyhow::Result<()> {
    let rows = read_batch_file(file)?;
    let me = topology.identity(name)?;
    let consumer = topology.peer(consumer)?;

    let mut config = FeederConfig::from_settings(&topology.settings);
    config.scale = scale;
    if let Some(secs) = ready_timeout {
        config.ready_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }

    let bind = format!("{}:{}", topology.settings.bind_address, me.port);
    let mut gate = AckGate::bind(name, consumer, &bind, config).await?;
    let report = gate.run_batch(&rows).await?;
    info!("Completed processing file: {}/{} rows", report.sent, report.total);
    Ok(())
}

async fn consume(
    topology: &ChainTopology,
    name: &str,
    feeder: &str,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let me = topology.identity(name)?;
    let feeder = match topology.peer(feeder) {
        Ok(peer) => Some(peer),
        Err(e) => {
            warn!("{}; ready signals disabled", e);
            None
        }
    };

    let output = output.unwrap_or_else(|| {
        PathBuf::from(format!(
            "movement_vectors_{}.csv",
            chrono::Local::now().format("%Y%m%d")
        ))
    });
    let sink = CsvRowSink::open(&output)?;
    let consumer = BatchConsumer::new(name, sink, feeder, topology.settings.io_timeout());

    let bind = format!("{}:{}", topology.settings.bind_address, me.port);
    let server = MessageChannel::bind(name, &bind, consumer).await?.spawn()?;
    info!("Consumer '{}' writing to {}", name, output.display());

    tokio::signal::ctrl_c().await?;
    server.shutdown();
    info!("Consumer '{}' stopped", name);
    Ok(())
}

fn test_package() -> anyhow::Result<Envelope> {
    let vector = SensorVector::new(TEST_PACKAGE.to_vec())?;
    let time = TimeEncoding::new(TEST_SIN, TEST_COS)?;
    Ok(Envelope::movement(vector, time).with_timestamp(Timestamp::now()))
}

async fn send_test(topology: &ChainTopology, to: &str) -> anyhow::Result<()> {
    let peer = topology.peer(to)?;
    let envelope = test_package()?;
    info!("Sending test package to {}", peer);

    let response = send_to(&peer, &envelope, topology.settings.io_timeout()).await?;
    if !response.is_success() {
        return Err(anyhow!("{} refused test package: {}", peer, response.message));
    }
    info!("{} accepted: {}", peer, response.message);
    Ok(())
}

async fn status(topology: &ChainTopology, to: Option<String>) -> anyhow::Result<()> {
    let names: Vec<String> = match to {
        Some(name) => vec![name],
        None => topology.nodes.keys().cloned().collect(),
    };

    for name in names {
        let peer = topology.peer(&name)?;
        match send_to(&peer, &Envelope::status_request(), topology.settings.io_timeout()).await {
            Ok(response) => println!(
                "{:<12} {:<16} {}",
                name,
                response.state.as_deref().unwrap_or("-"),
                response.message
            ),
            Err(e) => println!("{:<12} {:<16} {}", name, "UNREACHABLE", e),
        }
    }
    Ok(())
}
