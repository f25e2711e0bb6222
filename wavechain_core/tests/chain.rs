//! End-to-end tests over real sockets: two relay nodes on localhost

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use wavechain_core::communication::channel::BUSY_MESSAGE;
use wavechain_core::config::{ChainSettings, NodeIdentity, NodeRole, PeerAddress};
use wavechain_core::core::Route;
use wavechain_core::hardware::SimulatedPortProbe;
use wavechain_core::{
    bind_node, send_admitted, send_to, Envelope, MachineState, NodeContext, NodeStateMachine, Response,
    SensorVector, SimulatedPort, TimeEncoding, WaveError,
};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningNode {
    peer: PeerAddress,
    probe: SimulatedPortProbe,
    stop: oneshot::Sender<()>,
    task: JoinHandle<NodeStateMachine<SimulatedPort>>,
}

impl RunningNode {
    async fn stop(self) -> NodeStateMachine<SimulatedPort> {
        let _ = self.stop.send(());
        self.task.await.unwrap()
    }
}

fn context(name: &str, route: Route) -> NodeContext {
    let identity = NodeIdentity {
        name: name.into(),
        address: "127.0.0.1".into(),
        port: 0,
        destination: match &route {
            Route::Peer(peer) => Some(peer.name.clone()),
            _ => None,
        },
        role: NodeRole::Relay,
    };
    let settings = ChainSettings {
        cooldown_secs: 0.0,
        io_timeout_ms: 2000,
        ..Default::default()
    };
    NodeContext::new(identity, route, &settings)
}

async fn start_node(name: &str, route: Route, port: SimulatedPort) -> RunningNode {
    let probe = port.probe();
    let (runner, server) = bind_node(context(name, route), port, "127.0.0.1:0")
        .await
        .unwrap();
    let peer = PeerAddress::new(name, "127.0.0.1", server.local_addr().port());

    let (stop, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let machine = runner
            .run(async move {
                let _ = stop_rx.await;
            })
            .await;
        drop(server);
        machine
    });

    RunningNode {
        peer,
        probe,
        stop,
        task,
    }
}

fn trigger(value: f64) -> Envelope {
    Envelope::movement(
        SensorVector::filled(value).unwrap(),
        TimeEncoding::new(0.0, 1.0).unwrap(),
    )
}

async fn send(peer: &PeerAddress, envelope: &Envelope) -> Response {
    send_admitted(peer, envelope, IO_TIMEOUT).await.unwrap()
}

async fn wait_for_drives(probe: &SimulatedPortProbe, count: usize) {
    for _ in 0..250 {
        if probe.drives().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {} drives, saw {}", count, probe.drives().len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_trigger_drives_and_forwards_to_next_node() {
    let sink = start_node("res02", Route::Terminal, SimulatedPort::new()).await;
    let head = start_node("res01", Route::Peer(sink.peer.clone()), SimulatedPort::new()).await;

    let response = send(&head.peer, &trigger(100.0)).await;
    assert!(response.is_success(), "{:?}", response);
    assert_eq!(response.node.as_deref(), Some("res01"));

    wait_for_drives(&sink.probe, 1).await;

    let forwarded = sink.probe.drives();
    assert!(forwarded[0].iter().all(|v| v == 100.0));
    let time = sink.probe.times()[0];
    assert_eq!((time.sin(), time.cos()), (0.0, 1.0));
    assert_eq!(head.probe.drives(), forwarded);

    let head = head.stop().await;
    assert_eq!(head.state(), MachineState::Idle);
    assert_eq!(
        head.history().path(),
        vec![
            MachineState::Idle,
            MachineState::DriveWavemaker,
            MachineState::SendData,
            MachineState::Idle,
        ]
    );
    assert_eq!(head.cycles(), 1);
    assert_eq!(head.failed_sends(), 0);

    let sink = sink.stop().await;
    assert_eq!(sink.cycles(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_trigger_during_cycle_is_queued_then_relayed() {
    let sink = start_node("res02", Route::Terminal, SimulatedPort::new()).await;
    let slow = SimulatedPort::new().with_drive_delay(Duration::from_millis(500));
    let head = start_node("res01", Route::Peer(sink.peer.clone()), slow).await;

    let first = send(&head.peer, &trigger(60.0)).await;
    assert_eq!(first.message, "accepted");

    let second = send(&head.peer, &trigger(90.0)).await;
    assert!(second.is_success());
    assert_eq!(second.message, "queued");
    assert_ne!(second.state.as_deref(), Some("IDLE"));

    wait_for_drives(&sink.probe, 2).await;
    let values: Vec<f64> = sink.probe.drives().iter().map(|v| v.values()[0]).collect();
    assert_eq!(values, vec![60.0, 90.0]);

    let head = head.stop().await;
    assert_eq!(head.cycles(), 2);
    assert_eq!(head.buffered(), 0);
    sink.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_connection_is_turned_away() {
    let node = start_node("res02", Route::Terminal, SimulatedPort::new()).await;

    let held = TcpStream::connect(node.peer.socket_addr()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = send_to(&node.peer, &Envelope::status_request(), IO_TIMEOUT)
        .await
        .unwrap();
    assert!(!response.is_success());
    assert_eq!(response.message, BUSY_MESSAGE);

    drop(held);
    let status = send(&node.peer, &Envelope::status_request()).await;
    assert!(status.is_success());
    assert_eq!(status.state.as_deref(), Some("IDLE"));

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_next_hop_returns_node_to_idle() {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = PeerAddress::new("res02", "127.0.0.1", probe.local_addr().unwrap().port());
    drop(probe);

    let head = start_node("res01", Route::Peer(dead), SimulatedPort::new()).await;
    let response = send(&head.peer, &trigger(50.0)).await;
    assert!(response.is_success());

    // The status request is only served once the node is waiting again
    let mut state = None;
    for _ in 0..100 {
        let status = send(&head.peer, &Envelope::status_request()).await;
        if status.message.contains("failed_sends=1") {
            state = status.state;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.as_deref(), Some("IDLE"));

    let head = head.stop().await;
    assert_eq!(head.failed_sends(), 1);
    assert_eq!(head.state(), MachineState::Idle);
}

#[tokio::test]
async fn test_send_to_missing_listener_is_connectivity_error() {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer = PeerAddress::new("gone", "127.0.0.1", probe.local_addr().unwrap().port());
    drop(probe);

    let err = send_to(&peer, &Envelope::ack(), IO_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, WaveError::Connectivity { .. }));
}
