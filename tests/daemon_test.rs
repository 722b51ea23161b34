//! Daemon and initiator over loopback TCP.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::{pair, Node, KEY};
use snapvault::auth::{RemoteAccess, SharedKey};
use snapvault::server::Daemon;
use snapvault::snapshot::{SnapshotStore, Volume};
use snapvault::streaming::{SessionOutcome, ShutdownSignal, TransferIntent};
use snapvault::sync::{run_cycle, BackupJob, Endpoint, Initiator};
use snapvault::transport;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const GRACE: Duration = Duration::from_secs(2);

type DaemonHandle = JoinHandle<anyhow::Result<()>>;

async fn start_daemon(node: &Node) -> (SocketAddr, watch::Sender<bool>, DaemonHandle) {
    let (trigger, shutdown) = ShutdownSignal::new();
    let listener = transport::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let daemon = Daemon::new(node.context(shutdown), listener, GRACE);
    let addr = daemon.local_addr().unwrap();
    (addr, trigger, tokio::spawn(daemon.run()))
}

async fn stop(trigger: watch::Sender<bool>, handle: DaemonHandle) {
    trigger.send(true).unwrap();
    tokio::time::timeout(GRACE * 2, handle)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_push_to_daemon() {
    let (alpha, backup01) = pair();
    let a = alpha.capture("home", "20240101000000", b"capture A").await;
    let (addr, trigger, handle) = start_daemon(&backup01).await;

    let initiator = Initiator::new(alpha.context(ShutdownSignal::never()), Duration::from_secs(5));
    let endpoint = Endpoint::new("backup01", addr.to_string());

    let outcome = initiator.push(&endpoint, "home", false).await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Completed { bytes: 9, .. }));
    assert!(matches!(
        initiator.push(&endpoint, "home", false).await.unwrap(),
        SessionOutcome::UpToDate { .. }
    ));

    assert_eq!(alpha.lineage.record("home", "backup01"), Some(a.clone()));
    stop(trigger, handle).await;
    assert!(backup01.store.has_backup(&a).await.unwrap());
}

#[tokio::test]
async fn test_cycle_against_daemon() {
    let alpha = Node::new("alpha").knows(
        "backup01",
        SharedKey::from_bytes(KEY),
        RemoteAccess::default(),
    );
    let backup01 = Node::new("backup01").knows(
        "alpha",
        SharedKey::from_bytes(KEY),
        RemoteAccess::default().accept_push("home").allow_pull("srv"),
    );
    let home = alpha.capture("home", "20240101000000", b"alpha home").await;
    let srv = backup01.capture("srv", "20240101000000", b"backup01 srv").await;
    let (addr, trigger, handle) = start_daemon(&backup01).await;

    // A remote nobody listens on.
    let unreachable = {
        let listener = transport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        listener.local_addr().unwrap()
    };

    let remote = Endpoint::new("backup01", addr.to_string());
    let jobs = vec![
        BackupJob {
            remote: remote.clone(),
            intent: TransferIntent::Push {
                subvolume: "home".into(),
                force_full: false,
            },
        },
        BackupJob {
            remote,
            intent: TransferIntent::Pull {
                volume: Volume::new("backup01", "srv"),
                force_full: false,
            },
        },
        BackupJob {
            remote: Endpoint::new("ghost", unreachable.to_string()),
            intent: TransferIntent::Push {
                subvolume: "home".into(),
                force_full: false,
            },
        },
    ];

    let initiator = Initiator::new(alpha.context(ShutdownSignal::never()), Duration::from_secs(2));
    let report = run_cycle(&initiator, jobs).await;
    assert_eq!(report.completed(), 2);
    assert_eq!(report.failed(), 1);
    assert!(!report.is_success());
    assert_eq!(report.bytes(), 10 + 12);
    let failed = report.jobs.iter().find(|j| j.result.is_err()).unwrap();
    assert_eq!(failed.job.remote.name, "ghost");
    assert!(failed.result.as_ref().unwrap_err().is_retryable());

    stop(trigger, handle).await;

    // Each source tracks the lineage of what it sent.
    assert_eq!(alpha.lineage.record("home", "backup01"), Some(home.clone()));
    assert_eq!(backup01.lineage.record("srv", "alpha"), Some(srv.clone()));
    assert!(backup01.store.has_backup(&home).await.unwrap());
    assert!(alpha.store.has_backup(&srv).await.unwrap());
}

#[tokio::test]
async fn test_daemon_stops_with_idle_connection() {
    let (_alpha, backup01) = pair();
    let (addr, trigger, handle) = start_daemon(&backup01).await;

    // Connected but silent: the session sits in the handshake.
    let _idle = tokio::net::TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    stop(trigger, handle).await;
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_initiator_refuses_after_shutdown() {
    let (alpha, _backup01) = pair();
    alpha.capture("home", "20240101000000", b"capture A").await;
    let (trigger, shutdown) = ShutdownSignal::new();
    trigger.send(true).unwrap();

    let initiator = Initiator::new(alpha.context(shutdown), Duration::from_secs(1));
    let endpoint = Endpoint::new("backup01", "127.0.0.1:1");
    let err = initiator.push(&endpoint, "home", false).await.unwrap_err();
    assert!(matches!(
        err,
        snapvault::Error::Transfer(snapvault::error::TransferError::Cancelled)
    ));
}
