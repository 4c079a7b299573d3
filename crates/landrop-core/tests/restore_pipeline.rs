//! End-to-end tests for receiving a backup and restoring it.
//!
//! These tests run a real sender and receiver over loopback.

mod common;

use std::sync::Arc;

use landrop_core::connection::{Candidate, ConnectionInfo};
use landrop_core::error::TransferError;
use landrop_core::orchestrator::RestoreOrchestrator;
use landrop_core::protocol::ControlMessage;
use landrop_core::restore::{
    landrop_restore_steps, FsBackupStore, OverallStatus, RestoreStepRunner, StepId, StepStatus,
};
use landrop_core::sender::{LandropSender, SenderConfig};
use landrop_core::transfer::{FailureReason, TransferStatus};

use common::{Action, CountingNavigator, RecordingNotifier};

/// Candidates `[h1, h2]` with h1 unreachable: the archive arrives in three
/// chunks from h2 and every restore step succeeds.
#[tokio::test]
async fn test_receive_and_restore_from_second_candidate() {
    let dir = common::create_temp_dir();
    let archive = common::create_valid_backup(dir.path());
    let archive_len = std::fs::metadata(&archive).unwrap().len() as usize;

    let config = SenderConfig {
        chunk_size: archive_len.div_ceil(3),
        ..SenderConfig::default()
    };
    let sender = LandropSender::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .unwrap();
    let sender_port = sender.local_addr().unwrap().port();
    let served = archive.clone();
    let serve = tokio::spawn(async move { sender.serve_file(&served).await });

    let storage = dir.path().join("incoming");
    let store = FsBackupStore::new(dir.path().join("data"));
    let runner = RestoreStepRunner::new().configure(landrop_restore_steps(Arc::new(store.clone())));
    let notifier = Arc::new(RecordingNotifier::default());
    let navigator = Arc::new(CountingNavigator::default());
    let orchestrator =
        RestoreOrchestrator::new(runner.clone(), notifier.clone(), navigator.clone(), true);

    let mut client = common::test_client(&storage);
    let subscription = client.subscribe();

    let info = ConnectionInfo::new(vec![
        Candidate::new("127.0.0.1", common::unreachable_port().await),
        Candidate::new("127.0.0.1", sender_port),
    ])
    .unwrap();

    let ((), report) = tokio::join!(client.connect(info), orchestrator.run(subscription));

    let sent = serve.await.unwrap().unwrap();
    assert_eq!(sent.chunks, 3);
    assert_eq!(sent.bytes, archive_len as u64);

    assert!(matches!(
        report.last_status,
        TransferStatus::FileComplete { ref filename, .. } if filename == "backup.zip"
    ));
    assert_eq!(report.overall, Some(OverallStatus::Success));
    assert!(report.redirected);
    assert_eq!(navigator.redirects(), 1);
    assert!(notifier.events().is_empty());
    assert!(!runner.is_modal_open());

    assert_eq!(
        std::fs::read(storage.join("backup.zip")).unwrap(),
        std::fs::read(&archive).unwrap()
    );
    assert!(store.restored_dir().join("Files/notes.md").exists());
    assert!(report
        .snapshot
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Completed));
}

/// The connection drops mid-file: the receive step fails and nothing else runs.
#[tokio::test]
async fn test_connection_drop_mid_file_fails_receive_step() {
    let dir = common::create_temp_dir();
    let storage = dir.path().join("incoming");

    let (port, sender) = common::spawn_scripted_sender(vec![
        Action::Control(ControlMessage::ZipFileStart {
            filename: "backup.zip".to_string(),
            total_size: 1024,
        }),
        Action::Chunk(vec![0u8; 256]),
        Action::Drop,
    ])
    .await;

    let store = Arc::new(FsBackupStore::new(dir.path().join("data")));
    let runner = RestoreStepRunner::new().configure(landrop_restore_steps(store));
    let notifier = Arc::new(RecordingNotifier::default());
    let navigator = Arc::new(CountingNavigator::default());
    let orchestrator =
        RestoreOrchestrator::new(runner.clone(), notifier.clone(), navigator.clone(), true);

    let mut client = common::test_client(&storage);
    let subscription = client.subscribe();
    let info = ConnectionInfo::from_payload(&format!("127.0.0.1:{port}"), 7017).unwrap();
    assert!(info.is_legacy());

    let ((), report) = tokio::join!(client.connect(info), orchestrator.run(subscription));
    sender.await.unwrap();

    assert_eq!(
        report.last_status,
        TransferStatus::Error {
            reason: FailureReason::Transfer(TransferError::ConnectionLost(
                "backup.zip".to_string()
            )),
        }
    );
    assert_eq!(report.overall, None);

    let snapshot = runner.snapshot();
    assert_eq!(snapshot.overall, OverallStatus::Error);
    assert_eq!(
        snapshot.step(StepId::ReceiveFile).unwrap().status,
        StepStatus::Error
    );
    for id in [StepId::Extract, StepId::Validate, StepId::Import] {
        assert_eq!(snapshot.step(id).unwrap().status, StepStatus::Pending);
    }

    assert_eq!(notifier.events().len(), 1);
    assert_eq!(navigator.redirects(), 0);
    assert!(!storage.join("backup.zip").exists());
}

/// A short file is reported as a size mismatch, not a completed transfer.
#[tokio::test]
async fn test_size_mismatch_is_an_error() {
    let dir = common::create_temp_dir();
    let (port, _sender) = common::spawn_scripted_sender(vec![
        Action::Control(ControlMessage::ZipFileStart {
            filename: "backup.zip".to_string(),
            total_size: 10,
        }),
        Action::Chunk(vec![1u8; 4]),
        Action::Control(ControlMessage::ZipFileEnd),
        Action::Idle,
    ])
    .await;

    let mut client = common::test_client(dir.path());
    let mut sub = client.subscribe();
    client
        .connect(ConnectionInfo::new(vec![Candidate::new("127.0.0.1", port)]).unwrap())
        .await;

    assert_eq!(common::next_status(&mut sub).await, TransferStatus::Connecting);
    assert_eq!(common::next_status(&mut sub).await, TransferStatus::Connected);
    assert_eq!(
        common::next_status(&mut sub).await.filename(),
        Some("backup.zip")
    );
    assert!(matches!(
        common::next_status(&mut sub).await,
        TransferStatus::Error {
            reason: FailureReason::Transfer(TransferError::SizeMismatch {
                expected: 10,
                received: 4,
                ..
            })
        }
    ));
    assert!(!dir.path().join("backup.zip").exists());
}

/// A graceful close after the file arrived ends the session quietly.
#[tokio::test]
async fn test_close_after_complete_disconnects() {
    let dir = common::create_temp_dir();
    let (port, _sender) = common::spawn_scripted_sender(vec![
        Action::Control(ControlMessage::ZipFileStart {
            filename: "../escape.zip".to_string(),
            total_size: 3,
        }),
        Action::Chunk(vec![1, 2, 3]),
        Action::Control(ControlMessage::ZipFileEnd),
        Action::Close,
    ])
    .await;

    let mut client = common::test_client(dir.path());
    let mut sub = client.subscribe();
    client
        .connect(ConnectionInfo::new(vec![Candidate::new("127.0.0.1", port)]).unwrap())
        .await;

    let labels: Vec<&str> = {
        let mut labels = Vec::new();
        for _ in 0..5 {
            labels.push(common::next_status(&mut sub).await.label());
        }
        labels
    };
    assert_eq!(
        labels,
        vec![
            "connecting",
            "connected",
            "receiving_file",
            "file_complete",
            "disconnected"
        ]
    );
    assert_eq!(std::fs::read(dir.path().join("escape.zip")).unwrap(), vec![1, 2, 3]);
}

/// `disconnect()` is idempotent once a session is up.
#[tokio::test]
async fn test_disconnect_is_idempotent_on_live_session() {
    let dir = common::create_temp_dir();
    let (port, sender) = common::spawn_scripted_sender(vec![Action::Idle]).await;

    let mut client = common::test_client(dir.path());
    let mut sub = client.subscribe();
    client
        .connect(ConnectionInfo::new(vec![Candidate::new("127.0.0.1", port)]).unwrap())
        .await;
    assert_eq!(client.status(), TransferStatus::Connected);

    for _ in 0..3 {
        client.disconnect();
        assert_eq!(client.status(), TransferStatus::Disconnected);
        assert_eq!(client.filename(), None);
    }

    assert_eq!(common::next_status(&mut sub).await, TransferStatus::Connecting);
    assert_eq!(common::next_status(&mut sub).await, TransferStatus::Connected);
    assert_eq!(common::next_status(&mut sub).await, TransferStatus::Disconnected);
    assert!(sub.try_recv().is_none());
    sender.abort();
}

/// A sender that stops answering is detected by the heartbeat.
#[tokio::test]
async fn test_silent_sender_times_out() {
    let dir = common::create_temp_dir();
    let (port, sender) = common::spawn_scripted_sender(vec![Action::Idle]).await;

    let mut client = common::test_client(dir.path());
    let mut sub = client.subscribe();
    client
        .connect(ConnectionInfo::new(vec![Candidate::new("127.0.0.1", port)]).unwrap())
        .await;

    assert_eq!(common::next_status(&mut sub).await, TransferStatus::Connecting);
    assert_eq!(common::next_status(&mut sub).await, TransferStatus::Connected);
    assert_eq!(common::next_status(&mut sub).await, TransferStatus::Disconnected);
    sender.abort();
}

/// Dropping the client tears the session down.
#[tokio::test]
async fn test_drop_releases_session() {
    let dir = common::create_temp_dir();
    let (port, sender) = common::spawn_scripted_sender(vec![Action::Idle]).await;

    let mut client = common::test_client(dir.path());
    let mut sub = client.subscribe();
    client
        .connect(ConnectionInfo::new(vec![Candidate::new("127.0.0.1", port)]).unwrap())
        .await;
    drop(client);

    assert_eq!(common::next_status(&mut sub).await, TransferStatus::Connecting);
    assert_eq!(common::next_status(&mut sub).await, TransferStatus::Connected);
    assert_eq!(common::next_status(&mut sub).await, TransferStatus::Disconnected);
    assert_eq!(sub.recv().await, None);
    sender.abort();
}
