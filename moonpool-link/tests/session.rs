//! Session-bound receivers: session binding, lock renewal and lock loss.

mod common;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use moonpool_link::{
    ErrorKind, LinkError, LinkFactory, LinkState, ManagementRequest, ManagementResponse,
    ReceiverConfig, ReceiverLinkManager, RemoteAttach, SessionRequest,
};

use common::{ENTITY, Harness, WireAction, message, settle, tag};

fn receiver(harness: &Harness, config: ReceiverConfig) -> ReceiverLinkManager {
    ReceiverLinkManager::create(
        config,
        harness.factory.clone() as Arc<dyn LinkFactory>,
        harness.renewer.clone(),
        harness.retry.clone(),
        &harness.scheduler,
        harness.management.clone(),
    )
    .expect("create receiver")
}

fn at(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

/// A receiver bound to the next available session, attached as "s-7".
async fn session_receiver(harness: &Harness) -> ReceiverLinkManager {
    harness.factory.set_remote(RemoteAttach {
        max_message_size: None,
        session_id: Some("s-7".to_string()),
        session_locked_until: Some(at(1_000)),
    });
    let receiver = receiver(
        harness,
        ReceiverConfig::new(ENTITY).with_session(SessionRequest::NextAvailable),
    );
    let _ = receiver.receive(1, Duration::ZERO).await;
    settle().await;
    receiver
}

#[tokio::test(start_paused = true)]
async fn test_attach_records_session() {
    let harness = Harness::new();
    let receiver = session_receiver(&harness).await;

    let status = receiver.status();
    assert_eq!(status.state, LinkState::Active);
    assert_eq!(status.session_id.as_deref(), Some("s-7"));
    assert_eq!(status.session_locked_until, Some(at(1_000)));
    assert_eq!(receiver.session_id().as_deref(), Some("s-7"));

    let attach = harness.wire().actions().into_iter().find_map(|a| match a {
        WireAction::AttachReceiver(attach) => Some(attach),
        _ => None,
    });
    let attach = attach.expect("receiver attached");
    assert_eq!(attach.session, Some(SessionRequest::NextAvailable));
    assert!(!attach.browsable_session);
}

#[tokio::test(start_paused = true)]
async fn test_browsable_session_has_no_lock() {
    let harness = Harness::new();
    harness.factory.set_remote(RemoteAttach {
        max_message_size: None,
        session_id: Some("s-1".to_string()),
        session_locked_until: Some(at(1_000)),
    });
    let receiver = receiver(
        &harness,
        ReceiverConfig::new(ENTITY)
            .with_session(SessionRequest::Named("s-1".to_string()))
            .browsable(),
    );
    let _ = receiver.receive(1, Duration::ZERO).await;
    settle().await;

    let status = receiver.status();
    assert_eq!(status.session_id.as_deref(), Some("s-1"));
    assert_eq!(status.session_locked_until, None);
}

#[tokio::test(start_paused = true)]
async fn test_renew_session_lock_updates_expiry() {
    let harness = Harness::new();
    let receiver = session_receiver(&harness).await;

    harness
        .factory
        .respond(Ok(ManagementResponse::SessionLockedUntil(at(2_000))));
    let locked_until = receiver.renew_session_lock().await.expect("renewed");
    assert_eq!(locked_until, at(2_000));
    settle().await;
    assert_eq!(receiver.status().session_locked_until, Some(at(2_000)));
    assert_eq!(
        harness.wire().requests(),
        vec![ManagementRequest::RenewSessionLock {
            session_id: "s-7".to_string()
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_lock_lost_makes_receiver_unusable_without_network() {
    let harness = Harness::new();
    let receiver = session_receiver(&harness).await;

    let pending = receiver.receive(1, Duration::from_secs(30));
    settle().await;
    harness.factory.deliver(&tag(1), &message("m-1"), false);
    pending.await.expect("received");

    harness.factory.detach(Some(LinkError::new(
        ErrorKind::SessionLockLost,
        "session lock expired",
    )));
    settle().await;
    let status = receiver.status();
    assert!(status.session_lock_lost);
    assert!(!status.is_usable());

    let before = harness.wire().len();
    let error = receiver
        .complete(&tag(1), None)
        .await
        .expect_err("unusable");
    assert_eq!(error.kind(), ErrorKind::IllegalState);
    let error = receiver
        .receive(1, Duration::from_secs(1))
        .await
        .expect_err("unusable");
    assert_eq!(error.kind(), ErrorKind::IllegalState);
    let error = receiver
        .renew_session_lock()
        .await
        .expect_err("unusable");
    assert_eq!(error.kind(), ErrorKind::IllegalState);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.wire().len(), before, "no network activity");
    assert_eq!(harness.wire().attach_count(), 1, "never reattached");
}

#[tokio::test(start_paused = true)]
async fn test_renewal_answering_lock_lost_is_final() {
    let harness = Harness::new();
    let receiver = session_receiver(&harness).await;

    harness.factory.respond(Err(LinkError::new(
        ErrorKind::SessionLockLost,
        "session lock expired",
    )));
    let error = receiver
        .renew_session_lock()
        .await
        .expect_err("lock lost");
    assert_eq!(error.kind(), ErrorKind::SessionLockLost);
    settle().await;

    assert!(receiver.status().session_lock_lost);
    let error = receiver
        .receive(1, Duration::from_secs(1))
        .await
        .expect_err("unusable");
    assert_eq!(error.kind(), ErrorKind::IllegalState);
}

#[tokio::test(start_paused = true)]
async fn test_session_cannot_be_locked_fails_receive() {
    let harness = Harness::new();
    harness.factory.fail_next_attach(LinkError::new(
        ErrorKind::SessionCannotBeLocked,
        "session s-1 is locked by another receiver",
    ));
    let receiver = receiver(
        &harness,
        ReceiverConfig::new(ENTITY).with_session(SessionRequest::Named("s-1".to_string())),
    );

    let error = receiver
        .receive(1, Duration::from_secs(30))
        .await
        .expect_err("cannot lock");
    assert_eq!(error.kind(), ErrorKind::SessionCannotBeLocked);
    assert!(receiver.status().session_lock_lost);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.wire().attach_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_session_state_round_trip() {
    let harness = Harness::new();
    let receiver = session_receiver(&harness).await;

    receiver
        .set_session_state(Some(Bytes::from_static(b"cursor=42")))
        .await
        .expect("stored");
    harness.factory.respond(Ok(ManagementResponse::SessionState(Some(
        Bytes::from_static(b"cursor=42"),
    ))));
    let state = receiver.get_session_state().await.expect("read");
    assert_eq!(state, Some(Bytes::from_static(b"cursor=42")));

    let requests = harness.wire().requests();
    assert_eq!(
        requests[0],
        ManagementRequest::SetSessionState {
            session_id: "s-7".to_string(),
            state: Some(Bytes::from_static(b"cursor=42")),
        }
    );
    assert_eq!(
        requests[1],
        ManagementRequest::GetSessionState {
            session_id: "s-7".to_string()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_session_operations_need_a_session() {
    let harness = Harness::new();
    let receiver = receiver(&harness, ReceiverConfig::new(ENTITY));

    let error = receiver
        .renew_session_lock()
        .await
        .expect_err("no session");
    assert_eq!(error.kind(), ErrorKind::InvalidOperation);
    let error = receiver.get_session_state().await.expect_err("no session");
    assert_eq!(error.kind(), ErrorKind::InvalidOperation);
    assert!(harness.wire().requests().is_empty());
}
