use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use shelf::engine::{BookingError, Engine, GuardReason};
use shelf::form::BookingForm;
use shelf::hints::ClientHint;
use shelf::model::{Actor, Custodian, Role};
use shelf::notify::{Notification, NotificationKind};
use shelf::tenant::TenantManager;

// ── Test infrastructure ──────────────────────────────────────

fn test_manager() -> TenantManager {
    let dir: PathBuf = std::env::temp_dir().join(format!("shelf_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    TenantManager::new(dir, 1000, Duration::from_secs(3600))
}

/// Wait for a notification with timeout.
async fn recv_notification(rx: &mut broadcast::Receiver<Notification>, timeout: Duration) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok()?.ok()
}

async fn reservable(engine: &Engine, admin: &Actor) -> Ulid {
    let asset = Ulid::new();
    engine.create_asset(asset, "Drone".into(), true).await.unwrap();
    let id = engine.create_draft_booking(admin, Some("Aerial survey".into())).await.unwrap();
    let form = BookingForm {
        name: "Aerial survey".into(),
        start: "2099-04-10T08:00".into(),
        end: "2099-04-10T18:00".into(),
        custodian: Some(Custodian::User(admin.user_id)),
    };
    engine
        .save_booking(admin, id, form, &ClientHint::from_zone_name("Europe/Sofia").unwrap())
        .await
        .unwrap();
    engine.manage_assets(admin, id, vec![asset], vec![]).await.unwrap();
    id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn lifecycle_notifies_subscribers() {
    let tm = test_manager();
    let engine = tm.get_or_create("acme").unwrap();
    let admin = Actor::new(Ulid::new(), Role::Owner);
    let id = reservable(&engine, &admin).await;
    let mut rx = engine.notify.subscribe(id);

    assert_ok!(engine.reserve_booking(&admin, id).await);
    assert_ok!(engine.check_out_booking(&admin, id).await);
    assert_ok!(engine.check_in_booking(&admin, id).await);
    assert_ok!(engine.archive_booking(&admin, id).await);

    let mut kinds = Vec::new();
    while let Some(n) = recv_notification(&mut rx, Duration::from_millis(200)).await {
        assert_eq!(n.booking_id, id);
        assert_eq!(n.actor_id, Some(admin.user_id));
        kinds.push(n.kind);
    }
    assert_eq!(
        kinds,
        vec![
            NotificationKind::Reserved,
            NotificationKind::CheckedOut,
            NotificationKind::CheckedIn,
            NotificationKind::Archived,
        ]
    );
}

#[tokio::test]
async fn refused_transition_is_silent() {
    let tm = test_manager();
    let engine = tm.get_or_create("acme").unwrap();
    let admin = Actor::new(Ulid::new(), Role::Admin);
    let id = reservable(&engine, &admin).await;
    let mut rx = engine.notify.subscribe(id);

    let err = assert_err!(engine.check_in_booking(&admin, id).await);
    assert!(matches!(err.guard_reason(), Some(GuardReason::InvalidTransition { .. })));
    assert!(recv_notification(&mut rx, Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn notification_payload_is_valid_json() {
    let tm = test_manager();
    let engine = tm.get_or_create("acme").unwrap();
    let admin = Actor::new(Ulid::new(), Role::Admin);
    let id = reservable(&engine, &admin).await;
    let mut rx = engine.notify.subscribe_all();

    engine.reserve_booking(&admin, id).await.unwrap();
    let n = recv_notification(&mut rx, Duration::from_secs(1)).await.unwrap();
    let payload: serde_json::Value = serde_json::from_str(&n.to_json().unwrap()).unwrap();
    assert_eq!(payload["kind"], "Reserved");
    assert_eq!(payload["booking_id"], id.to_string());
    assert_eq!(payload["title"], "Booking reserved");
}

#[tokio::test]
async fn only_subscribed_booking_is_heard() {
    let tm = test_manager();
    let engine = tm.get_or_create("acme").unwrap();
    let admin = Actor::new(Ulid::new(), Role::Admin);
    let watched = reservable(&engine, &admin).await;
    let other = reservable(&engine, &admin).await;
    let mut rx = engine.notify.subscribe(watched);

    engine.reserve_booking(&admin, other).await.unwrap();
    assert!(recv_notification(&mut rx, Duration::from_millis(100)).await.is_none());

    engine.cancel_booking(&admin, watched).await.unwrap();
    let n = recv_notification(&mut rx, Duration::from_secs(1)).await.unwrap();
    assert_eq!(n.kind, NotificationKind::Cancelled);
}

#[tokio::test]
async fn delete_closes_the_channel() {
    let tm = test_manager();
    let engine = tm.get_or_create("acme").unwrap();
    let admin = Actor::new(Ulid::new(), Role::Admin);
    let id = reservable(&engine, &admin).await;
    let mut rx = engine.notify.subscribe(id);

    engine.delete_booking(&admin, id).await.unwrap();
    let n = recv_notification(&mut rx, Duration::from_secs(1)).await.unwrap();
    assert_eq!(n.kind, NotificationKind::Deleted);
    assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    assert!(matches!(
        engine.get_booking(&admin, id).await,
        Err(BookingError::NotFound(_))
    ));
}

#[tokio::test]
async fn organizations_do_not_hear_each_other() {
    let tm = test_manager();
    let acme = tm.get_or_create("acme").unwrap();
    let globex = tm.get_or_create("globex").unwrap();
    let admin = Actor::new(Ulid::new(), Role::Admin);
    let mut globex_rx = globex.notify.subscribe_all();

    let id = reservable(&acme, &admin).await;
    acme.reserve_booking(&admin, id).await.unwrap();
    assert!(recv_notification(&mut globex_rx, Duration::from_millis(100)).await.is_none());
    assert!(!Arc::ptr_eq(&acme, &globex));
}
