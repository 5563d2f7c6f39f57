use super::*;
use crate::{
    cache::MemoryKeyValueStore,
    clock::ManualClock,
    memory::{InMemoryRemoteStore, RemoteOp},
};
use chrono::TimeZone;
use std::time::Duration as StdDuration;

struct Device {
    cache: LocalCache,
    engine: Arc<ReconciliationEngine>,
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 5, 1, 18, 0, 0).unwrap(),
    ))
}

fn device(remote: &Arc<InMemoryRemoteStore>, clock: &Arc<ManualClock>) -> Device {
    let cache = LocalCache::new(Arc::new(MemoryKeyValueStore::new()));
    let engine = ReconciliationEngine::new(remote.clone(), cache.clone(), clock.clone());
    Device { cache, engine }
}

fn ids() -> (GroupId, ItemId) {
    (GroupId::new("g-1"), ItemId::new("cabin"))
}

#[test]
fn remote_value_wins_when_present() {
    let mut local = ExtrasBlob::default();
    local.about = "local".into();
    let mut remote = ExtrasBlob::default();
    remote.about = "remote".into();

    let resolution = RemoteWinsElseSeed.reconcile(Some(local.clone()), Some(remote.clone()));
    assert_eq!(resolution.value, remote);
    assert!(!resolution.seed_remote);

    let resolution = RemoteWinsElseSeed.reconcile(Some(local.clone()), None);
    assert_eq!(resolution.value, local);
    assert!(resolution.seed_remote);

    let resolution = RemoteWinsElseSeed.reconcile(None, None);
    assert_eq!(resolution.value, ExtrasBlob::default());
    assert!(resolution.seed_remote);
}

#[tokio::test]
async fn read_defaults_when_nothing_is_cached() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let dev = device(&remote, &clock());
    let (group, item) = ids();
    assert_eq!(dev.engine.read(&group, &item), ExtrasBlob::default());
}

#[tokio::test]
async fn sync_seeds_an_absent_remote_with_the_local_value() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let dev = device(&remote, &clock());
    let (group, item) = ids();
    let mut local = ExtrasBlob::default();
    local.about = "bring boots".into();
    dev.cache.write(&CacheKey::extras(&group, &item), &local);

    let synced = dev.engine.sync(&group, &item).await.expect("sync");

    assert_eq!(synced, local);
    assert_eq!(remote.extras(&group, &item), Some(local));
}

#[tokio::test]
async fn sync_overwrites_the_cache_with_the_remote_value() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let (group, item) = ids();
    let mut authoritative = ExtrasBlob::default();
    authoritative.about = "remote plan".into();
    remote
        .upsert_extras(&group, &item, &authoritative)
        .await
        .expect("seed remote");

    let dev = device(&remote, &clock());
    let mut stale = ExtrasBlob::default();
    stale.about = "stale".into();
    dev.cache.write(&CacheKey::extras(&group, &item), &stale);

    let synced = dev.engine.sync(&group, &item).await.expect("sync");
    assert_eq!(synced, authoritative);
    assert_eq!(dev.engine.read(&group, &item), authoritative);
}

#[tokio::test]
async fn repeated_sync_is_idempotent() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let dev = device(&remote, &clock());
    let (group, item) = ids();

    let first = dev.engine.sync(&group, &item).await.expect("sync");
    let writes_after_first = remote.calls(RemoteOp::UpsertExtras);
    let second = dev.engine.sync(&group, &item).await.expect("sync");

    assert_eq!(first, second);
    assert_eq!(writes_after_first, 1);
    assert_eq!(remote.calls(RemoteOp::UpsertExtras), 1);
}

#[tokio::test]
async fn sync_failures_propagate() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let dev = device(&remote, &clock());
    let (group, item) = ids();

    remote.fail(RemoteOp::FetchExtras);
    assert!(dev.engine.sync(&group, &item).await.is_err());

    remote.recover(RemoteOp::FetchExtras);
    remote.fail(RemoteOp::UpsertExtras);
    assert!(dev.engine.sync(&group, &item).await.is_err());
}

#[tokio::test]
async fn votes_after_the_deadline_are_rejected() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let clock = clock();
    let dev = device(&remote, &clock);
    let (group, item) = ids();
    let ada = UserId::new("u-ada");

    assert!(dev.engine.add_menu_item(&group, &item, "Tacos"));
    let closes_at = dev.engine.set_dinner_deadline(&group, &item, 10);
    assert_eq!(closes_at, clock.now() + Duration::minutes(10));

    assert!(dev.engine.vote_menu_item(&group, &item, &ada, "Tacos"));
    clock.advance(Duration::minutes(10) + Duration::seconds(1));
    let before = dev.engine.read(&group, &item);
    assert!(!dev.engine.vote_menu_item(&group, &item, &UserId::new("u-bo"), "Tacos"));
    assert_eq!(dev.engine.read(&group, &item), before);
    assert_eq!(before.dinner.tally().get("Tacos"), Some(&1));
}

#[tokio::test]
async fn votes_for_unknown_items_are_rejected() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let dev = device(&remote, &clock());
    let (group, item) = ids();
    assert!(!dev
        .engine
        .vote_menu_item(&group, &item, &UserId::new("u-ada"), "Sushi"));
    assert_eq!(dev.engine.read(&group, &item), ExtrasBlob::default());
}

#[tokio::test]
async fn deadlines_are_clamped() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let clock = clock();
    let dev = device(&remote, &clock);
    let (group, item) = ids();

    let earliest = dev.engine.set_dinner_deadline(&group, &item, 0);
    assert_eq!(earliest, clock.now() + Duration::minutes(1));
    let latest = dev.engine.set_dinner_deadline(&group, &item, 100_000);
    assert_eq!(latest, clock.now() + Duration::days(7));

    assert!(dev.engine.clear_dinner_deadline(&group, &item));
    assert!(!dev.engine.clear_dinner_deadline(&group, &item));
}

#[tokio::test]
async fn removing_a_menu_item_drops_its_votes() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let dev = device(&remote, &clock());
    let (group, item) = ids();
    let ada = UserId::new("u-ada");

    dev.engine.add_menu_item(&group, &item, "Tacos");
    dev.engine.add_menu_item(&group, &item, "Curry");
    assert!(!dev.engine.add_menu_item(&group, &item, "Tacos"));
    dev.engine.vote_menu_item(&group, &item, &ada, "Tacos");

    assert!(dev.engine.remove_menu_item(&group, &item, "Tacos"));
    let blob = dev.engine.read(&group, &item);
    assert_eq!(blob.dinner.items, vec!["Curry".to_string()]);
    assert!(blob.dinner.votes_by_user.is_empty());
    assert!(!dev.engine.remove_menu_item(&group, &item, "Tacos"));
}

#[tokio::test]
async fn facility_notes_and_sub_items_update_the_cache() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let dev = device(&remote, &clock());
    let (group, item) = ids();
    let ada = UserId::new("u-ada");

    dev.engine.set_wifi(&group, &item, " cabin-guest ");
    dev.engine.set_parking(&group, &item, "gravel lot");
    dev.engine.set_about(&group, &item, "Lake weekend");
    assert!(dev
        .engine
        .add_facility_note(&group, &item, Some(&ada), "   ")
        .is_none());
    dev.engine
        .add_facility_note(&group, &item, Some(&ada), "gate code 1234")
        .expect("note");
    let note_id = dev
        .engine
        .add_event_note(&group, &item, None, "bring snacks")
        .expect("note");
    let sub_id = dev
        .engine
        .add_sub_item(&group, &item, "buy firewood")
        .expect("sub item");
    assert!(dev.engine.toggle_sub_item(&group, &item, &sub_id));
    assert!(!dev.engine.toggle_sub_item(&group, &item, "nope"));
    assert!(dev
        .engine
        .add_comment(&group, &item, &MemberRef::new("u-ada", "Ada"), "sounds good"));
    assert!(!dev
        .engine
        .add_comment(&group, &item, &MemberRef::new("u-ada", "Ada"), ""));

    let blob = dev.engine.read(&group, &item);
    assert_eq!(blob.facility.wifi, "cabin-guest");
    assert_eq!(blob.facility.parking, "gravel lot");
    assert_eq!(blob.about, "Lake weekend");
    assert_eq!(blob.facility.notes[0].created_by, Some(ada));
    assert_eq!(blob.event_notes.notes[0].text, "bring snacks");
    assert!(blob.sub_items[0].done);
    assert_eq!(blob.comments[0].text, "sounds good");

    assert!(dev.engine.remove_event_note(&group, &item, &note_id));
    assert!(dev.engine.read(&group, &item).event_notes.notes.is_empty());
}

#[tokio::test]
async fn pushes_arrive_in_mutation_order() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let dev = device(&remote, &clock());
    let (group, item) = ids();

    for n in 0..20 {
        dev.engine.set_about(&group, &item, &format!("draft {n}"));
    }
    dev.engine.flush().await;

    assert_eq!(
        remote.extras(&group, &item).expect("pushed").about,
        "draft 19"
    );
    assert_eq!(remote.calls(RemoteOp::UpsertExtras), 20);
}

#[tokio::test]
async fn push_failures_are_not_propagated() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let dev = device(&remote, &clock());
    let (group, item) = ids();
    remote.fail(RemoteOp::UpsertExtras);

    dev.engine.set_about(&group, &item, "offline edit");
    dev.engine.flush().await;

    assert_eq!(dev.engine.read(&group, &item).about, "offline edit");
    assert!(remote.extras(&group, &item).is_none());
}

#[tokio::test]
async fn two_devices_converge_last_writer_wins() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let clock = clock();
    let phone = device(&remote, &clock);
    let laptop = device(&remote, &clock);
    let (group, item) = ids();

    phone.engine.add_menu_item(&group, &item, "Tacos");
    phone.engine.flush().await;
    let seen = laptop.engine.sync(&group, &item).await.expect("sync");
    assert_eq!(seen.dinner.items, vec!["Tacos".to_string()]);

    laptop.engine.set_about(&group, &item, "laptop wrote first");
    laptop.engine.flush().await;
    phone.engine.set_about(&group, &item, "phone wrote last");
    phone.engine.flush().await;

    let phone_view = phone.engine.sync(&group, &item).await.expect("sync");
    let laptop_view = laptop.engine.sync(&group, &item).await.expect("sync");
    assert_eq!(phone_view, laptop_view);
    assert_eq!(phone_view.about, "phone wrote last");
    assert_eq!(phone_view.dinner.items, vec!["Tacos".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn mutation_during_sync_is_not_overwritten_by_the_fetched_blob() {
    let remote = Arc::new(InMemoryRemoteStore::default());
    let dev = device(&remote, &clock());
    let (group, item) = ids();
    let mut stored = ExtrasBlob::default();
    stored.about = "remote".into();
    remote
        .upsert_extras(&group, &item, &stored)
        .await
        .expect("seed remote");
    remote.set_latency(RemoteOp::FetchExtras, StdDuration::from_secs(1));
    remote.set_latency(RemoteOp::UpsertExtras, StdDuration::from_secs(5));

    let syncing = {
        let engine = dev.engine.clone();
        let (group, item) = (group.clone(), item.clone());
        tokio::spawn(async move { engine.sync(&group, &item).await })
    };
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    assert!(dev.engine.add_menu_item(&group, &item, "Pizza"));

    let synced = syncing.await.expect("join").expect("sync");

    assert_eq!(synced.dinner.items, vec!["Pizza".to_string()]);
    assert_eq!(dev.engine.read(&group, &item).dinner.items, vec!["Pizza".to_string()]);
    dev.engine.flush().await;
    assert_eq!(
        remote.extras(&group, &item).expect("remote blob").dinner.items,
        vec!["Pizza".to_string()]
    );

    let again = dev.engine.sync(&group, &item).await.expect("second sync");
    assert_eq!(again, dev.engine.read(&group, &item));
}
