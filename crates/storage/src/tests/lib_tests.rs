use super::*;
use chrono::Duration;
use shared::{
    domain::MemberRef,
    models::{Poll, PollOption},
};

fn new_message(text: &str) -> NewMessage {
    NewMessage {
        text: text.to_string(),
        created_by: MemberRef::new("u-alice", "Alice"),
        reply_to: None,
        image_url: None,
        poll: None,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("plan_sync_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn cache_entries_overwrite_and_delete() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.put_cache_entry("k", "v1").await.expect("put");
    storage.put_cache_entry("k", "v2").await.expect("overwrite");
    storage.put_cache_entry("other", "x").await.expect("put");

    let mut entries = storage.load_cache_entries().await.expect("load");
    entries.sort();
    assert_eq!(
        entries,
        vec![
            ("k".to_string(), "v2".to_string()),
            ("other".to_string(), "x".to_string())
        ]
    );

    storage.delete_cache_entry("k").await.expect("delete");
    assert_eq!(storage.load_cache_entries().await.expect("load").len(), 1);
}

#[tokio::test]
async fn lists_messages_oldest_first_per_group() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let group = GroupId::new("g-1");
    let first = storage
        .insert_message(&group, new_message("first"))
        .await
        .expect("first");
    let second = storage
        .insert_message(&group, new_message("second"))
        .await
        .expect("second");
    storage
        .insert_message(&GroupId::new("g-2"), new_message("elsewhere"))
        .await
        .expect("other group");

    let messages = storage.list_messages(&group).await.expect("list");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, first.id);
    assert_eq!(messages[1].id, second.id);
}

#[tokio::test]
async fn updates_reactions_and_poll_votes_in_place() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let group = GroupId::new("g-1");
    let mut with_poll = new_message("dinner?");
    with_poll.poll = Some(Poll {
        question: "dinner?".into(),
        options: vec![PollOption {
            id: "pizza".into(),
            label: "Pizza".into(),
        }],
        votes: BTreeMap::new(),
        closes_at: None,
    });
    let message = storage
        .insert_message(&group, with_poll)
        .await
        .expect("insert");

    let alice = UserId::new("u-alice");
    let mut reactions = Reactions::new();
    reactions
        .entry("👍".to_string())
        .or_default()
        .insert(alice.clone());
    assert!(storage
        .update_message_reactions(&group, &message.id, reactions)
        .await
        .expect("react"));

    let mut votes = BTreeMap::new();
    votes.insert(alice.clone(), "pizza".to_string());
    assert!(storage
        .update_poll_votes(&group, &message.id, votes)
        .await
        .expect("vote"));

    let stored = storage.list_messages(&group).await.expect("list");
    assert!(stored[0].reactions["👍"].contains(&alice));
    assert_eq!(stored[0].poll.as_ref().expect("poll").votes[&alice], "pizza");

    assert!(!storage
        .update_message_reactions(&group, &MessageId::new("missing"), Reactions::new())
        .await
        .expect("missing"));
}

#[tokio::test]
async fn presence_never_moves_backwards() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let group = GroupId::new("g-1");
    let user = UserId::new("u-1");
    let now = Utc::now();

    storage.upsert_presence(&group, &user, now).await.expect("beat");
    storage
        .upsert_presence(&group, &user, now - Duration::seconds(30))
        .await
        .expect("stale beat");

    let records = storage
        .list_presence_since(&group, now - Duration::seconds(1))
        .await
        .expect("list");
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].last_seen_at.timestamp_millis(),
        now.timestamp_millis()
    );
}

#[tokio::test]
async fn extras_round_trip_and_replace_wholesale() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let group = GroupId::new("g-1");
    let item = ItemId::new("i-1");
    assert!(storage.load_extras(&group, &item).await.expect("load").is_none());

    let mut blob = ExtrasBlob::default();
    blob.dinner.items.push("Pizza".into());
    blob.about = "bbq".into();
    storage.save_extras(&group, &item, &blob).await.expect("save");

    let mut replacement = ExtrasBlob::default();
    replacement.dinner.items.push("Sushi".into());
    storage
        .save_extras(&group, &item, &replacement)
        .await
        .expect("replace");

    let stored = storage.load_extras(&group, &item).await.expect("load");
    assert_eq!(stored, Some(replacement));
}

#[tokio::test]
async fn post_image_refs_and_objects_persist() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let post = Post {
        id: PostId::new("p-1"),
        group_id: GroupId::new("g-1"),
        owner_id: UserId::new("u-1"),
        inline_images: vec!["data:image/png;base64,AAAA".into()],
        image_url: None,
        image_refs: None,
    };
    storage.insert_post(&post).await.expect("insert post");

    let object_id = storage
        .store_object("groups/g-1/posts", "image/png", b"png-bytes")
        .await
        .expect("store object");
    let url = format!("http://localhost/objects/{object_id}");
    assert!(storage
        .set_primary_image(&post.id, url.clone())
        .await
        .expect("primary"));
    assert!(storage
        .save_image_refs(&post.id, vec![url.clone()])
        .await
        .expect("refs"));

    let stored = storage.load_post(&post.id).await.expect("load").expect("post");
    assert_eq!(stored.image_url.as_deref(), Some(url.as_str()));
    assert_eq!(stored.image_refs, Some(vec![url]));
    assert_eq!(stored.inline_images, post.inline_images);

    let object = storage
        .load_object(&object_id)
        .await
        .expect("load object")
        .expect("object");
    assert_eq!(object.bytes, b"png-bytes");
    assert_eq!(object.content_type, "image/png");

    assert!(!storage
        .save_image_refs(&PostId::new("missing"), Vec::new())
        .await
        .expect("missing post"));
}
