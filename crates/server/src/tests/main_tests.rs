use super::*;
use axum::{body, body::Body, http::Request, response::Response};
use chrono::{TimeZone, Utc};
use serde::de::DeserializeOwned;
use shared::{domain::MemberRef, models::Poll, models::PollOption};
use tower::ServiceExt;

async fn test_app() -> (Router, Storage) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let app = build_router(Arc::new(AppState {
        storage: storage.clone(),
        public_url: "http://plans.test".into(),
        max_object_bytes: 16,
    }));
    (app, storage)
}

fn json_request(method: &str, uri: &str, value: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(value.to_string()))
        .expect("request")
}

fn get_request(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).expect("request")
}

async fn read_json<T: DeserializeOwned>(response: Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

fn new_message(text: &str) -> serde_json::Value {
    serde_json::to_value(NewMessage {
        text: text.into(),
        created_by: MemberRef::new("u-ada", "Ada"),
        reply_to: None,
        image_url: None,
        poll: None,
    })
    .expect("json")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _storage) = test_app().await;
    let response = app.oneshot(get_request("/healthz")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn messages_are_stored_and_listed_per_group() {
    let (app, _storage) = test_app().await;

    for text in ["first", "second"] {
        let response = app
            .clone()
            .oneshot(json_request("POST", "/groups/g-1/messages", new_message(text)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    let other = app
        .clone()
        .oneshot(json_request("POST", "/groups/g-2/messages", new_message("elsewhere")))
        .await
        .expect("response");
    assert_eq!(other.status(), StatusCode::CREATED);

    let response = app
        .oneshot(get_request("/groups/g-1/messages"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let messages: Vec<ChatMessage> = read_json(response).await;
    let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["first", "second"]);
}

#[tokio::test]
async fn empty_messages_are_rejected() {
    let (app, _storage) = test_app().await;
    let response = app
        .oneshot(json_request("POST", "/groups/g-1/messages", new_message("  ")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: ApiError = read_json(response).await;
    assert_eq!(error.code, ErrorCode::Validation);
}

#[tokio::test]
async fn reactions_and_votes_replace_stored_values() {
    let (app, storage) = test_app().await;
    let group = GroupId::new("g-1");
    let stored = storage
        .insert_message(
            &group,
            NewMessage {
                text: "dinner?".into(),
                created_by: MemberRef::new("u-ada", "Ada"),
                reply_to: None,
                image_url: None,
                poll: Some(Poll {
                    question: "where".into(),
                    options: vec![PollOption {
                        id: "tacos".into(),
                        label: "Tacos".into(),
                    }],
                    votes: Default::default(),
                    closes_at: None,
                }),
            },
        )
        .await
        .expect("insert");

    let reactions = app
        .clone()
        .oneshot(json_request(
            "PUT",
            &format!("/groups/g-1/messages/{}/reactions", stored.id),
            serde_json::json!({ "reactions": { "🔥": ["u-bo"] } }),
        ))
        .await
        .expect("response");
    assert_eq!(reactions.status(), StatusCode::NO_CONTENT);

    let votes = app
        .clone()
        .oneshot(json_request(
            "PUT",
            &format!("/groups/g-1/messages/{}/votes", stored.id),
            serde_json::json!({ "votes": { "u-bo": "tacos" } }),
        ))
        .await
        .expect("response");
    assert_eq!(votes.status(), StatusCode::NO_CONTENT);

    let missing = app
        .oneshot(json_request(
            "PUT",
            "/groups/g-1/messages/nope/reactions",
            serde_json::json!({ "reactions": {} }),
        ))
        .await
        .expect("response");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let messages = storage.list_messages(&group).await.expect("list");
    assert!(messages[0].reactions["🔥"].contains(&UserId::new("u-bo")));
    assert_eq!(
        messages[0].poll.as_ref().expect("poll").votes[&UserId::new("u-bo")],
        "tacos"
    );
}

#[tokio::test]
async fn members_and_presence_round_trip() {
    let (app, _storage) = test_app().await;

    let member = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/groups/g-1/members/u-ada",
            serde_json::json!({ "name": "Ada" }),
        ))
        .await
        .expect("response");
    assert_eq!(member.status(), StatusCode::NO_CONTENT);
    let members: Vec<MemberProfile> = read_json(
        app.clone()
            .oneshot(get_request("/groups/g-1/members"))
            .await
            .expect("response"),
    )
    .await;
    assert_eq!(members[0].name, "Ada");

    let seen = Utc.with_ymd_and_hms(2026, 5, 1, 18, 0, 0).unwrap();
    let presence = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/groups/g-1/presence/u-ada",
            serde_json::json!({ "lastSeenAt": seen }),
        ))
        .await
        .expect("response");
    assert_eq!(presence.status(), StatusCode::NO_CONTENT);

    let recent: Vec<PresenceRecord> = read_json(
        app.clone()
            .oneshot(get_request(
                "/groups/g-1/presence?since=2026-05-01T17:59:00Z",
            ))
            .await
            .expect("response"),
    )
    .await;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].last_seen_at, seen);

    let stale: Vec<PresenceRecord> = read_json(
        app.oneshot(get_request("/groups/g-1/presence?since=2026-05-01T18:00:00Z"))
            .await
            .expect("response"),
    )
    .await;
    assert!(stale.is_empty());
}

#[tokio::test]
async fn extras_are_absent_until_written() {
    let (app, _storage) = test_app().await;
    let missing = app
        .clone()
        .oneshot(get_request("/groups/g-1/extras/cabin"))
        .await
        .expect("response");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let mut blob = ExtrasBlob::default();
    blob.dinner.items.push("Pizza".into());
    let saved = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/groups/g-1/extras/cabin",
            serde_json::to_value(&blob).expect("json"),
        ))
        .await
        .expect("response");
    assert_eq!(saved.status(), StatusCode::NO_CONTENT);

    let fetched: ExtrasBlob = read_json(
        app.oneshot(get_request("/groups/g-1/extras/cabin"))
            .await
            .expect("response"),
    )
    .await;
    assert_eq!(fetched, blob);
}

#[tokio::test]
async fn post_image_refs_and_primary_image_update_the_post() {
    let (app, storage) = test_app().await;
    let post = Post {
        id: PostId::new("p-1"),
        group_id: GroupId::new("g-1"),
        owner_id: UserId::new("u-ada"),
        inline_images: vec!["data:image/png;base64,AQID".into()],
        image_url: None,
        image_refs: None,
    };
    let created = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/posts/p-1",
            serde_json::to_value(&post).expect("json"),
        ))
        .await
        .expect("response");
    assert_eq!(created.status(), StatusCode::NO_CONTENT);

    let refs: Option<Vec<String>> = read_json(
        app.clone()
            .oneshot(get_request("/posts/p-1/image_refs"))
            .await
            .expect("response"),
    )
    .await;
    assert_eq!(refs, None);

    let primary = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/posts/p-1/primary_image",
            serde_json::json!({ "url": "http://plans.test/objects/1" }),
        ))
        .await
        .expect("response");
    assert_eq!(primary.status(), StatusCode::NO_CONTENT);
    let saved = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/posts/p-1/image_refs",
            serde_json::json!({ "urls": ["http://plans.test/objects/1"] }),
        ))
        .await
        .expect("response");
    assert_eq!(saved.status(), StatusCode::NO_CONTENT);

    let stored = storage
        .load_post(&PostId::new("p-1"))
        .await
        .expect("load")
        .expect("post");
    assert_eq!(stored.image_url.as_deref(), Some("http://plans.test/objects/1"));
    assert_eq!(
        stored.image_refs,
        Some(vec!["http://plans.test/objects/1".to_string()])
    );

    let unknown = app
        .oneshot(get_request("/posts/nope/image_refs"))
        .await
        .expect("response");
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn objects_upload_and_download() {
    let (app, _storage) = test_app().await;
    let upload = Request::post("/objects?scope=groups/g-1/posts&content_type=image/png")
        .body(Body::from(vec![1u8, 2, 3]))
        .expect("request");
    let response = app.clone().oneshot(upload).await.expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let uploaded: ObjectUploadResponse = read_json(response).await;
    let path = uploaded
        .url
        .strip_prefix("http://plans.test")
        .expect("public url prefix")
        .to_string();

    let download = app
        .clone()
        .oneshot(get_request(&path))
        .await
        .expect("response");
    assert_eq!(download.status(), StatusCode::OK);
    assert_eq!(
        download.headers().get(header::CONTENT_TYPE).expect("type"),
        "image/png"
    );
    let bytes = body::to_bytes(download.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(bytes.as_ref(), &[1, 2, 3]);

    let too_large = Request::post("/objects?scope=groups/g-1/posts&content_type=image/png")
        .body(Body::from(vec![0u8; 17]))
        .expect("request");
    let response = app.clone().oneshot(too_large).await.expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let escaping = Request::post("/objects?scope=../etc&content_type=image/png")
        .body(Body::from(vec![1u8]))
        .expect("request");
    let response = app.oneshot(escaping).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
