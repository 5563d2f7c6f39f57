use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use shared::{
    domain::{GroupId, ItemId, MessageId, PostId, UserId},
    error::{ApiError, ErrorCode},
    models::{ChatMessage, ExtrasBlob, MemberProfile, Post, PresenceRecord},
    protocol::{
        ImageRefsUpdate, MemberUpsert, NewMessage, ObjectUploadQuery, ObjectUploadResponse,
        PollVotesUpdate, PresenceQuery, PresenceUpsert, PrimaryImageUpdate, ReactionsUpdate,
    },
};
use storage::Storage;
use tracing::{error, info};

mod config;

use config::{load_settings, prepare_database_url};

struct AppState {
    storage: Storage,
    public_url: String,
    max_object_bytes: usize,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        storage,
        public_url: settings.public_url(),
        max_object_bytes: settings.max_object_bytes,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, public_url = %settings.public_url(), "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_object_bytes.saturating_add(1));
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/groups/:group_id/messages",
            get(list_messages).post(insert_message),
        )
        .route(
            "/groups/:group_id/messages/:message_id/reactions",
            put(set_reactions),
        )
        .route(
            "/groups/:group_id/messages/:message_id/votes",
            put(set_poll_votes),
        )
        .route("/groups/:group_id/members", get(list_members))
        .route("/groups/:group_id/members/:user_id", put(upsert_member))
        .route("/groups/:group_id/presence", get(list_presence))
        .route("/groups/:group_id/presence/:user_id", put(upsert_presence))
        .route(
            "/groups/:group_id/extras/:item_id",
            get(fetch_extras).put(save_extras),
        )
        .route("/posts/:post_id", get(fetch_post).put(save_post))
        .route(
            "/posts/:post_id/image_refs",
            get(fetch_image_refs).put(save_image_refs),
        )
        .route("/posts/:post_id/primary_image", put(set_primary_image))
        .route("/objects", post(upload_object))
        .route("/objects/:object_id", get(download_object))
        .layer(body_limit)
        .with_state(state)
}

fn internal(error: anyhow::Error) -> (StatusCode, Json<ApiError>) {
    error!(error = %format!("{error:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(ErrorCode::Internal, error.to_string())),
    )
}

fn not_found(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError::new(ErrorCode::NotFound, message)),
    )
}

fn invalid(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::Validation, message)),
    )
}

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    state.storage.health_check().await.map_err(internal)?;
    Ok("ok")
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<GroupId>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    let messages = state
        .storage
        .list_messages(&group_id)
        .await
        .map_err(internal)?;
    Ok(Json(messages))
}

async fn insert_message(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<GroupId>,
    Json(message): Json<NewMessage>,
) -> ApiResult<(StatusCode, Json<ChatMessage>)> {
    if message.text.trim().is_empty() && message.image_url.is_none() {
        return Err(invalid("message needs text or an image"));
    }
    let stored = state
        .storage
        .insert_message(&group_id, message)
        .await
        .map_err(internal)?;
    info!(%group_id, message_id = %stored.id, "message stored");
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn set_reactions(
    State(state): State<Arc<AppState>>,
    Path((group_id, message_id)): Path<(GroupId, MessageId)>,
    Json(update): Json<ReactionsUpdate>,
) -> ApiResult<StatusCode> {
    let found = state
        .storage
        .update_message_reactions(&group_id, &message_id, update.reactions)
        .await
        .map_err(internal)?;
    if !found {
        return Err(not_found("message not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn set_poll_votes(
    State(state): State<Arc<AppState>>,
    Path((group_id, message_id)): Path<(GroupId, MessageId)>,
    Json(update): Json<PollVotesUpdate>,
) -> ApiResult<StatusCode> {
    let found = state
        .storage
        .update_poll_votes(&group_id, &message_id, update.votes)
        .await
        .map_err(internal)?;
    if !found {
        return Err(not_found("poll message not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_members(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<GroupId>,
) -> ApiResult<Json<Vec<MemberProfile>>> {
    let members = state
        .storage
        .list_members(&group_id)
        .await
        .map_err(internal)?;
    Ok(Json(members))
}

async fn upsert_member(
    State(state): State<Arc<AppState>>,
    Path((group_id, user_id)): Path<(GroupId, UserId)>,
    Json(body): Json<MemberUpsert>,
) -> ApiResult<StatusCode> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(invalid("member name cannot be empty"));
    }
    state
        .storage
        .upsert_member(&group_id, &user_id, name)
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upsert_presence(
    State(state): State<Arc<AppState>>,
    Path((group_id, user_id)): Path<(GroupId, UserId)>,
    Json(body): Json<PresenceUpsert>,
) -> ApiResult<StatusCode> {
    state
        .storage
        .upsert_presence(&group_id, &user_id, body.last_seen_at)
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_presence(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<GroupId>,
    Query(query): Query<PresenceQuery>,
) -> ApiResult<Json<Vec<PresenceRecord>>> {
    let records = state
        .storage
        .list_presence_since(&group_id, query.since)
        .await
        .map_err(internal)?;
    Ok(Json(records))
}

async fn fetch_extras(
    State(state): State<Arc<AppState>>,
    Path((group_id, item_id)): Path<(GroupId, ItemId)>,
) -> ApiResult<Json<ExtrasBlob>> {
    state
        .storage
        .load_extras(&group_id, &item_id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found("no extras for item"))
}

async fn save_extras(
    State(state): State<Arc<AppState>>,
    Path((group_id, item_id)): Path<(GroupId, ItemId)>,
    Json(blob): Json<ExtrasBlob>,
) -> ApiResult<StatusCode> {
    state
        .storage
        .save_extras(&group_id, &item_id, &blob)
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fetch_post(
    State(state): State<Arc<AppState>>,
    Path(post_id): Path<PostId>,
) -> ApiResult<Json<Post>> {
    state
        .storage
        .load_post(&post_id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found("post not found"))
}

async fn save_post(
    State(state): State<Arc<AppState>>,
    Path(post_id): Path<PostId>,
    Json(post): Json<Post>,
) -> ApiResult<StatusCode> {
    if post.id != post_id {
        return Err(invalid("post id does not match the path"));
    }
    state.storage.insert_post(&post).await.map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fetch_image_refs(
    State(state): State<Arc<AppState>>,
    Path(post_id): Path<PostId>,
) -> ApiResult<Json<Option<Vec<String>>>> {
    let post = state
        .storage
        .load_post(&post_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("post not found"))?;
    Ok(Json(post.image_refs))
}

async fn save_image_refs(
    State(state): State<Arc<AppState>>,
    Path(post_id): Path<PostId>,
    Json(update): Json<ImageRefsUpdate>,
) -> ApiResult<StatusCode> {
    let found = state
        .storage
        .save_image_refs(&post_id, update.urls)
        .await
        .map_err(internal)?;
    if !found {
        return Err(not_found("post not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn set_primary_image(
    State(state): State<Arc<AppState>>,
    Path(post_id): Path<PostId>,
    Json(update): Json<PrimaryImageUpdate>,
) -> ApiResult<StatusCode> {
    let found = state
        .storage
        .set_primary_image(&post_id, update.url)
        .await
        .map_err(internal)?;
    if !found {
        return Err(not_found("post not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_object(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ObjectUploadQuery>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ObjectUploadResponse>)> {
    if body.is_empty() {
        return Err(invalid("object body cannot be empty"));
    }
    if body.len() > state.max_object_bytes {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(ApiError::new(
                ErrorCode::PayloadTooLarge,
                format!("object exceeds {} bytes", state.max_object_bytes),
            )),
        ));
    }
    let scope = query.scope.trim_matches('/');
    if scope.is_empty() || scope.split('/').any(|segment| segment.is_empty() || segment == "..") {
        return Err(invalid("object scope must be a relative path"));
    }

    let object_id = state
        .storage
        .store_object(scope, &query.content_type, &body)
        .await
        .map_err(internal)?;
    info!(%object_id, scope, bytes = body.len(), "object stored");
    Ok((
        StatusCode::CREATED,
        Json(ObjectUploadResponse {
            url: format!("{}/objects/{object_id}", state.public_url),
        }),
    ))
}

async fn download_object(
    State(state): State<Arc<AppState>>,
    Path(object_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let object = state
        .storage
        .load_object(&object_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("object not found"))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&object.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    Ok((headers, object.bytes))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
