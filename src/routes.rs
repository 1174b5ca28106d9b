use crate::clock::Clock;
use crate::model::{LinkRecord, LinkSpecification, LinkSummary, ListParameters};
use crate::registry::LinkRegistry;
use crate::store::KeyValueStore;
use crate::utils::{blocking, internal_error, link_error};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// Redirects must reach us on every visit or clicks go uncounted.
const CACHE_CONTROL_HEADER_VALUE: &str = "private, no-cache";

/// Paths served by the router itself; never valid as link ids.
pub const RESERVED_IDS: [&str; 2] = ["links", "health"];

pub type SharedRegistry = Arc<LinkRegistry<Arc<dyn KeyValueStore>, Arc<dyn Clock>>>;

pub fn shared_registry(
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    base_url: &str,
) -> SharedRegistry {
    Arc::new(LinkRegistry::with_clock(store, clock, base_url).reserve_ids(RESERVED_IDS))
}

pub fn create_router(registry: SharedRegistry) -> Router {
    Router::new()
        .route("/links", post(create_link).get(list_links))
        .route("/links/statistics", get(get_link_statistics))
        .route("/:id", get(redirect).delete(delete_link))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(CompressionLayer::new()),
        )
        .with_state(registry)
}

pub async fn create_link(
    State(registry): State<SharedRegistry>,
    Json(link_specification): Json<LinkSpecification>,
) -> Result<(StatusCode, Json<LinkRecord>), (StatusCode, String)> {
    let link = blocking(move || {
        registry.create(
            &link_specification.original_url,
            link_specification.custom_name.as_deref(),
        )
    })
    .await?
    .map_err(link_error)?;
    Ok((StatusCode::CREATED, Json(link)))
}

pub async fn list_links(
    State(registry): State<SharedRegistry>,
    Query(parameters): Query<ListParameters>,
) -> Result<Json<Vec<LinkRecord>>, (StatusCode, String)> {
    let links = blocking(move || match parameters.limit {
        Some(limit) => registry.list_recent(limit),
        None => registry.list_all(),
    })
    .await?;
    Ok(Json(links))
}

pub async fn get_link_statistics(
    State(registry): State<SharedRegistry>,
) -> Result<Json<LinkSummary>, (StatusCode, String)> {
    let summary = blocking(move || registry.summary()).await?;
    Ok(Json(summary))
}

pub async fn delete_link(
    State(registry): State<SharedRegistry>,
    Path(link_id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let removed = blocking(move || registry.delete_by_id(&link_id))
        .await?
        .map_err(link_error)?;
    if !removed {
        tracing::debug!("Delete requested for unknown link");
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn redirect(
    State(registry): State<SharedRegistry>,
    Path(link_id): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let lookup = registry.clone();
    let link = blocking(move || lookup.resolve(&link_id))
        .await?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "URL not found".to_string()))?;

    if registry.is_expired(&link) {
        return Err((StatusCode::GONE, "This link has expired".into()));
    }

    let clicked_id = link.id.clone();
    let saved_click = blocking(move || registry.increment_clicks(&clicked_id)).await;
    match saved_click {
        Ok(Err(err)) => tracing::error!("Saving click for {} failed: {}", link.id, err),
        Ok(Ok(())) => tracing::debug!("Click for {} persisted", link.id),
        Err((_, err)) => tracing::error!("Saving click for {} failed: {}", link.id, err),
    }

    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(header::LOCATION, &link.original_url)
        .header(header::CACHE_CONTROL, CACHE_CONTROL_HEADER_VALUE)
        .body(Body::empty())
        .map_err(internal_error)
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
