//! JSON API over the reconciled workload: opportunities, scheduling inputs and sync runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use workload_core::{
    weight_totals, CustomInput, CustomInputFields, CustomInputPatch, ExternalId, Item, ItemGroup,
    ItemGroupTotal, Opportunity, OpportunityScoped, Record, TagOwner, WeightTotals,
};
use workload_storage::{PgStore, Store, StoreError, StoreResult};
use workload_sync::{build_pipeline, SyncConfig, SyncPipeline, MAX_WINDOW_DAYS};

pub const CRATE_NAME: &str = "workload-web";

const DEFAULT_RUN_LIMIT: usize = 20;
/// Look-ahead of the traffic-light workload figures.
const DEFAULT_WORKLOAD_DAYS: i64 = 14;

pub struct AppState<S: Store> {
    pub store: Arc<S>,
    pub window_days: i64,
    pub default_carpenters: i32,
    pub pipeline: Option<Arc<SyncPipeline<S>>>,
}

impl<S: Store> AppState<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            window_days: 91,
            default_carpenters: 1,
            pipeline: None,
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<SyncPipeline<S>>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    days: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct WorkloadView {
    pub days: i64,
    #[serde(flatten)]
    pub totals: WeightTotals,
}

#[derive(Debug, Serialize)]
pub struct ItemGroupView {
    #[serde(flatten)]
    pub group: Record<ItemGroup>,
    pub items: Vec<Record<Item>>,
}

/// One opportunity with everything hanging off it, tracked fields as `{value, previous}`.
#[derive(Debug, Serialize)]
pub struct OpportunityView {
    #[serde(flatten)]
    pub opportunity: Record<Opportunity>,
    pub effective_start: DateTime<Utc>,
    pub tags: BTreeSet<String>,
    pub item_groups: Vec<ItemGroupView>,
    pub total: Option<Record<ItemGroupTotal>>,
    pub custom_input: Option<Record<CustomInput>>,
}

pub fn app<S: Store>(state: AppState<S>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler::<S>))
        .route("/api/workload", get(workload_handler::<S>))
        .route("/api/opportunities", get(opportunities_handler::<S>))
        .route("/api/opportunities/{id}", get(opportunity_detail_handler::<S>))
        .route(
            "/api/opportunities/{id}/custom-input",
            patch(custom_input_handler::<S>),
        )
        .route("/api/sync", post(sync_trigger_handler::<S>))
        .route("/api/sync/runs", get(sync_runs_handler::<S>))
        .with_state(Arc::new(state))
}

pub async fn serve<S: Store>(state: AppState<S>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let pipeline = Arc::new(build_pipeline(&config, None).await?);
    let store: Arc<PgStore> = pipeline.store().clone();
    let state = AppState {
        store,
        window_days: config.window_days,
        default_carpenters: config.default_carpenters,
        pipeline: Some(pipeline),
    };
    serve(state, config.web_port).await
}

async fn healthz_handler<S: Store>(State(state): State<Arc<AppState<S>>>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(err) => store_error(err),
    }
}

async fn opportunities_handler<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let now = Utc::now();
    let horizon = match horizon(now, query.days.unwrap_or(state.window_days)) {
        Ok(horizon) => horizon,
        Err(resp) => return resp,
    };

    let records = match state.store.list_active::<Opportunity>(None).await {
        Ok(records) => records,
        Err(err) => return store_error(err),
    };
    let mut upcoming: Vec<Record<Opportunity>> = records
        .into_iter()
        .filter(|r| {
            let start = r.fields.effective_start();
            start >= now && start <= horizon
        })
        .collect();
    upcoming.sort_by_key(|r| (r.fields.effective_start(), r.fields.current_id));

    let mut views = Vec::with_capacity(upcoming.len());
    for record in upcoming {
        match load_view(state.store.as_ref(), record).await {
            Ok(view) => views.push(view),
            Err(err) => return store_error(err),
        }
    }
    Json(views).into_response()
}

/// Booked weight per pipeline state for active opportunities starting within `days`.
async fn workload_handler<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let days = query.days.unwrap_or(DEFAULT_WORKLOAD_DAYS);
    let now = Utc::now();
    let horizon = match horizon(now, days) {
        Ok(horizon) => horizon,
        Err(resp) => return resp,
    };

    let records = match state.store.list_active::<Opportunity>(None).await {
        Ok(records) => records,
        Err(err) => return store_error(err),
    };
    let totals = weight_totals(records.iter().map(|r| &r.fields).filter(|o| {
        let start = o.starts_at.value;
        start >= now && start <= horizon
    }));
    Json(WorkloadView { days, totals }).into_response()
}

async fn opportunity_detail_handler<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
) -> Response {
    let record = match active_opportunity(state.store.as_ref(), id).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(id),
        Err(err) => return store_error(err),
    };
    match load_view(state.store.as_ref(), record).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => store_error(err),
    }
}

/// Apply an operator's partial update. Derived figures are refreshed on the next pass.
async fn custom_input_handler<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
    Json(patch): Json<CustomInputPatch>,
) -> Response {
    if let Some(count) = patch.carpenter_count {
        if count <= 0 {
            return client_error("`carpenter_count` must be positive");
        }
    }
    if let Some(Some(days)) = patch.working_days {
        if !days.is_finite() || days < 0.0 {
            return client_error("`working_days` must be a non-negative number");
        }
    }
    if patch.is_empty() {
        return client_error("no fields to update");
    }

    match active_opportunity(state.store.as_ref(), id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(id),
        Err(err) => return store_error(err),
    }

    let default_carpenters = state.default_carpenters;
    let mut applied = None;
    let updated = state
        .store
        .update::<CustomInput, _>(&OpportunityScoped(id), None, |current| {
            let mut fields = current
                .map(CustomInputFields::from)
                .unwrap_or_else(|| CustomInputFields::defaults(default_carpenters));
            applied = Some(patch.apply(&mut fields));
            fields
        })
        .await;
    let applied = applied.unwrap_or_default();

    match updated {
        Ok(reconciled) => {
            info!(opportunity = id, created = reconciled.created, fields = ?applied.keys().collect::<Vec<_>>(), "custom input updated");
            Json(applied).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn sync_trigger_handler<S: Store>(State(state): State<Arc<AppState<S>>>) -> Response {
    let Some(pipeline) = state.pipeline.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "sync is not configured"})),
        )
            .into_response();
    };
    tokio::spawn(async move {
        match pipeline.run_once().await {
            Ok(summary) => info!(run_id = %summary.run_id, status = %summary.status, "requested sync finished"),
            Err(err) => error!(error = ?err, "requested sync failed"),
        }
    });
    (StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response()
}

async fn sync_runs_handler<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, 500);
    match state.store.recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => store_error(err),
    }
}

async fn active_opportunity<S: Store>(
    store: &S,
    id: i64,
) -> StoreResult<Option<Record<Opportunity>>> {
    Ok(store
        .get::<Opportunity>(&ExternalId(id))
        .await?
        .filter(|r| r.is_active))
}

async fn load_view<S: Store>(store: &S, record: Record<Opportunity>) -> StoreResult<OpportunityView> {
    let id = record.fields.current_id;
    let groups = store.list_active::<ItemGroup>(Some(id)).await?;
    let items = store.list_active::<Item>(Some(id)).await?;

    let mut items_by_group: BTreeMap<i64, Vec<Record<Item>>> = BTreeMap::new();
    for item in items {
        items_by_group
            .entry(item.fields.product_id)
            .or_default()
            .push(item);
    }
    let mut item_groups: Vec<ItemGroupView> = groups
        .into_iter()
        .map(|group| {
            let mut items = items_by_group
                .remove(&group.fields.product_id)
                .unwrap_or_default();
            items.sort_by_key(|i| i.fields.line_id);
            ItemGroupView { group, items }
        })
        .collect();
    item_groups.sort_by_key(|g| g.group.fields.product_id);

    let total = store
        .get::<ItemGroupTotal>(&OpportunityScoped(id))
        .await?
        .filter(|r| r.is_active);
    let custom_input = store.get::<CustomInput>(&OpportunityScoped(id)).await?;
    let tags = store.tags_of(&TagOwner::opportunity(id)).await?;

    Ok(OpportunityView {
        effective_start: record.fields.effective_start(),
        opportunity: record,
        tags,
        item_groups,
        total,
        custom_input,
    })
}

fn horizon(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>, Response> {
    if days < 0 {
        return Err(client_error("`days` must not be negative"));
    }
    if days > MAX_WINDOW_DAYS {
        return Err(client_error("`days` is out of range"));
    }
    Duration::try_days(days)
        .and_then(|window| now.checked_add_signed(window))
        .ok_or_else(|| client_error("`days` is out of range"))
}

fn client_error(message: &str) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({"error": message})),
    )
        .into_response()
}

fn not_found(id: i64) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("opportunity {id} not found")})),
    )
        .into_response()
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "store request failed");
    let status = if err.is_fatal() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({"error": format!("server error: {err}")}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;
    use workload_core::feed::FeedOpportunity;
    use workload_feed::{FixtureBundle, FixtureFeed};
    use workload_storage::MemoryStore;
    use workload_sync::PipelineSettings;

    fn bundle() -> FixtureBundle {
        let day = (Utc::now() + Duration::days(5)).date_naive();
        let far = (Utc::now() + Duration::days(60)).date_naive();
        serde_json::from_value(json!({
            "products": [{"id": 7, "name": "Flat"}],
            "opportunities": [
                {"id": 100, "subject": "Launch", "state": 3, "status": 0, "status_name": "Open",
                 "starts_at": format!("{day}T10:00:00Z"), "ends_at": format!("{day}T20:00:00Z"),
                 "weight_total": "120.456", "tag_list": ["Priority"]},
                {"id": 200, "subject": "Gala", "state": 3, "status": 0, "status_name": "Open",
                 "starts_at": format!("{far}T10:00:00Z"), "ends_at": format!("{far}T20:00:00Z"),
                 "weight_total": 80}
            ],
            "items": {
                "100": [{"id": 1, "item_id": 7, "name": "Flat", "quantity": 8},
                        {"id": 2, "item_id": 7, "name": "Flat", "quantity": 4}]
            }
        }))
        .unwrap()
    }

    async fn seeded() -> (Arc<MemoryStore>, Arc<SyncPipeline<MemoryStore>>) {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(SyncPipeline::new(
            store.clone(),
            Arc::new(FixtureFeed::new(bundle())),
            PipelineSettings::default(),
        ));
        pipeline.run_once().await.unwrap();
        (store, pipeline)
    }

    async fn body_json(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn patch_req(uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method("PATCH")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn listing_respects_the_window() {
        let (store, _) = seeded().await;
        let app = app(AppState::new(store));

        let resp = app.clone().oneshot(get_req("/api/opportunities?days=30")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let list = body.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["fields"]["current_id"], 100);
        assert_eq!(list[0]["tags"], json!(["Priority"]));
        assert_eq!(list[0]["item_groups"][0]["fields"]["item_total"]["value"], 6.0);
        assert_eq!(list[0]["item_groups"][0]["items"].as_array().unwrap().len(), 2);
        assert_eq!(list[0]["total"]["fields"]["grand_total"]["value"], 6.0);

        let resp = app.oneshot(get_req("/api/opportunities")).await.unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn oversized_window_is_rejected() {
        let (store, _) = seeded().await;
        let app = app(AppState::new(store));

        for uri in [
            "/api/opportunities?days=9223372036854775807",
            "/api/opportunities?days=-1",
            "/api/workload?days=9223372036854775807",
        ] {
            let resp = app.clone().oneshot(get_req(uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY, "{uri}");
        }
    }

    #[tokio::test]
    async fn workload_sums_weight_per_state() {
        let (store, _) = seeded().await;
        let app = app(AppState::new(store));

        let resp = app.clone().oneshot(get_req("/api/workload")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["days"], 14);
        assert_eq!(body["confirmed_weight"], json!(120.46));
        assert_eq!(body["provisional_weight"], json!(0.0));
        assert_eq!(body["reserved_weight"], json!(0.0));

        let resp = app.oneshot(get_req("/api/workload?days=90")).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["confirmed_weight"], json!(200.46));
        assert_eq!(body["unweighed"], 0);
    }

    #[tokio::test]
    async fn detail_returns_404_for_unknown() {
        let (store, _) = seeded().await;
        let app = app(AppState::new(store));

        let resp = app.clone().oneshot(get_req("/api/opportunities/100")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["custom_input"]["fields"]["carpenter_count"]["value"], 1);

        let resp = app.oneshot(get_req("/api/opportunities/999")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn patch_updates_custom_input_and_keeps_history() {
        let (store, _) = seeded().await;
        let app = app(AppState::new(store.clone()));

        let resp = app
            .oneshot(patch_req(
                "/api/opportunities/100/custom-input",
                json!({"carpenter_count": 3, "built": true}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let applied = body_json(resp).await;
        assert_eq!(applied, json!({"carpenter_count": 3, "built": true}));

        let input = store
            .get::<CustomInput>(&OpportunityScoped(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(input.fields.carpenter_count.value, 3);
        assert_eq!(input.fields.carpenter_count.previous, Some(1));
        assert!(input.fields.built);
    }

    #[tokio::test]
    async fn concurrent_patches_of_different_fields_both_land() {
        let (store, _) = seeded().await;
        let app = app(AppState::new(store.clone()));

        let uri = "/api/opportunities/100/custom-input";
        let (crew, built) = tokio::join!(
            app.clone()
                .oneshot(patch_req(uri, json!({"carpenter_count": 4}))),
            app.oneshot(patch_req(uri, json!({"built": true}))),
        );
        assert_eq!(crew.unwrap().status(), StatusCode::OK);
        assert_eq!(built.unwrap().status(), StatusCode::OK);

        let input = store
            .get::<CustomInput>(&OpportunityScoped(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(input.fields.carpenter_count.value, 4);
        assert!(input.fields.built);
    }

    #[tokio::test]
    async fn patch_creates_missing_custom_input_with_defaults() {
        let store = Arc::new(MemoryStore::new());
        let day = (Utc::now() + Duration::days(3)).date_naive();
        let feed: FeedOpportunity = serde_json::from_value(json!({
            "id": 300, "subject": "Expo", "status": 0, "status_name": "Open",
            "starts_at": format!("{day}T08:00:00Z"), "ends_at": format!("{day}T17:00:00Z")
        }))
        .unwrap();
        store
            .reconcile::<Opportunity>(&ExternalId(300), feed.to_incoming().unwrap(), None)
            .await
            .unwrap();

        let mut state = AppState::new(store.clone());
        state.default_carpenters = 2;
        let resp = app(state)
            .oneshot(patch_req(
                "/api/opportunities/300/custom-input",
                json!({"include_weekends": true, "planned_finish_date": "2031-05-02"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let input = store
            .get::<CustomInput>(&OpportunityScoped(300))
            .await
            .unwrap()
            .unwrap();
        assert!(input.fields.include_weekends.value);
        assert_eq!(input.fields.include_weekends.previous, None);
        assert_eq!(input.fields.carpenter_count.value, 2);
        assert_eq!(
            input.fields.planned_finish_date.value,
            chrono::NaiveDate::from_ymd_opt(2031, 5, 2)
        );
    }

    #[tokio::test]
    async fn patch_rejects_bad_input() {
        let (store, _) = seeded().await;
        let app = app(AppState::new(store));

        let zero = app
            .clone()
            .oneshot(patch_req(
                "/api/opportunities/100/custom-input",
                json!({"carpenter_count": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(zero.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let unknown_field = app
            .clone()
            .oneshot(patch_req(
                "/api/opportunities/100/custom-input",
                json!({"carpenters": 2}),
            ))
            .await
            .unwrap();
        assert_eq!(unknown_field.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let missing = app
            .oneshot(patch_req(
                "/api/opportunities/999/custom-input",
                json!({"carpenter_count": 2}),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_trigger_and_run_listing() {
        let (store, pipeline) = seeded().await;
        let unconfigured = app(AppState::new(store.clone()));
        let resp = unconfigured
            .oneshot(Request::builder().method("POST").uri("/api/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let app = app(AppState::new(store).with_pipeline(pipeline));
        let resp = app
            .clone()
            .oneshot(Request::builder().method("POST").uri("/api/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = app.oneshot(get_req("/api/sync/runs?limit=1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let runs = body_json(resp).await;
        assert_eq!(runs.as_array().unwrap().len(), 1);
        assert_eq!(runs[0]["status"], "completed");
    }

    #[tokio::test]
    async fn healthz_pings_the_store() {
        let app = app(AppState::new(Arc::new(MemoryStore::new())));
        let resp = app.oneshot(get_req("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
