use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, header},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{net::TcpListener, task};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::Config,
    error::{Result, TelemetryError},
    keys,
    rulepack::{Display, RulepackCache, resolve_locale},
    store::{
        DIMENSIONS, DayRange, EventRecord, Facet, IngestOutcome, PayloadBlob, TelemetryStore,
    },
    validation::{RawEvent, Validator},
};

const SIGNATURE_HEADER: &str = "x-telemetry-signature";

#[derive(Clone)]
struct AppState {
    store: Arc<TelemetryStore>,
    validator: Arc<Validator>,
    rulepacks: Arc<RulepackCache>,
    default_locale: String,
    max_day_span: i64,
}

pub async fn run(config: Config) -> Result<()> {
    config.ensure_data_dirs()?;

    let store = {
        let config = config.clone();
        task::spawn_blocking(move || TelemetryStore::open(&config))
            .await
            .map_err(|err| TelemetryError::Storage(err.to_string()))??
    };

    let state = AppState {
        store: Arc::new(store),
        validator: Arc::new(Validator::from_config(&config)),
        rulepacks: Arc::new(RulepackCache::new(&config)),
        default_locale: config.default_locale.clone(),
        max_day_span: config.max_day_span,
    };

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "telemetry server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/events", post(ingest_event).get(list_events))
        .route("/v1/events/{facet}/{value}", get(list_facet_events))
        .route("/v1/event/{event_id}", get(get_event))
        .route("/v1/stats/{dimension}", get(dimension_stats))
        .route("/v1/stats/rollup/{domain}", get(domain_rollup))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "service": "threatdbx" }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestResponse {
    ok: bool,
    event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dedup: Option<bool>,
}

async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<IngestResponse>> {
    // Reading the raw body with the configured cap keeps the size limit in
    // one place; the framework's default buffering limit never applies here.
    let max_bytes = state.validator.max_request_bytes();
    let body = to_bytes(body, max_bytes)
        .await
        .map_err(|_| TelemetryError::PayloadTooLarge(max_bytes))?;
    let raw: RawEvent = serde_json::from_slice(&body)
        .map_err(|err| TelemetryError::InvalidJson(err.to_string()))?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    state.validator.verify_signature(&raw, signature)?;
    let record = state.validator.validate(raw)?;

    let outcome = task::spawn_blocking({
        let store = Arc::clone(&state.store);
        move || store.ingest(record)
    })
    .await
    .map_err(|err| TelemetryError::Storage(err.to_string()))??;

    Ok(Json(match outcome {
        IngestOutcome::Stored { event_id } => IngestResponse {
            ok: true,
            event_id,
            dedup: None,
        },
        IngestOutcome::Duplicate { event_id } => IngestResponse {
            ok: true,
            event_id,
            dedup: Some(true),
        },
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    start_day: Option<String>,
    end_day: Option<String>,
    limit: Option<usize>,
    cursor: Option<String>,
    #[serde(default)]
    newest: bool,
    locale: Option<String>,
}

impl ListQuery {
    fn range(&self, max_day_span: i64) -> Result<DayRange> {
        match (&self.start_day, &self.end_day) {
            (Some(start), Some(end)) => DayRange::new(start, end, max_day_span),
            _ => Err(TelemetryError::InvalidQuery(
                "startDay and endDay are required".to_string(),
            )),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    ok: bool,
    items: Vec<EventItem>,
    cursor: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventItem {
    event_id: String,
    #[serde(rename = "type")]
    event_type: String,
    rule_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ruleset_id: Option<String>,
    severity: String,
    score_delta: f64,
    install_id: String,
    session_id: String,
    origin: String,
    domain: String,
    page: String,
    user_agent: String,
    timestamp_ms: i64,
    day: String,
    payload: PayloadBlob,
    #[serde(skip_serializing_if = "Option::is_none")]
    display: Option<Display>,
}

impl EventItem {
    fn new(record: EventRecord, display: Option<Display>) -> Self {
        Self {
            event_id: record.event_id,
            event_type: record.event_type,
            rule_id: record.rule_id,
            ruleset_id: record.ruleset_id,
            severity: record.severity,
            score_delta: record.score_delta,
            install_id: record.install_id,
            session_id: record.session_id,
            origin: record.origin,
            domain: record.domain,
            page: record.page,
            user_agent: record.user_agent,
            timestamp_ms: record.timestamp_ms,
            day: record.day,
            payload: record.payload,
            display,
        }
    }
}

fn requested_locale(state: &AppState, query_locale: Option<&str>, headers: &HeaderMap) -> String {
    let accept_language = headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|value| value.to_str().ok());
    resolve_locale(query_locale, accept_language, &state.default_locale).to_string()
}

// Rulepack joins touch the filesystem on a cache miss, so the whole batch
// runs off the async runtime.
async fn join_display(
    rulepacks: Arc<RulepackCache>,
    items: Vec<EventRecord>,
    locale: String,
) -> Result<Vec<EventItem>> {
    task::spawn_blocking(move || {
        items
            .into_iter()
            .map(|record| {
                let display = record.ruleset_id.as_deref().and_then(|pack| {
                    rulepacks.display(pack, &record.rule_id, Some(&locale))
                });
                EventItem::new(record, display)
            })
            .collect()
    })
    .await
    .map_err(|err| TelemetryError::Storage(err.to_string()))
}

async fn list_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>> {
    let range = query.range(state.max_day_span)?;
    let limit = state.store.clamp_limit(query.limit);
    let page = state
        .store
        .list_day_range(&range, limit, query.cursor.as_deref())
        .await?;

    let locale = requested_locale(&state, query.locale.as_deref(), &headers);
    let items = join_display(Arc::clone(&state.rulepacks), page.items, locale).await?;
    Ok(Json(ListResponse {
        ok: true,
        items,
        cursor: page.cursor,
    }))
}

async fn list_facet_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((facet, value)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>> {
    let facet = Facet::parse(&facet)?;
    let range = query.range(state.max_day_span)?;
    let limit = state.store.clamp_limit(query.limit);
    let page = state
        .store
        .list_facet(
            facet,
            &value,
            &range,
            limit,
            query.newest,
            query.cursor.as_deref(),
        )
        .await?;

    let locale = requested_locale(&state, query.locale.as_deref(), &headers);
    let items = join_display(Arc::clone(&state.rulepacks), page.items, locale).await?;
    Ok(Json(ListResponse {
        ok: true,
        items,
        cursor: page.cursor,
    }))
}

#[derive(Debug, Deserialize)]
struct LookupQuery {
    locale: Option<String>,
}

#[derive(Serialize)]
struct LookupResponse {
    ok: bool,
    event: EventItem,
}

async fn get_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
    Query(query): Query<LookupQuery>,
) -> Result<Json<LookupResponse>> {
    let (_pointer, record) = task::spawn_blocking({
        let store = Arc::clone(&state.store);
        move || store.get_event(&event_id)
    })
    .await
    .map_err(|err| TelemetryError::Storage(err.to_string()))??;

    let locale = requested_locale(&state, query.locale.as_deref(), &headers);
    let mut items =
        join_display(Arc::clone(&state.rulepacks), vec![record], locale).await?;
    let event = items.pop().ok_or(TelemetryError::NotFound)?;
    Ok(Json(LookupResponse { ok: true, event }))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    day: Option<String>,
}

async fn dimension_stats(
    State(state): State<AppState>,
    Path(dimension): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Value>> {
    if !DIMENSIONS.contains(&dimension.as_str()) {
        return Err(TelemetryError::InvalidQuery(format!(
            "unknown dimension {dimension:?}"
        )));
    }
    let day = match query.day {
        Some(day) => {
            keys::parse_day(&day).ok_or_else(|| {
                TelemetryError::InvalidDayRange(format!("bad day {day:?}"))
            })?;
            day
        }
        None => keys::day_bucket(chrono::Utc::now().timestamp_millis()),
    };

    let totals = task::spawn_blocking({
        let store = Arc::clone(&state.store);
        let day = day.clone();
        let dimension = dimension.clone();
        move || store.dimension_totals(&day, &dimension)
    })
    .await
    .map_err(|err| TelemetryError::Storage(err.to_string()))??;

    Ok(Json(json!({
        "ok": true,
        "day": day,
        "dimension": dimension,
        "totals": totals,
    })))
}

async fn domain_rollup(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<Value>> {
    let days = task::spawn_blocking({
        let store = Arc::clone(&state.store);
        let domain = domain.clone();
        move || store.domain_rollup(&domain)
    })
    .await
    .map_err(|err| TelemetryError::Storage(err.to_string()))??;

    Ok(Json(json!({
        "ok": true,
        "domain": domain,
        "days": days,
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
