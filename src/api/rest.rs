// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Thin handlers: parse, delegate to the owning component, serialise. Domain
// failures surface through `CoreError`'s response mapping as
// `{"success": false, "error": ...}` with the matching status code.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::errors::CoreError;
use crate::ingest::StartSyncRequest;
use crate::ledger::{CreatePortfolioRequest, RecordEventRequest};
use crate::market::Timeframe;
use crate::realtime::clock;

const DEFAULT_EVENT_LIMIT: usize = 50;
const DEFAULT_BAR_LIMIT: usize = 100;
const DEFAULT_INDICATOR_LIMIT: usize = 100;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS and request tracing.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health ──────────────────────────────────────────────────
        .route("/health", get(health))
        // ── Ledger ──────────────────────────────────────────────────
        .route("/portfolios", post(create_portfolio))
        .route("/portfolios/:id", get(get_portfolio))
        .route("/events", post(record_event))
        .route("/portfolios/:id/events", get(list_events))
        .route("/portfolios/:id/events/:symbol", get(list_events_by_symbol))
        .route("/portfolios/:id/positions", get(list_positions))
        .route("/portfolios/:id/positions/:symbol", get(get_position))
        .route("/portfolios/:id/positions/:symbol/pnl", get(position_pnl))
        .route("/portfolios/:id/realized-pnl", get(list_realized))
        // ── Market data ─────────────────────────────────────────────
        .route("/stocks/:symbol/ohlcv", get(get_ohlcv))
        .route("/stocks/:symbol/corporate-actions", get(corporate_actions))
        // ── Indicators ──────────────────────────────────────────────
        .route("/indicators/:symbol/ma", get(indicator_ma))
        .route("/indicators/:symbol/rsi", get(indicator_rsi))
        .route("/indicators/:symbol/macd", get(indicator_macd))
        .route("/indicators/:symbol/bb", get(indicator_bb))
        .route("/indicators/:symbol/kdj", get(indicator_kdj))
        .route("/indicators/:symbol/batch", post(indicator_batch))
        .route("/indicators/:symbol/cache", delete(indicator_clear))
        // ── Bulk sync ───────────────────────────────────────────────
        .route("/market/bulk-sync/status", get(bulk_sync_status))
        .route("/market/bulk-sync/info", get(bulk_sync_info))
        .route("/market/bulk-sync/start", post(bulk_sync_start))
        .route("/market/bulk-sync/stop", post(bulk_sync_stop))
        // ── Realtime ────────────────────────────────────────────────
        .route("/market/status", get(market_status))
        .route("/realtime", get(realtime_batch))
        .route("/realtime/:symbol", get(realtime_single))
        .route("/ws/realtime", get(crate::api::ws::ws_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().to_rfc3339(),
    }))
}

// =============================================================================
// Ledger
// =============================================================================

async fn create_portfolio(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePortfolioRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let portfolio = state.ledger.create_portfolio(&req)?;
    Ok((StatusCode::CREATED, Json(portfolio)))
}

async fn get_portfolio(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    Ok(Json(state.ledger.get_portfolio(&id)?))
}

async fn record_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordEventRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let event = state.ledger.record_event(&req)?;
    Ok((StatusCode::CREATED, Json(event)))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let events = state
        .ledger
        .list_events(&id, query.limit.unwrap_or(DEFAULT_EVENT_LIMIT))?;
    Ok(Json(events))
}

async fn list_events_by_symbol(
    State(state): State<Arc<AppState>>,
    Path((id, symbol)): Path<(String, String)>,
) -> Result<impl IntoResponse, CoreError> {
    Ok(Json(state.ledger.list_events_by_symbol(&id, &symbol)?))
}

async fn list_positions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    Ok(Json(state.ledger.list_positions(&id)?))
}

async fn get_position(
    State(state): State<Arc<AppState>>,
    Path((id, symbol)): Path<(String, String)>,
) -> Result<impl IntoResponse, CoreError> {
    Ok(Json(state.ledger.get_position(&id, &symbol)?))
}

#[derive(Deserialize)]
struct PnlQuery {
    current_price: Decimal,
}

async fn position_pnl(
    State(state): State<Arc<AppState>>,
    Path((id, symbol)): Path<(String, String)>,
    Query(query): Query<PnlQuery>,
) -> Result<impl IntoResponse, CoreError> {
    Ok(Json(state.ledger.unrealized_pnl(
        &id,
        &symbol,
        query.current_price,
    )?))
}

#[derive(Deserialize)]
struct RealizedQuery {
    symbol: Option<String>,
}

async fn list_realized(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RealizedQuery>,
) -> Result<impl IntoResponse, CoreError> {
    Ok(Json(
        state.ledger.list_realized(&id, query.symbol.as_deref())?,
    ))
}

// =============================================================================
// Market data
// =============================================================================

#[derive(Deserialize)]
struct OhlcvQuery {
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
    timeframe: Option<String>,
}

fn parse_query_date(raw: &Option<String>, name: &str) -> Result<Option<NaiveDate>, CoreError> {
    match raw {
        None => Ok(None),
        Some(s) => s.parse::<NaiveDate>().map(Some).map_err(|_| {
            CoreError::validation(format!("unparsable {name} date '{s}': expected YYYY-MM-DD"))
        }),
    }
}

async fn get_ohlcv(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<OhlcvQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let from = parse_query_date(&query.from, "from")?;
    let to = parse_query_date(&query.to, "to")?;
    let timeframe = match &query.timeframe {
        Some(raw) => Timeframe::parse(raw)?,
        None => Timeframe::Daily,
    };

    let bars = state.market.get_bars(
        &symbol,
        from,
        to,
        query.limit.unwrap_or(DEFAULT_BAR_LIMIT),
        timeframe,
    )?;
    Ok(Json(bars))
}

async fn corporate_actions(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    Ok(Json(state.market.list_corporate_actions(&symbol)?))
}

// =============================================================================
// Indicators
// =============================================================================

#[derive(Deserialize)]
struct MaQuery {
    period: Option<usize>,
    #[serde(rename = "type")]
    ma_type: Option<String>,
    limit: Option<usize>,
}

async fn indicator_ma(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<MaQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let ma_type = match &query.ma_type {
        Some(raw) => crate::indicators::MaType::parse(raw)?,
        None => crate::indicators::MaType::Sma,
    };
    let points = state.indicators.moving_average(
        &symbol,
        query.period.unwrap_or(20),
        ma_type,
        query.limit.unwrap_or(DEFAULT_INDICATOR_LIMIT),
    )?;
    Ok(Json(points))
}

#[derive(Deserialize)]
struct PeriodQuery {
    period: Option<usize>,
    limit: Option<usize>,
}

async fn indicator_rsi(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<PeriodQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let points = state.indicators.rsi(
        &symbol,
        query.period.unwrap_or(14),
        query.limit.unwrap_or(DEFAULT_INDICATOR_LIMIT),
    )?;
    Ok(Json(points))
}

#[derive(Deserialize)]
struct MacdQuery {
    fast: Option<usize>,
    slow: Option<usize>,
    signal: Option<usize>,
    limit: Option<usize>,
}

async fn indicator_macd(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<MacdQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let points = state.indicators.macd(
        &symbol,
        query.fast.unwrap_or(12),
        query.slow.unwrap_or(26),
        query.signal.unwrap_or(9),
        query.limit.unwrap_or(DEFAULT_INDICATOR_LIMIT),
    )?;
    Ok(Json(points))
}

#[derive(Deserialize)]
struct BbQuery {
    period: Option<usize>,
    stddev: Option<f64>,
    limit: Option<usize>,
}

async fn indicator_bb(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<BbQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let points = state.indicators.bollinger(
        &symbol,
        query.period.unwrap_or(20),
        query.stddev.unwrap_or(2.0),
        query.limit.unwrap_or(DEFAULT_INDICATOR_LIMIT),
    )?;
    Ok(Json(points))
}

async fn indicator_kdj(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<PeriodQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let points = state.indicators.kdj(
        &symbol,
        query.period.unwrap_or(9),
        query.limit.unwrap_or(DEFAULT_INDICATOR_LIMIT),
    )?;
    Ok(Json(points))
}

#[derive(Deserialize)]
struct BatchRequest {
    indicators: Vec<String>,
    #[serde(default)]
    params: Option<Value>,
    limit: Option<usize>,
}

async fn indicator_batch(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Json(req): Json<BatchRequest>,
) -> Result<impl IntoResponse, CoreError> {
    if req.indicators.is_empty() {
        return Err(CoreError::validation("indicators list must not be empty"));
    }
    let params = req.params.unwrap_or_else(|| serde_json::json!({}));
    let out = state.indicators.batch(
        &symbol,
        &req.indicators,
        &params,
        req.limit.unwrap_or(DEFAULT_INDICATOR_LIMIT),
    )?;
    Ok(Json(out))
}

async fn indicator_clear(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    let removed = state.indicators.clear(&symbol)?;
    Ok(Json(serde_json::json!({ "cleared": removed })))
}

// =============================================================================
// Bulk sync
// =============================================================================

async fn bulk_sync_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.bulk_sync.status())
}

async fn bulk_sync_info(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, CoreError> {
    Ok(Json(state.bulk_sync.sync_info()?))
}

#[derive(Deserialize)]
struct StartSyncBody {
    start_date: String,
    end_date: String,
    #[serde(default)]
    skip_synced: Option<bool>,
    #[serde(default)]
    portfolio_id: Option<String>,
    #[serde(default)]
    priority_holdings: Option<bool>,
}

async fn bulk_sync_start(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartSyncBody>,
) -> Result<impl IntoResponse, CoreError> {
    let start_date = body.start_date.parse::<NaiveDate>().map_err(|_| {
        CoreError::validation(format!("unparsable start_date '{}'", body.start_date))
    })?;
    let end_date = body
        .end_date
        .parse::<NaiveDate>()
        .map_err(|_| CoreError::validation(format!("unparsable end_date '{}'", body.end_date)))?;

    state.bulk_sync.start(StartSyncRequest {
        start_date,
        end_date,
        skip_synced: body.skip_synced.unwrap_or(true),
        portfolio_id: body.portfolio_id,
        priority_holdings: body.priority_holdings,
    })?;

    Ok((StatusCode::ACCEPTED, Json(state.bulk_sync.status())))
}

async fn bulk_sync_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.bulk_sync.stop();
    (StatusCode::ACCEPTED, Json(state.bulk_sync.status()))
}

// =============================================================================
// Realtime
// =============================================================================

async fn market_status() -> impl IntoResponse {
    Json(clock::current_market_status())
}

async fn realtime_single(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    Ok(Json(state.realtime.get_quote(&symbol).await?))
}

#[derive(Deserialize)]
struct BatchQuotesQuery {
    symbols: String,
}

async fn realtime_batch(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BatchQuotesQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let symbols: Vec<String> = query
        .symbols
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if symbols.is_empty() {
        return Err(CoreError::validation("symbols must not be empty"));
    }

    Ok(Json(state.realtime.get_batch_quotes(&symbols).await?))
}
