//! JSON API over the price reconciliation engine: query endpoints for
//! consumers plus trigger/debug endpoints for operators.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use feira_core::PriceQuote;
use feira_sync::{PriceSyncEngine, SyncError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "feira-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PriceSyncEngine>,
}

impl AppState {
    pub fn new(engine: Arc<PriceSyncEngine>) -> Self {
        Self { engine }
    }
}

/// API rendering of a stored quote. Alongside the raw numeric fields it
/// carries pt-BR comma-decimal strings and a display name with the unit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceResponse {
    pub id: String,
    pub product_name: String,
    pub product_full_name: String,
    pub product_unit: Option<String>,
    pub product_unit_kind: Option<String>,
    pub product_unit_kg: Option<f64>,
    pub pack_count: Option<f64>,
    pub price_per_kg: Option<f64>,
    pub market_price: f64,
    pub suggested_price: f64,
    pub date: chrono::NaiveDate,
    pub algorithm_version: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "marketPriceBR")]
    pub market_price_br: String,
    #[serde(rename = "suggestedPriceBR")]
    pub suggested_price_br: String,
    #[serde(rename = "pricePerKgBR")]
    pub price_per_kg_br: Option<String>,
}

impl PriceResponse {
    fn from_quote(quote: &PriceQuote) -> Self {
        let product_full_name = match &quote.product_unit {
            Some(unit) => format!("{} ({unit})", quote.product_name),
            None => quote.product_name.clone(),
        };
        Self {
            id: quote.id.to_string(),
            product_name: quote.product_name.clone(),
            product_full_name,
            product_unit: quote.product_unit.clone(),
            product_unit_kind: quote.unit_kind.clone(),
            product_unit_kg: quote.unit_kg,
            pack_count: quote.pack_count,
            price_per_kg: quote.price_per_kg,
            market_price: quote.market_price,
            suggested_price: quote.suggested_price,
            date: quote.date,
            algorithm_version: quote.algorithm_version.clone(),
            created_at: quote.created_at,
            market_price_br: format_brl(quote.market_price),
            suggested_price_br: format_brl(quote.suggested_price),
            price_per_kg_br: quote.price_per_kg.map(format_brl),
        }
    }
}

/// pt-BR number rendering: dot for thousands, comma for decimals.
pub fn format_brl(value: f64) -> String {
    let negative = value < 0.0;
    let cents = (value.abs() * 100.0).round() as u64;
    let int_part = (cents / 100).to_string();
    let frac = cents % 100;

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(c);
    }
    let sign = if negative { "-" } else { "" };
    format!("{sign}{grouped},{frac:02}")
}

#[derive(Debug, Deserialize, Default)]
struct SyncQuery {
    min: Option<usize>,
    overwrite: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct NameQuery {
    name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PdfQuery {
    url: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/price-recommendations/today", get(list_today_handler))
        .route("/price-recommendations/latest", get(latest_all_handler))
        .route(
            "/price-recommendations/by-name/latest",
            get(latest_by_name_query_handler),
        )
        .route("/price-recommendations/t/sync", post(sync_handler))
        .route(
            "/price-recommendations/t/agrolink",
            get(agrolink_debug_handler),
        )
        .route(
            "/price-recommendations/t/agrolink/sync",
            post(agrolink_sync_handler),
        )
        .route(
            "/price-recommendations/t/extract-pdf-data",
            get(extract_pdf_handler),
        )
        .route(
            "/price-recommendations/{product_name}/latest",
            get(latest_by_name_handler),
        )
        .route(
            "/price-recommendations/{product_name}",
            get(get_by_name_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(engine: Arc<PriceSyncEngine>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("FEIRA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "price api listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

async fn list_today_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.list_today().await {
        Ok(rows) => {
            let data: Vec<_> = rows.iter().map(PriceResponse::from_quote).collect();
            Json(serde_json::json!({ "data": data })).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn latest_all_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.latest_all().await {
        Ok(rows) => {
            let data: Vec<_> = rows.iter().map(PriceResponse::from_quote).collect();
            Json(serde_json::json!({ "count": data.len(), "data": data })).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn latest_by_name_query_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NameQuery>,
) -> Response {
    let Some(name) = query.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "query parameter \"name\" is required" })),
        )
            .into_response();
    };
    if !valid_product_name(name) {
        return invalid_name();
    }
    latest_by_name_response(&state, name).await
}

async fn latest_by_name_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(product_name): AxumPath<String>,
) -> Response {
    if !valid_product_name(&product_name) {
        return invalid_name();
    }
    latest_by_name_response(&state, &product_name).await
}

async fn latest_by_name_response(state: &AppState, name: &str) -> Response {
    match state.engine.latest_by_name(name).await {
        Ok(Some(quote)) => {
            Json(serde_json::json!({ "data": PriceResponse::from_quote(&quote) })).into_response()
        }
        Ok(None) => not_found(),
        Err(err) => server_error(err),
    }
}

async fn get_by_name_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(product_name): AxumPath<String>,
) -> Response {
    if !valid_product_name(&product_name) {
        return invalid_name();
    }
    match state.engine.get_by_name(&product_name).await {
        Ok(Some(quote)) => {
            Json(serde_json::json!({ "data": PriceResponse::from_quote(&quote) })).into_response()
        }
        Ok(None) => not_found(),
        Err(err) => server_error(err),
    }
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Response {
    match state.engine.sync_once(query.min, query.overwrite).await {
        Ok(outcome) => Json(serde_json::json!({
            "ok": true,
            "source": outcome.source,
            "collected": outcome.collected,
            "written": outcome.written,
        }))
        .into_response(),
        Err(err) => sync_error(err),
    }
}

async fn agrolink_debug_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.collect_agrolink().await {
        Ok(items) => Json(serde_json::json!({
            "source": "agrolink",
            "collected": items.len(),
            "items": items,
        }))
        .into_response(),
        Err(err) => sync_error(err),
    }
}

async fn agrolink_sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Response {
    let overwrite = query.overwrite.unwrap_or(false);
    match state.engine.materialize_from_agrolink(overwrite).await {
        Ok(outcome) => Json(serde_json::json!({
            "collected": outcome.collected,
            "written": outcome.written,
            "overwrite": overwrite,
        }))
        .into_response(),
        Err(err) => sync_error(err),
    }
}

async fn extract_pdf_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PdfQuery>,
) -> Response {
    let Some(url) = query.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "query parameter \"url\" is required" })),
        )
            .into_response();
    };
    match state.engine.extract_ama(Some(url)).await {
        Ok(extraction) => Json(extraction).into_response(),
        Err(err) => sync_error(err),
    }
}

/// Names are free text from the source labels: letters, digits, spaces and
/// a little punctuation; at least two characters.
fn valid_product_name(name: &str) -> bool {
    let name = name.trim();
    name.chars().count() >= 2
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c.is_whitespace() || "-.,()'".contains(c))
}

fn invalid_name() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": "invalid product name" })),
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "product not found" })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn sync_error(err: SyncError) -> Response {
    let status = match &err {
        SyncError::AlreadyRunning => StatusCode::CONFLICT,
        SyncError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "sync request failed");
    }
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::{NaiveDate, Utc};
    use feira_collectors::{
        BulletinCollection, BulletinSource, CollectError, WebQuotationItem, WebSource,
    };
    use feira_core::{NewPriceQuote, ALGORITHM_AGROLINK, ALGORITHM_AMA};
    use feira_storage::{MemoryPriceStore, PriceStore};
    use feira_sync::SyncConfig;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct FailingBulletin;
    #[async_trait]
    impl BulletinSource for FailingBulletin {
        fn source_id(&self) -> &'static str {
            "ama"
        }
        async fn collect(&self, _url: Option<&str>) -> Result<BulletinCollection, CollectError> {
            Err(CollectError::Parse("no date token".into()))
        }
    }

    struct FixedWeb(Vec<WebQuotationItem>);
    #[async_trait]
    impl WebSource for FixedWeb {
        fn source_id(&self) -> &'static str {
            "agrolink"
        }
        async fn collect(&self) -> Result<Vec<WebQuotationItem>, CollectError> {
            Ok(self.0.clone())
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            database_url: String::new(),
            artifacts_dir: std::path::PathBuf::from("/tmp/unused"),
            scheduler_enabled: false,
            sync_cron: "0 30 12 * * *".to_string(),
            user_agent: "test".to_string(),
            http_timeout_secs: 5,
            min_items: 10,
            overwrite: false,
            run_deadline_secs: 30,
            ama_listing_url: None,
            agrolink_url: None,
        }
    }

    fn quote(name: &str, alg: &str, price: f64, unit: Option<&str>) -> NewPriceQuote {
        let unit_kg = unit.map(|_| 10.0);
        NewPriceQuote {
            product_name: name.to_string(),
            product_unit: unit.map(str::to_string),
            unit_kind: unit.map(|_| "Cx".to_string()),
            unit_kg,
            pack_count: None,
            price_per_kg: unit_kg.map(|kg| (price / kg * 100.0).round() / 100.0),
            market_price: price,
            suggested_price: price,
            date: NaiveDate::from_ymd_opt(2025, 11, 17).unwrap(),
            algorithm_version: alg.to_string(),
        }
    }

    async fn app_with_store(store: Arc<MemoryPriceStore>) -> Router {
        let engine = PriceSyncEngine::new(
            test_config(),
            store,
            Box::new(FailingBulletin),
            Box::new(FixedWeb(Vec::new())),
        );
        app(AppState::new(Arc::new(engine)))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap();
        (status, value)
    }

    #[test]
    fn brl_formatting() {
        assert_eq!(format_brl(8.5), "8,50");
        assert_eq!(format_brl(0.43), "0,43");
        assert_eq!(format_brl(1250.0), "1.250,00");
        assert_eq!(format_brl(1234567.89), "1.234.567,89");
        assert_eq!(format_brl(-3.2), "-3,20");
    }

    #[tokio::test]
    async fn latest_endpoint_prefers_bulletin_source() {
        let store = Arc::new(MemoryPriceStore::new());
        store
            .insert_skip_duplicates(&[
                quote("TOMATE", ALGORITHM_AGROLINK, 9.0, None),
                quote("TOMATE", ALGORITHM_AMA, 8.5, None),
            ])
            .await
            .unwrap();

        let app = app_with_store(store).await;
        let (status, body) = get_json(app, "/price-recommendations/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["algorithmVersion"], ALGORITHM_AMA);
        assert_eq!(body["data"][0]["marketPriceBR"], "8,50");
    }

    #[tokio::test]
    async fn by_name_latest_returns_formatted_record() {
        let store = Arc::new(MemoryPriceStore::new());
        store
            .insert_skip_duplicates(&[quote(
                "ALHO COMUM",
                ALGORITHM_AGROLINK,
                62.80,
                Some("Cx 10 Kg"),
            )])
            .await
            .unwrap();

        let app = app_with_store(store).await;
        let (status, body) =
            get_json(app, "/price-recommendations/by-name/latest?name=alho%20comum").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["productFullName"], "ALHO COMUM (Cx 10 Kg)");
        assert_eq!(body["data"]["pricePerKgBR"], "6,28");
    }

    #[tokio::test]
    async fn by_name_latest_requires_name_param() {
        let app = app_with_store(Arc::new(MemoryPriceStore::new())).await;
        let (status, body) = get_json(app, "/price-recommendations/by-name/latest").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn degenerate_product_name_is_400() {
        let app = app_with_store(Arc::new(MemoryPriceStore::new())).await;
        let (status, _body) = get_json(app, "/price-recommendations/a/latest").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn extract_pdf_requires_url_param() {
        let app = app_with_store(Arc::new(MemoryPriceStore::new())).await;
        let (status, body) =
            get_json(app, "/price-recommendations/t/extract-pdf-data").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn unknown_product_is_404() {
        let app = app_with_store(Arc::new(MemoryPriceStore::new())).await;
        let (status, _body) = get_json(app, "/price-recommendations/nada/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_endpoint_reports_fallback_source() {
        let store = Arc::new(MemoryPriceStore::new());
        let engine = PriceSyncEngine::new(
            test_config(),
            store,
            Box::new(FailingBulletin),
            Box::new(FixedWeb(vec![WebQuotationItem {
                raw_label: "Tomate".to_string(),
                name: "Tomate".to_string(),
                unit: None,
                location: "Juazeiro".to_string(),
                price_text: "8,50".to_string(),
                date_text: "17/11/2025".to_string(),
            }])),
        );
        let app = app(AppState::new(Arc::new(engine)));

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/price-recommendations/t/sync?min=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["source"], "AGROLINK");
        assert_eq!(value["collected"], 1);
        assert_eq!(value["written"], 1);
    }

    #[tokio::test]
    async fn today_endpoint_lists_current_date_only() {
        let store = Arc::new(MemoryPriceStore::new());
        let mut today_quote = quote("TOMATE", ALGORITHM_AMA, 8.5, None);
        today_quote.date = Utc::now().date_naive();
        store
            .insert_skip_duplicates(&[
                today_quote,
                quote("CEBOLA", ALGORITHM_AMA, 4.0, None),
            ])
            .await
            .unwrap();

        let app = app_with_store(store).await;
        let (status, body) = get_json(app, "/price-recommendations/today").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["productName"], "TOMATE");
    }
}
