//! REST API endpoints for the PriceGateway
//!
//! Read endpoints serve current prices to display and billing. Admin
//! endpoints edit pricing variables and the engine config; changes take
//! effect at the engine's next tick.

use pricing_engine::{
    AdminService, EngineConfigUpdate, OpportunityId, PriceQuery, PricingEngine, PricingError,
    VariableUpdate,
};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::Filter;

use crate::messages::{SnapshotData, SnapshotEntry};

/// Rejection carrying a ready-made error body
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl warp::reject::Reject for ApiError {}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
    pub timestamp: String,
}

/// Error detail
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

fn reject(err: PricingError) -> warp::Rejection {
    let (status, code, details) = match &err {
        PricingError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_FAILED", None),
        PricingError::OpportunityNotFound(id) => (
            StatusCode::NOT_FOUND,
            "OPPORTUNITY_NOT_FOUND",
            Some(serde_json::json!({ "opportunity_id": id })),
        ),
        _ => {
            tracing::error!("Request failed: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None)
        }
    };

    warp::reject::custom(ApiError {
        status,
        body: ErrorResponse {
            error: ErrorDetail { code: code.to_string(), message: err.to_string(), details },
            timestamp: chrono::Utc::now().to_rfc3339(),
        },
    })
}

async fn get_prices(prices: Arc<dyn PriceQuery>) -> Result<impl warp::Reply, warp::Rejection> {
    let states = prices.all_prices().await.map_err(reject)?;
    let entries: Vec<SnapshotEntry> = states.iter().map(SnapshotEntry::from).collect();
    Ok(warp::reply::json(&entries))
}

async fn get_snapshot(prices: Arc<dyn PriceQuery>) -> Result<impl warp::Reply, warp::Rejection> {
    let snapshot = prices.snapshot().await.map_err(reject)?;
    Ok(warp::reply::json(&SnapshotData::from(&snapshot)))
}

async fn get_price(
    opportunity_id: OpportunityId,
    prices: Arc<dyn PriceQuery>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let state = prices.price(opportunity_id).await.map_err(reject)?;
    Ok(warp::reply::json(&state))
}

async fn list_variables(admin: Arc<AdminService>) -> Result<impl warp::Reply, warp::Rejection> {
    let variables = admin.list_variables().await.map_err(reject)?;
    Ok(warp::reply::json(&variables))
}

async fn put_variable(
    name: String,
    update: VariableUpdate,
    admin: Arc<AdminService>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let variable = admin.upsert_variable(&name, update).await.map_err(reject)?;
    Ok(warp::reply::json(&variable))
}

async fn get_engine_config(admin: Arc<AdminService>) -> Result<impl warp::Reply, warp::Rejection> {
    let config = admin.engine_config().await.map_err(reject)?;
    Ok(warp::reply::json(&config))
}

async fn put_engine_config(
    update: EngineConfigUpdate,
    admin: Arc<AdminService>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let config = admin.update_engine_config(update).await.map_err(reject)?;
    Ok(warp::reply::json(&config))
}

/// Turn rejections into JSON error bodies
pub async fn handle_rejection(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
    let (status, body) = if let Some(api_error) = err.find::<ApiError>() {
        (api_error.status, serde_json::to_value(&api_error.body).unwrap_or_default())
    } else {
        let (status, code) = if err.is_not_found() {
            (StatusCode::NOT_FOUND, "NOT_FOUND")
        } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
            (StatusCode::BAD_REQUEST, "INVALID_BODY")
        } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
            (StatusCode::METHOD_NOT_ALLOWED, "METHOD_NOT_ALLOWED")
        } else {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
        };
        let body = serde_json::json!({
            "error": { "code": code, "message": format!("{err:?}"), "details": null },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        (status, body)
    };

    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

pub fn create_routes(
    engine: Arc<PricingEngine>,
    admin: Arc<AdminService>,
) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
    let metrics_engine = engine.clone();
    let prices: Arc<dyn PriceQuery> = engine;
    let prices_filter = warp::any().map(move || prices.clone());
    let admin_filter = warp::any().map(move || admin.clone());

    // All prices, closed opportunities included
    let all_prices = warp::path("api")
        .and(warp::path("prices"))
        .and(warp::path::end())
        .and(warp::get())
        .and(prices_filter.clone())
        .and_then(get_prices);

    // Open prices tagged with the last completed tick
    let snapshot = warp::path("api")
        .and(warp::path("prices"))
        .and(warp::path("snapshot"))
        .and(warp::path::end())
        .and(warp::get())
        .and(prices_filter.clone())
        .and_then(get_snapshot);

    let single_price = warp::path("api")
        .and(warp::path("prices"))
        .and(warp::path::param::<OpportunityId>())
        .and(warp::path::end())
        .and(warp::get())
        .and(prices_filter)
        .and_then(get_price);

    let variables = warp::path("api")
        .and(warp::path("admin"))
        .and(warp::path("variables"))
        .and(warp::path::end())
        .and(warp::get())
        .and(admin_filter.clone())
        .and_then(list_variables);

    let upsert_variable = warp::path("api")
        .and(warp::path("admin"))
        .and(warp::path("variables"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::put())
        .and(warp::body::json::<VariableUpdate>())
        .and(admin_filter.clone())
        .and_then(put_variable);

    let engine_config = warp::path("api")
        .and(warp::path("admin"))
        .and(warp::path("engine-config"))
        .and(warp::path::end())
        .and(warp::get())
        .and(admin_filter.clone())
        .and_then(get_engine_config);

    let update_engine_config = warp::path("api")
        .and(warp::path("admin"))
        .and(warp::path("engine-config"))
        .and(warp::path::end())
        .and(warp::put())
        .and(warp::body::json::<EngineConfigUpdate>())
        .and(admin_filter)
        .and_then(put_engine_config);

    let engine_metrics = warp::path("api")
        .and(warp::path("engine"))
        .and(warp::path("metrics"))
        .and(warp::path::end())
        .and(warp::get())
        .map(move || warp::reply::json(&metrics_engine.metrics()));

    // Health check endpoint
    let health = warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    });

    all_prices
        .or(snapshot)
        .or(single_price)
        .or(variables)
        .or(upsert_variable)
        .or(engine_config)
        .or(update_engine_config)
        .or(engine_metrics)
        .or(health)
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_headers(vec!["content-type"])
                .allow_methods(vec!["GET", "PUT", "OPTIONS"]),
        )
        .recover(handle_rejection)
}
