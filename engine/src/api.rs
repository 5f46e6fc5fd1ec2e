use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use errors::{ApiError, Error, ErrorKind, Result};
use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use common::interface::{LogStorage, ScraperStorage};
use common::model::{
    CreateScraperRequest, EnqueueRequest, Priority, Schedule, Scraper, ScraperConfig,
    SearchFilters,
};
use queue::Queue;

/// JSON-RPC entry point for the API layer and the UI, mounted at
/// `/api/v1/jsonrpc`.
#[derive(Clone)]
pub struct ApiState {
    pub scrapers: Arc<dyn ScraperStorage>,
    pub queue: Arc<Queue>,
    pub logs: Arc<dyn LogStorage>,
    pub handler_names: Vec<String>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/jsonrpc", post(handle_rpc))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

async fn handle_rpc(State(state): State<ApiState>, Json(request): Json<RpcRequest>) -> Json<Value> {
    debug!("rpc call: {}", request.method);
    let outcome = dispatch(&state, &request.method, request.params).await;
    Json(match outcome {
        Ok(result) => json!({
            "jsonrpc": "2.0",
            "result": result,
            "id": request.id,
        }),
        Err(e) => json!({
            "jsonrpc": "2.0",
            "error": {
                "code": error_code(&e),
                "message": e.to_string(),
            },
            "id": request.id,
        }),
    })
}

/// Stable error codes, kept compatible with what the UI already expects.
fn error_code(error: &Error) -> i64 {
    match error.kind() {
        ErrorKind::NotFound => 5000,
        ErrorKind::ReadOnly => 5001,
        ErrorKind::Validation => 10005,
        ErrorKind::Queue if error.is_task_active() => 10000,
        ErrorKind::Queue => 10001,
        ErrorKind::Api if error.is_method_not_found() => -32601,
        ErrorKind::Api => -32602,
        _ => -32603,
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| ApiError::InvalidParams(e.to_string()).into())
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
struct TaskIdParams {
    task_id: u64,
}

#[derive(Debug, Deserialize)]
struct TaskNameParams {
    task_name: String,
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    scraper: CreateScraperRequest,
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    scraper: Scraper,
}

#[derive(Debug, Deserialize)]
struct EnqueueParams {
    scraper_id: Uuid,
    priority: Priority,
}

#[derive(Debug, Deserialize)]
struct TaskLogsParams {
    task_id: u64,
    #[serde(default)]
    last_log_line_id: Option<u64>,
    #[serde(default)]
    max_lines: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EphemeralTask {
    handler: String,
    #[serde(default)]
    config: ScraperConfig,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RunEphemeralParams {
    task: EphemeralTask,
    priority: Priority,
}

async fn dispatch(state: &ApiState, method: &str, params: Value) -> Result<Value> {
    match method {
        "get_scrapers" => {
            let scrapers = state.scrapers.list().await?;
            Ok(serde_json::to_value(scrapers)?)
        }
        "get_scraper" => {
            let params: IdParams = parse_params(params)?;
            Ok(serde_json::to_value(state.scrapers.get(params.id).await?)?)
        }
        "create_scraper" => {
            let params: CreateParams = parse_params(params)?;
            let scraper = params.scraper.into_scraper();
            validate_scraper(state, &scraper)?;
            Ok(serde_json::to_value(state.scrapers.create(scraper).await?)?)
        }
        "update_scraper" => {
            let params: UpdateParams = parse_params(params)?;
            validate_scraper(state, &params.scraper)?;
            Ok(serde_json::to_value(
                state.scrapers.update(params.scraper).await?,
            )?)
        }
        "delete_scraper" => {
            let params: IdParams = parse_params(params)?;
            Ok(serde_json::to_value(
                state.scrapers.delete(params.id).await?,
            )?)
        }
        "search_scrapers" => {
            let filters: SearchFilters = parse_params(params)?;
            Ok(serde_json::to_value(
                state.scrapers.search(&filters).await?,
            )?)
        }
        "is_read_only" => Ok(Value::Bool(state.scrapers.is_read_only())),
        "get_scraper_handlers" => Ok(serde_json::to_value(&state.handler_names)?),
        "get_schedules" => Ok(serde_json::to_value(
            Schedule::all().iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        )?),
        "get_priorities" => Ok(serde_json::to_value(
            Priority::all().iter().map(|p| p.suffix()).collect::<Vec<_>>(),
        )?),
        "enqueue_scraper" => {
            let params: EnqueueParams = parse_params(params)?;
            let scraper = state.scrapers.get(params.scraper_id).await?;
            let task = state
                .queue
                .enqueue(EnqueueRequest {
                    scraper_id: Some(scraper.id),
                    handler: scraper.handler.clone(),
                    config: scraper.config.clone(),
                    priority: params.priority,
                    timeout_seconds: scraper.timeout_seconds,
                })
                .await?;
            Ok(serde_json::to_value(task)?)
        }
        "get_task_instances" => {
            let params: TaskNameParams = parse_params(params)?;
            Ok(serde_json::to_value(
                state.queue.list_by_scraper(&params.task_name).await?,
            )?)
        }
        "get_task_instance" => {
            let params: TaskIdParams = parse_params(params)?;
            Ok(serde_json::to_value(
                state.queue.get_task(params.task_id).await?,
            )?)
        }
        "get_task_logs" => {
            let params: TaskLogsParams = parse_params(params)?;
            let lines = state
                .logs
                .read(
                    params.task_id,
                    params.last_log_line_id,
                    params.max_lines.unwrap_or(100),
                )
                .await?;
            Ok(serde_json::to_value(lines)?)
        }
        "run_ephemeral" => {
            let params: RunEphemeralParams = parse_params(params)?;
            if !state.handler_names.contains(&params.task.handler) {
                return Err(Error::validation(format!(
                    "unknown scraper handler '{}'",
                    params.task.handler
                )));
            }
            let task = state
                .queue
                .enqueue(EnqueueRequest {
                    scraper_id: None,
                    handler: params.task.handler,
                    config: params.task.config,
                    priority: params.priority,
                    timeout_seconds: params.task.timeout_seconds,
                })
                .await?;
            Ok(serde_json::to_value(task)?)
        }
        "kill_task" => {
            let params: TaskIdParams = parse_params(params)?;
            Ok(serde_json::to_value(state.queue.kill(params.task_id).await?)?)
        }
        other => Err(ApiError::MethodNotFound(other.to_string()).into()),
    }
}

fn validate_scraper(state: &ApiState, scraper: &Scraper) -> Result<()> {
    scraper.validate()?;
    if !state.handler_names.contains(&scraper.handler) {
        return Err(Error::validation(format!(
            "unknown scraper handler '{}'",
            scraper.handler
        )));
    }
    Ok(())
}
