use std::time::Duration;

use axum::http::StatusCode;
use axum::{
    extract::{Path, Query},
    routing::{get, post},
    Extension, Json, Router,
};
use cinder_types::{Task, TaskStatus, VmRecord};
use serde::Deserialize;

use super::service;
use crate::core::error::ExecutorError;
use crate::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/:id", get(describe_task))
        .route("/tasks/:id/prepare", post(prepare_task))
        .route("/tasks/:id/start", post(start_task))
        .route("/tasks/:id/status", get(wait_task))
        .route("/tasks/:id/stop", post(stop_task))
        .route("/tasks/:id/remove", post(remove_task))
        .route("/tasks/:id/logs", get(task_logs))
}

#[derive(Deserialize)]
struct StopReq {
    timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

#[derive(Deserialize)]
struct OpQuery {
    /// Overall deadline for the operation. Exceeding it drops the in-flight
    /// work, which fires its rollback path.
    deadline_secs: Option<u64>,
}

async fn prepare_task(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
    Query(op): Query<OpQuery>,
    Json(mut task): Json<Task>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    check_id(&id, &task)?;
    let status = deadline_bounded(op.deadline_secs, "prepare", service::prepare(&st, &mut task))
        .await
        .map_err(reject)?;
    // The mutated task goes back to the orchestrator so the rootfs
    // annotation survives into the start call.
    Ok(Json(serde_json::json!({"task": task, "status": status})))
}

async fn start_task(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
    Query(op): Query<OpQuery>,
    Json(task): Json<Task>,
) -> Result<Json<TaskStatus>, (StatusCode, String)> {
    check_id(&id, &task)?;
    let status = deadline_bounded(op.deadline_secs, "start", service::start(&st, &task))
        .await
        .map_err(reject)?;
    Ok(Json(status))
}

async fn deadline_bounded<T>(
    deadline_secs: Option<u64>,
    op: &str,
    fut: impl std::future::Future<Output = Result<T, ExecutorError>>,
) -> Result<T, ExecutorError> {
    match deadline_secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), fut)
            .await
            .map_err(|_| {
                ExecutorError::Cancelled(format!("{op} abandoned after {secs}s deadline"))
            })?,
        None => fut.await,
    }
}

async fn wait_task(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
) -> Json<TaskStatus> {
    Json(service::wait(&st, &id).await)
}

async fn stop_task(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
    body: Option<Json<StopReq>>,
) -> Result<Json<TaskStatus>, (StatusCode, String)> {
    let timeout = body
        .and_then(|Json(req)| req.timeout_secs)
        .map(Duration::from_secs);
    let status = service::stop(&st, &id, timeout).await.map_err(reject)?;
    Ok(Json(status))
}

async fn remove_task(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
) -> Json<TaskStatus> {
    Json(service::remove(&st, &id).await)
}

async fn describe_task(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
) -> Json<TaskStatus> {
    Json(service::describe(&st, &id).await)
}

async fn list_tasks(Extension(st): Extension<AppState>) -> Json<Vec<VmRecord>> {
    Json(st.store.list().await)
}

async fn task_logs(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<String, (StatusCode, String)> {
    let tail = query.tail.unwrap_or(200);
    service::logs(&st, &id, tail).await.map_err(reject)
}

fn check_id(path_id: &str, task: &Task) -> Result<(), (StatusCode, String)> {
    if path_id != task.id {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("path id {path_id} does not match task id {}", task.id),
        ));
    }
    Ok(())
}

fn reject(err: ExecutorError) -> (StatusCode, String) {
    let status = match &err {
        ExecutorError::InvalidTask(_) => StatusCode::BAD_REQUEST,
        ExecutorError::VmNotFound(_) => StatusCode::NOT_FOUND,
        ExecutorError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_types::ContainerSpec;

    #[test]
    fn mismatched_ids_are_rejected() {
        let task = Task {
            id: "t1".into(),
            service_id: "svc".into(),
            node_id: "node".into(),
            runtime: Some(ContainerSpec {
                image: "alpine".into(),
                command: vec![],
                args: vec![],
                env: vec![],
                mounts: vec![],
            }),
            resources: Default::default(),
            networks: vec![],
            annotations: None,
        };
        assert!(check_id("t1", &task).is_ok());
        assert_eq!(
            check_id("t2", &task).unwrap_err().0,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(
            reject(ExecutorError::InvalidTask("x".into())).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            reject(ExecutorError::VmNotFound("x".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            reject(ExecutorError::Timeout("x".into())).0,
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            reject(ExecutorError::Cancelled("x".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            reject(ExecutorError::VmmSpawn("x".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn deadlines_cancel_slow_operations() {
        let err = deadline_bounded(Some(0), "start", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled(_)));

        let ok = deadline_bounded(None, "start", async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
    }
}
