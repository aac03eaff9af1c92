use actix_web::http::StatusCode;
use actix_web::{delete, get, post, web, HttpResponse, Responder, Result as ActixResult};
use actix_ws::Message;
use relaycore::{NodeId, RelayError, Workflow, WorkflowError, WorkflowId};
use relayruntime::{NodeRegistry, RelayRuntime, RunOutcome, RunReport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Application state shared across handlers
pub struct AppState {
    pub runtime: Arc<RelayRuntime>,
    pub registry: Arc<NodeRegistry>,
}

/// Request body for workflow execution
#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Serialize)]
struct WorkflowResponse {
    id: WorkflowId,
    execution_order: Vec<NodeId>,
    message: String,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    workflow_id: WorkflowId,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    workflow_id: WorkflowId,
    success: bool,
    status: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn not_found(what: impl std::fmt::Display) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorResponse {
        error: format!("{} not found", what),
    })
}

fn status_for(err: &RelayError) -> StatusCode {
    match err {
        RelayError::AlreadyRunning(_) => StatusCode::CONFLICT,
        RelayError::StateNotFound(_)
        | RelayError::Workflow(WorkflowError::NotFound(_))
        | RelayError::Workflow(WorkflowError::NodeNotFound(_)) => StatusCode::NOT_FOUND,
        RelayError::Workflow(_) | RelayError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn report_response(result: Result<RunOutcome, RelayError>) -> HttpResponse {
    let report = RunReport::from_result(&result);
    match &result {
        Ok(_) => HttpResponse::Ok().json(report),
        Err(e) => HttpResponse::build(status_for(e)).json(report),
    }
}

/// Run `op` inline when `wait` is set, otherwise on a background task with a
/// `202 Accepted` answer.
async fn launch<F, Fut>(
    data: &AppState,
    workflow_id: WorkflowId,
    wait: bool,
    op: F,
) -> HttpResponse
where
    F: FnOnce(Arc<RelayRuntime>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<RunOutcome, RelayError>> + Send + 'static,
{
    if data.runtime.workflow(workflow_id).await.is_none() {
        return not_found(format!("Workflow {}", workflow_id));
    }
    let runtime = data.runtime.clone();

    if wait {
        return report_response(op(runtime).await);
    }

    if runtime.is_running(workflow_id) {
        return HttpResponse::Conflict().json(ErrorResponse {
            error: RelayError::AlreadyRunning(workflow_id).to_string(),
        });
    }
    tokio::spawn(async move {
        match op(runtime).await {
            Ok(outcome) => info!("Workflow {} finished: {}", workflow_id, outcome.status()),
            Err(e) => error!("Workflow {} run failed: {}", workflow_id, e),
        }
    });

    HttpResponse::Accepted().json(AcceptedResponse {
        workflow_id,
        status: "accepted",
    })
}

fn control_response(data: &AppState, workflow_id: WorkflowId, success: bool) -> HttpResponse {
    let status = data.runtime.state(workflow_id).map(|s| s.status.to_string());
    let body = ControlResponse {
        workflow_id,
        success,
        status,
    };
    if success {
        HttpResponse::Ok().json(body)
    } else if body.status.is_none() {
        HttpResponse::NotFound().json(body)
    } else {
        HttpResponse::Conflict().json(body)
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "relay",
        "active_runs": data.runtime.active_workflows().len(),
    }))
}

/// List all workflows
#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let workflow_list: Vec<_> = data
        .runtime
        .list_workflows()
        .await
        .into_iter()
        .map(|w| {
            let status = data.runtime.state(w.id).map(|s| s.status);
            serde_json::json!({
                "id": w.id,
                "name": w.name,
                "description": w.description,
                "nodes": w.nodes.len(),
                "edges": w.edges.len(),
                "status": status,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(workflow_list))
}

/// Register a new workflow
#[post("/api/workflows")]
async fn create_workflow(
    data: web::Data<AppState>,
    workflow: web::Json<Workflow>,
) -> ActixResult<impl Responder> {
    let workflow = workflow.into_inner();
    let workflow_id = workflow.id;

    if let Err(e) = data.registry.validate(&workflow) {
        warn!("Rejected workflow {}: {}", workflow_id, e);
        return Ok(HttpResponse::BadRequest().json(ErrorResponse {
            error: e.to_string(),
        }));
    }

    info!("Creating workflow: {} ({})", workflow.name, workflow_id);
    match data.runtime.register_workflow(workflow).await {
        Ok(execution_order) => Ok(HttpResponse::Created().json(WorkflowResponse {
            id: workflow_id,
            execution_order,
            message: "Workflow created successfully".to_string(),
        })),
        Err(e) => Ok(HttpResponse::build(status_for(&e)).json(ErrorResponse {
            error: e.to_string(),
        })),
    }
}

#[get("/api/workflows/{id}")]
async fn get_workflow(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    match data.runtime.workflow(workflow_id).await {
        Some(workflow) => Ok(HttpResponse::Ok().json(workflow)),
        None => Ok(not_found(format!("Workflow {}", workflow_id))),
    }
}

/// Delete a workflow along with its state and checkpoints
#[delete("/api/workflows/{id}")]
async fn delete_workflow(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    if data.runtime.remove_workflow(workflow_id).await {
        info!("Deleted workflow: {}", workflow_id);
        Ok(HttpResponse::Ok().json(serde_json::json!({
            "message": "Workflow deleted successfully"
        })))
    } else {
        Ok(not_found(format!("Workflow {}", workflow_id)))
    }
}

/// Start a run from scratch
#[post("/api/workflows/{id}/execute")]
async fn execute_workflow(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
    query: web::Query<RunQuery>,
    req: Option<web::Json<ExecuteRequest>>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    let input = req.map(|r| r.into_inner().input).unwrap_or_default();

    info!("Executing workflow: {}", workflow_id);
    Ok(launch(&data, workflow_id, query.wait, move |runtime| async move {
        runtime.execute(workflow_id, input).await
    })
    .await)
}

#[post("/api/workflows/{id}/stop")]
async fn stop_workflow(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    let stopped = data.runtime.stop(workflow_id);
    Ok(control_response(&data, workflow_id, stopped))
}

#[post("/api/workflows/{id}/pause")]
async fn pause_workflow(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    let paused = data.runtime.pause(workflow_id);
    Ok(control_response(&data, workflow_id, paused))
}

#[post("/api/workflows/{id}/resume")]
async fn resume_workflow(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    let resumed = data.runtime.resume(workflow_id);
    Ok(control_response(&data, workflow_id, resumed))
}

#[post("/api/workflows/{id}/resume-from/{node_id}")]
async fn resume_from_node(
    data: web::Data<AppState>,
    path: web::Path<(WorkflowId, NodeId)>,
    query: web::Query<RunQuery>,
) -> ActixResult<impl Responder> {
    let (workflow_id, node_id) = path.into_inner();
    Ok(launch(&data, workflow_id, query.wait, move |runtime| async move {
        runtime.resume_from_node(workflow_id, node_id).await
    })
    .await)
}

#[post("/api/workflows/{id}/restart-checkpoint/{node_id}")]
async fn restart_from_checkpoint(
    data: web::Data<AppState>,
    path: web::Path<(WorkflowId, NodeId)>,
    query: web::Query<RunQuery>,
) -> ActixResult<impl Responder> {
    let (workflow_id, node_id) = path.into_inner();
    Ok(launch(&data, workflow_id, query.wait, move |runtime| async move {
        runtime.restart_from_checkpoint(workflow_id, node_id).await
    })
    .await)
}

#[post("/api/workflows/{id}/restart-failed/{node_id}")]
async fn restart_failed_node(
    data: web::Data<AppState>,
    path: web::Path<(WorkflowId, NodeId)>,
    query: web::Query<RunQuery>,
) -> ActixResult<impl Responder> {
    let (workflow_id, node_id) = path.into_inner();
    Ok(launch(&data, workflow_id, query.wait, move |runtime| async move {
        runtime.restart_failed_node(workflow_id, node_id).await
    })
    .await)
}

#[get("/api/workflows/{id}/state")]
async fn get_state(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    match data.runtime.state(workflow_id) {
        Some(state) => Ok(HttpResponse::Ok().json(state)),
        None => Ok(not_found(format!("State for workflow {}", workflow_id))),
    }
}

/// Drop state and checkpoints, keeping the workflow registered
#[delete("/api/workflows/{id}/state")]
async fn clear_state(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    let cleared = data.runtime.clear(workflow_id);
    Ok(control_response(&data, workflow_id, cleared))
}

#[get("/api/workflows/{id}/checkpoints")]
async fn list_checkpoints(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    Ok(HttpResponse::Ok().json(data.runtime.checkpoints(workflow_id)))
}

/// WebSocket endpoint for real-time events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");
    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("WebSocket client lagged, {} events dropped", missed);
                        }
                        Err(_) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// List available node types
#[get("/api/nodes")]
async fn list_node_types(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let registry = &data.registry;
    let nodes: Vec<_> = registry
        .list_node_types()
        .iter()
        .map(|node_type| {
            let metadata = registry.get_metadata(node_type);
            serde_json::json!({
                "type": node_type,
                "description": metadata.as_ref().map(|m| m.description.clone()).unwrap_or_default(),
                "category": metadata.as_ref().map(|m| m.category.clone()).unwrap_or_default(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(nodes))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_workflows)
        .service(create_workflow)
        .service(get_workflow)
        .service(delete_workflow)
        .service(execute_workflow)
        .service(stop_workflow)
        .service(pause_workflow)
        .service(resume_workflow)
        .service(resume_from_node)
        .service(restart_from_checkpoint)
        .service(restart_failed_node)
        .service(get_state)
        .service(clear_state)
        .service(list_checkpoints)
        .service(websocket_events)
        .service(list_node_types);
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use relaycore::NodeSpec;
    use relayruntime::RuntimeConfig;
    use serde_json::json;

    fn state() -> web::Data<AppState> {
        let registry = Arc::new(relaynodes::standard_registry());
        web::Data::new(AppState {
            runtime: Arc::new(RelayRuntime::with_registry(
                registry.clone(),
                RuntimeConfig::default(),
            )),
            registry,
        })
    }

    fn prompt_workflow() -> (Workflow, Vec<NodeId>) {
        let mut workflow = Workflow::new("prompt");
        let ids = workflow.chain([
            NodeSpec::new("input.field").with_config("key", json!("topic")),
            NodeSpec::new("text.template").with_config("template", json!("About {{upstream}}")),
        ]);
        (workflow, ids)
    }

    #[actix_web::test]
    async fn create_then_execute_and_wait() {
        let data = state();
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure)).await;
        let (workflow, ids) = prompt_workflow();
        let wf = workflow.id;

        let req = test::TestRequest::post()
            .uri("/api/workflows")
            .set_json(&workflow)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = test::TestRequest::post()
            .uri(&format!("/api/workflows/{}/execute?wait=true", wf))
            .set_json(json!({"input": {"topic": "rust"}}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["results"][ids[1].to_string()], "About rust");

        let req = test::TestRequest::get()
            .uri(&format!("/api/workflows/{}/checkpoints", wf))
            .to_request();
        let checkpoints: Vec<Value> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(checkpoints.len(), 2);
    }

    #[actix_web::test]
    async fn failed_run_then_restart_failed_node() {
        let data = state();
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure)).await;
        let (workflow, ids) = prompt_workflow();
        let wf = workflow.id;
        data.runtime.register_workflow(workflow).await.unwrap();

        // no `topic` in the input: first node fails
        let req = test::TestRequest::post()
            .uri(&format!("/api/workflows/{}/execute?wait=true", wf))
            .set_json(json!({"input": {}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["status"], "failed");

        // fix the input in place and retry only the failed node
        let mut state = data.runtime.state(wf).unwrap();
        state.input = json!({"topic": "tides"});
        data.runtime.restore_state(state);

        let req = test::TestRequest::post()
            .uri(&format!("/api/workflows/{}/restart-failed/{}?wait=true", wf, ids[0]))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["results"][ids[1].to_string()], "About tides");
    }

    #[actix_web::test]
    async fn control_endpoints_report_missing_state() {
        let data = state();
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure)).await;
        let unknown = uuid::Uuid::new_v4();

        for action in ["stop", "pause", "resume"] {
            let req = test::TestRequest::post()
                .uri(&format!("/api/workflows/{}/{}", unknown, action))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{}", action);
        }

        let req = test::TestRequest::post()
            .uri(&format!("/api/workflows/{}/execute", unknown))
            .set_json(json!({}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn invalid_workflow_is_rejected() {
        let data = state();
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure)).await;
        let mut workflow = Workflow::new("bad");
        workflow.add_node(NodeSpec::new("no.such.node"));

        let req = test::TestRequest::post()
            .uri("/api/workflows")
            .set_json(&workflow)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(data.runtime.list_workflows().await.is_empty());
    }

    #[actix_web::test]
    async fn background_run_is_accepted() {
        let data = state();
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure)).await;
        let (workflow, _) = prompt_workflow();
        let wf = workflow.id;
        data.runtime.register_workflow(workflow).await.unwrap();

        let req = test::TestRequest::post()
            .uri(&format!("/api/workflows/{}/execute", wf))
            .set_json(json!({"input": {"topic": "bees"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }
}
