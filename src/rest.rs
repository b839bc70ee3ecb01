//! A HTTP API for operators and nodes.
//!
//! Authentication happens in front of the controller. Requests arrive with the caller's identity
//! already resolved: nodes in the `x-node-id` header and operators in `x-user-id`.

use std::{convert::Infallible, path::PathBuf, sync::Arc};

use serde::Serialize;
use serde_json::json;
use warp::{
    http::StatusCode,
    reply::{self, Reply, Response},
    Filter,
};

use crate::{
    bundle::StagedDirectory,
    common::{ExperimentId, NodeId, UserId},
    error::{CoordinationError, ErrorKind},
    integrity::ReportedChecksums,
    lifecycle::{Conclusion, Engine, ExperimentChanges, ReplacementFile},
    models::{MetadataDescriptor, NewExperiment, NewNode, Participant},
    registry::Registry,
    settings::ApiSettings,
    store::Store,
    supervisor::Supervisor,
};

#[derive(Debug, Deserialize)]
struct CreateExperimentRequest {
    name: String,
    #[serde(default)]
    description: String,
    participants: Vec<Participant>,
    /// Directory the upload was extracted into.
    bundle_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct UploadBundleRequest {
    participants: Vec<Participant>,
    bundle_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct UpdateExperimentRequest {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    files: Vec<FileUpload>,
}

#[derive(Debug, Deserialize)]
struct FileUpload {
    name: String,
    /// Base64 encoded file contents.
    content: String,
}

#[derive(Debug, Deserialize)]
struct ConcludeRequest {
    conclusion: Conclusion,
}

#[derive(Debug, Deserialize)]
struct RegisterUserRequest {
    username: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    kind: ErrorKind,
    message: &'a str,
}

/// Starts the HTTP server at the configured address. Resolves only if the server stops.
pub async fn serve<S, P>(api_settings: ApiSettings, engine: Arc<Engine<S, P>>, registry: Arc<Registry<S>>)
where
    S: Store,
    P: Supervisor,
{
    let register_user = warp::path!("api" / "users")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_registry(registry.clone()))
        .and_then(handle_register_user::<S>);

    let register_node = warp::path!("nodes")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_registry(registry.clone()))
        .and_then(handle_register_node::<S>);

    let approve_node = warp::path!("api" / "nodes" / NodeId / "accept")
        .and(warp::put())
        .and(with_registry(registry.clone()))
        .and_then(handle_approve_node::<S>);

    let remove_node = warp::path!("api" / "nodes" / NodeId)
        .and(warp::delete())
        .and(with_registry(registry.clone()))
        .and_then(handle_remove_node::<S>);

    let heartbeat = warp::path!("api" / "nodes" / "status")
        .and(warp::put())
        .and(node_identity())
        .and(with_registry(registry.clone()))
        .and_then(handle_heartbeat::<S>);

    let list_nodes = warp::path!("api" / "nodes")
        .and(warp::get())
        .and(with_registry(registry.clone()))
        .and_then(handle_list_nodes::<S>);

    let poll = warp::path!("api" / "node" / "instructions")
        .and(warp::get())
        .and(node_identity())
        .and(with_registry(registry.clone()))
        .and_then(handle_poll::<S>);

    let register_metadata = warp::path!("api" / "metadata")
        .and(warp::post())
        .and(node_identity())
        .and(warp::body::json())
        .and(with_registry(registry.clone()))
        .and_then(handle_register_metadata::<S>);

    let list_metadata = warp::path!("api" / "metadata")
        .and(warp::get())
        .and(with_registry(registry))
        .and_then(handle_list_metadata::<S>);

    let create_experiment = warp::path!("api" / "experiments")
        .and(warp::post())
        .and(warp::header::<UserId>("x-user-id"))
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(handle_create_experiment::<S, P>);

    let list_experiments = warp::path!("api" / "experiments")
        .and(warp::get())
        .and(with_engine(engine.clone()))
        .and_then(handle_list_experiments::<S, P>);

    let get_experiment = warp::path!("api" / "experiments" / ExperimentId)
        .and(warp::get())
        .and(with_engine(engine.clone()))
        .and_then(handle_get_experiment::<S, P>);

    let update_experiment = warp::path!("api" / "experiments" / ExperimentId)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(handle_update_experiment::<S, P>);

    let upload_bundle = warp::path!("api" / "experiments" / ExperimentId / "bundle")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(handle_upload_bundle::<S, P>);

    let start = warp::path!("api" / "experiments" / ExperimentId / "start")
        .and(warp::post())
        .and(with_engine(engine.clone()))
        .and_then(handle_start::<S, P>);

    let stop = warp::path!("api" / "experiments" / ExperimentId / "stop")
        .and(warp::post())
        .and(with_engine(engine.clone()))
        .and_then(handle_stop::<S, P>);

    let conclude = warp::path!("api" / "experiments" / ExperimentId / "conclude")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(handle_conclude::<S, P>);

    let accept = warp::path!("api" / "experiments" / ExperimentId / "accept")
        .and(warp::put())
        .and(node_identity())
        .and(with_engine(engine.clone()))
        .and_then(handle_accept::<S, P>);

    let reject = warp::path!("api" / "experiments" / ExperimentId / "reject")
        .and(warp::put())
        .and(node_identity())
        .and(with_engine(engine.clone()))
        .and_then(handle_reject_experiment::<S, P>);

    let node_start = warp::path!("api" / "experiments" / ExperimentId / "node-start")
        .and(warp::post())
        .and(node_identity())
        .and(with_engine(engine.clone()))
        .and_then(handle_node_start::<S, P>);

    let checksum = warp::path!("api" / "experiments" / ExperimentId / "checksum")
        .and(warp::post())
        .and(node_identity())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(handle_checksum::<S, P>);

    let redeliver = warp::path!("api" / "experiments" / ExperimentId / "update-files")
        .and(warp::post())
        .and(with_engine(engine.clone()))
        .and_then(handle_redeliver::<S, P>);

    let reconcile = warp::path!("api" / "reconcile")
        .and(warp::post())
        .and(with_engine(engine))
        .and_then(handle_reconcile::<S, P>);

    let nodes = register_node
        .or(approve_node)
        .or(remove_node)
        .or(heartbeat)
        .or(list_nodes)
        .or(poll)
        .or(register_metadata)
        .or(list_metadata)
        .or(register_user)
        .boxed();
    let experiments = create_experiment
        .or(list_experiments)
        .or(get_experiment)
        .or(update_experiment)
        .or(upload_bundle)
        .or(start)
        .or(stop)
        .or(conclude)
        .or(accept)
        .or(reject)
        .or(node_start)
        .or(checksum)
        .or(redeliver)
        .or(reconcile)
        .boxed();

    let routes = nodes
        .or(experiments)
        .recover(handle_reject)
        .with(warp::log("http"));

    info!(address = %api_settings.bind_address, "REST API listening");
    warp::serve(routes).run(api_settings.bind_address).await
}

/// Converts the lifecycle engine into a `warp` filter.
fn with_engine<S, P>(
    engine: Arc<Engine<S, P>>,
) -> impl Filter<Extract = (Arc<Engine<S, P>>,), Error = Infallible> + Clone
where
    S: Store,
    P: Supervisor,
{
    warp::any().map(move || engine.clone())
}

/// Converts the registry into a `warp` filter.
fn with_registry<S: Store>(
    registry: Arc<Registry<S>>,
) -> impl Filter<Extract = (Arc<Registry<S>>,), Error = Infallible> + Clone {
    warp::any().map(move || registry.clone())
}

/// Extracts the calling node from the request headers.
fn node_identity() -> impl Filter<Extract = (NodeId,), Error = warp::Rejection> + Clone {
    warp::header::<NodeId>("x-node-id")
}

fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::Integrity => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::DependencyInstall | ErrorKind::Supervisor | ErrorKind::Store => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_reply(err: &CoordinationError) -> Response {
    let kind = err.kind();
    let status = status_of(kind);
    let message = err.to_string();
    if status.is_server_error() {
        error!(%kind, "request failed: {}", message);
    } else {
        warn!(%kind, "request rejected: {}", message);
    }
    reply::with_status(
        reply::json(&ErrorBody {
            kind,
            message: &message,
        }),
        status,
    )
    .into_response()
}

/// Replies with `body` as JSON and `status`, or with the error.
fn respond<T: Serialize>(result: Result<T, CoordinationError>, status: StatusCode) -> Response {
    match result {
        Ok(body) => reply::with_status(reply::json(&body), status).into_response(),
        Err(err) => error_reply(&err),
    }
}

async fn handle_register_user<S: Store>(
    request: RegisterUserRequest,
    registry: Arc<Registry<S>>,
) -> Result<Response, Infallible> {
    Ok(respond(
        registry.register_user(&request.username).await,
        StatusCode::CREATED,
    ))
}

async fn handle_register_node<S: Store>(
    node: NewNode,
    registry: Arc<Registry<S>>,
) -> Result<Response, Infallible> {
    Ok(respond(registry.register_node(node).await, StatusCode::CREATED))
}

async fn handle_approve_node<S: Store>(
    node_id: NodeId,
    registry: Arc<Registry<S>>,
) -> Result<Response, Infallible> {
    Ok(respond(registry.approve_node(node_id).await, StatusCode::OK))
}

async fn handle_remove_node<S: Store>(
    node_id: NodeId,
    registry: Arc<Registry<S>>,
) -> Result<Response, Infallible> {
    let result = registry
        .remove_node(node_id)
        .await
        .map(|()| json!({ "removed": node_id }));
    Ok(respond(result, StatusCode::OK))
}

async fn handle_heartbeat<S: Store>(
    node_id: NodeId,
    registry: Arc<Registry<S>>,
) -> Result<Response, Infallible> {
    Ok(respond(registry.heartbeat(node_id).await, StatusCode::OK))
}

async fn handle_list_nodes<S: Store>(registry: Arc<Registry<S>>) -> Result<Response, Infallible> {
    Ok(respond(registry.list_nodes().await, StatusCode::OK))
}

async fn handle_poll<S: Store>(
    node_id: NodeId,
    registry: Arc<Registry<S>>,
) -> Result<Response, Infallible> {
    let instructions = registry.poll(node_id).await;
    Ok(reply::json(&instructions).into_response())
}

async fn handle_register_metadata<S: Store>(
    node_id: NodeId,
    descriptor: MetadataDescriptor,
    registry: Arc<Registry<S>>,
) -> Result<Response, Infallible> {
    Ok(respond(
        registry.register_metadata(node_id, descriptor).await,
        StatusCode::CREATED,
    ))
}

async fn handle_list_metadata<S: Store>(
    registry: Arc<Registry<S>>,
) -> Result<Response, Infallible> {
    Ok(respond(registry.list_metadata().await, StatusCode::OK))
}

async fn handle_create_experiment<S: Store, P: Supervisor>(
    user_id: UserId,
    request: CreateExperimentRequest,
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    let source = StagedDirectory::new(request.bundle_path);
    let new = NewExperiment {
        user_id,
        name: request.name,
        description: request.description,
    };
    Ok(respond(
        engine
            .create_experiment(new, request.participants, &source)
            .await,
        StatusCode::CREATED,
    ))
}

async fn handle_list_experiments<S: Store, P: Supervisor>(
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    Ok(respond(engine.list_experiments().await, StatusCode::OK))
}

async fn handle_get_experiment<S: Store, P: Supervisor>(
    experiment_id: ExperimentId,
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    Ok(respond(engine.experiment(experiment_id).await, StatusCode::OK))
}

fn decode_changes(request: UpdateExperimentRequest) -> Result<ExperimentChanges, CoordinationError> {
    let files = request
        .files
        .into_iter()
        .map(|file| {
            base64::decode(file.content.as_bytes())
                .map(|contents| ReplacementFile {
                    name: file.name.clone(),
                    contents,
                })
                .map_err(|err| {
                    CoordinationError::validation(format!(
                        "file {} is not valid base64: {}",
                        file.name, err
                    ))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ExperimentChanges {
        name: request.name,
        description: request.description,
        files,
    })
}

async fn handle_update_experiment<S: Store, P: Supervisor>(
    experiment_id: ExperimentId,
    request: UpdateExperimentRequest,
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    let result = match decode_changes(request) {
        Ok(changes) => engine.update_experiment(experiment_id, changes).await,
        Err(err) => Err(err),
    };
    Ok(respond(result, StatusCode::OK))
}

async fn handle_upload_bundle<S: Store, P: Supervisor>(
    experiment_id: ExperimentId,
    request: UploadBundleRequest,
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    let source = StagedDirectory::new(request.bundle_path);
    Ok(respond(
        engine
            .upload_bundle(experiment_id, request.participants, &source)
            .await,
        StatusCode::OK,
    ))
}

async fn handle_start<S: Store, P: Supervisor>(
    experiment_id: ExperimentId,
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    Ok(respond(
        engine.start_experiment(experiment_id).await,
        StatusCode::OK,
    ))
}

async fn handle_stop<S: Store, P: Supervisor>(
    experiment_id: ExperimentId,
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    Ok(respond(
        engine.stop_experiment(experiment_id).await,
        StatusCode::OK,
    ))
}

async fn handle_conclude<S: Store, P: Supervisor>(
    experiment_id: ExperimentId,
    request: ConcludeRequest,
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    Ok(respond(
        engine
            .conclude_experiment(experiment_id, request.conclusion)
            .await,
        StatusCode::OK,
    ))
}

async fn handle_accept<S: Store, P: Supervisor>(
    experiment_id: ExperimentId,
    node_id: NodeId,
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    Ok(respond(
        engine.accept_experiment(experiment_id, node_id).await,
        StatusCode::OK,
    ))
}

async fn handle_reject_experiment<S: Store, P: Supervisor>(
    experiment_id: ExperimentId,
    node_id: NodeId,
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    Ok(respond(
        engine.reject_experiment(experiment_id, node_id).await,
        StatusCode::OK,
    ))
}

async fn handle_node_start<S: Store, P: Supervisor>(
    experiment_id: ExperimentId,
    node_id: NodeId,
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    Ok(respond(
        engine.acknowledge_training(experiment_id, node_id).await,
        StatusCode::OK,
    ))
}

async fn handle_checksum<S: Store, P: Supervisor>(
    experiment_id: ExperimentId,
    node_id: NodeId,
    reported: ReportedChecksums,
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    let result = engine
        .report_checksums(experiment_id, node_id, &reported)
        .await
        .map(|()| json!({ "verified": true }));
    Ok(respond(result, StatusCode::OK))
}

async fn handle_redeliver<S: Store, P: Supervisor>(
    experiment_id: ExperimentId,
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    let result = engine
        .redeliver_files(experiment_id)
        .await
        .map(|notified| json!({ "notified": notified }));
    Ok(respond(result, StatusCode::OK))
}

async fn handle_reconcile<S: Store, P: Supervisor>(
    engine: Arc<Engine<S, P>>,
) -> Result<Response, Infallible> {
    Ok(respond(engine.reconcile().await, StatusCode::OK))
}

/// Handles `warp` rejections of bad requests.
async fn handle_reject(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
    let code = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.find::<warp::reject::MissingHeader>().is_some()
        || err.find::<warp::reject::InvalidHeader>().is_some()
        || err.find::<warp::filters::body::BodyDeserializeError>().is_some()
    {
        StatusCode::BAD_REQUEST
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        StatusCode::METHOD_NOT_ALLOWED
    } else {
        error!("unhandled rejection: {:?}", err);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    // reply with empty body; the status code is the interesting part
    Ok(reply::with_status(Vec::new(), code))
}
