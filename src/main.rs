use config::Config;
use std::fs::OpenOptions;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};
use warp::Filter;
use tokio::sync::RwLock;
use log::{info, debug, error};
use log::LevelFilter;
use env_logger::{Builder, Target};
use warp::http::StatusCode;

// Import modules from their respective paths
mod api {
    pub mod types;
}
mod nn {
    pub mod error;
    pub mod network;
}

use api::types::{
    ErrorResponse, HealthResponse, ImportResponse, ModelResponse, PredictRequest, PredictResponse,
    TrainRequest, TrainResponse,
};
use nn::error::{ErrorKind, NetError};
use nn::network::{ModelSnapshot, NeuralNetwork, TrainOptions};

/// Layer widths of the served network: ten ticks in, one forecast out.
const TOPOLOGY: [usize; 3] = [10, 16, 1];

type SharedNet = Arc<RwLock<NeuralNetwork>>;

#[derive(Debug, Clone, Copy)]
struct TrainingSettings {
    epochs: usize,
    timeout: Duration,
}

#[tokio::main]
async fn main() {
    setup_logging();
    info!("Starting tick forecasting service...");

    let settings = load_settings();
    let (preferred_port, port_attempts, training) = extract_settings(&settings);

    let network = NeuralNetwork::new(TOPOLOGY.to_vec()).expect("served topology is valid");
    let state: SharedNet = Arc::new(RwLock::new(network));

    let routes = api_routes(state, training);

    let port =
        select_port(preferred_port, port_attempts).expect("no free port in the configured range");
    info!("Listening on port {}", port);
    warp::serve(routes).run(([0, 0, 0, 0], port)).await;
}

fn setup_logging() {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open("ticknet.log")
        .unwrap();
    Builder::new()
        .target(Target::Pipe(Box::new(file)))
        .filter_level(LevelFilter::Debug)
        .init();
}

fn load_settings() -> Config {
    Config::builder()
        .add_source(config::File::with_name("config"))
        .build()
        .unwrap()
}

fn extract_settings(settings: &Config) -> (u16, u16, TrainingSettings) {
    let port = settings.get_int("server.port").unwrap() as u16;
    let attempts = settings.get_int("server.port_attempts").unwrap() as u16;
    let training = TrainingSettings {
        epochs: settings.get_int("training.epochs").unwrap() as usize,
        timeout: Duration::from_secs(settings.get_int("training.timeout_secs").unwrap() as u64),
    };
    (port, attempts, training)
}

/// Tries the preferred port first, then walks a bounded range of fallbacks.
fn select_port(preferred: u16, attempts: u16) -> Option<u16> {
    (preferred..preferred.saturating_add(attempts)).find(|&port| {
        let free = TcpListener::bind(("0.0.0.0", port)).is_ok();
        if !free {
            debug!("Port {} is taken, trying the next one", port);
        }
        free
    })
}

fn api_routes(
    state: SharedNet,
    training: TrainingSettings,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let state_filter = warp::any().map(move || state.clone());
    let training_filter = warp::any().map(move || training);

    // Define API routes
    let train = warp::path!("api" / "train")
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter.clone())
        .and(training_filter)
        .and_then(handle_train);
    let predict = warp::path!("api" / "predict")
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter.clone())
        .and_then(handle_predict);
    let get_model = warp::path!("api" / "model")
        .and(warp::get())
        .and(state_filter.clone())
        .and_then(handle_get_model);
    let import_model = warp::path!("api" / "model")
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter)
        .and_then(handle_import_model);
    let health = warp::path!("api" / "health")
        .and(warp::get())
        .map(|| warp::reply::json(&HealthResponse { status: "ok" }));

    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type"])
        .allow_methods(vec!["GET", "POST", "OPTIONS"]);

    // Combine routes and serve them behind permissive CORS
    train
        .or(predict)
        .or(get_model)
        .or(import_model)
        .or(health)
        .with(cors)
}

async fn handle_train(
    request: TrainRequest,
    state: SharedNet,
    training: TrainingSettings,
) -> Result<impl warp::Reply, warp::Rejection> {
    debug!("Received training request with {} ticks", request.ticks.len());
    if request.ticks.is_empty() {
        return Ok(json_reply(
            &ErrorResponse {
                success: false,
                error: "ticks must not be empty".to_string(),
            },
            StatusCode::BAD_REQUEST,
        ));
    }

    let options = TrainOptions {
        epochs: training.epochs,
        // No session id means a fresh session: reset before training.
        reset: request.session_id.is_none(),
        deadline: Some(Instant::now() + training.timeout),
    };

    // The write guard is held for the whole call, so training is serialized
    // and no predict reads parameters mid-update.
    let guard = state.write_owned().await;
    let outcome = tokio::task::spawn_blocking(move || {
        let mut net = guard;
        net.train(&request.ticks, &options)
    })
    .await;

    match outcome {
        Ok(Ok(result)) => {
            info!("Training finished with loss {}", result.loss);
            Ok(json_reply(
                &TrainResponse {
                    success: true,
                    result,
                },
                StatusCode::OK,
            ))
        }
        Ok(Err(err)) => {
            error!("Training failed: {}", err);
            Ok(error_reply(&err))
        }
        Err(err) => {
            error!("Training task failed to complete: {:?}", err);
            Ok(json_reply(
                &ErrorResponse {
                    success: false,
                    error: "internal error".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

async fn handle_predict(
    request: PredictRequest,
    state: SharedNet,
) -> Result<impl warp::Reply, warp::Rejection> {
    debug!("Received prediction request with {} values", request.input.len());
    let net = state.read().await;
    match net.predict(&request.input) {
        Ok(prediction) => Ok(json_reply(
            &PredictResponse {
                success: true,
                prediction,
            },
            StatusCode::OK,
        )),
        Err(err) => {
            debug!("Prediction rejected: {}", err);
            Ok(error_reply(&err))
        }
    }
}

async fn handle_get_model(state: SharedNet) -> Result<impl warp::Reply, warp::Rejection> {
    debug!("Received request to export the model");
    let net = state.read().await;
    Ok(json_reply(
        &ModelResponse {
            success: true,
            model: net.export(),
            loss: net.last_loss(),
        },
        StatusCode::OK,
    ))
}

async fn handle_import_model(
    snapshot: ModelSnapshot,
    state: SharedNet,
) -> Result<impl warp::Reply, warp::Rejection> {
    let mut net = state.write().await;
    match net.import(snapshot) {
        Ok(()) => {
            info!("Imported model snapshot");
            Ok(json_reply(&ImportResponse { success: true }, StatusCode::OK))
        }
        Err(err) => {
            error!("Import rejected: {}", err);
            Ok(error_reply(&err))
        }
    }
}

fn json_reply<T: serde::Serialize>(
    body: &T,
    status: StatusCode,
) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(body), status)
}

/// Engine errors always surface as the success/error envelope; only the
/// status code depends on the error kind, and internal failures keep their
/// details out of the response.
fn error_reply(err: &NetError) -> warp::reply::WithStatus<warp::reply::Json> {
    let (status, message) = match err.kind() {
        ErrorKind::InvalidInput => (StatusCode::BAD_REQUEST, err.to_string()),
        ErrorKind::TrainingTimeout => (StatusCode::REQUEST_TIMEOUT, err.to_string()),
        ErrorKind::Internal => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        ),
    };
    warp::reply::with_status(
        warp::reply::json(&ErrorResponse {
            success: false,
            error: message,
        }),
        status,
    )
}
