use serde::{Deserialize, Serialize};

use crate::nn::network::{ModelSnapshot, TrainingReport};

/// Body of `POST /api/train`.
#[derive(Debug, Deserialize)]
pub struct TrainRequest {
    pub ticks: Vec<f64>,
    /// Present for a continued session. Absence means "fresh session" and
    /// makes the handler reset the parameters before training.
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Body of `POST /api/predict`.
#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub input: Vec<f64>,
}

#[derive(Debug, Serialize)]
pub struct TrainResponse {
    pub success: bool,
    pub result: TrainingReport,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub success: bool,
    pub prediction: Vec<f64>,
}

#[derive(Debug, Serialize)]
pub struct ModelResponse {
    pub success: bool,
    pub model: ModelSnapshot,
    /// Loss of the most recent successful training call, if any.
    pub loss: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
