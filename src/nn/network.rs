use std::time::Instant;

use log::{debug, info};
use ndarray::{s, Array2, ArrayView2, Axis};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use serde::{Deserialize, Serialize};

use crate::nn::error::{NetError, Result};

/// Guard against a zero standard deviation on constant input.
const EPSILON: f64 = 1e-8;
/// Fixed gradient descent step size; no decay, momentum or regularization.
const LEARNING_RATE: f64 = 0.001;
/// Upper bound on the mini-batch size.
const MAX_BATCH: usize = 32;

/// Options for a single training call.
#[derive(Debug, Clone, Copy)]
pub struct TrainOptions {
    /// Passes over the sliding-window dataset.
    pub epochs: usize,
    /// Re-initialize parameters before training (fresh session). The caller
    /// decides this explicitly; the engine never infers it.
    pub reset: bool,
    /// Cooperative cancellation point, checked at batch boundaries.
    pub deadline: Option<Instant>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 100,
            reset: false,
            deadline: None,
        }
    }
}

/// Summary returned by a training call: the final epoch's mean loss, the
/// number of sliding-window examples, and a copy of the updated parameters.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub loss: f64,
    pub samples_processed: usize,
    pub final_weights: Vec<Vec<Vec<f64>>>,
    pub final_biases: Vec<Vec<Vec<f64>>>,
}

/// Complete, order-preserving parameter snapshot. Sufficient to reconstruct
/// the engine through `NeuralNetwork::import`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub layers: Vec<usize>,
    pub weights: Vec<Vec<Vec<f64>>>,
    pub biases: Vec<Vec<Vec<f64>>>,
}

/// Feed-forward network trained on sliding windows of a tick sequence.
///
/// One weight matrix of shape `[width_in, width_out]` and one bias row of
/// shape `[1, width_out]` per layer transition. All state is in memory and
/// only reachable through the operations below; training mutates it in
/// place, prediction and export read it, import replaces it wholesale.
pub struct NeuralNetwork {
    layers: Vec<usize>,
    weights: Vec<Array2<f64>>,
    biases: Vec<Array2<f64>>,
    last_loss: Option<f64>,
}

impl NeuralNetwork {
    pub fn new(layers: Vec<usize>) -> Result<Self> {
        if layers.len() < 2 {
            return Err(NetError::BadTopology {
                reason: "a network needs at least an input and an output layer",
            });
        }
        if layers.iter().any(|&width| width == 0) {
            return Err(NetError::BadTopology {
                reason: "layer widths must be positive",
            });
        }

        let mut net = Self {
            layers,
            weights: Vec::new(),
            biases: Vec::new(),
            last_loss: None,
        };
        net.initialize();
        Ok(net)
    }

    /// He initialization: each weight drawn from a zero-mean Gaussian with
    /// standard deviation `sqrt(2 / fan_in)`, so the spread shrinks as the
    /// layer widens; biases start at zero. Doubles as the reset path before
    /// a fresh training session.
    pub fn initialize(&mut self) {
        let mut rng = rand::rng();
        self.weights.clear();
        self.biases.clear();
        for pair in self.layers.windows(2) {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let scale = (2.0 / fan_in as f64).sqrt();
            let dist = Normal::new(0.0, scale).expect("standard deviation is finite");
            self.weights
                .push(Array2::random_using((fan_in, fan_out), dist, &mut rng));
            self.biases.push(Array2::zeros((1, fan_out)));
        }
        self.last_loss = None;
    }

    /// Width of the input layer, i.e. the sliding-window size.
    pub fn input_width(&self) -> usize {
        self.layers[0]
    }

    /// Loss of the most recent successful training call.
    pub fn last_loss(&self) -> Option<f64> {
        self.last_loss
    }

    /// Population z-score of the whole slice. Stateless: the mean and
    /// standard deviation are recomputed from every input, for training data
    /// and single inference windows alike.
    pub fn normalize(data: &[f64]) -> Vec<f64> {
        if data.is_empty() {
            return Vec::new();
        }
        let n = data.len() as f64;
        let mean = data.iter().sum::<f64>() / n;
        let variance = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();
        data.iter().map(|x| (x - mean) / (std + EPSILON)).collect()
    }

    /// One forward pass over a batch of shape `[n, input_width]`. Returns
    /// the full activation trace: the input at index 0 followed by every
    /// layer's output. ReLU is applied at the output layer too, so the last
    /// entry is elementwise non-negative.
    fn forward(&self, batch: ArrayView2<f64>) -> Vec<Array2<f64>> {
        let mut trace = Vec::with_capacity(self.weights.len() + 1);
        trace.push(batch.to_owned());
        for (w, b) in self.weights.iter().zip(&self.biases) {
            let net = trace[trace.len() - 1].dot(w) + b;
            trace.push(net.mapv(|v| v.max(0.0)));
        }
        trace
    }

    /// Mini-batch gradient descent over a self-supervised sliding-window
    /// dataset built from `ticks`: example `i` is the window
    /// `normalized[i .. i + input_width]` with the very next value as its
    /// scalar target. Batches are taken in order, no shuffling.
    ///
    /// Updates already applied when a later batch fails are not rolled back.
    pub fn train(&mut self, ticks: &[f64], options: &TrainOptions) -> Result<TrainingReport> {
        let window = self.input_width();
        if ticks.len() <= window {
            return Err(NetError::InsufficientData {
                got: ticks.len(),
                required: window + 1,
            });
        }
        if options.reset {
            debug!("Resetting parameters before training");
            self.initialize();
        }

        let normalized = Self::normalize(ticks);
        let num_examples = normalized.len() - window;
        let out_width = self.layers[self.layers.len() - 1];
        let inputs = Array2::from_shape_fn((num_examples, window), |(i, j)| normalized[i + j]);
        let targets = &normalized[window..];

        let batch_size = MAX_BATCH.min(num_examples);
        info!(
            "Training on {} examples, batch size {}, {} epochs",
            num_examples, batch_size, options.epochs
        );

        let mut loss = 0.0;
        for epoch in 0..options.epochs {
            let mut epoch_loss = 0.0;
            let mut batches = 0;
            let mut start = 0;
            while start < num_examples {
                if let Some(deadline) = options.deadline {
                    if Instant::now() >= deadline {
                        return Err(NetError::Timeout);
                    }
                }
                let end = (start + batch_size).min(num_examples);
                let batch = inputs.slice(s![start..end, ..]);
                // Each scalar target is broadcast across the output width.
                let target =
                    Array2::from_shape_fn((end - start, out_width), |(r, _)| targets[start + r]);

                let trace = self.forward(batch);
                let output = &trace[trace.len() - 1];
                let error = output - &target;
                epoch_loss += error.mapv(|e| e * e).mean().unwrap_or_default();
                batches += 1;

                // ReLU is active at the output layer, so its derivative
                // gates the output error as well.
                let mut delta = error * output.mapv(relu_derivative);
                for j in (0..self.weights.len()).rev() {
                    let grad_w = trace[j].t().dot(&delta);
                    self.weights[j].scaled_add(-LEARNING_RATE, &grad_w);
                    let grad_b = delta
                        .mean_axis(Axis(0))
                        .expect("batch is non-empty")
                        .insert_axis(Axis(0));
                    self.biases[j].scaled_add(-LEARNING_RATE, &grad_b);
                    if j > 0 {
                        delta = delta.dot(&self.weights[j].t()) * trace[j].mapv(relu_derivative);
                    }
                }
                start = end;
            }

            loss = epoch_loss / batches as f64;
            if !loss.is_finite() {
                return Err(NetError::NonFiniteLoss { epoch });
            }
            debug!("Epoch {}: loss {}", epoch, loss);
        }

        self.last_loss = Some(loss);
        Ok(TrainingReport {
            loss,
            samples_processed: num_examples,
            final_weights: self.weights.iter().map(matrix_rows).collect(),
            final_biases: self.biases.iter().map(matrix_rows).collect(),
        })
    }

    /// Runs one forward pass over a single window and returns the final
    /// activation flattened. The window is normalized in isolation; no
    /// statistic from training is reused. Read-only with respect to the
    /// engine's parameters.
    pub fn predict(&self, input: &[f64]) -> Result<Vec<f64>> {
        let expected = self.input_width();
        if input.len() != expected {
            return Err(NetError::LengthMismatch {
                got: input.len(),
                expected,
            });
        }
        let normalized = Self::normalize(input);
        let batch =
            Array2::from_shape_vec((1, expected), normalized).expect("window length was checked");
        let trace = self.forward(batch.view());
        Ok(trace[trace.len() - 1].iter().copied().collect())
    }

    pub fn export(&self) -> ModelSnapshot {
        ModelSnapshot {
            layers: self.layers.clone(),
            weights: self.weights.iter().map(matrix_rows).collect(),
            biases: self.biases.iter().map(matrix_rows).collect(),
        }
    }

    /// Replaces topology, weights and biases wholesale. The snapshot is
    /// validated for internal consistency first; on any mismatch the current
    /// parameters are left untouched.
    pub fn import(&mut self, snapshot: ModelSnapshot) -> Result<()> {
        if snapshot.layers.len() < 2 {
            return Err(NetError::SnapshotMismatch {
                reason: "topology needs at least two layers".to_string(),
            });
        }
        if snapshot.layers.iter().any(|&width| width == 0) {
            return Err(NetError::SnapshotMismatch {
                reason: "layer widths must be positive".to_string(),
            });
        }
        let transitions = snapshot.layers.len() - 1;
        if snapshot.weights.len() != transitions || snapshot.biases.len() != transitions {
            return Err(NetError::SnapshotMismatch {
                reason: format!(
                    "expected {} weight matrices and bias rows, got {} and {}",
                    transitions,
                    snapshot.weights.len(),
                    snapshot.biases.len()
                ),
            });
        }

        let mut weights = Vec::with_capacity(transitions);
        let mut biases = Vec::with_capacity(transitions);
        for (i, (w, b)) in snapshot.weights.iter().zip(&snapshot.biases).enumerate() {
            let (rows, cols) = (snapshot.layers[i], snapshot.layers[i + 1]);
            weights.push(rows_to_matrix(w, rows, cols).ok_or_else(|| {
                NetError::SnapshotMismatch {
                    reason: format!("weight matrix {i} is not {rows}x{cols}"),
                }
            })?);
            biases.push(rows_to_matrix(b, 1, cols).ok_or_else(|| {
                NetError::SnapshotMismatch {
                    reason: format!("bias row {i} is not 1x{cols}"),
                }
            })?);
        }

        self.layers = snapshot.layers;
        self.weights = weights;
        self.biases = biases;
        self.last_loss = None;
        Ok(())
    }
}

fn relu_derivative(activation: f64) -> f64 {
    if activation > 0.0 {
        1.0
    } else {
        0.0
    }
}

fn matrix_rows(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix.rows().into_iter().map(|row| row.to_vec()).collect()
}

fn rows_to_matrix(rows: &[Vec<f64>], nrows: usize, ncols: usize) -> Option<Array2<f64>> {
    if rows.len() != nrows || rows.iter().any(|row| row.len() != ncols) {
        return None;
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((nrows, ncols), flat).ok()
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn tick_wave(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.1)
            .collect()
    }

    #[test]
    fn normalize_centers_and_scales() {
        let out = NeuralNetwork::normalize(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let n = out.len() as f64;
        let mean = out.iter().sum::<f64>() / n;
        let variance = out.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 1e-9);
        assert!((variance.sqrt() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_empty_is_empty() {
        assert!(NeuralNetwork::normalize(&[]).is_empty());
    }

    #[test]
    fn normalize_constant_is_all_zeros() {
        let out = NeuralNetwork::normalize(&[7.0; 6]);
        assert!(out.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn topology_needs_two_positive_layers() {
        assert!(matches!(
            NeuralNetwork::new(vec![10]),
            Err(NetError::BadTopology { .. })
        ));
        assert!(matches!(
            NeuralNetwork::new(vec![10, 0, 1]),
            Err(NetError::BadTopology { .. })
        ));
    }

    #[test]
    fn train_rejects_short_sequences() {
        let mut net = NeuralNetwork::new(vec![10, 16, 1]).unwrap();
        let err = net.train(&[1.0; 10], &TrainOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            NetError::InsufficientData {
                got: 10,
                required: 11
            }
        ));
    }

    #[test]
    fn predict_rejects_wrong_window() {
        let net = NeuralNetwork::new(vec![10, 16, 1]).unwrap();
        let err = net.predict(&[1.0; 9]).unwrap_err();
        assert!(matches!(
            err,
            NetError::LengthMismatch {
                got: 9,
                expected: 10
            }
        ));
    }

    #[test]
    fn fifty_ticks_make_forty_examples() {
        let mut net = NeuralNetwork::new(vec![10, 16, 1]).unwrap();
        let options = TrainOptions {
            epochs: 10,
            ..Default::default()
        };
        let report = net.train(&tick_wave(50), &options).unwrap();
        assert_eq!(report.samples_processed, 40);
        assert!(report.loss.is_finite());
        assert!(report.loss >= 0.0);
        assert_eq!(net.last_loss(), Some(report.loss));
    }

    #[test]
    fn predictions_are_non_negative_after_training() {
        let mut net = NeuralNetwork::new(vec![10, 16, 1]).unwrap();
        let options = TrainOptions {
            epochs: 20,
            ..Default::default()
        };
        net.train(&tick_wave(80), &options).unwrap();
        let out = net.predict(&tick_wave(10)).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn predict_is_pure() {
        let net = NeuralNetwork::new(vec![10, 16, 1]).unwrap();
        let window = tick_wave(10);
        assert_eq!(net.predict(&window).unwrap(), net.predict(&window).unwrap());
    }

    #[test]
    fn export_import_round_trips_parameters() {
        let net = NeuralNetwork::new(vec![10, 16, 1]).unwrap();
        let snapshot = net.export();

        let mut fresh = NeuralNetwork::new(vec![10, 16, 1]).unwrap();
        fresh.import(snapshot.clone()).unwrap();
        assert_eq!(fresh.export(), snapshot);

        let window = tick_wave(10);
        assert_eq!(net.predict(&window).unwrap(), fresh.predict(&window).unwrap());
    }

    #[test]
    fn import_replaces_topology_wholesale() {
        let donor = NeuralNetwork::new(vec![4, 6, 2]).unwrap();
        let mut net = NeuralNetwork::new(vec![10, 16, 1]).unwrap();
        net.import(donor.export()).unwrap();
        assert_eq!(net.input_width(), 4);
        assert_eq!(net.predict(&[1.0, 2.0, 3.0, 4.0]).unwrap().len(), 2);
    }

    #[test]
    fn import_rejects_inconsistent_snapshots() {
        let donor = NeuralNetwork::new(vec![4, 3, 1]).unwrap();
        let mut snapshot = donor.export();
        snapshot.weights[0][0].pop();

        let mut net = NeuralNetwork::new(vec![4, 3, 1]).unwrap();
        let before = net.export();
        assert!(matches!(
            net.import(snapshot),
            Err(NetError::SnapshotMismatch { .. })
        ));
        assert_eq!(net.export(), before);
    }

    #[test]
    fn import_rejects_missing_transitions() {
        let donor = NeuralNetwork::new(vec![4, 3, 1]).unwrap();
        let mut snapshot = donor.export();
        snapshot.weights.pop();

        let mut net = NeuralNetwork::new(vec![4, 3, 1]).unwrap();
        assert!(matches!(
            net.import(snapshot),
            Err(NetError::SnapshotMismatch { .. })
        ));
    }

    #[test]
    fn expired_deadline_times_out() {
        let mut net = NeuralNetwork::new(vec![10, 16, 1]).unwrap();
        let options = TrainOptions {
            deadline: Some(Instant::now() - Duration::from_millis(1)),
            ..Default::default()
        };
        assert!(matches!(
            net.train(&tick_wave(50), &options),
            Err(NetError::Timeout)
        ));
    }

    #[test]
    fn reset_discards_learned_parameters() {
        let mut net = NeuralNetwork::new(vec![10, 16, 1]).unwrap();
        let ticks = tick_wave(50);
        let options = TrainOptions {
            epochs: 5,
            ..Default::default()
        };
        net.train(&ticks, &options).unwrap();
        let trained = net.export();

        let options = TrainOptions {
            epochs: 1,
            reset: true,
            ..Default::default()
        };
        net.train(&ticks, &options).unwrap();
        assert_ne!(net.export().weights, trained.weights);
    }

    #[test]
    fn training_is_cumulative_without_reset() {
        let mut net = NeuralNetwork::new(vec![10, 16, 1]).unwrap();
        let ticks = tick_wave(50);
        let options = TrainOptions {
            epochs: 5,
            ..Default::default()
        };
        net.train(&ticks, &options).unwrap();
        let first = net.export();
        net.train(&ticks, &options).unwrap();
        // Weights keep moving from where the first call left them.
        assert_ne!(net.export().weights, first.weights);
    }
}
