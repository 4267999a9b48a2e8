//! Constant-velocity Kalman filter over XYAH box measurements.
//!
//! State is `[cx, cy, a, h, vx, vy, va, vh]`; the measurement is the first
//! four components. Noise scales with box height as in DeepSORT/ByteTrack.

use nalgebra::{Matrix4, SMatrix, SVector, Vector4};

pub type StateMean = SVector<f64, 8>;
pub type StateCovariance = SMatrix<f64, 8, 8>;

#[derive(Debug, Clone)]
pub struct KalmanFilter {
    motion: SMatrix<f64, 8, 8>,
    observation: SMatrix<f64, 4, 8>,
    std_weight_position: f64,
    std_weight_velocity: f64,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl KalmanFilter {
    pub fn new() -> Self {
        let mut motion = SMatrix::<f64, 8, 8>::identity();
        for i in 0..4 {
            motion[(i, 4 + i)] = 1.0;
        }

        let mut observation = SMatrix::<f64, 4, 8>::zeros();
        for i in 0..4 {
            observation[(i, i)] = 1.0;
        }

        Self {
            motion,
            observation,
            std_weight_position: 1.0 / 20.0,
            std_weight_velocity: 1.0 / 160.0,
        }
    }

    /// Start a track from an unassociated XYAH measurement with zero velocity.
    pub fn initiate(&self, measurement: [f64; 4]) -> (StateMean, StateCovariance) {
        let mut mean = StateMean::zeros();
        mean.fixed_rows_mut::<4>(0)
            .copy_from(&Vector4::from_column_slice(&measurement));

        let h = measurement[3];
        let pos = self.std_weight_position * h;
        let vel = self.std_weight_velocity * h;
        let std = StateMean::from_column_slice(&[
            2.0 * pos,
            2.0 * pos,
            1e-2,
            2.0 * pos,
            10.0 * vel,
            10.0 * vel,
            1e-5,
            10.0 * vel,
        ]);

        (mean, StateCovariance::from_diagonal(&std.component_mul(&std)))
    }

    /// Advance one frame under the constant-velocity model.
    pub fn predict(&self, mean: &StateMean, covariance: &StateCovariance) -> (StateMean, StateCovariance) {
        let h = mean[3];
        let pos = self.std_weight_position * h;
        let vel = self.std_weight_velocity * h;
        let std = StateMean::from_column_slice(&[pos, pos, 1e-2, pos, vel, vel, 1e-5, vel]);
        let process_noise = StateCovariance::from_diagonal(&std.component_mul(&std));

        let mean = self.motion * mean;
        let covariance = self.motion * covariance * self.motion.transpose() + process_noise;
        (mean, covariance)
    }

    /// Project the state into measurement space.
    pub fn project(&self, mean: &StateMean, covariance: &StateCovariance) -> (Vector4<f64>, Matrix4<f64>) {
        let h = mean[3];
        let pos = self.std_weight_position * h;
        let std = Vector4::new(pos, pos, 1e-1, pos);
        let innovation_noise = Matrix4::from_diagonal(&std.component_mul(&std));

        let projected_mean = self.observation * mean;
        let projected_cov =
            self.observation * covariance * self.observation.transpose() + innovation_noise;
        (projected_mean, projected_cov)
    }

    /// Correct the state with a measurement.
    ///
    /// Returns `None` when the innovation covariance is singular; callers
    /// treat that as a tracking inconsistency and drop the track.
    pub fn update(
        &self,
        mean: &StateMean,
        covariance: &StateCovariance,
        measurement: [f64; 4],
    ) -> Option<(StateMean, StateCovariance)> {
        let (projected_mean, projected_cov) = self.project(mean, covariance);
        let innovation = Vector4::from_column_slice(&measurement) - projected_mean;

        let inverse = projected_cov.try_inverse()?;
        let kalman_gain = covariance * self.observation.transpose() * inverse;

        let new_mean = mean + kalman_gain * innovation;
        let new_covariance = covariance - kalman_gain * projected_cov * kalman_gain.transpose();

        if new_mean.iter().all(|v| v.is_finite()) {
            Some((new_mean, new_covariance))
        } else {
            None
        }
    }
}
