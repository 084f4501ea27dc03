//! Flow-match Euler scheduler for the rectified-flow backends.
//!
//! Rectified flow trains the model as a velocity field over
//! `x_t = (1 - sigma) * x_0 + sigma * noise`; inference integrates it with
//! discrete Euler steps while sigmas run from 1.0 (pure noise) to 0.0. The
//! constant `shift` biases the schedule towards higher noise levels:
//! `sigma' = shift * sigma / (1 + (shift - 1) * sigma)`.

use candle::{Result, Tensor};

#[derive(Debug, Clone)]
pub struct FlowMatchEulerScheduler {
    sigmas: Vec<f64>,
    timesteps: Vec<f64>,
}

impl FlowMatchEulerScheduler {
    pub fn new(num_inference_steps: usize, shift: f64) -> Self {
        let n = num_inference_steps.max(1);
        let mut sigmas: Vec<f64> = (0..n)
            .map(|i| {
                let sigma = (n - i) as f64 / n as f64;
                shift * sigma / (1.0 + (shift - 1.0) * sigma)
            })
            .collect();
        let timesteps: Vec<f64> = sigmas.iter().map(|s| s * 1000.0).collect();
        sigmas.push(0.0);
        Self { sigmas, timesteps }
    }

    /// One timestep per inference step, in training-timestep units.
    pub fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    /// `num_inference_steps + 1` sigmas, ending at 0.
    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// Euler update: `x += (sigma_next - sigma) * v`.
    pub fn step(&self, model_output: &Tensor, sample: &Tensor, step_index: usize) -> Result<Tensor> {
        let dt = self.sigmas[step_index + 1] - self.sigmas[step_index];
        sample + (model_output * dt)?
    }

    /// Mix a clean sample with noise at the given step's sigma, for
    /// partial-schedule starts.
    pub fn scale_noise(&self, sample: &Tensor, noise: &Tensor, step_index: usize) -> Result<Tensor> {
        let sigma = self.sigmas[step_index];
        (sample * (1.0 - sigma))? + (noise * sigma)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    #[test]
    fn schedule_runs_from_noise_to_zero() {
        let scheduler = FlowMatchEulerScheduler::new(4, 1.0);
        assert_eq!(scheduler.timesteps().len(), 4);
        assert_eq!(scheduler.sigmas().len(), 5);
        assert_eq!(scheduler.sigmas()[0], 1.0);
        assert_eq!(*scheduler.sigmas().last().unwrap(), 0.0);
        for pair in scheduler.sigmas().windows(2) {
            assert!(pair[1] < pair[0]);
        }
    }

    #[test]
    fn shift_biases_towards_noise() {
        let unshifted = FlowMatchEulerScheduler::new(8, 1.0);
        let shifted = FlowMatchEulerScheduler::new(8, 3.0);
        // Interior sigmas grow under a shift > 1.
        for (a, b) in unshifted.sigmas()[1..8].iter().zip(&shifted.sigmas()[1..8]) {
            assert!(b > a);
        }
        // Endpoints are pinned.
        assert_eq!(shifted.sigmas()[0], 1.0);
        assert_eq!(*shifted.sigmas().last().unwrap(), 0.0);
    }

    #[test]
    fn euler_step_integrates_velocity() {
        let device = Device::Cpu;
        let scheduler = FlowMatchEulerScheduler::new(2, 1.0);
        let sample = Tensor::ones((1, 4), DType::F32, &device).unwrap();
        let velocity = Tensor::ones((1, 4), DType::F32, &device).unwrap();

        let dt = scheduler.sigmas()[1] - scheduler.sigmas()[0];
        let stepped = scheduler.step(&velocity, &sample, 0).unwrap();
        let values: Vec<f32> = stepped.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (*v - (1.0 + dt as f32)).abs() < 1e-6));
    }
}
