//! Allocation policies mapping an environment observation to weights.

use crate::domain::error::FiioptError;
use crate::domain::simplex::CappedSimplex;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Anything that turns an observation into a feasible allocation.
pub trait AllocationPolicy: Send + Sync {
    /// Weights on the capped simplex for `observation`.
    fn allocate(&self, observation: &[f64]) -> Result<Vec<f64>, FiioptError>;

    fn asset_count(&self) -> usize;
}

/// `project(softmax(W·obs + b))`.
///
/// Zero parameters give uniform weights, which is the untrained policy.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSoftmaxPolicy {
    weights: DMatrix<f64>,
    bias: DVector<f64>,
    simplex: CappedSimplex,
}

/// One exploratory action and what is needed to compute its score function.
#[derive(Debug, Clone)]
pub(crate) struct SampledAction {
    pub observation: DVector<f64>,
    /// Standard-normal noise added to the logits (before scaling).
    pub noise: DVector<f64>,
    pub weights: Vec<f64>,
}

impl LinearSoftmaxPolicy {
    pub fn new(observation_dim: usize, simplex: CappedSimplex) -> Self {
        let n = simplex.dim();
        Self {
            weights: DMatrix::zeros(n, observation_dim),
            bias: DVector::zeros(n),
            simplex,
        }
    }

    pub fn observation_dim(&self) -> usize {
        self.weights.ncols()
    }

    pub fn parameter_count(&self) -> usize {
        self.weights.len() + self.bias.len()
    }

    pub fn simplex(&self) -> CappedSimplex {
        self.simplex
    }

    fn check(&self, observation: &[f64]) -> Result<DVector<f64>, FiioptError> {
        if observation.len() != self.observation_dim() {
            return Err(FiioptError::Data {
                reason: format!(
                    "observation of length {} for a policy expecting {}",
                    observation.len(),
                    self.observation_dim()
                ),
            });
        }
        Ok(DVector::from_column_slice(observation))
    }

    fn logits(&self, observation: &DVector<f64>) -> DVector<f64> {
        &self.weights * observation + &self.bias
    }

    fn to_weights(&self, logits: &DVector<f64>) -> Vec<f64> {
        self.simplex.project(softmax(logits).as_slice())
    }

    /// Gaussian exploration on the logits.
    pub(crate) fn sample<R: Rng + ?Sized>(
        &self,
        observation: &[f64],
        exploration_std: f64,
        rng: &mut R,
    ) -> Result<SampledAction, FiioptError> {
        let observation = self.check(observation)?;
        let noise = DVector::from_fn(self.bias.len(), |_, _| {
            let z: f64 = StandardNormal.sample(&mut *rng);
            z
        });
        let logits = self.logits(&observation) + &noise * exploration_std;
        Ok(SampledAction {
            weights: self.to_weights(&logits),
            observation,
            noise,
        })
    }

    /// Gradient ascent step on `(W, b)`.
    pub(crate) fn apply_update(
        &mut self,
        grad_weights: &DMatrix<f64>,
        grad_bias: &DVector<f64>,
        learning_rate: f64,
    ) {
        self.weights += grad_weights * learning_rate;
        self.bias += grad_bias * learning_rate;
    }

    pub(crate) fn zero_gradient(&self) -> (DMatrix<f64>, DVector<f64>) {
        (
            DMatrix::zeros(self.weights.nrows(), self.weights.ncols()),
            DVector::zeros(self.bias.len()),
        )
    }
}

impl AllocationPolicy for LinearSoftmaxPolicy {
    fn allocate(&self, observation: &[f64]) -> Result<Vec<f64>, FiioptError> {
        let observation = self.check(observation)?;
        Ok(self.to_weights(&self.logits(&observation)))
    }

    fn asset_count(&self) -> usize {
        self.simplex.dim()
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &DVector<f64>) -> DVector<f64> {
    let max = logits.max();
    let exp = logits.map(|x| (x - max).exp());
    let total = exp.sum();
    exp / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn untrained_policy_is_uniform() {
        let simplex = CappedSimplex::new(4, 0.3).unwrap();
        let policy = LinearSoftmaxPolicy::new(6, simplex);
        let w = policy.allocate(&[1.0, -2.0, 3.0, 0.5, 0.0, 9.0]).unwrap();
        for x in w {
            assert_abs_diff_eq!(x, 0.25, epsilon = 1e-12);
        }
    }

    #[test]
    fn wrong_observation_length_is_an_error() {
        let simplex = CappedSimplex::new(2, 1.0).unwrap();
        let policy = LinearSoftmaxPolicy::new(3, simplex);
        assert!(matches!(
            policy.allocate(&[1.0]).unwrap_err(),
            FiioptError::Data { .. }
        ));
    }

    #[test]
    fn softmax_sums_to_one_for_large_logits() {
        let p = softmax(&DVector::from_column_slice(&[1000.0, 999.0, -1000.0]));
        assert_abs_diff_eq!(p.sum(), 1.0, epsilon = 1e-12);
        assert!(p[0] > p[1] && p[1] > p[2]);
    }

    #[test]
    fn sampled_actions_respect_the_cap() {
        let simplex = CappedSimplex::new(3, 0.4).unwrap();
        let policy = LinearSoftmaxPolicy::new(2, simplex);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let a = policy.sample(&[0.1, 0.2], 3.0, &mut rng).unwrap();
            assert!(simplex.contains(&a.weights, 1e-9));
            assert_eq!(a.noise.len(), 3);
        }
    }

    #[test]
    fn bias_update_tilts_allocation() {
        let simplex = CappedSimplex::new(2, 1.0).unwrap();
        let mut policy = LinearSoftmaxPolicy::new(1, simplex);
        let (gw, mut gb) = policy.zero_gradient();
        gb[0] = 1.0;
        policy.apply_update(&gw, &gb, 1.0);
        let w = policy.allocate(&[0.0]).unwrap();
        assert!(w[0] > w[1]);
        assert_abs_diff_eq!(w[0], 1.0_f64.exp() / (1.0_f64.exp() + 1.0), epsilon = 1e-9);
    }
}
