//! Policy-gradient training of a [`LinearSoftmaxPolicy`] on an
//! [`AllocationEnv`].
//!
//! Training proceeds in phases. A phase rolls out up to `envs_per_phase`
//! episodes in parallel, each on its own clone of the environment with its
//! own seeded generator, then reduces their gradients in worker order and
//! applies a single update. Exactly `timesteps` environment steps are taken.
//!
//! Rollout order and reduction order are fixed, but the resulting policy is
//! only reproducible for a given seed on a given build.

use crate::domain::environment::AllocationEnv;
use crate::domain::error::FiioptError;
use crate::domain::policy::{LinearSoftmaxPolicy, SampledAction};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Cooperative cancellation, checked between rollout phases.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub timesteps: usize,
    /// `None` draws a fresh seed, reported back in [`TrainingReport::seed`].
    pub seed: Option<u64>,
    pub learning_rate: f64,
    pub exploration_std: f64,
    pub discount: f64,
    pub envs_per_phase: usize,
    pub max_grad_norm: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            timesteps: 10_000,
            seed: None,
            learning_rate: 0.01,
            exploration_std: 0.5,
            discount: 0.99,
            envs_per_phase: 4,
            max_grad_norm: 1.0,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), FiioptError> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(FiioptError::invalid(
                "drl",
                "learning_rate",
                "learning_rate must be positive",
            ));
        }
        if !(self.exploration_std.is_finite() && self.exploration_std > 0.0) {
            return Err(FiioptError::invalid(
                "drl",
                "exploration_std",
                "exploration_std must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.discount) {
            return Err(FiioptError::invalid(
                "drl",
                "discount",
                "discount must be in [0, 1]",
            ));
        }
        if self.envs_per_phase == 0 {
            return Err(FiioptError::invalid(
                "drl",
                "envs_per_phase",
                "envs_per_phase must be positive",
            ));
        }
        if !(self.max_grad_norm.is_finite() && self.max_grad_norm > 0.0) {
            return Err(FiioptError::invalid(
                "drl",
                "max_grad_norm",
                "max_grad_norm must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseStats {
    pub phase: usize,
    pub steps: usize,
    pub episodes: usize,
    pub mean_reward: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub seed: u64,
    pub timesteps: usize,
    pub phases: Vec<PhaseStats>,
}

impl TrainingReport {
    pub fn final_mean_reward(&self) -> Option<f64> {
        self.phases.last().map(|p| p.mean_reward)
    }
}

/// The frozen policy and how it was obtained.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub policy: LinearSoftmaxPolicy,
    pub report: TrainingReport,
}

struct Trajectory {
    actions: Vec<SampledAction>,
    rewards: Vec<f64>,
}

pub fn train(
    env: &AllocationEnv,
    config: &TrainingConfig,
    cancel: &CancellationToken,
) -> Result<TrainingOutcome, FiioptError> {
    config.validate()?;
    let seed = config.seed.unwrap_or_else(rand::random);
    let mut policy = LinearSoftmaxPolicy::new(env.observation_dim(), env.simplex());
    let horizon = env.horizon();

    info!(
        "training policy: {} timesteps, seed {}, {} parameters",
        config.timesteps,
        seed,
        policy.parameter_count()
    );

    let mut completed = 0usize;
    let mut phases = Vec::new();
    while completed < config.timesteps {
        if cancel.is_cancelled() {
            info!("training cancelled after {} timesteps", completed);
            return Err(FiioptError::Cancelled {
                completed_timesteps: completed,
            });
        }

        let budgets = phase_budgets(config.timesteps - completed, horizon, config.envs_per_phase);
        let phase = phases.len();
        let trajectories = budgets
            .par_iter()
            .enumerate()
            .map(|(worker, &budget)| {
                let mut env = env.clone();
                let mut rng = StdRng::seed_from_u64(worker_seed(seed, phase, worker));
                rollout(&policy, &mut env, budget, config.exploration_std, &mut rng)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let steps: usize = budgets.iter().sum();
        let reward_sum: f64 = trajectories.iter().flat_map(|t| t.rewards.iter()).sum();
        let (grad_w, grad_b) = gradient(&policy, &trajectories, config);
        policy.apply_update(&grad_w, &grad_b, config.learning_rate);

        let stats = PhaseStats {
            phase,
            steps,
            episodes: trajectories.len(),
            mean_reward: reward_sum / steps as f64,
        };
        debug!(
            "phase {}: {} steps, mean reward {:.6}",
            stats.phase, stats.steps, stats.mean_reward
        );
        phases.push(stats);
        completed += steps;
    }

    info!("training finished after {} phases", phases.len());
    Ok(TrainingOutcome {
        policy,
        report: TrainingReport {
            seed,
            timesteps: completed,
            phases,
        },
    })
}

/// Split `remaining` steps into at most `workers` episodes of at most
/// `horizon` steps each.
fn phase_budgets(remaining: usize, horizon: usize, workers: usize) -> Vec<usize> {
    let mut left = remaining;
    let mut budgets = Vec::with_capacity(workers);
    for _ in 0..workers {
        if left == 0 {
            break;
        }
        let b = left.min(horizon);
        budgets.push(b);
        left -= b;
    }
    budgets
}

fn worker_seed(seed: u64, phase: usize, worker: usize) -> u64 {
    seed ^ (phase as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (worker as u64 + 1).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
}

fn rollout(
    policy: &LinearSoftmaxPolicy,
    env: &mut AllocationEnv,
    budget: usize,
    exploration_std: f64,
    rng: &mut StdRng,
) -> Result<Trajectory, FiioptError> {
    let mut observation = env.reset();
    let mut actions = Vec::with_capacity(budget);
    let mut rewards = Vec::with_capacity(budget);
    for _ in 0..budget {
        let action = policy.sample(&observation, exploration_std, rng)?;
        let outcome = env.step(&action.weights)?;
        actions.push(action);
        rewards.push(outcome.reward);
        observation = outcome.observation;
        if outcome.done {
            break;
        }
    }
    Ok(Trajectory { actions, rewards })
}

/// REINFORCE estimate with batch-normalized discounted returns, averaged per
/// step and clipped to `max_grad_norm`.
fn gradient(
    policy: &LinearSoftmaxPolicy,
    trajectories: &[Trajectory],
    config: &TrainingConfig,
) -> (DMatrix<f64>, DVector<f64>) {
    let returns: Vec<Vec<f64>> = trajectories
        .iter()
        .map(|t| discounted(&t.rewards, config.discount))
        .collect();
    let flat: Vec<f64> = returns.iter().flatten().copied().collect();
    let (mut grad_w, mut grad_b) = policy.zero_gradient();
    if flat.is_empty() {
        return (grad_w, grad_b);
    }
    let mean = flat.iter().sum::<f64>() / flat.len() as f64;
    let var = flat.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / flat.len() as f64;
    let scale = if var.sqrt() > 1e-12 { 1.0 / var.sqrt() } else { 1.0 };

    for (trajectory, returns) in trajectories.iter().zip(&returns) {
        for (action, g) in trajectory.actions.iter().zip(returns) {
            let advantage = (g - mean) * scale;
            // d/dmu log N(z; mu, s^2) = eps / s
            let score = &action.noise * (advantage / config.exploration_std);
            grad_w += &score * action.observation.transpose();
            grad_b += score;
        }
    }
    let steps = flat.len() as f64;
    grad_w /= steps;
    grad_b /= steps;

    let norm = (grad_w.norm_squared() + grad_b.norm_squared()).sqrt();
    if norm > config.max_grad_norm {
        let shrink = config.max_grad_norm / norm;
        grad_w *= shrink;
        grad_b *= shrink;
    }
    (grad_w, grad_b)
}

fn discounted(rewards: &[f64], discount: f64) -> Vec<f64> {
    let mut out = vec![0.0; rewards.len()];
    let mut running = 0.0;
    for (i, r) in rewards.iter().enumerate().rev() {
        running = r + discount * running;
        out[i] = running;
    }
    out
}
