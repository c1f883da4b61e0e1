//! The six per-row update rules.
//!
//! Every rule works on one row: `weight` and `grad` are `vec_size` long and `state` holds
//! [`OptHyperParams::state_slots`] consecutive `vec_size` blocks.
//!
//! # Formulas
//!
//! $$
//! \begin{aligned}
//! & \text{SGD:} && w \leftarrow w - \eta g \\
//! & \text{Momentum:} && m \leftarrow \mu m - \eta g,\; w \leftarrow w + m \\
//! & \text{Nesterov:} && a' \leftarrow \mu a - \eta g,\; w \leftarrow w - \mu a + (1 + \mu) a' \\
//! & \text{AdaGrad:} && s \leftarrow s + g^2,\; w \leftarrow w - \eta g / (\sqrt{s} + \epsilon) \\
//! & \text{Adam:} && \eta_t = \eta \sqrt{1 - \beta_2^t} / (1 - \beta_1^t),\; w \leftarrow w - \eta_t m / (\sqrt{v} + \epsilon) \\
//! & \text{Ftrl:} && z \leftarrow z + g - \sigma w,\; w = -(z - \mathrm{sgn}(z)\lambda_1) / ((\beta + \sqrt{n}) / \eta + \lambda_2)
//! \end{aligned}
//! $$

use super::OptHyperParams;

/// Length of the per-row state vector.
pub fn state_len(hp: &OptHyperParams, vec_size: usize) -> usize {
    hp.state_slots() * vec_size
}

/// Fresh state of one row.
pub fn init_state(hp: &OptHyperParams, vec_size: usize) -> Vec<f32> {
    match *hp {
        OptHyperParams::AdaGrad {
            initial_accu_value,
            ..
        } => vec![initial_accu_value; vec_size],
        _ => vec![0.0; state_len(hp, vec_size)],
    }
}

/// Applies one rule to one row in place.
///
/// `step` is the 1-based step used for Adam bias correction. `scaler` divides the gradient
/// before the rule runs.
#[allow(clippy::too_many_arguments)]
pub fn apply_update(
    hp: &OptHyperParams,
    lr: f32,
    scaler: f32,
    step: u64,
    weight: &mut [f32],
    state: &mut [f32],
    grad: &[f32],
) {
    let n = weight.len();
    debug_assert_eq!(grad.len(), n);
    debug_assert_eq!(state.len(), hp.state_slots() * n);
    let g = |i: usize| grad[i] / scaler;

    match *hp {
        OptHyperParams::Sgd { .. } => {
            for (i, w) in weight.iter_mut().enumerate() {
                *w -= lr * g(i);
            }
        }
        OptHyperParams::MomentumSgd { factor } => {
            for (i, (w, m)) in weight.iter_mut().zip(state.iter_mut()).enumerate() {
                *m = factor * *m - lr * g(i);
                *w += *m;
            }
        }
        OptHyperParams::Nesterov { mu } => {
            for (i, (w, a)) in weight.iter_mut().zip(state.iter_mut()).enumerate() {
                let accum_old = *a;
                *a = mu * *a - lr * g(i);
                *w += -mu * accum_old + (1.0 + mu) * *a;
            }
        }
        OptHyperParams::AdaGrad { epsilon, .. } => {
            for (i, (w, s)) in weight.iter_mut().zip(state.iter_mut()).enumerate() {
                let gi = g(i);
                *s += gi * gi;
                *w -= lr * gi / (s.sqrt() + epsilon);
            }
        }
        OptHyperParams::Adam {
            beta1,
            beta2,
            epsilon,
        } => {
            let t = step.max(1) as i32;
            let b1_t = beta1.powi(t);
            let b2_t = beta2.powi(t);
            let lr_t = lr * (1.0 - b2_t).sqrt() / (1.0 - b1_t);
            let (m, v) = state.split_at_mut(n);
            for i in 0..n {
                let gi = g(i);
                m[i] = beta1 * m[i] + (1.0 - beta1) * gi;
                v[i] = beta2 * v[i] + (1.0 - beta2) * gi * gi;
                weight[i] -= lr_t * m[i] / (v[i].sqrt() + epsilon);
            }
        }
        OptHyperParams::Ftrl {
            beta,
            lambda1,
            lambda2,
        } => {
            // sigma divides by the rate
            if !(lr > 0.0) {
                return;
            }
            let (z, acc) = state.split_at_mut(n);
            for i in 0..n {
                let gi = g(i);
                let n_new = acc[i] + gi * gi;
                // no gradient has ever reached this element
                if n_new == 0.0 {
                    continue;
                }
                let sigma = (n_new.sqrt() - acc[i].sqrt()) / lr;
                z[i] += gi - sigma * weight[i];
                acc[i] = n_new;
                weight[i] = if z[i].abs() <= lambda1 {
                    0.0
                } else {
                    -(z[i] - z[i].signum() * lambda1) / ((beta + n_new.sqrt()) / lr + lambda2)
                };
            }
        }
    }
}
