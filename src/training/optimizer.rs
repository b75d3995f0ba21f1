/// Adam optimizer with L2 weight decay
///
/// Weight decay is added to the gradient before the moment updates (coupled
/// L2 regularisation), not applied to the weights directly.
use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::Optimizer;

/// Adam optimizer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AdamConfig {
    /// Learning rate
    pub lr: f64,
    /// Coefficient for computing running averages of gradient (beta1)
    pub beta1: f64,
    /// Coefficient for computing running averages of squared gradient (beta2)
    pub beta2: f64,
    /// Term added to denominator for numerical stability
    pub eps: f64,
    /// L2 penalty coefficient
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl AdamConfig {
    /// Fixed betas/eps with the given learning rate and weight decay
    pub fn new(lr: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            weight_decay,
            ..Default::default()
        }
    }
}

/// Parameter state for Adam
#[derive(Debug)]
struct ParamState {
    var: Var,
    /// First moment estimate (exponential moving average of gradients)
    m: Tensor,
    /// Second moment estimate (exponential moving average of squared gradients)
    v: Tensor,
}

/// Adam optimizer
pub struct Adam {
    config: AdamConfig,
    states: Vec<ParamState>,
    step: usize,
}

impl Adam {
    /// Current configuration
    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Number of optimisation steps taken
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Number of parameters being optimised
    pub fn num_params(&self) -> usize {
        self.states.len()
    }

    /// Fresh optimizer over `vars` with a new learning rate
    ///
    /// Moment estimates are not carried over.
    pub fn rebuild(&self, vars: Vec<Var>, lr: f64) -> Result<Self> {
        Self::new(vars, AdamConfig { lr, ..self.config.clone() })
    }
}

impl Optimizer for Adam {
    type Config = AdamConfig;

    fn new(vars: Vec<Var>, config: AdamConfig) -> Result<Self> {
        let states = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let m = var.zeros_like()?;
                let v = var.zeros_like()?;
                Ok(ParamState { var, m, v })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            states,
            step: 0,
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step += 1;

        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;

        let bias_correction1 = 1.0 - beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step as i32);

        for state in self.states.iter_mut() {
            // Batch-norm running statistics never receive gradients
            let Some(grad) = grads.get(&state.var) else {
                continue;
            };
            let param = state.var.as_tensor().detach();

            let grad = if weight_decay > 0.0 {
                (grad + (&param * weight_decay)?)?
            } else {
                grad.clone()
            };

            state.m = ((&state.m * beta1)? + (&grad * (1.0 - beta1))?)?;
            state.v = ((&state.v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let m_hat = (&state.m / bias_correction1)?;
            let v_hat = (&state.v / bias_correction2)?;
            let update = ((m_hat / (v_hat.sqrt()? + eps)?)? * lr)?;

            state.var.set(&(param - update)?)?;
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}
