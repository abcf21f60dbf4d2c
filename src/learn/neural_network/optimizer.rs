#[cfg(doc)]
use super::autograd::Parameter;
use super::autograd::ParameterViewMutD;
use anyhow::{bail, Result};
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use serde::{Deserialize, Serialize};

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`SGD`].
    pub struct SGDBuilder {
        momentum: Option<f32>,
    }

    impl SGDBuilder {
        pub(super) fn new() -> Self {
            Self { momentum: None }
        }
        /// Momentum. Default is 0.
        ///
        /// If `momentum` is greater than 0, a "velocity" array will
        /// be added to the [`State`] of each [`Parameter`].
        pub fn momentum(self, momentum: f32) -> Self {
            Self {
                momentum: if momentum > 0. { Some(momentum) } else { None },
            }
        }
        /// Builds the optimizer.
        pub fn build(self) -> SGD {
            let Self { momentum } = self;
            SGD { momentum }
        }
    }
}
use builder::*;

/// [`State`] value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    /// An array.
    Tensor(ArrayD<f32>),
}

/// Optimizer State.
///
/// Stores per parameter training progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct State {
    name: String,
    key_values: Vec<(String, Value)>,
}

impl State {
    pub(crate) fn new(name: impl Into<String>, key_values: Vec<(String, Value)>) -> Self {
        Self {
            name: name.into(),
            key_values,
        }
    }
    /// Name of the [`Optimizer`].
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Iterator over keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.key_values
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }
    /// Iterator over keys and mutable values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.key_values
            .iter_mut()
            .map(|(key, value)| (key.as_str(), value))
    }
}

/// Optimizer.
pub trait Optimizer {
    /// Performs the optimization, updating the parameter with `learning_rate`.
    ///
    /// The gradient is consumed, so the next backward pass starts from zero.
    fn update(&self, learning_rate: f32, parameter: ParameterViewMutD) -> Result<()>;
}

/// Stochastic Gradient Descent.
#[derive(Default, Debug, Serialize, Deserialize)]
pub struct SGD {
    momentum: Option<f32>,
}

impl SGD {
    /// An SGD builder.
    pub fn builder() -> SGDBuilder {
        SGDBuilder::new()
    }
    /// The momentum.
    pub fn momentum(&self) -> f32 {
        self.momentum.unwrap_or_default()
    }
    fn init_state(&self, shape: &[usize], state: &mut Option<State>) {
        if let Some(state) = state.as_ref() {
            if state.name() == "SGD" && self.momentum.is_some() == state.iter().next().is_some() {
                return;
            }
        }
        let mut key_values = Vec::new();
        if self.momentum.is_some() {
            key_values.push((
                "velocity".to_string(),
                Value::Tensor(ArrayD::zeros(shape)),
            ));
        }
        state.replace(State::new("SGD", key_values));
    }
}

impl Optimizer for SGD {
    fn update(&self, learning_rate: f32, mut parameter: ParameterViewMutD) -> Result<()> {
        let shape = parameter.shape().to_vec();
        let grad = if let Some(grad) = parameter.take_grad() {
            grad
        } else {
            return Ok(());
        };
        let (mut value, state) = parameter.value_optimizer_state_mut();
        if let Some(momentum) = self.momentum {
            self.init_state(&shape, state);
            let velocity = state
                .as_mut()
                .and_then(|state| state.iter_mut().next())
                .map(|(_, velocity)| velocity);
            if let Some(Value::Tensor(velocity)) = velocity {
                sgd_update_with_momentum(
                    value.view_mut(),
                    learning_rate,
                    grad.view(),
                    momentum,
                    velocity.view_mut(),
                );
            } else {
                bail!("SGD velocity not initialized!");
            }
        } else {
            value.scaled_add(-learning_rate, &grad);
        }
        Ok(())
    }
}

fn sgd_update_with_momentum(
    value: ArrayViewMutD<f32>,
    learning_rate: f32,
    grad: ArrayViewD<f32>,
    momentum: f32,
    velocity: ArrayViewMutD<f32>,
) {
    Zip::from(value)
        .and(grad)
        .and(velocity)
        .for_each(|w, dw, v| {
            *v = momentum * *v + dw;
            *w -= learning_rate * *v;
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::{Parameter, Variable};
    use approx::assert_relative_eq;
    use ndarray::{arr0, arr1, ArcArray, Ix0};

    fn set_grad(parameter: &Parameter<ndarray::Ix1>, grad: [f32; 2]) -> Result<()> {
        let variable = parameter.to_variable();
        let mut builder = Variable::builder();
        if let Some(node) = variable.node() {
            builder.edge(node, move |_: ArcArray<f32, Ix0>| {
                Ok(arr1(&grad).into_shared())
            });
        }
        builder.build(arr0(0f32).into_shared()).backward()
    }

    #[test]
    fn sgd() -> Result<()> {
        let mut parameter = Parameter::from(arr1(&[1f32, 2.]));
        parameter.set_training(true);
        set_grad(&parameter, [1., -1.])?;
        SGD::default().update(0.5, parameter.make_view_mut().into_dyn())?;
        assert_relative_eq!(parameter.value().view(), arr1(&[0.5, 2.5]));
        // gradient was consumed
        assert!(parameter.grad().is_none());
        SGD::default().update(0.5, parameter.make_view_mut().into_dyn())?;
        assert_relative_eq!(parameter.value().view(), arr1(&[0.5, 2.5]));
        Ok(())
    }

    #[test]
    fn sgd_momentum() -> Result<()> {
        let mut parameter = Parameter::from(arr1(&[0f32, 0.]));
        parameter.set_training(true);
        let sgd = SGD::builder().momentum(0.5).build();
        for _ in 0..2 {
            set_grad(&parameter, [1., 2.])?;
            sgd.update(1., parameter.make_view_mut().into_dyn())?;
        }
        // v1 = g, v2 = 0.5 g + g
        assert_relative_eq!(parameter.value().view(), arr1(&[-2.5, -5.]));
        Ok(())
    }
}
