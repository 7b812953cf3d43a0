use super::parameter::Parameter;
use crate::error::{Error, Result};
use crate::tensor::{Device, Tensor, TensorElem};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Snapshot of a module's parameter values keyed by parameter name.
pub type StateDict<T> = BTreeMap<String, Tensor<T>>;

/// A Module trait for models driven by a training strategy.
///
/// # Why is this needed?
///
/// A strategy does not know what a model computes; it only needs to enumerate the model's
/// parameters. Everything else (device placement, state snapshots, initial broadcast,
/// restricting a distributed optimizer to its own slice of parameters) is derived from
/// [`Module::named_parameters`].
///
/// Requiring `Send` and `Sync` keeps models movable onto rank threads, and `Debug` keeps
/// the structure of any model inspectable.
pub trait Module<T: TensorElem>: Debug + Send + Sync {
    /// All trainable parameters with stable, unique names, in a deterministic order.
    ///
    /// The order must be identical on every rank: collectives over parameters are matched by
    /// position.
    fn named_parameters(&self) -> Vec<(String, Parameter<T>)>;

    fn parameters(&self) -> Vec<Parameter<T>> {
        self.named_parameters().into_iter().map(|(_, p)| p).collect()
    }

    /// Copies every parameter value into a [`StateDict`].
    fn state_dict(&self) -> StateDict<T> {
        self.named_parameters()
            .into_iter()
            .map(|(name, p)| (name, p.value()))
            .collect()
    }

    /// Writes the values in `state` into the matching parameters.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownParameter` for names the module does not have, or a shape error.
    fn load_state_dict(&self, state: &StateDict<T>) -> Result<()> {
        let params: BTreeMap<String, Parameter<T>> = self.named_parameters().into_iter().collect();
        for (name, value) in state {
            let param = params
                .get(name)
                .ok_or_else(|| Error::UnknownParameter(name.clone()))?;
            param.set_value(value)?;
        }
        Ok(())
    }

    /// Binds every parameter to `device`.
    fn to_device(&self, device: Device) {
        for param in self.parameters() {
            param.to_device(device);
        }
    }
}
