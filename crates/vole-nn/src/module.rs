// Module trait: The interface every layer implements
//
// A module is a plain struct that owns:
//   - a ModuleState (its own parameters and buffers, see state.rs)
//   - zero or more child modules as ordinary fields
//
// and implements three required methods: forward(), state(), state_mut().
// Layers with children also implement children()/children_mut(), listing
// each child under the name it declared in its ModuleState.
//
// Everything else is provided and walks the module tree:
//
//   named_parameters / parameters   optimizer-facing set, never buffers
//   named_buffers / buffers         persistent and transient buffers
//   to_device                       relocate every slot of every descendant
//   state_dict                      parameters + persistent buffers, dotted keys
//   load_state_dict                 validate everything, then copy in place
//   set_training / train / eval     recursive mode switch
//
// GENERIC OVER BACKEND:
//
// All modules are generic over B: Backend, so the same module definition
// runs on any backend. The trait is object safe, so containers such as
// Sequential hold Box<dyn Module<B>>.

use std::collections::HashSet;

use log::{debug, warn};

use vole_core::backend::{Backend, BackendDevice};
use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::state::{ModuleState, Slot};
use crate::state_dict::{LoadReport, StateDict};

/// The fundamental trait for all layers.
///
/// # Example
/// ```ignore
/// struct Head<B: Backend> {
///     state: ModuleState<B>,
///     proj: Linear<B>,
/// }
///
/// impl<B: Backend> Module<B> for Head<B> {
///     fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
///         self.proj.forward(x)?.softmax(1)
///     }
///     fn state(&self) -> &ModuleState<B> { &self.state }
///     fn state_mut(&mut self) -> &mut ModuleState<B> { &mut self.state }
///     fn children(&self) -> Vec<(&str, &dyn Module<B>)> {
///         vec![("proj", &self.proj as &dyn Module<B>)]
///     }
///     fn children_mut(&mut self) -> Vec<(&str, &mut dyn Module<B>)> {
///         vec![("proj", &mut self.proj as &mut dyn Module<B>)]
///     }
/// }
/// ```
pub trait Module<B: Backend> {
    /// Compute the output tensor from the input tensor.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>>;

    /// This module's own registry (children excluded).
    fn state(&self) -> &ModuleState<B>;

    fn state_mut(&mut self) -> &mut ModuleState<B>;

    /// Direct children with the names they were declared under.
    fn children(&self) -> Vec<(&str, &dyn Module<B>)> {
        Vec::new()
    }

    /// Mutable counterpart of [`children`](Module::children), same order.
    fn children_mut(&mut self) -> Vec<(&str, &mut dyn Module<B>)> {
        Vec::new()
    }

    // Registration

    /// Register a trainable tensor on this module.
    fn register_parameter(&mut self, name: &str, tensor: Tensor<B>) -> Result<()> {
        self.state_mut().register_parameter(name, tensor)
    }

    /// Register a non-trainable tensor on this module.
    ///
    /// Buffers follow the module through [`to_device`](Module::to_device).
    /// Only persistent buffers appear in [`state_dict`](Module::state_dict).
    fn register_buffer(&mut self, name: &str, tensor: Tensor<B>, persistent: bool) -> Result<()> {
        self.state_mut().register_buffer(name, tensor, persistent)
    }

    // Traversal

    /// Every slot of this module and its descendants under its dotted path,
    /// parents first, declaration order within a module.
    fn named_slots(&self) -> Vec<(String, Slot<B>)> {
        let mut out: Vec<(String, Slot<B>)> = self
            .state()
            .slots()
            .iter()
            .map(|s| (s.name().to_string(), s.clone()))
            .collect();
        for (name, child) in self.children() {
            out.extend(
                child
                    .named_slots()
                    .into_iter()
                    .map(|(key, slot)| (format!("{name}.{key}"), slot)),
            );
        }
        out
    }

    /// All parameters with their dotted names.
    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        self.named_slots()
            .into_iter()
            .filter(|(_, s)| s.kind().is_parameter())
            .map(|(k, s)| (k, s.tensor().clone()))
            .collect()
    }

    /// All trainable parameters. The optimizer updates exactly this set.
    fn parameters(&self) -> Vec<Tensor<B>> {
        self.named_parameters().into_iter().map(|(_, t)| t).collect()
    }

    /// All buffers, persistent or not, with their dotted names.
    fn named_buffers(&self) -> Vec<(String, Tensor<B>)> {
        self.named_slots()
            .into_iter()
            .filter(|(_, s)| s.kind().is_buffer())
            .map(|(k, s)| (k, s.tensor().clone()))
            .collect()
    }

    fn buffers(&self) -> Vec<Tensor<B>> {
        self.named_buffers().into_iter().map(|(_, t)| t).collect()
    }

    /// Total number of scalar parameters in this module.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }

    /// Number of trainable (variable) parameters.
    fn trainable_params_count(&self) -> usize {
        self.parameters()
            .iter()
            .filter(|p| p.is_variable())
            .map(|p| p.elem_count())
            .sum()
    }

    // Mode

    /// Set training or evaluation mode on this module and every descendant.
    fn set_training(&self, training: bool) {
        self.state().set_training(training);
        for (_, child) in self.children() {
            child.set_training(training);
        }
    }

    fn is_training(&self) -> bool {
        self.state().is_training()
    }

    fn train(&self) {
        self.set_training(true);
    }

    fn eval(&self) {
        self.set_training(false);
    }

    // Relocation

    /// Move every parameter and buffer of this module and all descendants to
    /// `device`. Own slots move first, then children in declaration order.
    ///
    /// Each tensor is replaced by a copy on `device`. A tensor handle taken
    /// from the module before the call keeps reading the old copy on the old
    /// device; fetch it again afterwards.
    fn to_device(&mut self, device: &B::Device) -> Result<()> {
        self.state_mut().to_device(device)?;
        for (name, child) in self.children_mut() {
            debug!("moving child module '{name}' to {}", device.name());
            child.to_device(device)?;
        }
        Ok(())
    }

    // Serialization

    /// Parameters and persistent buffers under dotted names.
    ///
    /// The returned tensors share storage with the registered ones, so the
    /// export reflects in-place mutations made before (or after) the call.
    /// Transient buffers and unregistered fields are never included.
    fn state_dict(&self) -> StateDict<B> {
        self.named_slots()
            .into_iter()
            .filter(|(_, s)| s.kind().is_persistent())
            .map(|(k, s)| (k, s.tensor().detach()))
            .collect()
    }

    /// Overwrite parameters and persistent buffers in place from `state`.
    ///
    /// With `strict = true` the key sets must match exactly, otherwise
    /// [`Error::KeyMismatch`] lists the missing and unexpected keys. With
    /// `strict = false` matching keys are loaded, missing slots are left
    /// untouched, and both lists come back in the [`LoadReport`].
    ///
    /// Shapes and dtypes of every matching key are checked, and values on
    /// another device are staged onto the device of the registered tensor,
    /// before anything is written, so a failed load leaves the module
    /// unchanged. Values are written through each slot's layout: a buffer
    /// registered as a view of larger storage is filled in place and the
    /// storage it shares sees the new values.
    fn load_state_dict(&self, state: &StateDict<B>, strict: bool) -> Result<LoadReport> {
        let targets: Vec<(String, Tensor<B>)> = self
            .named_slots()
            .into_iter()
            .filter(|(_, s)| s.kind().is_persistent())
            .map(|(k, s)| (k, s.tensor().clone()))
            .collect();

        let known: HashSet<&str> = targets.iter().map(|(k, _)| k.as_str()).collect();
        let missing: Vec<String> = targets
            .iter()
            .filter(|(k, _)| !state.contains_key(k))
            .map(|(k, _)| k.clone())
            .collect();
        let unexpected: Vec<String> = state
            .keys()
            .filter(|k| !known.contains(k))
            .map(str::to_string)
            .collect();

        if strict && (!missing.is_empty() || !unexpected.is_empty()) {
            return Err(Error::KeyMismatch {
                missing,
                unexpected,
            });
        }

        let mut plan = Vec::with_capacity(targets.len());
        for (key, target) in &targets {
            let Some(src) = state.get(key) else {
                continue;
            };
            if src.shape() != target.shape() || src.dtype() != target.dtype() {
                return Err(Error::StateShapeMismatch {
                    key: key.clone(),
                    expected_shape: target.shape().clone(),
                    expected_dtype: target.dtype(),
                    got_shape: src.shape().clone(),
                    got_dtype: src.dtype(),
                });
            }
            plan.push((key, target, src.to_device(target.device())?));
        }

        let mut applied = Vec::with_capacity(plan.len());
        for (key, target, staged) in plan {
            target.copy_from(&staged)?;
            applied.push(key.clone());
        }

        if !missing.is_empty() {
            warn!("load_state_dict: missing keys left untouched: [{}]", missing.join(", "));
        }
        if !unexpected.is_empty() {
            warn!("load_state_dict: unexpected keys ignored: [{}]", unexpected.join(", "));
        }
        debug!("load_state_dict: applied {} tensors", applied.len());

        Ok(LoadReport {
            applied,
            missing,
            unexpected,
        })
    }
}
