// ModuleState: per-module registry of parameters and buffers
//
// Every layer owns one ModuleState. It records, in declaration order, the
// tensors the layer wants the framework to manage:
//
//   Parameter          trainable, relocated, exported
//   PersistentBuffer   not trainable, relocated, exported
//   TransientBuffer    not trainable, relocated, NOT exported
//
// plus the names of the layer's child modules. Parameters, buffers and
// children share one namespace, so a layer can never register "mask" twice
// or shadow a child called "w_query" with a buffer.
//
// A tensor stored as a plain struct field instead of in the registry is
// invisible to all of this: it does not move with `to_device` and it never
// appears in a state dict.
//
// DECLARATION:
//
//   let state = ModuleState::builder()
//       .parameter("weight", weight)
//       .buffer("running_mean", zeros)
//       .transient_buffer("scratch", tmp)
//       .child("proj")
//       .build()?;
//
// The builder records the first failure and reports it from build(), so a
// constructor can declare everything in one expression.

use std::cell::Cell;
use std::fmt;

use log::debug;

use vole_core::backend::{Backend, BackendDevice};
use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

/// What a registered tensor is, and therefore how the framework treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Trainable; handed to the optimizer.
    Parameter,
    /// Non-trainable state that is serialized with the module.
    PersistentBuffer,
    /// Non-trainable state that follows the module across devices but is
    /// never serialized.
    TransientBuffer,
}

impl SlotKind {
    pub fn is_parameter(&self) -> bool {
        matches!(self, SlotKind::Parameter)
    }

    pub fn is_buffer(&self) -> bool {
        !self.is_parameter()
    }

    /// Whether the slot appears in `state_dict` and is targeted by
    /// `load_state_dict`.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, SlotKind::TransientBuffer)
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotKind::Parameter => "parameter",
            SlotKind::PersistentBuffer => "persistent buffer",
            SlotKind::TransientBuffer => "transient buffer",
        };
        f.write_str(s)
    }
}

/// A named tensor in a module's registry.
pub struct Slot<B: Backend> {
    name: String,
    kind: SlotKind,
    tensor: Tensor<B>,
}

impl<B: Backend> Clone for Slot<B> {
    fn clone(&self) -> Self {
        Slot {
            name: self.name.clone(),
            kind: self.kind,
            tensor: self.tensor.clone(),
        }
    }
}

impl<B: Backend> fmt::Debug for Slot<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({} '{}': {:?})", self.kind, self.name, self.tensor)
    }
}

impl<B: Backend> Slot<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    pub fn tensor(&self) -> &Tensor<B> {
        &self.tensor
    }
}

/// Coerce the gradient flag to what the slot kind demands.
///
/// Both branches share the caller's storage, so the caller's handle keeps
/// observing in-place writes made through the registry.
fn tag<B: Backend>(kind: SlotKind, tensor: Tensor<B>) -> Tensor<B> {
    match kind {
        SlotKind::Parameter if !tensor.is_variable() => tensor.set_variable(),
        SlotKind::PersistentBuffer | SlotKind::TransientBuffer if tensor.is_variable() => {
            tensor.freeze()
        }
        _ => tensor,
    }
}

/// The parameters, buffers and child names owned by one module.
pub struct ModuleState<B: Backend> {
    slots: Vec<Slot<B>>,
    children: Vec<String>,
    training: Cell<bool>,
}

impl<B: Backend> Default for ModuleState<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> fmt::Debug for ModuleState<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleState")
            .field("slots", &self.slots)
            .field("children", &self.children)
            .field("training", &self.training.get())
            .finish()
    }
}

impl<B: Backend> ModuleState<B> {
    /// An empty registry in training mode.
    pub fn new() -> Self {
        ModuleState {
            slots: Vec::new(),
            children: Vec::new(),
            training: Cell::new(true),
        }
    }

    pub fn builder() -> ModuleStateBuilder<B> {
        ModuleStateBuilder {
            state: ModuleState::new(),
            error: None,
        }
    }

    // Registration

    /// Register a trainable tensor under `name`.
    pub fn register_parameter(&mut self, name: impl Into<String>, tensor: Tensor<B>) -> Result<()> {
        self.insert(name.into(), SlotKind::Parameter, tensor)
    }

    /// Register a non-trainable tensor under `name`.
    ///
    /// With `persistent = false` the buffer still follows the module across
    /// devices but is left out of `state_dict`.
    pub fn register_buffer(
        &mut self,
        name: impl Into<String>,
        tensor: Tensor<B>,
        persistent: bool,
    ) -> Result<()> {
        let kind = if persistent {
            SlotKind::PersistentBuffer
        } else {
            SlotKind::TransientBuffer
        };
        self.insert(name.into(), kind, tensor)
    }

    /// Reserve `name` for a child module.
    pub fn declare_child(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.ensure_free(&name)?;
        debug!("declared child module '{name}'");
        self.children.push(name);
        Ok(())
    }

    fn insert(&mut self, name: String, kind: SlotKind, tensor: Tensor<B>) -> Result<()> {
        self.ensure_free(&name)?;
        debug!(
            "registered {kind} '{name}' shape={} dtype={} device={}",
            tensor.shape(),
            tensor.dtype(),
            tensor.device().name()
        );
        self.slots.push(Slot {
            name,
            kind,
            tensor: tag(kind, tensor),
        });
        Ok(())
    }

    fn ensure_free(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::msg("state entry name can't be empty"));
        }
        if name.contains('.') {
            return Err(Error::msg(format!(
                "state entry name can't contain '.', got '{name}'"
            )));
        }
        if let Some(slot) = self.slot(name) {
            return Err(Error::NameCollision {
                name: name.to_string(),
                existing: slot.kind.to_string(),
            });
        }
        if self.children.iter().any(|c| c == name) {
            return Err(Error::NameCollision {
                name: name.to_string(),
                existing: "child module".to_string(),
            });
        }
        Ok(())
    }

    // Lookup

    fn slot(&self, name: &str) -> Option<&Slot<B>> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// The tensor registered under `name`.
    pub fn get(&self, name: &str) -> Result<&Tensor<B>> {
        self.slot(name)
            .map(|s| &s.tensor)
            .ok_or_else(|| Error::UnknownState {
                name: name.to_string(),
            })
    }

    /// The kind of the slot registered under `name`, if any.
    pub fn kind_of(&self, name: &str) -> Option<SlotKind> {
        self.slot(name).map(|s| s.kind)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slot(name).is_some()
    }

    /// Replace the tensor of an existing slot, keeping its kind.
    ///
    /// This is how a layer swaps in a freshly computed buffer. Handles to
    /// the previous tensor keep the previous storage.
    pub fn replace(&mut self, name: &str, tensor: Tensor<B>) -> Result<()> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::UnknownState {
                name: name.to_string(),
            })?;
        slot.tensor = tag(slot.kind, tensor);
        Ok(())
    }

    /// All slots in declaration order.
    pub fn slots(&self) -> &[Slot<B>] {
        &self.slots
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Slot<B>> {
        self.slots.iter().filter(|s| s.kind.is_parameter())
    }

    pub fn buffers(&self) -> impl Iterator<Item = &Slot<B>> {
        self.slots.iter().filter(|s| s.kind.is_buffer())
    }

    /// Child module names in declaration order.
    pub fn child_names(&self) -> &[String] {
        &self.children
    }

    // Relocation

    /// Move every slot of this module (not its children) to `device`.
    ///
    /// Each slot is replaced by a copy on the target device; a slot already
    /// there is left alone. Handles obtained before the call keep pointing
    /// at the old copies.
    pub fn to_device(&mut self, device: &B::Device) -> Result<()> {
        for slot in self.slots.iter_mut() {
            if slot.tensor.device() == device {
                continue;
            }
            debug!(
                "moving {} '{}' from {} to {}",
                slot.kind,
                slot.name,
                slot.tensor.device().name(),
                device.name()
            );
            slot.tensor = slot.tensor.to_device(device)?;
        }
        Ok(())
    }

    // Mode

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    pub fn set_training(&self, training: bool) {
        self.training.set(training);
    }
}

/// Declaration list for a [`ModuleState`]. See the module docs.
pub struct ModuleStateBuilder<B: Backend> {
    state: ModuleState<B>,
    error: Option<Error>,
}

impl<B: Backend> ModuleStateBuilder<B> {
    fn record(mut self, result: Result<()>) -> Self {
        if let Err(e) = result {
            self.error = Some(e);
        }
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, tensor: Tensor<B>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let result = self.state.register_parameter(name, tensor);
        self.record(result)
    }

    /// A persistent buffer.
    pub fn buffer(mut self, name: impl Into<String>, tensor: Tensor<B>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let result = self.state.register_buffer(name, tensor, true);
        self.record(result)
    }

    /// A buffer left out of `state_dict`.
    pub fn transient_buffer(mut self, name: impl Into<String>, tensor: Tensor<B>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let result = self.state.register_buffer(name, tensor, false);
        self.record(result)
    }

    /// Optional parameter, e.g. a bias that may be disabled.
    pub fn maybe_parameter(self, name: impl Into<String>, tensor: Option<Tensor<B>>) -> Self {
        match tensor {
            Some(t) => self.parameter(name, t),
            None => self,
        }
    }

    pub fn child(mut self, name: impl Into<String>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let result = self.state.declare_child(name);
        self.record(result)
    }

    /// The registry, or the first declaration error.
    pub fn build(self) -> Result<ModuleState<B>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::DType;
    use vole_cpu::{CpuBackend, CpuDevice, CpuTensor};

    fn dev() -> CpuDevice {
        CpuDevice::default()
    }

    #[test]
    fn test_registration_tags_gradient_flag() {
        let w = CpuTensor::ones(3, DType::F32, &dev()).unwrap();
        let m = CpuTensor::zeros(3, DType::F32, &dev()).unwrap().set_variable();
        let state = ModuleState::<CpuBackend>::builder()
            .parameter("weight", w.clone())
            .buffer("mean", m)
            .build()
            .unwrap();
        assert!(state.get("weight").unwrap().is_variable());
        assert!(!state.get("mean").unwrap().is_variable());
        assert!(state.get("weight").unwrap().same_storage(&w));
    }

    #[test]
    fn test_collision_names_existing_kind() {
        let t = CpuTensor::ones(2, DType::F32, &dev()).unwrap();
        let mut state = ModuleState::<CpuBackend>::new();
        state.register_parameter("mask", t.clone()).unwrap();
        state.register_buffer("scratch", t.clone(), false).unwrap();
        state.declare_child("proj").unwrap();

        match state.register_buffer("mask", t.clone(), true) {
            Err(Error::NameCollision { name, existing }) => {
                assert_eq!(name, "mask");
                assert_eq!(existing, "parameter");
            }
            other => panic!("expected NameCollision, got {other:?}"),
        }
        match state.register_parameter("scratch", t.clone()) {
            Err(Error::NameCollision { existing, .. }) => assert_eq!(existing, "transient buffer"),
            other => panic!("expected NameCollision, got {other:?}"),
        }
        match state.register_buffer("proj", t.clone(), true) {
            Err(Error::NameCollision { existing, .. }) => assert_eq!(existing, "child module"),
            other => panic!("expected NameCollision, got {other:?}"),
        }
        assert!(state.declare_child("mask").is_err());
        assert_eq!(state.slots().len(), 2);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let t = CpuTensor::ones(2, DType::F32, &dev()).unwrap();
        let mut state = ModuleState::<CpuBackend>::new();
        assert!(state.register_buffer("", t.clone(), true).is_err());
        assert!(state.register_buffer("a.b", t, true).is_err());
    }

    #[test]
    fn test_builder_reports_first_error() {
        let t = CpuTensor::ones(2, DType::F32, &dev()).unwrap();
        let result = ModuleState::<CpuBackend>::builder()
            .parameter("w", t.clone())
            .buffer("w", t.clone())
            .child("")
            .build();
        assert!(matches!(result, Err(Error::NameCollision { .. })));
    }

    #[test]
    fn test_unknown_state() {
        let state = ModuleState::<CpuBackend>::new();
        assert!(matches!(state.get("mask"), Err(Error::UnknownState { .. })));
    }

    #[test]
    fn test_to_device_moves_every_kind() {
        let t = CpuTensor::ones(2, DType::F32, &dev()).unwrap();
        let mut state = ModuleState::<CpuBackend>::builder()
            .parameter("w", t.clone())
            .buffer("b", t.clone())
            .transient_buffer("s", t)
            .build()
            .unwrap();
        let target = CpuDevice::new(1);
        state.to_device(&target).unwrap();
        for slot in state.slots() {
            assert_eq!(slot.tensor().device(), &target, "{}", slot.name());
        }
        assert!(state.get("w").unwrap().is_variable());
        assert_eq!(state.kind_of("s"), Some(SlotKind::TransientBuffer));
    }

    #[test]
    fn test_replace_keeps_kind() {
        let t = CpuTensor::ones(2, DType::F32, &dev()).unwrap();
        let mut state = ModuleState::<CpuBackend>::new();
        state.register_buffer("mask", t, true).unwrap();
        let fresh = CpuTensor::zeros(2, DType::F32, &dev()).unwrap().set_variable();
        state.replace("mask", fresh).unwrap();
        assert!(!state.get("mask").unwrap().is_variable());
        assert_eq!(state.kind_of("mask"), Some(SlotKind::PersistentBuffer));
        assert!(state.replace("missing", CpuTensor::ones(1, DType::F32, &dev()).unwrap()).is_err());
    }
}
