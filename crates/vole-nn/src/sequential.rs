// Sequential: A chain of modules applied one after another
//
//   let model = Sequential::new()
//       .add(linear1)?
//       .add(norm)?
//       .add(linear2)?;
//
//   let output = model.forward(&input)?;
//
// The output of each layer becomes the input to the next. Layers are child
// modules named by position ("0", "1", ...), so their state shows up as
// "0.weight", "1.running_mean", and so on.

use vole_core::backend::Backend;
use vole_core::error::Result;
use vole_core::tensor::Tensor;

use crate::module::Module;
use crate::state::ModuleState;

/// A container that chains modules sequentially.
pub struct Sequential<B: Backend> {
    state: ModuleState<B>,
    layers: Vec<Box<dyn Module<B>>>,
}

impl<B: Backend> Sequential<B> {
    pub fn new() -> Self {
        Sequential {
            state: ModuleState::new(),
            layers: Vec::new(),
        }
    }

    /// Append a layer. Returns self for chaining.
    #[allow(clippy::should_implement_trait)]
    pub fn add<M: Module<B> + 'static>(mut self, module: M) -> Result<Self> {
        self.push(Box::new(module))?;
        Ok(self)
    }

    /// Append an already boxed layer.
    pub fn push(&mut self, module: Box<dyn Module<B>>) -> Result<()> {
        self.state.declare_child(self.layers.len().to_string())?;
        self.layers.push(module);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Module<B>> {
        self.layers.get(index).map(|l| l.as_ref())
    }
}

impl<B: Backend> Default for Sequential<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Module<B> for Sequential<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let mut out = x.clone();
        for layer in &self.layers {
            out = layer.forward(&out)?;
        }
        Ok(out)
    }

    fn state(&self) -> &ModuleState<B> {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ModuleState<B> {
        &mut self.state
    }

    fn children(&self) -> Vec<(&str, &dyn Module<B>)> {
        self.state
            .child_names()
            .iter()
            .zip(self.layers.iter())
            .map(|(name, layer)| (name.as_str(), layer.as_ref() as &dyn Module<B>))
            .collect()
    }

    fn children_mut(&mut self) -> Vec<(&str, &mut dyn Module<B>)> {
        let mut out: Vec<(&str, &mut dyn Module<B>)> = Vec::with_capacity(self.layers.len());
        for (name, layer) in self.state.child_names().iter().zip(self.layers.iter_mut()) {
            out.push((name.as_str(), layer.as_mut() as &mut dyn Module<B>));
        }
        out
    }
}
