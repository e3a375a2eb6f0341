// StateDict: ordered name → tensor mapping produced by Module::state_dict
//
// Keys are dotted paths ("attn.w_query.weight", "bn.running_mean"), listed
// parents first and in declaration order inside each module. Lookup by key
// goes through a side index, so the order survives any number of inserts.
//
// The tensors in a state dict exported from a module share storage with the
// module's registered tensors. Reading an entry after the module mutated a
// buffer in place shows the new values; writing through an entry in place
// writes the module's state.

use std::collections::HashMap;
use std::fmt;

use vole_core::backend::Backend;
use vole_core::error::Result;
use vole_core::tensor::Tensor;

/// Ordered mapping from hierarchical names to tensors.
pub struct StateDict<B: Backend> {
    entries: Vec<(String, Tensor<B>)>,
    index: HashMap<String, usize>,
}

impl<B: Backend> Clone for StateDict<B> {
    fn clone(&self) -> Self {
        StateDict {
            entries: self.entries.clone(),
            index: self.index.clone(),
        }
    }
}

impl<B: Backend> Default for StateDict<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> fmt::Debug for StateDict<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(k, t)| (k, format!("{} {}", t.shape(), t.dtype()))),
            )
            .finish()
    }
}

impl<B: Backend> StateDict<B> {
    pub fn new() -> Self {
        StateDict {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Insert or overwrite `key`. Overwriting keeps the key's position and
    /// returns the previous tensor.
    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor<B>) -> Option<Tensor<B>> {
        let key = key.into();
        match self.index.get(&key) {
            Some(&i) => Some(std::mem::replace(&mut self.entries[i].1, tensor)),
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, tensor));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Tensor<B>> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Remove `key`, shifting later entries up.
    pub fn remove(&mut self, key: &str) -> Option<Tensor<B>> {
        let i = self.index.remove(key)?;
        let (_, tensor) = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(tensor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor<B>)> {
        self.entries.iter().map(|(k, t)| (k.as_str(), t))
    }

    /// Entries under `prefix.`, with the prefix stripped. Useful to load one
    /// submodule out of a whole-model state dict.
    pub fn sub_dict(&self, prefix: &str) -> StateDict<B> {
        let lead = format!("{prefix}.");
        self.entries
            .iter()
            .filter_map(|(k, t)| k.strip_prefix(&lead).map(|rest| (rest.to_string(), t.clone())))
            .collect()
    }

    /// Copy of every entry on `device`, in the same order.
    pub fn to_device(&self, device: &B::Device) -> Result<StateDict<B>> {
        let mut out = StateDict::new();
        for (k, t) in &self.entries {
            out.insert(k.clone(), t.to_device(device)?);
        }
        Ok(out)
    }

    /// Copy of every entry in fresh storage on its current device. Unlike
    /// the views `Module::state_dict` returns, a snapshot does not follow
    /// later in-place writes to the module.
    pub fn snapshot(&self) -> Result<StateDict<B>> {
        let mut out = StateDict::new();
        for (k, t) in &self.entries {
            out.insert(k.clone(), t.copy()?);
        }
        Ok(out)
    }

    /// Total number of scalar elements across all entries.
    pub fn num_elements(&self) -> usize {
        self.entries.iter().map(|(_, t)| t.elem_count()).sum()
    }
}

impl<B: Backend> FromIterator<(String, Tensor<B>)> for StateDict<B> {
    fn from_iter<I: IntoIterator<Item = (String, Tensor<B>)>>(iter: I) -> Self {
        let mut sd = StateDict::new();
        for (k, t) in iter {
            sd.insert(k, t);
        }
        sd
    }
}

impl<B: Backend> IntoIterator for StateDict<B> {
    type Item = (String, Tensor<B>);
    type IntoIter = std::vec::IntoIter<(String, Tensor<B>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Outcome of [`Module::load_state_dict`](crate::Module::load_state_dict).
///
/// `missing` lists the module keys the state dict did not provide (left
/// untouched); `unexpected` lists the state dict keys the module does not
/// have (ignored). Both are empty after a strict load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub applied: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl LoadReport {
    /// Every module key was loaded and nothing was left over.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loaded {} tensors", self.applied.len())?;
        if !self.missing.is_empty() {
            write!(f, ", missing [{}]", self.missing.join(", "))?;
        }
        if !self.unexpected.is_empty() {
            write!(f, ", unexpected [{}]", self.unexpected.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::DType;
    use vole_cpu::{CpuBackend, CpuDevice, CpuTensor};

    fn t(v: f64) -> CpuTensor {
        CpuTensor::full(2, v, DType::F32, &CpuDevice::default()).unwrap()
    }

    #[test]
    fn test_insert_keeps_order_and_overwrites_in_place() {
        let mut sd = StateDict::<CpuBackend>::new();
        sd.insert("b", t(1.0));
        sd.insert("a", t(2.0));
        let prev = sd.insert("b", t(3.0));
        assert!(prev.is_some());
        assert_eq!(sd.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(sd.get("b").unwrap().to_f64_vec().unwrap(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_snapshot_does_not_follow_later_writes() {
        let live = t(1.0);
        let mut sd = StateDict::<CpuBackend>::new();
        sd.insert("w", live.clone());
        let snap = sd.snapshot().unwrap();

        live.update_data_inplace(&[5.0, 5.0]).unwrap();
        assert_eq!(sd.get("w").unwrap().to_f64_vec().unwrap(), vec![5.0, 5.0]);
        assert_eq!(snap.get("w").unwrap().to_f64_vec().unwrap(), vec![1.0, 1.0]);
        assert!(!snap.get("w").unwrap().same_storage(&live));
    }

    #[test]
    fn test_remove_reindexes() {
        let mut sd: StateDict<CpuBackend> = vec![
            ("x".to_string(), t(1.0)),
            ("y".to_string(), t(2.0)),
            ("z".to_string(), t(3.0)),
        ]
        .into_iter()
        .collect();
        assert!(sd.remove("x").is_some());
        assert!(sd.remove("x").is_none());
        assert_eq!(sd.get("z").unwrap().to_f64_vec().unwrap(), vec![3.0, 3.0]);
        assert_eq!(sd.len(), 2);
    }

    #[test]
    fn test_sub_dict_strips_prefix() {
        let sd: StateDict<CpuBackend> = vec![
            ("enc.weight".to_string(), t(1.0)),
            ("encoder.bias".to_string(), t(2.0)),
            ("enc.inner.mask".to_string(), t(3.0)),
        ]
        .into_iter()
        .collect();
        let sub = sd.sub_dict("enc");
        assert_eq!(sub.keys().collect::<Vec<_>>(), vec!["weight", "inner.mask"]);
    }

    #[test]
    fn test_report_display() {
        let report = LoadReport {
            applied: vec!["w".into()],
            missing: vec!["mask".into()],
            unexpected: vec![],
        };
        assert!(!report.is_complete());
        assert_eq!(report.to_string(), "loaded 1 tensors, missing [mask]");
    }
}
