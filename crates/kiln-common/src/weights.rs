//! The flat, schema-less mapping of tensor names to tensors.

use crate::{DType, TensorData};
use std::collections::BTreeMap;
use std::collections::btree_map;

/// Key fragments marking the packed statistics of a 4-bit checkpoint.
pub const NF4_STATE_MARKER: &str = "bitsandbytes__nf4";
pub const FP4_STATE_MARKER: &str = "bitsandbytes__fp4";

/// Dotted tensor name → tensor.
///
/// Keys are unique; iteration order is lexicographic so that anything derived
/// from a blob (partitions, detected dtypes, logs) is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightBlob {
    tensors: BTreeMap<String, TensorData>,
}

impl WeightBlob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&TensorData> {
        self.tensors.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: TensorData) -> Option<TensorData> {
        self.tensors.insert(key.into(), tensor)
    }

    pub fn remove(&mut self, key: &str) -> Option<TensorData> {
        self.tensors.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, TensorData> {
        self.tensors.iter()
    }

    /// Whether any key starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.tensors.range(prefix.to_string()..).next().is_some_and(|(k, _)| k.starts_with(prefix))
    }

    /// Number of keys starting with `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.tensors
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .count()
    }

    /// Move every entry whose key starts with `prefix` into a new blob, with
    /// the prefix stripped.
    pub fn take_prefix(&mut self, prefix: &str) -> WeightBlob {
        if prefix.is_empty() {
            return std::mem::take(self);
        }
        let keys: Vec<String> = self
            .tensors
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        let mut out = WeightBlob::new();
        for key in keys {
            if let Some(tensor) = self.tensors.remove(&key) {
                out.insert(&key[prefix.len()..], tensor);
            }
        }
        out
    }

    /// Number of logical parameters.
    ///
    /// Packed 4-bit payloads count two parameters per byte; their statistics
    /// entries are not parameters and are skipped.
    pub fn parameter_count(&self) -> u64 {
        let four_bit = self.detected_dtype().is_some_and(DType::is_four_bit);
        self.tensors
            .iter()
            .filter(|(k, _)| !four_bit || !is_quant_statistic_key(k))
            .map(|(k, t)| {
                let n = t.numel() as u64;
                if four_bit && t.dtype() == DType::U8 && self.has_prefix(&format!("{k}.")) {
                    n * 2
                } else {
                    n
                }
            })
            .sum()
    }

    /// Total payload size in bytes.
    pub fn byte_size(&self) -> u64 {
        self.tensors.values().map(|t| t.byte_len() as u64).sum()
    }

    /// The dtype the checkpoint is stored in.
    ///
    /// Packed 4-bit statistics markers win; otherwise the element dtype held by
    /// the most tensors, ties going to the larger byte total and then to the
    /// lower [`DType`] ordinal.
    pub fn detected_dtype(&self) -> Option<DType> {
        for key in self.tensors.keys() {
            if key.contains(NF4_STATE_MARKER) {
                return Some(DType::Nf4);
            }
            if key.contains(FP4_STATE_MARKER) {
                return Some(DType::Fp4);
            }
        }
        let mut counts: BTreeMap<DType, (usize, u64)> = BTreeMap::new();
        for tensor in self.tensors.values() {
            let entry = counts.entry(tensor.dtype()).or_default();
            entry.0 += 1;
            entry.1 += tensor.byte_len() as u64;
        }
        counts
            .into_iter()
            .max_by(|(da, (ca, ba)), (db, (cb, bb))| {
                ca.cmp(cb).then(ba.cmp(bb)).then(db.cmp(da))
            })
            .map(|(dtype, _)| dtype)
    }
}

/// Whether `key` names a packed 4-bit statistics entry rather than a weight.
pub fn is_quant_statistic_key(key: &str) -> bool {
    const SUFFIXES: [&str; 4] = [".absmax", ".quant_map", ".nested_absmax", ".nested_quant_map"];
    SUFFIXES.iter().any(|s| key.ends_with(s)) || key.contains(".quant_state.bitsandbytes__")
}

impl FromIterator<(String, TensorData)> for WeightBlob {
    fn from_iter<I: IntoIterator<Item = (String, TensorData)>>(iter: I) -> Self {
        Self { tensors: iter.into_iter().collect() }
    }
}

impl IntoIterator for WeightBlob {
    type Item = (String, TensorData);
    type IntoIter = btree_map::IntoIter<String, TensorData>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

impl<'a> IntoIterator for &'a WeightBlob {
    type Item = (&'a String, &'a TensorData);
    type IntoIter = btree_map::Iter<'a, String, TensorData>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.iter()
    }
}

impl Extend<(String, TensorData)> for WeightBlob {
    fn extend<I: IntoIterator<Item = (String, TensorData)>>(&mut self, iter: I) {
        self.tensors.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_tensor(n: usize) -> TensorData {
        TensorData::from_f32(vec![n], &vec![0.5; n]).unwrap()
    }

    fn blob(keys: &[&str]) -> WeightBlob {
        keys.iter().map(|k| (k.to_string(), f32_tensor(2))).collect()
    }

    #[test]
    fn take_prefix_strips_and_removes() {
        let mut sd = blob(&["first_stage_model.decoder.conv_in.weight", "model.diffusion_model.out.0.bias"]);
        let vae = sd.take_prefix("first_stage_model.");
        assert_eq!(vae.keys().collect::<Vec<_>>(), vec!["decoder.conv_in.weight"]);
        assert_eq!(sd.len(), 1);
        assert!(!sd.has_prefix("first_stage_model."));
    }

    #[test]
    fn prefix_counting() {
        let sd = blob(&["a.b", "a.c", "ab.d", "b.a"]);
        assert_eq!(sd.count_prefix("a."), 2);
        assert!(sd.has_prefix("ab"));
        assert!(!sd.has_prefix("c"));
    }

    #[test]
    fn detected_dtype_prefers_quant_markers() {
        let mut sd = blob(&["w"]);
        sd.insert("w.quant_state.bitsandbytes__nf4", TensorData::from_u8(vec![2], vec![123, 125]).unwrap());
        assert_eq!(sd.detected_dtype(), Some(DType::Nf4));
    }

    #[test]
    fn detected_dtype_majority() {
        let mut sd = blob(&["a", "b"]);
        sd.insert("c", TensorData::zeros(vec![64], DType::F16).unwrap());
        assert_eq!(sd.detected_dtype(), Some(DType::F32));
        assert_eq!(WeightBlob::new().detected_dtype(), None);
    }

    #[test]
    fn parameter_count_counts_nibbles() {
        let mut sd = WeightBlob::new();
        sd.insert("proj.weight", TensorData::from_u8(vec![8, 1], vec![0; 8]).unwrap());
        sd.insert("proj.weight.absmax", TensorData::from_f32(vec![1], &[1.0]).unwrap());
        sd.insert("proj.weight.quant_map", TensorData::from_f32(vec![16], &[0.0; 16]).unwrap());
        sd.insert("proj.weight.quant_state.bitsandbytes__nf4", TensorData::from_u8(vec![2], vec![123, 125]).unwrap());
        sd.insert("proj.bias", TensorData::from_f32(vec![4], &[0.0; 4]).unwrap());
        assert_eq!(sd.parameter_count(), 16 + 4);
    }
}
