use std::error::Error;
use std::hash::BuildHasherDefault;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use rustc_hash::{FxHashMap, FxHasher};

use crate::model_unit::{LatentInitializer, ModelUnit};
use crate::parser::{FeatureValue, Sample};
use crate::vector_ops::VectorOps;

pub const BIAS_FEATURE_NAME: &str = "bias";

#[inline(always)]
pub fn sigmoid(t: f64) -> f64 {
    (1.0 + (-t).exp()).recip()
}

#[derive(Default)]
struct FieldNames {
    names: Vec<String>,
    index: FxHashMap<String, usize>,
}

/// Append-only list of field names; a field's position is its latent index
#[derive(Default)]
pub struct FieldRegistry {
    inner: RwLock<FieldNames>,
}

impl FieldRegistry {
    pub fn new() -> FieldRegistry {
        FieldRegistry::default()
    }

    /// Returns the index of `field`, appending it on first sight
    pub fn register(&self, field: &str) -> usize {
        if let Some(index) = self.index_of(field) {
            return index;
        }
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(index) = inner.index.get(field) {
            return *index;
        }
        let index = inner.names.len();
        inner.names.push(field.to_string());
        inner.index.insert(field.to_string(), index);
        index
    }

    pub fn index_of(&self, field: &str) -> Option<usize> {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.index.get(field).copied()
    }

    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.names.clone()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared FFM parameters: bias, one unit per feature, and the known fields.
///
/// Everything is reachable through `&self`, so one model is shared by all
/// training threads. Units and latent vectors are created lazily and never removed.
pub struct FfmModel {
    bias: ModelUnit,
    units: DashMap<String, Arc<ModelUnit>, BuildHasherDefault<FxHasher>>,
    fields: FieldRegistry,
    init: LatentInitializer,
}

impl FfmModel {
    pub fn new(factor_num: usize, init_mean: f64, init_stdev: f64, seed: u64) -> Result<FfmModel, Box<dyn Error>> {
        if factor_num == 0 {
            return Err("factor dimension must be positive")?;
        }
        Ok(FfmModel {
            bias: ModelUnit::new(),
            units: DashMap::with_hasher(BuildHasherDefault::default()),
            fields: FieldRegistry::new(),
            init: LatentInitializer::new(factor_num, init_mean, init_stdev, seed)?,
        })
    }

    pub fn factor_num(&self) -> usize {
        self.init.k()
    }

    pub fn bias(&self) -> &ModelUnit {
        &self.bias
    }

    pub fn fields(&self) -> &FieldRegistry {
        &self.fields
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.names()
    }

    pub fn register_field(&self, field: &str) -> usize {
        self.fields.register(field)
    }

    pub fn initializer(&self) -> &LatentInitializer {
        &self.init
    }

    pub fn unit(&self, feature: &str) -> Option<Arc<ModelUnit>> {
        self.units.get(feature).map(|unit| Arc::clone(unit.value()))
    }

    /// Concurrent first calls for one feature all get the same unit
    pub fn get_or_init_unit(&self, feature: &str) -> Arc<ModelUnit> {
        if let Some(unit) = self.units.get(feature) {
            return Arc::clone(unit.value());
        }
        let unit = self
            .units
            .entry(feature.to_string())
            .or_insert_with(|| Arc::new(ModelUnit::new()));
        Arc::clone(unit.value())
    }

    pub fn insert_unit(&self, feature: &str, unit: ModelUnit) {
        self.units.insert(feature.to_string(), Arc::new(unit));
    }

    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    /// All units sorted by feature name
    pub fn units_sorted(&self) -> Vec<(String, Arc<ModelUnit>)> {
        let mut entries: Vec<(String, Arc<ModelUnit>)> = self
            .units
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Read-only raw score: unknown features, fields and latent vectors count as zero
    pub fn raw_score(&self, sample: &Sample, ops: &dyn VectorOps) -> f64 {
        let x = &sample.features;
        let units: Vec<Option<Arc<ModelUnit>>> = x.iter().map(|fv| self.unit(&fv.feature)).collect();
        let w: Vec<f64> = units
            .iter()
            .map(|unit| unit.as_ref().map_or(0.0, |unit| unit.w.get()))
            .collect();

        let mut pairs = PairVectors::zeros(x, self.factor_num());
        let mut slot_fields: Vec<Option<usize>> = vec![None; pairs.num_slots()];
        for (j, fv) in x.iter().enumerate() {
            slot_fields[pairs.slot_of(j)] = self.fields.index_of(&fv.field);
        }
        for (i, unit) in units.iter().enumerate() {
            let unit = match unit {
                Some(unit) => unit,
                None => continue,
            };
            for (slot, field) in slot_fields.iter().enumerate() {
                if !pairs.pairs_with(i, slot) {
                    continue;
                }
                if let Some(latent) = field.and_then(|f| unit.latent(f)) {
                    latent.read_v_into(pairs.slot_mut(i, slot));
                }
            }
        }
        ffm_score(self.bias.w.get(), x, &w, &pairs, ops)
    }

    /// Click probability of a sample, never changes the model
    pub fn predict(&self, sample: &Sample, ops: &dyn VectorOps) -> f64 {
        sigmoid(self.raw_score(sample, ops))
    }
}

/// Latent factors one sample reads, one slot per feature and distinct field
/// of the sample. `get(i, j)` is feature i's vector for the field of
/// feature j; features of the same field share a slot.
pub struct PairVectors {
    k: usize,
    num_slots: usize,
    slot_of: Vec<usize>,
    slot_sizes: Vec<usize>,
    values: Vec<f64>,
}

impl PairVectors {
    pub fn zeros(features: &[FeatureValue], k: usize) -> PairVectors {
        let mut slots: FxHashMap<&str, usize> = FxHashMap::default();
        let mut slot_sizes: Vec<usize> = Vec::new();
        let slot_of: Vec<usize> = features
            .iter()
            .map(|fv| {
                let next = slots.len();
                let slot = *slots.entry(fv.field.as_str()).or_insert(next);
                if slot == slot_sizes.len() {
                    slot_sizes.push(0);
                }
                slot_sizes[slot] += 1;
                slot
            })
            .collect();
        let num_slots = slot_sizes.len();
        PairVectors {
            k,
            num_slots,
            slot_of,
            slot_sizes,
            values: vec![0.0; features.len() * num_slots * k],
        }
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Slot of the field of feature `j`
    #[inline(always)]
    pub fn slot_of(&self, j: usize) -> usize {
        self.slot_of[j]
    }

    /// Whether some other feature than `i` has the field of `slot`
    #[inline(always)]
    pub fn pairs_with(&self, i: usize, slot: usize) -> bool {
        let own = (self.slot_of[i] == slot) as usize;
        self.slot_sizes[slot] > own
    }

    #[inline(always)]
    fn offset(&self, i: usize, slot: usize) -> usize {
        (i * self.num_slots + slot) * self.k
    }

    #[inline(always)]
    pub fn get(&self, i: usize, j: usize) -> &[f64] {
        let o = self.offset(i, self.slot_of[j]);
        &self.values[o..o + self.k]
    }

    #[inline(always)]
    pub fn slot_mut(&mut self, i: usize, slot: usize) -> &mut [f64] {
        let o = self.offset(i, slot);
        &mut self.values[o..o + self.k]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// FFM score: `bias + sum w_i x_i + sum_{i<j} <v_{i,field(j)}, v_{j,field(i)}> x_i x_j`
pub fn ffm_score(bias_w: f64, features: &[FeatureValue], w: &[f64], pairs: &PairVectors, ops: &dyn VectorOps) -> f64 {
    let mut result = bias_w;
    for (wi, fv) in w.iter().zip(features.iter()) {
        result += wi * fv.value;
    }
    for i in 0..features.len() {
        for j in i + 1..features.len() {
            result += ops.dot(pairs.get(i, j), pairs.get(j, i)) * features[i].value * features[j].value;
        }
    }
    result
}
