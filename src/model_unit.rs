use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rand_distr::{Distribution, Normal};
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

/// An f64 cell that can be read while another thread writes it.
///
/// Readers never see a torn value of a single element, but nothing orders
/// a reader against a writer updating the rest of the same vector. Scoring
/// reads latent vectors without the per-feature lock, so a concurrent reader
/// may see a partly updated vector. The optimizer tolerates that staleness.
#[derive(Debug, Default)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(v: f64) -> AtomicF64 {
        AtomicF64 {
            bits: AtomicU64::new(v.to_bits()),
        }
    }

    #[inline(always)]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn set(&self, v: f64) {
        self.bits.store(v.to_bits(), Ordering::Relaxed)
    }
}

fn atomic_slice(values: &[f64]) -> Box<[AtomicF64]> {
    values.iter().map(|v| AtomicF64::new(*v)).collect()
}

/// Latent factors of one feature for one contra field, together with their
/// FTRL accumulators. The three vectors always have the same length k.
#[derive(Debug)]
pub struct LatentVectors {
    pub v: Box<[AtomicF64]>,
    pub n: Box<[AtomicF64]>,
    pub z: Box<[AtomicF64]>,
}

impl LatentVectors {
    pub fn zeros(k: usize) -> LatentVectors {
        let zeros = vec![0.0; k];
        LatentVectors::from_values(&zeros, &zeros, &zeros)
    }

    pub fn from_values(v: &[f64], n: &[f64], z: &[f64]) -> LatentVectors {
        debug_assert!(v.len() == n.len() && n.len() == z.len());
        LatentVectors {
            v: atomic_slice(v),
            n: atomic_slice(n),
            z: atomic_slice(z),
        }
    }

    pub fn len(&self) -> usize {
        self.v.len()
    }

    /// Copies the current latent factors into `out`
    #[inline(always)]
    pub fn read_v_into(&self, out: &mut [f64]) {
        for (o, v) in out.iter_mut().zip(self.v.iter()) {
            *o = v.get();
        }
    }

    pub fn v_values(&self) -> Vec<f64> {
        self.v.iter().map(|v| v.get()).collect()
    }

    pub fn n_values(&self) -> Vec<f64> {
        self.n.iter().map(|v| v.get()).collect()
    }

    pub fn z_values(&self) -> Vec<f64> {
        self.z.iter().map(|v| v.get()).collect()
    }
}

/// Draws the initial values of freshly created latent vectors.
///
/// The generator is shared by all units of one model and guarded by a mutex;
/// it is only touched on the slow path of first-time creation.
pub struct LatentInitializer {
    k: usize,
    normal: Normal<f64>,
    rng: Mutex<Xoshiro256PlusPlus>,
}

impl LatentInitializer {
    pub fn new(k: usize, mean: f64, stdev: f64, seed: u64) -> Result<LatentInitializer, Box<dyn Error>> {
        if !(stdev >= 0.0) || !stdev.is_finite() || !mean.is_finite() {
            return Err(format!("Invalid latent init distribution (mean {}, stdev {})", mean, stdev))?;
        }
        let normal = match Normal::new(mean, stdev) {
            Ok(normal) => normal,
            Err(e) => {
                return Err(format!(
                    "Invalid latent init distribution (mean {}, stdev {}): {}",
                    mean, stdev, e
                ))?
            }
        };
        Ok(LatentInitializer {
            k,
            normal,
            rng: Mutex::new(Xoshiro256PlusPlus::seed_from_u64(seed)),
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn new_latent_vectors(&self) -> LatentVectors {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let v: Vec<f64> = (0..self.k).map(|_| self.normal.sample(&mut *rng)).collect();
        let zeros = vec![0.0; self.k];
        LatentVectors::from_values(&v, &zeros, &zeros)
    }
}

/// Per-feature parameters: linear weight with its FTRL accumulators, and
/// one latent vector triple per contra field, indexed by the model's field index.
#[derive(Debug, Default)]
pub struct ModelUnit {
    pub w: AtomicF64,
    pub w_n: AtomicF64,
    pub w_z: AtomicF64,
    latent: RwLock<Vec<Option<Arc<LatentVectors>>>>,
}

impl ModelUnit {
    pub fn new() -> ModelUnit {
        ModelUnit::default()
    }

    pub fn with_linear(w: f64, w_n: f64, w_z: f64) -> ModelUnit {
        ModelUnit {
            w: AtomicF64::new(w),
            w_n: AtomicF64::new(w_n),
            w_z: AtomicF64::new(w_z),
            latent: RwLock::new(Vec::new()),
        }
    }

    /// Returns the latent vectors for `field_index` if they were ever created
    pub fn latent(&self, field_index: usize) -> Option<Arc<LatentVectors>> {
        let latent = self.latent.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match latent.get(field_index) {
            Some(Some(vectors)) => Some(Arc::clone(vectors)),
            _ => None,
        }
    }

    /// Returns the latent vectors for `field_index`, creating them on first use.
    ///
    /// Concurrent first callers for the same field all get the vectors of
    /// whoever took the write lock first; exactly one triple is ever created.
    pub fn get_or_init_latent(&self, field_index: usize, init: &LatentInitializer) -> Arc<LatentVectors> {
        if let Some(vectors) = self.latent(field_index) {
            return vectors;
        }

        let mut latent = self.latent.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(Some(vectors)) = latent.get(field_index) {
            return Arc::clone(vectors);
        }
        if latent.len() <= field_index {
            latent.resize(field_index + 1, None);
        }
        let vectors = Arc::new(init.new_latent_vectors());
        latent[field_index] = Some(Arc::clone(&vectors));
        vectors
    }

    /// Installs vectors read from a model file, replacing whatever was there
    pub fn set_latent(&self, field_index: usize, vectors: LatentVectors) {
        let mut latent = self.latent.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if latent.len() <= field_index {
            latent.resize(field_index + 1, None);
        }
        latent[field_index] = Some(Arc::new(vectors));
    }

    pub fn latent_field_count(&self) -> usize {
        let latent = self.latent.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        latent.iter().filter(|v| v.is_some()).count()
    }

    /// Field indices that have latent vectors, in index order
    pub fn latent_field_indices(&self) -> Vec<usize> {
        let latent = self.latent.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        latent
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|_| i))
            .collect()
    }

    /// Used only to prune units when loading a model for prediction
    pub fn is_non_zero(&self) -> bool {
        if self.w.get() != 0.0 {
            return true;
        }
        let latent = self.latent.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        latent
            .iter()
            .flatten()
            .any(|vectors| vectors.v.iter().any(|v| v.get() != 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_atomic_f64() {
        let a = AtomicF64::new(1.5);
        assert_eq!(a.get(), 1.5);
        a.set(-0.25);
        assert_eq!(a.get(), -0.25);
        assert_eq!(AtomicF64::default().get(), 0.0);
    }

    #[test]
    fn test_lazy_latent_init() {
        let init = LatentInitializer::new(4, 0.0, 0.1, 42).unwrap();
        let unit = ModelUnit::new();
        assert!(unit.latent(3).is_none());
        let first = unit.get_or_init_latent(3, &init);
        assert_eq!(first.len(), 4);
        assert_eq!(first.n.len(), 4);
        assert_eq!(first.z.len(), 4);
        assert!(first.n_values().iter().all(|n| *n == 0.0));
        assert!(first.z_values().iter().all(|z| *z == 0.0));

        let second = unit.get_or_init_latent(3, &init);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(unit.latent_field_count(), 1);
        assert_eq!(unit.latent_field_indices(), vec![3]);
        assert!(unit.latent(0).is_none());
    }

    #[test]
    fn test_seeded_init_is_reproducible() {
        let init1 = LatentInitializer::new(8, 0.5, 0.2, 7).unwrap();
        let init2 = LatentInitializer::new(8, 0.5, 0.2, 7).unwrap();
        assert_eq!(init1.new_latent_vectors().v_values(), init2.new_latent_vectors().v_values());
    }

    #[test]
    fn test_zero_stdev_gives_mean() {
        let init = LatentInitializer::new(3, 0.25, 0.0, 1).unwrap();
        assert_eq!(init.new_latent_vectors().v_values(), vec![0.25, 0.25, 0.25]);
        assert!(LatentInitializer::new(3, 0.0, -1.0, 1).is_err());
    }

    #[test]
    fn test_concurrent_first_init_creates_one_triple() {
        let init = Arc::new(LatentInitializer::new(8, 0.0, 0.1, 3).unwrap());
        let unit = Arc::new(ModelUnit::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let init = Arc::clone(&init);
                let unit = Arc::clone(&unit);
                thread::spawn(move || unit.get_or_init_latent(5, &init))
            })
            .collect();
        let results: Vec<Arc<LatentVectors>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in results.iter() {
            assert!(Arc::ptr_eq(r, &results[0]));
        }
        assert_eq!(unit.latent_field_count(), 1);
    }

    #[test]
    fn test_is_non_zero() {
        let unit = ModelUnit::new();
        assert!(!unit.is_non_zero());
        unit.set_latent(1, LatentVectors::zeros(2));
        assert!(!unit.is_non_zero());
        unit.set_latent(0, LatentVectors::from_values(&[0.0, 0.1], &[0.0, 0.0], &[0.0, 0.0]));
        assert!(unit.is_non_zero());

        let unit = ModelUnit::with_linear(0.3, 0.0, 0.0);
        assert!(unit.is_non_zero());
    }
}
