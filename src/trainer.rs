use std::error::Error;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::field_config::FieldConfig;
use crate::hogwild::BatchTask;
use crate::lock_pool::LockPool;
use crate::model::{ffm_score, sigmoid, FfmModel, PairVectors};
use crate::model_instance::{ModelFormat, ModelInstance};
use crate::model_unit::{AtomicF64, LatentVectors, ModelUnit};
use crate::parser::{parse_line, Sample};
use crate::persistence;
use crate::vector_ops::{new_vector_ops_or_scalar, VectorOps};

const LOGLOSS_CLIP: f64 = 1e-15;

#[inline(always)]
fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[inline(always)]
fn lock(m: &Mutex<()>) -> MutexGuard<()> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hyperparameters of one FTRL-Proximal coordinate family (linear or latent)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FtrlParams {
    pub alpha: f64,
    pub beta: f64,
    pub l1: f64,
    pub l2: f64,
}

impl FtrlParams {
    /// Closed form weight for accumulators `z` and `n`
    #[inline(always)]
    pub fn weight(&self, z: f64, n: f64) -> f64 {
        if z.abs() <= self.l1 {
            0.0
        } else {
            -(z - sign(z) * self.l1) / (self.l2 + (self.beta + n.sqrt()) / self.alpha)
        }
    }

    /// Folds gradient `g` into the accumulators of a coordinate whose weight is `w`
    #[inline(always)]
    pub fn accumulate(&self, z: &AtomicF64, n: &AtomicF64, w: f64, g: f64) {
        let n_old = n.get();
        let g2 = g * g;
        let s = ((n_old + g2).sqrt() - n_old.sqrt()) / self.alpha;
        z.set(z.get() + g - s * w);
        n.set(n_old + g2);
    }
}

/// Logistic loss of probability `p` for a label of -1 or 1
pub fn logloss(p: f64, label: i32) -> f64 {
    let p = p.max(LOGLOSS_CLIP).min(1.0 - LOGLOSS_CLIP);
    if label > 0 {
        -p.ln()
    } else {
        -(1.0 - p).ln()
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct TrainStats {
    pub count: u64,
    pub loss_sum: f64,
}

impl TrainStats {
    pub fn average_loss(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.loss_sum / self.count as f64
        }
    }
}

pub struct FfmTrainer {
    pub mi: ModelInstance,
    model: FfmModel,
    locks: LockPool,
    ops: Box<dyn VectorOps>,
    w_params: FtrlParams,
    v_params: FtrlParams,
    field_config: Option<FieldConfig>,
    stats: Mutex<TrainStats>,
}

impl FfmTrainer {
    pub fn new(mi: &ModelInstance) -> Result<FfmTrainer, Box<dyn Error>> {
        mi.validate()?;
        let seed = mi.init_seed.unwrap_or_else(rand::random);
        log::info!("Latent vectors initialized from N({}, {}), seed {}", mi.init_mean, mi.init_stdev, seed);
        Ok(FfmTrainer {
            mi: mi.clone(),
            model: FfmModel::new(mi.factor_num, mi.init_mean, mi.init_stdev, seed)?,
            locks: LockPool::new(),
            ops: new_vector_ops_or_scalar(mi.vector_ops),
            w_params: FtrlParams {
                alpha: mi.w_alpha,
                beta: mi.w_beta,
                l1: mi.w_l1,
                l2: mi.w_l2,
            },
            v_params: FtrlParams {
                alpha: mi.v_alpha,
                beta: mi.v_beta,
                l1: mi.v_l1,
                l2: mi.v_l2,
            },
            field_config: None,
            stats: Mutex::new(TrainStats::default()),
        })
    }

    pub fn with_field_config(mut self, field_config: Option<FieldConfig>) -> FfmTrainer {
        self.field_config = field_config;
        self
    }

    pub fn model(&self) -> &FfmModel {
        &self.model
    }

    pub fn stats(&self) -> TrainStats {
        *self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Warm start; has to be called before any training
    pub fn load_model(&self, filename: &str, format: ModelFormat) -> Result<(), Box<dyn Error>> {
        persistence::load_model_from_filename(&self.model, filename, format)
    }

    pub fn save_model(&self, filename: &str, format: ModelFormat) -> Result<(), Box<dyn Error>> {
        persistence::save_model_to_filename(&self.model, filename, format)
    }

    /// One online FTRL step. Returns the predicted click probability from
    /// before the update.
    pub fn train(&self, sample: &Sample) -> f64 {
        let x = &sample.features;
        let xlen = x.len();
        let k = self.model.factor_num();
        let y = sample.label as f64;
        let init = self.model.initializer();

        // registration: fields, units, locks and every latent vector the sample pairs up
        let fields: Vec<usize> = x.iter().map(|fv| self.model.register_field(&fv.field)).collect();
        let units: Vec<Arc<ModelUnit>> = x.iter().map(|fv| self.model.get_or_init_unit(&fv.feature)).collect();
        let locks: Vec<Arc<Mutex<()>>> = x.iter().map(|fv| self.locks.lock_for(&fv.feature)).collect();
        let bias_lock = self.locks.bias_lock();
        let bias = self.model.bias();

        // latent[i * num_slots + slot]: unit i's vectors for each field it pairs with
        let mut pairs = PairVectors::zeros(x, k);
        let num_slots = pairs.num_slots();
        let mut slot_fields: Vec<usize> = vec![0; num_slots];
        for j in 0..xlen {
            slot_fields[pairs.slot_of(j)] = fields[j];
        }
        let mut latent: Vec<Option<Arc<LatentVectors>>> = Vec::with_capacity(xlen * num_slots);
        for i in 0..xlen {
            for (slot, field) in slot_fields.iter().enumerate() {
                latent.push(if pairs.pairs_with(i, slot) {
                    Some(units[i].get_or_init_latent(*field, init))
                } else {
                    None
                });
            }
        }

        // projection of the accumulators onto the weights
        if self.mi.use_linear_bias {
            let _guard = lock(&bias_lock);
            bias.w.set(self.w_params.weight(bias.w_z.get(), bias.w_n.get()));
        }
        for i in 0..xlen {
            let unit = &units[i];
            let _guard = lock(&locks[i]);
            if self.mi.use_linear_weights {
                unit.w.set(self.w_params.weight(unit.w_z.get(), unit.w_n.get()));
            }
            let force_zero = self.mi.force_v_sparse && unit.w.get() == 0.0;
            for lv in latent[i * num_slots..(i + 1) * num_slots].iter().flatten() {
                for f in 0..k {
                    let n = lv.n[f].get();
                    if force_zero {
                        lv.v[f].set(0.0);
                    } else if n > 0.0 {
                        // never updated vectors keep their random init
                        lv.v[f].set(self.v_params.weight(lv.z[f].get(), n));
                    }
                }
            }
        }

        // score on a snapshot of the projected parameters
        let w: Vec<f64> = units.iter().map(|unit| unit.w.get()).collect();
        for i in 0..xlen {
            for slot in 0..num_slots {
                if let Some(lv) = &latent[i * num_slots + slot] {
                    lv.read_v_into(pairs.slot_mut(i, slot));
                }
            }
        }
        let p = ffm_score(bias.w.get(), x, &w, &pairs, self.ops.as_ref());
        let mult = y * (sigmoid(p * y) - 1.0);

        // linear accumulators
        if self.mi.use_linear_bias {
            let _guard = lock(&bias_lock);
            self.w_params.accumulate(&bias.w_z, &bias.w_n, bias.w.get(), mult);
        }
        if self.mi.use_linear_weights {
            for i in 0..xlen {
                let unit = &units[i];
                let _guard = lock(&locks[i]);
                self.w_params
                    .accumulate(&unit.w_z, &unit.w_n, unit.w.get(), mult * x[i].value);
            }
        }

        // latent accumulators, once per pair; the partner vector is v_{j, field(i)} from the snapshot
        for i in 0..xlen {
            let unit = &units[i];
            for j in 0..xlen {
                if i == j {
                    continue;
                }
                let lv = match &latent[i * num_slots + pairs.slot_of(j)] {
                    Some(lv) => lv,
                    None => continue,
                };
                let coef = mult * x[i].value * x[j].value;
                let vj = pairs.get(j, i);
                let _guard = lock(&locks[i]);
                let force_zero = self.mi.force_v_sparse && unit.w.get() == 0.0;
                for f in 0..k {
                    self.v_params
                        .accumulate(&lv.z[f], &lv.n[f], lv.v[f].get(), coef * vj[f]);
                    if force_zero {
                        lv.v[f].set(0.0);
                    }
                }
            }
        }

        sigmoid(p)
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        log::info!(
            "Trained on {} samples, average logloss {:.6}",
            stats.count,
            stats.average_loss()
        );
    }
}

impl BatchTask for FfmTrainer {
    fn run_task(&self, lines: &[String]) -> io::Result<()> {
        let mut batch_stats = TrainStats::default();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let sample = match parse_line(line, self.field_config.as_ref()) {
                Ok(sample) => sample,
                Err(e) => {
                    log::warn!("Skipping invalid sample: {}", e);
                    continue;
                }
            };
            let p = self.train(&sample);
            batch_stats.count += 1;
            batch_stats.loss_sum += logloss(p, sample.label);
        }
        let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        stats.count += batch_stats.count;
        stats.loss_sum += batch_stats.loss_sum;
        Ok(())
    }
}
