use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::vector_ops::VectorOpsType;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Txt,
    Bin,
}

impl FromStr for ModelFormat {
    type Err = Box<dyn Error>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "txt" => Ok(ModelFormat::Txt),
            "bin" => Ok(ModelFormat::Bin),
            other => Err(format!("unsupported model format: {}", other))?,
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ModelFormat::Txt => write!(f, "txt"),
            ModelFormat::Bin => write!(f, "bin"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelInstance {
    #[serde(default = "default_factor_num")]
    pub factor_num: usize,
    #[serde(default = "default_f64_zero")]
    pub init_mean: f64,
    #[serde(default = "default_init_stdev")]
    pub init_stdev: f64,

    #[serde(default = "default_alpha")]
    pub w_alpha: f64,
    #[serde(default = "default_beta")]
    pub w_beta: f64,
    #[serde(default = "default_l1")]
    pub w_l1: f64,
    #[serde(default = "default_l2")]
    pub w_l2: f64,

    #[serde(default = "default_alpha")]
    pub v_alpha: f64,
    #[serde(default = "default_beta")]
    pub v_beta: f64,
    #[serde(default = "default_l1")]
    pub v_l1: f64,
    #[serde(default = "default_l2")]
    pub v_l2: f64,

    #[serde(default = "default_bool_true")]
    pub use_linear_bias: bool,
    #[serde(default = "default_bool_true")]
    pub use_linear_weights: bool,
    #[serde(default = "default_bool_false")]
    pub force_v_sparse: bool,

    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    // None means a fresh seed per run
    #[serde(default)]
    pub init_seed: Option<u64>,
    #[serde(default = "default_vector_ops")]
    pub vector_ops: VectorOpsType,
}

fn default_factor_num() -> usize {8}
fn default_f64_zero() -> f64 {0.0}
fn default_init_stdev() -> f64 {0.1}
fn default_alpha() -> f64 {0.05}
fn default_beta() -> f64 {1.0}
fn default_l1() -> f64 {0.1}
fn default_l2() -> f64 {5.0}
fn default_bool_true() -> bool {true}
fn default_bool_false() -> bool {false}
fn default_threads() -> usize {1}
fn default_batch_size() -> usize {1000}
fn default_vector_ops() -> VectorOpsType {VectorOpsType::Scalar}

impl Default for ModelInstance {
    fn default() -> Self {
        ModelInstance {
            factor_num: default_factor_num(),
            init_mean: default_f64_zero(),
            init_stdev: default_init_stdev(),
            w_alpha: default_alpha(),
            w_beta: default_beta(),
            w_l1: default_l1(),
            w_l2: default_l2(),
            v_alpha: default_alpha(),
            v_beta: default_beta(),
            v_l1: default_l1(),
            v_l2: default_l2(),
            use_linear_bias: true,
            use_linear_weights: true,
            force_v_sparse: false,
            threads: default_threads(),
            batch_size: default_batch_size(),
            init_seed: None,
            vector_ops: default_vector_ops(),
        }
    }
}

macro_rules! parse_arg {
    ($cl:expr, $name:expr, $target:expr) => {
        if let Some(val) = $cl.value_of($name) {
            $target = match val.parse() {
                Ok(v) => v,
                Err(e) => return Err(format!("--{}: cannot parse \"{}\": {}", $name, val, e))?,
            };
        }
    };
}

impl ModelInstance {
    pub fn new_empty() -> Result<ModelInstance, Box<dyn Error>> {
        Ok(ModelInstance::default())
    }

    /// Starts from `--config` (if given) and lets explicit flags override it
    pub fn new_from_cmdline<'a>(cl: &clap::ArgMatches<'a>) -> Result<ModelInstance, Box<dyn Error>> {
        let mut mi = match cl.value_of("config") {
            Some(filename) => ModelInstance::new_from_jsonfile(filename)?,
            None => ModelInstance::new_empty()?,
        };

        parse_arg!(cl, "dim", mi.factor_num);
        parse_arg!(cl, "init_mean", mi.init_mean);
        parse_arg!(cl, "init_stdev", mi.init_stdev);
        parse_arg!(cl, "w_alpha", mi.w_alpha);
        parse_arg!(cl, "w_beta", mi.w_beta);
        parse_arg!(cl, "w_l1", mi.w_l1);
        parse_arg!(cl, "w_l2", mi.w_l2);
        parse_arg!(cl, "v_alpha", mi.v_alpha);
        parse_arg!(cl, "v_beta", mi.v_beta);
        parse_arg!(cl, "v_l1", mi.v_l1);
        parse_arg!(cl, "v_l2", mi.v_l2);
        parse_arg!(cl, "threads", mi.threads);
        parse_arg!(cl, "batch_size", mi.batch_size);

        if let Some(val) = cl.value_of("seed") {
            mi.init_seed = match val.parse() {
                Ok(seed) => Some(seed),
                Err(e) => return Err(format!("--seed: cannot parse \"{}\": {}", val, e))?,
            };
        }
        if let Some(val) = cl.value_of("simd") {
            mi.vector_ops = val.parse()?;
        }

        if cl.is_present("no_bias") {
            mi.use_linear_bias = false;
        }
        if cl.is_present("no_linear") {
            mi.use_linear_weights = false;
        }
        if cl.is_present("force_v_sparse") {
            mi.force_v_sparse = true;
        }

        mi.validate()?;
        Ok(mi)
    }

    pub fn new_from_jsonfile(input_filename: &str) -> Result<ModelInstance, Box<dyn Error>> {
        let mut input = File::open(input_filename)?;
        let mut contents = String::new();
        input.read_to_string(&mut contents)?;
        let mi: ModelInstance = serde_json::from_str(&contents)?;
        Ok(mi)
    }

    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.factor_num == 0 {
            return Err("factor dimension (--dim) must be positive")?;
        }
        if !(self.w_alpha > 0.0) || !(self.v_alpha > 0.0) {
            return Err(format!(
                "learning rate alphas must be positive, got w_alpha {} v_alpha {}",
                self.w_alpha, self.v_alpha
            ))?;
        }
        if !(self.init_stdev >= 0.0) {
            return Err(format!("init_stdev must not be negative, got {}", self.init_stdev))?;
        }
        if self.threads == 0 {
            return Err("number of threads must be positive")?;
        }
        if self.batch_size == 0 {
            return Err("batch size must be positive")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // Note this useful idiom: importing names from outer (for mod tests) scope.
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let mi = ModelInstance::new_empty().unwrap();
        assert_eq!(mi.factor_num, 8);
        assert_eq!(mi.init_mean, 0.0);
        assert_eq!(mi.init_stdev, 0.1);
        assert_eq!(mi.w_alpha, 0.05);
        assert_eq!(mi.w_beta, 1.0);
        assert_eq!(mi.w_l1, 0.1);
        assert_eq!(mi.w_l2, 5.0);
        assert_eq!(mi.v_l2, 5.0);
        assert!(mi.use_linear_bias);
        assert!(mi.use_linear_weights);
        assert!(!mi.force_v_sparse);
        assert_eq!(mi.threads, 1);
        assert_eq!(mi.vector_ops, VectorOpsType::Scalar);
        mi.validate().unwrap();
    }

    #[test]
    fn test_json_with_missing_fields_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"factor_num": 4, "w_l1": 0.5, "vector_ops": "avx2", "init_seed": 11}}"#).unwrap();
        let mi = ModelInstance::new_from_jsonfile(file.path().to_str().unwrap()).unwrap();
        assert_eq!(mi.factor_num, 4);
        assert_eq!(mi.w_l1, 0.5);
        assert_eq!(mi.vector_ops, VectorOpsType::Avx2);
        assert_eq!(mi.init_seed, Some(11));
        assert_eq!(mi.v_alpha, 0.05);
        assert!(mi.use_linear_bias);
    }

    #[test]
    fn test_validate() {
        let mut mi = ModelInstance::new_empty().unwrap();
        mi.factor_num = 0;
        assert!(mi.validate().is_err());
        let mut mi = ModelInstance::new_empty().unwrap();
        mi.w_alpha = 0.0;
        assert!(mi.validate().is_err());
        let mut mi = ModelInstance::new_empty().unwrap();
        mi.init_stdev = -0.1;
        assert!(mi.validate().is_err());
        let mut mi = ModelInstance::new_empty().unwrap();
        mi.threads = 0;
        assert!(mi.validate().is_err());
    }

    #[test]
    fn test_model_format() {
        assert_eq!("txt".parse::<ModelFormat>().unwrap(), ModelFormat::Txt);
        assert_eq!("bin".parse::<ModelFormat>().unwrap(), ModelFormat::Bin);
        assert!("json".parse::<ModelFormat>().is_err());
        assert_eq!(ModelFormat::Txt.to_string(), "txt");
    }
}
