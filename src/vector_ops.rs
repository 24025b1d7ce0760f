use std::error::Error;
use std::fmt;
use std::str::FromStr;

use dyn_clone::{clone_trait_object, DynClone};
use serde::{Deserialize, Serialize};

// Every implementation has to give the same answer as ScalarOps up to float reassociation.
pub trait VectorOps: DynClone + Send + Sync {
    fn dot(&self, a: &[f64], b: &[f64]) -> f64;
    fn name(&self) -> &'static str;
}
clone_trait_object!(VectorOps);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VectorOpsType {
    Scalar,
    Avx2,
}

impl FromStr for VectorOpsType {
    type Err = Box<dyn Error>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scalar" => Ok(VectorOpsType::Scalar),
            "avx2" | "simd" => Ok(VectorOpsType::Avx2),
            other => Err(format!(
                "unknown vector ops type \"{}\", expected one of: scalar, avx2",
                other
            ))?,
        }
    }
}

impl fmt::Display for VectorOpsType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VectorOpsType::Scalar => write!(f, "scalar"),
            VectorOpsType::Avx2 => write!(f, "avx2"),
        }
    }
}

/******************* Scalar **************************/
// Reference implementation, a plain multiply-and-add loop
#[derive(Clone, Default)]
pub struct ScalarOps {}

impl VectorOps for ScalarOps {
    #[inline(always)]
    fn dot(&self, a: &[f64], b: &[f64]) -> f64 {
        debug_assert_eq!(a.len(), b.len());
        let mut sum = 0.0;
        for (x, y) in a.iter().zip(b.iter()) {
            sum += x * y;
        }
        sum
    }

    fn name(&self) -> &'static str {
        "scalar"
    }
}

/******************* AVX2 + FMA **************************/
// Four lanes of f64 per register, tail handled by the scalar loop.
// Can only be constructed after runtime detection said the CPU has both features.
#[derive(Clone)]
pub struct Avx2Ops {
    _detected: (),
}

impl Avx2Ops {
    pub fn new() -> Result<Avx2Ops, Box<dyn Error>> {
        if !avx2_fma_detected() {
            return Err("CPU does not support AVX2 and FMA")?;
        }
        Ok(Avx2Ops { _detected: () })
    }
}

impl VectorOps for Avx2Ops {
    #[inline(always)]
    fn dot(&self, a: &[f64], b: &[f64]) -> f64 {
        debug_assert_eq!(a.len(), b.len());
        // Safe: Avx2Ops only exists when avx2 and fma were detected
        unsafe { dot_avx2(a, b) }
    }

    fn name(&self) -> &'static str {
        "avx2"
    }
}

#[cfg(target_arch = "x86_64")]
fn avx2_fma_detected() -> bool {
    is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
}

#[cfg(not(target_arch = "x86_64"))]
fn avx2_fma_detected() -> bool {
    false
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn dot_avx2(a: &[f64], b: &[f64]) -> f64 {
    ScalarOps {}.dot(a, b)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn dot_avx2(a: &[f64], b: &[f64]) -> f64 {
    use core::arch::x86_64::*;

    let len = a.len().min(b.len());
    let mut acc0 = _mm256_setzero_pd();
    let mut acc1 = _mm256_setzero_pd();
    let mut i = 0usize;
    while i + 8 <= len {
        let a0 = _mm256_loadu_pd(a.as_ptr().add(i));
        let b0 = _mm256_loadu_pd(b.as_ptr().add(i));
        let a1 = _mm256_loadu_pd(a.as_ptr().add(i + 4));
        let b1 = _mm256_loadu_pd(b.as_ptr().add(i + 4));
        acc0 = _mm256_fmadd_pd(a0, b0, acc0);
        acc1 = _mm256_fmadd_pd(a1, b1, acc1);
        i += 8;
    }
    if i + 4 <= len {
        let a0 = _mm256_loadu_pd(a.as_ptr().add(i));
        let b0 = _mm256_loadu_pd(b.as_ptr().add(i));
        acc0 = _mm256_fmadd_pd(a0, b0, acc0);
        i += 4;
    }
    let acc = _mm256_add_pd(acc0, acc1);
    let mut lanes = [0.0f64; 4];
    _mm256_storeu_pd(lanes.as_mut_ptr(), acc);
    let mut sum = (lanes[0] + lanes[1]) + (lanes[2] + lanes[3]);
    while i < len {
        sum += *a.get_unchecked(i) * *b.get_unchecked(i);
        i += 1;
    }
    sum
}

/// Implementations usable on this CPU, scalar first
pub fn available_vector_ops() -> Vec<VectorOpsType> {
    let mut available = vec![VectorOpsType::Scalar];
    if avx2_fma_detected() {
        available.push(VectorOpsType::Avx2);
    }
    available
}

pub fn new_vector_ops(ops_type: VectorOpsType) -> Result<Box<dyn VectorOps>, Box<dyn Error>> {
    match ops_type {
        VectorOpsType::Scalar => Ok(Box::new(ScalarOps {})),
        VectorOpsType::Avx2 => Ok(Box::new(Avx2Ops::new()?)),
    }
}

/// Like [`new_vector_ops`], but never fails: unavailable accelerated variants fall back to scalar.
pub fn new_vector_ops_or_scalar(ops_type: VectorOpsType) -> Box<dyn VectorOps> {
    match new_vector_ops(ops_type) {
        Ok(ops) => {
            log::info!("Vector ops: {}", ops.name());
            ops
        }
        Err(e) => {
            log::warn!(
                "Vector ops \"{}\" initialization failed, falling back to scalar: {}",
                ops_type,
                e
            );
            Box::new(ScalarOps {})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lengths() -> Vec<usize> {
        vec![0, 1, 3, 4, 5, 7, 8, 9, 16, 17, 31]
    }

    fn test_vectors(len: usize) -> (Vec<f64>, Vec<f64>) {
        let a: Vec<f64> = (0..len).map(|i| (i as f64) * 0.5 - 1.25).collect();
        let b: Vec<f64> = (0..len).map(|i| 2.0 - (i as f64) * 0.25).collect();
        (a, b)
    }

    #[test]
    fn test_scalar_dot() {
        let ops = ScalarOps {};
        assert_eq!(ops.dot(&[], &[]), 0.0);
        assert_eq!(ops.dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
        assert_eq!(ops.dot(&[1.0, -1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_avx2_matches_scalar() {
        // Only meaningful where the CPU has the features, otherwise construction fails
        let avx2 = match Avx2Ops::new() {
            Ok(ops) => ops,
            Err(_) => return,
        };
        let scalar = ScalarOps {};
        for len in lengths() {
            let (a, b) = test_vectors(len);
            let expected = scalar.dot(&a, &b);
            let got = avx2.dot(&a, &b);
            assert!(
                (expected - got).abs() < 1e-9,
                "len {}: scalar {} avx2 {}",
                len,
                expected,
                got
            );
        }
    }

    #[test]
    fn test_fallback_always_gives_working_ops() {
        let ops = new_vector_ops_or_scalar(VectorOpsType::Avx2);
        assert!(ops.name() == "avx2" || ops.name() == "scalar");
        assert_eq!(ops.dot(&[2.0, 3.0], &[4.0, 5.0]), 23.0);
        let cloned = ops.clone();
        assert_eq!(cloned.name(), ops.name());
    }

    #[test]
    fn test_parse_vector_ops_type() {
        assert_eq!("scalar".parse::<VectorOpsType>().unwrap(), VectorOpsType::Scalar);
        assert_eq!("AVX2".parse::<VectorOpsType>().unwrap(), VectorOpsType::Avx2);
        assert!("blas".parse::<VectorOpsType>().is_err());
    }
}
