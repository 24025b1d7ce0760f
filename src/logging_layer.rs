use env_logger::Builder;

use crate::vector_ops::{available_vector_ops, VectorOpsType};

pub fn initialize_logging_layer() {
    let mut builder = Builder::new();
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    builder.filter_level(level_filter_from_str(&log_level));

    if builder.try_init().is_ok() {
        log::info!("Logging at {} (set LOG_LEVEL to change)", log_level.to_lowercase());
    }

    log::info!("{}", vector_ops_report(&available_vector_ops()));
}

fn level_filter_from_str(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Which `--simd` choices the CPU supports for the latent dot products
fn vector_ops_report(available: &[VectorOpsType]) -> String {
    let names: Vec<String> = available.iter().map(|t| t.to_string()).collect();
    if available.contains(&VectorOpsType::Avx2) {
        format!("AVX2 and FMA detected, --simd can be one of: {}", names.join(", "))
    } else {
        format!("AVX2/FMA not available, latent dot products use --simd {}", names.join(", "))
    }
}
