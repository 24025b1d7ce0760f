pub mod cmdline;
pub mod field_config;
pub mod hogwild;
pub mod lock_pool;
pub mod logging_layer;
pub mod model;
pub mod model_instance;
pub mod model_unit;
pub mod parser;
pub mod persistence;
pub mod predictor;
pub mod trainer;
pub mod vector_ops;
