use clap::{App, AppSettings, Arg};

pub fn parse<'a>() -> clap::ArgMatches<'a> {
    create_expected_args().get_matches()
}

pub fn create_expected_args<'a>() -> App<'a, 'a> {
    App::new("ffm")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Field-aware factorization machines trained online with FTRL-Proximal")
        .setting(AppSettings::DeriveDisplayOrder)
        .arg(Arg::with_name("data")
            .long("data")
            .short("d")
            .value_name("filename")
            .help("Example set to use, - or absent for stdin (.gz and .zst are decompressed)")
            .takes_value(true))
        .arg(Arg::with_name("predict")
            .long("predict")
            .short("t")
            .help("Predict only: score examples with --initial_model and do not learn"))
        .arg(Arg::with_name("final_model")
            .long("final_model")
            .short("f")
            .value_name("filename")
            .help("Model file written after training")
            .takes_value(true))
        .arg(Arg::with_name("initial_model")
            .long("initial_model")
            .short("i")
            .value_name("filename")
            .help("Model to warm start training from, or to predict with")
            .takes_value(true))
        .arg(Arg::with_name("model_format")
            .long("model_format")
            .value_name("txt|bin")
            .help("Format of --final_model (default txt)")
            .possible_values(&["txt", "bin"])
            .takes_value(true))
        .arg(Arg::with_name("initial_model_format")
            .long("initial_model_format")
            .value_name("txt|bin")
            .help("Format of --initial_model (default txt)")
            .possible_values(&["txt", "bin"])
            .takes_value(true))
        .arg(Arg::with_name("predictions")
            .long("predictions")
            .short("p")
            .value_name("filename")
            .help("File to write \"label score\" lines to in predict mode")
            .takes_value(true))
        .arg(Arg::with_name("field_config")
            .long("field_config")
            .value_name("filename")
            .help("Field mapping for feature:value tokens, JSON or \"feature_prefix field\" lines")
            .takes_value(true))
        .arg(Arg::with_name("config")
            .long("config")
            .value_name("filename")
            .help("JSON model config, individual flags override it")
            .takes_value(true))
        .arg(Arg::with_name("dim")
            .long("dim")
            .short("k")
            .value_name("k")
            .help("Latent factor dimension (default 8)")
            .takes_value(true))
        .arg(Arg::with_name("init_mean")
            .long("init_mean")
            .value_name("mean")
            .help("Mean of the latent factor initialization (default 0)")
            .takes_value(true))
        .arg(Arg::with_name("init_stdev")
            .long("init_stdev")
            .value_name("stdev")
            .help("Standard deviation of the latent factor initialization (default 0.1)")
            .takes_value(true))
        .arg(Arg::with_name("w_alpha")
            .long("w_alpha")
            .value_name("alpha")
            .help("FTRL alpha for linear weights (default 0.05)")
            .takes_value(true))
        .arg(Arg::with_name("w_beta")
            .long("w_beta")
            .value_name("beta")
            .help("FTRL beta for linear weights (default 1.0)")
            .takes_value(true))
        .arg(Arg::with_name("w_l1")
            .long("w_l1")
            .value_name("l1")
            .help("L1 regularization for linear weights (default 0.1)")
            .takes_value(true))
        .arg(Arg::with_name("w_l2")
            .long("w_l2")
            .value_name("l2")
            .help("L2 regularization for linear weights (default 5.0)")
            .takes_value(true))
        .arg(Arg::with_name("v_alpha")
            .long("v_alpha")
            .value_name("alpha")
            .help("FTRL alpha for latent factors (default 0.05)")
            .takes_value(true))
        .arg(Arg::with_name("v_beta")
            .long("v_beta")
            .value_name("beta")
            .help("FTRL beta for latent factors (default 1.0)")
            .takes_value(true))
        .arg(Arg::with_name("v_l1")
            .long("v_l1")
            .value_name("l1")
            .help("L1 regularization for latent factors (default 0.1)")
            .takes_value(true))
        .arg(Arg::with_name("v_l2")
            .long("v_l2")
            .value_name("l2")
            .help("L2 regularization for latent factors (default 5.0)")
            .takes_value(true))
        .arg(Arg::with_name("no_bias")
            .long("no_bias")
            .help("Do not learn the bias term"))
        .arg(Arg::with_name("no_linear")
            .long("no_linear")
            .help("Do not learn linear feature weights"))
        .arg(Arg::with_name("force_v_sparse")
            .long("force_v_sparse")
            .help("Zero the latent factors of features whose linear weight is zero"))
        .arg(Arg::with_name("threads")
            .long("threads")
            .short("n")
            .value_name("num")
            .help("Number of worker threads (default 1)")
            .takes_value(true))
        .arg(Arg::with_name("batch_size")
            .long("batch_size")
            .value_name("lines")
            .help("Lines handed to a worker at a time (default 1000)")
            .takes_value(true))
        .arg(Arg::with_name("simd")
            .long("simd")
            .value_name("scalar|avx2")
            .help("Dot product implementation, falls back to scalar when unavailable")
            .takes_value(true))
        .arg(Arg::with_name("seed")
            .long("seed")
            .value_name("seed")
            .help("Seed of the latent factor initialization, random when absent")
            .takes_value(true))
}
