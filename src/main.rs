use flate2::read::MultiGzDecoder;
use std::error::Error;
use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use zstd::stream::read::Decoder as ZstdDecoder;

use ffm::field_config::FieldConfig;
use ffm::hogwild;
use ffm::model_instance::{ModelFormat, ModelInstance};
use ffm::predictor::FfmPredictor;
use ffm::trainer::FfmTrainer;
use ffm::{cmdline, logging_layer};

fn main() {
    logging_layer::initialize_logging_layer();

    let cl = cmdline::parse();
    if let Err(e) = main_ffm_loop(&cl) {
        log::error!("Global error: {:?}", e);
        std::process::exit(1)
    }
}

fn create_buffered_input(input_filename: Option<&str>) -> Result<Box<dyn BufRead>, Box<dyn Error>> {
    // Handler for different (or no) compression types
    let input_filename = match input_filename {
        None | Some("-") => return Ok(Box::new(io::BufReader::new(io::stdin()))),
        Some(filename) => filename,
    };

    let input = match File::open(input_filename) {
        Ok(input) => input,
        Err(e) => return Err(format!("Could not open the input file {}: {}", input_filename, e))?,
    };

    let input_format = Path::new(input_filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("");

    match input_format {
        "gz" => {
            let gz_decoder = MultiGzDecoder::new(input);
            Ok(Box::new(io::BufReader::new(gz_decoder)))
        }
        "zst" => {
            let zstd_decoder = ZstdDecoder::new(input)?;
            Ok(Box::new(io::BufReader::new(zstd_decoder)))
        }
        _ => Ok(Box::new(io::BufReader::new(input))),
    }
}

fn model_format_arg(cl: &clap::ArgMatches, name: &str) -> Result<ModelFormat, Box<dyn Error>> {
    match cl.value_of(name) {
        Some(format) => format.parse(),
        None => Ok(ModelFormat::Txt),
    }
}

/// A field config that cannot be loaded is not fatal, parsing then falls back to the defaults
fn load_field_config(cl: &clap::ArgMatches) -> Option<FieldConfig> {
    let filename = cl.value_of("field_config")?;
    match FieldConfig::new_from_filepath(filename) {
        Ok(fc) => Some(fc),
        Err(e) => {
            log::warn!("Ignoring field config {}: {}", filename, e);
            None
        }
    }
}

fn main_ffm_loop(cl: &clap::ArgMatches) -> Result<(), Box<dyn Error>> {
    let mi = ModelInstance::new_from_cmdline(cl)?;
    let field_config = load_field_config(cl);
    let initial_model_format = model_format_arg(cl, "initial_model_format")?;

    if cl.is_present("predict") {
        let initial_model = match cl.value_of("initial_model") {
            Some(filename) => filename,
            None => return Err("Predict mode requires --initial_model")?,
        };
        let predictions = match cl.value_of("predictions") {
            Some(filename) => filename,
            None => return Err("Predict mode requires --predictions")?,
        };
        log::info!("initial_model = {}", initial_model);
        log::info!("predictions = {}", predictions);

        let output = BufWriter::new(File::create(predictions)?);
        let predictor = FfmPredictor::new(&mi, Box::new(output))?.with_field_config(field_config);
        predictor.load_model(initial_model, initial_model_format)?;
        let predictor = Arc::new(predictor);

        let now = Instant::now();
        let mut input = create_buffered_input(cl.value_of("data"))?;
        let num_lines = hogwild::dispatch_lines(&mut input, predictor.clone(), mi.threads, mi.batch_size)?;
        predictor.flush()?;
        log::info!("Elapsed: {:.2?} rows: {}", now.elapsed(), num_lines);
    } else {
        let final_model = match cl.value_of("final_model") {
            Some(filename) => filename,
            None => return Err("Training requires --final_model")?,
        };
        let model_format = model_format_arg(cl, "model_format")?;
        log::info!("final_model = {}", final_model);

        let trainer = FfmTrainer::new(&mi)?.with_field_config(field_config);
        if let Some(filename) = cl.value_of("initial_model") {
            log::info!("initial_model = {}", filename);
            trainer.load_model(filename, initial_model_format)?;
        }
        let trainer = Arc::new(trainer);

        let now = Instant::now();
        let mut input = create_buffered_input(cl.value_of("data"))?;
        let num_lines = hogwild::dispatch_lines(&mut input, trainer.clone(), mi.threads, mi.batch_size)?;
        log::info!("Elapsed: {:.2?} rows: {}", now.elapsed(), num_lines);
        trainer.log_stats();

        trainer.save_model(final_model, model_format)?;
    }

    Ok(())
}
