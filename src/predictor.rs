use std::error::Error;
use std::fmt::Write as FmtWrite;
use std::io;
use std::io::Write;
use std::sync::Mutex;

use crate::field_config::FieldConfig;
use crate::hogwild::BatchTask;
use crate::model::FfmModel;
use crate::model_instance::{ModelFormat, ModelInstance};
use crate::parser::{parse_line, Sample};
use crate::persistence;
use crate::vector_ops::{new_vector_ops_or_scalar, VectorOps};

/// Scores samples against a read-only model and writes `label score` lines
pub struct FfmPredictor {
    model: FfmModel,
    ops: Box<dyn VectorOps>,
    field_config: Option<FieldConfig>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl FfmPredictor {
    pub fn new(mi: &ModelInstance, output: Box<dyn Write + Send>) -> Result<FfmPredictor, Box<dyn Error>> {
        // latent vectors are never created while predicting, the init distribution is unused
        Ok(FfmPredictor {
            model: FfmModel::new(mi.factor_num, 0.0, 0.0, 0)?,
            ops: new_vector_ops_or_scalar(mi.vector_ops),
            field_config: None,
            output: Mutex::new(output),
        })
    }

    pub fn with_field_config(mut self, field_config: Option<FieldConfig>) -> FfmPredictor {
        self.field_config = field_config;
        self
    }

    pub fn load_model(&self, filename: &str, format: ModelFormat) -> Result<(), Box<dyn Error>> {
        persistence::load_predict_model_from_filename(&self.model, filename, format)
    }

    pub fn model(&self) -> &FfmModel {
        &self.model
    }

    pub fn predict(&self, sample: &Sample) -> f64 {
        self.model.predict(sample, self.ops.as_ref())
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut output = self.output.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        output.flush()
    }
}

impl BatchTask for FfmPredictor {
    fn run_task(&self, lines: &[String]) -> io::Result<()> {
        let mut results = String::new();
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
            let score = self.predict(&sample);
            // writing into a String cannot fail
            let _ = writeln!(results, "{} {}", sample.label, persistence::format_g6(score));
        }
        if results.is_empty() {
            return Ok(());
        }
        let mut output = self.output.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        output.write_all(results.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Output sink whose contents stay readable after it was moved into the predictor
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn predictor_with_model(model_text: &str, k: usize) -> (FfmPredictor, SharedBuffer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.txt");
        std::fs::write(&path, model_text).unwrap();
        let mut mi = ModelInstance::new_empty().unwrap();
        mi.factor_num = k;
        let buffer = SharedBuffer::default();
        let predictor = FfmPredictor::new(&mi, Box::new(buffer.clone())).unwrap();
        predictor.load_model(path.to_str().unwrap(), ModelFormat::Txt).unwrap();
        (predictor, buffer, dir)
    }

    #[test]
    fn test_unknown_features_score_half() {
        let (predictor, buffer, _dir) = predictor_with_model("FIELDS f1 f2\nbias 0 0 0\n", 8);
        let lines: Vec<String> = vec![
            "1 f1:a:1 f2:b:1".to_string(),
            "0 x:y:2".to_string(),
            "not a sample".to_string(),
            "-1 f1:a:1".to_string(),
        ];
        predictor.run_task(&lines).unwrap();
        assert_eq!(buffer.contents(), "1 0.5\n-1 0.5\n-1 0.5\n");
    }

    #[test]
    fn test_scores_known_features() {
        // k = 1: x has w = 1 and v_{x,f2} = 2, y has v_{y,f1} = 3
        let model = "FIELDS f1 f2\n\
                     bias -1 0 0\n\
                     x 1 0 2 0 0 0 0 0 0\n\
                     y 0 3 0 0 0 0 0 0 0\n";
        let (predictor, buffer, _dir) = predictor_with_model(model, 1);
        let sample = parse_line("1 f1:x:1 f2:y:1", None).unwrap();
        // -1 + 1 + 2 * 3
        let expected = 1.0 / (1.0 + (-6.0f64).exp());
        assert!((predictor.predict(&sample) - expected).abs() < 1e-12);

        predictor.run_task(&["1 f1:x:1".to_string()]).unwrap();
        assert_eq!(buffer.contents(), "1 0.5\n");
    }

    #[test]
    fn test_field_config_resolves_fieldless_tokens() {
        let model = "FIELDS user item\nbias 0 0 0\nsex 2 0 0 0 0 0 0 0 0\n";
        let (predictor, buffer, _dir) = predictor_with_model(model, 1);
        predictor.run_task(&["1 sex:1".to_string()]).unwrap();
        assert_eq!(buffer.contents(), "");

        let fc = FieldConfig::new_from_text_str("sex user\n").unwrap();
        let predictor = predictor.with_field_config(Some(fc));
        predictor.run_task(&["1 sex:1".to_string()]).unwrap();
        assert_eq!(buffer.contents(), "1 0.880797\n");
    }

    #[test]
    fn test_missing_model_file() {
        let mi = ModelInstance::new_empty().unwrap();
        let predictor = FfmPredictor::new(&mi, Box::new(io::sink())).unwrap();
        assert!(predictor.load_model("/nonexistent/model.txt", ModelFormat::Txt).is_err());
        assert!(predictor.load_model("/nonexistent/model.bin", ModelFormat::Bin).is_err());
    }
}
