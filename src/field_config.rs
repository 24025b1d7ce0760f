use std::error::Error;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

pub const DEFAULT_NUMERIC_FIELD_THRESHOLD: u64 = 1_000_000;
pub const DEFAULT_NUMERIC_FIELD_PREFIX: &str = "field_";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldMode {
    // fields are always written in the sample as field:feature:value
    Explicit,
    // feature:value tokens are mapped through feature_to_field
    Config,
}

/// Maps field-less `feature:value` tokens to a field.
///
/// Loaded either from JSON (all keys optional) or from a text file with one
/// `feature_prefix field` pair per line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FieldConfig {
    #[serde(default = "default_mode")]
    pub mode: FieldMode,
    #[serde(default)]
    pub feature_to_field: FxHashMap<String, String>,
    #[serde(default)]
    pub default_field: String,
    #[serde(default = "default_bool_true")]
    pub use_prefix: bool,
    #[serde(default = "default_numeric_field_threshold")]
    pub numeric_field_threshold: u64,
    #[serde(default = "default_numeric_field_prefix")]
    pub numeric_field_prefix: String,
}

fn default_mode() -> FieldMode {FieldMode::Config}
fn default_bool_true() -> bool {true}
fn default_numeric_field_threshold() -> u64 {DEFAULT_NUMERIC_FIELD_THRESHOLD}
fn default_numeric_field_prefix() -> String {DEFAULT_NUMERIC_FIELD_PREFIX.to_string()}

impl Default for FieldConfig {
    fn default() -> Self {
        FieldConfig {
            mode: default_mode(),
            feature_to_field: FxHashMap::default(),
            default_field: String::new(),
            use_prefix: true,
            numeric_field_threshold: default_numeric_field_threshold(),
            numeric_field_prefix: default_numeric_field_prefix(),
        }
    }
}

/// Field of a numeric feature id that carries its field id in the upper 32 bits,
/// or None when the token is not such a feature.
pub fn numeric_field(feature: &str, threshold: u64, prefix: &str) -> Option<String> {
    match feature.parse::<u64>() {
        Ok(id) if id >= threshold => Some(format!("{}{}", prefix, (id >> 32) as u32)),
        _ => None,
    }
}

impl FieldConfig {
    pub fn new_from_json_str(s: &str) -> Result<FieldConfig, Box<dyn Error>> {
        Ok(serde_json::from_str(s)?)
    }

    /// Parses `feature_prefix field` lines. Blank lines and lines whose first
    /// non-blank character is `#` are skipped.
    pub fn new_from_text_str(s: &str) -> Result<FieldConfig, Box<dyn Error>> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .quoting(false)
            .delimiter(b' ')
            .from_reader(s.as_bytes());
        let mut fc = FieldConfig::default();
        for record in rdr.records() {
            let record = record?;
            let parts: Vec<&str> = record
                .iter()
                .flat_map(|r| r.split_whitespace())
                .collect();
            if parts.is_empty() || parts[0].starts_with('#') {
                continue;
            }
            if parts.len() < 2 {
                let line = record.position().map(|p| p.line()).unwrap_or(0);
                return Err(format!("invalid format at line {}: expected 'feature field'", line))?;
            }
            fc.feature_to_field.insert(parts[0].to_string(), parts[1].to_string());
        }
        Ok(fc)
    }

    /// Tries JSON first, then the text format. The result is validated.
    pub fn new_from_filepath<P: AsRef<Path>>(path: P) -> Result<FieldConfig, Box<dyn Error>> {
        let path = path.as_ref();
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;

        let fc = match FieldConfig::new_from_json_str(&contents) {
            Ok(fc) => {
                log::info!("Loaded field config from {:?} (JSON format)", path);
                fc
            }
            Err(json_err) => match FieldConfig::new_from_text_str(&contents) {
                Ok(fc) => {
                    log::info!("Loaded field config from {:?} (text format)", path);
                    fc
                }
                Err(text_err) => {
                    return Err(format!(
                        "failed to load field config from {:?} (JSON: {}, text: {})",
                        path, json_err, text_err
                    ))?
                }
            },
        };
        fc.validate()?;
        log::info!(
            "Field config mode: {:?}, {} mappings",
            fc.mode,
            fc.feature_to_field.len()
        );
        Ok(fc)
    }

    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.mode == FieldMode::Config && self.feature_to_field.is_empty() {
            return Err("config mode requires feature_to_field mapping")?;
        }
        Ok(())
    }

    /// Resolves the field of a feature written without one.
    ///
    /// Large numeric features encode the field in their upper 32 bits; other
    /// features need a mapping (longest prefix wins) or the default field.
    pub fn field_for_feature(&self, feature: &str) -> Result<String, Box<dyn Error>> {
        if let Some(field) = numeric_field(feature, self.numeric_field_threshold, &self.numeric_field_prefix) {
            return Ok(field);
        }
        if self.mode == FieldMode::Explicit {
            return Err(format!(
                "feature '{}' has no field and field config is in explicit mode",
                feature
            ))?;
        }

        if self.use_prefix {
            let matched = self
                .feature_to_field
                .iter()
                .filter(|(prefix, _)| feature.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len());
            if let Some((_, field)) = matched {
                return Ok(field.clone());
            }
        } else if let Some(field) = self.feature_to_field.get(feature) {
            return Ok(field.clone());
        }

        if !self.default_field.is_empty() {
            return Ok(self.default_field.clone());
        }

        Err(format!(
            "feature '{}' not found in config and not a large numeric feature (>= {})",
            feature, self.numeric_field_threshold
        ))?
    }
}
