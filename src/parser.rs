use std::error::Error;

use crate::field_config::{self, FieldConfig};

pub const SPECIAL_FIELD: &str = "special";

#[derive(Clone, Debug, PartialEq)]
pub struct FeatureValue {
    pub field: String,
    pub feature: String,
    pub value: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub label: i32, // always -1 or 1
    pub features: Vec<FeatureValue>,
}

impl Sample {
    pub fn new(label: i32, features: Vec<FeatureValue>) -> Sample {
        Sample {
            label: if label > 0 { 1 } else { -1 },
            features,
        }
    }
}

fn parse_value(token: &str, value_str: &str) -> Result<f64, Box<dyn Error>> {
    match value_str.parse::<f64>() {
        Ok(v) => Ok(v),
        Err(e) => Err(format!("invalid feature value in \"{}\": {}", token, e))?,
    }
}

/// Resolves the field of a `feature:value` token
fn field_for_fieldless(feature: &str, field_config: Option<&FieldConfig>) -> Result<String, Box<dyn Error>> {
    if feature.starts_with('-') {
        return Ok(SPECIAL_FIELD.to_string());
    }
    match field_config {
        Some(fc) => fc.field_for_feature(feature),
        None => {
            match field_config::numeric_field(
                feature,
                field_config::DEFAULT_NUMERIC_FIELD_THRESHOLD,
                field_config::DEFAULT_NUMERIC_FIELD_PREFIX,
            ) {
                Some(field) => Ok(field),
                None => Err(format!(
                    "small feature '{}' requires a field config file, use --field_config or the field:feature:value format",
                    feature
                ))?,
            }
        }
    }
}

/// Parses `label token token ...` where a token is `field:feature:value`
/// or `feature:value`. Zero valued features are dropped.
pub fn parse_line(line: &str, field_config: Option<&FieldConfig>) -> Result<Sample, Box<dyn Error>> {
    let mut parts = line.split_whitespace();
    let label_str = match parts.next() {
        Some(l) => l,
        None => return Err("empty line")?,
    };
    let label: i32 = match label_str.parse() {
        Ok(l) => l,
        Err(e) => return Err(format!("invalid label \"{}\": {}", label_str, e))?,
    };

    let mut features = Vec::new();
    for token in parts {
        let kv: Vec<&str> = token.split(':').collect();
        let (field, feature, value) = match kv.len() {
            3 => (kv[0].to_string(), kv[1], parse_value(token, kv[2])?),
            2 => {
                let value = parse_value(token, kv[1])?;
                (field_for_fieldless(kv[0], field_config)?, kv[0], value)
            }
            _ => return Err(format!("invalid feature format: {}", token))?,
        };
        if value != 0.0 {
            features.push(FeatureValue {
                field,
                feature: feature.to_string(),
                value,
            });
        }
    }
    Ok(Sample::new(label, features))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fv(field: &str, feature: &str, value: f64) -> FeatureValue {
        FeatureValue {
            field: field.to_string(),
            feature: feature.to_string(),
            value,
        }
    }

    #[test]
    fn test_ffm_format() {
        let s = parse_line("1 user:u123:1 item:i456:1 price:p1:0.5", None).unwrap();
        assert_eq!(s.label, 1);
        assert_eq!(
            s.features,
            vec![fv("user", "u123", 1.0), fv("item", "i456", 1.0), fv("price", "p1", 0.5)]
        );
    }

    #[test]
    fn test_labels() {
        assert_eq!(parse_line("0 a:b:1", None).unwrap().label, -1);
        assert_eq!(parse_line("-1 a:b:1", None).unwrap().label, -1);
        assert_eq!(parse_line("5", None).unwrap().label, 1);
        assert!(parse_line("1.0 a:b:1", None).is_err());
        assert!(parse_line("yes a:b:1", None).is_err());
        assert!(parse_line("", None).is_err());
        assert!(parse_line("   \t", None).is_err());
    }

    #[test]
    fn test_zero_values_dropped() {
        let s = parse_line("1 a:x:0 b:y:2 c:z:0.0", None).unwrap();
        assert_eq!(s.features, vec![fv("b", "y", 2.0)]);
    }

    #[test]
    fn test_malformed_tokens() {
        assert!(parse_line("1 a:b:c:1", None).is_err());
        assert!(parse_line("1 abc", None).is_err());
        assert!(parse_line("1 a:b:xyz", None).is_err());
    }

    #[test]
    fn test_large_numeric_feature_without_config() {
        let s = parse_line("1 51539607553:1 55834574849:0.5", None).unwrap();
        assert_eq!(
            s.features,
            vec![fv("field_12", "51539607553", 1.0), fv("field_13", "55834574849", 0.5)]
        );
    }

    #[test]
    fn test_small_feature_needs_config() {
        assert!(parse_line("1 64:1", None).is_err());
        assert!(parse_line("1 sex:1", None).is_err());
        let fc = FieldConfig::new_from_text_str("sex user\n6 misc\n").unwrap();
        let s = parse_line("1 sex:1 64:1", Some(&fc)).unwrap();
        assert_eq!(s.features, vec![fv("user", "sex", 1.0), fv("misc", "64", 1.0)]);
    }

    #[test]
    fn test_negative_feature_goes_to_special_field() {
        let s = parse_line("1 -5:1 a:b:1", None).unwrap();
        assert_eq!(s.features, vec![fv(SPECIAL_FIELD, "-5", 1.0), fv("a", "b", 1.0)]);
    }
}
