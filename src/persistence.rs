use std::error::Error;
use std::fs;
use std::io;
use std::io::{BufRead, Write};

use crate::model::{FfmModel, BIAS_FEATURE_NAME};
use crate::model_instance::ModelFormat;
use crate::model_unit::{LatentVectors, ModelUnit};

const FIELDS_HEADER: &str = "FIELDS";

/// Formats like C's `%.6g`: six significant digits, trailing zeros removed,
/// scientific notation for very small or very large magnitudes.
pub fn format_g6(v: f64) -> String {
    if v == 0.0 {
        return "0".to_string();
    }
    if v.is_nan() {
        return "NaN".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "+Inf".to_string() } else { "-Inf".to_string() };
    }

    // the exponent has to be taken after rounding to 6 digits
    let sci = format!("{:.5e}", v);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if exp < -4 || exp >= 6 {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exp.abs())
    } else {
        let decimals = (5 - exp) as usize;
        trim_fraction(&format!("{:.*}", decimals, v)).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn parse_f64(token: &str) -> Result<f64, Box<dyn Error>> {
    match token.parse::<f64>() {
        Ok(v) => Ok(v),
        Err(e) => Err(format!("invalid number \"{}\": {}", token, e))?,
    }
}

/// Number of whitespace separated columns of a feature line
pub fn feature_line_columns(num_fields: usize, k: usize) -> usize {
    2 + num_fields * k + 2 * (1 + num_fields * k)
}

fn has_any_state(unit: &ModelUnit) -> bool {
    if unit.w.get() != 0.0 || unit.w_n.get() != 0.0 || unit.w_z.get() != 0.0 {
        return true;
    }
    unit.latent_field_indices().into_iter().any(|f| match unit.latent(f) {
        Some(lv) => lv.v.iter().chain(lv.n.iter()).chain(lv.z.iter()).any(|x| x.get() != 0.0),
        None => false,
    })
}

fn push_latent_columns<F>(parts: &mut Vec<String>, unit: &ModelUnit, num_fields: usize, k: usize, pick: F)
where
    F: Fn(&LatentVectors) -> Vec<f64>,
{
    for field_index in 0..num_fields {
        match unit.latent(field_index) {
            Some(vectors) => parts.extend(pick(&vectors).iter().map(|x| format_g6(*x))),
            None => parts.extend((0..k).map(|_| "0".to_string())),
        }
    }
}

pub fn write_model_txt(model: &FfmModel, output: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    let field_names = model.field_names();
    let num_fields = field_names.len();
    let k = model.factor_num();

    writeln!(output, "{} {}", FIELDS_HEADER, field_names.join(" "))?;
    let bias = model.bias();
    writeln!(
        output,
        "{} {} {} {}",
        BIAS_FEATURE_NAME,
        format_g6(bias.w.get()),
        format_g6(bias.w_z.get()),
        format_g6(bias.w_n.get())
    )?;

    let mut parts: Vec<String> = Vec::with_capacity(feature_line_columns(num_fields, k));
    for (feature, unit) in model.units_sorted() {
        if !has_any_state(&unit) {
            continue;
        }
        parts.clear();
        parts.push(feature);
        parts.push(format_g6(unit.w.get()));
        push_latent_columns(&mut parts, &unit, num_fields, k, |lv| lv.v_values());
        parts.push(format_g6(unit.w_n.get()));
        parts.push(format_g6(unit.w_z.get()));
        push_latent_columns(&mut parts, &unit, num_fields, k, |lv| lv.n_values());
        push_latent_columns(&mut parts, &unit, num_fields, k, |lv| lv.z_values());
        writeln!(output, "{}", parts.join(" "))?;
    }
    Ok(())
}

pub fn save_model_to_filename(model: &FfmModel, filename: &str, format: ModelFormat) -> Result<(), Box<dyn Error>> {
    match format {
        ModelFormat::Txt => {}
        ModelFormat::Bin => return Err("binary format not yet implemented")?,
    }
    if model.fields().is_empty() {
        return Err("no valid samples processed, refusing to save an empty model")?;
    }
    let mut output = io::BufWriter::new(fs::File::create(filename)?);
    write_model_txt(model, &mut output)?;
    output.flush()?;
    log::info!(
        "Saved model to {} ({} fields, {} units)",
        filename,
        model.fields().len(),
        model.num_units()
    );
    Ok(())
}

struct ModelHeader {
    field_indices: Vec<usize>,
    bias: (f64, f64, f64), // w, wZ, wN
}

fn next_line(lines: &mut io::Lines<&mut dyn BufRead>) -> Result<Option<String>, Box<dyn Error>> {
    match lines.next() {
        Some(line) => Ok(Some(line?)),
        None => Ok(None),
    }
}

/// Reads the FIELDS and bias lines and registers the fields with the model
fn read_header(lines: &mut io::Lines<&mut dyn BufRead>, model: &FfmModel) -> Result<ModelHeader, Box<dyn Error>> {
    let fields_line = match next_line(lines)? {
        Some(line) => line,
        None => return Err("empty model file")?,
    };
    let header: Vec<&str> = fields_line.split_whitespace().collect();
    if header.len() < 2 || header[0] != FIELDS_HEADER {
        return Err("invalid model format: missing FIELDS header")?;
    }
    let field_indices: Vec<usize> = header[1..].iter().map(|f| model.register_field(f)).collect();

    let bias_line = match next_line(lines)? {
        Some(line) => line,
        None => return Err("missing bias line")?,
    };
    let parts: Vec<&str> = bias_line.split_whitespace().collect();
    if parts.len() != 4 || parts[0] != BIAS_FEATURE_NAME {
        return Err(format!("invalid bias line: \"{}\"", bias_line))?;
    }
    let bias = (parse_f64(parts[1])?, parse_f64(parts[2])?, parse_f64(parts[3])?);
    Ok(ModelHeader { field_indices, bias })
}

fn parse_unit(parts: &[&str], field_indices: &[usize], k: usize) -> Result<ModelUnit, Box<dyn Error>> {
    let num_fields = field_indices.len();
    let values = parts[1..]
        .iter()
        .map(|p| parse_f64(p))
        .collect::<Result<Vec<f64>, Box<dyn Error>>>()?;

    let w = values[0];
    let v = &values[1..1 + num_fields * k];
    let w_n = values[1 + num_fields * k];
    let w_z = values[2 + num_fields * k];
    let n = &values[3 + num_fields * k..3 + 2 * num_fields * k];
    let z = &values[3 + 2 * num_fields * k..];

    let unit = ModelUnit::with_linear(w, w_n, w_z);
    for (slot, field_index) in field_indices.iter().enumerate() {
        let range = slot * k..(slot + 1) * k;
        unit.set_latent(
            *field_index,
            LatentVectors::from_values(&v[range.clone()], &n[range.clone()], &z[range]),
        );
    }
    Ok(unit)
}

/// Loads every parameter for warm-start training; any malformed line is fatal
pub fn read_model_txt(input: &mut dyn BufRead, model: &FfmModel) -> Result<(), Box<dyn Error>> {
    let k = model.factor_num();
    let mut lines = input.lines();
    let header = read_header(&mut lines, model)?;
    let (w, w_z, w_n) = header.bias;
    model.bias().w.set(w);
    model.bias().w_z.set(w_z);
    model.bias().w_n.set(w_n);

    let expected = feature_line_columns(header.field_indices.len(), k);
    let mut line_num = 2;
    while let Some(line) = next_line(&mut lines)? {
        line_num += 1;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        if parts.len() != expected {
            return Err(format!(
                "invalid feature line {}: expected {} columns, got {}",
                line_num,
                expected,
                parts.len()
            ))?;
        }
        let unit = match parse_unit(&parts, &header.field_indices, k) {
            Ok(unit) => unit,
            Err(e) => return Err(format!("invalid feature line {}: {}", line_num, e))?,
        };
        model.insert_unit(parts[0], unit);
    }
    Ok(())
}

/// Loads a model for scoring only. Malformed feature lines are skipped,
/// units without any nonzero weight or latent factor are dropped, and
/// FTRL accumulators are not kept. Returns the number of skipped lines.
pub fn read_model_txt_for_predict(input: &mut dyn BufRead, model: &FfmModel) -> Result<usize, Box<dyn Error>> {
    let k = model.factor_num();
    let mut lines = input.lines();
    let header = read_header(&mut lines, model)?;
    model.bias().w.set(header.bias.0);

    let num_fields = header.field_indices.len();
    let expected = feature_line_columns(num_fields, k);
    let zeros = vec![0.0; k];
    let mut skipped = 0;
    while let Some(line) = next_line(&mut lines)? {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        if parts.len() != expected {
            skipped += 1;
            continue;
        }
        let w = match parts[1].parse::<f64>() {
            Ok(w) => w,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };

        let unit = ModelUnit::with_linear(w, 0.0, 0.0);
        for (slot, field_index) in header.field_indices.iter().enumerate() {
            // unparsable factors count as zero
            let v: Vec<f64> = parts[2 + slot * k..2 + (slot + 1) * k]
                .iter()
                .map(|p| p.parse::<f64>().unwrap_or(0.0))
                .collect();
            if v.iter().any(|x| *x != 0.0) {
                unit.set_latent(*field_index, LatentVectors::from_values(&v, &zeros, &zeros));
            }
        }
        if unit.is_non_zero() {
            model.insert_unit(parts[0], unit);
        }
    }
    Ok(skipped)
}

pub fn load_model_from_filename(model: &FfmModel, filename: &str, format: ModelFormat) -> Result<(), Box<dyn Error>> {
    match format {
        ModelFormat::Txt => {}
        ModelFormat::Bin => return Err("binary format not yet implemented")?,
    }
    let mut input = io::BufReader::new(fs::File::open(filename)?);
    read_model_txt(&mut input, model)?;
    log::info!(
        "Loaded model from {} ({} fields, {} units)",
        filename,
        model.fields().len(),
        model.num_units()
    );
    Ok(())
}

pub fn load_predict_model_from_filename(model: &FfmModel, filename: &str, format: ModelFormat) -> Result<(), Box<dyn Error>> {
    match format {
        ModelFormat::Txt => {}
        ModelFormat::Bin => return Err("binary format not yet implemented")?,
    }
    let mut input = io::BufReader::new(fs::File::open(filename)?);
    let skipped = read_model_txt_for_predict(&mut input, model)?;
    if skipped > 0 {
        log::warn!("Skipped {} malformed feature lines in {}", skipped, filename);
    }
    log::info!(
        "Loaded predict model from {} ({} fields, {} non-zero units)",
        filename,
        model.fields().len(),
        model.num_units()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_line;
    use crate::vector_ops::ScalarOps;

    fn empty_model(k: usize) -> FfmModel {
        FfmModel::new(k, 0.0, 0.1, 42).unwrap()
    }

    #[test]
    fn test_format_g6() {
        assert_eq!(format_g6(0.0), "0");
        assert_eq!(format_g6(1.0), "1");
        assert_eq!(format_g6(-0.5), "-0.5");
        assert_eq!(format_g6(0.1), "0.1");
        assert_eq!(format_g6(123456.0), "123456");
        assert_eq!(format_g6(1234567.0), "1.23457e+06");
        assert_eq!(format_g6(999999.7), "1e+06");
        assert_eq!(format_g6(3.14159265), "3.14159");
        assert_eq!(format_g6(0.0001), "0.0001");
        assert_eq!(format_g6(0.0000123456789), "1.23457e-05");
        assert_eq!(format_g6(-2.5e-10), "-2.5e-10");
        assert_eq!(format_g6(1e100), "1e+100");
    }

    #[test]
    fn test_feature_line_columns() {
        // feature, w, 2 fields * 2, wN, wZ, 2 * (2 fields * 2)
        assert_eq!(feature_line_columns(2, 2), 1 + 1 + 4 + 2 + 8);
        assert_eq!(feature_line_columns(0, 8), 4);
    }

    #[test]
    fn test_write_layout() {
        let model = empty_model(2);
        let a = model.register_field("a");
        model.register_field("b");
        model.bias().w.set(0.5);
        model.bias().w_z.set(-1.0);
        model.bias().w_n.set(2.0);
        let unit = ModelUnit::with_linear(0.25, 4.0, -3.0);
        unit.set_latent(a, LatentVectors::from_values(&[1.0, 2.0], &[3.0, 4.0], &[5.0, 6.0]));
        model.insert_unit("x", unit);
        model.insert_unit("empty", ModelUnit::new());

        let mut out: Vec<u8> = Vec::new();
        write_model_txt(&model, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "FIELDS a b\nbias 0.5 -1 2\nx 0.25 1 2 0 0 4 -3 3 4 0 0 5 6 0 0\n"
        );
    }

    #[test]
    fn test_round_trip() {
        let model = empty_model(2);
        let a = model.register_field("a");
        let b = model.register_field("b");
        model.bias().w.set(-0.0123);
        model.bias().w_n.set(7.5);
        let unit = ModelUnit::with_linear(0.1234567, 1.5, -0.75);
        unit.set_latent(b, LatentVectors::from_values(&[0.01, -0.02], &[0.5, 0.25], &[-1.0, 1e-7]));
        model.insert_unit("u1", unit);
        let unit = ModelUnit::with_linear(0.0, 0.3, 0.05);
        unit.set_latent(a, LatentVectors::from_values(&[0.2, 0.3], &[0.0, 0.0], &[0.0, 0.0]));
        model.insert_unit("u2", unit);

        let mut out: Vec<u8> = Vec::new();
        write_model_txt(&model, &mut out).unwrap();

        let loaded = empty_model(2);
        read_model_txt(&mut out.as_slice(), &loaded).unwrap();
        assert_eq!(loaded.field_names(), vec!["a", "b"]);
        assert_eq!(loaded.bias().w.get(), -0.0123);
        assert_eq!(loaded.bias().w_n.get(), 7.5);
        assert_eq!(loaded.num_units(), 2);

        let u1 = loaded.unit("u1").unwrap();
        assert_eq!(u1.w.get(), 0.123457);
        assert_eq!(u1.w_n.get(), 1.5);
        assert_eq!(u1.w_z.get(), -0.75);
        let lv = u1.latent(b).unwrap();
        assert_eq!(lv.v_values(), vec![0.01, -0.02]);
        assert_eq!(lv.n_values(), vec![0.5, 0.25]);
        assert_eq!(lv.z_values(), vec![-1.0, 1e-7]);
        // absent fields come back as zero vectors
        assert_eq!(u1.latent(a).unwrap().v_values(), vec![0.0, 0.0]);

        let u2 = loaded.unit("u2").unwrap();
        assert_eq!(u2.latent(a).unwrap().v_values(), vec![0.2, 0.3]);
    }

    #[test]
    fn test_strict_load_errors() {
        let loaded = empty_model(2);
        assert!(read_model_txt(&mut "".as_bytes(), &loaded).is_err());
        let loaded = empty_model(2);
        assert!(read_model_txt(&mut "FIELDS\nbias 0 0 0\n".as_bytes(), &loaded).is_err());
        let loaded = empty_model(2);
        assert!(read_model_txt(&mut "HEADER a\nbias 0 0 0\n".as_bytes(), &loaded).is_err());
        let loaded = empty_model(2);
        assert!(read_model_txt(&mut "FIELDS a\n".as_bytes(), &loaded).is_err());
        let loaded = empty_model(2);
        assert!(read_model_txt(&mut "FIELDS a\nbias 0 0\n".as_bytes(), &loaded).is_err());
        let loaded = empty_model(2);
        let short_line = "FIELDS a\nbias 0 0 0\nx 1 2 3\n";
        assert!(read_model_txt(&mut short_line.as_bytes(), &loaded).is_err());
        let loaded = empty_model(1);
        let bad_number = "FIELDS a\nbias 0 0 0\nx 1 zz 0 0 0 0\n";
        assert!(read_model_txt(&mut bad_number.as_bytes(), &loaded).is_err());
    }

    #[test]
    fn test_predict_load_skips_and_prunes() {
        let text = "FIELDS f1 f2\n\
                    bias 0.5 9 9\n\
                    good 0.5 1 0 0 0 7 7 0 0 0 0 0 0 0 0\n\
                    zero 0 0 0 0 0 7 7 1 1 1 1 1 1 1 1\n\
                    latent_only 0 0 0 0.5 0.5 0 0 0 0 0 0 0 0 0 0\n\
                    short 1 2 3\n\
                    badw xx 1 0 0 0 0 0 0 0 0 0 0 0 0 0\n";
        let model = empty_model(2);
        let skipped = read_model_txt_for_predict(&mut text.as_bytes(), &model).unwrap();
        assert_eq!(skipped, 2);
        assert_eq!(model.num_units(), 2);
        assert!(model.unit("zero").is_none());
        assert_eq!(model.bias().w.get(), 0.5);
        let good = model.unit("good").unwrap();
        assert_eq!(good.latent(0).unwrap().v_values(), vec![1.0, 0.0]);
        assert!(good.latent(1).is_none());
        assert!(model.unit("latent_only").unwrap().latent(1).is_some());
    }

    #[test]
    fn test_empty_predict_model_scores_half() {
        let model = empty_model(4);
        read_model_txt_for_predict(&mut "FIELDS f1 f2\nbias 0 0 0\n".as_bytes(), &model).unwrap();
        for line in &["1 f1:a:1", "-1 f1:a:1 f2:b:3", "0 zz:q:0.5"] {
            let sample = parse_line(line, None).unwrap();
            assert_eq!(model.predict(&sample, &ScalarOps {}), 0.5);
        }
    }

    #[test]
    fn test_bin_format_is_rejected() {
        let model = empty_model(2);
        model.register_field("a");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let path = path.to_str().unwrap();
        let err = save_model_to_filename(&model, path, ModelFormat::Bin).unwrap_err();
        assert!(err.to_string().contains("binary format not yet implemented"));
        assert!(load_model_from_filename(&model, path, ModelFormat::Bin).is_err());
        assert!(load_predict_model_from_filename(&model, path, ModelFormat::Bin).is_err());
    }

    #[test]
    fn test_refuses_to_save_model_without_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.txt");
        let model = empty_model(2);
        assert!(save_model_to_filename(&model, path.to_str().unwrap(), ModelFormat::Txt).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.txt");
        let path = path.to_str().unwrap();
        let model = empty_model(2);
        let f = model.register_field("f");
        let unit = ModelUnit::with_linear(1.0, 1.0, 1.0);
        unit.set_latent(f, LatentVectors::from_values(&[0.5, 0.5], &[1.0, 1.0], &[0.0, 0.0]));
        model.insert_unit("feat", unit);
        save_model_to_filename(&model, path, ModelFormat::Txt).unwrap();

        let loaded = empty_model(2);
        load_model_from_filename(&loaded, path, ModelFormat::Txt).unwrap();
        assert_eq!(loaded.unit("feat").unwrap().w.get(), 1.0);
        let predict = empty_model(2);
        load_predict_model_from_filename(&predict, path, ModelFormat::Txt).unwrap();
        assert_eq!(predict.unit("feat").unwrap().w_n.get(), 0.0);
    }
}
