use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

/// Wire type of a described register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// One unsigned 16-bit register.
    Uint16,
    /// One signed 16-bit register.
    Int16,
    /// No register of its own; the sum of the `_phase1..3` fields of the
    /// same base name, taken from the current tick.
    Phases,
}

impl FromStr for FieldType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uint16" => Ok(Self::Uint16),
            "int16" => Ok(Self::Int16),
            "phases" => Ok(Self::Phases),
            other => bail!("unknown field type: {other}"),
        }
    }
}

/// How the per-tick samples of a field collapse into its bucket value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Time-weighted average over the minute.
    Average,
    /// Largest observed sample.
    Max,
    /// Smallest observed sample.
    Min,
    /// Time-weighted average, split into `_pos` and `_neg` fields by sign.
    SignedSplit,
}

impl FromStr for Reduction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "average" => Ok(Self::Average),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            "signed" => Ok(Self::SignedSplit),
            other => bail!("unknown reduction: {other}"),
        }
    }
}

/// One record of the field-description file: how to read and reduce one
/// quantity of a generic Modbus meter.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    /// Modbus slave unit id the register lives on.
    pub unit: u8,
    pub address: u16,
    pub field_type: FieldType,
    pub scale: f32,
    pub reduction: Reduction,
}

impl FieldDescriptor {
    /// Parses one `name,unit,address,type,scalefactor,op` record.
    fn parse_record(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() != 6 {
            bail!("expected 6 comma-separated values, got {}", parts.len());
        }

        let name = parts[0].to_string();
        if name.is_empty() {
            bail!("empty field name");
        }

        Ok(Self {
            name,
            unit: parts[1].parse().with_context(|| format!("unit '{}'", parts[1]))?,
            address: parts[2]
                .parse()
                .with_context(|| format!("address '{}'", parts[2]))?,
            field_type: parts[3].parse()?,
            scale: parts[4]
                .parse()
                .with_context(|| format!("scale factor '{}'", parts[4]))?,
            reduction: parts[5].parse()?,
        })
    }
}

/// Parses a field-description file: one record per line, `#` to end of line
/// is comment, blank lines ignored.
pub fn parse_fields(input: &str) -> Result<Vec<FieldDescriptor>> {
    let mut fields = Vec::new();
    for (lineno, raw) in input.lines().enumerate() {
        let line = match raw.find('#') {
            Some(i) => &raw[..i],
            None => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let field = FieldDescriptor::parse_record(line)
            .with_context(|| format!("field description line {}", lineno + 1))?;
        fields.push(field);
    }

    if fields.is_empty() {
        bail!("field description contains no records");
    }

    Ok(fields)
}

/// Loads and parses the `datafields` file.
pub fn load_fields(path: &Path) -> Result<Vec<FieldDescriptor>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading field description {}", path.display()))?;
    parse_fields(&data).with_context(|| format!("parsing field description {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
grid_power,1,40001,int16,10.0,signed
urms_phase1,1,40010,uint16,1.0,average
urms_phase2,1,40011,uint16,1.0,average
urms_phase3,1,40012,uint16,1.0,average
urms,1,0,phases,1.0,average
peak_power,2,40020,uint16,10.0,max
";

    #[test]
    fn test_parse_sample() {
        let fields = parse_fields(SAMPLE).expect("valid input");
        assert_eq!(fields.len(), 6);

        assert_eq!(
            fields[0],
            FieldDescriptor {
                name: "grid_power".to_string(),
                unit: 1,
                address: 40001,
                field_type: FieldType::Int16,
                scale: 10.0,
                reduction: Reduction::SignedSplit,
            }
        );
        assert_eq!(fields[4].field_type, FieldType::Phases);
        assert_eq!(fields[5].unit, 2);
        assert_eq!(fields[5].reduction, Reduction::Max);
    }

    #[test]
    fn test_comments_and_blank_lines_do_not_change_result() {
        let noisy = format!("# header\n\n{SAMPLE}\n   # trailing comment\n\n");
        assert_eq!(
            parse_fields(&noisy).expect("valid"),
            parse_fields(SAMPLE).expect("valid"),
        );
    }

    #[test]
    fn test_inline_comment_stripped() {
        let fields =
            parse_fields("urms_phase1,1,40010,uint16,1.0,average # volts\n").expect("valid");
        assert_eq!(fields[0].name, "urms_phase1");
        assert_eq!(fields[0].reduction, Reduction::Average);
    }

    #[test]
    fn test_wrong_column_count_rejected() {
        let err = parse_fields("urms_phase1,1,40010,uint16,1.0\n").expect_err("5 columns");
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(parse_fields("x,1,1,float32,1.0,average\n").is_err());
    }

    #[test]
    fn test_unknown_reduction_rejected() {
        assert!(parse_fields("x,1,1,uint16,1.0,median\n").is_err());
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(parse_fields("# only a comment\n").is_err());
    }
}
