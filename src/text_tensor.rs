//! Plain-text tensor dumps, the format other implementations of the layer
//! write their intermediates in so they can be diffed against ours.
//!
//! A dump is a sequence of whitespace separated numbers. Lines starting
//! with `#` are comments, except one of the form `# Shape: (32, 6, 5, 4, 8)`
//! which announces the dimensions of the values that follow:
//!
//! ```text
//! # output
//! # Shape: (1, 2, 3)
//! # [0, 0] - Shape: (2, 3)
//!     0.100000    0.200000    0.300000
//!    -1.000000    2.500000    1e-7
//! ```

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, multispace0, multispace1, not_line_ending, space0, u64},
    combinator::{all_consuming, eof, map, opt, peek, value},
    error::Error,
    multi::{many0, separated_list0},
    number::complete::float,
    sequence::{delimited, preceded, terminated, tuple},
    Finish, IResult,
};

use std::{
    fs,
    io::{self, Write},
    path::Path,
    str::FromStr,
};

use crate::error::LoadError;
use crate::tensor::FeatureTensor;

/// Numbers read from a dump, and the dimensions it announced, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct TextDump {
    /// From the first `# Shape:` line
    pub dims: Option<Vec<usize>>,
    /// Every number, in file order
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
enum Item {
    Dims(Vec<u64>),
    Comment,
    Value(f32),
}

fn parse_dims(s: &str) -> IResult<&str, Vec<u64>> {
    preceded(
        tuple((char('#'), space0, tag("Shape:"), space0)),
        terminated(
            delimited(
                char('('),
                separated_list0(tuple((space0, char(','), space0)), u64),
                tuple((opt(char(',')), space0, char(')'))),
            ),
            not_line_ending,
        ),
    )(s)
}

fn parse_comment(s: &str) -> IResult<&str, ()> {
    value((), preceded(char('#'), not_line_ending))(s)
}

fn parse_value(s: &str) -> IResult<&str, f32> {
    terminated(float, peek(alt((multispace1, eof))))(s)
}

fn parse_item(s: &str) -> IResult<&str, Item> {
    alt((
        map(parse_dims, Item::Dims),
        map(parse_comment, |_| Item::Comment),
        map(parse_value, Item::Value),
    ))(s)
}

fn parse_dump(s: &str) -> IResult<&str, TextDump> {
    map(
        all_consuming(terminated(many0(preceded(multispace0, parse_item)), multispace0)),
        |items| {
            let mut dims = None;
            let mut values = Vec::new();
            for item in items {
                match item {
                    Item::Dims(d) if dims.is_none() => {
                        dims = Some(d.into_iter().map(|x| x as usize).collect())
                    }
                    Item::Value(v) => values.push(v),
                    _ => {}
                }
            }
            TextDump { dims, values }
        },
    )(s)
}

impl FromStr for TextDump {
    type Err = Error<String>;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_dump(s).finish() {
            Ok((_remaining, dump)) => Ok(dump),
            Err(Error { input, code }) => Err(Error {
                input: input.chars().take(40).collect(),
                code,
            }),
        }
    }
}

impl TextDump {
    /// Parses a dump and checks the value count against any announced
    /// dimensions.
    pub fn parse(text: &str) -> Result<Self, LoadError> {
        let dump: TextDump = text
            .parse()
            .map_err(|e: Error<String>| LoadError::Parse(format!("{:?} near {:?}", e.code, e.input)))?;
        if let Some(dims) = &dump.dims {
            let expected: usize = dims.iter().product();
            if expected != dump.values.len() {
                return Err(LoadError::SampleCount {
                    expected,
                    found: dump.values.len(),
                });
            }
        }
        Ok(dump)
    }

    /// Reads and parses a dump file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        Self::parse(&fs::read_to_string(path)?)
    }
}

/// Writes `values` as a dump: a header with the dimensions and summary
/// statistics, then one commented block per 2D slice with `dims`' last
/// axis along each line.
pub fn write_values(out: &mut impl Write, name: &str, dims: &[usize], values: &[f32]) -> io::Result<()> {
    write_header(out, name, dims)?;
    if !values.is_empty() {
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64;
        writeln!(out, "# Min: {:.8}, Max: {:.8}, Mean: {:.8}", min, max, mean)?;
    }
    writeln!(out, "#{}", "=".repeat(70))?;
    write_blocks(out, dims, values, |out, v| write!(out, " {:12.6}", v))
}

/// Writes an index table in the same layout as [write_values]. Integers
/// stay exact, which `f32` values stop being past `2^24`.
pub fn write_indices(out: &mut impl Write, name: &str, dims: &[usize], values: &[i64]) -> io::Result<()> {
    write_header(out, name, dims)?;
    if let (Some(min), Some(max)) = (values.iter().min(), values.iter().max()) {
        writeln!(out, "# Min: {}, Max: {}", min, max)?;
    }
    writeln!(out, "#{}", "=".repeat(70))?;
    write_blocks(out, dims, values, |out, v| write!(out, " {:8}", v))
}

fn write_header<W: Write>(out: &mut W, name: &str, dims: &[usize]) -> io::Result<()> {
    let dims_text: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
    writeln!(out, "# {}", name)?;
    writeln!(out, "# Shape: ({})", dims_text.join(", "))
}

fn write_blocks<W: Write, T>(
    out: &mut W,
    dims: &[usize],
    values: &[T],
    mut write_one: impl FnMut(&mut W, &T) -> io::Result<()>,
) -> io::Result<()> {
    let row_len = dims.last().copied().unwrap_or(values.len()).max(1);
    let rows = if dims.len() >= 2 { dims[dims.len() - 2].max(1) } else { 1 };
    let outer = &dims[..dims.len().saturating_sub(2)];
    for (b, block) in values.chunks(row_len * rows).enumerate() {
        if !outer.is_empty() {
            let mut index = vec![0; outer.len()];
            let mut rest = b;
            for (slot, &d) in index.iter_mut().zip(outer).rev() {
                *slot = rest % d.max(1);
                rest /= d.max(1);
            }
            let index: Vec<String> = index.iter().map(|i| i.to_string()).collect();
            writeln!(out, "\n# [{}]", index.join(", "))?;
        }
        for row in block.chunks(row_len) {
            for v in row {
                write_one(out, v)?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

/// Writes a grid tensor as a dump.
pub fn write_tensor(out: &mut impl Write, name: &str, tensor: &FeatureTensor) -> io::Result<()> {
    write_values(out, name, &tensor.shape().dims(), tensor.data())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;

    #[test]
    fn test_dims_line() {
        let (leftover, dims) = parse_dims("# Shape: (32, 6, 5, 4, 8)").unwrap();
        assert_eq!(leftover, "");
        assert_eq!(dims, vec![32, 6, 5, 4, 8]);

        let (_, dims) = parse_dims("#Shape: (4,)").unwrap();
        assert_eq!(dims, vec![4]);
    }

    #[test]
    fn test_comments_and_values() {
        let s = "# layer0\n# Shape: (2, 3)\n# Min: 0, Max: 1\n  0.1 0.2\n0.3\n -4e-3   nan 1e2\n";
        let dump: TextDump = s.parse().unwrap();
        assert_eq!(dump.dims, Some(vec![2, 3]));
        assert_eq!(dump.values.len(), 6);
        assert_eq!(dump.values[3], -4e-3);
        assert!(dump.values[4].is_nan());
        assert_eq!(dump.values[5], 100.0);
    }

    #[test]
    fn test_no_dims() {
        let dump = TextDump::parse("1 2 3\n4").unwrap();
        assert_eq!(dump.dims, None);
        assert_eq!(dump.values, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(TextDump::parse("").unwrap().values, Vec::<f32>::new());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!("1.0 2.0x 3.0".parse::<TextDump>().is_err());
        assert!(matches!(TextDump::parse("1 2 abc"), Err(LoadError::Parse(_))));
    }

    #[test]
    fn test_count_must_match_dims() {
        assert!(matches!(
            TextDump::parse("# Shape: (2, 2)\n1 2 3"),
            Err(LoadError::SampleCount { expected: 4, found: 3 })
        ));
    }

    #[test]
    fn test_written_dump_reads_back() {
        let shape = Shape {
            channels: 2,
            rotations: 1,
            charts: 5,
            rows: 2,
            cols: 4,
        };
        let t = FeatureTensor::from_fn(shape, |c, _, k, i, j| c as f32 - (k * 8 + i * 4 + j) as f32 * 0.125);
        let mut buf = Vec::new();
        write_tensor(&mut buf, "padded", &t).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("# [1, 0, 4]"));

        let dump = TextDump::parse(&text).unwrap();
        assert_eq!(dump.dims, Some(shape.dims().to_vec()));
        assert_eq!(dump.values, t.data());
    }

    #[test]
    fn test_index_dump_reads_back() {
        let values: Vec<i64> = vec![-1, 0, 16_777_217, 3, -1, 40_000_001];
        let mut buf = Vec::new();
        write_indices(&mut buf, "reorder_idx", &[2, 3], &values).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("16777217"));
        assert!(text.contains("# Min: -1, Max: 40000001"));
        let dump = TextDump::parse(&text).unwrap();
        assert_eq!(dump.dims, Some(vec![2, 3]));
        assert_eq!(dump.values.len(), 6);
        assert_eq!(dump.values[0], -1.0);
    }

    #[test]
    fn test_dump_file() {
        let tempfile = tempfile::NamedTempFile::new().unwrap();
        let mut f = fs::File::create(tempfile.path()).unwrap();
        write_values(&mut f, "bias", &[3], &[0.5, -0.25, 8.0]).unwrap();
        drop(f);
        let dump = TextDump::from_path(tempfile.path()).unwrap();
        assert_eq!(dump.values, vec![0.5, -0.25, 8.0]);
    }
}
