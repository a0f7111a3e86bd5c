//! Composing commands from typed arguments and parsing replies into [`Value`]s.

mod binary;
mod template;

use std::{fmt, str::FromStr, sync::Arc};

pub use binary::{ByteOrder, NumericArray, NumericFormat, NumericKind, decode_array, read_binary_array};
use template::{apply_template, is_template};

use crate::{CodecConfig, FloatFormat, InstrumentError, Value};

/// How a command argument is converted to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgType {
    /// The [`Display`](std::fmt::Display) representation, unmodified.
    Raw,
    /// The string, unmodified.
    String,
    /// A decimal integer.
    Int,
    /// A float in the configured [`FloatFormat`].
    Float,
    /// One of the two configured boolean tokens.
    Bool,
    /// A list, each element converted with its own type and joined with commas.
    List(Vec<ArgType>),
    /// A positional format template such as `"{:.3f},{:d}"`, applied to the value or its elements.
    Template(String),
}

impl FromStr for ArgType {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(ArgType::Raw),
            "str" | "string" => Ok(ArgType::String),
            "int" => Ok(ArgType::Int),
            "float" => Ok(ArgType::Float),
            "bool" => Ok(ArgType::Bool),
            _ if is_template(s) => Ok(ArgType::Template(s.to_string())),
            _ => Err(InstrumentError::UnrecognizedType(format!("argument type '{s}'"))),
        }
    }
}

/// A user supplied reply parser, applied to the trimmed reply.
pub type ParseFn = Arc<dyn Fn(&str) -> Result<Value, InstrumentError> + Send + Sync>;

/// How a reply is parsed.
#[derive(Clone)]
pub enum DataType {
    /// The reply bytes, unmodified, as [`Value::Bytes`].
    Raw,
    /// The decoded and trimmed reply.
    String,
    /// An integer; the reply is parsed as a float and truncated if needed.
    Int,
    /// A float.
    Float,
    /// A float followed by an optional unit, e.g. `"1.5 V"`, as a two element list.
    ValueWithUnit,
    /// A boolean: the last token is an integer (non-zero is `true`) or anything but `off`.
    Bool,
    /// Look up the reply in a table, first by exact string then by integer value.
    Map(Vec<(String, Value)>),
    /// Apply a custom parser.
    Function(ParseFn),
    /// A comma separated list, each element parsed with its own type.
    List(Vec<DataType>),
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Raw => write!(f, "Raw"),
            DataType::String => write!(f, "String"),
            DataType::Int => write!(f, "Int"),
            DataType::Float => write!(f, "Float"),
            DataType::ValueWithUnit => write!(f, "ValueWithUnit"),
            DataType::Bool => write!(f, "Bool"),
            DataType::Map(map) => f.debug_tuple("Map").field(map).finish(),
            DataType::Function(_) => write!(f, "Function(..)"),
            DataType::List(items) => f.debug_tuple("List").field(items).finish(),
        }
    }
}

impl DataType {
    /// Create a [`DataType::Function`] from a closure.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&str) -> Result<Value, InstrumentError> + Send + Sync + 'static,
    {
        DataType::Function(Arc::new(f))
    }
}

impl FromStr for DataType {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(DataType::Raw),
            "str" | "string" => Ok(DataType::String),
            "int" => Ok(DataType::Int),
            "float" => Ok(DataType::Float),
            "value" => Ok(DataType::ValueWithUnit),
            "bool" => Ok(DataType::Bool),
            _ => Err(InstrumentError::UnrecognizedType(format!("data type '{s}'"))),
        }
    }
}

/// Format `value` like `3.300000E+00`: `precision` digits after the decimal point and a signed
/// exponent of at least two digits.
pub(crate) fn format_scientific(value: f64, precision: usize) -> String {
    let text = format!("{value:.precision$E}");
    match text.split_once('E') {
        Some((mantissa, exponent)) => match exponent.parse::<i32>() {
            Ok(exp) => {
                let sign = if exp < 0 { '-' } else { '+' };
                format!("{mantissa}E{sign}{:02}", exp.unsigned_abs())
            }
            Err(_) => text,
        },
        None => text,
    }
}

fn malformed(text: &str, expected: &str) -> InstrumentError {
    InstrumentError::MalformedReply(format!("expected {expected}, got '{text}'"))
}

fn parse_int(text: &str) -> Option<i64> {
    text.parse::<i64>()
        .ok()
        .or_else(|| text.parse::<f64>().ok().filter(|x| x.is_finite()).map(|x| x.trunc() as i64))
}

/// Converts between typed values and the text of commands and replies.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    /// Create a new codec.
    pub fn new(config: CodecConfig) -> Self {
        Codec { config }
    }

    /// The configuration of this codec.
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Compose a command.
    ///
    /// Without an argument the message is returned unchanged. Otherwise the converted argument is
    /// appended after a space, followed by the unit if given.
    ///
    /// # Arguments
    /// * `msg` - The command header, e.g. `"VOLT"`.
    /// * `arg` - The argument.
    /// * `arg_type` - How to convert the argument, detected from the value if `None`.
    /// * `unit` - Unit appended after the argument.
    /// * `bool_selector` - `(false, true)` tokens that replace the configured ones.
    ///
    /// # Example
    /// ```
    /// use instrumentcore::{ArgType, Codec, Value};
    ///
    /// let codec = Codec::default();
    /// let cmd = codec.compose("VOLT", Some(&Value::Float(3.3)), Some(&ArgType::Float), None, None);
    /// assert_eq!(cmd.unwrap(), "VOLT 3.300000E+00");
    /// ```
    pub fn compose(
        &self,
        msg: &str,
        arg: Option<&Value>,
        arg_type: Option<&ArgType>,
        unit: Option<&str>,
        bool_selector: Option<(&str, &str)>,
    ) -> Result<String, InstrumentError> {
        let Some(arg) = arg else {
            return Ok(msg.to_string());
        };
        let mut cmd = format!("{msg} {}", self.convert_arg(arg, arg_type, bool_selector)?);
        if let Some(unit) = unit {
            cmd.push(' ');
            cmd.push_str(unit);
        }
        Ok(cmd)
    }

    /// Convert a single argument to its wire text.
    pub fn convert_arg(
        &self,
        value: &Value,
        arg_type: Option<&ArgType>,
        bool_selector: Option<(&str, &str)>,
    ) -> Result<String, InstrumentError> {
        if value.is_unset() {
            return Err(InstrumentError::UnrecognizedType(
                "cannot convert an unset argument".to_string(),
            ));
        }
        let Some(arg_type) = arg_type else {
            return self.convert_auto(value, bool_selector);
        };
        match arg_type {
            ArgType::Raw | ArgType::String => Ok(value.to_string()),
            ArgType::Int => Ok(value.to_i64()?.to_string()),
            ArgType::Float => Ok(self.format_float(value.to_f64()?)),
            ArgType::Bool => {
                let flag = value.as_bool().ok_or_else(|| {
                    InstrumentError::InvalidArgument(format!("Expected a boolean, got {value:?}"))
                })?;
                Ok(self.bool_token(flag, bool_selector))
            }
            ArgType::List(types) => {
                let items = value.as_list().ok_or_else(|| {
                    InstrumentError::InvalidArgument(format!("Expected a list, got {value:?}"))
                })?;
                if items.len() != types.len() {
                    return Err(InstrumentError::LengthMismatch {
                        expected: types.len(),
                        actual: items.len(),
                        context: format!("list argument {value}"),
                    });
                }
                let parts = items
                    .iter()
                    .zip(types)
                    .map(|(item, ty)| self.convert_arg(item, Some(ty), bool_selector))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(parts.join(","))
            }
            ArgType::Template(template) => match value {
                Value::List(items) => apply_template(template, items),
                _ => apply_template(template, std::slice::from_ref(value)),
            },
        }
    }

    fn convert_auto(
        &self,
        value: &Value,
        bool_selector: Option<(&str, &str)>,
    ) -> Result<String, InstrumentError> {
        match value {
            Value::Bool(flag) => Ok(self.bool_token(*flag, bool_selector)),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(x) => Ok(self.format_float(*x)),
            Value::Str(s) => Ok(s.clone()),
            Value::Bytes(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            Value::List(items) => {
                let parts = items
                    .iter()
                    .map(|item| self.convert_arg(item, None, bool_selector))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(parts.join(","))
            }
            Value::Unset => Err(InstrumentError::UnrecognizedType(
                "cannot convert an unset argument".to_string(),
            )),
        }
    }

    fn bool_token(&self, flag: bool, bool_selector: Option<(&str, &str)>) -> String {
        let (false_token, true_token) = bool_selector
            .unwrap_or((self.config.false_token.as_str(), self.config.true_token.as_str()));
        let token = if flag { true_token } else { false_token };
        token.to_string()
    }

    /// Format a float according to the configured [`FloatFormat`].
    pub fn format_float(&self, value: f64) -> String {
        match self.config.float_format {
            FloatFormat::Scientific(precision) => format_scientific(value, precision),
            FloatFormat::Fixed(precision) => format!("{value:.precision$}"),
        }
    }

    /// Parse a reply.
    ///
    /// # Example
    /// ```
    /// use instrumentcore::{Codec, DataType, Value};
    ///
    /// let codec = Codec::default();
    /// let volts = codec.parse(b"3.300000E+00\n", &DataType::Float).unwrap();
    /// assert_eq!(volts, Value::Float(3.3));
    /// ```
    pub fn parse(&self, reply: &[u8], data_type: &DataType) -> Result<Value, InstrumentError> {
        let decoded = String::from_utf8_lossy(reply);
        let text = decoded.trim();
        match data_type {
            DataType::Raw => Ok(Value::Bytes(reply.to_vec())),
            DataType::String => Ok(Value::Str(text.to_string())),
            DataType::Int => parse_int(text)
                .map(Value::Int)
                .ok_or_else(|| malformed(text, "an integer")),
            DataType::Float => text
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| malformed(text, "a float")),
            DataType::ValueWithUnit => {
                let tokens: Vec<&str> = text.split_whitespace().collect();
                match tokens.as_slice() {
                    [number] | [number, _] => {
                        let number = number
                            .parse::<f64>()
                            .map_err(|_| malformed(text, "a value with unit"))?;
                        let unit = tokens.get(1).map_or(Value::Unset, |u| Value::from(*u));
                        Ok(Value::List(vec![Value::Float(number), unit]))
                    }
                    _ => Err(malformed(text, "a value with unit")),
                }
            }
            DataType::Bool => {
                let lower = text.to_lowercase();
                let token = lower
                    .split_whitespace()
                    .last()
                    .ok_or_else(|| malformed(text, "a boolean"))?;
                match parse_int(token) {
                    Some(i) => Ok(Value::Bool(i != 0)),
                    None => Ok(Value::Bool(token != "off")),
                }
            }
            DataType::Map(table) => {
                if let Some((_, value)) = table.iter().find(|(key, _)| key == text) {
                    return Ok(value.clone());
                }
                parse_int(text)
                    .and_then(|number| {
                        table
                            .iter()
                            .find(|(key, _)| parse_int(key.trim()) == Some(number))
                    })
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| InstrumentError::UnknownKey(text.to_string()))
            }
            DataType::Function(f) => f(text),
            DataType::List(types) => {
                let parts: Vec<&str> = text.split(',').collect();
                if parts.len() != types.len() {
                    return Err(InstrumentError::LengthMismatch {
                        expected: types.len(),
                        actual: parts.len(),
                        context: format!("reply '{text}'"),
                    });
                }
                parts
                    .iter()
                    .zip(types)
                    .map(|(part, ty)| self.parse(part.as_bytes(), ty))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[fixture]
    fn codec() -> Codec {
        Codec::default()
    }

    #[rstest]
    #[case(3.3, 6, "3.300000E+00")]
    #[case(-0.00125, 3, "-1.250E-03")]
    #[case(1.0e120, 2, "1.00E+120")]
    #[case(0.0, 1, "0.0E+00")]
    fn test_format_scientific(#[case] value: f64, #[case] precision: usize, #[case] exp: &str) {
        assert_eq!(format_scientific(value, precision), exp);
    }

    #[rstest]
    #[case(Value::Int(5), None, "CMD 5")]
    #[case(Value::Bool(true), None, "CMD 1")]
    #[case(Value::Str("ON".into()), Some(ArgType::String), "CMD ON")]
    #[case(Value::Int(2), Some(ArgType::Float), "CMD 2.000000E+00")]
    #[case(Value::List(vec![1.into(), 2.5.into()]), None, "CMD 1,2.500000E+00")]
    #[case(
        Value::List(vec![1.into(), true.into()]),
        Some(ArgType::List(vec![ArgType::Int, ArgType::Bool])),
        "CMD 1,1"
    )]
    #[case(Value::Float(0.5), Some(ArgType::Template("{:.2f}".into())), "CMD 0.50")]
    fn test_compose(
        codec: Codec,
        #[case] value: Value,
        #[case] arg_type: Option<ArgType>,
        #[case] expected: &str,
    ) {
        let cmd = codec
            .compose("CMD", Some(&value), arg_type.as_ref(), None, None)
            .unwrap();
        assert_eq!(cmd, expected);
    }

    #[rstest]
    fn test_compose_unit_and_selector(codec: Codec) {
        assert_eq!(codec.compose("*RST", None, None, None, None).unwrap(), "*RST");
        let cmd = codec
            .compose("OUTP", Some(&true.into()), None, None, Some(("OFF", "ON")))
            .unwrap();
        assert_eq!(cmd, "OUTP ON");
        let cmd = codec
            .compose("FREQ", Some(&10.into()), Some(&ArgType::Int), Some("Hz"), None)
            .unwrap();
        assert_eq!(cmd, "FREQ 10 Hz");
    }

    #[rstest]
    fn test_compose_errors(codec: Codec) {
        assert!(matches!(
            codec.convert_arg(&Value::Unset, None, None),
            Err(InstrumentError::UnrecognizedType(_))
        ));
        assert!(matches!(
            codec.convert_arg(
                &Value::List(vec![1.into()]),
                Some(&ArgType::List(vec![ArgType::Int, ArgType::Int])),
                None
            ),
            Err(InstrumentError::LengthMismatch { .. })
        ));
        assert!(matches!(
            "complex".parse::<ArgType>(),
            Err(InstrumentError::UnrecognizedType(_))
        ));
    }

    #[rstest]
    #[case(b"3.300000E+00\n".as_slice(), DataType::Float, Value::Float(3.3))]
    #[case(b" +4.9E+00 ".as_slice(), DataType::Int, Value::Int(4))]
    #[case(b"  hello \r\n".as_slice(), DataType::String, Value::Str("hello".into()))]
    #[case(b"ON".as_slice(), DataType::Bool, Value::Bool(true))]
    #[case(b"OUTPUT OFF".as_slice(), DataType::Bool, Value::Bool(false))]
    #[case(b"0".as_slice(), DataType::Bool, Value::Bool(false))]
    #[case(b"1.5 V".as_slice(), DataType::ValueWithUnit, Value::List(vec![1.5.into(), "V".into()]))]
    #[case(b"1.5".as_slice(), DataType::ValueWithUnit, Value::List(vec![1.5.into(), Value::Unset]))]
    #[case(
        b"1,2.5,ab".as_slice(),
        DataType::List(vec![DataType::Int, DataType::Float, DataType::String]),
        Value::List(vec![1.into(), 2.5.into(), "ab".into()])
    )]
    fn test_parse(
        codec: Codec,
        #[case] reply: &[u8],
        #[case] data_type: DataType,
        #[case] expected: Value,
    ) {
        assert_eq!(codec.parse(reply, &data_type).unwrap(), expected);
    }

    #[rstest]
    fn test_parse_map(codec: Codec) {
        let map = DataType::Map(vec![
            ("0".to_string(), "off".into()),
            ("1".to_string(), "on".into()),
            ("EXT".to_string(), "external".into()),
        ]);
        assert_eq!(codec.parse(b"EXT", &map).unwrap(), "external".into());
        assert_eq!(codec.parse(b"+1", &map).unwrap(), "on".into());
        assert!(matches!(
            codec.parse(b"INT", &map),
            Err(InstrumentError::UnknownKey(_))
        ));
    }

    #[rstest]
    fn test_parse_errors(codec: Codec) {
        assert!(matches!(
            codec.parse(b"1 2 3", &DataType::ValueWithUnit),
            Err(InstrumentError::MalformedReply(_))
        ));
        assert!(matches!(
            codec.parse(b"", &DataType::Bool),
            Err(InstrumentError::MalformedReply(_))
        ));
        assert!(matches!(
            codec.parse(b"1,2", &DataType::List(vec![DataType::Int])),
            Err(InstrumentError::LengthMismatch { .. })
        ));
    }

    #[rstest]
    #[case(Value::Float(-12.5), ArgType::Float, DataType::Float)]
    #[case(Value::Int(-42), ArgType::Int, DataType::Int)]
    #[case(Value::Bool(true), ArgType::Bool, DataType::Bool)]
    #[case(Value::Str("CH1".into()), ArgType::String, DataType::String)]
    fn test_round_trip(
        codec: Codec,
        #[case] value: Value,
        #[case] arg_type: ArgType,
        #[case] data_type: DataType,
    ) {
        let text = codec
            .compose("", Some(&value), Some(&arg_type), None, None)
            .unwrap();
        assert_eq!(codec.parse(text.as_bytes(), &data_type).unwrap(), value);
    }

    #[rstest]
    fn test_parse_function(codec: Codec) {
        let data_type = DataType::function(|s| Ok(Value::Int(s.len() as i64)));
        assert_eq!(codec.parse(b" abcd\n", &data_type).unwrap(), Value::Int(4));
    }
}
