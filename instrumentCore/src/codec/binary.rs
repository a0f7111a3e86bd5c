//! IEEE-488.2 definite length binary blocks.
//!
//! A block is transmitted as `#`, one ASCII digit `n`, `n` ASCII digits that give the payload
//! length `L`, and `L` payload bytes. Some instruments append a stray terminator.

use std::str::FromStr;

use log::trace;

use crate::{InstrumentError, InstrumentInterface};

/// Payloads are read in chunks of this size. Memory grows with the bytes received, not with the
/// declared length.
const READ_CHUNK: usize = 64 * 1024;

/// Element kind of a [`NumericFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericKind {
    /// Two's complement integers.
    Signed,
    /// Unsigned integers.
    Unsigned,
    /// IEEE-754 floats.
    Float,
    /// Comma or whitespace separated decimal text.
    Ascii,
}

/// Byte order of a [`NumericFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

/// Describes how the payload of a binary block is decoded.
///
/// The textual form follows the usual array-protocol notation: an optional byte order (`<`
/// little, `>` big, `=` or none for little), the kind (`i`, `u`, `f`), and the element size in
/// bytes, e.g. `"<u2"` or `">f4"`. `"ascii"` selects text payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericFormat {
    kind: NumericKind,
    size: usize,
    order: ByteOrder,
}

impl NumericFormat {
    /// The text format.
    pub const ASCII: NumericFormat = NumericFormat {
        kind: NumericKind::Ascii,
        size: 1,
        order: ByteOrder::Little,
    };

    /// Create a new format, validating the element size.
    pub fn new(kind: NumericKind, size: usize, order: ByteOrder) -> Result<Self, InstrumentError> {
        let valid = match kind {
            NumericKind::Ascii => true,
            NumericKind::Float => matches!(size, 4 | 8),
            NumericKind::Signed | NumericKind::Unsigned => matches!(size, 1 | 2 | 4 | 8),
        };
        if !valid {
            return Err(InstrumentError::UnrecognizedType(format!(
                "{kind:?} elements of {size} bytes"
            )));
        }
        Ok(NumericFormat { kind, size, order })
    }

    /// Element kind.
    pub fn kind(&self) -> NumericKind {
        self.kind
    }

    /// Element size in bytes, one of 1, 2, 4, 8.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Byte order.
    pub fn order(&self) -> ByteOrder {
        self.order
    }
}

impl FromStr for NumericFormat {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("ascii") {
            return Ok(NumericFormat::ASCII);
        }
        let unrecognized = || InstrumentError::UnrecognizedType(format!("numeric format '{s}'"));
        let (order, rest) = match s.chars().next() {
            Some('<') | Some('=') => (ByteOrder::Little, &s[1..]),
            Some('>') => (ByteOrder::Big, &s[1..]),
            _ => (ByteOrder::Little, s),
        };
        let mut chars = rest.chars();
        let kind = match chars.next() {
            Some('i') => NumericKind::Signed,
            Some('u') => NumericKind::Unsigned,
            Some('f') => NumericKind::Float,
            _ => return Err(unrecognized()),
        };
        let size = chars.as_str().parse::<usize>().map_err(|_| unrecognized())?;
        NumericFormat::new(kind, size, order)
    }
}

/// A decoded numeric array.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum NumericArray {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl NumericArray {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            NumericArray::I8(v) => v.len(),
            NumericArray::I16(v) => v.len(),
            NumericArray::I32(v) => v.len(),
            NumericArray::I64(v) => v.len(),
            NumericArray::U8(v) => v.len(),
            NumericArray::U16(v) => v.len(),
            NumericArray::U32(v) => v.len(),
            NumericArray::U64(v) => v.len(),
            NumericArray::F32(v) => v.len(),
            NumericArray::F64(v) => v.len(),
        }
    }

    /// Returns `true` if the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert all elements to `f64`. Large 64 bit integers lose precision.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            NumericArray::I8(v) => v.iter().map(|&x| f64::from(x)).collect(),
            NumericArray::I16(v) => v.iter().map(|&x| f64::from(x)).collect(),
            NumericArray::I32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            NumericArray::I64(v) => v.iter().map(|&x| x as f64).collect(),
            NumericArray::U8(v) => v.iter().map(|&x| f64::from(x)).collect(),
            NumericArray::U16(v) => v.iter().map(|&x| f64::from(x)).collect(),
            NumericArray::U32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            NumericArray::U64(v) => v.iter().map(|&x| x as f64).collect(),
            NumericArray::F32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            NumericArray::F64(v) => v.clone(),
        }
    }
}

fn parse_digits(digits: &[u8], what: &str) -> Result<usize, InstrumentError> {
    std::str::from_utf8(digits)
        .ok()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| {
            InstrumentError::MalformedFrame(format!(
                "invalid {what}: {}",
                String::from_utf8_lossy(digits)
            ))
        })
}

/// Parse the `#<n><length>` header at the start of `data`.
///
/// Returns the header length and the declared payload length.
fn parse_header(data: &[u8]) -> Result<(usize, usize), InstrumentError> {
    if data.first() != Some(&b'#') {
        return Err(InstrumentError::MalformedFrame(format!(
            "missing '#' marker at start of {}",
            context(data)
        )));
    }
    let count = data
        .get(1..2)
        .ok_or_else(|| InstrumentError::MalformedFrame("header too short".to_string()))?;
    let count = parse_digits(count, "length digit count")?;
    if count == 0 {
        return Err(InstrumentError::MalformedFrame(
            "indefinite length blocks are not supported".to_string(),
        ));
    }
    let digits = data
        .get(2..2 + count)
        .ok_or_else(|| InstrumentError::MalformedFrame("header too short".to_string()))?;
    let declared = parse_digits(digits, "payload length")?;
    Ok((2 + count, declared))
}

fn context(data: &[u8]) -> String {
    let shown = &data[..data.len().min(20)];
    format!("{:?}", String::from_utf8_lossy(shown))
}

/// Read a binary block from an interface that is already held.
///
/// # Arguments
/// * `intf` - The interface to read from.
/// * `include_header` - Return the `#<n><length>` header together with the payload.
/// * `flush_trailing_line` - Read and discard one more line after the payload.
pub fn read_binary_array<T: InstrumentInterface + ?Sized>(
    intf: &mut T,
    include_header: bool,
    flush_trailing_line: bool,
) -> Result<Vec<u8>, InstrumentError> {
    let mut prefix = [0u8; 2];
    intf.read_exact(&mut prefix)?;
    if prefix[0] != b'#' {
        return Err(InstrumentError::MalformedFrame(format!(
            "expected '#', got {:?}",
            String::from_utf8_lossy(&prefix)
        )));
    }
    let count = parse_digits(&prefix[1..], "length digit count")?;
    if count == 0 {
        return Err(InstrumentError::MalformedFrame(
            "indefinite length blocks are not supported".to_string(),
        ));
    }
    let mut digits = vec![0u8; count];
    intf.read_exact(&mut digits)?;
    let declared = parse_digits(&digits, "payload length")?;
    trace!("Reading binary block of {declared} bytes");

    let mut payload = Vec::with_capacity(declared.min(READ_CHUNK));
    while payload.len() < declared {
        let start = payload.len();
        let chunk = (declared - start).min(READ_CHUNK);
        payload.resize(start + chunk, 0);
        intf.read_exact(&mut payload[start..])?;
    }
    if flush_trailing_line {
        intf.read_line(false)?;
    }

    if include_header {
        let mut frame = Vec::with_capacity(2 + count + declared);
        frame.extend_from_slice(&prefix);
        frame.extend_from_slice(&digits);
        frame.extend_from_slice(&payload);
        Ok(frame)
    } else {
        Ok(payload)
    }
}

/// Extract the payload of a binary block, validating the header if present.
fn extract_payload<'a>(
    data: &'a [u8],
    format: &NumericFormat,
    include_header: bool,
) -> Result<&'a [u8], InstrumentError> {
    if !include_header {
        return Ok(data);
    }
    if format.kind == NumericKind::Ascii && data.first() != Some(&b'#') {
        return Ok(data);
    }
    let (header_len, declared) = parse_header(data)?;
    let payload = &data[header_len..];
    if payload.len() == declared {
        return Ok(payload);
    }
    let excess_is_newlines = payload.len() > declared
        && payload[declared..]
            .iter()
            .all(|b| *b == b'\n' || *b == b'\r');
    if excess_is_newlines {
        Ok(&payload[..declared])
    } else {
        Err(InstrumentError::LengthMismatch {
            expected: declared,
            actual: payload.len(),
            context: format!("binary block {}", context(data)),
        })
    }
}

/// Split `payload` into `N` byte chunks and convert them.
fn unpack<const N: usize, V>(
    payload: &[u8],
    order: ByteOrder,
    from_le: fn([u8; N]) -> V,
    from_be: fn([u8; N]) -> V,
) -> Vec<V> {
    payload
        .chunks_exact(N)
        .map(|chunk| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(chunk);
            match order {
                ByteOrder::Little => from_le(bytes),
                ByteOrder::Big => from_be(bytes),
            }
        })
        .collect()
}

fn decode_ascii(payload: &[u8]) -> Result<NumericArray, InstrumentError> {
    let text = String::from_utf8_lossy(payload);
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .map_err(|_| InstrumentError::MalformedReply(s.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(NumericArray::F64)
}

/// Decode a binary block into a numeric array.
///
/// With `include_header`, `data` must start with a `#<n><length>` header, unless the format is
/// [`NumericFormat::ASCII`] and the data has no header. If the payload is longer than declared,
/// the excess is accepted if it only consists of line terminators.
pub fn decode_array(
    data: &[u8],
    format: &NumericFormat,
    include_header: bool,
) -> Result<NumericArray, InstrumentError> {
    let payload = extract_payload(data, format, include_header)?;
    if format.kind == NumericKind::Ascii {
        return decode_ascii(payload);
    }
    if payload.len() % format.size != 0 {
        return Err(InstrumentError::LengthMismatch {
            expected: payload.len() - payload.len() % format.size,
            actual: payload.len(),
            context: format!("payload is not a multiple of {} bytes", format.size),
        });
    }
    let order = format.order;
    let array = match (format.kind, format.size) {
        (NumericKind::Signed, 1) => NumericArray::I8(payload.iter().map(|&b| b as i8).collect()),
        (NumericKind::Signed, 2) => {
            NumericArray::I16(unpack(payload, order, i16::from_le_bytes, i16::from_be_bytes))
        }
        (NumericKind::Signed, 4) => {
            NumericArray::I32(unpack(payload, order, i32::from_le_bytes, i32::from_be_bytes))
        }
        (NumericKind::Signed, 8) => {
            NumericArray::I64(unpack(payload, order, i64::from_le_bytes, i64::from_be_bytes))
        }
        (NumericKind::Unsigned, 1) => NumericArray::U8(payload.to_vec()),
        (NumericKind::Unsigned, 2) => {
            NumericArray::U16(unpack(payload, order, u16::from_le_bytes, u16::from_be_bytes))
        }
        (NumericKind::Unsigned, 4) => {
            NumericArray::U32(unpack(payload, order, u32::from_le_bytes, u32::from_be_bytes))
        }
        (NumericKind::Unsigned, 8) => {
            NumericArray::U64(unpack(payload, order, u64::from_le_bytes, u64::from_be_bytes))
        }
        (NumericKind::Float, 4) => {
            NumericArray::F32(unpack(payload, order, f32::from_le_bytes, f32::from_be_bytes))
        }
        (NumericKind::Float, 8) => {
            NumericArray::F64(unpack(payload, order, f64::from_le_bytes, f64::from_be_bytes))
        }
        (kind, size) => {
            return Err(InstrumentError::UnrecognizedType(format!(
                "{kind:?} elements of {size} bytes"
            )));
        }
    };
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LoopbackInterfaceBytes;
    use rstest::*;

    #[rstest]
    #[case("<u2", NumericKind::Unsigned, 2, ByteOrder::Little)]
    #[case(">f4", NumericKind::Float, 4, ByteOrder::Big)]
    #[case("i1", NumericKind::Signed, 1, ByteOrder::Little)]
    #[case("=f8", NumericKind::Float, 8, ByteOrder::Little)]
    fn test_parse_format(
        #[case] text: &str,
        #[case] kind: NumericKind,
        #[case] size: usize,
        #[case] order: ByteOrder,
    ) {
        let format: NumericFormat = text.parse().unwrap();
        assert_eq!(format, NumericFormat { kind, size, order });
    }

    #[rstest]
    #[case("<u3")]
    #[case("u0")]
    #[case(">i0")]
    #[case("f2")]
    #[case("<q4")]
    #[case("")]
    fn test_parse_format_invalid(#[case] text: &str) {
        assert!(matches!(
            text.parse::<NumericFormat>(),
            Err(InstrumentError::UnrecognizedType(_))
        ));
    }

    #[rstest]
    fn test_zero_size_rejected() {
        assert!(NumericFormat::new(NumericKind::Unsigned, 0, ByteOrder::Little).is_err());
        let format: NumericFormat = ">u4".parse().unwrap();
        assert_eq!(
            (format.kind(), format.size(), format.order()),
            (NumericKind::Unsigned, 4, ByteOrder::Big)
        );
    }

    #[rstest]
    fn test_header() {
        assert_eq!(parse_header(b"#3100abc").unwrap(), (5, 100));
        assert!(parse_header(b"3100").is_err());
        assert!(parse_header(b"#0").is_err());
        assert!(parse_header(b"#5123").is_err());
    }

    #[rstest]
    fn test_big_endian_floats() {
        let mut data = b"#18".to_vec();
        data.extend_from_slice(&1.5f32.to_be_bytes());
        data.extend_from_slice(&(-2.0f32).to_be_bytes());
        let format: NumericFormat = ">f4".parse().unwrap();
        assert_eq!(
            decode_array(&data, &format, true).unwrap(),
            NumericArray::F32(vec![1.5, -2.0])
        );
    }

    #[rstest]
    fn test_ascii_without_header() {
        let array = decode_array(b"1.5, 2,3e1\n", &NumericFormat::ASCII, true).unwrap();
        assert_eq!(array, NumericArray::F64(vec![1.5, 2.0, 30.0]));
    }

    fn u16_block(count: usize) -> Vec<u8> {
        let mut data = format!("#{}{}", (2 * count).to_string().len(), 2 * count).into_bytes();
        for value in 0..count as u16 {
            data.extend_from_slice(&value.to_le_bytes());
        }
        data
    }

    #[rstest]
    fn test_u16_block() {
        let data = u16_block(32);
        assert!(data.starts_with(b"#264"));
        assert_eq!(data.len(), 4 + 64);
        let array = decode_array(&data, &"<u2".parse().unwrap(), true).unwrap();
        assert_eq!(array, NumericArray::U16((0..32).collect()));
    }

    #[rstest]
    #[case(b"\n".as_slice())]
    #[case(b"\r\n".as_slice())]
    #[case(b"\n\n".as_slice())]
    fn test_trailing_newlines_accepted(#[case] trailer: &[u8]) {
        let mut data = u16_block(4);
        data.extend_from_slice(trailer);
        let array = decode_array(&data, &"<u2".parse().unwrap(), true).unwrap();
        assert_eq!(array, NumericArray::U16(vec![0, 1, 2, 3]));
    }

    #[rstest]
    fn test_truncated_block() {
        let mut data = u16_block(32);
        data.pop();
        match decode_array(&data, &"<u2".parse().unwrap(), true) {
            Err(InstrumentError::LengthMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 64);
                assert_eq!(actual, 63);
            }
            other => panic!("Expected a length mismatch, got {other:?}"),
        }
    }

    #[rstest]
    fn test_read_missing_marker() {
        let mut lbk = LoopbackInterfaceBytes::new(vec![], vec![b"X14abcd\n".to_vec()]);
        assert!(matches!(
            read_binary_array(&mut lbk, false, true),
            Err(InstrumentError::MalformedFrame(_))
        ));
    }

    #[rstest]
    fn test_read_large_block_in_chunks() {
        let payload: Vec<u8> = (0..READ_CHUNK + 10).map(|i| i as u8).collect();
        let mut frame = format!("#6{:06}", payload.len()).into_bytes();
        frame.extend_from_slice(&payload);
        frame.push(b'\n');
        let mut lbk = LoopbackInterfaceBytes::new(vec![], vec![frame]);
        assert_eq!(read_binary_array(&mut lbk, false, true).unwrap(), payload);
    }

    #[rstest]
    fn test_trailing_garbage_rejected() {
        let err = decode_array(b"#12abX", &"u1".parse().unwrap(), true).unwrap_err();
        assert!(matches!(
            err,
            InstrumentError::LengthMismatch {
                expected: 2,
                actual: 3,
                ..
            }
        ));
    }
}
