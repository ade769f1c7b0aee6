//! Wire values and their line codec.
//!
//! Every protocol spoken by the master (RPC, sync_struct, worker pipes) carries
//! one [`Value`] per line. The text form is a strict superset of JSON:
//!
//! ```text
//! null  true  false  42  -1.5  nan  inf  -inf  "text"
//! (1, 2)  (1,)  ()  [1, 2]  {"key": 1, 3: [4]}
//! nparray("float64", (2, 2), "AAAAAAAA8D8AAAAAAAAAQAAAAAAAAAhAAAAAAAAAEEA=")
//! ```
//!
//! Decoding is a plain recursive-descent parse of that grammar. Nothing in the
//! input is ever evaluated, so a hostile peer can at worst produce a
//! [`CodecError`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Maximum container nesting accepted by [`decode`].
pub const MAX_DEPTH: usize = 256;

/// Errors produced while decoding a line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),

    #[error("unexpected character {found:?} at offset {offset}")]
    Unexpected { found: char, offset: usize },

    #[error("trailing input at offset {0}")]
    TrailingInput(usize),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("invalid string literal at offset {0}")]
    InvalidString(usize),

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),

    #[error("invalid array: {0}")]
    InvalidArray(String),
}

// =============================================================================
// Arrays
// =============================================================================

/// Element type of an [`NdArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl DType {
    const ALL: [DType; 11] = [
        DType::Bool,
        DType::I8,
        DType::I16,
        DType::I32,
        DType::I64,
        DType::U8,
        DType::U16,
        DType::U32,
        DType::U64,
        DType::F32,
        DType::F64,
    ];

    /// Name used on the wire.
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::U32 => "uint32",
            DType::U64 => "uint64",
            DType::F32 => "float32",
            DType::F64 => "float64",
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 => 8,
        }
    }

    /// Look up a dtype by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.name() == name)
    }
}

/// An n-dimensional array carried as raw little-endian element bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl NdArray {
    /// Build an array, checking that `data` holds exactly `shape` elements.
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self, CodecError> {
        let elements = shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| CodecError::InvalidArray("shape overflows".into()))?;
        let expected = elements
            .checked_mul(dtype.size())
            .ok_or_else(|| CodecError::InvalidArray("shape overflows".into()))?;
        if data.len() != expected {
            return Err(CodecError::InvalidArray(format!(
                "{} bytes of {} for shape {:?}, expected {}",
                data.len(),
                dtype.name(),
                shape,
                expected
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Build a `float64` array from values in row-major order.
    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Result<Self, CodecError> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::F64, shape, data)
    }

    /// Build an `int64` array from values in row-major order.
    pub fn from_i64(shape: Vec<usize>, values: &[i64]) -> Result<Self, CodecError> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::I64, shape, data)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Elements widened to `f64`, in row-major order.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        fn le<const N: usize>(bytes: &[u8]) -> [u8; N] {
            <[u8; N]>::try_from(bytes).unwrap_or([0; N])
        }
        self.data
            .chunks_exact(self.dtype.size())
            .map(|b| match self.dtype {
                DType::Bool => f64::from(u8::from(b[0] != 0)),
                DType::I8 => f64::from(i8::from_le_bytes(le(b))),
                DType::I16 => f64::from(i16::from_le_bytes(le(b))),
                DType::I32 => f64::from(i32::from_le_bytes(le(b))),
                DType::I64 => i64::from_le_bytes(le(b)) as f64,
                DType::U8 => f64::from(b[0]),
                DType::U16 => f64::from(u16::from_le_bytes(le(b))),
                DType::U32 => f64::from(u32::from_le_bytes(le(b))),
                DType::U64 => u64::from_le_bytes(le(b)) as f64,
                DType::F32 => f64::from(f32::from_le_bytes(le(b))),
                DType::F64 => f64::from_le_bytes(le(b)),
            })
            .collect()
    }
}

// =============================================================================
// Value
// =============================================================================

/// The closed set of values that travel over the wire.
///
/// `Value` is totally ordered (floats compare with [`f64::total_cmp`]) so it can
/// key a [`BTreeMap`]; equality is structural and consistent with that order.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Map(BTreeMap<Value, Value>),
    NdArray(NdArray),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Str(_) => 4,
            Value::Tuple(_) => 5,
            Value::List(_) => 6,
            Value::Map(_) => 7,
            Value::NdArray(_) => 8,
        }
    }

    /// Short name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::NdArray(_) => "nparray",
        }
    }

    /// Container nesting, counted the way [`decode`] counts it: scalars and
    /// arrays are 0, `[1]` is 1, `[[1]]` is 2.
    ///
    /// [`encode`] writes values of any depth, but only values with
    /// `depth() <= MAX_DEPTH` decode again.
    pub fn depth(&self) -> usize {
        match self {
            Value::Tuple(items) | Value::List(items) => {
                1 + items.iter().map(Value::depth).max().unwrap_or(0)
            }
            Value::Map(map) => {
                1 + map
                    .iter()
                    .map(|(k, v)| k.depth().max(v.depth()))
                    .max()
                    .unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Build a map from key/value pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<Value>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build a tuple.
    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(items)
    }

    /// An empty map.
    pub fn empty_map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value as a float; integers are widened.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a list or tuple.
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<Value, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a string key in a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()
            .and_then(|map| map.get(&Value::Str(key.to_string())))
    }

    /// Seconds as a float, or `null` when absent.
    pub fn from_duration(duration: Option<Duration>) -> Self {
        match duration {
            Some(d) => Value::Float(d.as_secs_f64()),
            None => Value::Null,
        }
    }

    /// Interpret a non-negative number of seconds as a duration.
    pub fn as_duration(&self) -> Option<Duration> {
        self.as_float()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Tuple(a), Value::Tuple(b)) | (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.iter().cmp(b.iter()),
            (Value::NdArray(a), Value::NdArray(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<NdArray> for Value {
    fn from(v: NdArray) -> Self {
        Value::NdArray(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (Value::Str(k), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

// =============================================================================
// Encoder
// =============================================================================

/// Encode a value as a single newline-free line.
///
/// Values nested deeper than [`MAX_DEPTH`] are encoded but rejected by
/// [`decode`]; see [`Value::depth`].
pub fn encode(value: &Value) -> String {
    let mut out = String::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => encode_float(*f, out),
        Value::Str(s) => encode_str(s, out),
        Value::Tuple(items) => {
            out.push('(');
            encode_items(items, out);
            if items.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        Value::List(items) => {
            out.push('[');
            encode_items(items, out);
            out.push(']');
        }
        Value::Map(map) => {
            out.push('{');
            for (n, (k, v)) in map.iter().enumerate() {
                if n > 0 {
                    out.push_str(", ");
                }
                encode_into(k, out);
                out.push_str(": ");
                encode_into(v, out);
            }
            out.push('}');
        }
        Value::NdArray(array) => {
            out.push_str("nparray(");
            encode_str(array.dtype.name(), out);
            out.push_str(", ");
            let shape: Vec<Value> = array.shape.iter().map(|&d| Value::from(d)).collect();
            encode_into(&Value::Tuple(shape), out);
            out.push_str(", ");
            encode_str(&STANDARD.encode(&array.data), out);
            out.push(')');
        }
    }
}

fn encode_items(items: &[Value], out: &mut String) {
    for (n, item) in items.iter().enumerate() {
        if n > 0 {
            out.push_str(", ");
        }
        encode_into(item, out);
    }
}

fn encode_float(f: f64, out: &mut String) {
    if f.is_nan() {
        out.push_str("nan");
    } else if f.is_infinite() {
        out.push_str(if f > 0.0 { "inf" } else { "-inf" });
    } else {
        // Debug gives the shortest repr that parses back to the same bits.
        let repr = format!("{:?}", f);
        out.push_str(&repr);
        if !repr.contains(['.', 'e', 'E']) {
            out.push_str(".0");
        }
    }
}

fn encode_str(s: &str, out: &mut String) {
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        // Serializing a str cannot fail.
        Err(_) => out.push_str("\"\""),
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// Decode one line produced by [`encode`] (or any plain JSON document).
pub fn decode(input: &str) -> Result<Value, CodecError> {
    let mut parser = Parser {
        src: input.as_bytes(),
        text: input,
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos != parser.src.len() {
        return Err(CodecError::TrailingInput(parser.pos));
    }
    Ok(value)
}

struct Parser<'a> {
    src: &'a [u8],
    text: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn skip_ws(&mut self) {
        while let Some(b) = self.src.get(self.pos) {
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> Result<u8, CodecError> {
        self.skip_ws();
        self.src
            .get(self.pos)
            .copied()
            .ok_or(CodecError::UnexpectedEnd(self.pos))
    }

    fn unexpected(&self) -> CodecError {
        match self.text.get(self.pos..).and_then(|rest| rest.chars().next()) {
            Some(found) => CodecError::Unexpected {
                found,
                offset: self.pos,
            },
            None => CodecError::UnexpectedEnd(self.pos),
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), CodecError> {
        if self.peek()? == byte {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn enter(&mut self) -> Result<(), CodecError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CodecError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn value(&mut self) -> Result<Value, CodecError> {
        match self.peek()? {
            b'"' => self.string().map(Value::Str),
            b'(' => {
                self.enter()?;
                self.pos += 1;
                let (items, trailing_comma) = self.items(b')')?;
                if items.len() == 1 && !trailing_comma {
                    // `(x)` is a parenthesised expression, not a tuple.
                    return Err(CodecError::Unexpected {
                        found: ')',
                        offset: self.pos - 1,
                    });
                }
                self.depth -= 1;
                Ok(Value::Tuple(items))
            }
            b'[' => {
                self.enter()?;
                self.pos += 1;
                let (items, _) = self.items(b']')?;
                self.depth -= 1;
                Ok(Value::List(items))
            }
            b'{' => {
                self.enter()?;
                self.pos += 1;
                let map = self.map_body()?;
                self.depth -= 1;
                Ok(Value::Map(map))
            }
            b'-' if self.src.get(self.pos + 1) == Some(&b'i') => {
                self.pos += 1;
                match self.identifier().as_str() {
                    "inf" => Ok(Value::Float(f64::NEG_INFINITY)),
                    other => Err(CodecError::UnknownIdentifier(format!("-{}", other))),
                }
            }
            b'-' | b'+' | b'0'..=b'9' => self.number(),
            b if b.is_ascii_alphabetic() => {
                let ident = self.identifier();
                match ident.as_str() {
                    "null" => Ok(Value::Null),
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    "nan" => Ok(Value::Float(f64::NAN)),
                    "inf" => Ok(Value::Float(f64::INFINITY)),
                    "nparray" => self.ndarray(),
                    _ => Err(CodecError::UnknownIdentifier(ident)),
                }
            }
            _ => Err(self.unexpected()),
        }
    }

    fn identifier(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.src.get(self.pos) {
            if b.is_ascii_alphanumeric() || *b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.text[start..self.pos].to_string()
    }

    fn number(&mut self) -> Result<Value, CodecError> {
        let start = self.pos;
        while let Some(b) = self.src.get(self.pos) {
            if b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let literal = &self.text[start..self.pos];
        let invalid = || CodecError::InvalidNumber(literal.to_string());
        if literal.contains(['.', 'e', 'E']) {
            literal.parse::<f64>().map(Value::Float).map_err(|_| invalid())
        } else {
            literal.parse::<i64>().map(Value::Int).map_err(|_| invalid())
        }
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let start = self.pos;
        self.pos += 1;
        loop {
            match self.src.get(self.pos) {
                None => return Err(CodecError::UnexpectedEnd(self.pos)),
                Some(b'\\') => self.pos += 2,
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => self.pos += 1,
            }
        }
        let literal = self
            .text
            .get(start..self.pos)
            .ok_or(CodecError::InvalidString(start))?;
        serde_json::from_str::<String>(literal).map_err(|_| CodecError::InvalidString(start))
    }

    /// Comma-separated values up to `close`; reports whether a trailing comma was seen.
    fn items(&mut self, close: u8) -> Result<(Vec<Value>, bool), CodecError> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        loop {
            if self.peek()? == close {
                self.pos += 1;
                return Ok((items, trailing_comma));
            }
            items.push(self.value()?);
            trailing_comma = false;
            match self.peek()? {
                b',' => {
                    self.pos += 1;
                    trailing_comma = true;
                }
                b if b == close => {}
                _ => return Err(self.unexpected()),
            }
        }
    }

    fn map_body(&mut self) -> Result<BTreeMap<Value, Value>, CodecError> {
        let mut map = BTreeMap::new();
        loop {
            if self.peek()? == b'}' {
                self.pos += 1;
                return Ok(map);
            }
            let key = self.value()?;
            self.expect(b':')?;
            let value = self.value()?;
            map.insert(key, value);
            match self.peek()? {
                b',' => self.pos += 1,
                b'}' => {}
                _ => return Err(self.unexpected()),
            }
        }
    }

    fn ndarray(&mut self) -> Result<Value, CodecError> {
        self.expect(b'(')?;
        if self.peek()? != b'"' {
            return Err(self.unexpected());
        }
        let dtype_name = self.string()?;
        let dtype = DType::from_name(&dtype_name)
            .ok_or_else(|| CodecError::InvalidArray(format!("unknown dtype '{}'", dtype_name)))?;
        self.expect(b',')?;
        let shape = match self.value()? {
            Value::Tuple(dims) => dims
                .iter()
                .map(|d| {
                    d.as_int()
                        .and_then(|d| usize::try_from(d).ok())
                        .ok_or_else(|| CodecError::InvalidArray("bad dimension".into()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(CodecError::InvalidArray("shape must be a tuple".into())),
        };
        self.expect(b',')?;
        if self.peek()? != b'"' {
            return Err(self.unexpected());
        }
        let payload = self.string()?;
        let data = STANDARD
            .decode(payload.as_bytes())
            .map_err(|e| CodecError::InvalidArray(e.to_string()))?;
        self.expect(b')')?;
        NdArray::new(dtype, shape, data).map(Value::NdArray)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let line = encode(&value);
        assert!(!line.contains('\n'), "encoded form spans lines: {line}");
        assert_eq!(decode(&line).unwrap(), value, "line was {line}");
    }

    #[test]
    fn test_scalars_roundtrip() {
        roundtrip(Value::Null);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Int(-42));
        roundtrip(Value::Int(i64::MAX));
        roundtrip(Value::Float(0.1));
        roundtrip(Value::Float(3.0));
        roundtrip(Value::Float(1e300));
        roundtrip(Value::Float(-2.5e-12));
        roundtrip(Value::Float(f64::NAN));
        roundtrip(Value::Float(f64::NEG_INFINITY));
        roundtrip(Value::from("line\nbreak \"quoted\" µs \u{1F600}"));
    }

    #[test]
    fn test_float_keeps_its_type() {
        assert_eq!(encode(&Value::Float(3.0)), "3.0");
        assert_eq!(decode("3.0").unwrap(), Value::Float(3.0));
        assert_eq!(decode("3").unwrap(), Value::Int(3));
    }

    #[test]
    fn test_nested_containers_roundtrip() {
        let value = Value::map([
            (Value::from("queue"), Value::List(vec![
                Value::tuple(vec![Value::Int(0), Value::map([("file", "a.rhai")]), Value::Null]),
                Value::tuple(vec![Value::Int(1)]),
            ])),
            (Value::Int(7), Value::Tuple(vec![])),
            (Value::Tuple(vec![Value::Int(1), Value::Bool(false)]), Value::empty_map()),
        ]);
        roundtrip(value);
    }

    #[test]
    fn test_array_roundtrip_is_byte_exact() {
        let array = NdArray::from_f64(vec![2, 2], &[1.0, 2.0, f64::NAN, -0.0]).unwrap();
        let line = encode(&Value::from(array.clone()));
        assert!(line.starts_with("nparray(\"float64\", (2, 2), "));
        match decode(&line).unwrap() {
            Value::NdArray(decoded) => {
                assert_eq!(decoded.shape(), &[2, 2]);
                assert_eq!(decoded.data(), array.data());
            }
            other => panic!("expected array, got {other:?}"),
        }

        let vector = NdArray::from_i64(vec![3], &[1, -2, 3]).unwrap();
        roundtrip(Value::from(vector));
        let empty = NdArray::new(DType::U8, vec![0, 4], Vec::new()).unwrap();
        roundtrip(Value::from(empty));
    }

    #[test]
    fn test_array_length_is_checked() {
        assert!(NdArray::new(DType::F32, vec![3], vec![0; 8]).is_err());
        let line = format!("nparray(\"int16\", (2,), \"{}\")", STANDARD.encode([0u8; 3]));
        assert!(matches!(decode(&line), Err(CodecError::InvalidArray(_))));
    }

    #[test]
    fn test_plain_json_is_accepted() {
        let value = decode(r#"{"action": "call", "name": "ping", "args": [1, 2.5], "kwargs": {}}"#)
            .unwrap();
        assert_eq!(value.get("name"), Some(&Value::from("ping")));
        assert_eq!(value.get("args").unwrap().as_seq().unwrap().len(), 2);
    }

    #[test]
    fn test_rejects_non_literals() {
        assert!(matches!(
            decode("system(\"true\")"),
            Err(CodecError::UnknownIdentifier(_))
        ));
        assert!(decode("__import__(\"os\")").is_err());
        assert!(decode("[1, 2").is_err());
        assert!(matches!(decode("1 2"), Err(CodecError::TrailingInput(_))));
        assert!(decode("(1)").is_err());
        assert!(decode("\"bad \\q escape\"").is_err());
        assert!(decode("").is_err());
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}{}", "[".repeat(MAX_DEPTH + 1), "]".repeat(MAX_DEPTH + 1));
        assert_eq!(decode(&deep), Err(CodecError::TooDeep(MAX_DEPTH)));
        let ok = format!("{}{}", "[".repeat(MAX_DEPTH), "]".repeat(MAX_DEPTH));
        assert_eq!(decode(&ok).unwrap().depth(), MAX_DEPTH);
    }

    #[test]
    fn test_depth_matches_decoder() {
        let mut nested = Value::Int(1);
        for _ in 0..MAX_DEPTH + 1 {
            nested = Value::List(vec![nested]);
        }
        assert_eq!(nested.depth(), MAX_DEPTH + 1);
        assert_eq!(decode(&encode(&nested)), Err(CodecError::TooDeep(MAX_DEPTH)));

        let keyed = Value::map([(Value::tuple(vec![Value::empty_map()]), Value::Null)]);
        assert_eq!(keyed.depth(), 3);
        assert_eq!(Value::from("x").depth(), 0);
    }

    #[test]
    fn test_singleton_tuple_and_trailing_commas() {
        assert_eq!(encode(&Value::tuple(vec![Value::Int(1)])), "(1,)");
        assert_eq!(decode("[1, 2,]").unwrap(), Value::List(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(decode("()").unwrap(), Value::Tuple(vec![]));
    }

    #[test]
    fn test_duration_helpers() {
        let v = Value::from_duration(Some(Duration::from_millis(1500)));
        assert_eq!(v.as_duration(), Some(Duration::from_millis(1500)));
        assert_eq!(Value::from_duration(None), Value::Null);
        assert_eq!(Value::Int(-1).as_duration(), None);
    }

    #[test]
    fn test_from_json() {
        let v = Value::from(serde_json::json!({"x": [1, 2.5, null], "y": "s"}));
        assert_eq!(encode(&v), r#"{"x": [1, 2.5, null], "y": "s"}"#);
    }
}
