//! Python pickle decoder.
//!
//! Decodes pickle streams (protocols 0 to 5, in-band data only) into a
//! [`Value`] tree. Nothing is executed: `GLOBAL` references become
//! [`Value::Global`], and calls on them become [`Value::Object`] unless they
//! are one of the reconstructors we understand. The ones that matter for
//! fitted body-model records are numpy's:
//!
//! - `numpy.core.multiarray._reconstruct` followed by `BUILD` yields a
//!   [`Value::Array`]
//! - `numpy.dtype` yields a [`Value::Dtype`]
//! - `numpy.core.multiarray.scalar` yields a zero-dimensional array
//! - `numpy.core.numeric._frombuffer`, used by protocol 5, yields a
//!   [`Value::Array`] directly
//! - `_codecs.encode(str, "latin1")`, which is how protocol 2 carries bytes
//!
//! numpy 2 moved `numpy.core` to `numpy._core`; both names are accepted.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use thiserror::Error;

/// Errors that can occur while decoding a pickle.
#[derive(Error, Debug)]
pub enum PickleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: u64 },

    #[error("Unsupported pickle feature: {0}")]
    Unsupported(String),

    #[error("Stack underflow at offset {0}")]
    StackUnderflow(u64),

    #[error("No MARK on the stack at offset {0}")]
    MissingMark(u64),

    #[error("Memo key {0} not found")]
    MissingMemo(u32),

    #[error("Invalid pickle data: {0}")]
    Invalid(String),
}

/// Result type for pickle operations.
pub type Result<T> = std::result::Result<T, PickleError>;

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const INST: u8 = b'i';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const OBJ: u8 = b'o';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';

    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const EXT1: u8 = 0x82;
    pub const EXT2: u8 = 0x83;
    pub const EXT4: u8 = 0x84;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;

    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';

    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;

    pub const BYTEARRAY8: u8 = 0x96;
    pub const NEXT_BUFFER: u8 = 0x97;
    pub const READONLY_BUFFER: u8 = 0x98;
}

/// Byte order of a numpy dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Element category of a numpy dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Float,
    Int,
    UInt,
    Bool,
}

/// The subset of numpy dtypes that can be turned into numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtype {
    pub kind: ScalarKind,
    /// Element size in bytes.
    pub size: usize,
    pub endian: Endian,
}

impl Dtype {
    /// Parse a numpy type descriptor such as `f4`, `<f8`, `>i2` or `float32`.
    pub fn parse(descr: &str) -> Result<Self> {
        let (endian, code) = match descr.as_bytes().first() {
            Some(b'>') => (Endian::Big, &descr[1..]),
            Some(b'<') | Some(b'|') | Some(b'=') => (Endian::Little, &descr[1..]),
            _ => (Endian::Little, descr),
        };

        let (kind, size) = match code {
            "float16" | "half" => (ScalarKind::Float, 2),
            "float32" | "single" => (ScalarKind::Float, 4),
            "float64" | "double" | "float" => (ScalarKind::Float, 8),
            "int8" => (ScalarKind::Int, 1),
            "int16" => (ScalarKind::Int, 2),
            "int32" => (ScalarKind::Int, 4),
            "int64" => (ScalarKind::Int, 8),
            "uint8" => (ScalarKind::UInt, 1),
            "uint16" => (ScalarKind::UInt, 2),
            "uint32" => (ScalarKind::UInt, 4),
            "uint64" => (ScalarKind::UInt, 8),
            "bool" | "?" => (ScalarKind::Bool, 1),
            _ => {
                let kind = match code.chars().next() {
                    Some('f') => ScalarKind::Float,
                    Some('i') => ScalarKind::Int,
                    Some('u') => ScalarKind::UInt,
                    Some('b') => ScalarKind::Bool,
                    _ => return Err(PickleError::Unsupported(format!("dtype '{}'", descr))),
                };
                let size: usize = code[1..]
                    .parse()
                    .map_err(|_| PickleError::Unsupported(format!("dtype '{}'", descr)))?;
                (kind, size)
            }
        };

        let valid = match kind {
            ScalarKind::Float => matches!(size, 2 | 4 | 8),
            ScalarKind::Int | ScalarKind::UInt => matches!(size, 1 | 2 | 4 | 8),
            ScalarKind::Bool => size == 1,
        };
        if !valid {
            return Err(PickleError::Unsupported(format!("dtype '{}'", descr)));
        }

        Ok(Self { kind, size, endian })
    }

    fn decode<B: ByteOrder>(&self, buf: &[u8]) -> f64 {
        match (self.kind, self.size) {
            (ScalarKind::Float, 2) => f16_to_f64(B::read_u16(buf)),
            (ScalarKind::Float, 4) => B::read_f32(buf) as f64,
            (ScalarKind::Float, 8) => B::read_f64(buf),
            (ScalarKind::Int, 1) => buf[0] as i8 as f64,
            (ScalarKind::Int, 2) => B::read_i16(buf) as f64,
            (ScalarKind::Int, 4) => B::read_i32(buf) as f64,
            (ScalarKind::Int, 8) => B::read_i64(buf) as f64,
            (ScalarKind::UInt, 1) => buf[0] as f64,
            (ScalarKind::UInt, 2) => B::read_u16(buf) as f64,
            (ScalarKind::UInt, 4) => B::read_u32(buf) as f64,
            (ScalarKind::UInt, 8) => B::read_u64(buf) as f64,
            (ScalarKind::Bool, _) => {
                if buf[0] != 0 {
                    1.0
                } else {
                    0.0
                }
            }
            // Dtype::parse rejects every other combination
            _ => f64::NAN,
        }
    }
}

fn f16_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exp = ((bits >> 10) & 0x1f) as i32;
    let frac = (bits & 0x3ff) as f64;

    match exp {
        0 => sign * frac * 2f64.powi(-24),
        31 if frac == 0.0 => sign * f64::INFINITY,
        31 => f64::NAN,
        _ => sign * (1.0 + frac / 1024.0) * 2f64.powi(exp - 15),
    }
}

/// A decoded numpy array.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    pub fortran_order: bool,
    /// Raw element bytes in storage order.
    pub data: Vec<u8>,
}

impl NdArray {
    /// Placeholder produced by `_reconstruct`, filled in by `BUILD`.
    fn placeholder() -> Self {
        Self {
            shape: vec![0],
            dtype: Dtype {
                kind: ScalarKind::UInt,
                size: 1,
                endian: Endian::Little,
            },
            fortran_order: false,
            data: Vec::new(),
        }
    }

    /// Number of elements. A zero-dimensional array holds one.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply the state tuple numpy's `ndarray.__setstate__` receives:
    /// `(version, shape, dtype, is_fortran, data)`, or the older form
    /// without `version`.
    fn set_state(&mut self, state: Value) -> Result<()> {
        let mut items = match state {
            Value::Tuple(items) => items,
            other => {
                return Err(PickleError::Invalid(format!(
                    "ndarray state must be a tuple, got {}",
                    other.type_name()
                )))
            }
        };
        if items.len() == 5 {
            items.remove(0);
        }
        if items.len() != 4 {
            return Err(PickleError::Invalid(format!(
                "ndarray state has {} fields",
                items.len()
            )));
        }

        let mut fields = items.into_iter();
        let shape = fields.next().unwrap_or(Value::None);
        let dtype = fields.next().unwrap_or(Value::None);
        let fortran = fields.next().unwrap_or(Value::None);
        let data = fields.next().unwrap_or(Value::None);

        self.shape = parse_shape(&shape)?;

        self.dtype = match dtype {
            Value::Dtype(dt) => dt,
            other => {
                return Err(PickleError::Unsupported(format!(
                    "ndarray with dtype {}",
                    other.type_name()
                )))
            }
        };

        self.fortran_order = matches!(fortran, Value::Bool(true) | Value::Int(1));

        self.data = match data {
            Value::Bytes(bytes) => bytes,
            Value::Str(text) => latin1_bytes(&text)?,
            Value::List(_) => {
                return Err(PickleError::Unsupported("object arrays".to_string()))
            }
            other => {
                return Err(PickleError::Invalid(format!(
                    "ndarray data must be bytes, got {}",
                    other.type_name()
                )))
            }
        };

        Ok(())
    }

    /// Array rebuilt from `numeric._frombuffer(buffer, dtype, shape, order)`,
    /// the layout protocol 5 uses for contiguous arrays.
    fn from_buffer(argv: &[Value]) -> Result<Self> {
        let data = match argv.first() {
            Some(Value::Bytes(bytes)) => bytes.clone(),
            Some(other) => {
                return Err(PickleError::Invalid(format!(
                    "_frombuffer data must be bytes, got {}",
                    other.type_name()
                )))
            }
            None => return Err(PickleError::Invalid("_frombuffer without data".to_string())),
        };
        let dtype = match argv.get(1) {
            Some(Value::Dtype(dt)) => *dt,
            _ => return Err(PickleError::Unsupported("_frombuffer without dtype".to_string())),
        };
        let shape = parse_shape(argv.get(2).unwrap_or(&Value::None))?;
        let fortran_order = match argv.get(3) {
            Some(Value::Str(order)) => order == "F",
            _ => false,
        };

        Ok(Self {
            shape,
            dtype,
            fortran_order,
            data,
        })
    }

    /// Storage offsets (in elements) visited in C order.
    fn c_order_offsets(&self) -> Vec<usize> {
        let n = self.len();
        let ndim = self.shape.len();
        if !self.fortran_order || ndim < 2 {
            return (0..n).collect();
        }

        let mut strides = vec![1usize; ndim];
        for k in 1..ndim {
            strides[k] = strides[k - 1] * self.shape[k - 1];
        }

        let mut idx = vec![0usize; ndim];
        let mut offsets = Vec::with_capacity(n);
        for _ in 0..n {
            offsets.push(idx.iter().zip(&strides).map(|(i, s)| i * s).sum());
            for k in (0..ndim).rev() {
                idx[k] += 1;
                if idx[k] < self.shape[k] {
                    break;
                }
                idx[k] = 0;
            }
        }
        offsets
    }

    /// Elements as `f64`, flattened in C (row-major) order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let size = self.dtype.size;
        let expected = self.len() * size;
        if self.data.len() != expected {
            return Err(PickleError::Invalid(format!(
                "ndarray of shape {:?} needs {} bytes, found {}",
                self.shape,
                expected,
                self.data.len()
            )));
        }

        let values = self
            .c_order_offsets()
            .into_iter()
            .map(|i| {
                let buf = &self.data[i * size..(i + 1) * size];
                match self.dtype.endian {
                    Endian::Little => self.dtype.decode::<LittleEndian>(buf),
                    Endian::Big => self.dtype.decode::<BigEndian>(buf),
                }
            })
            .collect();

        Ok(values)
    }
}

/// A decoded pickle object.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    /// Key/value pairs in insertion order.
    Dict(Vec<(Value, Value)>),
    Global {
        module: String,
        name: String,
    },
    Dtype(Dtype),
    Array(NdArray),
    /// A call or instantiation we do not interpret.
    Object {
        class: Box<Value>,
        args: Box<Value>,
        state: Option<Box<Value>>,
    },
}

impl Value {
    /// Short name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Global { .. } => "global",
            Value::Dtype(_) => "dtype",
            Value::Array(_) => "ndarray",
            Value::Object { .. } => "object",
        }
    }

    /// Look up a string key in a dict.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(items) => items.iter().find_map(|(k, v)| match k {
                Value::Str(s) if s == key => Some(v),
                Value::Bytes(b) if b.as_slice() == key.as_bytes() => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }

    /// Flatten a number, a nested list/tuple of numbers, or an array into
    /// `f64` values in row-major order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        match self {
            Value::Bool(b) => Ok(vec![if *b { 1.0 } else { 0.0 }]),
            Value::Int(n) => Ok(vec![*n as f64]),
            Value::Float(f) => Ok(vec![*f]),
            Value::Array(arr) => arr.to_f64_vec(),
            Value::List(items) | Value::Tuple(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.extend(item.to_f64_vec()?);
                }
                Ok(out)
            }
            other => Err(PickleError::Invalid(format!(
                "expected numeric data, got {}",
                other.type_name()
            ))),
        }
    }
}

fn latin1_bytes(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| {
            u8::try_from(c as u32)
                .map_err(|_| PickleError::Invalid(format!("character {:?} is not latin-1", c)))
        })
        .collect()
}

fn latin1_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn is_numpy_multiarray(module: &str) -> bool {
    module == "numpy.core.multiarray" || module == "numpy._core.multiarray"
}

fn is_numpy_numeric(module: &str) -> bool {
    module == "numpy.core.numeric" || module == "numpy._core.numeric"
}

fn parse_shape(value: &Value) -> Result<Vec<usize>> {
    match value {
        Value::Tuple(dims) | Value::List(dims) => dims
            .iter()
            .map(|d| match d {
                Value::Int(n) if *n >= 0 => Ok(*n as usize),
                other => Err(PickleError::Invalid(format!(
                    "bad ndarray dimension {:?}",
                    other
                ))),
            })
            .collect(),
        other => Err(PickleError::Invalid(format!(
            "ndarray shape must be a tuple, got {}",
            other.type_name()
        ))),
    }
}

/// Reader wrapper that tracks the byte offset for error messages.
struct Counting<R> {
    inner: R,
    pos: u64,
}

impl<R: Read> Read for Counting<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

struct Slot {
    value: Value,
    /// Memo entry that aliases this value, kept in sync on mutation.
    memo_key: Option<u32>,
}

struct Unpickler<R> {
    reader: Counting<R>,
    stack: Vec<Slot>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
}

impl<R: Read> Unpickler<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: Counting {
                inner: reader,
                pos: 0,
            },
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(Slot {
            value,
            memo_key: None,
        });
    }

    fn pop(&mut self, at: u64) -> Result<Value> {
        self.stack
            .pop()
            .map(|slot| slot.value)
            .ok_or(PickleError::StackUnderflow(at))
    }

    fn pop_mark(&mut self, at: u64) -> Result<Vec<Value>> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark(at))?;
        if mark > self.stack.len() {
            return Err(PickleError::StackUnderflow(at));
        }
        Ok(self.stack.split_off(mark).into_iter().map(|s| s.value).collect())
    }

    fn pop_n(&mut self, n: usize, at: u64) -> Result<Vec<Value>> {
        if self.stack.len() < n {
            return Err(PickleError::StackUnderflow(at));
        }
        let start = self.stack.len() - n;
        Ok(self.stack.split_off(start).into_iter().map(|s| s.value).collect())
    }

    fn modify_top<F>(&mut self, at: u64, f: F) -> Result<()>
    where
        F: FnOnce(&mut Value) -> Result<()>,
    {
        let slot = self.stack.last_mut().ok_or(PickleError::StackUnderflow(at))?;
        f(&mut slot.value)?;
        if let Some(key) = slot.memo_key {
            self.memo.insert(key, slot.value.clone());
        }
        Ok(())
    }

    fn memo_put(&mut self, key: u32, at: u64) -> Result<()> {
        let slot = self.stack.last_mut().ok_or(PickleError::StackUnderflow(at))?;
        slot.memo_key = Some(key);
        self.memo.insert(key, slot.value.clone());
        Ok(())
    }

    fn memo_get(&mut self, key: u32) -> Result<()> {
        let value = self
            .memo
            .get(&key)
            .cloned()
            .ok_or(PickleError::MissingMemo(key))?;
        self.stack.push(Slot {
            value,
            memo_key: Some(key),
        });
        Ok(())
    }

    fn read_bytes(&mut self, len: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let read = (&mut self.reader).take(len).read_to_end(&mut buf)?;
        if (read as u64) < len {
            return Err(PickleError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated pickle",
            )));
        }
        Ok(buf)
    }

    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            match self.reader.read_u8()? {
                b'\n' => break,
                byte => line.push(byte),
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    fn read_text_line(&mut self) -> Result<String> {
        let line = self.read_line()?;
        String::from_utf8(line).map_err(|_| PickleError::Invalid("non-UTF-8 text line".to_string()))
    }

    fn read_utf8(&mut self, len: u64) -> Result<String> {
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|_| PickleError::Invalid("invalid UTF-8 string".to_string()))
    }

    fn read_memo_key_line(&mut self) -> Result<u32> {
        let line = self.read_text_line()?;
        line.trim()
            .parse()
            .map_err(|_| PickleError::Invalid(format!("bad memo key '{}'", line)))
    }

    fn run(mut self) -> Result<Value> {
        loop {
            let at = self.reader.pos;
            let opcode = self.reader.read_u8()?;

            match opcode {
                op::PROTO => {
                    let version = self.reader.read_u8()?;
                    if version > 5 {
                        return Err(PickleError::Unsupported(format!("protocol {}", version)));
                    }
                }
                op::FRAME => {
                    self.reader.read_u64::<LittleEndian>()?;
                }
                op::STOP => return self.pop(at),

                op::MARK => self.marks.push(self.stack.len()),
                op::POP => {
                    self.pop(at)?;
                }
                op::POP_MARK => {
                    self.pop_mark(at)?;
                }
                op::DUP => {
                    let top = self
                        .stack
                        .last()
                        .map(|s| s.value.clone())
                        .ok_or(PickleError::StackUnderflow(at))?;
                    self.push(top);
                }

                op::NONE => self.push(Value::None),
                op::NEWTRUE => self.push(Value::Bool(true)),
                op::NEWFALSE => self.push(Value::Bool(false)),

                op::INT => {
                    let line = self.read_text_line()?;
                    let value = match line.as_str() {
                        "00" => Value::Bool(false),
                        "01" => Value::Bool(true),
                        text => Value::Int(text.trim().parse().map_err(|_| {
                            PickleError::Invalid(format!("bad INT '{}'", text))
                        })?),
                    };
                    self.push(value);
                }
                op::BININT => {
                    let n = self.reader.read_i32::<LittleEndian>()?;
                    self.push(Value::Int(n as i64));
                }
                op::BININT1 => {
                    let n = self.reader.read_u8()?;
                    self.push(Value::Int(n as i64));
                }
                op::BININT2 => {
                    let n = self.reader.read_u16::<LittleEndian>()?;
                    self.push(Value::Int(n as i64));
                }
                op::LONG => {
                    let line = self.read_text_line()?;
                    let digits = line.trim().trim_end_matches('L');
                    let n: i64 = digits.parse().map_err(|_| {
                        PickleError::Unsupported(format!("integer '{}' beyond 64 bits", digits))
                    })?;
                    self.push(Value::Int(n));
                }
                op::LONG1 => {
                    let len = self.reader.read_u8()? as u64;
                    let bytes = self.read_bytes(len)?;
                    self.push(Value::Int(decode_long(&bytes)?));
                }
                op::LONG4 => {
                    let len = self.reader.read_i32::<LittleEndian>()?;
                    if len < 0 {
                        return Err(PickleError::Invalid("negative LONG4 length".to_string()));
                    }
                    let bytes = self.read_bytes(len as u64)?;
                    self.push(Value::Int(decode_long(&bytes)?));
                }
                op::FLOAT => {
                    let line = self.read_text_line()?;
                    let f: f64 = line
                        .trim()
                        .parse()
                        .map_err(|_| PickleError::Invalid(format!("bad FLOAT '{}'", line)))?;
                    self.push(Value::Float(f));
                }
                op::BINFLOAT => {
                    let f = self.reader.read_f64::<BigEndian>()?;
                    self.push(Value::Float(f));
                }

                // Python 2 byte strings decode as latin-1 text; array data
                // is recovered from them in NdArray::set_state.
                op::STRING => {
                    let line = self.read_line()?;
                    let bytes = unquote_string(&line)?;
                    self.push(Value::Str(latin1_string(&bytes)));
                }
                op::BINSTRING => {
                    let len = self.reader.read_i32::<LittleEndian>()?;
                    if len < 0 {
                        return Err(PickleError::Invalid("negative BINSTRING length".to_string()));
                    }
                    let bytes = self.read_bytes(len as u64)?;
                    self.push(Value::Str(latin1_string(&bytes)));
                }
                op::SHORT_BINSTRING => {
                    let len = self.reader.read_u8()? as u64;
                    let bytes = self.read_bytes(len)?;
                    self.push(Value::Str(latin1_string(&bytes)));
                }

                op::UNICODE => {
                    let line = self.read_line()?;
                    self.push(Value::Str(decode_raw_unicode_escape(&line)?));
                }
                op::SHORT_BINUNICODE => {
                    let len = self.reader.read_u8()? as u64;
                    let s = self.read_utf8(len)?;
                    self.push(Value::Str(s));
                }
                op::BINUNICODE => {
                    let len = self.reader.read_u32::<LittleEndian>()? as u64;
                    let s = self.read_utf8(len)?;
                    self.push(Value::Str(s));
                }
                op::BINUNICODE8 => {
                    let len = self.reader.read_u64::<LittleEndian>()?;
                    let s = self.read_utf8(len)?;
                    self.push(Value::Str(s));
                }

                op::SHORT_BINBYTES => {
                    let len = self.reader.read_u8()? as u64;
                    let bytes = self.read_bytes(len)?;
                    self.push(Value::Bytes(bytes));
                }
                op::BINBYTES => {
                    let len = self.reader.read_u32::<LittleEndian>()? as u64;
                    let bytes = self.read_bytes(len)?;
                    self.push(Value::Bytes(bytes));
                }
                op::BINBYTES8 | op::BYTEARRAY8 => {
                    let len = self.reader.read_u64::<LittleEndian>()?;
                    let bytes = self.read_bytes(len)?;
                    self.push(Value::Bytes(bytes));
                }

                op::EMPTY_LIST => self.push(Value::List(Vec::new())),
                op::EMPTY_TUPLE => self.push(Value::Tuple(Vec::new())),
                op::EMPTY_DICT => self.push(Value::Dict(Vec::new())),
                op::EMPTY_SET => self.push(Value::Set(Vec::new())),

                op::LIST => {
                    let items = self.pop_mark(at)?;
                    self.push(Value::List(items));
                }
                op::TUPLE => {
                    let items = self.pop_mark(at)?;
                    self.push(Value::Tuple(items));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = (opcode - op::TUPLE1 + 1) as usize;
                    let items = self.pop_n(n, at)?;
                    self.push(Value::Tuple(items));
                }
                op::FROZENSET => {
                    let items = self.pop_mark(at)?;
                    self.push(Value::Set(items));
                }
                op::DICT => {
                    let items = self.pop_mark(at)?;
                    self.push(Value::Dict(pairs(items)?));
                }

                op::APPEND => {
                    let item = self.pop(at)?;
                    self.modify_top(at, |top| extend_list(top, vec![item]))?;
                }
                op::APPENDS => {
                    let items = self.pop_mark(at)?;
                    self.modify_top(at, |top| extend_list(top, items))?;
                }
                op::SETITEM => {
                    let value = self.pop(at)?;
                    let key = self.pop(at)?;
                    self.modify_top(at, |top| extend_dict(top, vec![(key, value)]))?;
                }
                op::SETITEMS => {
                    let items = pairs(self.pop_mark(at)?)?;
                    self.modify_top(at, |top| extend_dict(top, items))?;
                }
                op::ADDITEMS => {
                    let items = self.pop_mark(at)?;
                    self.modify_top(at, |top| match top {
                        Value::Set(set) => {
                            set.extend(items);
                            Ok(())
                        }
                        other => Err(PickleError::Invalid(format!(
                            "ADDITEMS on {}",
                            other.type_name()
                        ))),
                    })?;
                }

                op::PUT => {
                    let key = self.read_memo_key_line()?;
                    self.memo_put(key, at)?;
                }
                op::BINPUT => {
                    let key = self.reader.read_u8()? as u32;
                    self.memo_put(key, at)?;
                }
                op::LONG_BINPUT => {
                    let key = self.reader.read_u32::<LittleEndian>()?;
                    self.memo_put(key, at)?;
                }
                op::MEMOIZE => {
                    let key = self.memo.len() as u32;
                    self.memo_put(key, at)?;
                }
                op::GET => {
                    let key = self.read_memo_key_line()?;
                    self.memo_get(key)?;
                }
                op::BINGET => {
                    let key = self.reader.read_u8()? as u32;
                    self.memo_get(key)?;
                }
                op::LONG_BINGET => {
                    let key = self.reader.read_u32::<LittleEndian>()?;
                    self.memo_get(key)?;
                }

                op::GLOBAL => {
                    let module = self.read_text_line()?;
                    let name = self.read_text_line()?;
                    self.push(Value::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop(at)?;
                    let module = self.pop(at)?;
                    match (module, name) {
                        (Value::Str(module), Value::Str(name)) => {
                            self.push(Value::Global { module, name })
                        }
                        _ => {
                            return Err(PickleError::Invalid(
                                "STACK_GLOBAL needs two strings".to_string(),
                            ))
                        }
                    }
                }
                op::REDUCE => {
                    let args = self.pop(at)?;
                    let callable = self.pop(at)?;
                    let value = reduce(callable, args)?;
                    self.push(value);
                }
                op::BUILD => {
                    let state = self.pop(at)?;
                    self.modify_top(at, |top| build(top, state))?;
                }
                op::NEWOBJ => {
                    let args = self.pop(at)?;
                    let class = self.pop(at)?;
                    self.push(object(class, args));
                }
                op::NEWOBJ_EX => {
                    let _kwargs = self.pop(at)?;
                    let args = self.pop(at)?;
                    let class = self.pop(at)?;
                    self.push(object(class, args));
                }
                op::INST => {
                    let module = self.read_text_line()?;
                    let name = self.read_text_line()?;
                    let args = self.pop_mark(at)?;
                    self.push(object(Value::Global { module, name }, Value::Tuple(args)));
                }
                op::OBJ => {
                    let mut items = self.pop_mark(at)?;
                    if items.is_empty() {
                        return Err(PickleError::StackUnderflow(at));
                    }
                    let class = items.remove(0);
                    self.push(object(class, Value::Tuple(items)));
                }

                op::PERSID | op::BINPERSID => {
                    return Err(PickleError::Unsupported("persistent IDs".to_string()))
                }
                op::EXT1 | op::EXT2 | op::EXT4 => {
                    return Err(PickleError::Unsupported("extension registry".to_string()))
                }
                op::NEXT_BUFFER | op::READONLY_BUFFER => {
                    return Err(PickleError::Unsupported("out-of-band buffers".to_string()))
                }

                _ => {
                    return Err(PickleError::UnknownOpcode { opcode, offset: at });
                }
            }
        }
    }
}

fn object(class: Value, args: Value) -> Value {
    Value::Object {
        class: Box::new(class),
        args: Box::new(args),
        state: None,
    }
}

fn pairs(items: Vec<Value>) -> Result<Vec<(Value, Value)>> {
    if items.len() % 2 != 0 {
        return Err(PickleError::Invalid("odd number of dict items".to_string()));
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        out.push((k, v));
    }
    Ok(out)
}

fn extend_list(target: &mut Value, items: Vec<Value>) -> Result<()> {
    match target {
        Value::List(list) => {
            list.extend(items);
            Ok(())
        }
        other => Err(PickleError::Invalid(format!("APPEND on {}", other.type_name()))),
    }
}

fn upsert(dict: &mut Vec<(Value, Value)>, items: Vec<(Value, Value)>) {
    for (key, value) in items {
        match dict.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => dict.push((key, value)),
        }
    }
}

fn extend_dict(target: &mut Value, items: Vec<(Value, Value)>) -> Result<()> {
    match target {
        Value::Dict(dict) => {
            upsert(dict, items);
            Ok(())
        }
        other => Err(PickleError::Invalid(format!("SETITEM on {}", other.type_name()))),
    }
}

fn decode_long(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        return Err(PickleError::Unsupported(format!(
            "{}-byte integer",
            bytes.len()
        )));
    }
    let negative = bytes[bytes.len() - 1] & 0x80 != 0;
    let mut buf = if negative { [0xFFu8; 8] } else { [0u8; 8] };
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(LittleEndian::read_i64(&buf))
}

/// Decode a protocol 0 `STRING` argument: a quoted Python 2 `repr`.
fn unquote_string(line: &[u8]) -> Result<Vec<u8>> {
    let quoted = line.len() >= 2
        && (line[0] == b'\'' || line[0] == b'"')
        && line[line.len() - 1] == line[0];
    if !quoted {
        return Err(PickleError::Invalid("STRING argument is not quoted".to_string()));
    }

    let body = &line[1..line.len() - 1];
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if body[i] != b'\\' || i + 1 == body.len() {
            out.push(body[i]);
            i += 1;
            continue;
        }
        match body[i + 1] {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'\\' => out.push(b'\\'),
            b'\'' => out.push(b'\''),
            b'"' => out.push(b'"'),
            b'x' if i + 3 < body.len() => {
                let hex = std::str::from_utf8(&body[i + 2..i + 4]).unwrap_or("");
                let byte = u8::from_str_radix(hex, 16)
                    .map_err(|_| PickleError::Invalid(format!("bad escape \\x{}", hex)))?;
                out.push(byte);
                i += 4;
                continue;
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
        i += 2;
    }
    Ok(out)
}

/// Decode a protocol 0 `UNICODE` argument (`raw-unicode-escape`).
fn decode_raw_unicode_escape(line: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let width = match (line[i], line.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            _ => 0,
        };
        if width == 0 || i + 2 + width > line.len() {
            out.push(line[i] as char);
            i += 1;
            continue;
        }

        let hex = std::str::from_utf8(&line[i + 2..i + 2 + width]).unwrap_or("");
        let c = u32::from_str_radix(hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| PickleError::Invalid(format!("bad unicode escape '{}'", hex)))?;
        out.push(c);
        i += 2 + width;
    }
    Ok(out)
}

fn reduce(callable: Value, args: Value) -> Result<Value> {
    let (module, name) = match &callable {
        Value::Global { module, name } => (module.as_str(), name.as_str()),
        _ => return Ok(object(callable, args)),
    };
    let empty = Vec::new();
    let argv = match &args {
        Value::Tuple(items) => items,
        _ => &empty,
    };

    match (module, name) {
        (m, "_reconstruct") if is_numpy_multiarray(m) => Ok(Value::Array(NdArray::placeholder())),
        (m, "_frombuffer") if is_numpy_numeric(m) => Ok(Value::Array(NdArray::from_buffer(argv)?)),
        (m, "scalar") if is_numpy_multiarray(m) => {
            let dtype = match argv.first() {
                Some(Value::Dtype(dt)) => *dt,
                _ => return Err(PickleError::Unsupported("numpy scalar without dtype".to_string())),
            };
            let data = match argv.get(1) {
                Some(Value::Bytes(b)) => b.clone(),
                Some(Value::Str(s)) => latin1_bytes(s)?,
                _ => return Err(PickleError::Unsupported("numpy object scalar".to_string())),
            };
            Ok(Value::Array(NdArray {
                shape: Vec::new(),
                dtype,
                fortran_order: false,
                data,
            }))
        }
        ("numpy", "dtype") => match argv.first() {
            Some(Value::Str(descr)) => Ok(Value::Dtype(Dtype::parse(descr)?)),
            _ => Err(PickleError::Invalid("numpy.dtype without descriptor".to_string())),
        },
        ("_codecs", "encode") => match argv.first() {
            Some(Value::Str(text)) => Ok(Value::Bytes(latin1_bytes(text)?)),
            _ => Err(PickleError::Invalid("_codecs.encode without text".to_string())),
        },
        ("builtins" | "__builtin__", "bytes" | "bytearray") => match argv.first() {
            None => Ok(Value::Bytes(Vec::new())),
            Some(Value::Bytes(b)) => Ok(Value::Bytes(b.clone())),
            Some(Value::Str(text)) => Ok(Value::Bytes(latin1_bytes(text)?)),
            Some(other) => Err(PickleError::Invalid(format!(
                "{} from {}",
                name,
                other.type_name()
            ))),
        },
        ("builtins" | "__builtin__", "set" | "frozenset") => {
            let set = match argv.first() {
                None => Some(Vec::new()),
                Some(Value::List(items)) | Some(Value::Tuple(items)) => Some(items.clone()),
                Some(_) => None,
            };
            Ok(set.map(Value::Set).unwrap_or_else(|| object(callable, args)))
        }
        ("collections", "OrderedDict") => {
            let dict: Option<Vec<(Value, Value)>> = match argv.first() {
                None => Some(Vec::new()),
                Some(Value::List(items)) => items
                    .iter()
                    .map(|item| match item {
                        Value::List(kv) | Value::Tuple(kv) if kv.len() == 2 => {
                            Some((kv[0].clone(), kv[1].clone()))
                        }
                        _ => None,
                    })
                    .collect(),
                Some(_) => None,
            };
            Ok(dict.map(Value::Dict).unwrap_or_else(|| object(callable, args)))
        }
        _ => Ok(object(callable, args)),
    }
}

fn build(target: &mut Value, state: Value) -> Result<()> {
    match target {
        Value::Array(arr) => arr.set_state(state),
        Value::Dtype(dtype) => {
            // state: (version, byteorder, subarray, names, fields, ...)
            if let Value::Tuple(items) = &state {
                match items.get(1) {
                    Some(Value::Str(order)) if order == ">" => dtype.endian = Endian::Big,
                    Some(Value::Str(order)) if order == "<" => dtype.endian = Endian::Little,
                    _ => {}
                }
            }
            Ok(())
        }
        Value::Dict(dict) => {
            if let Value::Dict(items) = state {
                upsert(dict, items);
            }
            Ok(())
        }
        Value::Object { state: slot, .. } => {
            *slot = Some(Box::new(state));
            Ok(())
        }
        other => Err(PickleError::Unsupported(format!(
            "BUILD on {}",
            other.type_name()
        ))),
    }
}

/// Decode a pickle from any reader.
pub fn from_reader<R: Read>(reader: R) -> Result<Value> {
    Unpickler::new(reader).run()
}

/// Decode a pickle held in memory.
pub fn from_slice(bytes: &[u8]) -> Result<Value> {
    from_reader(bytes)
}

/// Decode a pickle file.
pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Value> {
    let file = File::open(path)?;
    from_reader(BufReader::new(file))
}
