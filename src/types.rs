// types.rs - CIP primitive and array codecs
//
// All wire integers are little-endian.  Each primitive doubles as a small
// composable machine (see `machine`), which is how the encapsulation header
// parser is assembled.

use crate::automata::{self, Automaton, Emit};
use crate::error::{EnipError, Result};
use std::fmt;

/// A 16-bit CIP type code and its codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipType {
    Bool,
    Sint,
    Int,
    Dint,
    Lint,
    Usint,
    Uint,
    Udint,
    Ulint,
    Real,
    Lreal,
    Word,
    Dword,
    StringType,
    Sstring,
}

impl CipType {
    pub fn code(&self) -> u16 {
        match self {
            CipType::Bool => 0x00C1,
            CipType::Sint => 0x00C2,
            CipType::Int => 0x00C3,
            CipType::Dint => 0x00C4,
            CipType::Lint => 0x00C5,
            CipType::Usint => 0x00C6,
            CipType::Uint => 0x00C7,
            CipType::Udint => 0x00C8,
            CipType::Ulint => 0x00C9,
            CipType::Real => 0x00CA,
            CipType::Lreal => 0x00CB,
            CipType::StringType => 0x00D0,
            CipType::Word => 0x00D2,
            CipType::Dword => 0x00D3,
            CipType::Sstring => 0x00DA,
        }
    }

    pub fn from_code(code: u16) -> Option<CipType> {
        Some(match code {
            0x00C1 => CipType::Bool,
            0x00C2 => CipType::Sint,
            0x00C3 => CipType::Int,
            0x00C4 => CipType::Dint,
            0x00C5 => CipType::Lint,
            0x00C6 => CipType::Usint,
            0x00C7 => CipType::Uint,
            0x00C8 => CipType::Udint,
            0x00C9 => CipType::Ulint,
            0x00CA => CipType::Real,
            0x00CB => CipType::Lreal,
            0x00D0 => CipType::StringType,
            0x00D2 => CipType::Word,
            0x00D3 => CipType::Dword,
            0x00DA => CipType::Sstring,
            _ => return None,
        })
    }

    /// Parse a type name as written in operation strings, eg. `(DINT)`.
    pub fn from_name(name: &str) -> Option<CipType> {
        Some(match name.to_ascii_uppercase().as_str() {
            "BOOL" => CipType::Bool,
            "SINT" => CipType::Sint,
            "INT" => CipType::Int,
            "DINT" => CipType::Dint,
            "LINT" => CipType::Lint,
            "USINT" => CipType::Usint,
            "UINT" => CipType::Uint,
            "UDINT" => CipType::Udint,
            "ULINT" => CipType::Ulint,
            "REAL" => CipType::Real,
            "LREAL" => CipType::Lreal,
            "WORD" => CipType::Word,
            "DWORD" => CipType::Dword,
            "STRING" => CipType::StringType,
            "SSTRING" => CipType::Sstring,
            _ => return None,
        })
    }

    /// Fixed encoded width in bytes; strings are length-prefixed and report
    /// None.
    pub fn size(&self) -> Option<usize> {
        Some(match self {
            CipType::Bool | CipType::Sint | CipType::Usint => 1,
            CipType::Int | CipType::Uint | CipType::Word => 2,
            CipType::Dint | CipType::Udint | CipType::Dword | CipType::Real => 4,
            CipType::Lint | CipType::Ulint | CipType::Lreal => 8,
            CipType::StringType | CipType::Sstring => return None,
        })
    }

    /// A parser machine for one element of this type, emitting at `context`.
    /// Variable-length string types have no fixed-width machine.
    pub fn machine(&self, context: &str) -> Option<Automaton> {
        let (width, emit) = match self {
            CipType::Bool | CipType::Usint => (1, Emit::Uint),
            CipType::Sint => (1, Emit::Int),
            CipType::Uint | CipType::Word => (2, Emit::Uint),
            CipType::Int => (2, Emit::Int),
            CipType::Udint | CipType::Dword => (4, Emit::Uint),
            CipType::Dint => (4, Emit::Int),
            CipType::Lint => (8, Emit::Int),
            CipType::Ulint => (8, Emit::Uint),
            CipType::Real => (4, Emit::Real),
            CipType::Lreal => (8, Emit::Real),
            CipType::StringType | CipType::Sstring => return None,
        };
        Some(automata::scalar(&format!("{:?}", self), context, width, emit))
    }
}

impl fmt::Display for CipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One decoded CIP value.
#[derive(Debug, Clone, PartialEq)]
pub enum CipValue {
    Bool(bool),
    Sint(i8),
    Int(i16),
    Dint(i32),
    Lint(i64),
    Usint(u8),
    Uint(u16),
    Udint(u32),
    Ulint(u64),
    Real(f32),
    Lreal(f64),
    Word(u16),
    Dword(u32),
    Str(String),
}

impl CipValue {
    pub fn cip_type(&self) -> CipType {
        match self {
            CipValue::Bool(_) => CipType::Bool,
            CipValue::Sint(_) => CipType::Sint,
            CipValue::Int(_) => CipType::Int,
            CipValue::Dint(_) => CipType::Dint,
            CipValue::Lint(_) => CipType::Lint,
            CipValue::Usint(_) => CipType::Usint,
            CipValue::Uint(_) => CipType::Uint,
            CipValue::Udint(_) => CipType::Udint,
            CipValue::Ulint(_) => CipType::Ulint,
            CipValue::Real(_) => CipType::Real,
            CipValue::Lreal(_) => CipType::Lreal,
            CipValue::Word(_) => CipType::Word,
            CipValue::Dword(_) => CipType::Dword,
            CipValue::Str(_) => CipType::Sstring,
        }
    }

    /// Numeric view for comparisons and display; strings return None.
    pub fn as_i64(&self) -> Option<i64> {
        Some(match self {
            CipValue::Bool(b) => *b as i64,
            CipValue::Sint(v) => *v as i64,
            CipValue::Int(v) => *v as i64,
            CipValue::Dint(v) => *v as i64,
            CipValue::Lint(v) => *v,
            CipValue::Usint(v) => *v as i64,
            CipValue::Uint(v) => *v as i64,
            CipValue::Udint(v) => *v as i64,
            CipValue::Ulint(v) => *v as i64,
            CipValue::Word(v) => *v as i64,
            CipValue::Dword(v) => *v as i64,
            CipValue::Real(_) | CipValue::Lreal(_) | CipValue::Str(_) => return None,
        })
    }
}

/// Bounds-checked little-endian reader over a byte slice.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Cursor<'a> {
        Cursor { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(EnipError::Frame(format!(
                "truncated: wanted {} bytes, {} remain",
                n,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn i16(&mut self) -> Result<i16> {
        Ok(self.u16()? as i16)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.u64()?))
    }
}

/// ISO-8859-1: every byte maps to the Unicode scalar of the same value.
pub fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

pub fn latin1_encode(s: &str) -> Vec<u8> {
    s.chars().map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' }).collect()
}

/// Decode one value of `typ`.
pub fn decode_value(typ: CipType, cur: &mut Cursor<'_>) -> Result<CipValue> {
    Ok(match typ {
        CipType::Bool => CipValue::Bool(cur.u8()? != 0),
        CipType::Sint => CipValue::Sint(cur.i8()?),
        CipType::Int => CipValue::Int(cur.i16()?),
        CipType::Dint => CipValue::Dint(cur.i32()?),
        CipType::Lint => CipValue::Lint(cur.u64()? as i64),
        CipType::Usint => CipValue::Usint(cur.u8()?),
        CipType::Uint => CipValue::Uint(cur.u16()?),
        CipType::Udint => CipValue::Udint(cur.u32()?),
        CipType::Ulint => CipValue::Ulint(cur.u64()?),
        CipType::Real => CipValue::Real(cur.f32()?),
        CipType::Lreal => CipValue::Lreal(cur.f64()?),
        CipType::Word => CipValue::Word(cur.u16()?),
        CipType::Dword => CipValue::Dword(cur.u32()?),
        CipType::Sstring => CipValue::Str(decode_sstring(cur)?),
        CipType::StringType => CipValue::Str(decode_string(cur)?),
    })
}

/// Encode one value onto `out`.
pub fn encode_value(value: &CipValue, out: &mut Vec<u8>) {
    match value {
        CipValue::Bool(b) => out.push(*b as u8),
        CipValue::Sint(v) => out.push(*v as u8),
        CipValue::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
        CipValue::Dint(v) => out.extend_from_slice(&v.to_le_bytes()),
        CipValue::Lint(v) => out.extend_from_slice(&v.to_le_bytes()),
        CipValue::Usint(v) => out.push(*v),
        CipValue::Uint(v) => out.extend_from_slice(&v.to_le_bytes()),
        CipValue::Udint(v) => out.extend_from_slice(&v.to_le_bytes()),
        CipValue::Ulint(v) => out.extend_from_slice(&v.to_le_bytes()),
        CipValue::Real(v) => out.extend_from_slice(&v.to_le_bytes()),
        CipValue::Lreal(v) => out.extend_from_slice(&v.to_le_bytes()),
        CipValue::Word(v) => out.extend_from_slice(&v.to_le_bytes()),
        CipValue::Dword(v) => out.extend_from_slice(&v.to_le_bytes()),
        CipValue::Str(s) => encode_sstring(s, None, out),
    }
}

/// Decode exactly `count` elements of `typ`.
pub fn decode_array(typ: CipType, count: usize, cur: &mut Cursor<'_>) -> Result<Vec<CipValue>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(decode_value(typ, cur)?);
    }
    Ok(out)
}

/// Decode elements of `typ` until the cursor is exhausted; the caller bounds
/// the cursor to the typed-data region.
pub fn decode_all(typ: CipType, cur: &mut Cursor<'_>) -> Result<Vec<CipValue>> {
    let mut out = Vec::new();
    while cur.remaining() > 0 {
        out.push(decode_value(typ, cur)?);
    }
    Ok(out)
}

pub fn encode_array(values: &[CipValue], out: &mut Vec<u8>) {
    for v in values {
        encode_value(v, out);
    }
}

/// Short string: length(1) + bytes(length).
pub fn decode_sstring(cur: &mut Cursor<'_>) -> Result<String> {
    let len = cur.u8()? as usize;
    Ok(latin1_decode(cur.take(len)?))
}

pub fn encode_sstring(s: &str, pad_to: Option<usize>, out: &mut Vec<u8>) {
    let bytes = latin1_encode(s);
    let len = pad_to.unwrap_or(bytes.len());
    out.push(len.min(255) as u8);
    out.extend_from_slice(&bytes[..bytes.len().min(len).min(255)]);
    for _ in bytes.len()..len.min(255) {
        out.push(0);
    }
}

/// String: length(2) + bytes(length) + pad to even.  Unpadded input is also
/// accepted on decode; firmware varies.
pub fn decode_string(cur: &mut Cursor<'_>) -> Result<String> {
    let len = cur.u16()? as usize;
    let s = latin1_decode(cur.take(len)?);
    if len % 2 == 1 && cur.remaining() > 0 {
        cur.u8()?; // pad byte
    }
    Ok(s)
}

pub fn encode_string(s: &str, out: &mut Vec<u8>) {
    let bytes = latin1_encode(s);
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(&bytes);
    if bytes.len() % 2 == 1 {
        out.push(0);
    }
}

/// Whether a write payload of `payload` type is acceptable into an attribute
/// of `attr` type: payloads of a more restricted signed type fit into a more
/// spacious one.
pub fn write_compatible(attr: CipType, payload: CipType) -> bool {
    use CipType::*;
    match attr {
        Real => matches!(payload, Sint | Int | Dint | Real),
        Dint => matches!(payload, Sint | Int | Dint),
        Int => matches!(payload, Sint | Int),
        other => payload == other,
    }
}

/// Re-encode a decoded value as the attribute's element type, applying the
/// widening rules of `write_compatible`.
pub fn coerce(value: &CipValue, into: CipType) -> Result<CipValue> {
    if value.cip_type() == into {
        return Ok(value.clone());
    }
    let n = value.as_i64();
    let out = match (into, n) {
        (CipType::Real, Some(n)) => CipValue::Real(n as f32),
        (CipType::Dint, Some(n)) => CipValue::Dint(n as i32),
        (CipType::Int, Some(n)) => CipValue::Int(n as i16),
        _ => {
            return Err(EnipError::Service { status: 0xFF, extended: vec![0x2107] });
        }
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_round_trip() {
        for typ in [
            CipType::Bool,
            CipType::Sint,
            CipType::Int,
            CipType::Dint,
            CipType::Udint,
            CipType::Real,
            CipType::Sstring,
            CipType::StringType,
        ] {
            assert_eq!(CipType::from_code(typ.code()), Some(typ));
        }
        assert_eq!(CipType::from_code(0x9999), None);
    }

    #[test]
    fn test_scalar_array_round_trip() {
        let values = vec![CipValue::Int(-2), CipValue::Int(300), CipValue::Int(0)];
        let mut wire = Vec::new();
        encode_array(&values, &mut wire);
        assert_eq!(wire, [0xFE, 0xFF, 0x2C, 0x01, 0x00, 0x00]);
        let mut cur = Cursor::new(&wire);
        assert_eq!(decode_array(CipType::Int, 3, &mut cur).unwrap(), values);
    }

    #[test]
    fn test_real_bit_pattern() {
        let mut wire = Vec::new();
        encode_value(&CipValue::Real(1.0), &mut wire);
        assert_eq!(wire, [0x00, 0x00, 0x80, 0x3F]);
    }

    #[test]
    fn test_sstring_truncates_and_nul_fills() {
        let mut wire = Vec::new();
        encode_sstring("abc", Some(5), &mut wire);
        assert_eq!(wire, [5, b'a', b'b', b'c', 0, 0]);
        let mut cur = Cursor::new(&wire);
        assert_eq!(decode_sstring(&mut cur).unwrap(), "abc\0\0");
    }

    #[test]
    fn test_string_pads_to_even_and_accepts_unpadded() {
        let mut wire = Vec::new();
        encode_string("abc", &mut wire);
        assert_eq!(wire, [3, 0, b'a', b'b', b'c', 0]);
        // Padded form decodes
        let mut cur = Cursor::new(&wire);
        assert_eq!(decode_string(&mut cur).unwrap(), "abc");
        assert_eq!(cur.remaining(), 0);
        // Unpadded form also decodes
        let unpadded = [3, 0, b'a', b'b', b'c'];
        let mut cur = Cursor::new(&unpadded);
        assert_eq!(decode_string(&mut cur).unwrap(), "abc");
    }

    #[test]
    fn test_write_widening() {
        assert!(write_compatible(CipType::Real, CipType::Sint));
        assert!(write_compatible(CipType::Dint, CipType::Int));
        assert!(!write_compatible(CipType::Int, CipType::Dint));
        assert!(!write_compatible(CipType::Bool, CipType::Sint));
        assert_eq!(coerce(&CipValue::Int(7), CipType::Dint).unwrap(), CipValue::Dint(7));
        assert!(coerce(&CipValue::Dint(7), CipType::Int).is_err());
    }

    #[test]
    fn test_primitive_machine_matches_codec() {
        use crate::automata::{Runner, Source};
        use crate::tree::{Tree, Value};
        use std::sync::Arc;
        let m = CipType::Dint.machine("v").unwrap();
        let mut runner = Runner::new(Arc::new(m));
        let mut source = Source::from(&[0xD6, 0xFF, 0xFF, 0xFF]);
        let mut tree = Tree::new();
        runner.run(&mut source, &mut tree, true).unwrap();
        assert_eq!(tree.get("v"), Some(&Value::Int(-42)));
    }
}
