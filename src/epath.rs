// epath.rs - CIP Extended Path parse/encode
//
// An EPATH is a word-sized sequence of logical, symbolic, and port segments
// (Volume 1, C-1.4.2).  Numeric segments encode in the minimum representable
// width on output; both the 8-bit and 16-bit (and, for elements, 32-bit)
// forms are accepted on input.  A Route Path is the same structure with one
// pad byte between the size and the segments.

use crate::error::{EnipError, Result};
use crate::types::{latin1_decode, latin1_encode, Cursor};
use std::fmt;

/// Port segment link address: a small integer (backplane slot) or an IP
/// address literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    Number(u8),
    Address(String),
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Number(n) => write!(f, "{}", n),
            Link::Address(a) => write!(f, "{}", a),
        }
    }
}

/// One EPATH segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Class(u16),
    Instance(u16),
    Attribute(u16),
    Element(u32),
    Connection(u16),
    Symbolic(String),
    Port { port: u16, link: Link },
}

const TYPE_CLASS: u8 = 0x20;
const TYPE_INSTANCE: u8 = 0x24;
const TYPE_ELEMENT: u8 = 0x28;
const TYPE_CONNECTION: u8 = 0x2C;
const TYPE_ATTRIBUTE: u8 = 0x30;
const TYPE_SYMBOLIC: u8 = 0x91;

impl Segment {
    /// Interpret one JSON term, eg. `{"connection": 100}` or
    /// `{"port": 1, "link": "1.2.3.4"}`.
    pub fn from_json(value: &serde_json::Value) -> Result<Segment> {
        let obj = value
            .as_object()
            .ok_or_else(|| EnipError::Config(format!("EPATH segment must be an object: {}", value)))?;
        let num = |key: &str| -> Result<u64> {
            obj.get(key)
                .and_then(|v| v.as_u64())
                .ok_or_else(|| EnipError::Config(format!("segment {} must be numeric", key)))
        };
        if obj.contains_key("port") {
            let port = num("port")? as u16;
            let link = match obj.get("link") {
                Some(serde_json::Value::Number(n)) => Link::Number(
                    n.as_u64()
                        .ok_or_else(|| EnipError::Config("link must be a small integer".into()))?
                        as u8,
                ),
                Some(serde_json::Value::String(s)) => Link::Address(s.clone()),
                _ => return Err(EnipError::Config("port segment requires a link".into())),
            };
            return Ok(Segment::Port { port, link });
        }
        if let Some(v) = obj.get("symbolic") {
            let s = v
                .as_str()
                .ok_or_else(|| EnipError::Config("symbolic segment must be a string".into()))?;
            return Ok(Segment::Symbolic(s.to_string()));
        }
        if obj.contains_key("class") {
            return Ok(Segment::Class(num("class")? as u16));
        }
        if obj.contains_key("instance") {
            return Ok(Segment::Instance(num("instance")? as u16));
        }
        if obj.contains_key("attribute") {
            return Ok(Segment::Attribute(num("attribute")? as u16));
        }
        if obj.contains_key("element") {
            return Ok(Segment::Element(num("element")? as u32));
        }
        if obj.contains_key("connection") {
            return Ok(Segment::Connection(num("connection")? as u16));
        }
        Err(EnipError::Config(format!("unrecognized EPATH segment: {}", value)))
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Segment::Class(v) => serde_json::json!({ "class": v }),
            Segment::Instance(v) => serde_json::json!({ "instance": v }),
            Segment::Attribute(v) => serde_json::json!({ "attribute": v }),
            Segment::Element(v) => serde_json::json!({ "element": v }),
            Segment::Connection(v) => serde_json::json!({ "connection": v }),
            Segment::Symbolic(s) => serde_json::json!({ "symbolic": s }),
            Segment::Port { port, link } => match link {
                Link::Number(n) => serde_json::json!({ "port": port, "link": n }),
                Link::Address(a) => serde_json::json!({ "port": port, "link": a }),
            },
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Segment::Class(v) => encode_numeric(TYPE_CLASS, *v as u32, out),
            Segment::Instance(v) => encode_numeric(TYPE_INSTANCE, *v as u32, out),
            Segment::Attribute(v) => encode_numeric(TYPE_ATTRIBUTE, *v as u32, out),
            Segment::Connection(v) => encode_numeric(TYPE_CONNECTION, *v as u32, out),
            Segment::Element(v) => encode_numeric(TYPE_ELEMENT, *v, out),
            Segment::Symbolic(s) => {
                let bytes = latin1_encode(s);
                out.push(TYPE_SYMBOLIC);
                out.push(bytes.len() as u8);
                out.extend_from_slice(&bytes);
                if bytes.len() % 2 == 1 {
                    out.push(0);
                }
            }
            Segment::Port { port, link } => {
                let (low, extended) = if *port < 0x0F { (*port as u8, None) } else { (0x0F, Some(*port)) };
                match link {
                    Link::Number(n) => {
                        out.push(low);
                        if let Some(ext) = extended {
                            out.extend_from_slice(&ext.to_le_bytes());
                        }
                        out.push(*n);
                    }
                    Link::Address(a) => {
                        let bytes = latin1_encode(a);
                        out.push(low | 0x10);
                        out.push(bytes.len() as u8);
                        if let Some(ext) = extended {
                            out.extend_from_slice(&ext.to_le_bytes());
                        }
                        out.extend_from_slice(&bytes);
                        if bytes.len() % 2 == 1 {
                            out.push(0);
                        }
                    }
                }
            }
        }
    }
}

/// 8-bit form if the value fits, else 16-bit (type+1, pad), else the 32-bit
/// element form (type+2, pad).
fn encode_numeric(typ: u8, value: u32, out: &mut Vec<u8>) {
    if value <= 0xFF {
        out.push(typ);
        out.push(value as u8);
    } else if value <= 0xFFFF {
        out.push(typ + 1);
        out.push(0);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else {
        out.push(typ + 2);
        out.push(0);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// An ordered CIP path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Epath(pub Vec<Segment>);

impl Epath {
    pub fn new(segments: Vec<Segment>) -> Epath {
        Epath(segments)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Standard logical address `class/instance[/attribute]`.
    pub fn logical(class: u16, instance: u16, attribute: Option<u16>) -> Epath {
        let mut segs = vec![Segment::Class(class), Segment::Instance(instance)];
        if let Some(a) = attribute {
            segs.push(Segment::Attribute(a));
        }
        Epath(segs)
    }

    /// Parse a size-prefixed EPATH; `padded` selects the Route Path form
    /// with a reserved byte after the size.
    pub fn parse(cur: &mut Cursor<'_>, padded: bool) -> Result<Epath> {
        let words = cur.u8()? as usize;
        if padded {
            cur.u8()?;
        }
        let body = cur.take(words * 2)?;
        let mut inner = Cursor::new(body);
        let mut segments = Vec::new();
        while inner.remaining() > 0 {
            segments.push(Self::parse_segment(&mut inner)?);
        }
        Ok(Epath(segments))
    }

    fn parse_segment(cur: &mut Cursor<'_>) -> Result<Segment> {
        let typ = cur.u8()?;
        Ok(match typ {
            TYPE_CLASS => Segment::Class(cur.u8()? as u16),
            0x21 => {
                cur.u8()?;
                Segment::Class(cur.u16()?)
            }
            TYPE_INSTANCE => Segment::Instance(cur.u8()? as u16),
            0x25 => {
                cur.u8()?;
                Segment::Instance(cur.u16()?)
            }
            TYPE_CONNECTION => Segment::Connection(cur.u8()? as u16),
            0x2D => {
                cur.u8()?;
                Segment::Connection(cur.u16()?)
            }
            TYPE_ATTRIBUTE => Segment::Attribute(cur.u8()? as u16),
            0x31 => {
                cur.u8()?;
                Segment::Attribute(cur.u16()?)
            }
            TYPE_ELEMENT => Segment::Element(cur.u8()? as u32),
            0x29 => {
                cur.u8()?;
                Segment::Element(cur.u16()? as u32)
            }
            0x2A => {
                cur.u8()?;
                Segment::Element(cur.u32()?)
            }
            TYPE_SYMBOLIC => {
                let len = cur.u8()? as usize;
                let s = latin1_decode(cur.take(len)?);
                if len % 2 == 1 {
                    cur.u8()?;
                }
                Segment::Symbolic(s)
            }
            0x01..=0x0F => {
                // Numeric link; port 0x0F means an extended 16-bit port
                let port = if typ == 0x0F { cur.u16()? } else { typ as u16 };
                Segment::Port { port, link: Link::Number(cur.u8()?) }
            }
            0x11..=0x1F => {
                // Address link: size precedes any extended port
                let len = cur.u8()? as usize;
                let low = typ & 0x0F;
                let port = if low == 0x0F { cur.u16()? } else { low as u16 };
                let addr = latin1_decode(cur.take(len)?);
                if len % 2 == 1 {
                    cur.u8()?;
                }
                Segment::Port { port, link: Link::Address(addr) }
            }
            other => {
                return Err(EnipError::Frame(format!(
                    "unrecognized EPATH segment type 0x{:02X}",
                    other
                )))
            }
        })
    }

    /// Encode with size prefix (and pad byte, for the Route Path form).
    pub fn encode(&self, padded: bool) -> Vec<u8> {
        let mut body = Vec::new();
        for seg in &self.0 {
            seg.encode(&mut body);
        }
        let mut out = Vec::with_capacity(body.len() + 2);
        out.push((body.len() / 2) as u8);
        if padded {
            out.push(0);
        }
        out.extend_from_slice(&body);
        out
    }

    /// Compile the textual path syntax: `@<class>/<instance>/<attribute>`
    /// numeric form (terms default-typed in that order, JSON objects for any
    /// other segment kind), or dotted symbolic form.
    pub fn parse_str(path: &str) -> Result<Epath> {
        if let Some(numeric) = path.strip_prefix('@') {
            let defaults = ["class", "instance", "attribute", "element"];
            let mut segments = Vec::new();
            for (i, term) in numeric.split('/').enumerate() {
                if term.starts_with('{') {
                    let value: serde_json::Value = serde_json::from_str(term).map_err(|e| {
                        EnipError::Config(format!("bad JSON segment {}: {}", term, e))
                    })?;
                    segments.push(Segment::from_json(&value)?);
                    continue;
                }
                let v = parse_int(term)?;
                let seg = match defaults.get(i) {
                    Some(&"class") => Segment::Class(v as u16),
                    Some(&"instance") => Segment::Instance(v as u16),
                    Some(&"attribute") => Segment::Attribute(v as u16),
                    Some(&"element") => Segment::Element(v as u32),
                    _ => {
                        return Err(EnipError::Config(format!(
                            "no default segment type for term {} in {}",
                            i + 1,
                            path
                        )))
                    }
                };
                segments.push(seg);
            }
            Ok(Epath(segments))
        } else {
            Ok(Epath(
                path.split('.').map(|p| Segment::Symbolic(p.to_string())).collect(),
            ))
        }
    }
}

impl fmt::Display for Epath {
    /// `Tag.member[elem]` for symbolic paths, `@class/instance/...` for
    /// numeric ones.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbolic: Vec<&str> = self
            .0
            .iter()
            .filter_map(|s| match s {
                Segment::Symbolic(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        let element = self.0.iter().rev().find_map(|s| match s {
            Segment::Element(e) => Some(*e),
            _ => None,
        });
        if !symbolic.is_empty() {
            write!(f, "{}", symbolic.join("."))?;
        } else {
            let mut terms = Vec::new();
            for seg in &self.0 {
                match seg {
                    Segment::Class(v) => terms.push(format!("0x{:04X}", v)),
                    Segment::Instance(v) | Segment::Attribute(v) | Segment::Connection(v) => {
                        terms.push(format!("{}", v))
                    }
                    Segment::Element(_) => {}
                    other => terms.push(other.to_json().to_string()),
                }
            }
            write!(f, "@{}", terms.join("/"))?;
        }
        if let Some(e) = element {
            write!(f, "[{}]", e)?;
        }
        Ok(())
    }
}

/// Integer with optional base prefix; leading zeros do not imply octal.
pub fn parse_int(s: &str) -> Result<i64> {
    let t = s.trim();
    let (neg, t) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    let v = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else if let Some(oct) = t.strip_prefix("0o").or_else(|| t.strip_prefix("0O")) {
        i64::from_str_radix(oct, 8)
    } else if let Some(bin) = t.strip_prefix("0b").or_else(|| t.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2)
    } else {
        t.parse::<i64>()
    }
    .map_err(|e| EnipError::Config(format!("invalid integer {:?}: {}", s, e)))?;
    Ok(if neg { -v } else { v })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(path: &Epath, padded: bool) -> Epath {
        let wire = path.encode(padded);
        let mut cur = Cursor::new(&wire);
        let parsed = Epath::parse(&mut cur, padded).unwrap();
        assert_eq!(cur.remaining(), 0);
        parsed
    }

    #[test]
    fn test_logical_path_encoding() {
        let p = Epath::logical(0x6B, 1, Some(2));
        assert_eq!(p.encode(false), [3, 0x20, 0x6B, 0x24, 0x01, 0x30, 0x02]);
        assert_eq!(round_trip(&p, false), p);
    }

    #[test]
    fn test_minimum_width_chosen_on_reencode() {
        // A 16-bit form carrying a value that fits 8 bits re-encodes narrower
        let wide = [3u8, 0x21, 0x00, 0x6B, 0x00, 0x24, 0x01];
        let mut cur = Cursor::new(&wide);
        let parsed = Epath::parse(&mut cur, false).unwrap();
        assert_eq!(parsed, Epath(vec![Segment::Class(0x6B), Segment::Instance(1)]));
        assert_eq!(parsed.encode(false), [2, 0x20, 0x6B, 0x24, 0x01]);
    }

    #[test]
    fn test_wide_values_need_wide_forms() {
        let p = Epath(vec![Segment::Class(0x1FF), Segment::Element(0x0403_0201)]);
        let wire = p.encode(false);
        assert_eq!(
            wire,
            [5, 0x21, 0x00, 0xFF, 0x01, 0x2A, 0x00, 0x01, 0x02, 0x03, 0x04]
        );
        assert_eq!(round_trip(&p, false), p);
    }

    #[test]
    fn test_symbolic_odd_length_pads() {
        let p = Epath(vec![Segment::Symbolic("SCADA".into()), Segment::Element(12)]);
        let wire = p.encode(false);
        assert_eq!(wire, [5, 0x91, 5, b'S', b'C', b'A', b'D', b'A', 0x00, 0x28, 12]);
        assert_eq!(round_trip(&p, false), p);
    }

    #[test]
    fn test_route_path_pad_byte() {
        let p = Epath(vec![Segment::Port { port: 1, link: Link::Number(0) }]);
        assert_eq!(p.encode(true), [1, 0, 0x01, 0x00]);
        assert_eq!(round_trip(&p, true), p);
    }

    #[test]
    fn test_port_extended_and_address_links() {
        let ext = Epath(vec![Segment::Port { port: 0x123, link: Link::Number(5) }]);
        assert_eq!(ext.encode(false), [2, 0x0F, 0x23, 0x01, 0x05]);
        assert_eq!(round_trip(&ext, false), ext);

        let addr = Epath(vec![Segment::Port {
            port: 2,
            link: Link::Address("1.2.3.4".into()),
        }]);
        let wire = addr.encode(false);
        assert_eq!(wire[1], 0x12); // address-link flag | port
        assert_eq!(wire[2], 7); // link length
        assert_eq!(round_trip(&addr, false), addr);
    }

    #[test]
    fn test_parse_str_forms() {
        assert_eq!(
            Epath::parse_str("@0x1FF/1/0x1A").unwrap(),
            Epath(vec![Segment::Class(0x1FF), Segment::Instance(1), Segment::Attribute(26)])
        );
        assert_eq!(
            Epath::parse_str("Motor.Velocity").unwrap(),
            Epath(vec![
                Segment::Symbolic("Motor".into()),
                Segment::Symbolic("Velocity".into())
            ])
        );
        assert_eq!(
            Epath::parse_str("@0x04/5/{\"connection\":100}").unwrap(),
            Epath(vec![
                Segment::Class(4),
                Segment::Instance(5),
                Segment::Connection(100)
            ])
        );
    }

    #[test]
    fn test_parse_int_bases() {
        assert_eq!(parse_int("26").unwrap(), 26);
        assert_eq!(parse_int("0x1A").unwrap(), 26);
        assert_eq!(parse_int("0o32").unwrap(), 26);
        assert_eq!(parse_int("0b11010").unwrap(), 26);
        assert_eq!(parse_int("012").unwrap(), 12); // leading zero is not octal
    }
}
