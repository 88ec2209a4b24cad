// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::{AppError, AppResult};

/// AMQP 1.0 type constructors.
mod code {
    pub const DESCRIBED: u8 = 0x00;
    pub const NULL: u8 = 0x40;
    pub const TRUE: u8 = 0x41;
    pub const FALSE: u8 = 0x42;
    pub const UINT0: u8 = 0x43;
    pub const ULONG0: u8 = 0x44;
    pub const LIST0: u8 = 0x45;
    pub const UBYTE: u8 = 0x50;
    pub const BYTE: u8 = 0x51;
    pub const SMALL_UINT: u8 = 0x52;
    pub const SMALL_ULONG: u8 = 0x53;
    pub const SMALL_INT: u8 = 0x54;
    pub const SMALL_LONG: u8 = 0x55;
    pub const BOOLEAN: u8 = 0x56;
    pub const USHORT: u8 = 0x60;
    pub const SHORT: u8 = 0x61;
    pub const UINT: u8 = 0x70;
    pub const INT: u8 = 0x71;
    pub const FLOAT: u8 = 0x72;
    pub const CHAR: u8 = 0x73;
    pub const ULONG: u8 = 0x80;
    pub const LONG: u8 = 0x81;
    pub const DOUBLE: u8 = 0x82;
    pub const TIMESTAMP: u8 = 0x83;
    pub const UUID: u8 = 0x98;
    pub const VBIN8: u8 = 0xa0;
    pub const STR8: u8 = 0xa1;
    pub const SYM8: u8 = 0xa3;
    pub const VBIN32: u8 = 0xb0;
    pub const STR32: u8 = 0xb1;
    pub const SYM32: u8 = 0xb3;
    pub const LIST8: u8 = 0xc0;
    pub const MAP8: u8 = 0xc1;
    pub const LIST32: u8 = 0xd0;
    pub const MAP32: u8 = 0xd1;
    pub const ARRAY8: u8 = 0xe0;
    pub const ARRAY32: u8 = 0xf0;
}

/// A decoded AMQP value.
///
/// Encoding always picks the most compact constructor for the value, decoding
/// accepts every width. Array elements must all be of the same variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    /// milliseconds since the unix epoch
    Timestamp(i64),
    Uuid(Uuid),
    Binary(Bytes),
    String(String),
    Symbol(String),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Array(Vec<Value>),
    Described(Box<Value>, Box<Value>),
}

impl Value {
    pub fn described(descriptor: u64, value: Value) -> Value {
        Value::Described(Box::new(Value::Ulong(descriptor)), Box::new(value))
    }

    pub fn symbol_array<I, S>(symbols: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Array(symbols.into_iter().map(|s| Value::Symbol(s.into())).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The numeric descriptor of a described value, if any.
    pub fn descriptor_code(&self) -> Option<u64> {
        match self {
            Value::Described(descriptor, _) => match descriptor.as_ref() {
                Value::Ulong(code) => Some(*code),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn encode(&self, writer: &mut BytesMut) {
        match self {
            Value::Null => writer.put_u8(code::NULL),
            Value::Bool(true) => writer.put_u8(code::TRUE),
            Value::Bool(false) => writer.put_u8(code::FALSE),
            Value::Ubyte(v) => {
                writer.put_u8(code::UBYTE);
                writer.put_u8(*v);
            }
            Value::Ushort(v) => {
                writer.put_u8(code::USHORT);
                writer.put_u16(*v);
            }
            Value::Uint(0) => writer.put_u8(code::UINT0),
            Value::Uint(v) if *v < 256 => {
                writer.put_u8(code::SMALL_UINT);
                writer.put_u8(*v as u8);
            }
            Value::Uint(v) => {
                writer.put_u8(code::UINT);
                writer.put_u32(*v);
            }
            Value::Ulong(0) => writer.put_u8(code::ULONG0),
            Value::Ulong(v) if *v < 256 => {
                writer.put_u8(code::SMALL_ULONG);
                writer.put_u8(*v as u8);
            }
            Value::Ulong(v) => {
                writer.put_u8(code::ULONG);
                writer.put_u64(*v);
            }
            Value::Byte(v) => {
                writer.put_u8(code::BYTE);
                writer.put_i8(*v);
            }
            Value::Short(v) => {
                writer.put_u8(code::SHORT);
                writer.put_i16(*v);
            }
            Value::Int(v) if i8::try_from(*v).is_ok() => {
                writer.put_u8(code::SMALL_INT);
                writer.put_i8(*v as i8);
            }
            Value::Int(v) => {
                writer.put_u8(code::INT);
                writer.put_i32(*v);
            }
            Value::Long(v) if i8::try_from(*v).is_ok() => {
                writer.put_u8(code::SMALL_LONG);
                writer.put_i8(*v as i8);
            }
            Value::Long(v) => {
                writer.put_u8(code::LONG);
                writer.put_i64(*v);
            }
            Value::Float(v) => {
                writer.put_u8(code::FLOAT);
                writer.put_f32(*v);
            }
            Value::Double(v) => {
                writer.put_u8(code::DOUBLE);
                writer.put_f64(*v);
            }
            Value::Char(v) => {
                writer.put_u8(code::CHAR);
                writer.put_u32(*v as u32);
            }
            Value::Timestamp(v) => {
                writer.put_u8(code::TIMESTAMP);
                writer.put_i64(*v);
            }
            Value::Uuid(v) => {
                writer.put_u8(code::UUID);
                writer.put_slice(v.as_bytes());
            }
            Value::Binary(v) => put_variable(writer, code::VBIN8, code::VBIN32, v),
            Value::String(v) => put_variable(writer, code::STR8, code::STR32, v.as_bytes()),
            Value::Symbol(v) => put_variable(writer, code::SYM8, code::SYM32, v.as_bytes()),
            Value::List(items) if items.is_empty() => writer.put_u8(code::LIST0),
            Value::List(items) => {
                let mut body = BytesMut::new();
                for item in items {
                    item.encode(&mut body);
                }
                put_compound(writer, code::LIST8, code::LIST32, items.len(), &body);
            }
            Value::Map(pairs) => {
                let mut body = BytesMut::new();
                for (key, value) in pairs {
                    key.encode(&mut body);
                    value.encode(&mut body);
                }
                put_compound(writer, code::MAP8, code::MAP32, pairs.len() * 2, &body);
            }
            Value::Array(items) => {
                let mut body = BytesMut::new();
                match items.first() {
                    Some(first) => {
                        debug_assert!(items
                            .iter()
                            .all(|i| std::mem::discriminant(i) == std::mem::discriminant(first)));
                        put_element_constructor(first, &mut body);
                        for item in items {
                            put_element_body(item, &mut body);
                        }
                    }
                    None => body.put_u8(code::NULL),
                }
                put_compound(writer, code::ARRAY8, code::ARRAY32, items.len(), &body);
            }
            Value::Described(descriptor, value) => {
                writer.put_u8(code::DESCRIBED);
                descriptor.encode(writer);
                value.encode(writer);
            }
        }
    }

    pub fn decode(buffer: &mut Bytes) -> AppResult<Value> {
        let constructor = read_u8(buffer)?;
        if constructor == code::DESCRIBED {
            let descriptor = Value::decode(buffer)?;
            let value = Value::decode(buffer)?;
            return Ok(Value::Described(Box::new(descriptor), Box::new(value)));
        }
        decode_body(constructor, buffer)
    }

    pub fn encoded_size(&self) -> usize {
        let mut buffer = BytesMut::new();
        self.encode(&mut buffer);
        buffer.len()
    }
}

fn put_variable(writer: &mut BytesMut, small: u8, large: u8, data: &[u8]) {
    if data.len() < 256 {
        writer.put_u8(small);
        writer.put_u8(data.len() as u8);
    } else {
        writer.put_u8(large);
        writer.put_u32(data.len() as u32);
    }
    writer.put_slice(data);
}

/// `size` counts the count field plus the body, so an 8-bit compound holds at
/// most 254 body bytes.
fn put_compound(writer: &mut BytesMut, small: u8, large: u8, count: usize, body: &[u8]) {
    if body.len() < 255 && count < 256 {
        writer.put_u8(small);
        writer.put_u8((body.len() + 1) as u8);
        writer.put_u8(count as u8);
    } else {
        writer.put_u8(large);
        writer.put_u32((body.len() + 4) as u32);
        writer.put_u32(count as u32);
    }
    writer.put_slice(body);
}

fn put_element_constructor(value: &Value, writer: &mut BytesMut) {
    let constructor = match value {
        Value::Null => code::NULL,
        Value::Bool(_) => code::BOOLEAN,
        Value::Ubyte(_) => code::UBYTE,
        Value::Ushort(_) => code::USHORT,
        Value::Uint(_) => code::UINT,
        Value::Ulong(_) => code::ULONG,
        Value::Byte(_) => code::BYTE,
        Value::Short(_) => code::SHORT,
        Value::Int(_) => code::INT,
        Value::Long(_) => code::LONG,
        Value::Float(_) => code::FLOAT,
        Value::Double(_) => code::DOUBLE,
        Value::Char(_) => code::CHAR,
        Value::Timestamp(_) => code::TIMESTAMP,
        Value::Uuid(_) => code::UUID,
        Value::Binary(_) => code::VBIN32,
        Value::String(_) => code::STR32,
        Value::Symbol(_) => code::SYM32,
        Value::List(_) => code::LIST32,
        Value::Map(_) => code::MAP32,
        Value::Array(_) => code::ARRAY32,
        Value::Described(descriptor, inner) => {
            writer.put_u8(code::DESCRIBED);
            descriptor.encode(writer);
            put_element_constructor(inner, writer);
            return;
        }
    };
    writer.put_u8(constructor);
}

/// Writes the body matching the wide constructor chosen by `put_element_constructor`.
fn put_element_body(value: &Value, writer: &mut BytesMut) {
    match value {
        Value::Null => {}
        Value::Bool(v) => writer.put_u8(u8::from(*v)),
        Value::Ubyte(v) => writer.put_u8(*v),
        Value::Ushort(v) => writer.put_u16(*v),
        Value::Uint(v) => writer.put_u32(*v),
        Value::Ulong(v) => writer.put_u64(*v),
        Value::Byte(v) => writer.put_i8(*v),
        Value::Short(v) => writer.put_i16(*v),
        Value::Int(v) => writer.put_i32(*v),
        Value::Long(v) => writer.put_i64(*v),
        Value::Float(v) => writer.put_f32(*v),
        Value::Double(v) => writer.put_f64(*v),
        Value::Char(v) => writer.put_u32(*v as u32),
        Value::Timestamp(v) => writer.put_i64(*v),
        Value::Uuid(v) => writer.put_slice(v.as_bytes()),
        Value::Binary(v) => {
            writer.put_u32(v.len() as u32);
            writer.put_slice(v);
        }
        Value::String(v) | Value::Symbol(v) => {
            writer.put_u32(v.len() as u32);
            writer.put_slice(v.as_bytes());
        }
        Value::List(items) => {
            let mut body = BytesMut::new();
            for item in items {
                item.encode(&mut body);
            }
            writer.put_u32((body.len() + 4) as u32);
            writer.put_u32(items.len() as u32);
            writer.put_slice(&body);
        }
        Value::Map(pairs) => {
            let mut body = BytesMut::new();
            for (key, value) in pairs {
                key.encode(&mut body);
                value.encode(&mut body);
            }
            writer.put_u32((body.len() + 4) as u32);
            writer.put_u32((pairs.len() * 2) as u32);
            writer.put_slice(&body);
        }
        Value::Array(items) => {
            let mut body = BytesMut::new();
            match items.first() {
                Some(first) => {
                    put_element_constructor(first, &mut body);
                    for item in items {
                        put_element_body(item, &mut body);
                    }
                }
                None => body.put_u8(code::NULL),
            }
            writer.put_u32((body.len() + 4) as u32);
            writer.put_u32(items.len() as u32);
            writer.put_slice(&body);
        }
        Value::Described(_, inner) => put_element_body(inner, writer),
    }
}

fn ensure(buffer: &Bytes, needed: usize, what: &str) -> AppResult<()> {
    if buffer.remaining() < needed {
        return Err(AppError::MalformedProtocol(format!(
            "can not read a {}, need {} bytes but {} left",
            what,
            needed,
            buffer.remaining()
        )));
    }
    Ok(())
}

fn read_u8(buffer: &mut Bytes) -> AppResult<u8> {
    ensure(buffer, 1, "u8")?;
    Ok(buffer.get_u8())
}

fn read_u32(buffer: &mut Bytes) -> AppResult<u32> {
    ensure(buffer, 4, "u32")?;
    Ok(buffer.get_u32())
}

fn read_slice(buffer: &mut Bytes, len: usize, what: &str) -> AppResult<Bytes> {
    ensure(buffer, len, what)?;
    Ok(buffer.split_to(len))
}

fn read_utf8(buffer: &mut Bytes, len: usize, what: &str) -> AppResult<String> {
    let raw = read_slice(buffer, len, what)?;
    String::from_utf8(raw.to_vec()).map_err(|e| AppError::MalformedProtocol(e.to_string()))
}

/// Reads the size and count of a compound and returns (count, body).
fn read_compound(buffer: &mut Bytes, wide: bool, what: &str) -> AppResult<(usize, Bytes)> {
    let (size, count_width) = if wide {
        (read_u32(buffer)? as usize, 4)
    } else {
        (read_u8(buffer)? as usize, 1)
    };
    if size < count_width {
        return Err(AppError::MalformedProtocol(format!(
            "{} size {} smaller than its count field",
            what, size
        )));
    }
    let mut body = read_slice(buffer, size, what)?;
    let count = if wide {
        body.get_u32() as usize
    } else {
        body.get_u8() as usize
    };
    Ok((count, body))
}

/// Array elements written with no body bytes at all. Their count is not
/// bounded by the encoded size, so it is capped separately.
const MAX_EMPTY_ELEMENTS: usize = 64 * 1024;

fn is_zero_width(constructor: u8) -> bool {
    matches!(
        constructor,
        code::NULL | code::TRUE | code::FALSE | code::UINT0 | code::ULONG0 | code::LIST0
    )
}

/// Rejects element counts the remaining bytes cannot hold.
fn check_count(count: usize, body: &Bytes, zero_width: bool, what: &str) -> AppResult<()> {
    let limit = if zero_width {
        MAX_EMPTY_ELEMENTS
    } else {
        body.remaining()
    };
    if count > limit {
        return Err(AppError::MalformedProtocol(format!(
            "{} claims {} elements, at most {} fit",
            what, count, limit
        )));
    }
    Ok(())
}

fn decode_body(constructor: u8, buffer: &mut Bytes) -> AppResult<Value> {
    let value = match constructor {
        code::NULL => Value::Null,
        code::TRUE => Value::Bool(true),
        code::FALSE => Value::Bool(false),
        code::BOOLEAN => Value::Bool(read_u8(buffer)? != 0),
        code::UBYTE => Value::Ubyte(read_u8(buffer)?),
        code::USHORT => {
            ensure(buffer, 2, "ushort")?;
            Value::Ushort(buffer.get_u16())
        }
        code::UINT0 => Value::Uint(0),
        code::SMALL_UINT => Value::Uint(read_u8(buffer)? as u32),
        code::UINT => Value::Uint(read_u32(buffer)?),
        code::ULONG0 => Value::Ulong(0),
        code::SMALL_ULONG => Value::Ulong(read_u8(buffer)? as u64),
        code::ULONG => {
            ensure(buffer, 8, "ulong")?;
            Value::Ulong(buffer.get_u64())
        }
        code::BYTE => {
            ensure(buffer, 1, "byte")?;
            Value::Byte(buffer.get_i8())
        }
        code::SHORT => {
            ensure(buffer, 2, "short")?;
            Value::Short(buffer.get_i16())
        }
        code::SMALL_INT => {
            ensure(buffer, 1, "smallint")?;
            Value::Int(buffer.get_i8() as i32)
        }
        code::INT => {
            ensure(buffer, 4, "int")?;
            Value::Int(buffer.get_i32())
        }
        code::SMALL_LONG => {
            ensure(buffer, 1, "smalllong")?;
            Value::Long(buffer.get_i8() as i64)
        }
        code::LONG => {
            ensure(buffer, 8, "long")?;
            Value::Long(buffer.get_i64())
        }
        code::FLOAT => {
            ensure(buffer, 4, "float")?;
            Value::Float(buffer.get_f32())
        }
        code::DOUBLE => {
            ensure(buffer, 8, "double")?;
            Value::Double(buffer.get_f64())
        }
        code::CHAR => {
            let raw = read_u32(buffer)?;
            Value::Char(char::from_u32(raw).ok_or_else(|| {
                AppError::MalformedProtocol(format!("invalid char code point {:#x}", raw))
            })?)
        }
        code::TIMESTAMP => {
            ensure(buffer, 8, "timestamp")?;
            Value::Timestamp(buffer.get_i64())
        }
        code::UUID => {
            let raw = read_slice(buffer, 16, "uuid")?;
            Value::Uuid(Uuid::from_slice(&raw).map_err(|e| AppError::MalformedProtocol(e.to_string()))?)
        }
        code::VBIN8 => {
            let len = read_u8(buffer)? as usize;
            Value::Binary(read_slice(buffer, len, "vbin8")?)
        }
        code::VBIN32 => {
            let len = read_u32(buffer)? as usize;
            Value::Binary(read_slice(buffer, len, "vbin32")?)
        }
        code::STR8 => {
            let len = read_u8(buffer)? as usize;
            Value::String(read_utf8(buffer, len, "str8")?)
        }
        code::STR32 => {
            let len = read_u32(buffer)? as usize;
            Value::String(read_utf8(buffer, len, "str32")?)
        }
        code::SYM8 => {
            let len = read_u8(buffer)? as usize;
            Value::Symbol(read_utf8(buffer, len, "sym8")?)
        }
        code::SYM32 => {
            let len = read_u32(buffer)? as usize;
            Value::Symbol(read_utf8(buffer, len, "sym32")?)
        }
        code::LIST0 => Value::List(Vec::new()),
        code::LIST8 | code::LIST32 => {
            let (count, mut body) = read_compound(buffer, constructor == code::LIST32, "list")?;
            check_count(count, &body, false, "list")?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(Value::decode(&mut body)?);
            }
            Value::List(items)
        }
        code::MAP8 | code::MAP32 => {
            let (count, mut body) = read_compound(buffer, constructor == code::MAP32, "map")?;
            check_count(count, &body, false, "map")?;
            if count % 2 != 0 {
                return Err(AppError::MalformedProtocol(format!(
                    "map with odd element count {}",
                    count
                )));
            }
            let mut pairs = Vec::with_capacity(count / 2);
            for _ in 0..count / 2 {
                let key = Value::decode(&mut body)?;
                let value = Value::decode(&mut body)?;
                pairs.push((key, value));
            }
            Value::Map(pairs)
        }
        code::ARRAY8 | code::ARRAY32 => {
            let (count, mut body) = read_compound(buffer, constructor == code::ARRAY32, "array")?;
            let mut element_constructor = read_u8(&mut body)?;
            let mut descriptor = None;
            if element_constructor == code::DESCRIBED {
                descriptor = Some(Value::decode(&mut body)?);
                element_constructor = read_u8(&mut body)?;
            }
            check_count(count, &body, is_zero_width(element_constructor), "array")?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                let item = decode_body(element_constructor, &mut body)?;
                items.push(match &descriptor {
                    Some(d) => Value::Described(Box::new(d.clone()), Box::new(item)),
                    None => item,
                });
            }
            Value::Array(items)
        }
        other => {
            return Err(AppError::MalformedProtocol(format!(
                "unsupported type constructor {:#04x}",
                other
            )))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn encode(value: &Value) -> Vec<u8> {
        let mut buffer = BytesMut::new();
        value.encode(&mut buffer);
        buffer.to_vec()
    }

    #[rstest]
    #[case(Value::Null, vec![0x40])]
    #[case(Value::Bool(true), vec![0x41])]
    #[case(Value::Uint(0), vec![0x43])]
    #[case(Value::Uint(7), vec![0x52, 0x07])]
    #[case(Value::Uint(65536), vec![0x70, 0x00, 0x01, 0x00, 0x00])]
    #[case(Value::Ulong(0x11), vec![0x53, 0x11])]
    #[case(Value::Int(-1), vec![0x54, 0xff])]
    #[case(Value::Symbol("ab".into()), vec![0xa3, 0x02, b'a', b'b'])]
    #[case(Value::List(vec![]), vec![0x45])]
    #[case(Value::List(vec![Value::Null, Value::Uint(1)]), vec![0xc0, 0x04, 0x02, 0x40, 0x52, 0x01])]
    fn test_compact_encoding(#[case] value: Value, #[case] expected: Vec<u8>) {
        assert_eq!(encode(&value), expected);
        let mut bytes = Bytes::from(expected);
        assert_eq!(Value::decode(&mut bytes).unwrap(), value);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_wide_forms_decode() {
        // uint, ulong and str32 written by peers that do not compact
        let mut bytes = Bytes::from_static(&[
            0x70, 0x00, 0x00, 0x00, 0x05, 0x80, 0, 0, 0, 0, 0, 0, 0, 0x09, 0xb1, 0, 0, 0, 1, b'x',
        ]);
        assert_eq!(Value::decode(&mut bytes).unwrap(), Value::Uint(5));
        assert_eq!(Value::decode(&mut bytes).unwrap(), Value::Ulong(9));
        assert_eq!(Value::decode(&mut bytes).unwrap(), Value::String("x".into()));
    }

    #[test]
    fn test_nested_compound_values() {
        let big = Value::Binary(Bytes::from(vec![7u8; 300]));
        let value = Value::described(
            0x70,
            Value::List(vec![
                Value::Map(vec![
                    (Value::Symbol("k".into()), big.clone()),
                    (Value::String("n".into()), Value::Long(-40000)),
                ]),
                Value::symbol_array(["a", "b"]),
                Value::Array(vec![Value::Uint(1), Value::Uint(300)]),
                Value::Timestamp(1_700_000_000_000),
                Value::Uuid(Uuid::nil()),
                Value::Char('λ'),
            ]),
        );
        let encoded = encode(&value);
        // the 300 byte binary forces the 32-bit list and map forms
        assert_eq!(encoded[0], 0x00);
        let mut bytes = Bytes::from(encoded);
        let decoded = Value::decode(&mut bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(decoded.descriptor_code(), Some(0x70));
    }

    #[test]
    fn test_described_array() {
        let element = |n| Value::described(0x24, Value::List(vec![Value::Uint(n)]));
        let value = Value::Array(vec![element(1), element(2)]);
        let mut bytes = Bytes::from(encode(&value));
        assert_eq!(Value::decode(&mut bytes).unwrap(), value);
    }

    #[test]
    fn test_truncated_input() {
        let mut bytes = Bytes::from_static(&[0x70, 0x00, 0x01]);
        assert!(matches!(
            Value::decode(&mut bytes),
            Err(AppError::MalformedProtocol(_))
        ));

        // list8 claiming more bytes than present
        let mut bytes = Bytes::from_static(&[0xc0, 0x09, 0x01, 0x40]);
        assert!(Value::decode(&mut bytes).is_err());
    }

    #[test]
    fn test_unsupported_constructor() {
        // decimal32
        let mut bytes = Bytes::from_static(&[0x74, 0, 0, 0, 0]);
        let err = Value::decode(&mut bytes).unwrap_err();
        assert!(err.to_string().contains("0x74"));
    }

    #[rstest]
    // array32 of 2^26 nulls in a 5 byte body
    #[case(&[0xf0, 0, 0, 0, 5, 0x04, 0, 0, 0, 0x40])]
    // array32 of 2^26 uints with no element bytes
    #[case(&[0xf0, 0, 0, 0, 5, 0x04, 0, 0, 0, 0x70])]
    // list8 of 255 elements in a 2 byte body
    #[case(&[0xc0, 0x02, 0xff, 0x40])]
    // map32 of 2^24 entries in a 5 byte body
    #[case(&[0xd1, 0, 0, 0, 5, 0x01, 0, 0, 0, 0x40])]
    fn test_element_count_beyond_body(#[case] wire: &'static [u8]) {
        let mut bytes = Bytes::from_static(wire);
        assert!(matches!(
            Value::decode(&mut bytes),
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn test_small_array_of_nulls_decodes() {
        let mut bytes = Bytes::from_static(&[0xe0, 0x02, 0x03, 0x40]);
        assert_eq!(
            Value::decode(&mut bytes).unwrap(),
            Value::Array(vec![Value::Null, Value::Null, Value::Null])
        );
    }
}
