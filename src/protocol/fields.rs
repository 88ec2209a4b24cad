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

//! Helpers to move between typed composite structures and their described-list
//! wire form.

use bytes::Bytes;

use super::Value;
use crate::{AppError, AppResult};

pub type FieldMap = Vec<(Value, Value)>;

/// Sequential reader over the fields of a described list. Missing trailing
/// fields read as null.
pub(crate) struct FieldReader {
    name: &'static str,
    items: std::vec::IntoIter<Value>,
}

impl FieldReader {
    pub fn new(value: Value, descriptor: u64, name: &'static str) -> AppResult<FieldReader> {
        match value {
            Value::Described(found, body) => {
                let code = match *found {
                    Value::Ulong(code) => code,
                    other => {
                        return Err(AppError::MalformedProtocol(format!(
                            "{}: unexpected descriptor {:?}",
                            name, other
                        )))
                    }
                };
                if code != descriptor {
                    return Err(AppError::MalformedProtocol(format!(
                        "{}: expected descriptor {:#x}, found {:#x}",
                        name, descriptor, code
                    )));
                }
                match *body {
                    Value::List(items) => Ok(FieldReader {
                        name,
                        items: items.into_iter(),
                    }),
                    other => Err(AppError::MalformedProtocol(format!(
                        "{}: body is not a list: {:?}",
                        name, other
                    ))),
                }
            }
            other => Err(AppError::MalformedProtocol(format!(
                "{}: not a described value: {:?}",
                name, other
            ))),
        }
    }

    pub fn next_value(&mut self) -> Value {
        self.items.next().unwrap_or(Value::Null)
    }

    fn mismatch<T>(&self, field: &str, found: &Value) -> AppResult<T> {
        Err(AppError::MalformedProtocol(format!(
            "{}.{}: unexpected value {:?}",
            self.name, field, found
        )))
    }

    fn missing<T>(&self, field: &str) -> AppResult<T> {
        Err(AppError::MalformedProtocol(format!(
            "{}.{} is mandatory",
            self.name, field
        )))
    }

    pub fn opt_u8(&mut self, field: &str) -> AppResult<Option<u8>> {
        match self.next_value() {
            Value::Null => Ok(None),
            Value::Ubyte(v) => Ok(Some(v)),
            other => self.mismatch(field, &other),
        }
    }

    pub fn opt_u16(&mut self, field: &str) -> AppResult<Option<u16>> {
        match self.next_value() {
            Value::Null => Ok(None),
            Value::Ushort(v) => Ok(Some(v)),
            other => self.mismatch(field, &other),
        }
    }

    pub fn opt_u32(&mut self, field: &str) -> AppResult<Option<u32>> {
        match self.next_value() {
            Value::Null => Ok(None),
            Value::Uint(v) => Ok(Some(v)),
            other => self.mismatch(field, &other),
        }
    }

    pub fn req_u32(&mut self, field: &str) -> AppResult<u32> {
        match self.opt_u32(field)? {
            Some(v) => Ok(v),
            None => self.missing(field),
        }
    }

    pub fn opt_u64(&mut self, field: &str) -> AppResult<Option<u64>> {
        match self.next_value() {
            Value::Null => Ok(None),
            Value::Ulong(v) => Ok(Some(v)),
            other => self.mismatch(field, &other),
        }
    }

    pub fn opt_bool(&mut self, field: &str) -> AppResult<Option<bool>> {
        match self.next_value() {
            Value::Null => Ok(None),
            Value::Bool(v) => Ok(Some(v)),
            other => self.mismatch(field, &other),
        }
    }

    pub fn bool_or(&mut self, field: &str, default: bool) -> AppResult<bool> {
        Ok(self.opt_bool(field)?.unwrap_or(default))
    }

    /// string or symbol
    pub fn opt_string(&mut self, field: &str) -> AppResult<Option<String>> {
        match self.next_value() {
            Value::Null => Ok(None),
            Value::String(v) | Value::Symbol(v) => Ok(Some(v)),
            other => self.mismatch(field, &other),
        }
    }

    pub fn req_string(&mut self, field: &str) -> AppResult<String> {
        match self.opt_string(field)? {
            Some(v) => Ok(v),
            None => self.missing(field),
        }
    }

    /// A multiple symbol field: either a single symbol or an array of them.
    pub fn opt_symbols(&mut self, field: &str) -> AppResult<Option<Vec<String>>> {
        match self.next_value() {
            Value::Null => Ok(None),
            Value::Symbol(v) => Ok(Some(vec![v])),
            Value::Array(items) => {
                let mut symbols = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Symbol(v) => symbols.push(v),
                        other => return self.mismatch(field, &other),
                    }
                }
                Ok(Some(symbols))
            }
            other => self.mismatch(field, &other),
        }
    }

    pub fn opt_map(&mut self, field: &str) -> AppResult<Option<FieldMap>> {
        match self.next_value() {
            Value::Null => Ok(None),
            Value::Map(v) => Ok(Some(v)),
            other => self.mismatch(field, &other),
        }
    }

    pub fn opt_binary(&mut self, field: &str) -> AppResult<Option<Bytes>> {
        match self.next_value() {
            Value::Null => Ok(None),
            Value::Binary(v) => Ok(Some(v)),
            other => self.mismatch(field, &other),
        }
    }

    pub fn opt_value(&mut self) -> Option<Value> {
        match self.next_value() {
            Value::Null => None,
            other => Some(other),
        }
    }
}

/// Builds the list body of a described value, dropping trailing nulls.
#[derive(Default)]
pub(crate) struct FieldWriter {
    items: Vec<Value>,
}

impl FieldWriter {
    pub fn new() -> FieldWriter {
        FieldWriter::default()
    }

    pub fn push(mut self, value: Value) -> FieldWriter {
        self.items.push(value);
        self
    }

    pub fn push_opt<T, F>(self, value: Option<T>, to_value: F) -> FieldWriter
    where
        F: FnOnce(T) -> Value,
    {
        self.push(value.map(to_value).unwrap_or(Value::Null))
    }

    /// `false` is the default of every boolean field and is written as null.
    pub fn push_flag(self, value: bool) -> FieldWriter {
        self.push(if value { Value::Bool(true) } else { Value::Null })
    }

    pub fn push_symbols(self, value: Option<&Vec<String>>) -> FieldWriter {
        self.push_opt(value, |s| Value::symbol_array(s.iter().cloned()))
    }

    pub fn finish(mut self, descriptor: u64) -> Value {
        while matches!(self.items.last(), Some(Value::Null)) {
            self.items.pop();
        }
        Value::described(descriptor, Value::List(self.items))
    }
}
