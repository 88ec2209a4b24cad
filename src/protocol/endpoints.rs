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

use super::constants::descriptor;
use super::fields::{FieldMap, FieldReader, FieldWriter};
use super::Value;
use crate::AppResult;

/// The terminus a receiving link pulls messages from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Source {
    pub address: Option<String>,
    pub durable: Option<u32>,
    pub expiry_policy: Option<String>,
    pub timeout: Option<u32>,
    pub dynamic: bool,
    pub dynamic_node_properties: Option<FieldMap>,
    pub distribution_mode: Option<String>,
    pub filter: Option<FieldMap>,
    pub default_outcome: Option<Value>,
    pub outcomes: Option<Vec<String>>,
    pub capabilities: Option<Vec<String>>,
}

impl Source {
    pub fn new<S: Into<String>>(address: S) -> Source {
        Source {
            address: Some(address.into()),
            ..Default::default()
        }
    }

    pub fn to_value(&self) -> Value {
        FieldWriter::new()
            .push_opt(self.address.clone(), Value::String)
            .push_opt(self.durable, Value::Uint)
            .push_opt(self.expiry_policy.clone(), Value::Symbol)
            .push_opt(self.timeout, Value::Uint)
            .push_flag(self.dynamic)
            .push_opt(self.dynamic_node_properties.clone(), Value::Map)
            .push_opt(self.distribution_mode.clone(), Value::Symbol)
            .push_opt(self.filter.clone(), Value::Map)
            .push_opt(self.default_outcome.clone(), |v| v)
            .push_symbols(self.outcomes.as_ref())
            .push_symbols(self.capabilities.as_ref())
            .finish(descriptor::SOURCE)
    }

    pub fn from_value(value: Value) -> AppResult<Source> {
        let mut fields = FieldReader::new(value, descriptor::SOURCE, "source")?;
        Ok(Source {
            address: fields.opt_string("address")?,
            durable: fields.opt_u32("durable")?,
            expiry_policy: fields.opt_string("expiry_policy")?,
            timeout: fields.opt_u32("timeout")?,
            dynamic: fields.bool_or("dynamic", false)?,
            dynamic_node_properties: fields.opt_map("dynamic_node_properties")?,
            distribution_mode: fields.opt_string("distribution_mode")?,
            filter: fields.opt_map("filter")?,
            default_outcome: fields.opt_value(),
            outcomes: fields.opt_symbols("outcomes")?,
            capabilities: fields.opt_symbols("capabilities")?,
        })
    }
}

/// The terminus a sending link delivers messages to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Target {
    pub address: Option<String>,
    pub durable: Option<u32>,
    pub expiry_policy: Option<String>,
    pub timeout: Option<u32>,
    pub dynamic: bool,
    pub dynamic_node_properties: Option<FieldMap>,
    pub capabilities: Option<Vec<String>>,
}

impl Target {
    pub fn new<S: Into<String>>(address: S) -> Target {
        Target {
            address: Some(address.into()),
            ..Default::default()
        }
    }

    pub fn to_value(&self) -> Value {
        FieldWriter::new()
            .push_opt(self.address.clone(), Value::String)
            .push_opt(self.durable, Value::Uint)
            .push_opt(self.expiry_policy.clone(), Value::Symbol)
            .push_opt(self.timeout, Value::Uint)
            .push_flag(self.dynamic)
            .push_opt(self.dynamic_node_properties.clone(), Value::Map)
            .push_symbols(self.capabilities.as_ref())
            .finish(descriptor::TARGET)
    }

    pub fn from_value(value: Value) -> AppResult<Target> {
        let mut fields = FieldReader::new(value, descriptor::TARGET, "target")?;
        Ok(Target {
            address: fields.opt_string("address")?,
            durable: fields.opt_u32("durable")?,
            expiry_policy: fields.opt_string("expiry_policy")?,
            timeout: fields.opt_u32("timeout")?,
            dynamic: fields.bool_or("dynamic", false)?,
            dynamic_node_properties: fields.opt_map("dynamic_node_properties")?,
            capabilities: fields.opt_symbols("capabilities")?,
        })
    }
}
