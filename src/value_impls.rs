// Copyright (c) 2015-2016 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Serialize/Deserialize implementations for `value::Value`, so that decoded
//! graphs can be transcoded to and from other serde formats.
//!
//! Only trees can be transcoded: a container that contains itself is
//! reported as an error, as is any opaque object.  Globals serialize as
//! their dotted name.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{self, Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::value::{Value, HashableValue};

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let active = RefCell::new(Vec::new());
        Guarded { value: self, active: &active }.serialize(serializer)
    }
}

/// A value together with the containers currently being serialized.
struct Guarded<'a> {
    value: &'a Value,
    active: &'a RefCell<Vec<usize>>,
}

impl<'a> Guarded<'a> {
    fn child<'b>(&'b self, value: &'b Value) -> Guarded<'b> {
        Guarded { value, active: self.active }
    }
}

impl<'a> Serialize for Guarded<'a> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if let Some(addr) = self.value.address() {
            if self.active.borrow().contains(&addr) {
                return Err(ser::Error::custom(format!(
                    "recursive {} cannot be serialized", self.value.type_name())));
            }
            self.active.borrow_mut().push(addr);
        }
        let result = match *self.value {
            Value::None => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(b),
            Value::I64(i) => serializer.serialize_i64(i),
            Value::Int(ref i) => serialize_bigint(i, serializer),
            Value::F64(f) => serializer.serialize_f64(f),
            Value::Bytes(ref b) => serializer.serialize_bytes(b),
            Value::String(ref s) => serializer.serialize_str(s),
            Value::Global(ref g) => serializer.collect_str(g),
            Value::List(ref l) => {
                let items = l.borrow();
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(&self.child(item))?;
                }
                seq.end()
            }
            Value::Tuple(ref t) => {
                let mut seq = serializer.serialize_seq(Some(t.len()))?;
                for item in t.iter() {
                    seq.serialize_element(&self.child(item))?;
                }
                seq.end()
            }
            Value::Set(ref s) => serializer.collect_seq(s.borrow().iter()),
            Value::FrozenSet(ref s) => serializer.collect_seq(s.iter()),
            Value::Dict(ref d) => {
                let items = d.borrow();
                let mut map = serializer.serialize_map(Some(items.len()))?;
                for (key, value) in items.iter() {
                    map.serialize_entry(key, &self.child(value))?;
                }
                map.end()
            }
            Value::Object(ref o) => Err(ser::Error::custom(format!(
                "{} object cannot be serialized", o.type_name()))),
        };
        if self.value.address().is_some() {
            self.active.borrow_mut().pop();
        }
        result
    }
}

impl Serialize for HashableValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            HashableValue::None => serializer.serialize_unit(),
            HashableValue::Bool(b) => serializer.serialize_bool(b),
            HashableValue::I64(i) => serializer.serialize_i64(i),
            HashableValue::Int(ref i) => serialize_bigint(i, serializer),
            HashableValue::F64(f) => serializer.serialize_f64(f),
            HashableValue::Bytes(ref b) => serializer.serialize_bytes(b),
            HashableValue::String(ref s) => serializer.serialize_str(s),
            HashableValue::Global(ref g) => serializer.collect_str(g),
            HashableValue::Tuple(ref t) => serializer.collect_seq(t.iter()),
            HashableValue::FrozenSet(ref s) => serializer.collect_seq(s.iter()),
        }
    }
}

fn serialize_bigint<S: Serializer>(i: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
    if let Some(i) = i.to_i64() {
        serializer.serialize_i64(i)
    } else if let Some(u) = i.to_u64() {
        serializer.serialize_u64(u)
    } else {
        Err(ser::Error::custom(format!("integer {} out of range", i)))
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("any value")
    }

    #[inline]
    fn visit_bool<E>(self, value: bool) -> Result<Value, E> {
        Ok(Value::Bool(value))
    }

    #[inline]
    fn visit_i64<E>(self, value: i64) -> Result<Value, E> {
        Ok(Value::I64(value))
    }

    #[inline]
    fn visit_u64<E>(self, value: u64) -> Result<Value, E> {
        if value < 0x8000_0000_0000_0000 {
            Ok(Value::I64(value as i64))
        } else {
            Ok(Value::Int(BigInt::from(value)))
        }
    }

    #[inline]
    fn visit_f64<E>(self, value: f64) -> Result<Value, E> {
        Ok(Value::F64(value))
    }

    #[inline]
    fn visit_str<E: de::Error>(self, value: &str) -> Result<Value, E> {
        self.visit_string(String::from(value))
    }

    #[inline]
    fn visit_string<E>(self, value: String) -> Result<Value, E> {
        Ok(Value::String(value))
    }

    #[inline]
    fn visit_bytes<E: de::Error>(self, value: &[u8]) -> Result<Value, E> {
        self.visit_byte_buf(value.to_vec())
    }

    #[inline]
    fn visit_byte_buf<E: de::Error>(self, value: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Bytes(value))
    }

    #[inline]
    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::None)
    }

    #[inline]
    fn visit_some<D: Deserializer<'de>>(self, deser: D) -> Result<Value, D::Error> {
        Deserialize::deserialize(deser)
    }

    #[inline]
    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::None)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut values = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(value) = seq.next_element()? {
            values.push(value);
        }
        Ok(Value::list(values))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut values = BTreeMap::new();
        while let Some((key, value)) = map.next_entry::<HashableValue, Value>()? {
            values.insert(key, value);
        }
        Ok(Value::dict(values))
    }
}

impl<'de> Deserialize<'de> for Value {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deser: D) -> Result<Value, D::Error> {
        deser.deserialize_any(ValueVisitor)
    }
}

struct HashableValueVisitor;

impl<'de> Visitor<'de> for HashableValueVisitor {
    type Value = HashableValue;

    fn expecting(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("a hashable value")
    }

    #[inline]
    fn visit_bool<E>(self, value: bool) -> Result<HashableValue, E> {
        Ok(HashableValue::Bool(value))
    }

    #[inline]
    fn visit_i64<E>(self, value: i64) -> Result<HashableValue, E> {
        Ok(HashableValue::I64(value))
    }

    #[inline]
    fn visit_u64<E>(self, value: u64) -> Result<HashableValue, E> {
        if value < 0x8000_0000_0000_0000 {
            Ok(HashableValue::I64(value as i64))
        } else {
            Ok(HashableValue::Int(BigInt::from(value)))
        }
    }

    #[inline]
    fn visit_f64<E>(self, value: f64) -> Result<HashableValue, E> {
        Ok(HashableValue::F64(value))
    }

    #[inline]
    fn visit_str<E: de::Error>(self, value: &str) -> Result<HashableValue, E> {
        self.visit_string(String::from(value))
    }

    #[inline]
    fn visit_string<E>(self, value: String) -> Result<HashableValue, E> {
        Ok(HashableValue::String(value))
    }

    #[inline]
    fn visit_bytes<E: de::Error>(self, value: &[u8]) -> Result<HashableValue, E> {
        Ok(HashableValue::Bytes(value.to_vec()))
    }

    #[inline]
    fn visit_none<E>(self) -> Result<HashableValue, E> {
        Ok(HashableValue::None)
    }

    #[inline]
    fn visit_some<D: Deserializer<'de>>(self, deser: D) -> Result<HashableValue, D::Error> {
        Deserialize::deserialize(deser)
    }

    #[inline]
    fn visit_unit<E>(self) -> Result<HashableValue, E> {
        Ok(HashableValue::None)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<HashableValue, A::Error> {
        let mut values = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(value) = seq.next_element()? {
            values.push(value);
        }
        Ok(HashableValue::Tuple(values))
    }
}

impl<'de> Deserialize<'de> for HashableValue {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deser: D) -> Result<HashableValue, D::Error> {
        deser.deserialize_any(HashableValueVisitor)
    }
}
