// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Constructor resolution.
//!
//! # Security
//!
//! A pickle stream names constructors and the arguments to call them with.
//! Decoding an untrusted stream therefore runs whatever constructors the
//! stream asks for.  Every name in a stream passes through one place,
//! the decoder's resolution step, which consults (in this order):
//!
//! 1. the built-in data constructors (`set`, `frozenset`, `bytes`,
//!    `bytearray`, `_codecs.encode`, `copyreg.__newobj__`), which only build
//!    plain values or defer to another resolved class;
//! 2. the `ResolvePolicy`, which may restrict names to an allow list;
//! 3. the caller's `Resolver`, if one is configured (its answer is final);
//! 4. otherwise, a generic constructor building `Instance` objects.
//!
//! Restricted deployments should use `ResolvePolicy::AllowList` and/or a
//! `Resolver` that only knows the types it expects.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::object::{Construct, Instance};
use crate::value::{Global, HashableValue, Value};

/// Something the decoder can call to build a value.
pub trait Constructor {
    /// Calls the constructor with positional arguments (REDUCE, and
    /// INST/OBJ with arguments).
    fn call(&self, args: Vec<Value>) -> Result<Value>;

    /// Creates a new, uninitialized instance (NEWOBJ, NEWOBJ_EX, and
    /// INST/OBJ without arguments).  By default, this is a call with the
    /// positional arguments; keyword arguments are refused.
    fn new_object(&self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
        if !kwargs.is_empty() {
            return Err(Error::Syntax(ErrorCode::InvalidValue(
                "constructor does not accept keyword arguments".into())));
        }
        self.call(args)
    }
}

impl<F> Constructor for F
    where F: Fn(Vec<Value>) -> Result<Value>
{
    fn call(&self, args: Vec<Value>) -> Result<Value> {
        self(args)
    }
}

/// Maps constructor references found in a stream to constructors.
pub trait Resolver {
    /// Returns the constructor for a global, or `None` to refuse it.
    fn resolve(&self, global: &Global) -> Option<Rc<dyn Constructor>>;
}

impl<F> Resolver for F
    where F: Fn(&Global) -> Option<Rc<dyn Constructor>>
{
    fn resolve(&self, global: &Global) -> Option<Rc<dyn Constructor>> {
        self(global)
    }
}

/// Which constructor references a decoder accepts.
#[derive(Clone, Debug)]
pub enum ResolvePolicy {
    /// Any global resolves.
    Unrestricted,
    /// Only the listed globals (and the built-in data constructors) resolve.
    AllowList(BTreeSet<Global>),
}

impl Default for ResolvePolicy {
    fn default() -> ResolvePolicy {
        ResolvePolicy::Unrestricted
    }
}

impl ResolvePolicy {
    /// Builds an allow list.
    pub fn allow<I: IntoIterator<Item=Global>>(globals: I) -> ResolvePolicy {
        ResolvePolicy::AllowList(globals.into_iter().collect())
    }

    pub fn allows(&self, global: &Global) -> bool {
        match *self {
            ResolvePolicy::Unrestricted => true,
            ResolvePolicy::AllowList(ref set) => set.contains(global),
        }
    }
}

/// Constructors the decoder implements itself.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Builtin {
    Set,
    FrozenSet,
    Bytes,
    ByteArray,
    CodecsEncode,
    NewObj,
}

impl Builtin {
    pub fn lookup(global: &Global) -> Option<Builtin> {
        match (&*global.module, &*global.name) {
            ("builtins", name) | ("__builtin__", name) => match name {
                "set" => Some(Builtin::Set),
                "frozenset" => Some(Builtin::FrozenSet),
                "bytes" => Some(Builtin::Bytes),
                "bytearray" => Some(Builtin::ByteArray),
                _ => None,
            },
            ("_codecs", "encode") => Some(Builtin::CodecsEncode),
            ("copyreg", "__newobj__") | ("copy_reg", "__newobj__") => Some(Builtin::NewObj),
            _ => None,
        }
    }

    /// Module holding the builtins in a given protocol.
    pub fn builtins_module(proto: u8) -> &'static str {
        if proto >= 3 { "builtins" } else { "__builtin__" }
    }

    /// Calls a builtin other than `NewObj`, which needs the decoder's help.
    pub fn call(self, mut args: Vec<Value>) -> Result<Value> {
        match self {
            Builtin::Set => Ok(Value::set(collect_hashable(args.pop())?)),
            Builtin::FrozenSet => Ok(Value::frozenset(collect_hashable(args.pop())?)),
            Builtin::Bytes | Builtin::ByteArray => {
                if args.len() == 2 {
                    return Builtin::CodecsEncode.call(args);
                }
                match args.pop() {
                    None => Ok(Value::Bytes(Vec::new())),
                    Some(bytes @ Value::Bytes(_)) => Ok(bytes),
                    Some(Value::List(ref items)) => items.borrow().iter().map(|item| match *item {
                        Value::I64(i) if 0 <= i && i < 256 => Ok(i as u8),
                        ref other => Err(invalid("byte value", other)),
                    }).collect::<Result<Vec<u8>>>().map(Value::Bytes),
                    Some(other) => Err(invalid("bytes argument", &other)),
                }
            }
            Builtin::CodecsEncode => {
                // _codecs.encode(text, 'latin1'): how bytes are written
                // before protocol 3.
                let encoding = args.pop();
                match encoding {
                    Some(Value::String(ref e)) if e == "latin1" || e == "latin-1" => {}
                    Some(other) => return Err(invalid("latin1 encoding", &other)),
                    None => return Err(invalid("encoding", &Value::None)),
                }
                match args.pop() {
                    Some(Value::String(ref s)) => s.chars().map(|ch| {
                        let cp = ch as u32;
                        if cp < 256 {
                            Ok(cp as u8)
                        } else {
                            Err(Error::Syntax(ErrorCode::InvalidValue(
                                format!("character {:?} is not latin-1", ch))))
                        }
                    }).collect::<Result<Vec<u8>>>().map(Value::Bytes),
                    Some(other) => Err(invalid("text", &other)),
                    None => Err(invalid("text", &Value::None)),
                }
            }
            Builtin::NewObj => Err(Error::Syntax(ErrorCode::InvalidValue(
                "copyreg.__newobj__ called without a class".into()))),
        }
    }
}

fn collect_hashable(items: Option<Value>) -> Result<BTreeSet<HashableValue>> {
    let items = match items {
        None => return Ok(BTreeSet::new()),
        Some(Value::List(ref l)) => l.borrow().clone(),
        Some(Value::Tuple(ref t)) => t.to_vec(),
        Some(Value::Set(ref s)) => return Ok(s.borrow().clone()),
        Some(Value::FrozenSet(ref s)) => return Ok((**s).clone()),
        Some(other) => return Err(invalid("iterable", &other)),
    };
    items.into_iter().map(Value::into_hashable).collect()
}

fn invalid(what: &'static str, got: &Value) -> Error {
    Error::Syntax(ErrorCode::InvalidStackTop(what, got.type_name()))
}

/// Builds `Instance` objects recording the call.
#[derive(Debug)]
pub(crate) struct GenericConstructor(pub Global);

impl Constructor for GenericConstructor {
    fn call(&self, args: Vec<Value>) -> Result<Value> {
        Ok(Value::object(Instance::new(Construct::Call { callable: self.0.clone(), args })))
    }

    fn new_object(&self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
        let class = self.0.clone();
        let construct = if kwargs.is_empty() {
            Construct::New { class, args }
        } else {
            Construct::NewEx { class, args, kwargs }
        };
        Ok(Value::object(Instance::new(construct)))
    }
}

/// A resolved reference, cached per decoding session.
#[derive(Clone)]
pub(crate) enum Resolved {
    Builtin(Builtin),
    Host(Rc<dyn Constructor>),
}
