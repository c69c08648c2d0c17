// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Opaque objects and the reduce protocol.
//!
//! The engine knows nothing about host types.  An opaque object is turned
//! into a `Reduce` ("call this constructor with these arguments, then apply
//! this state and these items") by a caller-supplied `Reducer`, and the
//! decoder rebuilds it mechanically by calling whatever constructor the
//! `Resolver` hands out for the recorded name.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::value::{Global, Value};

/// An opaque host value living inside a `Value` graph.
///
/// Objects are shared through `Rc`, so methods that modify the object take
/// `&self`; implementations use interior mutability.
pub trait Object: fmt::Debug {
    /// Name of the object's type, used in diagnostics.
    fn type_name(&self) -> String;

    /// Access to the concrete type, so reducers can downcast.
    fn as_any(&self) -> &dyn Any;

    /// Applies decoded state (the BUILD opcode).
    fn set_state(&self, _state: Value) -> Result<()> {
        Err(unsupported(self, "state"))
    }

    /// Appends a decoded list item (the APPEND and APPENDS opcodes).
    fn append(&self, _item: Value) -> Result<()> {
        Err(unsupported(self, "list items"))
    }

    /// Stores a decoded dict item (the SETITEM and SETITEMS opcodes).
    fn set_item(&self, _key: Value, _value: Value) -> Result<()> {
        Err(unsupported(self, "dict items"))
    }

    /// Structural equality with another object.  Defaults to never equal,
    /// so only identical objects compare equal.
    fn object_eq(&self, _other: &dyn Object) -> bool {
        false
    }

    /// Moves out the values the object holds.  Called when the last
    /// reference to the object is dropped, so that deep graphs running
    /// through objects are unlinked without recursion.
    fn take_values(&mut self, _out: &mut Vec<Value>) {}
}

fn unsupported<O: Object + ?Sized>(object: &O, what: &str) -> Error {
    Error::Syntax(ErrorCode::InvalidValue(
        format!("{} object does not accept {}", object.type_name(), what)))
}

/// How to construct the object again.
#[derive(Clone, Debug, PartialEq)]
pub enum Construct {
    /// `callable(*args)`: the generic function call, available in all
    /// protocols.
    Call { callable: Global, args: Vec<Value> },
    /// `class.__new__(class, *args)`.  Written with NEWOBJ from protocol 2,
    /// and as a call of `copyreg.__newobj__` below that.
    New { class: Global, args: Vec<Value> },
    /// `class.__new__(class, *args, **kwargs)`.  Needs protocol 4.
    NewEx { class: Global, args: Vec<Value>, kwargs: BTreeMap<String, Value> },
}

impl Construct {
    /// The constructor reference.
    pub fn global(&self) -> &Global {
        match *self {
            Construct::Call { callable: ref g, .. } |
            Construct::New { class: ref g, .. } |
            Construct::NewEx { class: ref g, .. } => g,
        }
    }
}

/// The reduced form of an object.
#[derive(Clone, Debug, PartialEq)]
pub struct Reduce {
    pub construct: Construct,
    /// State applied after construction, with BUILD or the state setter.
    pub state: Option<Value>,
    /// Items appended after construction.
    pub list_items: Vec<Value>,
    /// Items stored after construction.
    pub dict_items: Vec<(Value, Value)>,
    /// Called as `setter(obj, state)` instead of BUILD.
    pub state_setter: Option<Global>,
}

impl Reduce {
    pub fn new(construct: Construct) -> Reduce {
        Reduce {
            construct,
            state: None,
            list_items: Vec::new(),
            dict_items: Vec::new(),
            state_setter: None,
        }
    }

    pub fn with_state(mut self, state: Value) -> Reduce {
        self.state = Some(state);
        self
    }

    /// Builds a reduce from a Python-style reduce tuple
    /// `(callable, args[, state[, listitems[, dictitems[, state_setter]]]])`.
    ///
    /// `None` in an optional position means "absent".  A callable of
    /// `copyreg.__newobj__` or `copyreg.__newobj_ex__` is recognized and
    /// turned into the matching `Construct`.
    pub fn from_value(value: &Value) -> Result<Reduce> {
        let items = match *value {
            Value::Tuple(ref t) => t,
            ref other => return Err(invalid("reduce tuple", other)),
        };
        if items.len() < 2 || items.len() > 6 {
            return Err(Error::Syntax(ErrorCode::ReduceArity(items.len())));
        }
        let callable = match items[0] {
            Value::Global(ref g) => g.clone(),
            ref other => return Err(invalid("global", other)),
        };
        let args = match items[1] {
            Value::Tuple(ref t) => t.to_vec(),
            ref other => return Err(invalid("argument tuple", other)),
        };
        let construct = construct_from(callable, args)?;
        let mut reduce = Reduce::new(construct);
        let optional = |i: usize| items.get(i).filter(|v| !matches!(v, Value::None));
        reduce.state = optional(2).cloned();
        if let Some(list) = optional(3) {
            match *list {
                Value::List(ref l) => reduce.list_items = l.borrow().clone(),
                ref other => return Err(invalid("list items", other)),
            }
        }
        if let Some(dict) = optional(4) {
            match *dict {
                Value::Dict(ref d) => reduce.dict_items = d.borrow().iter()
                    .map(|(k, v)| (k.clone().into_value(), v.clone()))
                    .collect(),
                ref other => return Err(invalid("dict items", other)),
            }
        }
        if let Some(setter) = optional(5) {
            match *setter {
                Value::Global(ref g) => reduce.state_setter = Some(g.clone()),
                ref other => return Err(invalid("state setter", other)),
            }
        }
        Ok(reduce)
    }
}

fn construct_from(callable: Global, mut args: Vec<Value>) -> Result<Construct> {
    if callable.module != "copyreg" {
        return Ok(Construct::Call { callable, args });
    }
    match &*callable.name.clone() {
        "__newobj__" if !args.is_empty() => match args.remove(0) {
            Value::Global(ref class) => Ok(Construct::New { class: class.clone(), args }),
            ref other => Err(invalid("class", other)),
        },
        "__newobj_ex__" if args.len() == 3 => {
            let kwargs = kwargs_from(&args[2])?;
            let inner = match args[1] {
                Value::Tuple(ref t) => t.to_vec(),
                ref other => return Err(invalid("argument tuple", other)),
            };
            match args[0] {
                Value::Global(ref class) =>
                    Ok(Construct::NewEx { class: class.clone(), args: inner, kwargs }),
                ref other => Err(invalid("class", other)),
            }
        }
        _ => Ok(Construct::Call { callable, args }),
    }
}

/// Converts a dict value into keyword arguments; all keys must be strings.
pub(crate) fn kwargs_from(value: &Value) -> Result<BTreeMap<String, Value>> {
    match *value {
        Value::Dict(ref d) => d.borrow().iter().map(|(k, v)| match k.clone().into_value() {
            Value::String(ref s) => Ok((s.clone(), v.clone())),
            ref other => Err(invalid("keyword name", other)),
        }).collect(),
        ref other => Err(invalid("keyword dict", other)),
    }
}

fn invalid(what: &'static str, got: &Value) -> Error {
    Error::Syntax(ErrorCode::InvalidStackTop(what, got.type_name()))
}

/// A generic object that records how it was built.
///
/// This is what the decoder produces for classes it has no host
/// constructor for, and the `DefaultReducer` turns it back into exactly the
/// same reduce, so such objects survive a round trip unchanged.
#[derive(Debug)]
pub struct Instance {
    construct: Construct,
    state: RefCell<Option<Value>>,
    list_items: RefCell<Vec<Value>>,
    dict_items: RefCell<Vec<(Value, Value)>>,
}

impl Instance {
    pub fn new(construct: Construct) -> Instance {
        Instance {
            construct,
            state: RefCell::new(None),
            list_items: RefCell::new(Vec::new()),
            dict_items: RefCell::new(Vec::new()),
        }
    }

    /// The class or callable this object was built with.
    pub fn class(&self) -> &Global {
        self.construct.global()
    }

    pub fn construct(&self) -> &Construct {
        &self.construct
    }

    pub fn state(&self) -> Option<Value> {
        self.state.borrow().clone()
    }

    pub fn list_items(&self) -> Vec<Value> {
        self.list_items.borrow().clone()
    }

    pub fn dict_items(&self) -> Vec<(Value, Value)> {
        self.dict_items.borrow().clone()
    }

    /// The reduce that rebuilds this object.
    pub fn reduce(&self) -> Reduce {
        Reduce {
            construct: self.construct.clone(),
            state: self.state(),
            list_items: self.list_items(),
            dict_items: self.dict_items(),
            state_setter: None,
        }
    }
}

impl Object for Instance {
    fn type_name(&self) -> String {
        self.class().to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn set_state(&self, state: Value) -> Result<()> {
        *self.state.borrow_mut() = Some(state);
        Ok(())
    }

    fn append(&self, item: Value) -> Result<()> {
        self.list_items.borrow_mut().push(item);
        Ok(())
    }

    fn set_item(&self, key: Value, value: Value) -> Result<()> {
        self.dict_items.borrow_mut().push((key, value));
        Ok(())
    }

    fn take_values(&mut self, out: &mut Vec<Value>) {
        match self.construct {
            Construct::Call { ref mut args, .. } |
            Construct::New { ref mut args, .. } => out.append(args),
            Construct::NewEx { ref mut args, ref mut kwargs, .. } => {
                out.append(args);
                out.extend(mem::take(kwargs).into_iter().map(|(_, v)| v));
            }
        }
        out.extend(self.state.get_mut().take());
        out.append(self.list_items.get_mut());
        for (key, value) in self.dict_items.get_mut().drain(..) {
            out.push(key);
            out.push(value);
        }
    }

    fn object_eq(&self, other: &dyn Object) -> bool {
        match other.as_any().downcast_ref::<Instance>() {
            Some(other) => self.construct == other.construct
                && *self.state.borrow() == *other.state.borrow()
                && *self.list_items.borrow() == *other.list_items.borrow()
                && *self.dict_items.borrow() == *other.dict_items.borrow(),
            None => false,
        }
    }
}

/// The caller-supplied policy turning opaque objects into reduces.
pub trait Reducer {
    /// Reduces the object, or returns `None` if the policy does not know
    /// the object's type.  `proto` is the protocol being written.
    fn reduce(&self, object: &Rc<dyn Object>, proto: u8) -> Result<Option<Reduce>>;
}

/// Reduces `Instance` objects and nothing else.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultReducer;

impl Reducer for DefaultReducer {
    fn reduce(&self, object: &Rc<dyn Object>, _proto: u8) -> Result<Option<Reduce>> {
        Ok(object.as_any().downcast_ref::<Instance>().map(Instance::reduce))
    }
}

/// Adapts a function producing Python-style reduce tuples, falling back to
/// the `DefaultReducer` when the function declines.
pub struct TupleReducer<F>(pub F);

impl<F> Reducer for TupleReducer<F>
    where F: Fn(&dyn Object) -> Option<Value>
{
    fn reduce(&self, object: &Rc<dyn Object>, proto: u8) -> Result<Option<Reduce>> {
        match (self.0)(&**object) {
            Some(tuple) => Reduce::from_value(&tuple).map(Some),
            None => DefaultReducer.reduce(object, proto),
        }
    }
}
