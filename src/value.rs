// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Object graph values.
//!
//! Scalars are stored inline.  Containers and opaque objects are reference
//! counted: cloning a `Value` clones the handle, not the contents, so two
//! clones of the same list *are* the same list.  This identity is what the
//! memo tables key on, and what lets a decoded graph share sub-objects and
//! contain cycles exactly like the graph that was encoded.

use std::fmt;
use std::mem;
use std::rc::Rc;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive};

use crate::error::{Error, ErrorCode};
use crate::object::Object;

/// A mutable list shared between all references to it.
pub type SharedList = Rc<RefCell<Vec<Value>>>;
/// A mutable dict shared between all references to it.
pub type SharedDict = Rc<RefCell<BTreeMap<HashableValue, Value>>>;
/// A mutable set shared between all references to it.
pub type SharedSet = Rc<RefCell<BTreeSet<HashableValue>>>;

/// A reference to a named constructor, class or function: `module.name`.
///
/// The name may be dotted to refer to a nested class (`Outer.Inner`), which
/// needs protocol 4 or higher to encode.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Global {
    pub module: String,
    pub name: String,
}

impl Global {
    pub fn new<M: Into<String>, N: Into<String>>(module: M, name: N) -> Global {
        Global { module: module.into(), name: name.into() }
    }

    /// Whether the name refers into a nested namespace.
    pub fn is_qualified(&self) -> bool {
        self.name.contains('.')
    }
}

impl fmt::Display for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// Represents every value the engine can encode and decode.
///
/// Note on integers: while decoding, all integers that fit into an i64 are
/// returned as `I64`, and `BigInt` is used for the rest.  The two compare
/// equal when they hold the same number.
#[derive(Clone)]
pub enum Value {
    /// None
    None,
    /// Boolean
    Bool(bool),
    /// Short integer
    I64(i64),
    /// Long integer (unbounded length)
    Int(BigInt),
    /// Float
    F64(f64),
    /// Bytestring
    Bytes(Vec<u8>),
    /// Unicode string
    String(String),
    /// List
    List(SharedList),
    /// Tuple
    Tuple(Rc<[Value]>),
    /// Set
    Set(SharedSet),
    /// Frozen (immutable) set
    FrozenSet(Rc<BTreeSet<HashableValue>>),
    /// Dictionary (map)
    Dict(SharedDict),
    /// Reference to a named constructor
    Global(Global),
    /// Opaque object, encoded through the reduce protocol
    Object(Rc<dyn Object>),
}

/// Represents the values that can be contained in a "hashable" context
/// (i.e., as dictionary keys and set elements).
///
/// In Rust, the type is *not* hashable, since we use B-tree maps and sets
/// instead of the hash variants.  To be able to put all values into these
/// B-trees, we implement a consistent ordering between all the possible
/// types (see below).  Hashable values are plain data without identity.
#[derive(Clone, Debug)]
pub enum HashableValue {
    /// None
    None,
    /// Boolean
    Bool(bool),
    /// Short integer
    I64(i64),
    /// Long integer
    Int(BigInt),
    /// Float
    F64(f64),
    /// Bytestring
    Bytes(Vec<u8>),
    /// Unicode string
    String(String),
    /// Tuple
    Tuple(Vec<HashableValue>),
    /// Frozen (immutable) set
    FrozenSet(BTreeSet<HashableValue>),
    /// Reference to a named constructor
    Global(Global),
}

impl Value {
    /// Creates a new, unshared list.
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    /// Creates a new tuple.
    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(items.into())
    }

    /// Creates a new, unshared dict.
    pub fn dict(items: BTreeMap<HashableValue, Value>) -> Value {
        Value::Dict(Rc::new(RefCell::new(items)))
    }

    /// Creates a new, unshared set.
    pub fn set(items: BTreeSet<HashableValue>) -> Value {
        Value::Set(Rc::new(RefCell::new(items)))
    }

    /// Creates a new frozenset.
    pub fn frozenset(items: BTreeSet<HashableValue>) -> Value {
        Value::FrozenSet(Rc::new(items))
    }

    /// Wraps an opaque object.
    pub fn object<O: Object + 'static>(object: O) -> Value {
        Value::Object(Rc::new(object))
    }

    /// Creates a global reference.
    pub fn global<M: Into<String>, N: Into<String>>(module: M, name: N) -> Value {
        Value::Global(Global::new(module, name))
    }

    /// The address identifying this value, if it has identity at all.
    ///
    /// Scalars and globals have no address; two references to the same
    /// container return the same address.
    pub fn address(&self) -> Option<usize> {
        match *self {
            Value::List(ref l) => Some(Rc::as_ptr(l) as *const () as usize),
            Value::Tuple(ref t) => Some(Rc::as_ptr(t) as *const () as usize),
            Value::Set(ref s) => Some(Rc::as_ptr(s) as *const () as usize),
            Value::FrozenSet(ref s) => Some(Rc::as_ptr(s) as *const () as usize),
            Value::Dict(ref d) => Some(Rc::as_ptr(d) as *const () as usize),
            Value::Object(ref o) => Some(Rc::as_ptr(o) as *const () as usize),
            _ => None,
        }
    }

    /// Whether both values are the very same container or object.
    pub fn is(&self, other: &Value) -> bool {
        match (self.address(), other.address()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// A short name of the value's type, for diagnostics.
    pub fn type_name(&self) -> String {
        match *self {
            Value::None => "NoneType".into(),
            Value::Bool(_) => "bool".into(),
            Value::I64(_) | Value::Int(_) => "int".into(),
            Value::F64(_) => "float".into(),
            Value::Bytes(_) => "bytes".into(),
            Value::String(_) => "str".into(),
            Value::List(_) => "list".into(),
            Value::Tuple(_) => "tuple".into(),
            Value::Set(_) => "set".into(),
            Value::FrozenSet(_) => "frozenset".into(),
            Value::Dict(_) => "dict".into(),
            Value::Global(_) => "global".into(),
            Value::Object(ref o) => o.type_name(),
        }
    }

    /// Convert the value into a hashable version, if possible.  If not, return
    /// a ValueNotHashable error.
    ///
    /// Tuples and frozensets nested deeper than `HASHABLE_DEPTH_LIMIT` are
    /// refused with NestingTooDeep.
    pub fn into_hashable(self) -> Result<HashableValue, Error> {
        self.to_hashable(HASHABLE_DEPTH_LIMIT)
    }

    fn to_hashable(&self, budget: usize) -> Result<HashableValue, Error> {
        match *self {
            Value::None             => Ok(HashableValue::None),
            Value::Bool(b)          => Ok(HashableValue::Bool(b)),
            Value::I64(i)           => Ok(HashableValue::I64(i)),
            Value::Int(ref i)       => Ok(HashableValue::Int(i.clone())),
            Value::F64(f)           => Ok(HashableValue::F64(f)),
            Value::Bytes(ref b)     => Ok(HashableValue::Bytes(b.clone())),
            Value::String(ref s)    => Ok(HashableValue::String(s.clone())),
            Value::Global(ref g)    => Ok(HashableValue::Global(g.clone())),
            Value::FrozenSet(ref s) => {
                if budget == 0 || s.iter().any(|item| !item.nests_within(budget - 1)) {
                    return Err(too_deep());
                }
                Ok(HashableValue::FrozenSet((**s).clone()))
            }
            Value::Tuple(ref t)     => {
                if budget == 0 {
                    return Err(too_deep());
                }
                t.iter().map(|item| item.to_hashable(budget - 1))
                    .collect::<Result<Vec<_>, _>>().map(HashableValue::Tuple)
            }
            _                       => Err(Error::Syntax(ErrorCode::ValueNotHashable))
        }
    }
}

/// How deeply tuples and frozensets may nest inside a hashable value.
pub const HASHABLE_DEPTH_LIMIT: usize = 512;

fn too_deep() -> Error {
    Error::Syntax(ErrorCode::NestingTooDeep(HASHABLE_DEPTH_LIMIT))
}

/// Moves the children of a container out of it, if this is the last
/// reference to the container.
fn take_children(value: &mut Value, out: &mut Vec<Value>) {
    match *value {
        Value::List(ref mut l) => if let Some(cell) = Rc::get_mut(l) {
            out.append(cell.get_mut());
        },
        Value::Tuple(ref mut t) => if let Some(items) = Rc::get_mut(t) {
            out.extend(items.iter_mut().map(|item| mem::replace(item, Value::None)));
        },
        Value::Dict(ref mut d) => if let Some(cell) = Rc::get_mut(d) {
            out.extend(mem::take(cell.get_mut()).into_iter().map(|(_, v)| v));
        },
        Value::Object(ref mut o) => if let Some(object) = Rc::get_mut(o) {
            object.take_values(out);
        },
        _ => {}
    }
}

/// Containers are unlinked through a work list, so dropping an arbitrarily
/// deep graph does not recurse.
impl Drop for Value {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        take_children(self, &mut pending);
        while let Some(mut value) = pending.pop() {
            take_children(&mut value, &mut pending);
        }
    }
}

impl HashableValue {
    /// Convert the value into its non-hashable version.  This always works,
    /// and creates fresh tuples and frozensets.
    pub fn into_value(self) -> Value {
        match self {
            HashableValue::None         => Value::None,
            HashableValue::Bool(b)      => Value::Bool(b),
            HashableValue::I64(i)       => Value::I64(i),
            HashableValue::Int(i)       => Value::Int(i),
            HashableValue::F64(f)       => Value::F64(f),
            HashableValue::Bytes(b)     => Value::Bytes(b),
            HashableValue::String(s)    => Value::String(s),
            HashableValue::Global(g)    => Value::Global(g),
            HashableValue::FrozenSet(s) => Value::frozenset(s),
            HashableValue::Tuple(v)     =>
                Value::tuple(v.into_iter().map(HashableValue::into_value).collect()),
        }
    }

    /// Whether tuples and frozensets nest at most `budget` levels below
    /// this value.
    fn nests_within(&self, budget: usize) -> bool {
        match *self {
            HashableValue::Tuple(ref items) =>
                budget > 0 && items.iter().all(|item| item.nests_within(budget - 1)),
            HashableValue::FrozenSet(ref items) =>
                budget > 0 && items.iter().all(|item| item.nests_within(budget - 1)),
            _ => true,
        }
    }
}

impl From<HashableValue> for Value {
    fn from(value: HashableValue) -> Value {
        value.into_value()
    }
}

fn int_eq(i: i64, bi: &BigInt) -> bool {
    bi.to_i64() == Some(i)
}

/// Structural equality.
///
/// Shared containers compare equal to themselves without looking inside, so
/// comparing a cyclic graph with itself terminates.  Comparing two *distinct*
/// cyclic graphs does not; check their shape through `Value::is` instead.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        use self::Value::*;
        match (self, other) {
            (None, None) => true,
            (Bool(a), Bool(b)) => a == b,
            (I64(a), I64(b)) => a == b,
            (I64(a), Int(b)) | (Int(b), I64(a)) => int_eq(*a, b),
            (Int(a), Int(b)) => a == b,
            (F64(a), F64(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Global(a), Global(b)) => a == b,
            (List(a), List(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Tuple(a), Tuple(b)) => Rc::ptr_eq(a, b) || a[..] == b[..],
            (Set(a), Set(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (FrozenSet(a), FrozenSet(b)) => Rc::ptr_eq(a, b) || a == b,
            (Dict(a), Dict(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Object(a), Object(b)) => self.is(other) || a.object_eq(&**b),
            _ => false,
        }
    }
}

fn write_elements<'a, I, T, F>(f: &mut fmt::Formatter<'_>, it: I,
                               prefix: &'static str, suffix: &'static str,
                               len: usize, always_comma: bool, mut write: F) -> fmt::Result
    where I: Iterator<Item=&'a T>, T: 'a,
          F: FnMut(&mut fmt::Formatter<'_>, &T) -> fmt::Result
{
    f.write_str(prefix)?;
    for (i, item) in it.enumerate() {
        write(f, item)?;
        if i < len - 1 || always_comma {
            f.write_str(", ")?;
        }
    }
    f.write_str(suffix)
}

/// Writes a value, printing `...` for containers already being printed.
fn write_value(f: &mut fmt::Formatter<'_>, value: &Value, active: &mut Vec<usize>) -> fmt::Result {
    if let Some(addr) = value.address() {
        if active.contains(&addr) {
            return match *value {
                Value::List(_) => f.write_str("[...]"),
                Value::Dict(_) => f.write_str("{...}"),
                _ => f.write_str("..."),
            };
        }
        active.push(addr);
    }
    let result = match *value {
        Value::None          => write!(f, "None"),
        Value::Bool(b)       => write!(f, "{}", if b { "True" } else { "False" }),
        Value::I64(i)        => write!(f, "{}", i),
        Value::Int(ref i)    => write!(f, "{}", i),
        Value::F64(v)        => write!(f, "{:?}", v),
        Value::Bytes(ref b)  => write!(f, "b{:?}", b),
        Value::String(ref s) => write!(f, "{:?}", s),
        Value::Global(ref g) => write!(f, "<{}>", g),
        Value::Object(ref o) => write!(f, "<{} object>", o.type_name()),
        Value::List(ref v)   => {
            let v = v.borrow();
            write_elements(f, v.iter(), "[", "]", v.len(), false,
                           |f, item| write_value(f, item, active))
        }
        Value::Tuple(ref v)  => write_elements(f, v.iter(), "(", ")", v.len(), v.len() == 1,
                                               |f, item| write_value(f, item, active)),
        Value::FrozenSet(ref v) => write_elements(f, v.iter(), "frozenset([", "])", v.len(),
                                                  false, |f, item| write!(f, "{}", item)),
        Value::Set(ref v)    => {
            let v = v.borrow();
            if v.is_empty() {
                write!(f, "set()")
            } else {
                write_elements(f, v.iter(), "{", "}", v.len(), false,
                               |f, item| write!(f, "{}", item))
            }
        }
        Value::Dict(ref v) => {
            let v = v.borrow();
            write!(f, "{{")?;
            for (i, (key, value)) in v.iter().enumerate() {
                write!(f, "{}: ", key)?;
                write_value(f, value, active)?;
                if i < v.len() - 1 {
                    write!(f, ", ")?;
                }
            }
            write!(f, "}}")
        }
    };
    if value.address().is_some() {
        active.pop();
    }
    result
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, self, &mut Vec::new())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, self, &mut Vec::new())
    }
}

impl fmt::Display for HashableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HashableValue::None             => write!(f, "None"),
            HashableValue::Bool(b)          => write!(f, "{}", if b { "True" } else { "False" }),
            HashableValue::I64(i)           => write!(f, "{}", i),
            HashableValue::Int(ref i)       => write!(f, "{}", i),
            HashableValue::F64(v)           => write!(f, "{:?}", v),
            HashableValue::Bytes(ref b)     => write!(f, "b{:?}", b),
            HashableValue::String(ref s)    => write!(f, "{:?}", s),
            HashableValue::Global(ref g)    => write!(f, "<{}>", g),
            HashableValue::Tuple(ref v)     =>
                write_elements(f, v.iter(), "(", ")", v.len(), v.len() == 1,
                               |f, item| write!(f, "{}", item)),
            HashableValue::FrozenSet(ref v) =>
                write_elements(f, v.iter(), "frozenset([", "])", v.len(), false,
                               |f, item| write!(f, "{}", item)),
        }
    }
}

impl PartialEq for HashableValue {
    fn eq(&self, other: &HashableValue) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HashableValue {}

impl PartialOrd for HashableValue {
    fn partial_cmp(&self, other: &HashableValue) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Implement a (more or less) consistent ordering for `HashableValue`s
/// so that they can be added to dictionaries and sets.
///
/// Also, like in Python, numeric values with the same value (integral or not)
/// must compare equal.
///
/// For other types, we define an ordering between all types A and B so that all
/// objects of type A are always lesser than objects of type B.  This is done
/// similar to Python 2's ordering of different types.
impl Ord for HashableValue {
    fn cmp(&self, other: &HashableValue) -> Ordering {
        use self::HashableValue::*;
        match *self {
            None => match *other {
                None => Ordering::Equal,
                _    => Ordering::Less
            },
            Bool(b) => match *other {
                None         => Ordering::Greater,
                Bool(b2)     => b.cmp(&b2),
                I64(i2)      => (b as i64).cmp(&i2),
                Int(ref bi)  => BigInt::from(b as i64).cmp(bi),
                F64(f)       => float_ord(b as i64 as f64, f),
                _            => Ordering::Less
            },
            I64(i) => match *other {
                None         => Ordering::Greater,
                Bool(b)      => i.cmp(&(b as i64)),
                I64(i2)      => i.cmp(&i2),
                Int(ref bi)  => BigInt::from(i).cmp(bi),
                F64(f)       => float_ord(i as f64, f),
                _            => Ordering::Less
            },
            Int(ref bi) => match *other {
                None         => Ordering::Greater,
                Bool(b)      => bi.cmp(&BigInt::from(b as i64)),
                I64(i)       => bi.cmp(&BigInt::from(i)),
                Int(ref bi2) => bi.cmp(bi2),
                F64(f)       => float_bigint_ord(bi, f),
                _            => Ordering::Less
            },
            F64(f) => match *other {
                None         => Ordering::Greater,
                Bool(b)      => float_ord(f, b as i64 as f64),
                I64(i)       => float_ord(f, i as f64),
                Int(ref bi)  => float_bigint_ord(bi, f).reverse(),
                F64(f2)      => float_ord(f, f2),
                _            => Ordering::Less
            },
            Bytes(ref bs) => match *other {
                String(_) | FrozenSet(_) |
                Tuple(_) | Global(_) => Ordering::Less,
                Bytes(ref bs2) => bs.cmp(bs2),
                _              => Ordering::Greater
            },
            String(ref s) => match *other {
                FrozenSet(_) |
                Tuple(_) | Global(_) => Ordering::Less,
                String(ref s2) => s.cmp(s2),
                _              => Ordering::Greater
            },
            FrozenSet(ref s) => match *other {
                Tuple(_) | Global(_) => Ordering::Less,
                FrozenSet(ref s2) => s.cmp(s2),
                _                 => Ordering::Greater
            },
            Tuple(ref t) => match *other {
                Global(_)     => Ordering::Less,
                Tuple(ref t2) => t.cmp(t2),
                _             => Ordering::Greater
            },
            Global(ref g) => match *other {
                Global(ref g2) => g.cmp(g2),
                _              => Ordering::Greater
            },
        }
    }
}

/// A "reasonable" total ordering for floats.
fn float_ord(f: f64, g: f64) -> Ordering {
    match f.partial_cmp(&g) {
        Some(o) => o,
        None    => Ordering::Less
    }
}

/// Ordering between floats and big integers.
fn float_bigint_ord(bi: &BigInt, g: f64) -> Ordering {
    match bi.to_f64() {
        Some(f) => float_ord(f, g),
        None => if bi.is_positive() { Ordering::Greater } else { Ordering::Less }
    }
}
