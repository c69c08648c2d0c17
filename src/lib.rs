// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Object-graph serialization in Python's pickle format
//!
//! # Pickle format
//!
//! Please see the [Python docs](http://docs.python.org/library/pickle) for
//! details on the Pickle format.
//!
//! This crate reads and writes all Pickle protocols (0 to 5).  Protocol 5 is
//! written by default; protocol 2 is the highest one Python 2 understands.
//!
//! # Value graphs
//!
//! Unlike a tree serializer, this crate works on graphs.  Lists, tuples,
//! sets, dicts and opaque objects in a `Value` are reference counted, and
//! two references to the same container are written once and fetched from
//! the memo afterwards.  Decoding restores the sharing, and cycles (a list
//! containing itself, say) come back as cycles.
//!
//! The supported data is:
//!
//! * None
//! * Boolean (Rust `bool`)
//! * Integers (Rust `i64` or bigints from num)
//! * Floats (Rust `f64`)
//! * Bytes objects and bytearrays (Rust `Vec<u8>`)
//! * (Unicode) strings (Rust `String`)
//! * Lists and tuples
//! * Sets and frozensets of hashable values
//! * Dictionaries with hashable keys
//! * References to globals (classes and functions, by module and name)
//! * Opaque objects, see below
//!
//! # Opaque objects
//!
//! Host values enter a graph as `Value::Object`, implementing the `Object`
//! trait.  To write one, a `Reducer` turns it into a `Reduce`: a constructor
//! reference, its arguments, and optionally state and items to apply.  The
//! decoder rebuilds objects by resolving the constructor reference and
//! calling it; by default, unknown classes decode to generic `Instance`
//! objects that write back out exactly as they came in.
//!
//! Decoding a pickle calls the constructors it names.  See the `resolve`
//! module for how to restrict that when reading untrusted data.
//!
//! # Unsupported features
//!
//! - Persistent IDs (the `PERSID` and `BINPERSID` opcodes).
//! - Out-of-band data as introduced in Pickle protocol 5.
//!
//! # Exported API
//!
//! Streams are written by `Serializer` and read by `Deserializer`; the
//! `value_to_*` and `value_from_*` functions cover the one-shot cases.
//! `Value` also implements serde's `Serialize` and `Deserialize`, so
//! acyclic graphs can be transcoded from and to other serde formats.

pub use self::ser::{
    Serializer,
    SerOptions,
    value_to_writer,
    value_to_vec,
};

pub use self::de::{
    Deserializer,
    DeOptions,
    value_from_reader,
    value_from_slice,
    value_from_iter,
};

pub use self::value::{Global, Value, HashableValue};

pub use self::object::{
    Construct,
    DefaultReducer,
    Instance,
    Object,
    Reduce,
    Reducer,
    TupleReducer,
};

pub use self::resolve::{Constructor, ResolvePolicy, Resolver};

pub use self::ext::{
    add_extension,
    remove_extension,
    extension_code,
    extension_global,
};

pub use self::error::{Error, ErrorCode, Result};

pub mod ser;
pub mod de;
pub mod error;
pub mod value;
pub mod object;
pub mod resolve;
pub mod ext;
mod consts;
mod frame;
mod memo;
mod value_impls;

#[cfg(test)]
#[path = "../test/mod.rs"]
mod test;
