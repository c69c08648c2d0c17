// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! # Pickle deserialization
//!
//! Note: Pickles are not a declarative format, but a program for a stack-based
//! VM.  Each value that is decoded is simply put on the stack, and some
//! operations pop items from the stack and construct new data with them.
//!
//! Memo fetches hand out the very same containers that were stored, so
//! sharing and cycles in the encoded graph come back as sharing and cycles
//! in the decoded one.
//!
//! Every constructor reference (GLOBAL, STACK_GLOBAL, INST, EXT1/2/4) is
//! resolved when it is read; see the `resolve` module for the order in
//! which built-ins, the policy and the resolver are consulted.

use std::char;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::iter::Peekable;
use std::mem;
use std::rc::Rc;
use std::str;
use byteorder::{ByteOrder, BigEndian, LittleEndian};
use iter_read::{IterRead, IterReadItem};
use log::{debug, warn};
use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::consts::*;
use crate::error::{Error, ErrorCode, Result};
use crate::ext::ExtensionCache;
use crate::frame::Unframer;
use crate::memo::MemoStore;
use crate::object::kwargs_from;
use crate::resolve::{Builtin, GenericConstructor, ResolvePolicy, Resolved, Resolver};
use crate::value::{Global, HashableValue, Value};

/// Options for deserializing.
#[derive(Clone, Default)]
pub struct DeOptions {
    decode_strings: bool,
    policy: ResolvePolicy,
    resolver: Option<Rc<dyn Resolver>>,
}

impl DeOptions {
    /// Construct with default options:
    ///
    /// - don't decode strings saved as STRING opcodes (only protocols 0-2)
    /// - resolve any global, to generic `Instance` objects
    pub fn new() -> Self {
        Default::default()
    }

    /// Activate decoding strings saved as STRING.
    pub fn decode_strings(mut self) -> Self {
        self.decode_strings = true;
        self
    }

    /// Restrict which constructor references are accepted.
    pub fn policy(mut self, policy: ResolvePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resolve constructor references with the given resolver instead of
    /// building generic objects.  A reference the resolver does not know
    /// fails the decoding.
    pub fn resolver<R: Resolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Some(Rc::new(resolver));
        self
    }
}

/// Decodes pickle streams into values.
pub struct Deserializer<R: io::Read> {
    rdr: Unframer<R>,
    stack: Vec<Value>,
    stacks: Vec<Vec<Value>>,
    memo: MemoStore,
    options: DeOptions,
    resolved: HashMap<Global, Resolved>,
    extensions: ExtensionCache,
}

impl<R: io::Read> Deserializer<R> {
    /// Construct a new Deserializer.
    pub fn new(rdr: R, options: DeOptions) -> Deserializer<R> {
        Deserializer {
            rdr: Unframer::new(rdr),
            stack: Vec::with_capacity(128),
            stacks: Vec::with_capacity(16),
            memo: MemoStore::default(),
            options,
            resolved: HashMap::new(),
            extensions: ExtensionCache::default(),
        }
    }

    /// Decode a Value from this pickle.  Several pickles can be decoded
    /// from the same stream in sequence; the memo carries over from one to
    /// the next, like the memo of a `Serializer` writing them.
    pub fn deserialize_value(&mut self) -> Result<Value> {
        self.stack.clear();
        self.stacks.clear();
        debug!("unpickling at offset {}", self.rdr.pos());
        let value = self.parse()?;
        debug!("unpickled {} ending at offset {}", value.type_name(), self.rdr.pos());
        Ok(value)
    }

    /// Assert that we reached the end of the stream.
    pub fn end(&mut self) -> Result<()> {
        if self.rdr.at_end()? {
            Ok(())
        } else {
            self.error(ErrorCode::TrailingBytes)
        }
    }

    fn parse(&mut self) -> Result<Value> {
        loop {
            let op = self.rdr.read_byte()?;
            match op {
                // Specials
                STOP => {
                    if !self.stacks.is_empty() || self.stack.len() != 1 {
                        return self.error(ErrorCode::UnbalancedStack(self.stack.len()));
                    }
                    return self.pop();
                }
                POP => {
                    if self.stack.is_empty() {
                        self.pop_mark()?;
                    } else {
                        self.pop()?;
                    }
                }
                POP_MARK => { self.pop_mark()?; }
                DUP => { let top = self.top()?.clone(); self.stack.push(top); }
                MARK => {
                    let stack = mem::replace(&mut self.stack, Vec::with_capacity(128));
                    self.stacks.push(stack);
                }
                PROTO => {
                    let proto = self.rdr.read_byte()?;
                    if proto > HIGHEST_PROTOCOL {
                        return self.error(ErrorCode::UnsupportedProtocol(proto));
                    }
                    debug!("stream declares protocol {}", proto);
                }
                FRAME => {
                    let bytes = self.rdr.read_bytes(8)?;
                    self.rdr.load_frame(LittleEndian::read_u64(&bytes))?;
                }

                // Memo ops
                PUT => {
                    let line = self.rdr.read_line()?;
                    let index = self.parse_index(line)?;
                    self.memoize(index)?;
                }
                BINPUT => {
                    let index = self.rdr.read_byte()?;
                    self.memoize(index as u32)?;
                }
                LONG_BINPUT => {
                    let bytes = self.rdr.read_bytes(4)?;
                    self.memoize(LittleEndian::read_u32(&bytes))?;
                }
                MEMOIZE => {
                    let index = self.memo.next_index();
                    self.memoize(index)?;
                }
                GET => {
                    let line = self.rdr.read_line()?;
                    let index = self.parse_index(line)?;
                    self.push_memo(index)?;
                }
                BINGET => {
                    let index = self.rdr.read_byte()?;
                    self.push_memo(index as u32)?;
                }
                LONG_BINGET => {
                    let bytes = self.rdr.read_bytes(4)?;
                    self.push_memo(LittleEndian::read_u32(&bytes))?;
                }

                // Singletons
                NONE => self.stack.push(Value::None),
                NEWFALSE => self.stack.push(Value::Bool(false)),
                NEWTRUE => self.stack.push(Value::Bool(true)),

                // ASCII-formatted numbers
                INT => {
                    let line = self.rdr.read_line()?;
                    // Handle protocol 1 way of spelling true/false
                    if line == b"00" {
                        self.stack.push(Value::Bool(false))
                    } else if line == b"01" {
                        self.stack.push(Value::Bool(true))
                    } else {
                        let int = self.parse_int(line)?;
                        self.stack.push(int);
                    }
                }
                LONG => {
                    let mut line = self.rdr.read_line()?;
                    // Remove "L" suffix.
                    if line.last() == Some(&b'L') { line.pop(); }
                    let int = self.parse_int(line)?;
                    self.stack.push(int);
                }
                FLOAT => {
                    let line = self.rdr.read_line()?;
                    match str::from_utf8(&line).unwrap_or("").parse::<f64>() {
                        Ok(f)  => self.stack.push(Value::F64(f)),
                        Err(_) => return self.error(ErrorCode::InvalidLiteral(line)),
                    }
                }

                // Until-EOL strings
                STRING => {
                    let line = self.rdr.read_line()?;
                    // Remove quotes.
                    let slice = if line.len() >= 2 && line[0] == line[line.len() - 1] &&
                        (line[0] == b'"' || line[0] == b'\'') {
                            &line[1..line.len() - 1]
                        } else { &line };
                    let string = self.decode_escaped_string(slice)?;
                    self.stack.push(string);
                }
                UNICODE => {
                    let line = self.rdr.read_line()?;
                    let string = self.decode_escaped_unicode(&line)?;
                    self.stack.push(string);
                }

                // Binary-coded numbers
                BINFLOAT => {
                    let bytes = self.rdr.read_bytes(8)?;
                    self.stack.push(Value::F64(BigEndian::read_f64(&bytes)));
                }
                BININT => {
                    let bytes = self.rdr.read_bytes(4)?;
                    self.stack.push(Value::I64(LittleEndian::read_i32(&bytes) as i64));
                }
                BININT1 => {
                    let byte = self.rdr.read_byte()?;
                    self.stack.push(Value::I64(byte as i64));
                }
                BININT2 => {
                    let bytes = self.rdr.read_bytes(2)?;
                    self.stack.push(Value::I64(LittleEndian::read_u16(&bytes) as i64));
                }

                // Length-prefixed longs
                LONG1 => {
                    let bytes = self.read_u8_prefixed_bytes()?;
                    self.stack.push(decode_long(&bytes));
                }
                LONG4 => {
                    let bytes = self.read_i32_prefixed_bytes()?;
                    self.stack.push(decode_long(&bytes));
                }

                // Length-prefixed (byte)strings
                SHORT_BINBYTES => {
                    let string = self.read_u8_prefixed_bytes()?;
                    self.stack.push(Value::Bytes(string));
                }
                BINBYTES => {
                    let string = self.read_u32_prefixed_bytes()?;
                    self.stack.push(Value::Bytes(string));
                }
                BINBYTES8 | BYTEARRAY8 => {
                    let string = self.read_u64_prefixed_bytes()?;
                    self.stack.push(Value::Bytes(string));
                }
                SHORT_BINSTRING => {
                    let string = self.read_u8_prefixed_bytes()?;
                    let decoded = self.decode_string(string)?;
                    self.stack.push(decoded);
                }
                BINSTRING => {
                    let string = self.read_i32_prefixed_bytes()?;
                    let decoded = self.decode_string(string)?;
                    self.stack.push(decoded);
                }
                SHORT_BINUNICODE => {
                    let string = self.read_u8_prefixed_bytes()?;
                    let decoded = self.decode_unicode(string)?;
                    self.stack.push(decoded);
                }
                BINUNICODE => {
                    let string = self.read_u32_prefixed_bytes()?;
                    let decoded = self.decode_unicode(string)?;
                    self.stack.push(decoded);
                }
                BINUNICODE8 => {
                    let string = self.read_u64_prefixed_bytes()?;
                    let decoded = self.decode_unicode(string)?;
                    self.stack.push(decoded);
                }

                // Containers
                EMPTY_TUPLE => self.stack.push(Value::tuple(vec![])),
                TUPLE1 => {
                    let item = self.pop()?;
                    self.stack.push(Value::tuple(vec![item]));
                }
                TUPLE2 => {
                    let item2 = self.pop()?;
                    let item1 = self.pop()?;
                    self.stack.push(Value::tuple(vec![item1, item2]));
                }
                TUPLE3 => {
                    let item3 = self.pop()?;
                    let item2 = self.pop()?;
                    let item1 = self.pop()?;
                    self.stack.push(Value::tuple(vec![item1, item2, item3]));
                }
                TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::tuple(items));
                }
                EMPTY_LIST => self.stack.push(Value::list(vec![])),
                LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::list(items));
                }
                APPEND => {
                    let value = self.pop()?;
                    self.extend_top(vec![value])?;
                }
                APPENDS => {
                    let items = self.pop_mark()?;
                    self.extend_top(items)?;
                }
                EMPTY_DICT => self.stack.push(Value::dict(BTreeMap::new())),
                DICT => {
                    let items = self.pop_mark()?;
                    let dict = Value::dict(BTreeMap::new());
                    self.stack.push(dict);
                    self.set_items_on_top(items)?;
                }
                SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.set_items_on_top(vec![key, value])?;
                }
                SETITEMS => {
                    let items = self.pop_mark()?;
                    self.set_items_on_top(items)?;
                }
                EMPTY_SET => self.stack.push(Value::set(BTreeSet::new())),
                FROZENSET => {
                    let items = self.pop_mark()?;
                    let set = self.hashable_items(items)?;
                    self.stack.push(Value::frozenset(set));
                }
                ADDITEMS => {
                    let items = self.pop_mark()?;
                    let items = self.hashable_items(items)?;
                    match *self.top()? {
                        Value::Set(ref set) => set.borrow_mut().extend(items),
                        ref other => return self.invalid("set", other),
                    }
                }

                // Constructor references
                GLOBAL => {
                    let global = self.read_global()?;
                    self.push_global(global)?;
                }
                STACK_GLOBAL => {
                    let name = self.pop_string()?;
                    let module = self.pop_string()?;
                    self.push_global(Global::new(module, name))?;
                }
                EXT1 => {
                    let code = self.rdr.read_byte()?;
                    self.push_extension(code as u32)?;
                }
                EXT2 => {
                    let bytes = self.rdr.read_bytes(2)?;
                    self.push_extension(LittleEndian::read_u16(&bytes) as u32)?;
                }
                EXT4 => {
                    let bytes = self.rdr.read_bytes(4)?;
                    let code = LittleEndian::read_i32(&bytes);
                    if code < 0 {
                        return self.error(ErrorCode::ExtensionCodeRange(code as u32));
                    }
                    self.push_extension(code as u32)?;
                }

                // Object construction
                REDUCE => {
                    let args = self.pop_args()?;
                    let callable = self.pop_global()?;
                    let value = self.call(&callable, args)?;
                    self.stack.push(value);
                }
                NEWOBJ => {
                    let args = self.pop_args()?;
                    let class = self.pop_global()?;
                    let value = self.new_object(&class, args, BTreeMap::new())?;
                    self.stack.push(value);
                }
                NEWOBJ_EX => {
                    let pos = self.rdr.pos();
                    let kwargs = self.pop()?;
                    let kwargs = kwargs_from(&kwargs).map_err(|e| located(e, pos))?;
                    let args = self.pop_args()?;
                    let class = self.pop_global()?;
                    let value = self.new_object(&class, args, kwargs)?;
                    self.stack.push(value);
                }
                INST => {
                    let class = self.read_global()?;
                    self.resolve(&class)?;
                    let args = self.pop_mark()?;
                    let value = self.instantiate(&class, args)?;
                    self.stack.push(value);
                }
                OBJ => {
                    let mut args = self.pop_mark()?;
                    if args.is_empty() {
                        return self.error(ErrorCode::StackUnderflow);
                    }
                    let class = match args.remove(0) {
                        Value::Global(ref class) => class.clone(),
                        ref other => return self.invalid("class", other),
                    };
                    let value = self.instantiate(&class, args)?;
                    self.stack.push(value);
                }
                BUILD => {
                    let pos = self.rdr.pos();
                    let state = self.pop()?;
                    match *self.top()? {
                        Value::Object(ref object) => object.set_state(state)
                            .map_err(|e| located(e, pos))?,
                        ref other => return self.invalid("object", other),
                    }
                }

                // Persistent IDs and out-of-band buffers have no meaning for
                // self-contained streams.
                PERSID | BINPERSID | NEXT_BUFFER | READONLY_BUFFER =>
                    return self.error(ErrorCode::Unsupported(op as char)),

                _ => return self.error(ErrorCode::Unsupported(op as char)),
            }
        }
    }

    fn pop(&mut self) -> Result<Value> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None    => self.error(ErrorCode::StackUnderflow)
        }
    }

    fn top(&self) -> Result<&Value> {
        match self.stack.last() {
            Some(v) => Ok(v),
            None    => self.error(ErrorCode::StackUnderflow)
        }
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        match self.stacks.pop() {
            Some(new) => Ok(mem::replace(&mut self.stack, new)),
            None      => self.error(ErrorCode::StackUnderflow)
        }
    }

    fn pop_string(&mut self) -> Result<String> {
        match self.pop()? {
            Value::String(ref string) => Ok(string.clone()),
            ref other => self.invalid("string", other),
        }
    }

    fn pop_global(&mut self) -> Result<Global> {
        match self.pop()? {
            Value::Global(ref global) => Ok(global.clone()),
            ref other => self.invalid("global", other),
        }
    }

    fn pop_args(&mut self) -> Result<Vec<Value>> {
        match self.pop()? {
            Value::Tuple(ref args) => Ok(args.to_vec()),
            ref other => self.invalid("argument tuple", other),
        }
    }

    fn memoize(&mut self, index: u32) -> Result<()> {
        let top = self.top()?.clone();
        self.memo.save(index, top);
        Ok(())
    }

    fn push_memo(&mut self, index: u32) -> Result<()> {
        let value = match self.memo.fetch(index) {
            Some(value) => value.clone(),
            None => return self.error(ErrorCode::MissingMemo(index)),
        };
        self.stack.push(value);
        Ok(())
    }

    fn parse_index(&self, line: Vec<u8>) -> Result<u32> {
        match str::from_utf8(&line).unwrap_or("").parse::<u32>() {
            Ok(index) => Ok(index),
            Err(_) => self.error(ErrorCode::InvalidLiteral(line)),
        }
    }

    fn parse_int(&self, line: Vec<u8>) -> Result<Value> {
        if let Ok(i) = str::from_utf8(&line).unwrap_or("").parse::<i64>() {
            return Ok(Value::I64(i));
        }
        match BigInt::parse_bytes(&line, 10) {
            Some(i) => Ok(int_value(i)),
            None => self.error(ErrorCode::InvalidLiteral(line)),
        }
    }

    /// Appends items to the list or object on top of the stack.
    fn extend_top(&mut self, items: Vec<Value>) -> Result<()> {
        let pos = self.rdr.pos();
        match *self.top()? {
            Value::List(ref list) => list.borrow_mut().extend(items),
            Value::Object(ref object) => for item in items {
                object.append(item).map_err(|e| located(e, pos))?;
            },
            ref other => return self.invalid("list", other),
        }
        Ok(())
    }

    /// Stores key/value pairs into the dict or object on top of the stack.
    fn set_items_on_top(&mut self, items: Vec<Value>) -> Result<()> {
        let pos = self.rdr.pos();
        if items.len() % 2 != 0 {
            return self.error(ErrorCode::InvalidValue("odd number of dict items".into()));
        }
        let top = self.top()?.clone();
        let mut iter = items.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            match top {
                Value::Dict(ref dict) => {
                    let key = self.make_hashable(key)?;
                    dict.borrow_mut().insert(key, value);
                }
                Value::Object(ref object) => object.set_item(key, value)
                    .map_err(|e| located(e, pos))?,
                ref other => return self.invalid("dict", other),
            }
        }
        Ok(())
    }

    fn make_hashable(&self, value: Value) -> Result<HashableValue> {
        value.into_hashable().map_err(|e| located(e, self.rdr.pos()))
    }

    fn hashable_items(&self, items: Vec<Value>) -> Result<BTreeSet<HashableValue>> {
        items.into_iter().map(|item| self.make_hashable(item)).collect()
    }

    fn read_global(&mut self) -> Result<Global> {
        let module = self.rdr.read_line()?;
        let name = self.rdr.read_line()?;
        match (String::from_utf8(module), String::from_utf8(name)) {
            (Ok(module), Ok(name)) => Ok(Global::new(module, name)),
            _ => self.error(ErrorCode::StringNotUTF8),
        }
    }

    fn push_global(&mut self, global: Global) -> Result<()> {
        self.resolve(&global)?;
        self.stack.push(Value::Global(global));
        Ok(())
    }

    fn push_extension(&mut self, code: u32) -> Result<()> {
        if code == 0 {
            return self.error(ErrorCode::ExtensionCodeRange(code));
        }
        match self.extensions.global(code) {
            Some(global) => self.push_global(global),
            None => self.error(ErrorCode::UnknownExtension(code)),
        }
    }

    /// The single place where constructor references are admitted.
    fn resolve(&mut self, global: &Global) -> Result<Resolved> {
        if let Some(resolved) = self.resolved.get(global) {
            return Ok(resolved.clone());
        }
        let pos = self.rdr.pos();
        let resolved = if let Some(builtin) = Builtin::lookup(global) {
            Resolved::Builtin(builtin)
        } else if !self.options.policy.allows(global) {
            warn!("refusing {} at offset {}: not in the allow list", global, pos);
            return Err(Error::Unresolved(global.clone(), pos));
        } else if let Some(ref resolver) = self.options.resolver {
            match resolver.resolve(global) {
                Some(constructor) => Resolved::Host(constructor),
                None => {
                    warn!("refusing {} at offset {}: unknown to the resolver", global, pos);
                    return Err(Error::Unresolved(global.clone(), pos));
                }
            }
        } else {
            Resolved::Host(Rc::new(GenericConstructor(global.clone())))
        };
        debug!("resolved {} at offset {}", global, pos);
        self.resolved.insert(global.clone(), resolved.clone());
        Ok(resolved)
    }

    fn call(&mut self, callable: &Global, mut args: Vec<Value>) -> Result<Value> {
        let pos = self.rdr.pos();
        let result = match self.resolve(callable)? {
            Resolved::Builtin(Builtin::NewObj) => {
                if args.is_empty() {
                    return self.error(ErrorCode::InvalidValue(
                        format!("{} called without a class", callable)));
                }
                match args.remove(0) {
                    Value::Global(ref class) => self.new_object(class, args, BTreeMap::new()),
                    ref other => self.invalid("class", other),
                }
            }
            Resolved::Builtin(builtin) => builtin.call(args),
            Resolved::Host(constructor) => constructor.call(args),
        };
        result.map_err(|e| located(e, pos))
    }

    fn new_object(&mut self, class: &Global, args: Vec<Value>,
                  kwargs: BTreeMap<String, Value>) -> Result<Value> {
        let pos = self.rdr.pos();
        let result = match self.resolve(class)? {
            Resolved::Builtin(Builtin::NewObj) => self.invalid("class", &Value::Global(class.clone())),
            Resolved::Builtin(builtin) => {
                if !kwargs.is_empty() {
                    return self.error(ErrorCode::InvalidValue(
                        format!("{} takes no keyword arguments", class)));
                }
                builtin.call(args)
            }
            Resolved::Host(constructor) => constructor.new_object(args, kwargs),
        };
        result.map_err(|e| located(e, pos))
    }

    /// INST and OBJ: a call with arguments, a bare instance without.
    fn instantiate(&mut self, class: &Global, args: Vec<Value>) -> Result<Value> {
        if args.is_empty() {
            self.new_object(class, args, BTreeMap::new())
        } else {
            self.call(class, args)
        }
    }

    fn read_i32_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.rdr.read_bytes(4)?;
        match LittleEndian::read_i32(&lenbytes) {
            0          => Ok(vec![]),
            l if l < 0 => self.error(ErrorCode::NegativeLength),
            l          => self.rdr.read_bytes(l as u64)
        }
    }

    fn read_u64_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.rdr.read_bytes(8)?;
        self.rdr.read_bytes(LittleEndian::read_u64(&lenbytes))
    }

    fn read_u32_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.rdr.read_bytes(4)?;
        self.rdr.read_bytes(LittleEndian::read_u32(&lenbytes) as u64)
    }

    fn read_u8_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbyte = self.rdr.read_byte()?;
        self.rdr.read_bytes(lenbyte as u64)
    }

    fn decode_string(&self, string: Vec<u8>) -> Result<Value> {
        if self.options.decode_strings {
            self.decode_unicode(string)
        } else {
            Ok(Value::Bytes(string))
        }
    }

    fn decode_escaped_string(&self, s: &[u8]) -> Result<Value> {
        // These are encoded with "normal" Python string escape rules.
        let mut result = Vec::with_capacity(s.len());
        let mut iter = s.iter();
        while let Some(&b) = iter.next() {
            match b {
                b'\\' => match iter.next() {
                    Some(&b'\\') => result.push(b'\\'),
                    Some(&b'\'') => result.push(b'\''),
                    Some(&b'"') => result.push(b'"'),
                    Some(&b'a') => result.push(b'\x07'),
                    Some(&b'b') => result.push(b'\x08'),
                    Some(&b't') => result.push(b'\x09'),
                    Some(&b'n') => result.push(b'\x0a'),
                    Some(&b'v') => result.push(b'\x0b'),
                    Some(&b'f') => result.push(b'\x0c'),
                    Some(&b'r') => result.push(b'\x0d'),
                    Some(&b'x') => {
                        match iter.next()
                                  .and_then(|&ch1| (ch1 as char).to_digit(16))
                                  .and_then(|v1| iter.next()
                                            .and_then(|&ch2| (ch2 as char).to_digit(16))
                                            .map(|v2| 16*(v1 as u8) + (v2 as u8)))
                        {
                            Some(v) => result.push(v),
                            None => return self.error(ErrorCode::InvalidLiteral(s.into()))
                        }
                    },
                    _ => return self.error(ErrorCode::InvalidLiteral(s.into())),
                },
                _ => result.push(b)
            }
        }
        self.decode_string(result)
    }

    fn decode_unicode(&self, string: Vec<u8>) -> Result<Value> {
        match String::from_utf8(string) {
            Ok(v)  => Ok(Value::String(v)),
            Err(_) => self.error(ErrorCode::StringNotUTF8)
        }
    }

    fn decode_escaped_unicode(&self, s: &[u8]) -> Result<Value> {
        // These are encoded with "raw-unicode-escape", which only knows
        // the \uXXXX and \UYYYYYYYY escapes.  A backslash followed by
        // anything else stands for itself.
        let mut result = String::with_capacity(s.len());
        let mut iter = s.iter().peekable();
        while let Some(&b) = iter.next() {
            if b != b'\\' {
                result.push(b as char);
                continue;
            }
            let nescape = match iter.peek() {
                Some(&&b'u') => 4,
                Some(&&b'U') => 8,
                _ => { result.push('\\'); continue; }
            };
            iter.next();
            match read_hex(&mut iter, nescape).and_then(char::from_u32) {
                Some(v) => result.push(v),
                None => return self.error(ErrorCode::InvalidLiteral(s.into())),
            }
        }
        Ok(Value::String(result))
    }

    fn invalid<T>(&self, what: &'static str, got: &Value) -> Result<T> {
        self.error(ErrorCode::InvalidStackTop(what, got.type_name()))
    }

    fn error<T>(&self, reason: ErrorCode) -> Result<T> {
        Err(Error::Eval(reason, self.rdr.pos()))
    }
}

fn read_hex<'a, I: Iterator<Item=&'a u8>>(iter: &mut Peekable<I>, digits: usize) -> Option<u32> {
    let mut accum = 0u32;
    for _ in 0..digits {
        accum = accum * 16 + (*iter.next()? as char).to_digit(16)?;
    }
    Some(accum)
}

/// Decodes a little-endian two's complement integer.
fn decode_long(bytes: &[u8]) -> Value {
    int_value(BigInt::from_signed_bytes_le(bytes))
}

fn int_value(i: BigInt) -> Value {
    match i.to_i64() {
        Some(i) => Value::I64(i),
        None => Value::Int(i),
    }
}

/// Attaches a stream offset to errors raised by constructors and objects.
fn located(error: Error, pos: usize) -> Error {
    match error {
        Error::Syntax(code) => Error::Eval(code, pos),
        other => other,
    }
}

/// Decodes a value from a `std::io::Read`.
pub fn value_from_reader<R: io::Read>(rdr: R, options: DeOptions) -> Result<Value> {
    let mut de = Deserializer::new(rdr, options);
    let value = de.deserialize_value()?;
    // Make sure the whole stream has been consumed.
    de.end()?;
    Ok(value)
}

/// Decodes a value from a byte slice `&[u8]`.
pub fn value_from_slice(v: &[u8], options: DeOptions) -> Result<Value> {
    value_from_reader(io::Cursor::new(v), options)
}

/// Decodes a value directly from an iterator.
pub fn value_from_iter<E, I>(it: I, options: DeOptions) -> Result<Value>
    where E: IterReadItem, I: Iterator<Item=E>
{
    value_from_reader(IterRead::new(it), options)
}
