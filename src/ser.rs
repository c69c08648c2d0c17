// Copyright (c) 2015-2016 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Pickle serialization
//!
//! The serializer walks a value graph with an explicit work list instead of
//! native recursion, so deeply nested graphs cannot overflow the stack.  Each
//! container is checked against the memo before it is descended into: a
//! container seen before is written as a memo fetch, which is what keeps
//! shared values shared and makes cycles finite.

use std::io::{self, Write};
use std::rc::Rc;
use std::collections::{BTreeMap, HashSet};
use byteorder::{LittleEndian, BigEndian, WriteBytesExt};
use log::debug;
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};

use crate::consts::*;
use crate::error::{Error, Result};
use crate::ext::ExtensionCache;
use crate::frame::Framer;
use crate::memo::{Memo, MemoKey};
use crate::object::{Construct, DefaultReducer, Reduce, Reducer};
use crate::resolve::Builtin;
use crate::value::{Global, HashableValue, Value};

/// Options for serializing.
#[derive(Clone)]
pub struct SerOptions {
    proto: u8,
    memoize: bool,
    reducer: Rc<dyn Reducer>,
}

impl Default for SerOptions {
    fn default() -> SerOptions {
        SerOptions {
            proto: HIGHEST_PROTOCOL,
            memoize: true,
            reducer: Rc::new(DefaultReducer),
        }
    }
}

impl SerOptions {
    /// Construct with default options: highest protocol, with memo.
    pub fn new() -> Self {
        Default::default()
    }

    /// Write the given protocol version (0 to 5).
    pub fn proto(mut self, proto: u8) -> Self {
        self.proto = proto;
        self
    }

    /// Write protocol 2, the highest one Python 2 can read.
    pub fn proto_v2(self) -> Self {
        self.proto(2)
    }

    /// Do not memoize.  Shared values are written once per reference, and
    /// cyclic graphs are refused.
    pub fn no_memo(mut self) -> Self {
        self.memoize = false;
        self
    }

    /// Use this policy for reducing opaque objects.
    pub fn reducer<R: Reducer + 'static>(mut self, reducer: R) -> Self {
        self.reducer = Rc::new(reducer);
        self
    }
}

/// One step of the traversal.
enum Task {
    /// Write a value (checking the memo first).
    Save(Value),
    /// Write a bare opcode.
    Op(u8),
    /// Memoize a value that is now on top of the decoder's stack.
    Memoize(Value),
    /// Write the next batch of list items, starting at an index.
    Appends(Rc<Vec<Value>>, usize),
    /// Write the next batch of dict items (flattened key/value pairs).
    SetItems(Rc<Vec<Value>>, usize),
    /// Write the next batch of set items.
    AddItems(Rc<Vec<Value>>, usize),
    /// Close a tuple whose elements have been written.
    FinishTuple { tuple: Value, len: usize, marked: bool },
    /// Close a frozenset whose elements have been written.
    FinishFrozenSet(Value),
    /// The value's contents are complete.
    Leave(MemoKey),
}

/// A structure for serializing value graphs into a Pickle stream.
pub struct Serializer<W: io::Write> {
    out: Framer<W>,
    proto: u8,
    memo: Option<Memo>,
    active: HashSet<MemoKey>,
    reducer: Rc<dyn Reducer>,
    extensions: ExtensionCache,
}

impl<W: io::Write> Serializer<W> {
    /// Creates a serializer.  Fails before writing anything if the
    /// requested protocol does not exist.
    pub fn new(writer: W, options: SerOptions) -> Result<Self> {
        if options.proto > HIGHEST_PROTOCOL {
            return Err(Error::UnsupportedProtocol(options.proto));
        }
        Ok(Serializer {
            out: Framer::new(writer),
            proto: options.proto,
            memo: if options.memoize { Some(Memo::default()) } else { None },
            active: HashSet::new(),
            reducer: options.reducer,
            extensions: ExtensionCache::default(),
        })
    }

    /// Unwrap the `Writer` from the `Serializer`.
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    /// Forget all memoized values; later dumps will not refer to them.
    pub fn clear_memo(&mut self) {
        if let Some(ref mut memo) = self.memo {
            memo.clear();
        }
    }

    /// Writes a complete pickle of the value: protocol header, opcodes,
    /// and STOP.  The memo persists between dumps.
    ///
    /// On error, the partial output already written is left to the caller
    /// to discard.  The serializer itself is reset to its state before the
    /// call: the unfinished frame is dropped and the memo forgets what was
    /// memoized, so a later dump never refers to it.
    pub fn dump(&mut self, value: &Value) -> Result<()> {
        let memo_len = self.memo.as_ref().map_or(0, Memo::len);
        let result = self.dump_value(value);
        if result.is_err() {
            self.out.discard_frame();
            if let Some(ref mut memo) = self.memo {
                memo.truncate(memo_len);
            }
        }
        result
    }

    fn dump_value(&mut self, value: &Value) -> Result<()> {
        debug!("pickling {} with protocol {}", value.type_name(), self.proto);
        if self.proto >= 2 {
            self.out.write_all(&[PROTO, self.proto])?;
        }
        if self.proto >= 4 {
            self.out.start_framing();
        }
        self.active.clear();
        let mut work = vec![Task::Save(value.clone())];
        while let Some(task) = work.pop() {
            self.run(task, &mut work)?;
        }
        self.write_opcode(STOP)?;
        self.out.end_framing()?;
        debug!("pickle complete, {} memo entries",
               self.memo.as_ref().map_or(0, Memo::len));
        Ok(())
    }

    fn run(&mut self, task: Task, work: &mut Vec<Task>) -> Result<()> {
        match task {
            Task::Save(value) => {
                self.out.commit_frame(false)?;
                self.save(value, work)
            }
            Task::Op(op) => self.write_opcode(op),
            Task::Memoize(value) => self.memoize(&value),
            Task::Appends(items, start) => self.batch_appends(items, start, work),
            Task::SetItems(items, start) => self.batch_setitems(items, start, work),
            Task::AddItems(items, start) => {
                let end = (start + BATCH_SIZE).min(items.len());
                if end < items.len() {
                    work.push(Task::AddItems(items.clone(), end));
                }
                self.write_opcode(MARK)?;
                work.push(Task::Op(ADDITEMS));
                schedule_saves(work, &items[start..end]);
                Ok(())
            }
            Task::FinishTuple { tuple, len, marked } => {
                if let Some(index) = self.memo_get(&tuple) {
                    // The tuple was reached again through its own elements
                    // and has already been written: drop this copy's
                    // elements and fetch the memoized one.
                    if !marked {
                        for _ in 0..len {
                            self.write_opcode(POP)?;
                        }
                    } else if self.proto >= 1 {
                        self.write_opcode(POP_MARK)?;
                    } else {
                        for _ in 0..=len {
                            self.write_opcode(POP)?;
                        }
                    }
                    return self.write_get(index);
                }
                self.write_opcode(match (marked, len) {
                    (false, 1) => TUPLE1,
                    (false, 2) => TUPLE2,
                    (false, _) => TUPLE3,
                    (true, _) => TUPLE,
                })?;
                self.memoize(&tuple)
            }
            Task::FinishFrozenSet(set) => {
                self.write_opcode(FROZENSET)?;
                self.memoize(&set)
            }
            Task::Leave(key) => {
                self.active.remove(&key);
                Ok(())
            }
        }
    }

    #[inline]
    fn write_opcode(&mut self, opcode: u8) -> Result<()> {
        self.out.write_all(&[opcode]).map_err(From::from)
    }

    fn memo_get(&self, value: &Value) -> Option<u32> {
        match (self.memo.as_ref(), MemoKey::of(value)) {
            (Some(memo), Some(key)) => memo.get(&key),
            _ => None,
        }
    }

    /// Assigns the next memo index to the value on top of the stack, and
    /// tells the decoder to do the same.
    fn memoize(&mut self, value: &Value) -> Result<()> {
        let (memo, key) = match (self.memo.as_mut(), MemoKey::of(value)) {
            (Some(memo), Some(key)) => (memo, key),
            _ => return Ok(()),
        };
        let index = memo.put(key, value);
        if self.proto >= 4 {
            self.write_opcode(MEMOIZE)
        } else if self.proto >= 1 {
            if index < 256 {
                self.write_opcode(BINPUT)?;
                self.out.write_u8(index as u8).map_err(From::from)
            } else {
                self.write_opcode(LONG_BINPUT)?;
                self.out.write_u32::<LittleEndian>(index).map_err(From::from)
            }
        } else {
            self.write_opcode(PUT)?;
            write!(self.out, "{}\n", index).map_err(From::from)
        }
    }

    fn write_get(&mut self, index: u32) -> Result<()> {
        if self.proto >= 1 {
            if index < 256 {
                self.write_opcode(BINGET)?;
                self.out.write_u8(index as u8).map_err(From::from)
            } else {
                self.write_opcode(LONG_BINGET)?;
                self.out.write_u32::<LittleEndian>(index).map_err(From::from)
            }
        } else {
            self.write_opcode(GET)?;
            write!(self.out, "{}\n", index).map_err(From::from)
        }
    }

    /// Marks a container or object as being written.  Without a memo, this
    /// is what detects cycles.
    fn enter(&mut self, value: &Value, work: &mut Vec<Task>) -> Result<()> {
        // With a memo, a tuple reached again through its own elements is
        // fixed up when it is finished.
        if self.memo.is_some() {
            if let Value::Tuple(_) = *value {
                return Ok(());
            }
        }
        if let Some(key) = MemoKey::of(value) {
            if !self.active.insert(key.clone()) {
                return Err(Error::Recursive(value.type_name()));
            }
            work.push(Task::Leave(key));
        }
        Ok(())
    }

    fn require(&self, required: u8) -> Result<()> {
        if self.proto < required {
            return Err(Error::ProtocolMismatch { requested: self.proto, required });
        }
        Ok(())
    }

    fn save(&mut self, value: Value, work: &mut Vec<Task>) -> Result<()> {
        if let Some(index) = self.memo_get(&value) {
            return self.write_get(index);
        }
        match value {
            Value::None => self.write_opcode(NONE),
            Value::Bool(b) => self.save_bool(b),
            Value::I64(i) => self.save_i64(i),
            Value::Int(ref i) => match i.to_i64() {
                Some(i) => self.save_i64(i),
                None => self.save_bigint(i),
            },
            Value::F64(f) => self.save_f64(f),
            Value::Bytes(ref b) => self.save_bytes(b, work),
            Value::String(ref s) => self.save_str(s),
            Value::Global(ref g) => self.save_global(&value, g, work),
            Value::List(ref l) => {
                if self.proto >= 1 {
                    self.write_opcode(EMPTY_LIST)?;
                } else {
                    self.write_opcode(MARK)?;
                    self.write_opcode(LIST)?;
                }
                self.memoize(&value)?;
                let items = Rc::new(l.borrow().clone());
                self.enter(&value, work)?;
                work.push(Task::Appends(items, 0));
                Ok(())
            }
            Value::Dict(ref d) => {
                if self.proto >= 1 {
                    self.write_opcode(EMPTY_DICT)?;
                } else {
                    self.write_opcode(MARK)?;
                    self.write_opcode(DICT)?;
                }
                self.memoize(&value)?;
                let items = Rc::new(flatten_dict(&d.borrow()));
                self.enter(&value, work)?;
                work.push(Task::SetItems(items, 0));
                Ok(())
            }
            Value::Tuple(ref t) => self.save_tuple(&value, t, work),
            Value::Set(ref s) => {
                let items: Vec<Value> = s.borrow().iter().cloned().map(Value::from).collect();
                if self.proto >= 4 {
                    self.write_opcode(EMPTY_SET)?;
                    self.memoize(&value)?;
                    self.enter(&value, work)?;
                    work.push(Task::AddItems(Rc::new(items), 0));
                    Ok(())
                } else {
                    self.save_builtin_reduce(&value, "set", items, work)
                }
            }
            Value::FrozenSet(ref s) => {
                let items: Vec<Value> = s.iter().cloned().map(Value::from).collect();
                if self.proto >= 4 {
                    // Items are plain data, so a frozenset never contains
                    // itself and needs no fix-up.
                    self.write_opcode(MARK)?;
                    work.push(Task::FinishFrozenSet(value.clone()));
                    schedule_saves(work, &items);
                    Ok(())
                } else {
                    self.save_builtin_reduce(&value, "frozenset", items, work)
                }
            }
            Value::Object(ref o) => {
                let reduce = match self.reducer.reduce(o, self.proto)? {
                    Some(reduce) => reduce,
                    None => return Err(Error::NotSerializable(o.type_name())),
                };
                self.save_reduce(&value, reduce, work)
            }
        }
    }

    fn save_bool(&mut self, value: bool) -> Result<()> {
        if self.proto >= 2 {
            self.write_opcode(if value { NEWTRUE } else { NEWFALSE })
        } else {
            self.write_opcode(INT)?;
            self.out.write_all(if value { b"01\n" } else { b"00\n" }).map_err(From::from)
        }
    }

    fn save_i64(&mut self, value: i64) -> Result<()> {
        if self.proto >= 1 {
            if 0 <= value && value <= 0xff {
                self.write_opcode(BININT1)?;
                return self.out.write_u8(value as u8).map_err(From::from);
            }
            if 0 <= value && value <= 0xffff {
                self.write_opcode(BININT2)?;
                return self.out.write_u16::<LittleEndian>(value as u16).map_err(From::from);
            }
            if -0x8000_0000 <= value && value <= 0x7fff_ffff {
                self.write_opcode(BININT)?;
                return self.out.write_i32::<LittleEndian>(value as i32).map_err(From::from);
            }
        }
        if self.proto >= 2 {
            return self.save_bigint(&BigInt::from(value));
        }
        if -0x8000_0000 <= value && value <= 0x7fff_ffff {
            self.write_opcode(INT)?;
            write!(self.out, "{}\n", value).map_err(From::from)
        } else {
            self.write_opcode(LONG)?;
            write!(self.out, "{}L\n", value).map_err(From::from)
        }
    }

    fn save_bigint(&mut self, i: &BigInt) -> Result<()> {
        if self.proto < 2 {
            self.write_opcode(LONG)?;
            return write!(self.out, "{}L\n", i).map_err(From::from);
        }
        // Minimal little-endian two's complement; zero is the empty string.
        let bytes = if i.is_zero() { Vec::new() } else { i.to_signed_bytes_le() };
        if bytes.len() < 256 {
            self.write_opcode(LONG1)?;
            self.out.write_u8(bytes.len() as u8)?;
        } else {
            self.write_opcode(LONG4)?;
            self.out.write_u32::<LittleEndian>(bytes.len() as u32)?;
        }
        self.out.write_all(&bytes).map_err(From::from)
    }

    fn save_f64(&mut self, value: f64) -> Result<()> {
        if self.proto >= 1 {
            self.write_opcode(BINFLOAT)?;
            // Yes, this one is big endian.
            self.out.write_f64::<BigEndian>(value).map_err(From::from)
        } else {
            self.write_opcode(FLOAT)?;
            write!(self.out, "{:?}\n", value).map_err(From::from)
        }
    }

    fn save_str(&mut self, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        if self.proto == 0 {
            self.write_opcode(UNICODE)?;
            self.out.write_all(&raw_unicode_escape(value))?;
            return self.write_opcode(b'\n');
        }
        if bytes.len() < 256 && self.proto >= 4 {
            self.write_opcode(SHORT_BINUNICODE)?;
            self.out.write_u8(bytes.len() as u8)?;
            return self.out.write_all(bytes).map_err(From::from);
        }
        let header = if bytes.len() as u64 > 0xffff_ffff {
            self.require(4)?;
            let mut header = vec![BINUNICODE8];
            header.write_u64::<LittleEndian>(bytes.len() as u64)?;
            header
        } else {
            let mut header = vec![BINUNICODE];
            header.write_u32::<LittleEndian>(bytes.len() as u32)?;
            header
        };
        self.write_payload(&header, bytes)
    }

    fn save_bytes(&mut self, value: &[u8], work: &mut Vec<Task>) -> Result<()> {
        if self.proto < 3 {
            // Protocols without a bytes type spell them as a call, like
            // Python does: bytes() or _codecs.encode(latin1_text, 'latin1').
            let module = Builtin::builtins_module(self.proto);
            let (callable, args) = if value.is_empty() {
                (Global::new(module, "bytes"), vec![])
            } else {
                let text: String = value.iter().map(|&b| b as char).collect();
                (Global::new("_codecs", "encode"),
                 vec![Value::String(text), Value::String("latin1".into())])
            };
            work.push(Task::Op(REDUCE));
            self.schedule_tuple(work, args);
            work.push(Task::Save(Value::Global(callable)));
            return Ok(());
        }
        if value.len() < 256 {
            self.write_opcode(SHORT_BINBYTES)?;
            self.out.write_u8(value.len() as u8)?;
            return self.out.write_all(value).map_err(From::from);
        }
        let header = if value.len() as u64 > 0xffff_ffff {
            self.require(4)?;
            let mut header = vec![BINBYTES8];
            header.write_u64::<LittleEndian>(value.len() as u64)?;
            header
        } else {
            let mut header = vec![BINBYTES];
            header.write_u32::<LittleEndian>(value.len() as u32)?;
            header
        };
        self.write_payload(&header, value)
    }

    /// Writes a length-prefixed payload, outside of frames if it is large.
    fn write_payload(&mut self, header: &[u8], payload: &[u8]) -> Result<()> {
        if payload.len() >= FRAME_SIZE_TARGET && self.out.is_framing() {
            self.out.write_large(header, payload).map_err(From::from)
        } else {
            self.out.reserve(header.len() + payload.len())?;
            self.out.write_all(header)?;
            self.out.write_all(payload).map_err(From::from)
        }
    }

    fn save_tuple(&mut self, value: &Value, items: &Rc<[Value]>, work: &mut Vec<Task>) -> Result<()> {
        let len = items.len();
        if len == 0 {
            return if self.proto >= 1 {
                self.write_opcode(EMPTY_TUPLE)
            } else {
                self.write_opcode(MARK)?;
                self.write_opcode(TUPLE)
            };
        }
        self.enter(value, work)?;
        let marked = !(len <= 3 && self.proto >= 2);
        if marked {
            self.write_opcode(MARK)?;
        }
        work.push(Task::FinishTuple { tuple: value.clone(), len, marked });
        schedule_saves(work, items);
        Ok(())
    }

    /// Schedules an anonymous (never memoized) tuple of values.
    fn schedule_tuple(&self, work: &mut Vec<Task>, items: Vec<Value>) {
        let len = items.len();
        if len == 0 && self.proto >= 1 {
            work.push(Task::Op(EMPTY_TUPLE));
        } else if len <= 3 && self.proto >= 2 {
            work.push(Task::Op([EMPTY_TUPLE, TUPLE1, TUPLE2, TUPLE3][len]));
            schedule_saves(work, &items);
        } else {
            work.push(Task::Op(TUPLE));
            schedule_saves(work, &items);
            work.push(Task::Op(MARK));
        }
    }

    /// Schedules an anonymous dict of keyword arguments.
    fn schedule_kwargs(&self, work: &mut Vec<Task>, kwargs: &BTreeMap<String, Value>) {
        let items: Vec<Value> = kwargs.iter()
            .flat_map(|(k, v)| vec![Value::String(k.clone()), v.clone()])
            .collect();
        work.push(Task::SetItems(Rc::new(items), 0));
        work.push(Task::Op(EMPTY_DICT));
    }

    fn save_builtin_reduce(&mut self, value: &Value, name: &str, items: Vec<Value>,
                           work: &mut Vec<Task>) -> Result<()> {
        let callable = Global::new(Builtin::builtins_module(self.proto), name);
        let construct = Construct::Call { callable, args: vec![Value::list(items)] };
        self.save_reduce(value, Reduce::new(construct), work)
    }

    fn save_global(&mut self, value: &Value, global: &Global, work: &mut Vec<Task>) -> Result<()> {
        if self.proto >= 2 {
            if let Some(code) = self.extensions.code(global) {
                if code <= 0xff {
                    self.write_opcode(EXT1)?;
                    return self.out.write_u8(code as u8).map_err(From::from);
                } else if code <= 0xffff {
                    self.write_opcode(EXT2)?;
                    return self.out.write_u16::<LittleEndian>(code as u16).map_err(From::from);
                } else {
                    self.write_opcode(EXT4)?;
                    return self.out.write_i32::<LittleEndian>(code as i32).map_err(From::from);
                }
            }
        }
        if self.proto >= 4 {
            work.push(Task::Memoize(value.clone()));
            work.push(Task::Op(STACK_GLOBAL));
            work.push(Task::Save(Value::String(global.name.clone())));
            work.push(Task::Save(Value::String(global.module.clone())));
            return Ok(());
        }
        if global.is_qualified() {
            self.require(4)?;
        }
        if global.module.contains('\n') || global.name.contains('\n') {
            return Err(Error::NotSerializable(format!("global {:?}", global.to_string())));
        }
        self.write_opcode(GLOBAL)?;
        write!(self.out, "{}\n{}\n", global.module, global.name)?;
        self.memoize(value)
    }

    /// Writes a reduced object.  Tasks are pushed in reverse order of
    /// execution.
    fn save_reduce(&mut self, value: &Value, reduce: Reduce, work: &mut Vec<Task>) -> Result<()> {
        if let Construct::NewEx { .. } = reduce.construct {
            self.require(4)?;
        }
        // The object stays active until it is complete, so that it cannot
        // turn up in its own constructor arguments.
        self.enter(value, work)?;

        if let Some(state) = reduce.state {
            match reduce.state_setter {
                None => {
                    work.push(Task::Op(BUILD));
                    work.push(Task::Save(state));
                }
                Some(setter) => {
                    // setter(obj, state), result discarded
                    work.push(Task::Op(POP));
                    work.push(Task::Op(REDUCE));
                    self.schedule_tuple(work, vec![value.clone(), state]);
                    work.push(Task::Save(Value::Global(setter)));
                }
            }
        }
        if !reduce.dict_items.is_empty() {
            let items = reduce.dict_items.into_iter().flat_map(|(k, v)| vec![k, v]).collect();
            work.push(Task::SetItems(Rc::new(items), 0));
        }
        if !reduce.list_items.is_empty() {
            work.push(Task::Appends(Rc::new(reduce.list_items), 0));
        }
        work.push(Task::Memoize(value.clone()));

        match reduce.construct {
            Construct::Call { callable, args } => {
                work.push(Task::Op(REDUCE));
                self.schedule_tuple(work, args);
                work.push(Task::Save(Value::Global(callable)));
            }
            Construct::New { class, args } if self.proto >= 2 => {
                work.push(Task::Op(NEWOBJ));
                self.schedule_tuple(work, args);
                work.push(Task::Save(Value::Global(class)));
            }
            Construct::New { class, mut args } => {
                args.insert(0, Value::Global(class));
                work.push(Task::Op(REDUCE));
                self.schedule_tuple(work, args);
                work.push(Task::Save(Value::global("copyreg", "__newobj__")));
            }
            Construct::NewEx { class, args, kwargs } => {
                work.push(Task::Op(NEWOBJ_EX));
                self.schedule_kwargs(work, &kwargs);
                self.schedule_tuple(work, args);
                work.push(Task::Save(Value::Global(class)));
            }
        }
        Ok(())
    }

    fn batch_appends(&mut self, items: Rc<Vec<Value>>, start: usize, work: &mut Vec<Task>) -> Result<()> {
        if self.proto == 0 {
            for item in items.iter().rev() {
                work.push(Task::Op(APPEND));
                work.push(Task::Save(item.clone()));
            }
            return Ok(());
        }
        let end = (start + BATCH_SIZE).min(items.len());
        if end < items.len() {
            work.push(Task::Appends(items.clone(), end));
        }
        match end - start {
            0 => {}
            1 => {
                work.push(Task::Op(APPEND));
                work.push(Task::Save(items[start].clone()));
            }
            _ => {
                self.write_opcode(MARK)?;
                work.push(Task::Op(APPENDS));
                schedule_saves(work, &items[start..end]);
            }
        }
        Ok(())
    }

    fn batch_setitems(&mut self, items: Rc<Vec<Value>>, start: usize, work: &mut Vec<Task>) -> Result<()> {
        if self.proto == 0 {
            for pair in items.chunks(2).rev() {
                work.push(Task::Op(SETITEM));
                schedule_saves(work, pair);
            }
            return Ok(());
        }
        let end = (start + 2 * BATCH_SIZE).min(items.len());
        if end < items.len() {
            work.push(Task::SetItems(items.clone(), end));
        }
        match (end - start) / 2 {
            0 => {}
            1 => {
                work.push(Task::Op(SETITEM));
                schedule_saves(work, &items[start..end]);
            }
            _ => {
                self.write_opcode(MARK)?;
                work.push(Task::Op(SETITEMS));
                schedule_saves(work, &items[start..end]);
            }
        }
        Ok(())
    }
}

/// Pushes saves so that they run in the order of `items`.
fn schedule_saves(work: &mut Vec<Task>, items: &[Value]) {
    work.extend(items.iter().rev().cloned().map(Task::Save));
}

fn flatten_dict(dict: &BTreeMap<HashableValue, Value>) -> Vec<Value> {
    let mut items = Vec::with_capacity(2 * dict.len());
    for (key, value) in dict {
        items.push(key.clone().into_value());
        items.push(value.clone());
    }
    items
}

/// Python's "raw-unicode-escape" codec, plus escaping of the characters
/// that would break the line-based UNICODE argument.
fn raw_unicode_escape(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' | '\0' | '\n' | '\r' | '\x1a' =>
                out.extend(format!("\\u{:04x}", ch as u32).bytes()),
            ch if (ch as u32) < 0x100 => out.push(ch as u32 as u8),
            ch if (ch as u32) < 0x10000 => out.extend(format!("\\u{:04x}", ch as u32).bytes()),
            ch => out.extend(format!("\\U{:08x}", ch as u32).bytes()),
        }
    }
    out
}

/// Encode the value into a pickle stream.
pub fn value_to_writer<W: io::Write>(writer: &mut W, value: &Value, options: SerOptions)
                                     -> Result<()> {
    let mut ser = Serializer::new(writer, options)?;
    ser.dump(value)
}

/// Encode the value into a `Vec<u8>` buffer.
#[inline]
pub fn value_to_vec(value: &Value, options: SerOptions) -> Result<Vec<u8>> {
    let mut writer = Vec::with_capacity(128);
    value_to_writer(&mut writer, value, options)?;
    Ok(writer)
}
