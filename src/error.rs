// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Error objects and codes

use std::fmt;
use std::io;
use std::error;
use std::result;

use crate::value::Global;

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorCode {
    /// Unsupported opcode
    Unsupported(char),
    /// EOF while parsing op argument
    EOFWhileParsing,
    /// Stack underflowed
    StackUnderflow,
    /// STOP found with the wrong number of values on the stack, or an open mark
    UnbalancedStack(usize),
    /// Length prefix found negative
    NegativeLength,
    /// String decoding as UTF-8 failed
    StringNotUTF8,
    /// Wrong stack top type for opcode
    InvalidStackTop(&'static str, String),
    /// Value not hashable, but used as dict key or set item
    ValueNotHashable,
    /// Hashable value nested deeper than the given limit
    NestingTooDeep(usize),
    /// A value was missing from the memo
    MissingMemo(u32),
    /// Invalid literal found
    InvalidLiteral(Vec<u8>),
    /// Found trailing bytes after STOP opcode
    TrailingBytes,
    /// Invalid value in pickle stream
    InvalidValue(String),
    /// Protocol version byte out of the supported range
    UnsupportedProtocol(u8),
    /// The stream ended inside a declared frame
    TruncatedFrame { declared: u64, available: u64 },
    /// An operand straddled the end of the current frame
    FrameExhausted,
    /// A new frame started before the current one was consumed
    FrameOverlap(usize),
    /// Extension code not present in the registry
    UnknownExtension(u32),
    /// Extension code outside 1..=0x7fffffff
    ExtensionCodeRange(u32),
    /// Extension code already bound to another global
    ExtensionCodeTaken(u32, Global),
    /// Global already bound to another extension code
    ExtensionGlobalTaken(Global, u32),
    /// Extension not registered under this code
    ExtensionNotRegistered(Global, u32),
    /// Reduce tuple with fewer than 2 or more than 6 elements
    ReduceArity(usize),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ErrorCode::Unsupported(ch) => write!(fmt, "unsupported opcode {:?}", ch),
            ErrorCode::EOFWhileParsing => write!(fmt, "EOF while parsing"),
            ErrorCode::StackUnderflow => write!(fmt, "pickle stack underflow"),
            ErrorCode::UnbalancedStack(n) =>
                write!(fmt, "STOP with {} values on the stack (or an open mark)", n),
            ErrorCode::NegativeLength => write!(fmt, "negative length prefix"),
            ErrorCode::StringNotUTF8 => write!(fmt, "string is not UTF-8 encoded"),
            ErrorCode::InvalidStackTop(what, ref it) =>
                write!(fmt, "invalid stack top, expected {}, got {}", what, it),
            ErrorCode::ValueNotHashable => write!(fmt, "dict key or set item not hashable"),
            ErrorCode::NestingTooDeep(limit) =>
                write!(fmt, "hashable value nested deeper than {} levels", limit),
            ErrorCode::MissingMemo(n) => write!(fmt, "missing memo with id {}", n),
            ErrorCode::InvalidLiteral(ref l) =>
                write!(fmt, "literal is invalid: {}", String::from_utf8_lossy(l)),
            ErrorCode::TrailingBytes => write!(fmt, "trailing bytes found"),
            ErrorCode::InvalidValue(ref s) => write!(fmt, "invalid value: {}", s),
            ErrorCode::UnsupportedProtocol(p) => write!(fmt, "unsupported pickle protocol {}", p),
            ErrorCode::TruncatedFrame { declared, available } =>
                write!(fmt, "truncated frame: {} bytes declared, {} available", declared, available),
            ErrorCode::FrameExhausted => write!(fmt, "pickle exhausted before end of frame"),
            ErrorCode::FrameOverlap(n) =>
                write!(fmt, "new frame started with {} bytes left in the current one", n),
            ErrorCode::UnknownExtension(code) => write!(fmt, "unregistered extension code {}", code),
            ErrorCode::ExtensionCodeRange(code) => write!(fmt, "extension code {} out of range", code),
            ErrorCode::ExtensionCodeTaken(code, ref g) =>
                write!(fmt, "extension code {} is already registered for {}", code, g),
            ErrorCode::ExtensionGlobalTaken(ref g, code) =>
                write!(fmt, "{} is already registered with extension code {}", g, code),
            ErrorCode::ExtensionNotRegistered(ref g, code) =>
                write!(fmt, "{} is not registered with extension code {}", g, code),
            ErrorCode::ReduceArity(n) =>
                write!(fmt, "reduce tuple must have 2 to 6 elements, got {}", n),
        }
    }
}

/// This type represents all possible errors that can occur when encoding or
/// decoding a value graph.
#[derive(Debug)]
pub enum Error {
    /// Some IO error occurred when encoding or decoding a value.
    Io(io::Error),
    /// The stream is corrupt: interpreting it failed at the given byte offset.
    Eval(ErrorCode, usize),
    /// A constructor reference at the given offset was refused or not found.
    Unresolved(Global, usize),
    /// A value has no encoding, since no reduce policy applies to its type.
    NotSerializable(String),
    /// A value needs a newer protocol than the one requested.
    ProtocolMismatch { requested: u8, required: u8 },
    /// The requested protocol version does not exist.
    UnsupportedProtocol(u8),
    /// A structure refers back to itself where that cannot be encoded.
    Recursive(String),
    /// The extension registry refused a change.
    Registry(ErrorCode),
    /// Error while transforming values, outside of a stream position.
    Syntax(ErrorCode),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::Io(error)
    }
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Io(ref error) => error.fmt(fmt),
            Error::Eval(ref code, offset) => write!(fmt, "eval error at offset {}: {}",
                                                    offset, code),
            Error::Unresolved(ref global, offset) =>
                write!(fmt, "unresolved global {} at offset {}", global, offset),
            Error::NotSerializable(ref what) => write!(fmt, "cannot pickle {}", what),
            Error::ProtocolMismatch { requested, required } =>
                write!(fmt, "protocol {} requested, but protocol {} is required", requested, required),
            Error::UnsupportedProtocol(proto) => write!(fmt, "unsupported pickle protocol {}", proto),
            Error::Recursive(ref what) => write!(fmt, "recursive structure found in {}", what),
            Error::Registry(ref code) => write!(fmt, "extension registry: {}", code),
            Error::Syntax(ref code) => write!(fmt, "decoding error: {}", code),
        }
    }
}

impl error::Error for Error {}
