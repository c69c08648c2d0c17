// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! The extension registry.
//!
//! Well-known globals can be registered under a small integer code, which
//! the encoder then writes with EXT1/EXT2/EXT4 (2 to 5 bytes) instead of
//! spelling out module and name.  Both ends of a stream must agree on the
//! registrations.
//!
//! The registry is process-wide.  Registration takes the write lock and is
//! checked eagerly; sessions only ever read, and cache what they read in an
//! `ExtensionCache` so repeated globals do not touch the lock again.

use std::collections::HashMap;
use lazy_static::lazy_static;
use log::info;
use parking_lot::RwLock;

use crate::error::{Error, ErrorCode, Result};
use crate::value::Global;

/// Largest valid extension code.
pub const MAX_EXTENSION_CODE: u32 = 0x7fff_ffff;

#[derive(Default)]
struct Registry {
    codes: HashMap<Global, u32>,
    globals: HashMap<u32, Global>,
}

lazy_static! {
    static ref REGISTRY: RwLock<Registry> = RwLock::new(Registry::default());
}

/// Registers `module.name` under `code`.
///
/// Registering the same pair twice is allowed.  Fails if the code is out of
/// range, or if either the code or the global is already registered
/// differently.
pub fn add_extension(module: &str, name: &str, code: u32) -> Result<()> {
    if code == 0 || code > MAX_EXTENSION_CODE {
        return Err(Error::Registry(ErrorCode::ExtensionCodeRange(code)));
    }
    let global = Global::new(module, name);
    let mut registry = REGISTRY.write();
    let existing_code = registry.codes.get(&global).copied();
    let existing_global = registry.globals.get(&code).cloned();
    match (existing_code, existing_global) {
        (Some(c), Some(ref g)) if c == code && *g == global => return Ok(()),
        (Some(c), _) => return Err(Error::Registry(ErrorCode::ExtensionGlobalTaken(global, c))),
        (None, Some(g)) => return Err(Error::Registry(ErrorCode::ExtensionCodeTaken(code, g))),
        (None, None) => {}
    }
    info!("registered extension code {} for {}", code, global);
    registry.codes.insert(global.clone(), code);
    registry.globals.insert(code, global);
    Ok(())
}

/// Unregisters `module.name`, which must be registered under `code`.
pub fn remove_extension(module: &str, name: &str, code: u32) -> Result<()> {
    let global = Global::new(module, name);
    let mut registry = REGISTRY.write();
    if registry.codes.get(&global) != Some(&code) || registry.globals.get(&code) != Some(&global) {
        return Err(Error::Registry(ErrorCode::ExtensionNotRegistered(global, code)));
    }
    info!("removed extension code {} for {}", code, global);
    registry.codes.remove(&global);
    registry.globals.remove(&code);
    Ok(())
}

/// Returns the code registered for a global.
pub fn extension_code(global: &Global) -> Option<u32> {
    REGISTRY.read().codes.get(global).copied()
}

/// Returns the global registered under a code.
pub fn extension_global(code: u32) -> Option<Global> {
    REGISTRY.read().globals.get(&code).cloned()
}

/// Per-session view of the registry.
///
/// Negative lookups are cached as well: a session sees the registry as it
/// was when a global or code was first looked up.
#[derive(Default)]
pub(crate) struct ExtensionCache {
    codes: HashMap<Global, Option<u32>>,
    globals: HashMap<u32, Option<Global>>,
}

impl ExtensionCache {
    pub fn code(&mut self, global: &Global) -> Option<u32> {
        if let Some(&code) = self.codes.get(global) {
            return code;
        }
        let code = extension_code(global);
        self.codes.insert(global.clone(), code);
        code
    }

    pub fn global(&mut self, code: u32) -> Option<Global> {
        self.globals.entry(code).or_insert_with(|| extension_global(code)).clone()
    }
}
