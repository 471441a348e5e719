use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::bridge::HookContext;
use crate::error::Result;
use crate::syscalls::Phase;

/// Signature of a hook: the context of the stop, the syscall's six arguments as seen at this
/// point of the dispatch, and an optional override directive in return
pub type HookFn = dyn Fn(&mut HookContext<'_>, &[Value]) -> Result<Option<Value>> + Send + Sync;

/// A named, shareable hook
#[derive(Clone)]
pub struct Hook {
    name: String,
    func: Arc<HookFn>,
}

impl Hook {
    pub fn new<S, F>(name: S, func: F) -> Self
    where
        S: Into<String>,
        F: Fn(&mut HookContext<'_>, &[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn call(&self, ctx: &mut HookContext<'_>, args: &[Value]) -> Result<Option<Value>> {
        (self.func)(ctx, args)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Hook").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone)]
pub struct HookRegistration {
    pub sysno: u64,
    pub phase: Phase,

    /// Registration order across the whole registry
    pub ordinal: usize,
    hook: Hook,
}

impl HookRegistration {
    pub fn hook(&self) -> &Hook {
        &self.hook
    }

    pub fn name(&self) -> &str {
        self.hook.name()
    }
}

/// Hooks by syscall number and phase, kept in registration order
///
/// Registration happens before tracing starts; once tracing, the registry is shared read-only.
#[derive(Debug, Default)]
pub struct HookRegistry {
    table: HashMap<(u64, Phase), Vec<HookRegistration>>,
    next_ordinal: usize,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `hook` for (`sysno`, `phase`) and returns its ordinal
    pub fn register(&mut self, sysno: u64, phase: Phase, hook: Hook) -> usize {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.table
            .entry((sysno, phase))
            .or_default()
            .push(HookRegistration {
                sysno,
                phase,
                ordinal,
                hook,
            });
        ordinal
    }

    pub fn add_cb_before<F>(&mut self, sysno: u64, func: F) -> usize
    where
        F: Fn(&mut HookContext<'_>, &[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        let name = format!("before_{}#{}", sysno, self.next_ordinal);
        self.register(sysno, Phase::Before, Hook::new(name, func))
    }

    pub fn add_cb_after<F>(&mut self, sysno: u64, func: F) -> usize
    where
        F: Fn(&mut HookContext<'_>, &[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        let name = format!("after_{}#{}", sysno, self.next_ordinal);
        self.register(sysno, Phase::After, Hook::new(name, func))
    }

    /// Hooks for (`sysno`, `phase`) in registration order; empty if there are none
    pub fn lookup(&self, sysno: u64, phase: Phase) -> &[HookRegistration] {
        self.table
            .get(&(sysno, phase))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Removes the registration with `ordinal`, returning whether it existed
    pub fn unregister(&mut self, ordinal: usize) -> bool {
        let mut found = false;
        self.table.retain(|_, hooks| {
            let before = hooks.len();
            hooks.retain(|h| h.ordinal != ordinal);
            found |= hooks.len() != before;
            !hooks.is_empty()
        });
        found
    }

    pub fn len(&self) -> usize {
        self.table.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
