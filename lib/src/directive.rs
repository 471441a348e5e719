//! Override directives: what a hook asks the tracer to change about a syscall.
//!
//! On the hook side a directive is a mapping whose keys are argument indices `"0"`..`"5"`, plus
//! `"ret"` and `"errno"` which must always come together. At entry, `ret`/`errno` skip the
//! syscall and inject that result; at exit they replace the result the tracee observes.

use log::debug;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{Result, TraceError};
use crate::platforms::MAX_ARGS;
use crate::process_state::AttachState;
use crate::registers::RegisterAccessor;
use crate::syscalls::{HandleSyscallResult, SyscallResult, MAX_ERRNO};

pub const RET_KEY: &str = "ret";
pub const ERRNO_KEY: &str = "errno";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OverrideDirective {
    /// Replacement argument values by index
    pub args: BTreeMap<usize, u64>,
    pub result: Option<SyscallResult>,
}

impl OverrideDirective {
    /// Directive skipping the syscall with the given result
    pub fn skip(ret: i64, errno: i64) -> Self {
        Self {
            args: BTreeMap::new(),
            result: Some(SyscallResult::new(ret, errno)),
        }
    }

    pub fn with_arg(mut self, index: usize, value: u64) -> Self {
        self.args.insert(index, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.result.is_none()
    }

    /// Validates a hook's return value; `null` means "no changes"
    pub fn from_value(value: &Value) -> Result<Option<Self>> {
        let map = match value {
            Value::Null => return Ok(None),
            Value::Object(map) => map,
            other => {
                return Err(TraceError::MalformedDirective(format!(
                    "expected a mapping, got {}",
                    other
                )))
            }
        };

        let mut directive = Self::default();
        let mut ret = None;
        let mut errno = None;
        for (key, value) in map {
            match key.as_str() {
                RET_KEY => ret = Some(as_i64(key, value)?),
                ERRNO_KEY => errno = Some(as_i64(key, value)?),
                _ => {
                    let index = key
                        .parse::<usize>()
                        .ok()
                        .filter(|i| *i < MAX_ARGS)
                        .ok_or_else(|| {
                            TraceError::MalformedDirective(format!("unrecognized key {:?}", key))
                        })?;
                    directive.args.insert(index, as_i64(key, value)? as u64);
                }
            }
        }

        directive.result = match (ret, errno) {
            (Some(_), Some(errno)) if !(0..=MAX_ERRNO).contains(&errno) => {
                return Err(TraceError::MalformedDirective(format!(
                    "errno {} outside 0..={}",
                    errno, MAX_ERRNO
                )))
            }
            (Some(ret), Some(errno)) => Some(SyscallResult::new(ret, errno)),
            (None, None) => None,
            _ => {
                return Err(TraceError::MalformedDirective(String::from(
                    "\"ret\" and \"errno\" must be given together",
                )))
            }
        };
        Ok(Some(directive))
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (index, value) in &self.args {
            map.insert(index.to_string(), Value::from(*value));
        }
        if let Some(result) = self.result {
            map.insert(RET_KEY.to_string(), Value::from(result.ret));
            map.insert(ERRNO_KEY.to_string(), Value::from(result.errno));
        }
        Value::Object(map)
    }

    /// Writes the directive into the stopped tracee; applying it twice has the same effect as
    /// applying it once
    pub fn apply(&self, regs: &mut RegisterAccessor) -> Result<HandleSyscallResult> {
        match regs.state() {
            AttachState::StoppedAtEntry => {
                if let Some(result) = self.result {
                    regs.skip_syscall()?;
                    // Also placed in the return register now, not only at the exit stop
                    regs.set_return_and_errno(result)?;
                    return Ok(HandleSyscallResult::Skipped(result));
                }
                for (&index, &value) in &self.args {
                    regs.set_argument(index, value)?;
                }
                if self.args.is_empty() {
                    Ok(HandleSyscallResult::Unchanged)
                } else {
                    Ok(HandleSyscallResult::ArgumentsReplaced(self.args.len()))
                }
            }
            AttachState::StoppedAtExit => {
                if !self.args.is_empty() {
                    debug!("Argument overrides have no effect after the syscall ran");
                }
                match self.result {
                    Some(result) => {
                        regs.set_return_and_errno(result)?;
                        Ok(HandleSyscallResult::ResultReplaced(result))
                    }
                    None => Ok(HandleSyscallResult::Unchanged),
                }
            }
            state => Err(TraceError::InvalidState {
                op: "apply_directive",
                state,
            }),
        }
    }
}

/// Integers only; integral floats are accepted since some hook languages only have doubles
fn as_i64(key: &str, value: &Value) -> Result<i64> {
    let n = match value {
        Value::Number(n) => n,
        other => {
            return Err(TraceError::MalformedDirective(format!(
                "value of {:?} is not a number: {}",
                key, other
            )))
        }
    };
    if let Some(i) = n.as_i64() {
        return Ok(i);
    }
    if let Some(u) = n.as_u64() {
        return Ok(u as i64);
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= u64::MAX as f64 => {
            Ok(if f > i64::MAX as f64 {
                f as u64 as i64
            } else {
                f as i64
            })
        }
        _ => Err(TraceError::MalformedDirective(format!(
            "value of {:?} is not an integer: {}",
            key, n
        ))),
    }
}
