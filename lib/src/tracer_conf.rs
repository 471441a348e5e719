use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{self, Value};
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use crate::directive::OverrideDirective;
use crate::error::{Result, TraceError};
use crate::hooks::{Hook, HookRegistry};
use crate::platforms::PlatformHandler;
use crate::syscalls::Phase;

/// A syscall given either by number or by its name in the platform's syscall table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SyscallRef {
    Number(u64),
    Name(String),
}

impl SyscallRef {
    pub fn resolve(&self, platform: &dyn PlatformHandler) -> Result<u64> {
        match self {
            SyscallRef::Number(n) => Ok(*n),
            SyscallRef::Name(name) => platform
                .syscall_number_by_name(name)
                .ok_or_else(|| TraceError::Config(format!("unknown syscall {:?}", name))),
        }
    }
}

impl fmt::Display for SyscallRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyscallRef::Number(n) => write!(f, "{}", n),
            SyscallRef::Name(name) => write!(f, "{}", name),
        }
    }
}

/// One declarative hook
///
/// Without a `directive` the rule only logs the call; with one it returns that directive
/// every time it fires.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HookRule {
    pub syscall: SyscallRef,
    pub phase: Phase,

    /// Only fire for processes whose `argv[0]` is exactly this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argv0: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive: Option<Value>,
}

/// Hooks loaded from (and saved to) a JSON file
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct TracerConf {
    #[serde(default)]
    pub hooks: Vec<HookRule>,
}

impl TracerConf {
    /// Loads the `TracerConf` from a JSON file
    pub fn from_file<P: AsRef<Path>>(filename: P) -> Result<Self> {
        let mut file = File::open(filename.as_ref())?;
        let mut ser = String::new();
        file.read_to_string(&mut ser)?;
        Self::from_json(&ser)
    }

    pub fn from_json(ser: &str) -> Result<Self> {
        Ok(serde_json::from_str(ser)?)
    }

    pub fn add_rule(&mut self, rule: HookRule) {
        self.hooks.push(rule);
    }

    /// Saves the `TracerConf` to a JSON file
    pub fn write_to_file<P: AsRef<Path>>(&self, filename: P) -> Result<()> {
        let ser: String = serde_json::to_string_pretty(self)?;
        let mut file = File::create(filename.as_ref())?;
        Ok(file.write_all(ser.as_bytes())?)
    }

    /// Builds a hook per rule, in file order
    ///
    /// Unknown syscall names and malformed directives are reported here, before anything is
    /// traced.
    pub fn into_registry(&self, platform: &dyn PlatformHandler) -> Result<HookRegistry> {
        let mut registry = HookRegistry::new();
        for (i, rule) in self.hooks.iter().enumerate() {
            let sysno = rule.syscall.resolve(platform)?;
            if let Some(ref raw) = rule.directive {
                OverrideDirective::from_value(raw).map_err(|e| {
                    TraceError::Config(format!("hook {} ({} {}): {}", i, rule.phase, rule.syscall, e))
                })?;
            }
            let name = format!("{}:{}#{}", rule.phase, rule.syscall, i);
            registry.register(sysno, rule.phase, rule_hook(name.clone(), rule.clone()));
            info!("Loaded hook {}", name);
        }
        Ok(registry)
    }
}

fn rule_hook(name: String, rule: HookRule) -> Hook {
    let label = name.clone();
    Hook::new(name, move |ctx, args| {
        if let Some(ref want) = rule.argv0 {
            let argv = ctx.get_argv()?;
            if argv.first() != Some(want) {
                return Ok(None);
            }
        }
        match rule.directive {
            Some(ref directive) => Ok(Some(directive.clone())),
            None => {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                let outcome = match (ctx.ret(), ctx.errno()) {
                    (Some(ret), Some(errno)) => format!(" = {} (errno {})", ret, errno),
                    _ => String::new(),
                };
                ctx.log(&format!("{}({}){}", label, args.join(", "), outcome));
                Ok(None)
            }
        }
    })
}

/// Predicate over a process's `argv` deciding whether hooks run for it
pub type ProcessFilter = Arc<dyn Fn(&[String]) -> bool + Send + Sync>;

/// Configuration of the tracer that only exists at runtime
#[derive(Clone)]
pub struct RuntimeConf {
    /// Processes rejected by the filter are still traced, but never dispatched to hooks
    pub process_filter: Option<ProcessFilter>,

    /// Kill spawned tracees if the tracer exits (`PTRACE_O_EXITKILL`); never applied to
    /// processes the tracer attached to
    pub kill_on_exit: bool,
}

impl Default for RuntimeConf {
    fn default() -> Self {
        Self {
            process_filter: None,
            kill_on_exit: true,
        }
    }
}

impl fmt::Debug for RuntimeConf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RuntimeConf")
            .field("process_filter", &self.process_filter.is_some())
            .field("kill_on_exit", &self.kill_on_exit)
            .finish()
    }
}

impl RuntimeConf {
    pub fn set_process_filter<F>(&mut self, filter: F)
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.process_filter = Some(Arc::new(filter));
    }

    /// Only dispatch hooks for processes whose `argv[0]` equals `argv0`
    pub fn match_argv0<S: Into<String>>(&mut self, argv0: S) {
        let argv0 = argv0.into();
        self.set_process_filter(move |argv| argv.first() == Some(&argv0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::NativeHandler;
    use serde_json::json;

    const CONF: &str = r#"{
        "hooks": [
            { "syscall": "bind", "phase": "before", "argv0": "./server",
              "directive": { "ret": -1, "errno": 98 } },
            { "syscall": 1, "phase": "after" }
        ]
    }"#;

    #[test]
    fn parses_rules() {
        let conf = TracerConf::from_json(CONF).unwrap();
        assert_eq!(conf.hooks.len(), 2);
        assert_eq!(conf.hooks[0].syscall, SyscallRef::Name(String::from("bind")));
        assert_eq!(conf.hooks[0].argv0.as_deref(), Some("./server"));
        assert_eq!(conf.hooks[1].syscall, SyscallRef::Number(1));
        assert_eq!(conf.hooks[1].phase, Phase::After);
        assert!(conf.hooks[1].directive.is_none());
    }

    #[test]
    fn builds_registry() {
        let conf = TracerConf::from_json(CONF).unwrap();
        let registry = conf.into_registry(&NativeHandler::new()).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup(49, Phase::Before).len(), 1);
        assert_eq!(registry.lookup(1, Phase::After)[0].name(), "after:1#1");
    }

    #[test]
    fn rejects_unknown_syscall_and_bad_directive() {
        let platform = NativeHandler::new();
        let mut conf = TracerConf::default();
        conf.add_rule(HookRule {
            syscall: SyscallRef::Name(String::from("frobnicate")),
            phase: Phase::Before,
            argv0: None,
            directive: None,
        });
        assert!(matches!(conf.into_registry(&platform), Err(TraceError::Config(_))));

        let mut conf = TracerConf::default();
        conf.add_rule(HookRule {
            syscall: SyscallRef::Number(49),
            phase: Phase::Before,
            argv0: None,
            directive: Some(json!({"ret": -1})),
        });
        assert!(matches!(conf.into_registry(&platform), Err(TraceError::Config(_))));
    }

    #[test]
    fn file_round_trip() {
        let conf = TracerConf::from_json(CONF).unwrap();
        let path = std::env::temp_dir().join(format!("syshook-conf-{}.json", std::process::id()));
        conf.write_to_file(&path).unwrap();
        let loaded = TracerConf::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, conf);
    }

    #[test]
    fn argv0_filter() {
        let mut conf = RuntimeConf::default();
        conf.match_argv0("./server");
        let filter = conf.process_filter.unwrap();
        assert!(filter(&[String::from("./server"), String::from("8080")]));
        assert!(!filter(&[String::from("./client")]));
        assert!(!filter(&[]));
        assert!(RuntimeConf::default().kill_on_exit);
    }
}
