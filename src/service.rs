//! The service trait and the factory registry.
//!
//! Service types are registered by name as constructor closures; the
//! original design of loading them from shared objects has no counterpart
//! here, so registration is programmatic and happens on the [`Config`]
//! before the runtime starts.
//!
//! [`Config`]: crate::Config

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::ServiceContext;
use crate::error::Error;
use crate::logger::LoggerService;
use crate::mq::Message;
use crate::runtime::Runtime;

/// An actor-like unit with a private inbox and a message callback.
///
/// Callbacks are cooperative: the runtime runs one message to completion
/// before the worker yields, and never runs two callbacks of the same
/// service concurrently.
pub trait Service: Send {
    fn message(&mut self, rt: &Arc<Runtime>, ctx: &ServiceContext, msg: Message);
}

type Factory = dyn Fn(&Arc<Runtime>, &str) -> Result<Box<dyn Service>, Error> + Send + Sync;

/// Named service constructors. The logger factory is pre-registered.
pub(crate) struct Registry {
    factories: HashMap<String, Arc<Factory>>,
}

impl Registry {
    pub(crate) fn with_builtins() -> Registry {
        let mut registry = Registry {
            factories: HashMap::new(),
        };
        registry.insert("logger", |_rt, args| {
            Ok(Box::new(LoggerService::new(args)?) as Box<dyn Service>)
        });
        registry
    }

    pub(crate) fn insert<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Arc<Runtime>, &str) -> Result<Box<dyn Service>, Error> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Factory>> {
        self.factories.get(name).cloned()
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::with_builtins()
    }
}

/// Split a bootstrap command line into a service-type name and its
/// argument tail.
pub(crate) fn split_cmdline(cmdline: &str) -> (&str, &str) {
    let cmdline = cmdline.trim_start();
    match cmdline.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim_start()),
        None => (cmdline, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_splits_name_and_tail() {
        assert_eq!(split_cmdline("echo hello world"), ("echo", "hello world"));
    }

    #[test]
    fn cmdline_without_args_has_empty_tail() {
        assert_eq!(split_cmdline("echo"), ("echo", ""));
    }

    #[test]
    fn cmdline_skips_spaces_before_tail() {
        assert_eq!(split_cmdline("echo    hello"), ("echo", "hello"));
    }

    #[test]
    fn cmdline_tail_sheds_any_kind_of_whitespace() {
        assert_eq!(split_cmdline("echo \thello"), ("echo", "hello"));
        assert_eq!(split_cmdline("echo\t hello"), ("echo", "hello"));
    }

    #[test]
    fn registry_resolves_builtin_logger() {
        let registry = Registry::with_builtins();
        assert!(registry.get("logger").is_some());
        assert!(registry.get("nonesuch").is_none());
    }
}
