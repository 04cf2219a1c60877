use std::{collections::HashMap, fmt};

use log::debug;

use crate::errors::Result;

pub type JobFn = dyn Fn(&[u8]) -> Vec<u8> + Send + Sync;

/// Resolves job function names inside a worker process
pub trait JobExecutor {
    /// One-time environment setup, called at most once per process with the identifiers the
    /// dispatcher sent in the `includes` header
    fn setup(&mut self, _includes: &[&str]) -> Result<()> {
        Ok(())
    }

    fn resolve(&self, function: &str) -> Option<&JobFn>;
}

type SetupFn = dyn FnMut(&[&str]) -> Result<()> + Send;

/// Name-to-function map, populated once at worker startup
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Box<JobFn>>,
    setup: Option<Box<SetupFn>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_owned(), Box::new(function));
        self
    }

    /// Installs a hook that receives the `includes` sent along with the first job
    pub fn on_setup<F>(mut self, setup: F) -> Self
    where
        F: FnMut(&[&str]) -> Result<()> + Send + 'static,
    {
        self.setup = Some(Box::new(setup));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

impl JobExecutor for FunctionRegistry {
    fn setup(&mut self, includes: &[&str]) -> Result<()> {
        debug!("Worker setup with includes {:?}", includes);
        match self.setup.as_mut() {
            Some(setup) => setup(includes),
            None => Ok(()),
        }
    }

    fn resolve(&self, function: &str) -> Option<&JobFn> {
        self.functions.get(function).map(Box::as_ref)
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("setup", &self.setup.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn resolve_registered_functions() {
        let registry = FunctionRegistry::new().register("reverse", |input| {
            input.iter().rev().copied().collect()
        });
        let reverse = registry.resolve("reverse").unwrap();
        assert_eq!(reverse(b"abc"), b"cba".to_vec());
        assert!(registry.resolve("missing").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), ["reverse"]);
    }

    #[test]
    fn setup_hook_sees_includes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_hook = Arc::clone(&calls);
        let mut registry = FunctionRegistry::new().on_setup(move |includes| {
            assert_eq!(includes, ["a.so", "b.so"]);
            calls_in_hook.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        registry.setup(&["a.so", "b.so"]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
