//! Execution contexts
//!
//! The supervisor talks to every process through `ExecutionContext`: post a
//! message in, poll messages out. How the process actually runs (a Web
//! Worker, an in-process sandbox) is the factory's business.

use super::error::KernelResult;
use super::process::Pid;
use super::protocol::{FromContext, ToContext};
use crate::config::KernelConfig;
use crate::loader::ScriptEngine;
use crate::sandbox::{Sandbox, SandboxOptions};
use std::collections::VecDeque;
use std::rc::Rc;

/// What a factory needs to build a context
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Source path of the main module
    pub name: String,
    pub config: KernelConfig,
}

/// One isolated process
pub trait ExecutionContext {
    /// Queue a message for the process
    fn post(&mut self, message: ToContext);

    /// Let the process run and collect what it sent, in send order
    fn poll(&mut self) -> Vec<FromContext>;

    /// Advance the process's clock; drives its syscall timeouts
    fn tick(&mut self, _now: f64) {}

    /// Stop the process immediately. Nothing it has in flight settles.
    fn terminate(&mut self);

    fn is_alive(&self) -> bool;
}

/// Creates one context per spawned process
pub trait ContextFactory {
    fn create(&self, pid: Pid, options: &ContextOptions) -> KernelResult<Box<dyn ExecutionContext>>;
}

/// Builds the script engine for each new in-process sandbox
pub type EngineFactory = Rc<dyn Fn() -> Rc<dyn ScriptEngine>>;

/// A sandbox running on the supervisor's own thread
///
/// Isolation is by construction only: the sandbox sees nothing but its
/// inbox. Used natively and by the test suites.
pub struct LocalContext {
    sandbox: Option<Sandbox>,
    inbox: VecDeque<ToContext>,
}

impl LocalContext {
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            sandbox: Some(sandbox),
            inbox: VecDeque::new(),
        }
    }
}

impl ExecutionContext for LocalContext {
    fn post(&mut self, message: ToContext) {
        if self.sandbox.is_some() {
            self.inbox.push_back(message);
        }
    }

    fn poll(&mut self) -> Vec<FromContext> {
        let Some(sandbox) = self.sandbox.as_mut() else {
            return Vec::new();
        };

        while let Some(message) = self.inbox.pop_front() {
            sandbox.handle(message);
        }
        sandbox.run_tasks();
        sandbox.take_outbox()
    }

    fn tick(&mut self, now: f64) {
        if let Some(sandbox) = self.sandbox.as_mut() {
            sandbox.tick(now);
        }
    }

    fn terminate(&mut self) {
        self.inbox.clear();
        self.sandbox = None;
    }

    fn is_alive(&self) -> bool {
        self.sandbox.is_some()
    }
}

/// Factory for `LocalContext`s
pub struct LocalContextFactory {
    engines: EngineFactory,
}

impl LocalContextFactory {
    pub fn new(engines: EngineFactory) -> Self {
        Self { engines }
    }
}

impl ContextFactory for LocalContextFactory {
    fn create(&self, pid: Pid, options: &ContextOptions) -> KernelResult<Box<dyn ExecutionContext>> {
        let sandbox = Sandbox::new(
            SandboxOptions {
                pid: pid.0,
                name: options.name.clone(),
                config: options.config.clone(),
            },
            (self.engines)(),
        );
        Ok(Box::new(LocalContext::new(sandbox)))
    }
}
