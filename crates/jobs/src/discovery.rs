//! Job module discovery
//!
//! Job-definition modules register their queues through an entrypoint. The
//! hosting crate assembles the list of modules at build time (a generated
//! manifest) and hands it to [`load_job_modules`], which calls every
//! entrypoint inside its own error boundary: one broken module never keeps
//! the others from registering.

use std::panic::AssertUnwindSafe;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::processor::panic_message;
use crate::registry::QueueRegistry;

/// Registration entrypoint of a job module
///
/// `C` is whatever context the hosting process shares with its job modules
/// (mailers, clients, configuration).
pub type RegisterFn<C> = fn(&mut QueueRegistry, &C) -> anyhow::Result<()>;

/// One discovered job module
pub struct JobModule<C> {
    /// Module name, for logging
    pub name: &'static str,

    /// `None` when the module does not expose an entrypoint
    pub register: Option<RegisterFn<C>>,
}

impl<C> JobModule<C> {
    pub const fn new(name: &'static str, register: RegisterFn<C>) -> Self {
        Self {
            name,
            register: Some(register),
        }
    }

    pub const fn without_entrypoint(name: &'static str) -> Self {
        Self {
            name,
            register: None,
        }
    }
}

impl<C> Clone for JobModule<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for JobModule<C> {}

impl<C> std::fmt::Debug for JobModule<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobModule")
            .field("name", &self.name)
            .field("has_entrypoint", &self.register.is_some())
            .finish()
    }
}

/// Outcome of loading a set of job modules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    /// Modules whose entrypoint succeeded
    pub registered: Vec<&'static str>,
    /// Modules without an entrypoint
    pub skipped: Vec<&'static str>,
    /// Modules whose entrypoint failed, with the error
    pub failed: Vec<(&'static str, String)>,
}

impl DiscoveryReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty()
    }
}

/// Call every module's entrypoint once, isolating failures per module
///
/// Errors and panics are logged and recorded in the report; loading continues
/// with the next module. Modules must not depend on the order they are loaded
/// in.
pub fn load_job_modules<C>(
    registry: &mut QueueRegistry,
    modules: &[JobModule<C>],
    ctx: &C,
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();

    for module in modules {
        let Some(register) = module.register else {
            warn!(module = module.name, "Job module has no register entrypoint, skipping");
            report.skipped.push(module.name);
            continue;
        };

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| register(registry, ctx)));
        match result {
            Ok(Ok(())) => {
                debug!(module = module.name, "Loaded job module");
                report.registered.push(module.name);
            }
            Ok(Err(e)) => {
                let message = format!("{:#}", e);
                error!(module = module.name, error = %message, "Failed to load job module");
                report.failed.push((module.name, message));
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(module = module.name, error = %message, "Job module panicked during registration");
                report.failed.push((module.name, message));
            }
        }
    }

    info!(
        registered = report.registered.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "Job modules loaded"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::persistence::InMemoryJobStore;
    use crate::queue::QueueFactory;
    use crate::registry::QueueDefinition;
    use serde_json::json;

    fn registry() -> QueueRegistry {
        QueueRegistry::new(Arc::new(QueueFactory::new(Arc::new(InMemoryJobStore::new()))))
    }

    fn define(registry: &mut QueueRegistry, name: &str) -> anyhow::Result<()> {
        registry.register(QueueDefinition::new(name, |_job| async { Ok(json!(null)) }))?;
        Ok(())
    }

    fn register_a(registry: &mut QueueRegistry, _: &()) -> anyhow::Result<()> {
        define(registry, "a")
    }

    fn register_b(_: &mut QueueRegistry, _: &()) -> anyhow::Result<()> {
        anyhow::bail!("missing SMTP settings")
    }

    fn register_c(registry: &mut QueueRegistry, _: &()) -> anyhow::Result<()> {
        define(registry, "c")
    }

    fn register_panics(_: &mut QueueRegistry, _: &()) -> anyhow::Result<()> {
        panic!("bad module")
    }

    #[test]
    fn test_failing_module_does_not_stop_others() {
        let mut registry = registry();
        let modules = [
            JobModule::new("a_job", register_a),
            JobModule::new("b_job", register_b),
            JobModule::new("c_job", register_c),
        ];

        let report = load_job_modules(&mut registry, &modules, &());

        assert!(registry.has("a"));
        assert!(registry.has("c"));
        assert_eq!(registry.len(), 2);
        assert_eq!(report.registered, vec!["a_job", "c_job"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b_job");
        assert!(report.failed[0].1.contains("missing SMTP settings"));
    }

    #[test]
    fn test_panicking_module_is_isolated() {
        let mut registry = registry();
        let modules = [
            JobModule::new("boom_job", register_panics),
            JobModule::new("c_job", register_c),
        ];

        let report = load_job_modules(&mut registry, &modules, &());

        assert!(registry.has("c"));
        assert_eq!(report.failed, vec![("boom_job", "bad module".to_string())]);
    }

    #[test]
    fn test_module_without_entrypoint_is_skipped() {
        let mut registry = registry();
        let modules = [
            JobModule::without_entrypoint("notes_job"),
            JobModule::new("a_job", register_a),
        ];

        let report = load_job_modules(&mut registry, &modules, &());

        assert_eq!(report.skipped, vec!["notes_job"]);
        assert_eq!(report.registered, vec!["a_job"]);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_duplicate_registration_is_reported_as_failure() {
        let mut registry = registry();
        let modules = [
            JobModule::new("a_job", register_a),
            JobModule::new("a_again_job", register_a),
        ];

        let report = load_job_modules(&mut registry, &modules, &());

        assert_eq!(registry.len(), 1);
        assert_eq!(report.failed[0].0, "a_again_job");
        assert!(report.failed[0].1.contains("already registered"));
    }
}
