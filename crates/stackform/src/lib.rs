//! # Stackform
//!
//! Stackform composes independently deployable infrastructure stacks into a
//! synthesized cloud assembly.
//!
//! Each stack is built by a [`Stage`]: a [`StackDescriptor`] naming the
//! outputs the stack requires and the outputs it promises, paired with a
//! build function. [`compose`] runs the stages in the order given, handing
//! each one exactly the outputs it asked for and merging what it returns into
//! an append-only [`OutputMap`].
//!
//! ## Concepts
//!
//! - **Stack**: one deployable unit of infrastructure, named
//!   `{namespace}-{Kind}`.
//! - **Output map**: the handles a stack exposes to the stacks after it.
//!   Keys are defined once and never overwritten.
//! - **Provisioner**: where declarations go. [`synth::Synth`] records them as
//!   one template per stack; applying, diffing and destroying that assembly
//!   is the job of the provisioning engine it is handed to.
//!
//! Composition is a single synchronous forward pass. The first failing stage
//! aborts it; nothing is retried.
//!
//! ## Error Handling
//!
//! [`Error`] covers everything [`compose`] and the configuration loader can
//! report. [`Error::kind`] names the category and [`Error::stage`] the stage
//! that failed, if any.
use std::collections::BTreeSet;

use snafu::prelude::*;

pub mod config;
pub mod output;
pub mod provision;
pub mod scenario;
pub mod stacks;
pub mod synth;
#[cfg(test)]
mod test;
pub mod utils;

pub use config::{Config, Environment, ImageChoice};
pub use output::{Handle, OutputMap, ResourceRef};
pub use provision::{Declaration, DeletionPolicy, Provisioner, Scope};
pub use scenario::Scenario;

/// Key under which the namespace is passed to every stage.
pub const NAMESPACE: &str = "namespace";

/// Top-level error enum that encompasses all errors.
#[derive(snafu::Snafu, Debug)]
pub enum Error {
    #[snafu(display("{source}"))]
    Configuration { source: config::Error },

    #[snafu(display(
        "Stage '{stage}' requires output '{key}', which no earlier stage produces"
    ))]
    MissingDependency { stage: String, key: String },

    #[snafu(display("Stage '{stage}' redefines output '{key}', which is already defined"))]
    DuplicateOutput { stage: String, key: String },

    #[snafu(display("Stage '{stage}' did not produce its declared output '{key}'"))]
    UnfulfilledOutput { stage: String, key: String },

    #[snafu(display("Stage '{stage}' produced '{key}', which it does not declare"))]
    UndeclaredOutput { stage: String, key: String },

    #[snafu(display("Error building '{stage}': {}",
                error.chain()
                    .map(|e| format!("{e}"))
                    .collect::<Vec<_>>()
                    .join("\n -> ")))]
    Build { stage: String, error: anyhow::Error },

    #[snafu(display("Could not write the assembly: {source}"))]
    Assembly { source: synth::Error },
}

impl From<config::Error> for Error {
    fn from(source: config::Error) -> Self {
        Error::Configuration { source }
    }
}

impl Error {
    /// The category of this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration { .. } => "ConfigurationError",
            Error::MissingDependency { .. } => "MissingDependencyError",
            Error::DuplicateOutput { .. } => "DuplicateOutputError",
            Error::UnfulfilledOutput { .. } | Error::UndeclaredOutput { .. } => {
                "CompositionError"
            }
            Error::Build { .. } => "BuildError",
            Error::Assembly { .. } => "AssemblyError",
        }
    }

    /// The stage that failed, if the error happened during composition.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Error::MissingDependency { stage, .. }
            | Error::DuplicateOutput { stage, .. }
            | Error::UnfulfilledOutput { stage, .. }
            | Error::UndeclaredOutput { stage, .. }
            | Error::Build { stage, .. } => Some(stage),
            Error::Configuration { .. } | Error::Assembly { .. } => None,
        }
    }
}

type Result<T, E = Error> = core::result::Result<T, E>;

/// Identifies a stack and the outputs flowing in and out of it.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StackDescriptor {
    /// Namespaced stack name, eg `demo-dev-NetworkStack`.
    pub name: String,
    /// Output keys that must be defined before the stack is built.
    pub requires: Vec<String>,
    /// Output keys the stack defines.
    pub produces: Vec<String>,
}

impl core::fmt::Display for StackDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] -> [{}]",
            self.name,
            self.requires.join(", "),
            self.produces.join(", ")
        )
    }
}

impl StackDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        StackDescriptor {
            name: name.into(),
            requires: vec![],
            produces: vec![],
        }
    }

    pub fn requires(mut self, key: impl Into<String>) -> Self {
        self.requires.push(key.into());
        self
    }

    pub fn produces(mut self, key: impl Into<String>) -> Self {
        self.produces.push(key.into());
        self
    }
}

type BuildFn<P> = Box<dyn Fn(&mut Scope<'_, P>, &OutputMap) -> anyhow::Result<OutputMap>>;

/// A [`StackDescriptor`] and the function that builds its stack.
pub struct Stage<P> {
    descriptor: StackDescriptor,
    build: BuildFn<P>,
}

impl<P> core::fmt::Debug for Stage<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl<P: Provisioner> Stage<P> {
    /// Creates a stage.
    ///
    /// `build` receives only the outputs named in `descriptor.requires` and
    /// returns the outputs named in `descriptor.produces`.
    pub fn new(
        descriptor: StackDescriptor,
        build: impl Fn(&mut Scope<'_, P>, &OutputMap) -> anyhow::Result<OutputMap> + 'static,
    ) -> Self {
        Stage {
            descriptor,
            build: Box::new(build),
        }
    }

    pub fn descriptor(&self) -> &StackDescriptor {
        &self.descriptor
    }
}

/// Checks that every stage's requirements are met by the outputs before it,
/// without building anything.
///
/// Returns the keys that composing the stages would define.
pub fn check<'a>(
    descriptors: impl IntoIterator<Item = &'a StackDescriptor>,
    initial: &OutputMap,
) -> Result<BTreeSet<String>> {
    let mut defined: BTreeSet<String> = initial.keys().map(str::to_owned).collect();
    for descriptor in descriptors {
        let stage = &descriptor.name;
        if let Some(key) = descriptor.requires.iter().find(|k| !defined.contains(*k)) {
            return MissingDependencySnafu { stage, key }.fail();
        }
        for key in descriptor.produces.iter() {
            ensure!(
                defined.insert(key.clone()),
                DuplicateOutputSnafu { stage, key }
            );
        }
    }
    Ok(defined)
}

/// Builds each stage in order, threading outputs from one to the next.
///
/// Returns `initial` extended with the outputs of every stage.
///
/// ## Errors
/// - [`Error::MissingDependency`] if a stage requires a key not yet defined.
///   The stage is not built.
/// - [`Error::DuplicateOutput`] if a stage defines a key that is already
///   defined, or lists the same key twice.
/// - [`Error::UnfulfilledOutput`] / [`Error::UndeclaredOutput`] if a stage
///   returns something other than what it promised.
/// - [`Error::Build`] if the stage's build function or the provisioner fails.
///
/// Composition stops at the first error.
pub fn compose<P: Provisioner>(
    stages: &[Stage<P>],
    initial: OutputMap,
    provisioner: &mut P,
) -> Result<OutputMap> {
    let mut outputs = initial;
    for (i, stage) in stages.iter().enumerate() {
        let StackDescriptor {
            name,
            requires,
            produces,
        } = &stage.descriptor;
        log::info!("stage {i} '{name}':");

        if let Some(key) = requires.iter().find(|k| !outputs.contains_key(k)) {
            let err = MissingDependencySnafu { stage: name, key }.build();
            log::error!("{err}");
            return Err(err);
        }
        let redefined = produces
            .iter()
            .enumerate()
            .find(|(j, k)| outputs.contains_key(k) || produces[..*j].contains(*k))
            .map(|(_, k)| k);
        if let Some(key) = redefined {
            let err = DuplicateOutputSnafu { stage: name, key }.build();
            log::error!("{err}");
            return Err(err);
        }

        let upstream = outputs.select(requires.iter().map(String::as_str));
        log::debug!("  with upstream [{upstream}]");
        provisioner.begin_stack(name).map_err(|error| Error::Build {
            stage: name.clone(),
            error: error.into(),
        })?;
        let partial = {
            let mut scope = Scope::new(name, provisioner);
            (stage.build)(&mut scope, &upstream).map_err(|error| Error::Build {
                stage: name.clone(),
                error,
            })?
        };

        if let Some(key) = produces.iter().find(|k| !partial.contains_key(k)) {
            let err = UnfulfilledOutputSnafu { stage: name, key }.build();
            log::error!("{err}");
            return Err(err);
        }
        if let Some(key) = partial.keys().find(|k| !produces.iter().any(|p| p.as_str() == *k)) {
            let err = UndeclaredOutputSnafu { stage: name, key }.build();
            log::error!("{err}");
            return Err(err);
        }
        match outputs.merge(partial) {
            Ok(()) => {}
            Err(output::Error::Duplicate { key }) => {
                return DuplicateOutputSnafu { stage: name, key }.fail()
            }
            Err(error) => {
                return Err(Error::Build {
                    stage: name.clone(),
                    error: error.into(),
                })
            }
        }
        log::info!("  success!");
    }
    log::info!("composed {} stages: [{outputs}]", stages.len());
    Ok(outputs)
}
