//! The seam between stack builders and whatever turns their declarations
//! into infrastructure.
use crate::output::ResourceRef;

/// How a resource is treated when its stack is deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DeletionPolicy {
    Delete,
    Retain,
    Snapshot,
}

/// One resource declaration.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Declaration {
    #[serde(skip)]
    pub logical_id: String,
    #[serde(rename = "Type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub properties: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
}

impl Declaration {
    pub fn new(logical_id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Declaration {
            logical_id: logical_id.into(),
            resource_type: resource_type.into(),
            properties: serde_json::Value::Null,
            depends_on: vec![],
            deletion_policy: None,
        }
    }

    pub fn properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }

    /// Orders this resource after another resource of the same stack.
    pub fn depends_on(mut self, resource: &ResourceRef) -> Self {
        self.depends_on.push(resource.logical_id.clone());
        self
    }

    pub fn deletion_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = Some(policy);
        self
    }
}

/// Receives the declarations of every stack.
///
/// [`Synth`](crate::synth::Synth) records them into a cloud assembly; tests
/// use it to observe or fail declarations.
pub trait Provisioner: 'static {
    /// Errors that may occur while declaring.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opens a new stack. Every other call names a stack opened here.
    fn begin_stack(&mut self, stack: &str) -> Result<(), Self::Error>;

    fn declare(
        &mut self,
        stack: &str,
        declaration: Declaration,
    ) -> Result<ResourceRef, Self::Error>;

    /// Returns a value that resolves to `target` (or one of its attributes)
    /// from inside `stack`, which may differ from the stack that declared
    /// `target`.
    fn reference(
        &mut self,
        stack: &str,
        target: &ResourceRef,
        attribute: Option<&str>,
    ) -> Result<serde_json::Value, Self::Error>;

    /// Publishes a named value of `stack`.
    fn output(
        &mut self,
        stack: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), Self::Error>;
}

/// The view of a [`Provisioner`] a stack builder works through.
pub struct Scope<'a, P> {
    stack: &'a str,
    provisioner: &'a mut P,
}

impl<'a, P: Provisioner> Scope<'a, P> {
    pub fn new(stack: &'a str, provisioner: &'a mut P) -> Self {
        Scope { stack, provisioner }
    }

    /// Name of the stack being built.
    pub fn stack_name(&self) -> &str {
        self.stack
    }

    pub fn declare(&mut self, declaration: Declaration) -> Result<ResourceRef, P::Error> {
        log::debug!(
            "  declaring {} '{}'",
            declaration.resource_type,
            declaration.logical_id
        );
        self.provisioner.declare(self.stack, declaration)
    }

    /// The primary identifier of `target`.
    pub fn reference(&mut self, target: &ResourceRef) -> Result<serde_json::Value, P::Error> {
        self.provisioner.reference(self.stack, target, None)
    }

    /// An attribute of `target`, like a bucket's `Arn`.
    pub fn attribute(
        &mut self,
        target: &ResourceRef,
        attribute: &str,
    ) -> Result<serde_json::Value, P::Error> {
        self.provisioner.reference(self.stack, target, Some(attribute))
    }

    pub fn output(&mut self, name: &str, value: serde_json::Value) -> Result<(), P::Error> {
        self.provisioner.output(self.stack, name, value)
    }
}
