//! Output handles.
//!
//! Every stack exposes the resources its dependents need through an
//! [`OutputMap`]. The map is append-only: a key can be defined once and is
//! never overwritten, which is what lets [`compose`](crate::compose) catch two
//! stacks claiming the same output.
use std::collections::BTreeMap;

use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Output '{key}' is already defined"))]
    Duplicate { key: String },

    #[snafu(display("Output '{key}' is not defined"))]
    Missing { key: String },

    #[snafu(display("Output '{key}' is a {found}, expected a {expected}"))]
    Mismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// A resource declared in a synthesized stack.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ResourceRef {
    /// Name of the stack that declared the resource.
    pub stack: String,
    /// Logical id of the resource within its stack.
    pub logical_id: String,
    /// Provider type, eg `AWS::S3::Bucket`.
    pub resource_type: String,
    /// Resources declared along with this one that dependents may need,
    /// like the subnets of a VPC.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub members: BTreeMap<String, ResourceRef>,
}

impl ResourceRef {
    pub fn with_member(mut self, name: impl Into<String>, member: ResourceRef) -> Self {
        self.members.insert(name.into(), member);
        self
    }

    /// Members of the given type, in name order.
    pub fn members_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = &'a ResourceRef> {
        self.members
            .values()
            .filter(move |m| m.resource_type == resource_type)
    }

    pub fn member(&self, name: &str) -> Result<&ResourceRef, Error> {
        self.members.get(name).context(MissingSnafu {
            key: format!("{}.{name}", self.logical_id),
        })
    }
}

impl core::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} [{}]", self.stack, self.logical_id, self.resource_type)
    }
}

/// An opaque value one stack hands to another.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Handle {
    /// A plain value, like the namespace.
    Value { value: String },
    /// A resource declared by an upstream stack.
    Resource(ResourceRef),
}

impl Handle {
    fn kind(&self) -> &'static str {
        match self {
            Handle::Value { .. } => "value",
            Handle::Resource(_) => "resource",
        }
    }
}

impl From<ResourceRef> for Handle {
    fn from(value: ResourceRef) -> Self {
        Handle::Resource(value)
    }
}

impl From<String> for Handle {
    fn from(value: String) -> Self {
        Handle::Value { value }
    }
}

impl From<&str> for Handle {
    fn from(value: &str) -> Self {
        Handle::Value {
            value: value.to_owned(),
        }
    }
}

/// Append-only map of output keys to [`Handle`]s.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct OutputMap {
    inner: BTreeMap<String, Handle>,
}

impl core::fmt::Display for OutputMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.keys().collect::<Vec<_>>().join(", "))
    }
}

impl OutputMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map holding one output.
    pub fn single(key: impl Into<String>, handle: impl Into<Handle>) -> Self {
        OutputMap {
            inner: BTreeMap::from([(key.into(), handle.into())]),
        }
    }

    /// Builder style [`OutputMap::insert`].
    pub fn with(mut self, key: impl Into<String>, handle: impl Into<Handle>) -> Result<Self, Error> {
        self.insert(key, handle)?;
        Ok(self)
    }

    /// Defines a new output.
    ///
    /// ## Errors
    /// Errs if `key` is already defined, leaving the existing handle in place.
    pub fn insert(&mut self, key: impl Into<String>, handle: impl Into<Handle>) -> Result<(), Error> {
        let key = key.into();
        ensure!(!self.inner.contains_key(&key), DuplicateSnafu { key });
        self.inner.insert(key, handle.into());
        Ok(())
    }

    /// Moves every output of `other` into this map.
    ///
    /// Nothing is merged if any key of `other` is already defined here.
    pub fn merge(&mut self, other: OutputMap) -> Result<(), Error> {
        if let Some(key) = other.keys().find(|key| self.contains_key(key)) {
            return DuplicateSnafu { key }.fail();
        }
        self.inner.extend(other.inner);
        Ok(())
    }

    /// Returns a copy holding only the given keys that are defined here.
    pub fn select<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> OutputMap {
        let inner = keys
            .into_iter()
            .filter_map(|key| {
                self.inner
                    .get_key_value(key)
                    .map(|(k, v)| (k.clone(), v.clone()))
            })
            .collect();
        OutputMap { inner }
    }

    pub fn get(&self, key: &str) -> Option<&Handle> {
        self.inner.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn require(&self, key: &str) -> Result<&Handle, Error> {
        self.get(key).context(MissingSnafu { key })
    }

    /// Returns the resource stored under `key`.
    pub fn resource(&self, key: &str) -> Result<&ResourceRef, Error> {
        match self.require(key)? {
            Handle::Resource(rez) => Ok(rez),
            handle => MismatchSnafu {
                key,
                expected: "resource",
                found: handle.kind(),
            }
            .fail(),
        }
    }

    /// Returns the plain value stored under `key`.
    pub fn value(&self, key: &str) -> Result<&str, Error> {
        match self.require(key)? {
            Handle::Value { value } => Ok(value),
            handle => MismatchSnafu {
                key,
                expected: "value",
                found: handle.kind(),
            }
            .fail(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Handle)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
