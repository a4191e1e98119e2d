//! Synthesizing declarations into a cloud assembly.
//!
//! [`Synth`] is the [`Provisioner`] that records every declaration into a
//! CloudFormation style template per stack. The finished [`Assembly`] is
//! what gets handed to the provisioning engine; applying it is not our
//! concern.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use snafu::prelude::*;

use crate::{
    config::Environment,
    output::ResourceRef,
    provision::{Declaration, Provisioner},
    utils,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Stack '{stack}' is already defined"))]
    DuplicateStack { stack: String },

    #[snafu(display("Stack '{stack}' has not been defined"))]
    UnknownStack { stack: String },

    #[snafu(display("Stack '{stack}' already declares a resource '{logical_id}'"))]
    DuplicateResource { stack: String, logical_id: String },

    #[snafu(display("Stack '{stack}' declares no resource '{logical_id}'"))]
    UnknownResource { stack: String, logical_id: String },

    #[snafu(display("Stack '{stack}' already has an output '{name}'"))]
    DuplicateOutput { stack: String, name: String },

    #[snafu(display(
        "Stack '{stack}' cannot export '{export}' as output '{name}', which is already taken"
    ))]
    ExportCollision {
        stack: String,
        name: String,
        export: String,
    },

    #[snafu(display("Could not serialize '{name}': {source}"))]
    Serialize {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Could not create directory {path:?}: {source}"))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not read file {path:?}: {source}"))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not write file {path:?}: {source}"))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Export {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateOutput {
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<Export>,
}

/// The declarations of one stack.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,
    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, Declaration>,
    #[serde(rename = "Outputs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, TemplateOutput>,
}

impl Default for Template {
    fn default() -> Self {
        Template {
            format_version: "2010-09-09".to_owned(),
            resources: BTreeMap::default(),
            outputs: BTreeMap::default(),
        }
    }
}

impl Template {
    /// Logical ids of every resource of the given type.
    pub fn resources_of_type<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = &'a str> {
        self.resources
            .iter()
            .filter(move |(_, decl)| decl.resource_type == resource_type)
            .map(|(id, _)| id.as_str())
    }
}

/// A synthesized stack.
#[derive(Clone, Debug, PartialEq)]
pub struct StackArtifact {
    pub name: String,
    pub environment: Environment,
    pub template: Template,
    /// Stacks that must be deployed before this one.
    pub dependencies: BTreeSet<String>,
}

impl StackArtifact {
    pub fn template_file_name(&self) -> String {
        format!("{}.template.json", self.name)
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct ManifestEntry {
    pub environment: String,
    pub template_file: String,
    pub template_digest: String,
    pub dependencies: BTreeSet<String>,
}

/// Describes every stack of an assembly written by [`Assembly::write`].
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Manifest {
    pub version: String,
    pub stacks: BTreeMap<String, ManifestEntry>,
}

/// What [`Assembly::write`] did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteSummary {
    pub manifest: PathBuf,
    /// Stacks whose template was (re)written.
    pub written: Vec<String>,
    /// Stacks whose template on disk already had the same digest.
    pub unchanged: Vec<String>,
}

/// Stacks in the order they were defined.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Assembly {
    stacks: Vec<StackArtifact>,
}

impl Assembly {
    pub const MANIFEST_FILE: &'static str = "manifest.json";

    pub fn stacks(&self) -> &[StackArtifact] {
        &self.stacks
    }

    pub fn stack(&self, name: &str) -> Option<&StackArtifact> {
        self.stacks.iter().find(|s| s.name == name)
    }

    /// Writes one template per stack and a manifest into `dir`.
    ///
    /// Templates already on disk with the same digest are left untouched.
    pub fn write(&self, dir: impl AsRef<Path>) -> Result<WriteSummary> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).context(CreateDirSnafu { path: dir })?;

        let mut manifest = Manifest {
            version: "1".to_owned(),
            stacks: BTreeMap::default(),
        };
        let mut summary = WriteSummary::default();
        for stack in self.stacks.iter() {
            let contents = serde_json::to_string_pretty(&stack.template)
                .context(SerializeSnafu { name: &stack.name })?;
            let digest = utils::sha256_hex(contents.as_bytes());
            let path = dir.join(stack.template_file_name());
            let current = utils::file_digest(&path).context(ReadFileSnafu { path: &path })?;
            if current.as_deref() == Some(digest.as_str()) {
                log::info!("{} is unchanged", stack.name);
                summary.unchanged.push(stack.name.clone());
            } else {
                log::info!("writing {} to {path:?}", stack.name);
                std::fs::write(&path, &contents).context(WriteFileSnafu { path })?;
                summary.written.push(stack.name.clone());
            }
            manifest.stacks.insert(
                stack.name.clone(),
                ManifestEntry {
                    environment: format!(
                        "aws://{}/{}",
                        stack.environment.account, stack.environment.region
                    ),
                    template_file: stack.template_file_name(),
                    template_digest: digest,
                    dependencies: stack.dependencies.clone(),
                },
            );
        }

        let path = dir.join(Self::MANIFEST_FILE);
        let contents =
            serde_json::to_string_pretty(&manifest).context(SerializeSnafu { name: "manifest" })?;
        std::fs::write(&path, contents).context(WriteFileSnafu { path: path.clone() })?;
        summary.manifest = path;
        Ok(summary)
    }
}

/// Records declarations into an [`Assembly`].
pub struct Synth {
    environment: Environment,
    assembly: Assembly,
}

/// Alphanumerics only, as required of output names.
fn output_name(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|part| part.chars())
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

impl Synth {
    pub fn new(environment: Environment) -> Self {
        Synth {
            environment,
            assembly: Assembly::default(),
        }
    }

    pub fn assembly(&self) -> &Assembly {
        &self.assembly
    }

    pub fn finish(self) -> Assembly {
        self.assembly
    }

    fn stack_mut(&mut self, stack: &str) -> Result<&mut StackArtifact> {
        self.assembly
            .stacks
            .iter_mut()
            .find(|s| s.name == stack)
            .context(UnknownStackSnafu { stack })
    }

    /// Exports `value` from the producing stack under a stable name, once.
    ///
    /// Errs if the output name the export needs is taken by anything else.
    fn export(&mut self, target: &ResourceRef, attribute: Option<&str>) -> Result<String> {
        let attr = attribute.unwrap_or("Ref");
        let export_name = format!("{}:{}:{attr}", target.stack, target.logical_id);
        let value = match attribute {
            Some(attribute) => serde_json::json!({ "Fn::GetAtt": [target.logical_id, attribute] }),
            None => serde_json::json!({ "Ref": target.logical_id }),
        };
        let producer = self.stack_mut(&target.stack)?;
        ensure!(
            producer.template.resources.contains_key(&target.logical_id),
            UnknownResourceSnafu {
                stack: &target.stack,
                logical_id: &target.logical_id,
            }
        );
        let name = output_name(&["Export", target.logical_id.as_str(), attr]);
        match producer.template.outputs.get(&name) {
            Some(existing) => {
                let existing = existing.export.as_ref().map(|export| export.name.as_str());
                ensure!(
                    existing == Some(export_name.as_str()),
                    ExportCollisionSnafu {
                        stack: &target.stack,
                        name,
                        export: export_name,
                    }
                );
            }
            None => {
                log::debug!("  exporting '{export_name}'");
                producer.template.outputs.insert(
                    name,
                    TemplateOutput {
                        value,
                        export: Some(Export {
                            name: export_name.clone(),
                        }),
                    },
                );
            }
        }
        Ok(export_name)
    }
}

impl Provisioner for Synth {
    type Error = Error;

    fn begin_stack(&mut self, stack: &str) -> Result<()> {
        ensure!(
            self.assembly.stack(stack).is_none(),
            DuplicateStackSnafu { stack }
        );
        self.assembly.stacks.push(StackArtifact {
            name: stack.to_owned(),
            environment: self.environment.clone(),
            template: Template::default(),
            dependencies: BTreeSet::default(),
        });
        Ok(())
    }

    fn declare(&mut self, stack: &str, declaration: Declaration) -> Result<ResourceRef> {
        let artifact = self.stack_mut(stack)?;
        let logical_id = declaration.logical_id.clone();
        ensure!(
            !artifact.template.resources.contains_key(&logical_id),
            DuplicateResourceSnafu { stack, logical_id }
        );
        for dep in declaration.depends_on.iter() {
            ensure!(
                artifact.template.resources.contains_key(dep),
                UnknownResourceSnafu {
                    stack,
                    logical_id: dep,
                }
            );
        }
        let rez = ResourceRef {
            stack: stack.to_owned(),
            logical_id: logical_id.clone(),
            resource_type: declaration.resource_type.clone(),
            members: BTreeMap::default(),
        };
        artifact.template.resources.insert(logical_id, declaration);
        Ok(rez)
    }

    fn reference(
        &mut self,
        stack: &str,
        target: &ResourceRef,
        attribute: Option<&str>,
    ) -> Result<serde_json::Value> {
        if target.stack == stack {
            let local = self.stack_mut(stack)?;
            ensure!(
                local.template.resources.contains_key(&target.logical_id),
                UnknownResourceSnafu {
                    stack,
                    logical_id: &target.logical_id,
                }
            );
            return Ok(match attribute {
                Some(attribute) => {
                    serde_json::json!({ "Fn::GetAtt": [target.logical_id, attribute] })
                }
                None => serde_json::json!({ "Ref": target.logical_id }),
            });
        }

        // the consumer must exist before anything is exported on its behalf
        self.stack_mut(stack)?;
        let export_name = self.export(target, attribute)?;
        let consumer = self.stack_mut(stack)?;
        if consumer.dependencies.insert(target.stack.clone()) {
            log::debug!("  '{stack}' now depends on '{}'", target.stack);
        }
        Ok(serde_json::json!({ "Fn::ImportValue": export_name }))
    }

    fn output(&mut self, stack: &str, name: &str, value: serde_json::Value) -> Result<()> {
        let artifact = self.stack_mut(stack)?;
        ensure!(
            !artifact.template.outputs.contains_key(name),
            DuplicateOutputSnafu { stack, name }
        );
        artifact.template.outputs.insert(
            name.to_owned(),
            TemplateOutput {
                value,
                export: None,
            },
        );
        Ok(())
    }
}
