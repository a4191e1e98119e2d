//! The stacks of a backend deployment.
//!
//! Each submodule exposes a `descriptor` and a `stage` constructor. Stages
//! are pure functions of the configuration and their upstream outputs.
use serde_json::json;

use crate::{output::ResourceRef, provision::Scope, Provisioner};

pub mod application;
pub mod artifact;
pub mod network;
pub mod pipeline;
pub mod storage;

/// Output key of the network's VPC.
pub const VPC: &str = "vpc";
/// Output key of the database instance.
pub const DB_INSTANCE: &str = "db_instance";
/// Output key of the pipeline artifact bucket.
pub const ARTIFACT_BUCKET: &str = "artifact_bucket";
/// Output key of the application's Fargate service.
pub const FARGATE_SERVICE: &str = "fargate_service";
/// Output key of the container registry the pipeline pushes to.
pub const ECR_REPOSITORY: &str = "ecr_repository";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StackKind {
    Network,
    Storage,
    Artifact,
    Application,
    Pipeline,
}

impl core::fmt::Display for StackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StackKind::Network => "NetworkStack",
            StackKind::Storage => "StorageStack",
            StackKind::Artifact => "ArtifactStack",
            StackKind::Application => "ApplicationStack",
            StackKind::Pipeline => "PipelineStack",
        })
    }
}

impl StackKind {
    /// `{namespace}-{Kind}`.
    pub fn stack_name(&self, namespace: &str) -> String {
        format!("{namespace}-{self}")
    }
}

fn tags(namespace: &str, name: &str) -> serde_json::Value {
    json!([
        { "Key": "Name", "Value": format!("{namespace}/{name}") },
        { "Key": "namespace", "Value": namespace },
    ])
}

/// A trust policy letting `service` assume a role.
fn assume_role_policy(service: &str) -> serde_json::Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole",
        }],
    })
}

/// References to every subnet of `vpc`.
fn subnet_ids<P: Provisioner>(
    scope: &mut Scope<'_, P>,
    vpc: &ResourceRef,
) -> Result<Vec<serde_json::Value>, P::Error> {
    vpc.members_of_type(network::SUBNET)
        .map(|subnet| scope.reference(subnet))
        .collect()
}
