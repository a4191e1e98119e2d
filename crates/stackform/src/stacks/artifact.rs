//! The bucket pipeline artifacts are stored in.
use serde_json::json;

use super::{tags, StackKind, ARTIFACT_BUCKET};
use crate::{
    provision::{Declaration, DeletionPolicy},
    Config, OutputMap, Provisioner, StackDescriptor, Stage,
};

pub fn descriptor(namespace: &str) -> StackDescriptor {
    StackDescriptor::new(StackKind::Artifact.stack_name(namespace)).produces(ARTIFACT_BUCKET)
}

pub fn bucket_name(namespace: &str) -> String {
    format!("{namespace}-artifacts")
}

pub fn stage<P: Provisioner>(config: &Config) -> Stage<P> {
    let namespace = config.namespace();
    Stage::new(descriptor(&namespace), move |scope, _upstream| {
        let bucket = scope.declare(
            Declaration::new("ArtifactBucket", "AWS::S3::Bucket")
                .properties(json!({
                    "BucketName": bucket_name(&namespace),
                    "BucketEncryption": {
                        "ServerSideEncryptionConfiguration": [{
                            "ServerSideEncryptionByDefault": { "SSEAlgorithm": "aws:kms" },
                        }],
                    },
                    "PublicAccessBlockConfiguration": {
                        "BlockPublicAcls": true,
                        "BlockPublicPolicy": true,
                        "IgnorePublicAcls": true,
                        "RestrictPublicBuckets": true,
                    },
                    "Tags": tags(&namespace, "ArtifactBucket"),
                }))
                .deletion_policy(DeletionPolicy::Delete),
        )?;
        let name = scope.reference(&bucket)?;
        scope.output("ArtifactBucketName", name)?;
        Ok(OutputMap::new().with(ARTIFACT_BUCKET, bucket)?)
    })
}
