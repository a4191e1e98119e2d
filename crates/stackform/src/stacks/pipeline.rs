//! Continuous delivery of the backend: GitHub source, a docker build that
//! pushes to our registry, and a rolling deploy to the Fargate service.
use serde_json::json;

use super::{assume_role_policy, StackKind, ARTIFACT_BUCKET, ECR_REPOSITORY, FARGATE_SERVICE};
use crate::{
    provision::{Declaration, DeletionPolicy, Scope},
    stacks::application::CONTAINER_NAME,
    Config, OutputMap, Provisioner, StackDescriptor, Stage,
};

pub const BUILD_IMAGE: &str = "aws/codebuild/amazonlinux2-x86_64-standard:2.0";
pub const IMAGE_DEFINITIONS: &str = "imagedefinitions.json";

/// The pipeline's stages, always in this order.
pub const STAGES: [&str; 3] = ["Source", "Build", "Deploy-to-ECS"];

pub fn descriptor(namespace: &str) -> StackDescriptor {
    StackDescriptor::new(StackKind::Pipeline.stack_name(namespace))
        .requires(ARTIFACT_BUCKET)
        .requires(FARGATE_SERVICE)
        .produces(ECR_REPOSITORY)
}

pub fn stage<P: Provisioner>(config: &Config) -> Stage<P> {
    let config = config.clone();
    Stage::new(
        descriptor(&config.namespace()),
        move |scope, upstream| build(scope, upstream, &config),
    )
}

/// The CodeBuild build spec: build and tag the image with both the commit
/// and the environment, push both, and describe the image for the deploy
/// stage.
pub fn build_spec() -> serde_json::Value {
    json!({
        "version": "0.2",
        "phases": {
            "pre_build": {
                "commands": [
                    "env",
                    "export TAG=${CODEBUILD_RESOLVED_SOURCE_VERSION}",
                ],
            },
            "build": {
                "commands": [
                    "docker build -t $ECR_REPO_URI:$TAG ./",
                    "docker tag $ECR_REPO_URI:$TAG $ECR_REPO_URI:$ENVIRONMENT",
                    "$(aws ecr get-login --no-include-email)",
                    "echo $ECR_REPO_URI:$TAG",
                    "docker push $ECR_REPO_URI:$TAG",
                    "docker push $ECR_REPO_URI:$ENVIRONMENT",
                ],
            },
            "post_build": {
                "commands": [
                    "echo \"In Post-Build Stage\"",
                    format!(
                        "printf '[{{\"name\":\"{CONTAINER_NAME}\",\"imageUri\":\"%s\"}}]' $ECR_REPO_URI:$TAG > {IMAGE_DEFINITIONS}"
                    ),
                    format!("pwd; ls -al; cat {IMAGE_DEFINITIONS}"),
                ],
            },
        },
        "artifacts": { "files": [IMAGE_DEFINITIONS] },
    })
}

fn policy(name: &str, statements: serde_json::Value, role: serde_json::Value) -> serde_json::Value {
    json!({
        "PolicyName": name,
        "PolicyDocument": { "Version": "2012-10-17", "Statement": statements },
        "Roles": [role],
    })
}

fn action_type(category: &str, owner: &str, provider: &str) -> serde_json::Value {
    json!({ "Category": category, "Owner": owner, "Provider": provider, "Version": "1" })
}

fn build<P: Provisioner>(
    scope: &mut Scope<'_, P>,
    upstream: &OutputMap,
    config: &Config,
) -> anyhow::Result<OutputMap> {
    let namespace = config.namespace();
    let bucket = upstream.resource(ARTIFACT_BUCKET)?;
    let service = upstream.resource(FARGATE_SERVICE)?;
    let cluster = service.member("cluster")?;

    let bucket_name = scope.reference(bucket)?;
    let bucket_arn = scope.attribute(bucket, "Arn")?;
    let cluster_name = scope.reference(cluster)?;
    let cluster_arn = scope.attribute(cluster, "Arn")?;
    let service_name = scope.attribute(service, "Name")?;

    let repository = scope.declare(
        Declaration::new("EcrRepository", "AWS::ECR::Repository")
            .properties(json!({ "RepositoryName": config.ecr_repo_name }))
            .deletion_policy(DeletionPolicy::Delete),
    )?;
    let repository_uri = scope.attribute(&repository, "RepositoryUri")?;
    let repository_arn = scope.attribute(&repository, "Arn")?;

    // build
    let build_role = scope.declare(
        Declaration::new("CodeBuildRole", "AWS::IAM::Role").properties(json!({
            "AssumeRolePolicyDocument": assume_role_policy("codebuild.amazonaws.com"),
        })),
    )?;
    let build_role_name = scope.reference(&build_role)?;
    let build_role_arn = scope.attribute(&build_role, "Arn")?;
    let build_policy = scope.declare(
        Declaration::new("CodeBuildRolePolicy", "AWS::IAM::Policy").properties(policy(
            "CodeBuildRolePolicy",
            json!([
                {
                    "Effect": "Allow",
                    "Resource": repository_arn,
                    "Action": [
                        "ecr:BatchCheckLayerAvailability",
                        "ecr:GetDownloadUrlForLayer",
                        "ecr:BatchGetImage",
                        "ecr:PutImage",
                        "ecr:InitiateLayerUpload",
                        "ecr:UploadLayerPart",
                        "ecr:CompleteLayerUpload",
                    ],
                },
                {
                    "Effect": "Allow",
                    "Resource": "*",
                    "Action": ["ecr:GetAuthorizationToken"],
                },
                {
                    "Effect": "Allow",
                    "Resource": cluster_arn,
                    "Action": [
                        "ecs:DescribeCluster",
                        "ecr:GetAuthorizationToken",
                        "ecr:BatchCheckLayerAvailability",
                        "ecr:BatchGetImage",
                        "ecr:GetDownloadUrlForLayer",
                    ],
                },
                {
                    "Effect": "Allow",
                    "Resource": "*",
                    "Action": ["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
                },
            ]),
            build_role_name,
        )),
    )?;

    let spec = serde_json::to_string_pretty(&build_spec())?;
    let project_name = scope.stack_name().to_owned();
    let project = scope.declare(
        Declaration::new("CodeBuildProject", "AWS::CodeBuild::Project")
            .properties(json!({
                "Name": project_name,
                "ServiceRole": build_role_arn,
                "Source": {
                    "Type": "GITHUB",
                    "Location": format!(
                        "https://github.com/{}/{}.git",
                        config.github_owner, config.github_repo_name
                    ),
                    "BuildSpec": spec,
                },
                "Triggers": { "Webhook": false },
                "Artifacts": { "Type": "NO_ARTIFACTS" },
                "Environment": {
                    "Type": "LINUX_CONTAINER",
                    "ComputeType": "BUILD_GENERAL1_SMALL",
                    "Image": BUILD_IMAGE,
                    "PrivilegedMode": true,
                    "EnvironmentVariables": [
                        { "Name": "ECR_REPO_URI", "Type": "PLAINTEXT", "Value": repository_uri },
                        { "Name": "ENVIRONMENT", "Type": "PLAINTEXT", "Value": config.env },
                    ],
                },
                "Cache": { "Type": "LOCAL", "Modes": ["LOCAL_DOCKER_LAYER_CACHE"] },
            }))
            .depends_on(&build_policy),
    )?;
    let project_ref = scope.reference(&project)?;
    let project_arn = scope.attribute(&project, "Arn")?;

    // pipeline
    let pipeline_role = scope.declare(
        Declaration::new("PipelineRole", "AWS::IAM::Role").properties(json!({
            "AssumeRolePolicyDocument": assume_role_policy("codepipeline.amazonaws.com"),
        })),
    )?;
    let pipeline_role_name = scope.reference(&pipeline_role)?;
    let pipeline_role_arn = scope.attribute(&pipeline_role, "Arn")?;
    let pipeline_policy = scope.declare(
        Declaration::new("PipelineRolePolicy", "AWS::IAM::Policy").properties(policy(
            "PipelineRolePolicy",
            json!([
                {
                    "Effect": "Allow",
                    "Resource": [bucket_arn, { "Fn::Join": ["", [bucket_arn, "/*"]] }],
                    "Action": ["s3:GetObject*", "s3:GetBucket*", "s3:List*", "s3:PutObject*", "s3:DeleteObject*"],
                },
                {
                    "Effect": "Allow",
                    "Resource": project_arn,
                    "Action": ["codebuild:BatchGetBuilds", "codebuild:StartBuild", "codebuild:StopBuild"],
                },
                {
                    "Effect": "Allow",
                    "Resource": "*",
                    "Action": [
                        "ecs:DescribeServices",
                        "ecs:DescribeTaskDefinition",
                        "ecs:DescribeTasks",
                        "ecs:ListTasks",
                        "ecs:RegisterTaskDefinition",
                        "ecs:UpdateService",
                        "iam:PassRole",
                    ],
                },
            ]),
            pipeline_role_name,
        )),
    )?;

    let [source_stage, build_stage, deploy_stage] = STAGES;
    scope.declare(
        Declaration::new("Pipeline", "AWS::CodePipeline::Pipeline")
            .properties(json!({
                "Name": format!("{namespace}-BEPipeline"),
                "RoleArn": pipeline_role_arn,
                "ArtifactStore": { "Type": "S3", "Location": bucket_name },
                "Stages": [
                    {
                        "Name": source_stage,
                        "Actions": [{
                            "Name": "Github_Source",
                            "ActionTypeId": action_type("Source", "ThirdParty", "GitHub"),
                            "Configuration": {
                                "Owner": config.github_owner,
                                "Repo": config.github_repo_name,
                                "Branch": config.git_branch,
                                "OAuthToken": format!(
                                    "{{{{resolve:secretsmanager:{}}}}}",
                                    config.secrets_manager_github_token
                                ),
                                "PollForSourceChanges": false,
                            },
                            "OutputArtifacts": [{ "Name": "SourceOutput" }],
                            "RunOrder": 1,
                        }],
                    },
                    {
                        "Name": build_stage,
                        "Actions": [{
                            "Name": "CodeBuild",
                            "ActionTypeId": action_type("Build", "AWS", "CodeBuild"),
                            "Configuration": { "ProjectName": project_ref },
                            "InputArtifacts": [{ "Name": "SourceOutput" }],
                            "OutputArtifacts": [{ "Name": "BuildOutput" }],
                            "RunOrder": 1,
                        }],
                    },
                    {
                        "Name": deploy_stage,
                        "Actions": [{
                            "Name": "DeployAction",
                            "ActionTypeId": action_type("Deploy", "AWS", "ECS"),
                            "Configuration": {
                                "ClusterName": cluster_name,
                                "ServiceName": service_name,
                                "FileName": IMAGE_DEFINITIONS,
                            },
                            "InputArtifacts": [{ "Name": "BuildOutput" }],
                            "RunOrder": 1,
                        }],
                    },
                ],
            }))
            .depends_on(&pipeline_policy),
    )?;

    let repository_name = scope.reference(&repository)?;
    scope.output("EcrRepositoryName", repository_name)?;
    Ok(OutputMap::new().with(ECR_REPOSITORY, repository)?)
}
