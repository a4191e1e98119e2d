//! The containerized backend: a load balanced Fargate service with CPU based
//! autoscaling.
use serde_json::json;

use super::{
    assume_role_policy, network, subnet_ids, tags, StackKind, DB_INSTANCE, FARGATE_SERVICE, VPC,
};
use crate::{
    config::ImageChoice,
    output::ResourceRef,
    provision::{Declaration, Scope},
    Config, OutputMap, Provisioner, StackDescriptor, Stage,
};

pub const CONTAINER_NAME: &str = "web";
pub const BOOTSTRAP_IMAGE: &str = "amazon/amazon-ecs-sample";
pub const CPU: u32 = 512;
/// MiB
pub const MEMORY: u32 = 1024;
pub const DESIRED_COUNT: u32 = 3;
pub const MAX_CAPACITY: u32 = 6;
pub const TARGET_CPU_UTILIZATION: u32 = 10;
/// Seconds
pub const SCALING_COOLDOWN: u32 = 60;
/// Seconds
pub const HEALTH_CHECK_INTERVAL: u32 = 120;
pub const UNHEALTHY_THRESHOLD: u32 = 10;
pub const HEALTHY_THRESHOLD: u32 = 5;

/// Where the service runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Placement {
    /// In a VPC of its own, with no upstream dependencies.
    #[default]
    Standalone,
    /// In the network stack's VPC, next to the database.
    InVpc,
}

/// Image and health check path the service is deployed with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    pub image: String,
    pub health_check_path: String,
}

impl Deployment {
    pub fn new(config: &Config) -> Self {
        match config.image {
            ImageChoice::Bootstrap => Deployment {
                image: BOOTSTRAP_IMAGE.to_owned(),
                health_check_path: "/".to_owned(),
            },
            ImageChoice::Versioned => Deployment {
                image: format!(
                    "{}.dkr.ecr.{}.amazonaws.com/{}:{}",
                    config.aws_account_id, config.aws_region, config.ecr_repo_name, config.env
                ),
                health_check_path: match &config.health_check_secure_token {
                    Some(token) => format!("{}{token}/", config.health_check_path),
                    None => config.health_check_path.clone(),
                },
            },
        }
    }
}

pub fn descriptor(namespace: &str, placement: Placement) -> StackDescriptor {
    let descriptor = StackDescriptor::new(StackKind::Application.stack_name(namespace));
    let descriptor = match placement {
        Placement::Standalone => descriptor,
        Placement::InVpc => descriptor.requires(VPC).requires(DB_INSTANCE),
    };
    descriptor.produces(FARGATE_SERVICE)
}

pub fn stage<P: Provisioner>(config: &Config, placement: Placement) -> Stage<P> {
    let config = config.clone();
    Stage::new(
        descriptor(&config.namespace(), placement),
        move |scope, upstream| build(scope, upstream, &config, placement),
    )
}

fn execution_policy_statements() -> serde_json::Value {
    json!([{
        "Effect": "Allow",
        "Resource": "*",
        "Action": [
            "ecr:GetAuthorizationToken",
            "ecr:BatchCheckLayerAvailability",
            "ecr:GetDownloadUrlForLayer",
            "ecr:BatchGetImage",
            "logs:CreateLogStream",
            "logs:PutLogEvents",
        ],
    }])
}

/// Roles and the task definition.
fn declare_task<P: Provisioner>(
    scope: &mut Scope<'_, P>,
    config: &Config,
    deployment: &Deployment,
    database: Option<&ResourceRef>,
) -> Result<ResourceRef, P::Error> {
    let namespace = config.namespace();
    let task_role_name = format!("ecs-task-role-{}", scope.stack_name());
    let task_role = scope.declare(Declaration::new("TaskRole", "AWS::IAM::Role").properties(json!({
        "RoleName": task_role_name,
        "AssumeRolePolicyDocument": assume_role_policy("ecs-tasks.amazonaws.com"),
        "Tags": tags(&namespace, "TaskRole"),
    })))?;
    let task_role_arn = scope.attribute(&task_role, "Arn")?;

    let execution_role = scope.declare(
        Declaration::new("ExecutionRole", "AWS::IAM::Role").properties(json!({
            "AssumeRolePolicyDocument": assume_role_policy("ecs-tasks.amazonaws.com"),
        })),
    )?;
    let execution_role_name = scope.reference(&execution_role)?;
    let execution_role_arn = scope.attribute(&execution_role, "Arn")?;
    let execution_policy = scope.declare(
        Declaration::new("ExecutionRolePolicy", "AWS::IAM::Policy").properties(json!({
            "PolicyName": "ExecutionRolePolicy",
            "PolicyDocument": {
                "Version": "2012-10-17",
                "Statement": execution_policy_statements(),
            },
            "Roles": [execution_role_name],
        })),
    )?;

    let log_group = scope.declare(
        Declaration::new("LogGroup", "AWS::Logs::LogGroup")
            .properties(json!({ "RetentionInDays": 30 })),
    )?;
    let log_group_name = scope.reference(&log_group)?;

    let mut environment = vec![json!({ "Name": "ENV", "Value": config.env })];
    if let Some(database) = database {
        let address = scope.attribute(database, "Endpoint.Address")?;
        environment.push(json!({ "Name": "DATABASE_HOST", "Value": address }));
        environment.push(json!({ "Name": "DATABASE_PORT", "Value": config.db_port.to_string() }));
        environment.push(json!({ "Name": "DATABASE_NAME", "Value": config.db_name }));
    }

    scope.declare(
        Declaration::new("TaskDefinition", "AWS::ECS::TaskDefinition")
            .properties(json!({
                "Cpu": CPU.to_string(),
                "Memory": MEMORY.to_string(),
                "NetworkMode": "awsvpc",
                "RequiresCompatibilities": ["FARGATE"],
                "TaskRoleArn": task_role_arn,
                "ExecutionRoleArn": execution_role_arn,
                "ContainerDefinitions": [{
                    "Name": CONTAINER_NAME,
                    "Image": deployment.image,
                    "Essential": true,
                    "PortMappings": [{
                        "ContainerPort": config.container_port,
                        "Protocol": "tcp",
                    }],
                    "LogConfiguration": {
                        "LogDriver": "awslogs",
                        "Options": {
                            "awslogs-group": log_group_name,
                            "awslogs-stream-prefix": "ecs-logs",
                            "awslogs-region": config.aws_region,
                        },
                    },
                    "Environment": environment,
                }],
            }))
            .depends_on(&execution_policy),
    )
}

fn build<P: Provisioner>(
    scope: &mut Scope<'_, P>,
    upstream: &OutputMap,
    config: &Config,
    placement: Placement,
) -> anyhow::Result<OutputMap> {
    let namespace = config.namespace();
    let deployment = Deployment::new(config);
    log::debug!(
        "  deploying {} image '{}' ({placement:?})",
        config.image,
        deployment.image
    );

    let (vpc, database) = match placement {
        Placement::Standalone => (network::declare_vpc(scope, &namespace)?, None),
        Placement::InVpc => (
            upstream.resource(VPC)?.clone(),
            Some(upstream.resource(DB_INSTANCE)?),
        ),
    };
    let vpc_id = scope.reference(&vpc)?;
    let subnets = subnet_ids(scope, &vpc)?;
    anyhow::ensure!(!subnets.is_empty(), "VPC '{}' has no subnets", vpc.logical_id);

    let task_definition = declare_task(scope, config, &deployment, database)?;
    let task_definition_arn = scope.reference(&task_definition)?;

    let cluster = scope.declare(
        Declaration::new("Cluster", "AWS::ECS::Cluster")
            .properties(json!({ "Tags": tags(&namespace, "Cluster") })),
    )?;
    let cluster_name = scope.reference(&cluster)?;

    let lb_security_group = scope.declare(
        Declaration::new("LoadBalancerSecurityGroup", "AWS::EC2::SecurityGroup").properties(json!({
            "GroupDescription": format!("{namespace} public load balancer"),
            "VpcId": vpc_id,
            "SecurityGroupIngress": [{
                "IpProtocol": "tcp",
                "CidrIp": "0.0.0.0/0",
                "FromPort": config.listener_port,
                "ToPort": config.listener_port,
            }],
        })),
    )?;
    let lb_security_group_id = scope.attribute(&lb_security_group, "GroupId")?;
    let service_security_group = scope.declare(
        Declaration::new("ServiceSecurityGroup", "AWS::EC2::SecurityGroup").properties(json!({
            "GroupDescription": format!("{namespace} service"),
            "VpcId": vpc_id,
            "SecurityGroupIngress": [{
                "IpProtocol": "tcp",
                "SourceSecurityGroupId": lb_security_group_id,
                "FromPort": config.container_port,
                "ToPort": config.container_port,
            }],
        })),
    )?;
    let service_security_group_id = scope.attribute(&service_security_group, "GroupId")?;

    let load_balancer = scope.declare(
        Declaration::new("LoadBalancer", "AWS::ElasticLoadBalancingV2::LoadBalancer").properties(
            json!({
                "Type": "application",
                "Scheme": "internet-facing",
                "Subnets": subnets,
                "SecurityGroups": [lb_security_group_id],
                "Tags": tags(&namespace, "LoadBalancer"),
            }),
        ),
    )?;
    let load_balancer_arn = scope.reference(&load_balancer)?;

    let target_group = scope.declare(
        Declaration::new("TargetGroup", "AWS::ElasticLoadBalancingV2::TargetGroup").properties(
            json!({
                "Port": config.container_port,
                "Protocol": "HTTP",
                "TargetType": "ip",
                "VpcId": vpc_id,
                "HealthCheckPath": deployment.health_check_path,
                "HealthCheckIntervalSeconds": HEALTH_CHECK_INTERVAL,
                "UnhealthyThresholdCount": UNHEALTHY_THRESHOLD,
                "HealthyThresholdCount": HEALTHY_THRESHOLD,
            }),
        ),
    )?;
    let target_group_arn = scope.reference(&target_group)?;

    let listener = scope.declare(
        Declaration::new("Listener", "AWS::ElasticLoadBalancingV2::Listener").properties(json!({
            "LoadBalancerArn": load_balancer_arn,
            "Port": config.listener_port,
            "Protocol": "HTTP",
            "DefaultActions": [{ "Type": "forward", "TargetGroupArn": target_group_arn }],
        })),
    )?;

    let service = scope.declare(
        Declaration::new("Service", "AWS::ECS::Service")
            .properties(json!({
                "Cluster": cluster_name,
                "LaunchType": "FARGATE",
                "DesiredCount": DESIRED_COUNT,
                "TaskDefinition": task_definition_arn,
                "HealthCheckGracePeriodSeconds": 60,
                "NetworkConfiguration": {
                    "AwsvpcConfiguration": {
                        "AssignPublicIp": "ENABLED",
                        "Subnets": subnets,
                        "SecurityGroups": [service_security_group_id],
                    },
                },
                "LoadBalancers": [{
                    "ContainerName": CONTAINER_NAME,
                    "ContainerPort": config.container_port,
                    "TargetGroupArn": target_group_arn,
                }],
            }))
            .depends_on(&listener),
    )?;
    let service_name = scope.attribute(&service, "Name")?;

    let scalable_target = scope.declare(
        Declaration::new("ScalableTarget", "AWS::ApplicationAutoScaling::ScalableTarget").properties(
            json!({
                "MinCapacity": 1,
                "MaxCapacity": MAX_CAPACITY,
                "ResourceId": { "Fn::Join": ["/", ["service", cluster_name, service_name]] },
                "ScalableDimension": "ecs:service:DesiredCount",
                "ServiceNamespace": "ecs",
            }),
        ),
    )?;
    let scalable_target_id = scope.reference(&scalable_target)?;
    scope.declare(
        Declaration::new("CpuScaling", "AWS::ApplicationAutoScaling::ScalingPolicy").properties(
            json!({
                "PolicyName": format!("{namespace}-CpuScaling"),
                "PolicyType": "TargetTrackingScaling",
                "ScalingTargetId": scalable_target_id,
                "TargetTrackingScalingPolicyConfiguration": {
                    "PredefinedMetricSpecification": {
                        "PredefinedMetricType": "ECSServiceAverageCPUUtilization",
                    },
                    "TargetValue": TARGET_CPU_UTILIZATION,
                    "ScaleInCooldown": SCALING_COOLDOWN,
                    "ScaleOutCooldown": SCALING_COOLDOWN,
                },
            }),
        ),
    )?;

    let dns_name = scope.attribute(&load_balancer, "DNSName")?;
    scope.output("LoadBalancerDNS", dns_name)?;

    let service = service
        .with_member("cluster", cluster)
        .with_member("load_balancer", load_balancer);
    Ok(OutputMap::new().with(FARGATE_SERVICE, service)?)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::test::dev_config;

    #[test]
    fn versioned_image_comes_from_our_registry() {
        let deployment = Deployment::new(&dev_config());
        assert_eq!(
            Deployment {
                image: "123456789012.dkr.ecr.us-east-1.amazonaws.com/demo-backend:dev".to_owned(),
                health_check_path: "/health/".to_owned(),
            },
            deployment
        );
    }

    #[test]
    fn versioned_health_check_appends_secure_token() {
        let mut config = dev_config();
        config.health_check_secure_token = Some("s3cr3t".to_owned());
        assert_eq!(
            "/health/s3cr3t/",
            Deployment::new(&config).health_check_path
        );
    }

    #[test]
    fn bootstrap_image_is_the_public_sample() {
        let config = dev_config().with_image(ImageChoice::Bootstrap);
        assert_eq!(
            Deployment {
                image: BOOTSTRAP_IMAGE.to_owned(),
                health_check_path: "/".to_owned(),
            },
            Deployment::new(&config)
        );
    }

    #[test]
    fn placement_decides_requirements() {
        let standalone = descriptor("demo-dev", Placement::Standalone);
        assert!(standalone.requires.is_empty());
        assert_eq!(vec![FARGATE_SERVICE.to_owned()], standalone.produces);

        let in_vpc = descriptor("demo-dev", Placement::InVpc);
        assert_eq!(vec![VPC.to_owned(), DB_INSTANCE.to_owned()], in_vpc.requires);
        assert_eq!("demo-dev-ApplicationStack", in_vpc.name);
    }
}
