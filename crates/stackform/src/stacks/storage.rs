//! The relational database, inside the network's VPC.
use serde_json::json;

use super::{subnet_ids, tags, StackKind, DB_INSTANCE, VPC};
use crate::{
    provision::{Declaration, DeletionPolicy, Scope},
    Config, OutputMap, Provisioner, StackDescriptor, Stage,
};

pub const ENGINE: &str = "postgres";
pub const ENGINE_VERSION: &str = "12.7";
pub const INSTANCE_CLASS: &str = "db.t2.small";
/// GiB
pub const ALLOCATED_STORAGE: u32 = 20;
/// GiB
pub const MAX_ALLOCATED_STORAGE: u32 = 30;

pub fn descriptor(namespace: &str) -> StackDescriptor {
    StackDescriptor::new(StackKind::Storage.stack_name(namespace))
        .requires(VPC)
        .produces(DB_INSTANCE)
}

pub fn stage<P: Provisioner>(config: &Config) -> Stage<P> {
    let config = config.clone();
    Stage::new(
        descriptor(&config.namespace()),
        move |scope, upstream| build(scope, upstream, &config),
    )
}

fn build<P: Provisioner>(
    scope: &mut Scope<'_, P>,
    upstream: &OutputMap,
    config: &Config,
) -> anyhow::Result<OutputMap> {
    let namespace = config.namespace();
    let vpc = upstream.resource(VPC)?;
    let vpc_id = scope.reference(vpc)?;

    let security_group = scope.declare(
        Declaration::new("DbSecurityGroup", "AWS::EC2::SecurityGroup").properties(json!({
            "GroupDescription": format!("{namespace} database"),
            "VpcId": vpc_id,
            "SecurityGroupIngress": [{
                "IpProtocol": "tcp",
                "CidrIp": "0.0.0.0/0",
                "FromPort": config.db_port,
                "ToPort": config.db_port,
            }],
            "Tags": tags(&namespace, "DbSecurityGroup"),
        })),
    )?;
    let security_group_id = scope.attribute(&security_group, "GroupId")?;

    let subnets = subnet_ids(scope, vpc)?;
    anyhow::ensure!(!subnets.is_empty(), "VPC '{}' has no subnets", vpc.logical_id);
    let subnet_group = scope.declare(
        Declaration::new("DbSubnetGroup", "AWS::RDS::DBSubnetGroup").properties(json!({
            "DBSubnetGroupDescription": format!("Public subnets for {namespace} database"),
            "SubnetIds": subnets,
        })),
    )?;
    let subnet_group_name = scope.reference(&subnet_group)?;

    let instance = scope.declare(
        Declaration::new("DbInstance", "AWS::RDS::DBInstance")
            .properties(json!({
                "Engine": ENGINE,
                "EngineVersion": ENGINE_VERSION,
                "DBInstanceClass": INSTANCE_CLASS,
                "AllocatedStorage": ALLOCATED_STORAGE.to_string(),
                "MaxAllocatedStorage": MAX_ALLOCATED_STORAGE,
                "MultiAZ": false,
                "PubliclyAccessible": true,
                "Port": config.db_port.to_string(),
                "DBName": config.db_name,
                "MasterUsername": config.db_username,
                // credentials live in a generated Secrets Manager secret
                "ManageMasterUserPassword": true,
                "StorageEncrypted": true,
                "DBSubnetGroupName": subnet_group_name,
                "VPCSecurityGroups": [security_group_id],
                "Tags": tags(&namespace, "DbInstance"),
            }))
            .deletion_policy(DeletionPolicy::Snapshot),
    )?;
    let endpoint = scope.attribute(&instance, "Endpoint.Address")?;
    scope.output("DbEndpoint", endpoint)?;

    Ok(OutputMap::new().with(DB_INSTANCE, instance)?)
}
