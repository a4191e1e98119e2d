//! The VPC every networked stack runs in.
use serde_json::json;

use super::{tags, StackKind, VPC};
use crate::{
    output::ResourceRef,
    provision::{Declaration, Scope},
    Config, OutputMap, Provisioner, StackDescriptor, Stage,
};

pub const SUBNET: &str = "AWS::EC2::Subnet";

/// Number of availability zones the public subnets span.
pub const MAX_AZS: u8 = 3;

pub const CIDR: &str = "10.0.0.0/16";

pub fn descriptor(namespace: &str) -> StackDescriptor {
    StackDescriptor::new(StackKind::Network.stack_name(namespace)).produces(VPC)
}

pub fn stage<P: Provisioner>(config: &Config) -> Stage<P> {
    let namespace = config.namespace();
    Stage::new(descriptor(&namespace), move |scope, _upstream| {
        let vpc = declare_vpc(scope, &namespace)?;
        Ok(OutputMap::new().with(VPC, vpc)?)
    })
}

/// Declares a VPC with one public subnet per availability zone and no NAT
/// gateways.
///
/// The returned VPC carries its subnets and internet gateway as members.
pub fn declare_vpc<P: Provisioner>(
    scope: &mut Scope<'_, P>,
    namespace: &str,
) -> Result<ResourceRef, P::Error> {
    let vpc = scope.declare(Declaration::new("Vpc", "AWS::EC2::VPC").properties(json!({
        "CidrBlock": CIDR,
        "EnableDnsHostnames": true,
        "EnableDnsSupport": true,
        "InstanceTenancy": "default",
        "Tags": tags(namespace, "Vpc"),
    })))?;
    let vpc_id = scope.reference(&vpc)?;

    let gateway = scope.declare(
        Declaration::new("InternetGateway", "AWS::EC2::InternetGateway")
            .properties(json!({ "Tags": tags(namespace, "InternetGateway") })),
    )?;
    let gateway_id = scope.reference(&gateway)?;
    let attachment = scope.declare(
        Declaration::new("GatewayAttachment", "AWS::EC2::VPCGatewayAttachment").properties(json!({
            "VpcId": vpc_id,
            "InternetGatewayId": gateway_id,
        })),
    )?;

    let route_table = scope.declare(
        Declaration::new("PublicRouteTable", "AWS::EC2::RouteTable").properties(json!({
            "VpcId": vpc_id,
            "Tags": tags(namespace, "PublicRouteTable"),
        })),
    )?;
    let route_table_id = scope.reference(&route_table)?;
    scope.declare(
        Declaration::new("PublicDefaultRoute", "AWS::EC2::Route")
            .properties(json!({
                "RouteTableId": route_table_id,
                "DestinationCidrBlock": "0.0.0.0/0",
                "GatewayId": gateway_id,
            }))
            .depends_on(&attachment),
    )?;

    let mut vpc = vpc.with_member("InternetGateway", gateway);
    for az in 0..MAX_AZS {
        let name = format!("PublicSubnet{}", az + 1);
        let subnet = scope.declare(Declaration::new(&name, SUBNET).properties(json!({
            "VpcId": vpc_id,
            "CidrBlock": format!("10.0.{}.0/18", u16::from(az) * 64),
            "AvailabilityZone": { "Fn::Select": [az, { "Fn::GetAZs": "" }] },
            "MapPublicIpOnLaunch": true,
            "Tags": tags(namespace, &name),
        })))?;
        let subnet_id = scope.reference(&subnet)?;
        scope.declare(
            Declaration::new(
                format!("{name}RouteTableAssociation"),
                "AWS::EC2::SubnetRouteTableAssociation",
            )
            .properties(json!({
                "SubnetId": subnet_id,
                "RouteTableId": route_table_id,
            })),
        )?;
        vpc = vpc.with_member(name, subnet);
    }
    Ok(vpc)
}
