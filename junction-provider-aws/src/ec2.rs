//! EC2 network provider

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_ec2::Client as Ec2Client;
use aws_sdk_ec2::types::{RouteOrigin as Ec2RouteOrigin, Tag};
use junction_core::network::{Route, RouteDestination, RouteOwner};
use junction_core::provider::{
    AttachmentStatus, NetworkProvider, ObservedRoute, ObservedRouteTable, PeeringRequest,
    PeeringStatus, ProviderError, ProviderResult, RouteOrigin, TransitGatewayStatus,
};

use crate::error::sdk_error;

/// Destination split into the two mutually exclusive request fields
fn destination_fields(destination: &RouteDestination) -> (Option<String>, Option<String>) {
    match destination {
        RouteDestination::Cidr(cidr) => (Some(cidr.clone()), None),
        RouteDestination::PrefixList(id) => (None, Some(id.clone())),
    }
}

/// Exactly one target field is set per route
#[derive(Default)]
struct RouteTarget {
    gateway_id: Option<String>,
    nat_gateway_id: Option<String>,
    transit_gateway_id: Option<String>,
    vpc_peering_connection_id: Option<String>,
    vpc_endpoint_id: Option<String>,
}

impl From<&RouteOwner> for RouteTarget {
    fn from(owner: &RouteOwner) -> Self {
        let id = Some(owner.id().to_string());
        match owner {
            RouteOwner::InternetGateway(_) => Self {
                gateway_id: id,
                ..Default::default()
            },
            RouteOwner::NatGateway(_) => Self {
                nat_gateway_id: id,
                ..Default::default()
            },
            RouteOwner::TransitGateway(_) => Self {
                transit_gateway_id: id,
                ..Default::default()
            },
            RouteOwner::PeeringConnection(_) => Self {
                vpc_peering_connection_id: id,
                ..Default::default()
            },
            RouteOwner::VpcEndpoint(_) => Self {
                vpc_endpoint_id: id,
                ..Default::default()
            },
        }
    }
}

fn observed_route(route: &aws_sdk_ec2::types::Route) -> ObservedRoute {
    let origin = match route.origin() {
        Some(Ec2RouteOrigin::CreateRouteTable) => RouteOrigin::CreateRouteTable,
        Some(Ec2RouteOrigin::EnableVgwRoutePropagation) => RouteOrigin::Propagated,
        _ => RouteOrigin::CreateRoute,
    };
    ObservedRoute {
        origin,
        destination_cidr_block: route.destination_cidr_block().map(String::from),
        destination_prefix_list_id: route.destination_prefix_list_id().map(String::from),
        // Endpoint routes are reported through gateway_id as well
        gateway_id: route.gateway_id().map(String::from),
        nat_gateway_id: route.nat_gateway_id().map(String::from),
        transit_gateway_id: route.transit_gateway_id().map(String::from),
        vpc_peering_connection_id: route.vpc_peering_connection_id().map(String::from),
    }
}

/// `NetworkProvider` backed by the EC2 API of one account and region
pub struct Ec2Network {
    client: Ec2Client,
}

impl Ec2Network {
    pub fn new(client: Ec2Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NetworkProvider for Ec2Network {
    async fn describe_route_table(
        &self,
        route_table_id: &str,
    ) -> ProviderResult<Option<ObservedRouteTable>> {
        let result = self
            .client
            .describe_route_tables()
            .route_table_ids(route_table_id)
            .send()
            .await
            .map_err(|e| sdk_error("describe route table", route_table_id, e));
        let output = match result {
            Ok(output) => output,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(output.route_tables().first().map(|rt| ObservedRouteTable {
            id: route_table_id.to_string(),
            routes: rt.routes().iter().map(observed_route).collect(),
        }))
    }

    async fn create_route(&self, route_table_id: &str, route: &Route) -> ProviderResult<()> {
        let (cidr, prefix_list) = destination_fields(&route.destination);
        let target = RouteTarget::from(&route.owner);
        self.client
            .create_route()
            .route_table_id(route_table_id)
            .set_destination_cidr_block(cidr)
            .set_destination_prefix_list_id(prefix_list)
            .set_gateway_id(target.gateway_id)
            .set_nat_gateway_id(target.nat_gateway_id)
            .set_transit_gateway_id(target.transit_gateway_id)
            .set_vpc_peering_connection_id(target.vpc_peering_connection_id)
            .set_vpc_endpoint_id(target.vpc_endpoint_id)
            .send()
            .await
            .map_err(|e| sdk_error("create route", route_table_id, e))?;
        Ok(())
    }

    async fn replace_route(&self, route_table_id: &str, route: &Route) -> ProviderResult<()> {
        let (cidr, prefix_list) = destination_fields(&route.destination);
        let target = RouteTarget::from(&route.owner);
        self.client
            .replace_route()
            .route_table_id(route_table_id)
            .set_destination_cidr_block(cidr)
            .set_destination_prefix_list_id(prefix_list)
            .set_gateway_id(target.gateway_id)
            .set_nat_gateway_id(target.nat_gateway_id)
            .set_transit_gateway_id(target.transit_gateway_id)
            .set_vpc_peering_connection_id(target.vpc_peering_connection_id)
            .set_vpc_endpoint_id(target.vpc_endpoint_id)
            .send()
            .await
            .map_err(|e| sdk_error("replace route", route_table_id, e))?;
        Ok(())
    }

    async fn delete_route(
        &self,
        route_table_id: &str,
        destination: &RouteDestination,
    ) -> ProviderResult<()> {
        let (cidr, prefix_list) = destination_fields(destination);
        self.client
            .delete_route()
            .route_table_id(route_table_id)
            .set_destination_cidr_block(cidr)
            .set_destination_prefix_list_id(prefix_list)
            .send()
            .await
            .map_err(|e| sdk_error("delete route", route_table_id, e))?;
        Ok(())
    }

    async fn create_peering_connection(&self, request: &PeeringRequest) -> ProviderResult<String> {
        let output = self
            .client
            .create_vpc_peering_connection()
            .vpc_id(&request.requester_network_id)
            .peer_vpc_id(&request.accepter_network_id)
            .peer_owner_id(&request.accepter_account_id)
            .peer_region(request.accepter_region.as_str())
            .send()
            .await
            .map_err(|e| {
                sdk_error(
                    "create peering connection",
                    &request.requester_network_id,
                    e,
                )
            })?;

        output
            .vpc_peering_connection()
            .and_then(|pc| pc.vpc_peering_connection_id())
            .map(String::from)
            .ok_or_else(|| {
                ProviderError::new("Peering connection created but no ID returned")
                    .for_resource(&request.requester_network_id)
            })
    }

    async fn accept_peering_connection(&self, connection_id: &str) -> ProviderResult<()> {
        self.client
            .accept_vpc_peering_connection()
            .vpc_peering_connection_id(connection_id)
            .send()
            .await
            .map_err(|e| sdk_error("accept peering connection", connection_id, e))?;
        Ok(())
    }

    async fn delete_peering_connection(&self, connection_id: &str) -> ProviderResult<()> {
        self.client
            .delete_vpc_peering_connection()
            .vpc_peering_connection_id(connection_id)
            .send()
            .await
            .map_err(|e| sdk_error("delete peering connection", connection_id, e))?;
        Ok(())
    }

    async fn peering_connection_status(
        &self,
        connection_id: &str,
    ) -> ProviderResult<Option<PeeringStatus>> {
        let result = self
            .client
            .describe_vpc_peering_connections()
            .vpc_peering_connection_ids(connection_id)
            .send()
            .await
            .map_err(|e| sdk_error("describe peering connection", connection_id, e));
        let output = match result {
            Ok(output) => output,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(output
            .vpc_peering_connections()
            .first()
            .and_then(|pc| pc.status())
            .and_then(|status| status.code())
            .map(|code| PeeringStatus::from_code(code.as_str())))
    }

    async fn create_transit_gateway_attachment(
        &self,
        transit_gateway_id: &str,
        network_id: &str,
        subnet_ids: &[String],
    ) -> ProviderResult<String> {
        let output = self
            .client
            .create_transit_gateway_vpc_attachment()
            .transit_gateway_id(transit_gateway_id)
            .vpc_id(network_id)
            .set_subnet_ids(Some(subnet_ids.to_vec()))
            .send()
            .await
            .map_err(|e| sdk_error("create transit gateway attachment", network_id, e))?;

        output
            .transit_gateway_vpc_attachment()
            .and_then(|a| a.transit_gateway_attachment_id())
            .map(String::from)
            .ok_or_else(|| {
                ProviderError::new("Transit gateway attachment created but no ID returned")
                    .for_resource(network_id)
            })
    }

    async fn modify_transit_gateway_attachment(
        &self,
        attachment_id: &str,
        add_subnet_ids: &[String],
        remove_subnet_ids: &[String],
    ) -> ProviderResult<()> {
        let non_empty = |ids: &[String]| (!ids.is_empty()).then(|| ids.to_vec());
        self.client
            .modify_transit_gateway_vpc_attachment()
            .transit_gateway_attachment_id(attachment_id)
            .set_add_subnet_ids(non_empty(add_subnet_ids))
            .set_remove_subnet_ids(non_empty(remove_subnet_ids))
            .send()
            .await
            .map_err(|e| sdk_error("modify transit gateway attachment", attachment_id, e))?;
        Ok(())
    }

    async fn delete_transit_gateway_attachment(&self, attachment_id: &str) -> ProviderResult<()> {
        self.client
            .delete_transit_gateway_vpc_attachment()
            .transit_gateway_attachment_id(attachment_id)
            .send()
            .await
            .map_err(|e| sdk_error("delete transit gateway attachment", attachment_id, e))?;
        Ok(())
    }

    async fn accept_transit_gateway_attachment(&self, attachment_id: &str) -> ProviderResult<()> {
        self.client
            .accept_transit_gateway_vpc_attachment()
            .transit_gateway_attachment_id(attachment_id)
            .send()
            .await
            .map_err(|e| sdk_error("accept transit gateway attachment", attachment_id, e))?;
        Ok(())
    }

    async fn transit_gateway_attachment_status(
        &self,
        attachment_id: &str,
    ) -> ProviderResult<Option<AttachmentStatus>> {
        let result = self
            .client
            .describe_transit_gateway_vpc_attachments()
            .transit_gateway_attachment_ids(attachment_id)
            .send()
            .await
            .map_err(|e| sdk_error("describe transit gateway attachment", attachment_id, e));
        let output = match result {
            Ok(output) => output,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(output
            .transit_gateway_vpc_attachments()
            .first()
            .and_then(|a| a.state())
            .map(|state| AttachmentStatus::from_code(state.as_str())))
    }

    async fn transit_gateway_status(
        &self,
        transit_gateway_id: &str,
    ) -> ProviderResult<Option<TransitGatewayStatus>> {
        let result = self
            .client
            .describe_transit_gateways()
            .transit_gateway_ids(transit_gateway_id)
            .send()
            .await
            .map_err(|e| sdk_error("describe transit gateway", transit_gateway_id, e));
        let output = match result {
            Ok(output) => output,
            // Not yet visible: the share may still be propagating
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(output
            .transit_gateways()
            .first()
            .and_then(|tgw| tgw.state())
            .map(|state| TransitGatewayStatus::from_code(state.as_str())))
    }

    async fn tag_resource(
        &self,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> ProviderResult<()> {
        let tags = tags
            .iter()
            .map(|(key, value)| Tag::builder().key(key).value(value).build())
            .collect();
        self.client
            .create_tags()
            .resources(resource_id)
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|e| sdk_error("tag resource", resource_id, e))?;
        Ok(())
    }

    async fn subnet_cidr(&self, subnet_id: &str) -> ProviderResult<String> {
        let output = self
            .client
            .describe_subnets()
            .subnet_ids(subnet_id)
            .send()
            .await
            .map_err(|e| sdk_error("describe subnet", subnet_id, e))?;

        output
            .subnets()
            .first()
            .and_then(|s| s.cidr_block())
            .map(String::from)
            .ok_or_else(|| ProviderError::not_found("Subnet has no CIDR block").for_resource(subnet_id))
    }
}
