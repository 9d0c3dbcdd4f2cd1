//! EC2 query API XML (`DescribeInstancesResponse`).
//!
//! Elements are matched by local name, so any API version namespace is
//! accepted. List members are the `item` children of `*Set` elements.

use roxmltree::{Document, Node};

use super::{parse_timestamp, InventoryFormat, ParsedPage, RawPage};
use crate::error::{DiscoveryError, Result};
use crate::model::{non_empty, InstanceRecord, InstanceState};

const ROOT_ELEMENT: &str = "DescribeInstancesResponse";

#[derive(Debug, Clone, Copy, Default)]
pub struct Ec2XmlFormat;

impl InventoryFormat for Ec2XmlFormat {
    type Instance<'a> = Node<'a, 'a>;

    fn name(&self) -> &'static str {
        "ec2-xml"
    }

    fn parse_response(&self, page: &RawPage) -> Result<ParsedPage> {
        let doc = Document::parse(&page.body)
            .map_err(|e| DiscoveryError::MalformedResponse(format!("unparsable XML: {e}")))?;

        let root = doc.root_element();
        if root.tag_name().name() != ROOT_ELEMENT {
            return Err(DiscoveryError::MalformedResponse(format!(
                "expected <{ROOT_ELEMENT}>, found <{}>",
                root.tag_name().name()
            )));
        }

        let reservation_set = child(root, "reservationSet").ok_or_else(|| {
            DiscoveryError::MalformedResponse("missing <reservationSet>".into())
        })?;

        let mut parsed = ParsedPage {
            request_id: child_text(root, "requestId"),
            next_token: child_text(root, "nextToken"),
            ..Default::default()
        };

        for reservation in items(reservation_set) {
            parsed.reservations += 1;
            let Some(instances_set) = child(reservation, "instancesSet") else {
                continue;
            };
            parsed
                .instances
                .extend(items(instances_set).map(|node| self.parse_instance(node)));
        }

        Ok(parsed)
    }

    fn parse_instance(&self, node: Self::Instance<'_>) -> InstanceRecord {
        let state = child(node, "instanceState")
            .map(parse_state)
            .unwrap_or(InstanceState::Unknown);

        let mut record = InstanceRecord::new(
            child_text(node, "instanceId").unwrap_or_default(),
            state,
        );
        record.private_address = child_text(node, "privateIpAddress");
        record.public_address = child_text(node, "ipAddress");
        record.private_dns_name = child_text(node, "privateDnsName");
        record.public_dns_name = child_text(node, "dnsName");
        record.instance_type = child_text(node, "instanceType");
        record.availability_zone =
            child(node, "placement").and_then(|p| child_text(p, "availabilityZone"));
        record.launch_time = child_text(node, "launchTime").and_then(|t| parse_timestamp(&t));

        if let Some(tag_set) = child(node, "tagSet") {
            for tag in items(tag_set) {
                if let Some(key) = child_text(tag, "key") {
                    let value = child(tag, "value")
                        .and_then(|v| v.text())
                        .unwrap_or_default()
                        .to_string();
                    record.tags.insert(key, value);
                }
            }
        }

        if let Some(group_set) = child(node, "groupSet") {
            for group in items(group_set) {
                record.security_groups.extend(child_text(group, "groupId"));
                record.security_groups.extend(child_text(group, "groupName"));
            }
        }

        record
    }
}

fn parse_state(node: Node<'_, '_>) -> InstanceState {
    if let Some(code) = child_text(node, "code").and_then(|c| c.parse::<i64>().ok()) {
        return InstanceState::from_code(code);
    }
    child_text(node, "name")
        .map(|n| InstanceState::from_name(&n))
        .unwrap_or(InstanceState::Unknown)
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn items<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(|c| c.is_element() && c.tag_name().name() == "item")
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    child(node, name).and_then(|c| non_empty(c.text()))
}
