//! JSON rendition of the DescribeInstances shape, as served by
//! inventory-compatible gateways:
//!
//! ```json
//! {"DescribeInstancesResponse": {
//!   "requestId": "...",
//!   "reservationSet": [{"reservationId": "...", "instancesSet": [{...}]}],
//!   "nextToken": null}}
//! ```
//!
//! Instance fields mirror the XML element names. `instanceState.code`
//! may be a number or a numeric string.

use serde_json::Value;

use super::{parse_timestamp, InventoryFormat, ParsedPage, RawPage};
use crate::error::{DiscoveryError, Result};
use crate::model::{non_empty, InstanceRecord, InstanceState};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonInventoryFormat;

impl InventoryFormat for JsonInventoryFormat {
    type Instance<'a> = &'a Value;

    fn name(&self) -> &'static str {
        "inventory-json"
    }

    fn parse_response(&self, page: &RawPage) -> Result<ParsedPage> {
        let doc: Value = serde_json::from_str(&page.body)
            .map_err(|e| DiscoveryError::MalformedResponse(format!("unparsable JSON: {e}")))?;

        let root = doc.get("DescribeInstancesResponse").ok_or_else(|| {
            DiscoveryError::MalformedResponse("missing DescribeInstancesResponse".into())
        })?;
        let reservations = root["reservationSet"].as_array().ok_or_else(|| {
            DiscoveryError::MalformedResponse("missing reservationSet array".into())
        })?;

        let mut parsed = ParsedPage {
            request_id: text(&root["requestId"]),
            next_token: text(&root["nextToken"]),
            reservations: reservations.len(),
            ..Default::default()
        };

        for reservation in reservations {
            let Some(instances) = reservation["instancesSet"].as_array() else {
                continue;
            };
            parsed
                .instances
                .extend(instances.iter().map(|i| self.parse_instance(i)));
        }

        Ok(parsed)
    }

    fn parse_instance(&self, raw: Self::Instance<'_>) -> InstanceRecord {
        let state = parse_state(&raw["instanceState"]);

        let mut record = InstanceRecord::new(text(&raw["instanceId"]).unwrap_or_default(), state);
        record.private_address = text(&raw["privateIpAddress"]);
        record.public_address = text(&raw["ipAddress"]);
        record.private_dns_name = text(&raw["privateDnsName"]);
        record.public_dns_name = text(&raw["dnsName"]);
        record.instance_type = text(&raw["instanceType"]);
        record.availability_zone = text(&raw["placement"]["availabilityZone"]);
        record.launch_time = text(&raw["launchTime"]).and_then(|t| parse_timestamp(&t));

        if let Some(tags) = raw["tagSet"].as_array() {
            for tag in tags {
                if let Some(key) = text(&tag["key"]) {
                    let value = tag["value"].as_str().unwrap_or_default().to_string();
                    record.tags.insert(key, value);
                }
            }
        }

        if let Some(groups) = raw["groupSet"].as_array() {
            for group in groups {
                record.security_groups.extend(text(&group["groupId"]));
                record.security_groups.extend(text(&group["groupName"]));
            }
        }

        record
    }
}

fn parse_state(state: &Value) -> InstanceState {
    let code = match &state["code"] {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    if let Some(code) = code {
        return InstanceState::from_code(code);
    }
    state["name"]
        .as_str()
        .map(InstanceState::from_name)
        .unwrap_or(InstanceState::Unknown)
}

fn text(value: &Value) -> Option<String> {
    non_empty(value.as_str())
}
