//! Endpoint selector: one instance in, at most one endpoint out.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::{InstanceRecord, PeerEndpoint};

/// Which instance address becomes the peer host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AddressPreference {
    PreferPrivate,
    PreferPublic,
    PrivateOnly,
    PublicOnly,
    PrivateDns,
    PublicDns,
    /// Host is the value of the named tag.
    Tag(String),
}

impl FromStr for AddressPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(tag) = s.strip_prefix("tag:") {
            if tag.is_empty() {
                return Err("tag address preference needs a tag name".into());
            }
            return Ok(Self::Tag(tag.to_string()));
        }
        match s {
            "prefer_private" => Ok(Self::PreferPrivate),
            "prefer_public" => Ok(Self::PreferPublic),
            "private_only" | "private_ip" => Ok(Self::PrivateOnly),
            "public_only" | "public_ip" => Ok(Self::PublicOnly),
            "private_dns" => Ok(Self::PrivateDns),
            "public_dns" => Ok(Self::PublicDns),
            other => Err(format!("unknown address preference '{other}'")),
        }
    }
}

impl TryFrom<String> for AddressPreference {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for AddressPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreferPrivate => f.write_str("prefer_private"),
            Self::PreferPublic => f.write_str("prefer_public"),
            Self::PrivateOnly => f.write_str("private_only"),
            Self::PublicOnly => f.write_str("public_only"),
            Self::PrivateDns => f.write_str("private_dns"),
            Self::PublicDns => f.write_str("public_dns"),
            Self::Tag(name) => write!(f, "tag:{name}"),
        }
    }
}

impl From<AddressPreference> for String {
    fn from(p: AddressPreference) -> Self {
        p.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSelectionPolicy {
    pub preference: AddressPreference,
    /// Transport port of every peer. Never taken from the instance.
    pub port: u16,
}

impl Default for EndpointSelectionPolicy {
    fn default() -> Self {
        Self {
            preference: AddressPreference::PreferPrivate,
            port: 9300,
        }
    }
}

impl EndpointSelectionPolicy {
    pub fn new(preference: AddressPreference, port: u16) -> Self {
        Self { preference, port }
    }
}

/// Map an instance to its peer endpoint. `None` drops the instance.
pub fn select(record: &InstanceRecord, policy: &EndpointSelectionPolicy) -> Option<PeerEndpoint> {
    let private = record.private_address.as_ref();
    let public = record.public_address.as_ref();

    let host = match &policy.preference {
        AddressPreference::PreferPrivate => private.or(public),
        AddressPreference::PreferPublic => public.or(private),
        AddressPreference::PrivateOnly => private,
        AddressPreference::PublicOnly => public,
        AddressPreference::PrivateDns => record.private_dns_name.as_ref(),
        AddressPreference::PublicDns => record.public_dns_name.as_ref(),
        AddressPreference::Tag(name) => record.tags.get(name).filter(|v| !v.trim().is_empty()),
    }?;

    Some(PeerEndpoint::new(host.trim(), policy.port))
}
