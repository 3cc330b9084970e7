//! Network boundary of the cluster
//!
//! The VPC range is split into equally sized subnets: one public subnet per
//! failure zone (load balancers) followed by one private subnet per zone
//! (worker nodes and the database).

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use meridian_common::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const COMPONENT: &str = "cluster";

/// Minimum number of distinct failure zones
pub const MIN_ZONES: usize = 3;

/// Smallest subnet the cloud provider accepts
const MAX_SUBNET_PREFIX: u8 = 28;

/// An IPv4 network in CIDR notation
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Network address
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of subnets of length `prefix` that fit in this network
    pub fn subnet_capacity(&self, prefix: u8) -> u64 {
        if prefix < self.prefix {
            0
        } else {
            1u64 << (prefix - self.prefix)
        }
    }

    /// The `index`-th subnet of length `prefix`
    pub fn subnet(&self, prefix: u8, index: u64) -> Option<Ipv4Cidr> {
        if prefix > 32 || index >= self.subnet_capacity(prefix) {
            return None;
        }
        let size = 1u64 << (32 - prefix);
        let network = u64::from(self.network) + index * size;
        Some(Ipv4Cidr {
            network: u32::try_from(network).ok()?,
            prefix,
        })
    }

    /// Whether `other` lies entirely inside this network
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && mask(self.prefix) & other.network == self.network
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| Error::configuration(COMPONENT, format!("CIDR '{}' {}", s, why));

        let (addr, prefix) = s.split_once('/').ok_or_else(|| invalid("has no prefix length"))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid("has an invalid address"))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| invalid("has an invalid prefix length"))?;

        let network = u32::from(addr);
        if network & !mask(prefix) != 0 {
            return Err(invalid("has host bits set"));
        }
        Ok(Self { network, prefix })
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

/// Requested network shape
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// VPC range, e.g. `10.0.0.0/16`
    pub vpc_cidr: String,
    /// Failure zones, at least three
    pub zones: Vec<String>,
    /// Prefix length of each subnet
    #[serde(default = "default_subnet_prefix")]
    pub subnet_prefix: u8,
}

fn default_subnet_prefix() -> u8 {
    20
}

/// Whether a subnet faces the internet
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetTier {
    /// Routable from the internet; load balancers live here
    Public,
    /// Reachable only inside the VPC; nodes and the database live here
    Private,
}

/// One subnet of the layout
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    /// Failure zone
    pub zone: String,
    /// Address range
    pub cidr: String,
    /// Public or private
    pub tier: SubnetTier,
}

/// The cluster's partitioned network
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkLayout {
    /// VPC range
    pub vpc_cidr: String,
    /// Public subnets first, then private, each in zone order
    pub subnets: Vec<Subnet>,
}

impl NetworkLayout {
    /// Partition the VPC range across the requested zones
    pub fn partition(spec: &NetworkSpec) -> Result<Self> {
        let vpc: Ipv4Cidr = spec.vpc_cidr.parse()?;

        let mut zones = spec.zones.clone();
        zones.sort();
        zones.dedup();
        if zones.len() != spec.zones.len() {
            return Err(Error::configuration(COMPONENT, "failure zones must be distinct"));
        }
        if spec.zones.len() < MIN_ZONES {
            return Err(Error::configuration(
                COMPONENT,
                format!(
                    "at least {} failure zones required, got {}",
                    MIN_ZONES,
                    spec.zones.len()
                ),
            ));
        }

        if spec.subnet_prefix <= vpc.prefix() || spec.subnet_prefix > MAX_SUBNET_PREFIX {
            return Err(Error::configuration(
                COMPONENT,
                format!(
                    "subnet prefix /{} must be longer than the VPC's /{} and at most /{}",
                    spec.subnet_prefix,
                    vpc.prefix(),
                    MAX_SUBNET_PREFIX
                ),
            ));
        }

        let needed = 2 * spec.zones.len() as u64;
        if vpc.subnet_capacity(spec.subnet_prefix) < needed {
            return Err(Error::configuration(
                COMPONENT,
                format!(
                    "{} cannot hold {} /{} subnets",
                    vpc, needed, spec.subnet_prefix
                ),
            ));
        }

        let mut subnets = Vec::with_capacity(needed as usize);
        for (tier_index, tier) in [SubnetTier::Public, SubnetTier::Private].into_iter().enumerate() {
            for (zone_index, zone) in spec.zones.iter().enumerate() {
                let index = (tier_index * spec.zones.len() + zone_index) as u64;
                let cidr = vpc.subnet(spec.subnet_prefix, index).ok_or_else(|| {
                    Error::configuration(COMPONENT, format!("subnet {} outside {}", index, vpc))
                })?;
                subnets.push(Subnet {
                    zone: zone.clone(),
                    cidr: cidr.to_string(),
                    tier,
                });
            }
        }

        Ok(Self {
            vpc_cidr: vpc.to_string(),
            subnets,
        })
    }

    /// Subnets of one tier, in zone order
    pub fn subnets(&self, tier: SubnetTier) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter().filter(move |s| s.tier == tier)
    }

    /// Public subnet ranges
    pub fn public_cidrs(&self) -> Vec<String> {
        self.subnets(SubnetTier::Public).map(|s| s.cidr.clone()).collect()
    }

    /// Private subnet ranges
    pub fn private_cidrs(&self) -> Vec<String> {
        self.subnets(SubnetTier::Private).map(|s| s.cidr.clone()).collect()
    }

    /// Failure zones in declaration order
    pub fn zones(&self) -> Vec<String> {
        self.subnets(SubnetTier::Public).map(|s| s.zone.clone()).collect()
    }
}
