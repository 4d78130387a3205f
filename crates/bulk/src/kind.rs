//! Resource kinds and the per-kind dispatch table.
//!
//! The coordinator never contains resource-specific code: everything it needs
//! to know about a kind (endpoint, body field, cache key, allowed operations)
//! lives in a [`KindSpec`] looked up from a [`KindRegistry`].

use std::fmt;

use bitflags::bitflags;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Class of managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
	AclV4,
	AclV6,
	Gateway,
	GatewayProfile,
	Switchpoint,
	Pod,
	GroupingRule,
	PbRouting,
	PbRoutingAcl,
	Threshold,
	ThresholdGroup,
	Tenant,
	Service,
	Lag,
	Bundle,
}

impl ResourceKind {
	pub const ALL: [Self; 15] = [
		Self::AclV4,
		Self::AclV6,
		Self::Gateway,
		Self::GatewayProfile,
		Self::Switchpoint,
		Self::Pod,
		Self::GroupingRule,
		Self::PbRouting,
		Self::PbRoutingAcl,
		Self::Threshold,
		Self::ThresholdGroup,
		Self::Tenant,
		Self::Service,
		Self::Lag,
		Self::Bundle,
	];

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::AclV4 => "acl_v4",
			Self::AclV6 => "acl_v6",
			Self::Gateway => "gateway",
			Self::GatewayProfile => "gateway_profile",
			Self::Switchpoint => "switchpoint",
			Self::Pod => "pod",
			Self::GroupingRule => "grouping_rule",
			Self::PbRouting => "pb_routing",
			Self::PbRoutingAcl => "pb_routing_acl",
			Self::Threshold => "threshold",
			Self::ThresholdGroup => "threshold_group",
			Self::Tenant => "tenant",
			Self::Service => "service",
			Self::Lag => "lag",
			Self::Bundle => "bundle",
		}
	}
}

impl fmt::Display for ResourceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl std::str::FromStr for ResourceKind {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Self::ALL.into_iter().find(|k| k.as_str() == s).ok_or_else(|| format!("unknown resource kind {s:?}"))
	}
}

/// Write operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
	Put,
	Patch,
	Delete,
}

impl OpType {
	/// Order in which one kind's pending work is sent during a flush.
	pub const DRAIN_ORDER: [Self; 3] = [Self::Delete, Self::Put, Self::Patch];

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Put => "put",
			Self::Patch => "patch",
			Self::Delete => "delete",
		}
	}

	pub const fn flag(self) -> OpSet {
		match self {
			Self::Put => OpSet::PUT,
			Self::Patch => OpSet::PATCH,
			Self::Delete => OpSet::DELETE,
		}
	}
}

impl fmt::Display for OpType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

bitflags! {
	/// Operations a kind accepts.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct OpSet: u8 {
		const PUT = 1 << 0;
		const PATCH = 1 << 1;
		const DELETE = 1 << 2;
	}
}

/// Dispatch record for one resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSpec {
	pub kind: ResourceKind,
	/// Path segment under `/api/`.
	pub endpoint: String,
	/// Root field of PUT/PATCH/DELETE bodies.
	pub write_field: String,
	/// Root field of the GET response holding the collection.
	pub read_field: String,
	/// Response cache key for the kind's collection.
	pub cache_key: String,
	pub ops: OpSet,
	/// Fixed query parameters sent with every request.
	pub query: Vec<(String, String)>,
	/// Whether the controller fills fields on write that callers must read back.
	pub auto_generated: bool,
}

impl KindSpec {
	/// Creates a spec using `field` for both bodies and responses.
	pub fn new(kind: ResourceKind, endpoint: impl Into<String>, field: impl Into<String>, cache_key: impl Into<String>) -> Self {
		let field = field.into();
		Self {
			kind,
			endpoint: endpoint.into(),
			write_field: field.clone(),
			read_field: field,
			cache_key: cache_key.into(),
			ops: OpSet::all(),
			query: Vec::new(),
			auto_generated: false,
		}
	}

	#[must_use]
	pub fn read_field(mut self, field: impl Into<String>) -> Self {
		self.read_field = field.into();
		self
	}

	#[must_use]
	pub fn ops(mut self, ops: OpSet) -> Self {
		self.ops = ops;
		self
	}

	#[must_use]
	pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.query.push((key.into(), value.into()));
		self
	}

	#[must_use]
	pub fn auto_generated(mut self) -> Self {
		self.auto_generated = true;
		self
	}

	pub fn supports(&self, op: OpType) -> bool {
		self.ops.contains(op.flag())
	}

	/// Request path, e.g. `/api/gateways`.
	pub fn path(&self) -> String {
		format!("/api/{}", self.endpoint)
	}
}

/// Lookup table from [`ResourceKind`] to [`KindSpec`].
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
	specs: IndexMap<ResourceKind, KindSpec>,
}

impl KindRegistry {
	pub fn empty() -> Self {
		Self::default()
	}

	/// Registry of every kind the controller exposes.
	pub fn builtin() -> Self {
		use ResourceKind as K;

		Self::empty()
			.with(KindSpec::new(K::AclV4, "acls", "ip_filter", "acls_v4").read_field("ipv4_filter").query("ip_version", "4"))
			.with(KindSpec::new(K::AclV6, "acls", "ipv6_filter", "acls_v6").query("ip_version", "6"))
			.with(KindSpec::new(K::Gateway, "gateways", "gateway", "gateways"))
			.with(KindSpec::new(K::GatewayProfile, "gatewayprofiles", "gateway_profile", "gateway_profiles"))
			.with(KindSpec::new(K::Switchpoint, "switchpoints", "switchpoint", "switchpoints").auto_generated())
			.with(KindSpec::new(K::Pod, "pods", "pod", "pods"))
			.with(KindSpec::new(K::GroupingRule, "groupingrules", "grouping_rules", "grouping_rules"))
			.with(KindSpec::new(K::PbRouting, "policybasedrouting", "pb_routing", "pb_routing"))
			.with(KindSpec::new(K::PbRoutingAcl, "policybasedroutingacl", "pb_routing_acl", "pb_routing_acl"))
			.with(KindSpec::new(K::Threshold, "thresholds", "threshold", "thresholds"))
			.with(KindSpec::new(K::ThresholdGroup, "thresholdgroups", "threshold_group", "threshold_groups"))
			.with(KindSpec::new(K::Tenant, "tenants", "tenant", "tenants").auto_generated())
			.with(KindSpec::new(K::Service, "services", "service", "services").auto_generated())
			.with(KindSpec::new(K::Lag, "lags", "lag", "lags"))
			.with(KindSpec::new(K::Bundle, "bundles", "endpoint_bundle", "bundles").ops(OpSet::PATCH))
	}

	/// Adds or replaces the spec for `spec.kind`.
	#[must_use]
	pub fn with(mut self, spec: KindSpec) -> Self {
		self.specs.insert(spec.kind, spec);
		self
	}

	pub fn get(&self, kind: ResourceKind) -> Result<&KindSpec> {
		self.specs.get(&kind).ok_or(Error::UnknownKind(kind))
	}

	pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
		self.specs.keys().copied()
	}

	pub fn len(&self) -> usize {
		self.specs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.specs.is_empty()
	}
}
