use kube::core::ApiResource;
use kube::core::DynamicObject;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSelector {
    pub match_labels: Option<BTreeMap<String, String>>,
}

/*
 * A named set of endpoints of the destination host, selected by labels.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Subset {
    pub name: String,

    pub labels: Option<BTreeMap<String, String>>,

    // left untyped: only the daemon's logs look at it
    pub traffic_policy: Option<serde_json::Value>,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(group = "networking.istio.io", version = "v1alpha3", kind = "DestinationRule", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRuleSpec {

    // the service registry name this rule applies to
    pub host: String,

    pub traffic_policy: Option<serde_json::Value>,

    pub subsets: Option<Vec<Subset>>,

    pub export_to: Option<Vec<String>>,

    pub workload_selector: Option<WorkloadSelector>,
}

impl DestinationRuleSpec {

    pub fn subset_names(&self) -> Vec<&str> {
	match &self.subsets {
	    Some(subsets) => subsets.iter().map(|s| s.name.as_str()).collect(),
	    None => vec![],
	}
    }

    /*
     * One-line description used by the daemon when it logs an object, e.g.
     *
     *   host: reviews.prod.svc.cluster.local, subsets: [v1, v2]
     */
    pub fn summary(&self) -> String {
	format!("host: {}, subsets: [{}]", self.host, self.subset_names().join(", "))
    }
}

/*
 * The dynamic-API handle of DestinationRule, for Api<DynamicObject>.
 */
pub fn api_resource() -> ApiResource {
    ApiResource::erase::<DestinationRule>(&())
}

/*
 * Reads the typed spec out of a schema-less object. Only `.spec` is looked at,
 * so objects carrying unknown top-level fields still convert.
 */
pub fn spec_of(obj: &DynamicObject) -> Result<DestinationRuleSpec, serde_json::Error> {
    let spec = match obj.data.get("spec") {
	Some(spec) => spec.clone(),
	None => serde_json::Value::Null,
    };

    serde_json::from_value(spec)
}
