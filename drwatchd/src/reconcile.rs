use crate::errors::Error;
use crate::schema::PatchSchema;
use crate::strategic;

use kube::Resource;
use kube::ResourceExt;
use serde::Serialize;
use std::fmt;

pub const DEFAULT_MARKER_KEY: &str = "neg-status";
pub const DEFAULT_MARKER_VALUE: &str = "Hiiiiiiii";

/*
 * The annotation whose presence means "this object was already handled".
 */
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Marker {
    pub key: String,
    pub value: String,
}

impl Marker {
    pub fn new(key: &str, value: &str) -> Self {
	Self{
	    key: key.to_string(),
	    value: value.to_string(),
	}
    }
}

impl Default for Marker {
    fn default() -> Self {
	Marker::new(DEFAULT_MARKER_KEY, DEFAULT_MARKER_VALUE)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchKind {
    /* RFC 7386 JSON merge patch, the only kind custom resources accept */
    Merge,

    /* carries `$` directives, needs the strategic merge patch endpoint */
    Strategic,
}

impl PatchKind {
    pub fn of(patch: &serde_json::Value) -> Self {
	if strategic::requires_strategic(patch) {
	    PatchKind::Strategic
	} else {
	    PatchKind::Merge
	}
    }
}

/*
 * What to send to the API server: the object address plus the patch body.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct PatchRequest {
    pub namespace: Option<String>,
    pub name: String,
    pub kind: PatchKind,
    pub body: Vec<u8>,
}

impl PatchRequest {
    pub fn patch(&self) -> Result<serde_json::Value, Error> {
	serde_json::from_slice(&self.body).map_err(|source| Error::Serialization{ side: "patch", source })
    }
}

impl fmt::Display for PatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	let body = String::from_utf8_lossy(&self.body);
	match &self.namespace {
	    Some(namespace) => write!(f, "{}/{} ({:?}): {}", namespace, self.name, self.kind, body),
	    None => write!(f, "{} ({:?}): {}", self.name, self.kind, body),
	}
    }
}

/*
 * Decides whether `cur` needs the marker annotation and, if it does, returns
 * the patch that adds it. `cur` itself is never modified: the annotation is
 * added to a clone and the two are diffed under `schema`.
 */
pub fn annotate<K>(cur: &K, marker: &Marker, schema: &PatchSchema) -> Result<Option<PatchRequest>, Error>
where
    K: Resource + Serialize + Clone,
{
    if cur.annotations().contains_key(&marker.key) {
	return Ok(None);
    }

    let name = match &cur.meta().name {
	Some(name) => name.clone(),
	None => return Err(Error::Unaddressable(String::from("object without .metadata.name"))),
    };

    let mut desired = cur.clone();
    desired.annotations_mut().insert(marker.key.clone(), marker.value.clone());

    let patch = strategic::merge_patch(cur, &desired, schema)?;
    let body = serde_json::to_vec(&patch).map_err(|source| Error::Serialization{ side: "patch", source })?;

    Ok(Some(PatchRequest{
	namespace: cur.namespace(),
	name: name,
	kind: PatchKind::of(&patch),
	body: body,
    }))
}

/*
 * Reconciler carries what every reconciliation needs and doesn't change
 * between events.
 */
#[derive(Clone, Debug)]
pub struct Reconciler {
    marker: Marker,
    schema: PatchSchema,
}

impl Reconciler {

    pub fn marker(&self) -> &Marker {
	&self.marker
    }

    #[cfg(test)]
    pub fn schema(&self) -> &PatchSchema {
	&self.schema
    }

    pub fn reconcile<K>(&self, cur: &K) -> Result<Option<PatchRequest>, Error>
    where
	K: Resource + Serialize + Clone,
    {
	annotate(cur, &self.marker, &self.schema)
    }

    /*
     * The document `cur` would become once `request` is applied to it.
     */
    pub fn preview<K: Serialize>(&self, cur: &K, request: &PatchRequest) -> Result<serde_json::Value, Error> {
	let document = serde_json::to_value(cur).map_err(|source| Error::Serialization{ side: "old", source })?;
	let patch = request.patch()?;

	Ok(strategic::apply_patch(&document, &patch, &self.schema)?)
    }

    pub fn new(marker: Marker) -> Self {
	Self{
	    marker: marker,
	    schema: PatchSchema::metadata_only(),
	}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategic::apply_patch;
    use drwatch_api as api;
    use kube::api::ObjectMeta;
    use kube::core::DynamicObject;
    use kube::core::NamespaceResourceScope;
    use serde::Serializer;
    use serde_json::json;
    use std::borrow::Cow;
    use std::collections::BTreeMap;

    fn destination_rule(annotations: Option<BTreeMap<String, String>>) -> DynamicObject {
	let mut obj = DynamicObject::new("dr1", &api::destinationrule::api_resource())
	    .within("ns1")
	    .data(json!({ "spec": { "host": "foo" } }));
	obj.metadata.annotations = annotations;
	obj
    }

    fn marker() -> Marker {
	Marker::new("marker-key", "sentinel-value")
    }

    #[test]
    fn adds_missing_marker() {
	let cur = destination_rule(Some(BTreeMap::new()));
	let reconciler = Reconciler::new(marker());

	let request = reconciler.reconcile(&cur).unwrap().expect("a patch");
	assert_eq!(request.namespace.as_deref(), Some("ns1"));
	assert_eq!(request.name, "dr1");
	assert_eq!(request.kind, PatchKind::Merge);
	assert_eq!(
	    String::from_utf8(request.body.clone()).unwrap(),
	    r#"{"metadata":{"annotations":{"marker-key":"sentinel-value"}}}"#
	);
    }

    #[test]
    fn patch_turns_cur_into_desired() {
	let mut existing = BTreeMap::new();
	existing.insert("kept".to_string(), "as is".to_string());
	let cur = destination_rule(Some(existing));
	let reconciler = Reconciler::new(marker());

	let request = reconciler.reconcile(&cur).unwrap().unwrap();
	let patched = apply_patch(&serde_json::to_value(&cur).unwrap(), &request.patch().unwrap(), reconciler.schema()).unwrap();
	assert_eq!(reconciler.preview(&cur, &request).unwrap(), patched);

	assert_eq!(patched, json!({
	    "apiVersion": "networking.istio.io/v1alpha3",
	    "kind": "DestinationRule",
	    "metadata": {
		"name": "dr1",
		"namespace": "ns1",
		"annotations": { "kept": "as is", "marker-key": "sentinel-value" },
	    },
	    "spec": { "host": "foo" },
	}));
    }

    #[test]
    fn works_without_annotation_map() {
	let cur = destination_rule(None);

	let request = annotate(&cur, &marker(), &PatchSchema::metadata_only()).unwrap().unwrap();
	assert_eq!(request.patch().unwrap(), json!({ "metadata": { "annotations": { "marker-key": "sentinel-value" } } }));
	assert!(cur.metadata.annotations.is_none());
    }

    #[test]
    fn already_marked_is_a_no_op() {
	let mut annotations = BTreeMap::new();
	annotations.insert("marker-key".to_string(), "some other value".to_string());
	let cur = destination_rule(Some(annotations));

	assert_eq!(annotate(&cur, &marker(), &PatchSchema::metadata_only()).unwrap(), None);
    }

    #[test]
    fn patch_is_deterministic() {
	let cur = destination_rule(Some(BTreeMap::new()));
	let reconciler = Reconciler::new(Marker::default());

	let first = reconciler.reconcile(&cur).unwrap().unwrap();
	let second = reconciler.reconcile(&cur).unwrap().unwrap();
	assert_eq!(first.body, second.body);
	assert_eq!(first.patch().unwrap(), json!({ "metadata": { "annotations": { "neg-status": "Hiiiiiiii" } } }));
    }

    #[test]
    fn nameless_objects_are_unaddressable() {
	let mut cur = destination_rule(None);
	cur.metadata.name = None;

	let err = annotate(&cur, &marker(), &PatchSchema::metadata_only()).unwrap_err();
	assert!(matches!(err, Error::Unaddressable(_)));
    }

    #[derive(Clone, Debug)]
    struct Poisoned {
	metadata: ObjectMeta,
    }

    impl Resource for Poisoned {
	type DynamicType = ();
	type Scope = NamespaceResourceScope;

	fn kind(_: &()) -> Cow<'_, str> {
	    "Poisoned".into()
	}

	fn group(_: &()) -> Cow<'_, str> {
	    "test.drwatch.io".into()
	}

	fn version(_: &()) -> Cow<'_, str> {
	    "v1".into()
	}

	fn plural(_: &()) -> Cow<'_, str> {
	    "poisoneds".into()
	}

	fn meta(&self) -> &ObjectMeta {
	    &self.metadata
	}

	fn meta_mut(&mut self) -> &mut ObjectMeta {
	    &mut self.metadata
	}
    }

    impl Serialize for Poisoned {
	fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
	    Err(serde::ser::Error::custom("document cannot be serialized"))
	}
    }

    #[test]
    fn unserializable_document_is_reported() {
	let cur = Poisoned {
	    metadata: ObjectMeta {
		name: Some("broken".to_string()),
		namespace: Some("ns1".to_string()),
		..Default::default()
	    },
	};

	let err = annotate(&cur, &marker(), &PatchSchema::metadata_only()).unwrap_err();
	assert!(matches!(err, Error::Serialization { side: "old", .. }));
	assert!(err.to_string().contains("document cannot be serialized"));
    }

    #[test]
    fn display_names_the_object() {
	let request = PatchRequest {
	    namespace: Some("ns1".to_string()),
	    name: "dr1".to_string(),
	    kind: PatchKind::Merge,
	    body: br#"{"a":1}"#.to_vec(),
	};

	assert_eq!(request.to_string(), r#"ns1/dr1 (Merge): {"a":1}"#);
    }
}
