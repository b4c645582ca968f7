use serde_json::Value;
use std::collections::BTreeMap;

static ANY: PatchSchema = PatchSchema::Any;

/*
 * How the entries of a list are merged when two versions of it are diffed.
 */
#[derive(Clone, Debug, PartialEq)]
pub enum ListStrategy {
    /* the whole list is sent whenever it differs */
    Replace,

    /* set of scalars, e.g. metadata.finalizers */
    MergePrimitives,

    /* list of objects identified by `key`, e.g. metadata.ownerReferences by uid */
    MergeByKey {
	key: String,
	item: Box<PatchSchema>,
    },
}

/*
 * PatchSchema describes the field layout of a reference type, so that the
 * diff knows for each field whether to recurse, replace, or merge by key.
 */
#[derive(Clone, Debug, PartialEq)]
pub enum PatchSchema {
    /* unknown layout: objects recurse, lists are replaced */
    Any,

    /* replaced as a whole when it differs */
    Atomic,

    /* known fields; fields not listed here fall back to Any */
    Struct(BTreeMap<String, PatchSchema>),

    /* string-keyed map whose values share one layout */
    Map(Box<PatchSchema>),

    List(ListStrategy),
}

impl PatchSchema {

    pub fn fields<I, K>(fields: I) -> Self
    where
	I: IntoIterator<Item = (K, PatchSchema)>,
	K: Into<String>,
    {
	PatchSchema::Struct(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /*
     * Schema of the value stored under `name` inside a value described by self.
     */
    pub fn field(&self, name: &str) -> &PatchSchema {
	match self {
	    PatchSchema::Struct(fields) => fields.get(name).unwrap_or(&ANY),
	    PatchSchema::Map(values) => values.as_ref(),
	    PatchSchema::Atomic => self,
	    PatchSchema::Any | PatchSchema::List(_) => &ANY,
	}
    }

    /*
     * Returns the name of the expected shape when `value` can't be described by
     * self. null always fits: it is how a patch removes a field.
     */
    pub fn mismatch(&self, value: &Value) -> Option<&'static str> {
	match (self, value) {
	    (_, Value::Null) => None,
	    (PatchSchema::Struct(_) | PatchSchema::Map(_), Value::Object(_)) => None,
	    (PatchSchema::Struct(_) | PatchSchema::Map(_), _) => Some("object"),
	    (PatchSchema::List(_), Value::Array(_)) => None,
	    (PatchSchema::List(_), _) => Some("list"),
	    (PatchSchema::Any | PatchSchema::Atomic, _) => None,
	}
    }

    /*
     * The layout of metav1.ObjectMeta as far as merging goes.
     */
    pub fn object_meta() -> Self {
	PatchSchema::fields([
	    ("annotations", PatchSchema::Map(Box::new(PatchSchema::Atomic))),
	    ("labels", PatchSchema::Map(Box::new(PatchSchema::Atomic))),
	    ("finalizers", PatchSchema::List(ListStrategy::MergePrimitives)),
	    ("ownerReferences", PatchSchema::List(ListStrategy::MergeByKey {
		key: "uid".to_string(),
		item: Box::new(PatchSchema::Any),
	    })),
	    ("managedFields", PatchSchema::List(ListStrategy::Replace)),
	])
    }

    /*
     * Reference layout for whole objects when only metadata is known, which is
     * the case for every custom resource watched through the dynamic API.
     */
    pub fn metadata_only() -> Self {
	PatchSchema::fields([("metadata", PatchSchema::object_meta())])
    }
}
