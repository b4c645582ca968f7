use crate::errors::Error;
use crate::errors::PatchError;
use crate::schema::ListStrategy;
use crate::schema::PatchSchema;

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

const ROOT: &str = "<root>";
const DIRECTIVE: &str = "$patch";
const DELETE: &str = "delete";
const SET_ELEMENT_ORDER: &str = "$setElementOrder/";
const DELETE_FROM_PRIMITIVE_LIST: &str = "$deleteFromPrimitiveList/";

fn kind_of(value: &Value) -> &'static str {
    match value {
	Value::Null => "null",
	Value::Bool(_) => "bool",
	Value::Number(_) => "number",
	Value::String(_) => "string",
	Value::Array(_) => "list",
	Value::Object(_) => "object",
    }
}

fn child(path: &str, key: &str) -> String {
    if path.is_empty() {
	key.to_string()
    } else {
	format!("{}.{}", path, key)
    }
}

fn check_shape(schema: &PatchSchema, value: &Value, path: &str) -> Result<(), PatchError> {
    match schema.mismatch(value) {
	Some(expected) => Err(PatchError::TypeMismatch {
	    path: path.to_string(),
	    expected,
	    found: kind_of(value),
	}),
	None => Ok(()),
    }
}

/*
 * Builds a patch that turns `original` into `modified`, the way a two-way
 * strategic merge patch does it:
 *
 *  - a field missing from `modified` is sent as null
 *  - nested objects only carry the fields that changed
 *  - lists follow their ListStrategy, falling back to whole replacement
 *
 * MergePrimitives lists are sets, as on the API server: duplicates in
 * `modified` collapse once the patch is applied.
 *
 * Neither input is touched. Keys come out sorted, so the same inputs always
 * serialize to the same bytes.
 */
pub fn create_two_way_merge_patch(original: &Value, modified: &Value, schema: &PatchSchema) -> Result<Value, PatchError> {
    let (original, modified) = match (original, modified) {
	(Value::Object(original), Value::Object(modified)) => (original, modified),
	(Value::Object(_), other) | (other, _) => {
	    return Err(PatchError::TypeMismatch {
		path: ROOT.to_string(),
		expected: "object",
		found: kind_of(other),
	    });
	}
    };

    Ok(Value::Object(diff_maps(original, modified, schema, "")?))
}

fn diff_maps(original: &Map<String, Value>, modified: &Map<String, Value>, schema: &PatchSchema, path: &str) -> Result<Map<String, Value>, PatchError> {
    let mut patch = Map::new();

    for key in original.keys() {
	if !modified.contains_key(key) {
	    patch.insert(key.clone(), Value::Null);
	}
    }

    for (key, new) in modified {
	let field = schema.field(key);
	let field_path = child(path, key);
	check_shape(field, new, &field_path)?;

	let old = match original.get(key) {
	    Some(old) if old == new => continue,
	    Some(old) => old,
	    None => {
		if let (PatchSchema::List(ListStrategy::MergeByKey { key: merge_key, .. }), Value::Array(items)) = (field, new) {
		    index_by_key(items, merge_key, &field_path)?;
		}
		patch.insert(key.clone(), new.clone());
		continue;
	    }
	};
	check_shape(field, old, &field_path)?;

	match (field, old, new) {
	    (PatchSchema::Atomic, _, _) => {
		patch.insert(key.clone(), new.clone());
	    }
	    (PatchSchema::List(ListStrategy::MergePrimitives), Value::Array(old), Value::Array(new)) => {
		diff_primitive_list(key, old, new, &field_path, &mut patch)?;
	    }
	    (PatchSchema::List(ListStrategy::MergeByKey { key: merge_key, item }), Value::Array(old), Value::Array(new)) => {
		diff_keyed_list(key, merge_key, item, old, new, &field_path, &mut patch)?;
	    }
	    (_, Value::Object(old), Value::Object(new)) => {
		let nested = diff_maps(old, new, field, &field_path)?;
		if !nested.is_empty() {
		    patch.insert(key.clone(), Value::Object(nested));
		}
	    }
	    _ => {
		patch.insert(key.clone(), new.clone());
	    }
	}
    }

    Ok(patch)
}

fn push_unique(list: &mut Vec<Value>, value: &Value) {
    if !list.contains(value) {
	list.push(value.clone());
    }
}

fn diff_primitive_list(field: &str, old: &[Value], new: &[Value], path: &str, patch: &mut Map<String, Value>) -> Result<(), PatchError> {
    if old.iter().chain(new).any(|item| item.is_object() || item.is_array()) {
	return Err(PatchError::NonPrimitive { path: path.to_string() });
    }

    let mut added = Vec::new();
    for item in new.iter().filter(|item| !old.contains(item)) {
	push_unique(&mut added, item);
    }

    let mut deleted = Vec::new();
    for item in old.iter().filter(|item| !new.contains(item)) {
	push_unique(&mut deleted, item);
    }

    if !added.is_empty() {
	patch.insert(field.to_string(), Value::Array(added));
    }
    if !deleted.is_empty() {
	patch.insert(format!("{}{}", DELETE_FROM_PRIMITIVE_LIST, field), Value::Array(deleted));
    }
    patch.insert(format!("{}{}", SET_ELEMENT_ORDER, field), Value::Array(new.to_vec()));

    Ok(())
}

type KeyIndex<'a> = Vec<(&'a Value, &'a Map<String, Value>)>;

fn index_by_key<'a>(items: &'a [Value], merge_key: &str, path: &str) -> Result<KeyIndex<'a>, PatchError> {
    let mut index: KeyIndex<'a> = Vec::with_capacity(items.len());

    for item in items {
	let element = match item {
	    Value::Object(element) => element,
	    other => {
		return Err(PatchError::TypeMismatch {
		    path: path.to_string(),
		    expected: "object",
		    found: kind_of(other),
		});
	    }
	};

	let id = match element.get(merge_key) {
	    Some(id) if !id.is_null() => id,
	    _ => {
		return Err(PatchError::MissingMergeKey {
		    path: path.to_string(),
		    key: merge_key.to_string(),
		});
	    }
	};

	if index.iter().any(|(seen, _)| *seen == id) {
	    return Err(PatchError::DuplicateMergeKey {
		path: path.to_string(),
		key: merge_key.to_string(),
		value: id.to_string(),
	    });
	}
	index.push((id, element));
    }

    Ok(index)
}

fn lookup<'a>(index: &KeyIndex<'a>, id: &Value) -> Option<&'a Map<String, Value>> {
    index.iter().find(|(seen, _)| *seen == id).map(|(_, element)| *element)
}

fn diff_keyed_list(
    field: &str,
    merge_key: &str,
    item: &PatchSchema,
    old: &[Value],
    new: &[Value],
    path: &str,
    patch: &mut Map<String, Value>,
) -> Result<(), PatchError> {
    let old_index = index_by_key(old, merge_key, path)?;
    let new_index = index_by_key(new, merge_key, path)?;
    let mut entries = Vec::new();

    for (id, element) in &new_index {
	match lookup(&old_index, id) {
	    Some(previous) if previous == *element => {}
	    Some(previous) => {
		let mut changed = diff_maps(previous, element, item, &child(path, &id.to_string()))?;
		changed.insert(merge_key.to_string(), (*id).clone());
		entries.push(Value::Object(changed));
	    }
	    None => entries.push(Value::Object((*element).clone())),
	}
    }

    for (id, _) in &old_index {
	if lookup(&new_index, id).is_none() {
	    let mut gone = Map::new();
	    gone.insert(merge_key.to_string(), (*id).clone());
	    gone.insert(DIRECTIVE.to_string(), Value::String(DELETE.to_string()));
	    entries.push(Value::Object(gone));
	}
    }

    if !entries.is_empty() {
	patch.insert(field.to_string(), Value::Array(entries));
    }

    let order = new_index
	.iter()
	.map(|(id, _)| {
	    let mut key = Map::new();
	    key.insert(merge_key.to_string(), (*id).clone());
	    Value::Object(key)
	})
	.collect();
    patch.insert(format!("{}{}", SET_ELEMENT_ORDER, field), Value::Array(order));

    Ok(())
}

/*
 * Applies a patch produced by create_two_way_merge_patch to `document` and
 * returns the result. `document` is left as is.
 */
pub fn apply_patch(document: &Value, patch: &Value, schema: &PatchSchema) -> Result<Value, PatchError> {
    let (document, patch) = match (document, patch) {
	(Value::Object(document), Value::Object(patch)) => (document, patch),
	_ => {
	    return Err(PatchError::InvalidPatch {
		path: ROOT.to_string(),
		reason: String::from("both document and patch must be objects"),
	    });
	}
    };

    let mut merged = document.clone();
    merge_into(&mut merged, patch, schema, "")?;

    Ok(Value::Object(merged))
}

fn invalid(path: &str, reason: String) -> PatchError {
    PatchError::InvalidPatch {
	path: if path.is_empty() { ROOT.to_string() } else { path.to_string() },
	reason,
    }
}

fn merge_into(target: &mut Map<String, Value>, patch: &Map<String, Value>, schema: &PatchSchema, path: &str) -> Result<(), PatchError> {
    let mut orders = Vec::new();

    // directives first, so that additions below don't get deleted again
    for (key, value) in patch {
	if let Some(field) = key.strip_prefix(SET_ELEMENT_ORDER) {
	    orders.push((field, value));
	} else if let Some(field) = key.strip_prefix(DELETE_FROM_PRIMITIVE_LIST) {
	    let doomed = match value {
		Value::Array(doomed) => doomed,
		other => return Err(invalid(path, format!("{} expects a list, got {}", key, kind_of(other)))),
	    };
	    if let Some(Value::Array(items)) = target.get_mut(field) {
		items.retain(|item| !doomed.contains(item));
	    }
	} else if key.starts_with('$') {
	    return Err(invalid(path, format!("unsupported directive {}", key)));
	}
    }

    for (key, value) in patch {
	if key.starts_with('$') {
	    continue;
	}
	if value.is_null() {
	    target.remove(key);
	    continue;
	}

	let field = schema.field(key);
	let field_path = child(path, key);
	match (field, value) {
	    (PatchSchema::Atomic, _) => {
		target.insert(key.clone(), value.clone());
	    }
	    (PatchSchema::List(strategy), Value::Array(entries)) => {
		merge_list(target, key, entries, strategy, &field_path)?;
	    }
	    (PatchSchema::List(_), other) => {
		return Err(PatchError::TypeMismatch {
		    path: field_path,
		    expected: "list",
		    found: kind_of(other),
		});
	    }
	    (_, Value::Object(nested)) => {
		let slot = target.entry(key.clone()).or_insert_with(|| Value::Object(Map::new()));
		if !slot.is_object() {
		    *slot = Value::Object(Map::new());
		}
		if let Value::Object(existing) = slot {
		    merge_into(existing, nested, field, &field_path)?;
		}
	    }
	    _ => {
		target.insert(key.clone(), value.clone());
	    }
	}
    }

    for (field, order) in orders {
	let order = match order {
	    Value::Array(order) => order,
	    other => return Err(invalid(path, format!("{}{} expects a list, got {}", SET_ELEMENT_ORDER, field, kind_of(other)))),
	};
	if let Some(Value::Array(items)) = target.get_mut(field) {
	    reorder(items, order, schema.field(field));
	}
    }

    Ok(())
}

fn merge_list(target: &mut Map<String, Value>, key: &str, entries: &[Value], strategy: &ListStrategy, path: &str) -> Result<(), PatchError> {
    if let ListStrategy::Replace = strategy {
	target.insert(key.to_string(), Value::Array(entries.to_vec()));
	return Ok(());
    }

    let slot = target.entry(key.to_string()).or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
	*slot = Value::Array(Vec::new());
    }
    let items = match slot {
	Value::Array(items) => items,
	_ => return Ok(()),
    };

    match strategy {
	ListStrategy::Replace => {}
	ListStrategy::MergePrimitives => {
	    for entry in entries {
		push_unique(items, entry);
	    }
	}
	ListStrategy::MergeByKey { key: merge_key, item } => {
	    merge_keyed_list(items, entries, merge_key, item, path)?;
	}
    }

    Ok(())
}

fn merge_keyed_list(items: &mut Vec<Value>, entries: &[Value], merge_key: &str, item: &PatchSchema, path: &str) -> Result<(), PatchError> {
    for entry in entries {
	let entry = match entry {
	    Value::Object(entry) => entry,
	    other => {
		return Err(PatchError::TypeMismatch {
		    path: path.to_string(),
		    expected: "object",
		    found: kind_of(other),
		});
	    }
	};
	let id = match entry.get(merge_key) {
	    Some(id) if !id.is_null() => id,
	    _ => {
		return Err(PatchError::MissingMergeKey {
		    path: path.to_string(),
		    key: merge_key.to_string(),
		});
	    }
	};
	let position = items.iter().position(|existing| existing.get(merge_key) == Some(id));

	match entry.get(DIRECTIVE) {
	    Some(Value::String(directive)) if directive == DELETE => {
		if let Some(i) = position {
		    items.remove(i);
		}
		continue;
	    }
	    Some(other) => return Err(invalid(path, format!("unsupported {} value {}", DIRECTIVE, other))),
	    None => {}
	}

	let element_path = child(path, &id.to_string());
	match position {
	    Some(i) if items[i].is_object() => {
		if let Value::Object(existing) = &mut items[i] {
		    merge_into(existing, entry, item, &element_path)?;
		}
	    }
	    _ => {
		let mut fresh = Map::new();
		merge_into(&mut fresh, entry, item, &element_path)?;
		match position {
		    Some(i) => items[i] = Value::Object(fresh),
		    None => items.push(Value::Object(fresh)),
		}
	    }
	}
    }

    Ok(())
}

/*
 * Sorts `items` by `order`. Items the order doesn't mention keep their
 * relative position at the end.
 */
fn reorder(items: &mut Vec<Value>, order: &[Value], schema: &PatchSchema) {
    let merge_key = match schema {
	PatchSchema::List(ListStrategy::MergeByKey { key, .. }) => Some(key.as_str()),
	_ => None,
    };
    let identity = |value: &Value| -> Value {
	match merge_key {
	    Some(key) => value.get(key).cloned().unwrap_or(Value::Null),
	    None => value.clone(),
	}
    };

    let mut rest = std::mem::take(items);
    for wanted in order.iter().map(identity) {
	if let Some(i) = rest.iter().position(|item| identity(item) == wanted) {
	    items.push(rest.remove(i));
	}
    }
    items.append(&mut rest);
}

/*
 * Custom resources only accept JSON merge patches; anything carrying a `$`
 * directive needs a strategic merge patch instead.
 */
pub fn requires_strategic(patch: &Value) -> bool {
    match patch {
	Value::Object(map) => map.iter().any(|(key, value)| key.starts_with('$') || requires_strategic(value)),
	Value::Array(items) => items.iter().any(requires_strategic),
	_ => false,
    }
}

/*
 * Serializes both sides and diffs them under `schema`.
 */
pub fn merge_patch<O, N>(old: &O, new: &N, schema: &PatchSchema) -> Result<Value, Error>
where
    O: Serialize,
    N: Serialize,
{
    let old = serde_json::to_value(old).map_err(|source| Error::Serialization { side: "old", source })?;
    let new = serde_json::to_value(new).map_err(|source| Error::Serialization { side: "new", source })?;

    Ok(create_two_way_merge_patch(&old, &new, schema)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(original: &Value, modified: &Value) -> Value {
	let schema = PatchSchema::metadata_only();
	let patch = create_two_way_merge_patch(original, modified, &schema).unwrap();
	assert_eq!(&apply_patch(original, &patch, &schema).unwrap(), modified);
	patch
    }

    #[test]
    fn adds_annotation_and_nothing_else() {
	let original = json!({
	    "metadata": { "name": "dr1", "namespace": "ns1", "annotations": {} },
	    "spec": { "host": "foo" },
	});
	let modified = json!({
	    "metadata": { "name": "dr1", "namespace": "ns1", "annotations": { "marker-key": "sentinel-value" } },
	    "spec": { "host": "foo" },
	});

	let patch = roundtrip(&original, &modified);
	assert_eq!(patch, json!({ "metadata": { "annotations": { "marker-key": "sentinel-value" } } }));
	assert!(!requires_strategic(&patch));
    }

    #[test]
    fn identical_documents_give_empty_patch() {
	let doc = json!({ "metadata": { "name": "dr1" }, "spec": { "host": "foo", "subsets": [{ "name": "v1" }] } });

	assert_eq!(roundtrip(&doc, &doc), json!({}));
    }

    #[test]
    fn output_is_sorted_and_stable() {
	let original = json!({ "metadata": { "name": "dr1", "labels": { "b": "1" } } });
	let modified = json!({ "metadata": { "name": "dr1", "labels": { "b": "2", "a": "1" }, "annotations": { "z": "y" } } });
	let schema = PatchSchema::metadata_only();

	let first = serde_json::to_vec(&create_two_way_merge_patch(&original, &modified, &schema).unwrap()).unwrap();
	let second = serde_json::to_vec(&create_two_way_merge_patch(&original, &modified, &schema).unwrap()).unwrap();
	assert_eq!(first, second);
	assert_eq!(String::from_utf8(first).unwrap(), r#"{"metadata":{"annotations":{"z":"y"},"labels":{"a":"1","b":"2"}}}"#);
    }

    #[test]
    fn removed_fields_become_null() {
	let original = json!({ "metadata": { "name": "dr1", "annotations": { "a": "1", "b": "2" } } });
	let modified = json!({ "metadata": { "name": "dr1", "annotations": { "a": "1" } } });

	let patch = roundtrip(&original, &modified);
	assert_eq!(patch, json!({ "metadata": { "annotations": { "b": null } } }));
    }

    #[test]
    fn unknown_lists_are_replaced() {
	let original = json!({ "spec": { "host": "foo", "subsets": [{ "name": "v1" }, { "name": "v2" }] } });
	let modified = json!({ "spec": { "host": "foo", "subsets": [{ "name": "v2" }] } });

	let patch = roundtrip(&original, &modified);
	assert_eq!(patch, json!({ "spec": { "subsets": [{ "name": "v2" }] } }));
    }

    #[test]
    fn finalizers_merge_as_a_set() {
	let original = json!({ "metadata": { "finalizers": ["a", "b"] } });
	let modified = json!({ "metadata": { "finalizers": ["b", "c"] } });

	let patch = roundtrip(&original, &modified);
	assert_eq!(patch, json!({
	    "metadata": {
		"finalizers": ["c"],
		"$deleteFromPrimitiveList/finalizers": ["a"],
		"$setElementOrder/finalizers": ["b", "c"],
	    }
	}));
	assert!(requires_strategic(&patch));
    }

    #[test]
    fn primitive_list_duplicates_collapse() {
	let original = json!({ "metadata": { "finalizers": ["a"] } });
	let modified = json!({ "metadata": { "finalizers": ["a", "a"] } });
	let schema = PatchSchema::metadata_only();

	let patch = create_two_way_merge_patch(&original, &modified, &schema).unwrap();
	assert_eq!(patch, json!({ "metadata": { "$setElementOrder/finalizers": ["a", "a"] } }));
	assert_eq!(apply_patch(&original, &patch, &schema).unwrap(), original);
    }

    #[test]
    fn owner_references_merge_by_uid() {
	let original = json!({ "metadata": { "ownerReferences": [
	    { "uid": "1", "name": "a", "controller": false },
	    { "uid": "2", "name": "b" },
	] } });
	let modified = json!({ "metadata": { "ownerReferences": [
	    { "uid": "2", "name": "b" },
	    { "uid": "1", "name": "a", "controller": true },
	    { "uid": "3", "name": "c" },
	] } });

	let patch = roundtrip(&original, &modified);
	assert_eq!(patch, json!({
	    "metadata": {
		"ownerReferences": [
		    { "uid": "1", "controller": true },
		    { "uid": "3", "name": "c" },
		],
		"$setElementOrder/ownerReferences": [{ "uid": "2" }, { "uid": "1" }, { "uid": "3" }],
	    }
	}));
    }

    #[test]
    fn owner_reference_removal_uses_delete_directive() {
	let original = json!({ "metadata": { "ownerReferences": [{ "uid": "1" }, { "uid": "2" }] } });
	let modified = json!({ "metadata": { "ownerReferences": [{ "uid": "2" }] } });

	let patch = roundtrip(&original, &modified);
	assert_eq!(patch["metadata"]["ownerReferences"], json!([{ "uid": "1", "$patch": "delete" }]));
    }

    #[test]
    fn schema_mismatch_is_reported() {
	let original = json!({ "metadata": { "annotations": { "a": "1" } } });
	let modified = json!({ "metadata": { "annotations": ["a"] } });

	let err = create_two_way_merge_patch(&original, &modified, &PatchSchema::metadata_only()).unwrap_err();
	assert_eq!(err, PatchError::TypeMismatch {
	    path: "metadata.annotations".to_string(),
	    expected: "object",
	    found: "list",
	});
    }

    #[test]
    fn keyed_list_needs_merge_key() {
	let original = json!({ "metadata": { "ownerReferences": [{ "uid": "1" }] } });
	let modified = json!({ "metadata": { "ownerReferences": [{ "name": "orphan" }] } });

	let err = create_two_way_merge_patch(&original, &modified, &PatchSchema::metadata_only()).unwrap_err();
	assert_eq!(err, PatchError::MissingMergeKey {
	    path: "metadata.ownerReferences".to_string(),
	    key: "uid".to_string(),
	});
    }

    #[test]
    fn roots_must_be_objects() {
	let err = create_two_way_merge_patch(&json!([]), &json!({}), &PatchSchema::Any).unwrap_err();

	assert!(matches!(err, PatchError::TypeMismatch { found: "list", .. }));
    }

    #[test]
    fn apply_rejects_unknown_directives() {
	let err = apply_patch(&json!({}), &json!({ "$retainKeys": ["a"] }), &PatchSchema::Any).unwrap_err();

	assert!(matches!(err, PatchError::InvalidPatch { .. }));
    }

    #[test]
    fn merge_patch_reports_unserializable_side() {
	use std::collections::HashMap;

	let mut broken: HashMap<(u8, u8), u8> = HashMap::new();
	broken.insert((1, 2), 3);

	let err = merge_patch(&json!({}), &broken, &PatchSchema::Any).unwrap_err();
	assert!(matches!(err, Error::Serialization { side: "new", .. }));
    }
}
