//! Sensitive-key removal over JSON payloads and shared object graphs.
//!
//! Payloads are scrubbed by key name: any object entry whose key is in the
//! sensitive set is dropped at every depth, arrays included. Shared graphs
//! built from [`Node`] may contain reference cycles; walking one tracks the
//! ancestor chain and skips any edge that points back into it, so the output
//! is always a finite tree.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys removed from every payload unless listed in `saveFields`.
pub const DEFAULT_SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "access_token",
    "refresh_token",
    "api_key",
    "apikey",
    "authorization",
    "cookie",
    "set-cookie",
    "ssn",
    "card_number",
    "cvv",
];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaskOptions {
    /// Extra keys to remove on top of the defaults.
    pub remove_fields: Vec<String>,
    /// Default keys to keep.
    pub save_fields: Vec<String>,
}

/// Removes sensitive keys from payloads. Key comparison ignores ASCII case.
#[derive(Clone, Debug, Default)]
pub struct Masker {
    keys: HashSet<String>,
}

impl Masker {
    pub fn new(options: &MaskOptions) -> Self {
        let saved: HashSet<String> = options
            .save_fields
            .iter()
            .map(|k| k.to_ascii_lowercase())
            .collect();
        let keys = DEFAULT_SENSITIVE_KEYS
            .iter()
            .map(|k| (*k).to_owned())
            .chain(options.remove_fields.iter().map(|k| k.to_ascii_lowercase()))
            .filter(|k| !saved.contains(k))
            .collect();
        Self { keys }
    }

    /// A masker that removes exactly `keys` and nothing else.
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|k| k.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Returns a copy of this masker that also removes `extra`.
    pub fn extended<I, S>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keys = self.keys.clone();
        keys.extend(extra.into_iter().map(|k| k.as_ref().to_ascii_lowercase()));
        Self { keys }
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        self.keys.contains(&key.to_ascii_lowercase())
    }

    pub fn mask(&self, value: &Value) -> Value {
        scrub_value(value, &|k| self.is_sensitive(k))
    }

    pub fn mask_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        scrub_map(map, &|k| self.is_sensitive(k))
    }

    /// Masks a shared graph, dropping sensitive keys and back-references.
    pub fn mask_node(&self, node: &Node) -> Value {
        let mut ancestors = Vec::new();
        scrub_node(node, &|k| self.is_sensitive(k), &mut ancestors)
    }
}

/// Removes every entry whose key is exactly one of `keys`, at any depth.
pub fn remove_sensitive_keys(value: &Value, keys: &[&str]) -> Value {
    scrub_value(value, &|k| keys.contains(&k))
}

/// Converts a shared graph into a finite tree, dropping back-references.
pub fn break_circular_references(node: &Node) -> Value {
    let mut ancestors = Vec::new();
    scrub_node(node, &|_| false, &mut ancestors)
}

fn scrub_value(value: &Value, sensitive: &dyn Fn(&str) -> bool) -> Value {
    match value {
        Value::Object(map) => Value::Object(scrub_map(map, sensitive)),
        Value::Array(items) => Value::Array(items.iter().map(|v| scrub_value(v, sensitive)).collect()),
        other => other.clone(),
    }
}

fn scrub_map(map: &Map<String, Value>, sensitive: &dyn Fn(&str) -> bool) -> Map<String, Value> {
    map.iter()
        .filter(|(k, _)| !sensitive(k))
        .map(|(k, v)| (k.clone(), scrub_value(v, sensitive)))
        .collect()
}

type NodeId = *const ();

fn scrub_node(node: &Node, sensitive: &dyn Fn(&str) -> bool, ancestors: &mut Vec<NodeId>) -> Value {
    match node {
        Node::Leaf(value) => scrub_value(value, sensitive),
        Node::Array(items) => {
            ancestors.push(Arc::as_ptr(items) as NodeId);
            let mut out = Vec::new();
            for child in items.read().iter() {
                if child.points_into(ancestors) {
                    continue;
                }
                out.push(scrub_node(child, sensitive, ancestors));
            }
            ancestors.pop();
            Value::Array(out)
        }
        Node::Object(entries) => {
            ancestors.push(Arc::as_ptr(entries) as NodeId);
            let mut out = Map::new();
            for (key, child) in entries.read().iter() {
                // Key check first: a sensitive key is dropped even when its
                // value would also be a back-reference.
                if sensitive(key) || child.points_into(ancestors) {
                    continue;
                }
                out.insert(key.clone(), scrub_node(child, sensitive, ancestors));
            }
            ancestors.pop();
            Value::Object(out)
        }
    }
}

/// A JSON-like value whose containers are shared and may form cycles.
///
/// Cloning a container node clones the handle, not the contents, so a node
/// can be inserted into itself or into its own descendants.
#[derive(Clone)]
pub enum Node {
    Leaf(Value),
    Array(Arc<RwLock<Vec<Node>>>),
    Object(Arc<RwLock<Vec<(String, Node)>>>),
}

impl Node {
    pub fn object() -> Self {
        Self::Object(Arc::new(RwLock::new(Vec::new())))
    }

    pub fn array() -> Self {
        Self::Array(Arc::new(RwLock::new(Vec::new())))
    }

    pub fn leaf(value: impl Into<Value>) -> Self {
        Self::Leaf(value.into())
    }

    /// Sets `key` on an object node, replacing any previous entry.
    /// No-op on arrays and leaves.
    pub fn insert(&self, key: impl Into<String>, child: Node) {
        if let Self::Object(entries) = self {
            let key = key.into();
            let mut entries = entries.write();
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = child,
                None => entries.push((key, child)),
            }
        }
    }

    /// Appends to an array node. No-op on objects and leaves.
    pub fn push(&self, child: Node) {
        if let Self::Array(items) = self {
            items.write().push(child);
        }
    }

    fn id(&self) -> Option<NodeId> {
        match self {
            Self::Leaf(_) => None,
            Self::Array(items) => Some(Arc::as_ptr(items) as NodeId),
            Self::Object(entries) => Some(Arc::as_ptr(entries) as NodeId),
        }
    }

    fn points_into(&self, ancestors: &[NodeId]) -> bool {
        self.id().is_some_and(|id| ancestors.contains(&id))
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => {
                Self::Array(Arc::new(RwLock::new(items.into_iter().map(Node::from).collect())))
            }
            Value::Object(map) => Self::Object(Arc::new(RwLock::new(
                map.into_iter().map(|(k, v)| (k, Node::from(v))).collect(),
            ))),
            leaf => Self::Leaf(leaf),
        }
    }
}

// Cycles make a derived Debug recurse forever.
impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf(value) => write!(f, "Leaf({value})"),
            Self::Array(items) => write!(f, "Array({:p})", Arc::as_ptr(items)),
            Self::Object(entries) => write!(f, "Object({:p})", Arc::as_ptr(entries)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const BC: &[&str] = &["b", "c"];

    #[test]
    fn primitives_pass_through() {
        assert_eq!(remove_sensitive_keys(&json!(5), BC), json!(5));
        assert_eq!(remove_sensitive_keys(&json!("foo"), BC), json!("foo"));
        assert_eq!(remove_sensitive_keys(&Value::Null, BC), Value::Null);
        assert_eq!(remove_sensitive_keys(&json!([1, 2]), BC), json!([1, 2]));
    }

    #[test]
    fn single_layer_keeps_nulls() {
        let input = json!({"a": 1, "b": "two", "c": null, "d": null});
        assert_eq!(remove_sensitive_keys(&input, BC), json!({"a": 1, "d": null}));
    }

    #[test]
    fn nested_objects_and_arrays() {
        let input = json!({
            "a": 1,
            "b": "two",
            "c": null,
            "d": [
                {"b": 3, "e": "four", "g": [{"b": 7, "h": "eight"}]},
                {"c": "five", "f": 6}
            ]
        });
        assert_eq!(
            remove_sensitive_keys(&input, BC),
            json!({"a": 1, "d": [{"e": "four", "g": [{"h": "eight"}]}, {"f": 6}]})
        );
    }

    #[test]
    fn top_level_array_of_objects() {
        let input = json!([{"a": 1, "b": "two", "d": {"b": 3, "e": "four"}}]);
        assert_eq!(remove_sensitive_keys(&input, BC), json!([{"a": 1, "d": {"e": "four"}}]));
    }

    fn abc() -> Node {
        let obj = Node::object();
        obj.insert("a", Node::leaf(1));
        obj.insert("b", Node::leaf("two"));
        obj.insert("c", Node::leaf(Value::Null));
        obj
    }

    #[test]
    fn direct_self_reference_is_dropped() {
        let obj = abc();
        obj.insert("d", obj.clone());

        let masker = Masker::with_keys(BC);
        assert_eq!(masker.mask_node(&obj), json!({"a": 1}));
        assert_eq!(
            break_circular_references(&obj),
            json!({"a": 1, "b": "two", "c": null})
        );
    }

    #[test]
    fn nested_back_reference_is_dropped() {
        let obj = abc();
        let inner = Node::object();
        inner.insert("c", Node::leaf(3));
        inner.insert("e", obj.clone());
        inner.insert("f", Node::leaf("four"));
        obj.insert("d", inner);

        let masker = Masker::with_keys(BC);
        assert_eq!(masker.mask_node(&obj), json!({"a": 1, "d": {"f": "four"}}));
        assert_eq!(
            break_circular_references(&obj),
            json!({"a": 1, "b": "two", "c": null, "d": {"c": 3, "f": "four"}})
        );
    }

    #[test]
    fn back_reference_inside_array() {
        let obj = abc();
        let list = Node::array();
        list.push(obj.clone());
        obj.insert("d", list);

        assert_eq!(
            break_circular_references(&obj),
            json!({"a": 1, "b": "two", "c": null, "d": []})
        );
    }

    #[test]
    fn cycle_under_top_level_array() {
        let obj = abc();
        let inner = Node::object();
        inner.insert("e", obj.clone());
        inner.insert("f", Node::leaf("four"));
        obj.insert("d", inner);
        let root = Node::array();
        root.push(obj);

        let masker = Masker::with_keys(BC);
        assert_eq!(masker.mask_node(&root), json!([{"a": 1, "d": {"f": "four"}}]));
    }

    #[test]
    fn array_containing_itself_terminates() {
        let list = Node::array();
        list.push(Node::leaf(1));
        list.push(list.clone());
        assert_eq!(break_circular_references(&list), json!([1]));
    }

    #[test]
    fn shared_sibling_is_not_a_cycle() {
        let shared = Node::from(json!({"x": 1}));
        let root = Node::object();
        root.insert("left", shared.clone());
        root.insert("right", shared);
        assert_eq!(
            break_circular_references(&root),
            json!({"left": {"x": 1}, "right": {"x": 1}})
        );
    }

    #[test]
    fn default_keys_and_overrides() {
        let masker = Masker::new(&MaskOptions {
            remove_fields: vec!["email".into()],
            save_fields: vec!["token".into()],
        });
        let input = json!({"Password": "x", "email": "a@b.c", "token": "t", "name": "Bob"});
        assert_eq!(masker.mask(&input), json!({"token": "t", "name": "Bob"}));
    }

    #[test]
    fn extended_masker_adds_keys() {
        let masker = Masker::with_keys(["password"]).extended(["pin"]);
        assert!(masker.is_sensitive("PIN"));
        assert!(masker.is_sensitive("password"));
        assert!(!masker.is_sensitive("name"));
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,6}".prop_map(Value::from),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-e]{1,3}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn has_key(value: &Value, key: &str) -> bool {
        match value {
            Value::Object(map) => map.iter().any(|(k, v)| k == key || has_key(v, key)),
            Value::Array(items) => items.iter().any(|v| has_key(v, key)),
            _ => false,
        }
    }

    proptest! {
        #[test]
        fn masking_is_idempotent(value in arb_json()) {
            let masker = Masker::with_keys(["a", "bc"]);
            let once = masker.mask(&value);
            prop_assert_eq!(masker.mask(&once), once);
        }

        #[test]
        fn masked_output_has_no_sensitive_key(value in arb_json()) {
            let masker = Masker::with_keys(["a"]);
            prop_assert!(!has_key(&masker.mask(&value), "a"));
        }
    }
}
