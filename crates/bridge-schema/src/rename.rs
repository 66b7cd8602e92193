use bridge_core::config::RenameRule;
use serde_json::Value;

/// Remove the value at a dotted path, pruning empty objects left behind.
pub fn remove_path(root: &mut Value, path: &str) -> Option<Value> {
    fn inner(node: &mut Value, segments: &[&str]) -> Option<Value> {
        let object = node.as_object_mut()?;
        match segments {
            [] => None,
            [leaf] => object.remove(*leaf),
            [head, rest @ ..] => {
                let child = object.get_mut(*head)?;
                let taken = inner(child, rest);
                if child.as_object().map(|o| o.is_empty()).unwrap_or(false) {
                    object.remove(*head);
                }
                taken
            }
        }
    }
    let segments: Vec<&str> = path.split('.').collect();
    inner(root, &segments)
}

/// Set a value at a dotted path, creating intermediate objects.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let mut node = root;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        let object = node.as_object_mut().expect("just ensured object");
        if i == segments.len() - 1 {
            object.insert(segment.to_string(), value);
            return;
        }
        node = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.split('.') {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

/// Apply renames in declaration order. Dotted targets nest, dotted sources
/// denest. Missing sources are skipped.
pub fn apply_renames(root: &mut Value, rules: &[RenameRule]) {
    for rule in rules {
        if let Some(value) = remove_path(root, &rule.from) {
            set_path(root, &rule.to, value);
        }
    }
}

/// Apply the reverse map: each rule's `to` moves back to `from`, in reverse
/// declaration order so chained renames unwind correctly.
pub fn apply_reverse_renames(root: &mut Value, rules: &[RenameRule]) {
    for rule in rules.iter().rev() {
        if let Some(value) = remove_path(root, &rule.to) {
            set_path(root, &rule.from, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(from: &str, to: &str) -> RenameRule {
        RenameRule { from: from.to_string(), to: to.to_string() }
    }

    #[test]
    fn test_flat_rename() {
        let mut doc = json!({"customer": {"id": "c1"}, "items": [1, 2]});
        apply_renames(&mut doc, &[rule("customer", "customer_info"), rule("items", "order_items")]);
        assert_eq!(doc, json!({"customer_info": {"id": "c1"}, "order_items": [1, 2]}));
    }

    #[test]
    fn test_dotted_target_nests() {
        let mut doc = json!({"customer_id": "c1"});
        apply_renames(&mut doc, &[rule("customer_id", "customer.id")]);
        assert_eq!(doc, json!({"customer": {"id": "c1"}}));
    }

    #[test]
    fn test_dotted_source_denests_and_prunes() {
        let mut doc = json!({"customer": {"id": "c1"}});
        apply_renames(&mut doc, &[rule("customer.id", "customer_id")]);
        assert_eq!(doc, json!({"customer_id": "c1"}));
    }

    #[test]
    fn test_missing_source_is_skipped() {
        let mut doc = json!({"a": 1});
        apply_renames(&mut doc, &[rule("missing", "b")]);
        assert_eq!(doc, json!({"a": 1}));
    }

    #[test]
    fn test_reverse_round_trip() {
        let rules = vec![
            rule("customer", "customer_info"),
            rule("items", "order_items"),
            rule("meta.origin", "origin"),
        ];
        let original = json!({
            "customer": {"id": "c1"},
            "items": [{"sku": "s", "qty": 2}],
            "meta": {"origin": "web"}
        });
        let mut doc = original.clone();
        apply_renames(&mut doc, &rules);
        assert_eq!(
            doc,
            json!({
                "customer_info": {"id": "c1"},
                "order_items": [{"sku": "s", "qty": 2}],
                "origin": "web"
            })
        );
        apply_reverse_renames(&mut doc, &rules);
        assert_eq!(doc, original);
    }

    #[test]
    fn test_chained_renames_unwind_in_reverse_order() {
        // a -> b, then b -> c: forward leaves only c; reverse restores a.
        let rules = vec![rule("a", "b"), rule("b", "c")];
        let mut doc = json!({"a": 7});
        apply_renames(&mut doc, &rules);
        assert_eq!(doc, json!({"c": 7}));
        apply_reverse_renames(&mut doc, &rules);
        assert_eq!(doc, json!({"a": 7}));
    }

    #[test]
    fn test_set_path_overwrites_scalar_intermediate() {
        let mut doc = json!({"a": 3});
        set_path(&mut doc, "a.b", json!(1));
        assert_eq!(doc, json!({"a": {"b": 1}}));
    }
}
