//! Merging the contexts of parallel branches.
//!
//! When a composite dispatches into several children, each child works on
//! its own copy of the context. [`merge`] folds them back into one document.
//!
//! # Rules
//!
//! 1. **One acting branch wins outright.** If exactly one branch ran a
//!    handler, its context is taken verbatim (deletions included).
//! 2. **Otherwise, union of changes.** Each branch's delta against the
//!    original is computed as *add/replace* operations and applied onto the
//!    original in branch order. The later branch wins on a shared path.
//! 3. **Deletions do not propagate.** A key removed by one branch of several
//!    stays in the merged document. This keeps one branch from undoing data
//!    another branch never touched; handlers that need to clear a value
//!    should set it to `null` instead.
//!
//! Objects are diffed key by key. Arrays and scalars are compared as whole
//! values: a changed array replaces the original array as a unit.

use serde_json::{Map, Value};

/// One segment of a path into a JSON document.
pub type PathSegment = String;

/// An add-or-replace operation: put `value` at `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub path: Vec<PathSegment>,
    pub value: Value,
}

/// Compute the add/replace operations that turn `original` into `changed`.
///
/// Removed keys produce no operation.
pub fn diff(original: &Value, changed: &Value) -> Vec<Patch> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    diff_into(original, changed, &mut path, &mut out);
    out
}

fn diff_into(original: &Value, changed: &Value, path: &mut Vec<PathSegment>, out: &mut Vec<Patch>) {
    match (original, changed) {
        (Value::Object(before), Value::Object(after)) => {
            for (key, value) in after {
                path.push(key.clone());
                match before.get(key) {
                    Some(old) => diff_into(old, value, path, out),
                    None => out.push(Patch {
                        path: path.clone(),
                        value: value.clone(),
                    }),
                }
                path.pop();
            }
        }
        _ if original == changed => {}
        _ => out.push(Patch {
            path: path.clone(),
            value: changed.clone(),
        }),
    }
}

/// Apply `patches` onto `target`, creating intermediate objects as needed.
pub fn apply(target: &mut Value, patches: &[Patch]) {
    for patch in patches {
        set_path(target, &patch.path, patch.value.clone());
    }
}

fn set_path(target: &mut Value, path: &[PathSegment], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *target = value;
        return;
    };

    let mut cursor = target;
    for segment in parents {
        cursor = object_mut(cursor)
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    object_mut(cursor).insert(last.clone(), value);
}

/// Borrow `value` as an object, replacing it with an empty one if it is not.
fn object_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just made an object"),
    }
}

/// A branch's outcome as seen by the merger.
#[derive(Debug, Clone, Copy)]
pub struct Branch<'a> {
    pub ctx: &'a Value,
    /// True if a handler ran in this branch.
    pub handled: bool,
}

/// Fold branch contexts back onto `original`, in branch order.
pub fn merge(original: &Value, branches: &[Branch<'_>]) -> Value {
    let mut acting = branches.iter().filter(|b| b.handled);
    match (acting.next(), acting.next()) {
        (None, _) => original.clone(),
        (Some(only), None) => only.ctx.clone(),
        _ => {
            let mut merged = original.clone();
            for branch in branches.iter().filter(|b| b.handled) {
                apply(&mut merged, &diff(original, branch.ctx));
            }
            merged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn acting(ctx: &Value) -> Branch<'_> {
        Branch { ctx, handled: true }
    }

    #[test]
    fn test_diff_add_and_replace_only() {
        let before = json!({"a": 1, "b": {"c": 2, "d": 3}, "gone": true});
        let after = json!({"a": 1, "b": {"c": 5, "d": 3}, "new": [1, 2]});

        let patches = diff(&before, &after);
        assert_eq!(
            patches,
            vec![
                Patch {
                    path: vec!["b".into(), "c".into()],
                    value: json!(5)
                },
                Patch {
                    path: vec!["new".into()],
                    value: json!([1, 2])
                },
            ]
        );
    }

    #[test]
    fn test_diff_type_change_replaces() {
        let patches = diff(&json!({"a": {"b": 1}}), &json!({"a": 7}));
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].path, vec!["a".to_string()]);

        let patches = diff(&json!(1), &json!(2));
        assert!(patches[0].path.is_empty());
    }

    #[test]
    fn test_apply_creates_parents() {
        let mut target = json!({"x": 1});
        apply(
            &mut target,
            &[Patch {
                path: vec!["deep".into(), "er".into()],
                value: json!("v"),
            }],
        );
        assert_eq!(target, json!({"x": 1, "deep": {"er": "v"}}));
    }

    #[test]
    fn test_single_acting_branch_is_verbatim() {
        let original = json!({"keep": 1, "drop": 2});
        let changed = json!({"keep": 1});
        let idle = original.clone();

        let merged = merge(
            &original,
            &[acting(&changed), Branch { ctx: &idle, handled: false }],
        );
        assert_eq!(merged, json!({"keep": 1}));
    }

    #[test]
    fn test_no_acting_branch_keeps_original() {
        let original = json!({"a": 1});
        let merged = merge(&original, &[Branch { ctx: &json!({}), handled: false }]);
        assert_eq!(merged, original);
    }

    #[test]
    fn test_disjoint_changes_union() {
        let original = json!({"left": 0, "right": 0});
        let a = json!({"left": 1, "right": 0});
        let b = json!({"left": 0, "right": 2});

        let merged = merge(&original, &[acting(&a), acting(&b)]);
        assert_eq!(merged, json!({"left": 1, "right": 2}));
    }

    #[test]
    fn test_conflict_later_branch_wins() {
        let original = json!({"shared": "start"});
        let a = json!({"shared": "from-a"});
        let b = json!({"shared": "from-b"});

        assert_eq!(merge(&original, &[acting(&a), acting(&b)]), json!({"shared": "from-b"}));
        assert_eq!(merge(&original, &[acting(&b), acting(&a)]), json!({"shared": "from-a"}));
    }

    #[test]
    fn test_deletion_lost_when_several_branches_act() {
        let original = json!({"temp": true, "n": 0});
        let deleter = json!({"n": 0});
        let counter = json!({"temp": true, "n": 1});

        let merged = merge(&original, &[acting(&deleter), acting(&counter)]);
        assert_eq!(merged, json!({"temp": true, "n": 1}));
    }
}
