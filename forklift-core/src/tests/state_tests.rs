use serde_json::{Value, json};

use super::*;

#[test]
fn set_get_remove() {
    let state = StateMap::new();
    state.set("count", json!(3));
    assert_eq!(state.get("count"), Some(json!(3)));
    assert!(state.remove("count"));
    assert_eq!(state.get("count"), None);
    assert!(!state.remove("count"));
}

#[test]
fn null_write_removes() {
    let state = StateMap::new();
    state.set("k", json!("v"));
    state.set("k", Value::Null);
    assert_eq!(state.get("k"), None);
}

#[test]
fn flag_reads() {
    let state = StateMap::new();
    let key = cancel_key(42);
    assert_eq!(key, "cancel:42");
    assert!(!state.flag(&key));
    state.set(&key, json!(true));
    assert!(state.flag(&key));
    state.set(&key, json!("yes"));
    assert!(!state.flag(&key), "non-boolean values are not flags");
}

#[test]
fn compound_update_is_atomic_under_the_guard() {
    let state = StateMap::new();
    state.set("a", json!(1));
    {
        let mut guard = state.lock();
        let a = guard.get("a").and_then(Value::as_i64).unwrap_or(0);
        guard.set("a", json!(a + 1));
        guard.set("b", json!(a));
    }
    assert_eq!(state.get("a"), Some(json!(2)));
    assert_eq!(state.get("b"), Some(json!(1)));
}

#[test]
fn clones_share_the_map() {
    let state = StateMap::new();
    let alias = state.clone();
    alias.set("shared", json!(true));
    assert!(state.flag("shared"));
}

#[test]
fn snapshot_and_seed_round_trip() {
    let state = StateMap::new();
    state.set(CURRENT_STATE_KEY, json!({"phase": "scan"}));
    state.set("root", json!("/tmp"));

    let mirror = StateMap::new();
    mirror.seed(state.snapshot());
    assert_eq!(mirror.get("root"), Some(json!("/tmp")));
    assert_eq!(
        mirror.get(CURRENT_STATE_KEY),
        Some(json!({"phase": "scan"}))
    );
}
