//! Submission payloads and the per-submission message context.
//!
//! A submission carries an arbitrary `msg` mapping describing who asked for
//! the evaluation (user, channel, command, platform). The guest and the
//! outbound-fetch headers see a filtered view of it; the KV facade derives
//! namespaced keys from it.

use serde::Deserialize;
use serde_json::{Map, Value, json};

/// Raw submission payload as received from either transport.
#[derive(Debug, Clone, Deserialize)]
pub struct Submission {
    /// Source text to evaluate. Validated by the pipeline: anything other
    /// than a non-empty string is a 400.
    #[serde(default)]
    pub code: Value,
    /// Optional caller context. Must be a mapping when present.
    #[serde(default)]
    pub msg: Option<Value>,
}

/// Bitfield constants for KV key scoping.
///
/// The short aliases mirror the guest-visible `permissions` object.
pub mod scope {
    pub const COMMAND: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    pub const CHANNEL: u64 = 1 << 3;
}

/// Build the guest-visible `permissions` constant.
pub fn permissions_object() -> Value {
    json!({
        "user": scope::USER,
        "command": scope::COMMAND,
        "channel": scope::CHANNEL,
        "u": scope::USER,
        "cmd": scope::COMMAND,
        "chan": scope::CHANNEL,
    })
}

/// Read a `user.id`-style identifier out of a loosely-shaped msg mapping.
///
/// Identifiers arrive as strings or numbers depending on the platform.
fn id_at<'a>(msg: &'a Value, object: &str) -> Option<String> {
    match msg.get(object)?.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Derive the scoped KV key for a submission context.
///
/// With no flag (or a non-numeric one) the key defaults to
/// `user:<user.id>:channel:<channel.id>`. Otherwise segments are assembled
/// in fixed order (user, command, channel) for each set bit; a set bit with
/// no matching id in `msg` is an error.
pub fn derive_scoped_key(msg: &Value, flag: Option<f64>) -> Result<String, String> {
    let flag = match flag {
        Some(f) if f.is_finite() && f >= 0.0 => f as u64,
        _ => {
            let user = id_at(msg, "user").unwrap_or_default();
            let channel = id_at(msg, "channel").unwrap_or_default();
            return Ok(format!("user:{user}:channel:{channel}"));
        }
    };

    let mut segments = Vec::new();
    for (bit, name) in [
        (scope::USER, "user"),
        (scope::COMMAND, "command"),
        (scope::CHANNEL, "channel"),
    ] {
        if flag & bit != 0 {
            let id = id_at(msg, name)
                .ok_or_else(|| format!("{name}ID is required for {name} scope"))?;
            segments.push(format!("{name}:{id}"));
        }
    }

    Ok(segments.join(":"))
}

/// Build the filtered, serialisable context exported to outbound call
/// headers and the guest.
///
/// Strips `channel.commands`, `channel.blocks`, and `command.description`,
/// then recurses into `parent`. Everything else passes through untouched.
pub fn potat_context(msg: &Value) -> Value {
    let Some(obj) = msg.as_object() else {
        return msg.clone();
    };

    let mut out = Map::with_capacity(obj.len());
    for (key, value) in obj {
        match key.as_str() {
            "channel" => {
                let mut channel = value.clone();
                if let Some(ch) = channel.as_object_mut() {
                    ch.remove("commands");
                    ch.remove("blocks");
                }
                out.insert(key.clone(), channel);
            }
            "command" => {
                let mut command = value.clone();
                if let Some(cmd) = command.as_object_mut() {
                    cmd.remove("description");
                }
                out.insert(key.clone(), command);
            }
            "parent" => {
                out.insert(key.clone(), potat_context(value));
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    Value::Object(out)
}

/// Flatten a context and its ancestors, innermost first.
pub fn context_chain(msg: &Value) -> Vec<Value> {
    let mut chain = Vec::new();
    let mut current = Some(potat_context(msg));
    while let Some(ctx) = current {
        current = ctx.get("parent").cloned();
        chain.push(ctx);
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_msg() -> Value {
        json!({
            "user": {"id": "42", "name": "joe"},
            "channel": {
                "id": "99",
                "commands": ["secret"],
                "blocks": ["blocked"],
                "name": "general"
            },
            "command": {"id": 7, "description": "internal notes"},
            "platform": "twitch",
            "id": "m1",
            "timestamp": 1700000000
        })
    }

    #[test]
    fn test_default_key_without_flag() {
        let key = derive_scoped_key(&sample_msg(), None).unwrap();
        assert_eq!(key, "user:42:channel:99");
    }

    #[test]
    fn test_default_key_with_nan_flag() {
        let key = derive_scoped_key(&sample_msg(), Some(f64::NAN)).unwrap();
        assert_eq!(key, "user:42:channel:99");
    }

    #[test]
    fn test_single_scope_keys() {
        let msg = sample_msg();
        assert_eq!(
            derive_scoped_key(&msg, Some(scope::USER as f64)).unwrap(),
            "user:42"
        );
        assert_eq!(
            derive_scoped_key(&msg, Some(scope::COMMAND as f64)).unwrap(),
            "command:7"
        );
        assert_eq!(
            derive_scoped_key(&msg, Some(scope::CHANNEL as f64)).unwrap(),
            "channel:99"
        );
    }

    #[test]
    fn test_combined_scope_key_fixed_order() {
        let msg = sample_msg();
        // channel | user, but user always comes first.
        let flag = (scope::CHANNEL | scope::USER) as f64;
        assert_eq!(derive_scoped_key(&msg, Some(flag)).unwrap(), "user:42:channel:99");

        let all = (scope::USER | scope::COMMAND | scope::CHANNEL) as f64;
        assert_eq!(
            derive_scoped_key(&msg, Some(all)).unwrap(),
            "user:42:command:7:channel:99"
        );
    }

    #[test]
    fn test_missing_id_for_set_bit() {
        let msg = json!({"channel": {"id": "1"}});
        let err = derive_scoped_key(&msg, Some(scope::USER as f64)).unwrap_err();
        assert_eq!(err, "userID is required for user scope");
    }

    #[test]
    fn test_numeric_ids_stringified() {
        let msg = json!({"user": {"id": 123}});
        assert_eq!(
            derive_scoped_key(&msg, Some(scope::USER as f64)).unwrap(),
            "user:123"
        );
    }

    #[test]
    fn test_context_strips_private_fields() {
        let ctx = potat_context(&sample_msg());
        assert!(ctx["channel"].get("commands").is_none());
        assert!(ctx["channel"].get("blocks").is_none());
        assert!(ctx["command"].get("description").is_none());
        // Untouched fields survive.
        assert_eq!(ctx["channel"]["name"], "general");
        assert_eq!(ctx["platform"], "twitch");
    }

    #[test]
    fn test_context_filters_parents_recursively() {
        let mut msg = sample_msg();
        msg["parent"] = sample_msg();

        let ctx = potat_context(&msg);
        assert!(ctx["parent"]["channel"].get("commands").is_none());
        assert!(ctx["parent"]["command"].get("description").is_none());
    }

    #[test]
    fn test_context_chain_innermost_first() {
        let mut msg = sample_msg();
        let mut parent = sample_msg();
        parent["id"] = json!("outer");
        msg["parent"] = parent;

        let chain = context_chain(&msg);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0]["id"], "m1");
        assert_eq!(chain[1]["id"], "outer");
    }

    #[test]
    fn test_permissions_object_bits() {
        let p = permissions_object();
        assert_eq!(p["user"], 4);
        assert_eq!(p["command"], 2);
        assert_eq!(p["channel"], 8);
        assert_eq!(p["u"], p["user"]);
    }
}
