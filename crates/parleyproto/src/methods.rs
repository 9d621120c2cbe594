//! Method and event descriptors for discovery.
//!
//! `rpc.discover` returns the full catalog; `rpc.describe` returns one
//! entry. Schemas are JSON Schema documents generated by the daemon's
//! method registry.

use serde::{Deserialize, Serialize};

/// Wire description of one callable method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    pub description: String,
    pub required_scopes: Vec<String>,
    pub param_schema: serde_json::Value,
}

/// Wire description of one event a client can subscribe to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInfo {
    pub name: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn method_info_roundtrip() {
        let info = MethodInfo {
            name: "prompt.submit".to_string(),
            description: "Submit a prompt to an agent session".to_string(),
            required_scopes: vec!["prompt".to_string()],
            param_schema: serde_json::json!({
                "type": "object",
                "properties": { "session_id": { "type": "string" } },
                "required": ["session_id"],
            }),
        };
        let json = serde_json::to_string(&info).unwrap();
        let parsed: MethodInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, parsed);
    }
}
