//! Tool-call parameter resolution.
//!
//! A tool call's parameters arrive in one of two accepted shapes: a JSON
//! object, or free text that maps onto the capability's sole required
//! parameter. Anything else is rejected with a message the model can act
//! on.

use crate::orchestrator::Capability;

/// Resolve the raw parameter text of a parsed tool call into a JSON object.
pub fn resolve_parameters(
    capability: &Capability,
    raw: &str,
) -> Result<serde_json::Value, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(serde_json::json!({}));
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value @ serde_json::Value::Object(_)) => Ok(value),
        Ok(scalar) => map_free_text(capability, trimmed, Some(scalar)),
        Err(_) => map_free_text(capability, trimmed, None),
    }
}

/// Free text is only unambiguous when exactly one parameter is required.
fn map_free_text(
    capability: &Capability,
    raw: &str,
    parsed: Option<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    let Some(param) = capability.sole_required_parameter() else {
        return Err(format!(
            "parameters must be a JSON object; expected fields: {}",
            capability.expected_fields()
        ));
    };

    // A scalar that already matches the declared type is used as-is;
    // everything else is passed through as the raw string.
    let value = match parsed {
        Some(value) if param.param_type.matches(&value) => value,
        _ => serde_json::Value::String(raw.to_string()),
    };

    let mut object = serde_json::Map::new();
    object.insert(param.name.clone(), value);
    Ok(serde_json::Value::Object(object))
}
