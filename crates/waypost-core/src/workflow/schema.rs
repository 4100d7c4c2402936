//! Schema validation port for workflow input and output.
//!
//! `BasicSchemaValidator` understands the subset of JSON Schema workflow
//! authors use in practice: `type` (string or list), `required`,
//! `properties`, `items` and `enum`. Unknown keywords are ignored.

use serde_json::Value;

/// Validates a document against a schema.
pub trait SchemaValidator: Send + Sync {
    /// `Err` carries a human-readable reason naming the offending path.
    fn validate(&self, schema: &Value, value: &Value) -> Result<(), String>;
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSchemaValidator;

impl SchemaValidator for NoopSchemaValidator {
    fn validate(&self, _schema: &Value, _value: &Value) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicSchemaValidator;

impl SchemaValidator for BasicSchemaValidator {
    fn validate(&self, schema: &Value, value: &Value) -> Result<(), String> {
        check(schema, value, "$")
    }
}

fn check(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let Value::Object(schema) = schema else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(types) => types.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| has_type(value, t)) {
            return Err(format!(
                "{path}: expected {}, found {}",
                allowed.join(" or "),
                type_name(value)
            ));
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            return Err(format!("{path}: value not in enum"));
        }
    }

    if let Value::Object(object) = value {
        if let Some(Value::Array(required)) = schema.get("required") {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    return Err(format!("{path}: missing required property '{key}'"));
                }
            }
        }
        if let Some(Value::Object(properties)) = schema.get("properties") {
            for (key, property) in properties {
                if let Some(child) = object.get(key) {
                    check(property, child, &format!("{path}.{key}"))?;
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check(item_schema, item, &format!("{path}[{i}]"))?;
        }
    }

    Ok(())
}

fn has_type(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_schema() -> Value {
        json!({
            "type": "object",
            "required": ["orderId"],
            "properties": {
                "orderId": { "type": "string" },
                "lines": { "type": "array", "items": { "type": "object", "required": ["sku"] } }
            }
        })
    }

    #[test]
    fn accepts_conforming_document() {
        let doc = json!({ "orderId": "o-1", "lines": [ { "sku": "a" } ] });
        assert!(BasicSchemaValidator.validate(&order_schema(), &doc).is_ok());
    }

    #[test]
    fn reports_path_of_first_violation() {
        let missing = BasicSchemaValidator.validate(&order_schema(), &json!({}));
        assert_eq!(missing.unwrap_err(), "$: missing required property 'orderId'");

        let nested = BasicSchemaValidator.validate(
            &order_schema(),
            &json!({ "orderId": "o-1", "lines": [ {}, { "sku": 1 } ] }),
        );
        assert_eq!(nested.unwrap_err(), "$.lines[0]: missing required property 'sku'");

        let wrong_type = BasicSchemaValidator.validate(&order_schema(), &json!({ "orderId": 5 }));
        assert_eq!(wrong_type.unwrap_err(), "$.orderId: expected string, found number");
    }

    #[test]
    fn enum_and_type_lists() {
        let schema = json!({ "type": ["string", "null"], "enum": ["a", null] });
        assert!(BasicSchemaValidator.validate(&schema, &json!(null)).is_ok());
        assert!(BasicSchemaValidator.validate(&schema, &json!("b")).is_err());
        assert!(NoopSchemaValidator.validate(&schema, &json!(42)).is_ok());
    }
}
