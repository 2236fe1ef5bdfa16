use anyhow::{anyhow, Context, Result};
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use schemars::schema_for;
use serde_json::Value as JsonValue;

/// Schema generated from [`crate::inventory::Inventory`], so validation
/// cannot drift from the structs that parse the file.
static INVENTORY_SCHEMA: Lazy<JsonValue> = Lazy::new(|| {
    let schema = schema_for!(crate::inventory::Inventory);
    serde_json::to_value(&schema).expect("schemars schema must serialize to JSON")
});

static INVENTORY_VALIDATOR: Lazy<JSONSchema> = Lazy::new(|| {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&INVENTORY_SCHEMA)
        .expect("failed to compile inventory JSON schema")
});

/// Validate inventory YAML text, reporting at most ten violations.
pub fn validate_inventory_yaml(yaml_text: &str) -> Result<()> {
    let yaml_value: serde_yaml::Value =
        serde_yaml::from_str(yaml_text).context("parse yaml into Value")?;
    let json_value: JsonValue =
        serde_json::to_value(&yaml_value).context("convert yaml value to json value")?;

    // The error iterator borrows `json_value`; collect before it goes away.
    let result = match INVENTORY_VALIDATOR.validate(&json_value) {
        Ok(()) => Ok(()),
        Err(errors) => {
            let mut msgs: Vec<String> = Vec::new();
            for (i, e) in errors.enumerate() {
                if i >= 10 {
                    msgs.push("... (more schema errors omitted)".to_string());
                    break;
                }
                let path = e.instance_path.to_string();
                let path = if path.is_empty() { "/".to_string() } else { path };
                msgs.push(format!("at {path}: {e}"));
            }
            Err(anyhow!(
                "inventory schema validation failed:\n{}",
                msgs.join("\n")
            ))
        }
    };
    result
}

/// The inventory schema, for `fleet schema`.
pub fn schema_json() -> &'static JsonValue {
    &INVENTORY_SCHEMA
}
