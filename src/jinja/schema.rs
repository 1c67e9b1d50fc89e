use crate::jinja::config::Config;
use crate::jinja::types::{Kind, Structural};
use serde_json::{json, Map, Value};

/// Draft-4 JSON Schema for an inferred context shape.
pub fn to_json_schema(shape: &Structural, config: &Config) -> Value {
    encode(shape, config)
}

/// The same schema as a compact serialized string.
pub fn to_json_schema_string(shape: &Structural, config: &Config) -> String {
    serde_json::to_string(&encode(shape, config)).unwrap_or_default()
}

fn encode(shape: &Structural, config: &Config) -> Value {
    let mut schema = match &shape.kind {
        Kind::Unknown => scalar_union(),
        Kind::Scalar => match (&shape.meta.constant, &shape.meta.value) {
            (true, Some(value)) => json!({ "type": json_type_name(value) }),
            _ => scalar_union(),
        },
        Kind::List(element) => json!({
            "type": "array",
            "items": encode(element, config),
        }),
        Kind::Tuple(None) => json!({ "type": "array" }),
        Kind::Tuple(Some(items)) => {
            let encoded: Vec<Value> = items.iter().map(|item| encode(item, config)).collect();
            if config.tuple_schema_per_slot {
                json!({ "type": "array", "items": encoded })
            } else {
                json!({ "type": "array", "items": { "anyOf": encoded } })
            }
        }
        Kind::Dictionary(fields) => {
            let mut properties = Map::new();
            let mut required = Vec::new();
            for (name, value) in fields {
                properties.insert(name.clone(), encode(value, config));
                if value.required() {
                    required.push(Value::String(name.clone()));
                }
            }
            let mut object = Map::new();
            object.insert("type".to_string(), json!("object"));
            object.insert("properties".to_string(), Value::Object(properties));
            if !required.is_empty() {
                object.insert("required".to_string(), Value::Array(required));
            }
            Value::Object(object)
        }
    };
    if let Some(label) = &shape.meta.label {
        schema["title"] = json!(label);
    }
    schema
}

fn scalar_union() -> Value {
    json!({
        "anyOf": [
            { "type": "string" },
            { "type": "number" },
            { "type": "boolean" },
            { "type": "null" },
        ]
    })
}

fn json_type_name(value: &Value) -> &'static str {
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
    use super::{to_json_schema, to_json_schema_string};
    use crate::jinja::config::Config;
    use crate::jinja::types::Structural;
    use serde_json::json;

    #[test]
    fn scalars_project_to_a_type_union() {
        let schema = to_json_schema(&Structural::scalar(), &Config::default());
        let any_of = schema["anyOf"].as_array().unwrap();
        assert_eq!(any_of.len(), 4);
    }

    #[test]
    fn constants_narrow_to_their_literal_type() {
        let schema = to_json_schema(&Structural::constant_scalar(json!(3)), &Config::default());
        assert_eq!(schema["type"], json!("number"));
    }

    #[test]
    fn dictionaries_list_required_fields() {
        let shape = Structural::dictionary(
            [
                ("a".to_string(), Structural::scalar()),
                ("b".to_string(), Structural::scalar().optional()),
            ]
            .into_iter()
            .collect(),
        );
        let schema = to_json_schema(&shape, &Config::default());
        assert_eq!(schema["required"], json!(["a"]));
        assert!(schema["properties"]["b"].is_object());
    }

    #[test]
    fn all_optional_dictionaries_omit_the_required_list() {
        let shape = Structural::dictionary_of("a", Structural::scalar().optional());
        let schema = to_json_schema(&shape, &Config::default());
        assert!(schema.get("required").is_none());
    }

    #[test]
    fn tuples_project_per_configuration() {
        let shape = Structural::tuple(vec![
            Structural::scalar(),
            Structural::list(Structural::scalar()),
        ]);
        let homogeneous = to_json_schema(&shape, &Config::default());
        assert!(homogeneous["items"]["anyOf"].is_array());

        let config = Config {
            tuple_schema_per_slot: true,
            ..Config::default()
        };
        let per_slot = to_json_schema(&shape, &config);
        assert_eq!(per_slot["items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn labels_become_titles() {
        let schema = to_json_schema(&Structural::scalar().labeled("user"), &Config::default());
        assert_eq!(schema["title"], json!("user"));
    }

    #[test]
    fn compact_form_serializes_the_same_schema() {
        let shape = Structural::list(Structural::scalar());
        let text = to_json_schema_string(&shape, &Config::default());
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, to_json_schema(&shape, &Config::default()));
    }
}
