use contextshape::jinja::{
    generate_context, infer, to_json_schema, to_json_schema_string, Config, Kind, Structural,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};

fn schema_of(source: &str) -> Value {
    let config = Config::default();
    let context = infer(source, &config).expect("inference should succeed");
    to_json_schema(&context, &config)
}

/// Structural acceptance: does `value` satisfy `shape`? Mirrors what the
/// emitted Draft-4 schema enforces.
fn fits(shape: &Structural, value: &Value) -> bool {
    match &shape.kind {
        Kind::Unknown => true,
        Kind::Scalar => !(value.is_array() || value.is_object()),
        Kind::List(element) => value
            .as_array()
            .is_some_and(|items| items.iter().all(|item| fits(element, item))),
        Kind::Tuple(None) => value.is_array(),
        Kind::Tuple(Some(items)) => value.as_array().is_some_and(|values| {
            values.len() == items.len()
                && items.iter().zip(values.iter()).all(|(s, v)| fits(s, v))
        }),
        Kind::Dictionary(fields) => value.as_object().is_some_and(|map| {
            fields.iter().all(|(name, field)| match map.get(name) {
                Some(v) => fits(field, v),
                None => !field.required(),
            })
        }),
    }
}

#[test]
fn top_level_schema_is_an_object_with_required_names() {
    let schema = schema_of("{{ title }}{{ body }}");
    assert_eq!(schema["type"], json!("object"));
    assert_eq!(schema["required"], json!(["body", "title"]));
    assert!(schema["properties"]["title"]["anyOf"].is_array());
}

#[test]
fn optional_variables_stay_out_of_the_required_list() {
    let schema = schema_of("{% if y is undefined %}{% set y = 'a' ~ a %}{% endif %}{{ b }}");
    let required = schema["required"].as_array().unwrap();
    assert!(required.contains(&json!("a")));
    assert!(required.contains(&json!("b")));
    assert!(!required.contains(&json!("y")));
    assert!(schema["properties"].get("y").is_some());
}

#[test]
fn lists_nest_their_element_schemas() {
    let schema = schema_of("{% for user in users %}{{ user.name }}{% endfor %}");
    let users = &schema["properties"]["users"];
    assert_eq!(users["type"], json!("array"));
    assert_eq!(users["items"]["type"], json!("object"));
    assert!(users["items"]["properties"]["name"].is_object());
}

#[test]
fn scalar_schemas_accept_every_scalar_value() {
    let schema = schema_of("{{ x }}");
    let any_of = schema["properties"]["x"]["anyOf"].as_array().unwrap();
    let covered: Vec<&str> = any_of
        .iter()
        .map(|entry| entry["type"].as_str().unwrap())
        .collect();
    for ty in ["string", "number", "boolean", "null"] {
        assert!(covered.contains(&ty), "missing scalar type {ty}");
    }
}

#[test]
fn compact_and_tree_emitters_agree() {
    let config = Config::default();
    let context = infer("{{ a.b }}{{ c|first }}", &config).unwrap();
    let compact = to_json_schema_string(&context, &config);
    let reparsed: Value = serde_json::from_str(&compact).unwrap();
    assert_eq!(reparsed, to_json_schema(&context, &config));
}

#[test]
fn generated_contexts_satisfy_the_inferred_shape() {
    let config = Config::default();
    let sources = [
        "{{ x }}",
        "{{ x.a.b }}",
        "{% for item in items %}{{ item.sku }}{{ item.qty }}{% endfor %}",
        "{% if note is defined %}{{ note }}{% endif %}{{ title }}",
        "{{ tags|join(', ') }}{{ totals|sum }}",
    ];
    let mut rng = StdRng::seed_from_u64(41);
    for source in sources {
        let context = infer(source, &config).unwrap();
        for _ in 0..50 {
            let value = generate_context(&context, &mut rng, 4);
            assert!(
                fits(&context, &value),
                "{value} does not satisfy the shape inferred from {source:?}"
            );
        }
    }
}

#[test]
fn generated_required_fields_line_up_with_the_schema() {
    let config = Config::default();
    let context =
        infer("{% if nick is defined %}{{ nick }}{% endif %}{{ name }}", &config).unwrap();
    let schema = to_json_schema(&context, &config);
    let required = schema["required"].as_array().unwrap();
    assert_eq!(required, &vec![json!("name")]);

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
        let value = generate_context(&context, &mut rng, 3);
        let object = value.as_object().unwrap();
        for name in required {
            assert!(object.contains_key(name.as_str().unwrap()));
        }
    }
}
