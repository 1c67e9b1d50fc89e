use crate::jinja::types::{Kind, Structural};
use rand::Rng;
use serde_json::{Map, Number, Value};

/// Produces a sample context value satisfying an inferred shape. Useful for
/// previewing forms and for exercising emitted schemas.
pub fn generate_context(shape: &Structural, rng: &mut impl Rng, max_depth: usize) -> Value {
    match &shape.kind {
        Kind::Unknown => random_scalar(rng),
        Kind::Scalar => match (&shape.meta.constant, &shape.meta.value) {
            (true, Some(value)) => value.clone(),
            _ => random_scalar(rng),
        },
        Kind::List(element) => {
            if max_depth == 0 {
                return Value::Array(Vec::new());
            }
            let len = rng.gen_range(1..=3);
            let items = (0..len)
                .map(|_| generate_context(element, rng, max_depth.saturating_sub(1)))
                .collect();
            Value::Array(items)
        }
        Kind::Tuple(None) => Value::Array(Vec::new()),
        Kind::Tuple(Some(items)) => Value::Array(
            items
                .iter()
                .map(|item| generate_context(item, rng, max_depth.saturating_sub(1)))
                .collect(),
        ),
        Kind::Dictionary(fields) => {
            let mut map = Map::new();
            for (name, value) in fields {
                // optional fields appear in roughly half the samples
                if !value.required() && rng.gen_bool(0.5) {
                    continue;
                }
                map.insert(
                    name.clone(),
                    generate_context(value, rng, max_depth.saturating_sub(1)),
                );
            }
            Value::Object(map)
        }
    }
}

fn random_scalar(rng: &mut impl Rng) -> Value {
    match rng.gen_range(0..4) {
        0 => Value::Bool(rng.gen_bool(0.5)),
        1 => {
            let value: i64 = rng.gen_range(-100..=100);
            Value::Number(Number::from(value))
        }
        2 => Value::Null,
        _ => {
            let len = rng.gen_range(1..=8);
            let mut text = String::with_capacity(len);
            for _ in 0..len {
                let ch = (b'a' + rng.gen_range(0..26)) as char;
                text.push(ch);
            }
            Value::String(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::generate_context;
    use crate::jinja::types::Structural;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    #[test]
    fn constants_reproduce_their_literal() {
        let mut rng = StdRng::seed_from_u64(3);
        let shape = Structural::constant_scalar(json!("en"));
        assert_eq!(generate_context(&shape, &mut rng, 3), json!("en"));
    }

    #[test]
    fn lists_generate_nonempty_within_depth() {
        let mut rng = StdRng::seed_from_u64(11);
        let shape = Structural::list(Structural::scalar());
        for _ in 0..50 {
            let value = generate_context(&shape, &mut rng, 3);
            let items = value.as_array().expect("must be an array");
            assert!(!items.is_empty());
        }
    }

    #[test]
    fn required_fields_always_appear() {
        let mut rng = StdRng::seed_from_u64(17);
        let shape = Structural::dictionary(
            [
                ("name".to_string(), Structural::scalar()),
                ("nick".to_string(), Structural::scalar().optional()),
            ]
            .into_iter()
            .collect(),
        );
        let mut nick_seen = false;
        let mut nick_missing = false;
        for _ in 0..100 {
            let value = generate_context(&shape, &mut rng, 3);
            let object = value.as_object().expect("must be an object");
            assert!(object.contains_key("name"));
            if object.contains_key("nick") {
                nick_seen = true;
            } else {
                nick_missing = true;
            }
        }
        assert!(nick_seen && nick_missing);
    }

    #[test]
    fn tuples_keep_their_arity() {
        let mut rng = StdRng::seed_from_u64(23);
        let shape = Structural::tuple(vec![Structural::scalar(), Structural::scalar()]);
        let value = generate_context(&shape, &mut rng, 3);
        assert_eq!(value.as_array().map(Vec::len), Some(2));
    }
}
