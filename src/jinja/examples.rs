/// A catalog of small templates used by the integration suite and handy for
/// demos.
#[derive(Clone, Debug)]
pub struct ExampleTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub source: &'static str,
}

pub fn all_examples() -> Vec<ExampleTemplate> {
    [
        ("plain_name", "Print a top-level variable", "{{ greeting }}"),
        (
            "nested_access",
            "Attribute chain on a nested record",
            "{{ order.customer.email }}",
        ),
        (
            "loop_over_items",
            "Iterate a homogeneous collection",
            "{% for item in items %}{{ item.title }}: {{ item.price }}{% endfor %}",
        ),
        (
            "loop_with_meta",
            "Loop helpers stay out of the context",
            "{% for row in rows %}{{ loop.index }}. {{ row }}{% endfor %}",
        ),
        (
            "optional_block",
            "Variable guarded by a definedness check",
            "{% if subtitle is defined %}{{ subtitle }}{% endif %}",
        ),
        (
            "fallback_value",
            "Fallback supplied inside the template",
            "{{ page_size|default(20) }}",
        ),
        (
            "local_assignment",
            "Assigned names never reach the context",
            "{% set full_name = user.first ~ ' ' ~ user.last %}{{ full_name }}",
        ),
        (
            "tuple_unpacking",
            "Dictionary iteration with paired targets",
            "{% for key, value in settings|dictsort %}{{ key }}={{ value }}{% endfor %}",
        ),
        (
            "batched_rows",
            "Grid rendering over batched items",
            "{% for row in products|batch(3) %}{% for cell in row %}{{ cell.sku }}{% endfor %}{% endfor %}",
        ),
        (
            "macro_rendering",
            "Macro parameters typed by their uses",
            "{% macro badge(user) %}{{ user.initials }}{% endmacro %}{{ badge(author) }}",
        ),
        (
            "joined_tags",
            "Scalar aggregation over a list",
            "{{ tags|join(', ') }}",
        ),
        (
            "conditional_branches",
            "Both branches of a conditional print",
            "{% if mode == 'wide' %}{{ wide_banner }}{% else %}{{ narrow_banner }}{% endif %}",
        ),
    ]
    .into_iter()
    .map(|(name, description, source)| ExampleTemplate {
        name,
        description,
        source,
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::all_examples;

    #[test]
    fn example_names_are_unique() {
        let examples = all_examples();
        let mut names: Vec<&str> = examples.iter().map(|example| example.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), examples.len());
    }
}
