use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Evidence attached to every structural value: where it was seen, what it
/// was called, and the flags that decide whether the variable is required
/// from the external context.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Meta {
    pub label: Option<String>,
    pub linenos: Vec<u32>,
    pub constant: bool,
    pub may_be_defined: bool,
    pub used_with_default: bool,
    pub checked_as_defined: bool,
    pub checked_as_undefined: bool,
    pub value: Option<Value>,
}

impl Meta {
    pub fn required(&self) -> bool {
        !(self.may_be_defined
            || self.used_with_default
            || self.checked_as_defined
            || self.checked_as_undefined)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Kind {
    Unknown,
    Scalar,
    List(Box<Structural>),
    /// `None` means the arity is not known yet (an unconstrained tuple).
    Tuple(Option<Vec<Structural>>),
    Dictionary(BTreeMap<String, Structural>),
}

/// A structural type: one of the five kinds plus its metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Structural {
    pub meta: Meta,
    pub kind: Kind,
}

impl Structural {
    pub fn unknown() -> Structural {
        Structural {
            meta: Meta::default(),
            kind: Kind::Unknown,
        }
    }

    pub fn scalar() -> Structural {
        Structural {
            meta: Meta::default(),
            kind: Kind::Scalar,
        }
    }

    /// A scalar fixed by a literal. The literal narrows the schema
    /// projection and participates in constant-conflict detection.
    pub fn constant_scalar(value: Value) -> Structural {
        Structural {
            meta: Meta {
                constant: true,
                value: Some(value),
                ..Meta::default()
            },
            kind: Kind::Scalar,
        }
    }

    pub fn list(element: Structural) -> Structural {
        Structural {
            meta: Meta::default(),
            kind: Kind::List(Box::new(element)),
        }
    }

    pub fn tuple(items: Vec<Structural>) -> Structural {
        Structural {
            meta: Meta::default(),
            kind: Kind::Tuple(Some(items)),
        }
    }

    pub fn unsized_tuple() -> Structural {
        Structural {
            meta: Meta::default(),
            kind: Kind::Tuple(None),
        }
    }

    pub fn dictionary(fields: BTreeMap<String, Structural>) -> Structural {
        Structural {
            meta: Meta::default(),
            kind: Kind::Dictionary(fields),
        }
    }

    pub fn empty_dictionary() -> Structural {
        Structural::dictionary(BTreeMap::new())
    }

    /// A dictionary with a single known field.
    pub fn dictionary_of(name: impl Into<String>, value: Structural) -> Structural {
        let mut fields = BTreeMap::new();
        fields.insert(name.into(), value);
        Structural::dictionary(fields)
    }

    pub fn at(mut self, line: u32) -> Structural {
        self.meta.linenos = vec![line];
        self
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Structural {
        self.meta.label = Some(label.into());
        self
    }

    pub fn optional(mut self) -> Structural {
        self.meta.may_be_defined = true;
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            Kind::Unknown => "unknown",
            Kind::Scalar => "scalar",
            Kind::List(_) => "list",
            Kind::Tuple(_) => "tuple",
            Kind::Dictionary(_) => "dictionary",
        }
    }

    pub fn required(&self) -> bool {
        self.meta.required()
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self.kind, Kind::Unknown)
    }

    pub fn fields(&self) -> Option<&BTreeMap<String, Structural>> {
        match &self.kind {
            Kind::Dictionary(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn into_fields(self) -> Option<BTreeMap<String, Structural>> {
        match self.kind {
            Kind::Dictionary(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn element(&self) -> Option<&Structural> {
        match &self.kind {
            Kind::List(element) => Some(element),
            _ => None,
        }
    }

    fn linenos_text(&self) -> String {
        self.meta
            .linenos
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Structural equality for assertions and schema decisions. Line numbers and
/// labels are evidence, not shape, and are ignored; `required`, `constant`
/// and the pinned literal are part of the shape.
impl PartialEq for Structural {
    fn eq(&self, other: &Structural) -> bool {
        if self.required() != other.required()
            || self.meta.constant != other.meta.constant
            || self.meta.value != other.meta.value
        {
            return false;
        }
        match (&self.kind, &other.kind) {
            (Kind::Unknown, Kind::Unknown) => true,
            (Kind::Scalar, Kind::Scalar) => true,
            (Kind::List(a), Kind::List(b)) => a == b,
            (Kind::Tuple(a), Kind::Tuple(b)) => a == b,
            (Kind::Dictionary(a), Kind::Dictionary(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Structural {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Unknown => write!(f, "<unknown>"),
            Kind::Scalar => match (&self.meta.constant, &self.meta.value) {
                (true, Some(value)) => write!(f, "{value}"),
                _ => write!(f, "<scalar>"),
            },
            Kind::List(element) => write!(f, "[{element}]"),
            Kind::Tuple(None) => write!(f, "(...)"),
            Kind::Tuple(Some(items)) => {
                let text = items
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "({text})")
            }
            Kind::Dictionary(fields) => {
                let text = fields
                    .iter()
                    .map(|(name, value)| format!("{name}: {value}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{{{text}}}")
            }
        }
    }
}

/// Two uses of the same name demand incompatible shapes.
#[derive(Clone, Debug)]
pub struct MergeError {
    pub fst: Structural,
    pub snd: Structural,
}

impl MergeError {
    pub fn new(fst: &Structural, snd: &Structural) -> MergeError {
        MergeError {
            fst: fst.clone(),
            snd: snd.clone(),
        }
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |s: &Structural| match &s.meta.label {
            Some(label) => format!("variable \"{label}\""),
            None => "unnamed variable".to_string(),
        };
        write!(
            f,
            "{} (used as {} on lines {}) conflicts with {} (used as {} on lines {})",
            name(&self.fst),
            self.fst.kind_name(),
            self.fst.linenos_text(),
            name(&self.snd),
            self.snd.kind_name(),
            self.snd.linenos_text(),
        )
    }
}

impl std::error::Error for MergeError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeMode {
    /// Both sides must agree unconditionally (the same name used twice on
    /// every path).
    Strict,
    /// A conditional join: evidence present on only one side survives as
    /// optional.
    Weak,
}

#[derive(Clone, Copy, Debug)]
pub struct MergeOptions {
    pub mode: MergeMode,
    /// Lets a dictionary absorb a scalar use of the same name instead of
    /// treating the pair as a conflict.
    pub dict_extends_scalar: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            mode: MergeMode::Strict,
            dict_extends_scalar: false,
        }
    }
}

impl MergeOptions {
    pub fn weak() -> MergeOptions {
        MergeOptions {
            mode: MergeMode::Weak,
            ..MergeOptions::default()
        }
    }
}

/// Strict merge with default options. The workhorse for combining two pieces
/// of evidence about one value.
pub fn merge(fst: &Structural, snd: &Structural) -> Result<Structural, MergeError> {
    merge_with(fst, snd, &MergeOptions::default())
}

pub fn merge_with(
    fst: &Structural,
    snd: &Structural,
    opts: &MergeOptions,
) -> Result<Structural, MergeError> {
    let kind = match (&fst.kind, &snd.kind) {
        (Kind::Unknown, _) => snd.kind.clone(),
        (_, Kind::Unknown) => fst.kind.clone(),
        (Kind::Scalar, Kind::Scalar) => Kind::Scalar,
        (Kind::List(a), Kind::List(b)) => Kind::List(Box::new(merge_with(a, b, opts)?)),
        (Kind::Tuple(None), Kind::Tuple(None)) => Kind::Tuple(None),
        (Kind::Tuple(Some(items)), Kind::Tuple(None))
        | (Kind::Tuple(None), Kind::Tuple(Some(items))) => Kind::Tuple(Some(items.clone())),
        (Kind::Tuple(Some(xs)), Kind::Tuple(Some(ys))) => {
            if xs.len() != ys.len() {
                return Err(MergeError::new(fst, snd));
            }
            let items = xs
                .iter()
                .zip(ys.iter())
                .map(|(a, b)| merge_with(a, b, opts))
                .collect::<Result<Vec<_>, _>>()?;
            Kind::Tuple(Some(items))
        }
        // A tuple met by a list weakens into a homogeneous list.
        (Kind::Tuple(items), Kind::List(element))
        | (Kind::List(element), Kind::Tuple(items)) => {
            let mut folded = element.as_ref().clone();
            if let Some(items) = items {
                for item in items {
                    folded = merge_with(&folded, item, opts)?;
                }
            }
            Kind::List(Box::new(folded))
        }
        (Kind::Dictionary(a), Kind::Dictionary(b)) => {
            Kind::Dictionary(merge_fields(a, b, opts)?)
        }
        (Kind::Scalar, Kind::Dictionary(fields)) | (Kind::Dictionary(fields), Kind::Scalar)
            if opts.dict_extends_scalar =>
        {
            Kind::Dictionary(fields.clone())
        }
        _ => return Err(MergeError::new(fst, snd)),
    };

    let meta = match (&fst.kind, &snd.kind) {
        // The non-unknown side has the actual evidence; only line numbers
        // and the label are shared.
        (Kind::Unknown, _) => union_flagless(&snd.meta, &fst.meta, &snd.meta),
        (_, Kind::Unknown) => union_flagless(&fst.meta, &fst.meta, &snd.meta),
        (Kind::Scalar, Kind::Scalar) => merge_scalar_meta(fst, snd, opts)?,
        _ => union_meta(&fst.meta, &snd.meta),
    };

    Ok(Structural { meta, kind })
}

/// Pointwise merge of two name fragments (dictionary merge, rule for
/// absent keys included).
pub fn merge_fields(
    a: &BTreeMap<String, Structural>,
    b: &BTreeMap<String, Structural>,
    opts: &MergeOptions,
) -> Result<BTreeMap<String, Structural>, MergeError> {
    let mut out = BTreeMap::new();
    for (name, value) in a {
        match b.get(name) {
            Some(other) => {
                out.insert(name.clone(), merge_with(value, other, opts)?);
            }
            None => {
                out.insert(name.clone(), one_sided(value, opts));
            }
        }
    }
    for (name, value) in b {
        if !a.contains_key(name) {
            out.insert(name.clone(), one_sided(value, opts));
        }
    }
    Ok(out)
}

fn one_sided(value: &Structural, opts: &MergeOptions) -> Structural {
    let mut value = value.clone();
    if opts.mode == MergeMode::Weak {
        value.meta.may_be_defined = true;
    }
    value
}

fn union_meta(a: &Meta, b: &Meta) -> Meta {
    Meta {
        label: a.label.clone().or_else(|| b.label.clone()),
        linenos: union_linenos(&a.linenos, &b.linenos),
        constant: a.constant && b.constant,
        may_be_defined: a.may_be_defined || b.may_be_defined,
        // A single bare use means the fallback does not cover the variable.
        used_with_default: a.used_with_default && b.used_with_default,
        checked_as_defined: a.checked_as_defined || b.checked_as_defined,
        checked_as_undefined: a.checked_as_undefined || b.checked_as_undefined,
        value: a.value.clone().or_else(|| b.value.clone()),
    }
}

/// Metadata union where `carrier` is the side with real shape evidence.
/// Definedness observations are evidence regardless of which side saw them.
fn union_flagless(carrier: &Meta, fst: &Meta, snd: &Meta) -> Meta {
    Meta {
        label: fst.label.clone().or_else(|| snd.label.clone()),
        linenos: union_linenos(&fst.linenos, &snd.linenos),
        may_be_defined: fst.may_be_defined || snd.may_be_defined,
        checked_as_defined: fst.checked_as_defined || snd.checked_as_defined,
        checked_as_undefined: fst.checked_as_undefined || snd.checked_as_undefined,
        ..carrier.clone()
    }
}

fn merge_scalar_meta(
    fst: &Structural,
    snd: &Structural,
    opts: &MergeOptions,
) -> Result<Meta, MergeError> {
    let mut meta = union_meta(&fst.meta, &snd.meta);
    if fst.meta.constant && snd.meta.constant {
        match (&fst.meta.value, &snd.meta.value) {
            (Some(a), Some(b)) if a == b => {
                meta.constant = true;
                meta.value = Some(a.clone());
            }
            (Some(a), Some(b)) => {
                if opts.mode == MergeMode::Strict && json_type(a) != json_type(b) {
                    return Err(MergeError::new(fst, snd));
                }
                meta.constant = false;
                meta.value = None;
            }
            _ => {
                meta.constant = false;
                meta.value = None;
            }
        }
    } else {
        meta.constant = false;
        meta.value = None;
    }
    Ok(meta)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn union_linenos(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out: Vec<u32> = a.iter().chain(b.iter()).copied().collect();
    out.sort_unstable();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::{merge, merge_with, MergeMode, MergeOptions, Structural};
    use serde_json::json;

    fn samples() -> Vec<Structural> {
        vec![
            Structural::unknown(),
            Structural::scalar(),
            Structural::list(Structural::scalar()),
            Structural::tuple(vec![Structural::scalar(), Structural::unknown()]),
            Structural::dictionary_of("a", Structural::scalar()),
        ]
    }

    #[test]
    fn merge_is_idempotent() {
        for sample in samples() {
            let merged = merge(&sample, &sample).expect("self-merge must succeed");
            assert_eq!(merged, sample, "merge(x, x) changed {sample}");
        }
    }

    #[test]
    fn merge_is_commutative() {
        let values = samples();
        for a in &values {
            for b in &values {
                let ab = merge(a, b);
                let ba = merge(b, a);
                match (ab, ba) {
                    (Ok(x), Ok(y)) => assert_eq!(x, y),
                    (Err(_), Err(_)) => {}
                    (x, y) => panic!("asymmetric outcome for {a} / {b}: {x:?} vs {y:?}"),
                }
            }
        }
    }

    #[test]
    fn merge_is_associative_on_compatible_values() {
        let a = Structural::dictionary_of("x", Structural::scalar());
        let b = Structural::dictionary_of("y", Structural::list(Structural::unknown()));
        let c = Structural::dictionary_of("x", Structural::scalar().at(3));

        let left = merge(&merge(&a, &b).unwrap(), &c).unwrap();
        let right = merge(&a, &merge(&b, &c).unwrap()).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn unknown_is_identity() {
        for sample in samples() {
            let merged = merge(&Structural::unknown(), &sample).unwrap();
            assert_eq!(merged, sample);
        }
    }

    #[test]
    fn unknown_does_not_erase_optionality() {
        let optional = Structural::scalar().optional();
        let merged = merge(&Structural::unknown(), &optional).unwrap();
        assert!(!merged.required());
    }

    #[test]
    fn lists_merge_elementwise() {
        let a = Structural::list(Structural::dictionary_of("a", Structural::scalar()));
        let b = Structural::list(Structural::dictionary_of("b", Structural::scalar()));
        let merged = merge(&a, &b).unwrap();
        let element = merged.element().unwrap();
        let fields = element.fields().unwrap();
        assert!(fields.contains_key("a") && fields.contains_key("b"));
    }

    #[test]
    fn tuple_weakens_into_list() {
        let tuple = Structural::tuple(vec![Structural::scalar(), Structural::scalar()]);
        let list = Structural::list(Structural::unknown());
        let merged = merge(&tuple, &list).unwrap();
        assert_eq!(merged, Structural::list(Structural::scalar()));
    }

    #[test]
    fn tuple_arity_mismatch_fails() {
        let a = Structural::tuple(vec![Structural::scalar()]);
        let b = Structural::tuple(vec![Structural::scalar(), Structural::scalar()]);
        assert!(merge(&a, &b).is_err());
    }

    #[test]
    fn scalar_against_dictionary_fails() {
        let err = merge(
            &Structural::scalar().labeled("x").at(1),
            &Structural::dictionary_of("name", Structural::scalar())
                .labeled("x")
                .at(2),
        )
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("scalar"), "{text}");
        assert!(text.contains("dictionary"), "{text}");
        assert!(text.contains('1') && text.contains('2'), "{text}");
    }

    #[test]
    fn dictionary_can_extend_scalar_when_configured() {
        let opts = MergeOptions {
            dict_extends_scalar: true,
            ..MergeOptions::default()
        };
        let merged = merge_with(
            &Structural::scalar(),
            &Structural::dictionary_of("name", Structural::scalar()),
            &opts,
        )
        .unwrap();
        assert!(merged.fields().unwrap().contains_key("name"));
    }

    #[test]
    fn weak_merge_marks_one_sided_keys_optional() {
        let a = Structural::dictionary_of("x", Structural::scalar());
        let b = Structural::dictionary_of("y", Structural::scalar());
        let merged = merge_with(&a, &b, &MergeOptions::weak()).unwrap();
        let fields = merged.fields().unwrap();
        assert!(!fields["x"].required());
        assert!(!fields["y"].required());
    }

    #[test]
    fn strict_merge_preserves_one_sided_keys() {
        let a = Structural::dictionary_of("x", Structural::scalar());
        let b = Structural::dictionary_of("y", Structural::scalar());
        let merged = merge(&a, &b).unwrap();
        let fields = merged.fields().unwrap();
        assert!(fields["x"].required());
        assert!(fields["y"].required());
    }

    #[test]
    fn equal_constants_stay_constant() {
        let a = Structural::constant_scalar(json!("en"));
        let b = Structural::constant_scalar(json!("en"));
        let merged = merge(&a, &b).unwrap();
        assert!(merged.meta.constant);
        assert_eq!(merged.meta.value, Some(json!("en")));
    }

    #[test]
    fn diverging_constants_lose_constness() {
        let a = Structural::constant_scalar(json!(1));
        let b = Structural::constant_scalar(json!(2));
        let merged = merge(&a, &b).unwrap();
        assert!(!merged.meta.constant);
        assert_eq!(merged.meta.value, None);
    }

    #[test]
    fn strict_constant_type_conflict_fails_but_weak_does_not() {
        let a = Structural::constant_scalar(json!("one"));
        let b = Structural::constant_scalar(json!(1));
        assert!(merge(&a, &b).is_err());
        let merged = merge_with(&a, &b, &MergeOptions::weak()).unwrap();
        assert!(!merged.meta.constant);
    }

    #[test]
    fn linenos_union_sorted() {
        let a = Structural::scalar().at(4);
        let mut b = Structural::scalar();
        b.meta.linenos = vec![1, 4];
        let merged = merge(&a, &b).unwrap();
        assert_eq!(merged.meta.linenos, vec![1, 4]);
    }

    #[test]
    fn display_is_compact() {
        let shape = Structural::dictionary_of(
            "xs",
            Structural::list(Structural::dictionary_of("b", Structural::scalar())),
        );
        assert_eq!(shape.to_string(), "{xs: [{b: <scalar>}]}");
        assert_eq!(Structural::constant_scalar(json!(42)).to_string(), "42");
    }
}
