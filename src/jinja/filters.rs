use crate::jinja::types::Structural;

/// What a filter requires of its piped-in operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputKind {
    Scalar,
    List,
    Dictionary,
    Any,
}

/// Constraint on the elements of a list-accepting filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementKind {
    Scalar,
    Any,
}

/// How the filter's result relates to its operand and to the role the whole
/// expression plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultKind {
    Scalar,
    List,
    Dictionary,
    /// The operand's own shape flows through (`sort`, `map`, ...).
    SameAsInput,
    /// One element of the operand list (`first`, `random`, ...).
    ElementOfInput,
    /// Rows of the operand list (`batch`, `slice`).
    NestedList,
    /// Key/value pairs of the operand dictionary (`dictsort`).
    PairList,
    /// The operand itself, made optional by a fallback (`default`).
    InputWithDefault,
    /// A field of the operand dictionary named by the first argument (`attr`).
    AttributeOfInput,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Scalar,
    Any,
}

/// Declarative filter signature: what goes in, what comes out, what the
/// positional arguments look like.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterSignature {
    pub input: InputKind,
    pub element: ElementKind,
    pub result: ResultKind,
    pub args: Vec<ArgKind>,
}

impl FilterSignature {
    pub fn new(input: InputKind, result: ResultKind) -> FilterSignature {
        FilterSignature {
            input,
            element: ElementKind::Any,
            result,
            args: Vec::new(),
        }
    }

    pub fn with_element(mut self, element: ElementKind) -> FilterSignature {
        self.element = element;
        self
    }

    pub fn with_args(mut self, args: &[ArgKind]) -> FilterSignature {
        self.args = args.to_vec();
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinFilter {
    Abs,
    Attr,
    Batch,
    Capitalize,
    Center,
    Default,
    Dictsort,
    Escape,
    FileSizeFormat,
    First,
    Float,
    ForceEscape,
    Format,
    GroupBy,
    Indent,
    Int,
    Join,
    Last,
    Length,
    List,
    Lower,
    Map,
    Max,
    Min,
    Pprint,
    Random,
    Reject,
    RejectAttr,
    Replace,
    Reverse,
    Round,
    Safe,
    Select,
    SelectAttr,
    Slice,
    Sort,
    Str,
    StripTags,
    Sum,
    Title,
    Trim,
    Truncate,
    Unique,
    Upper,
    UrlEncode,
    UrlIze,
    WordCount,
    WordWrap,
    XmlAttr,
}

impl BuiltinFilter {
    pub fn from_name(name: &str) -> Option<BuiltinFilter> {
        let filter = match name {
            "abs" => BuiltinFilter::Abs,
            "attr" => BuiltinFilter::Attr,
            "batch" => BuiltinFilter::Batch,
            "capitalize" => BuiltinFilter::Capitalize,
            "center" => BuiltinFilter::Center,
            "default" | "d" => BuiltinFilter::Default,
            "dictsort" => BuiltinFilter::Dictsort,
            "escape" | "e" => BuiltinFilter::Escape,
            "filesizeformat" => BuiltinFilter::FileSizeFormat,
            "first" => BuiltinFilter::First,
            "float" => BuiltinFilter::Float,
            "forceescape" => BuiltinFilter::ForceEscape,
            "format" => BuiltinFilter::Format,
            "groupby" => BuiltinFilter::GroupBy,
            "indent" => BuiltinFilter::Indent,
            "int" => BuiltinFilter::Int,
            "join" => BuiltinFilter::Join,
            "last" => BuiltinFilter::Last,
            "length" | "count" => BuiltinFilter::Length,
            "list" => BuiltinFilter::List,
            "lower" => BuiltinFilter::Lower,
            "map" => BuiltinFilter::Map,
            "max" => BuiltinFilter::Max,
            "min" => BuiltinFilter::Min,
            "pprint" => BuiltinFilter::Pprint,
            "random" => BuiltinFilter::Random,
            "reject" => BuiltinFilter::Reject,
            "rejectattr" => BuiltinFilter::RejectAttr,
            "replace" => BuiltinFilter::Replace,
            "reverse" => BuiltinFilter::Reverse,
            "round" => BuiltinFilter::Round,
            "safe" => BuiltinFilter::Safe,
            "select" => BuiltinFilter::Select,
            "selectattr" => BuiltinFilter::SelectAttr,
            "slice" => BuiltinFilter::Slice,
            "sort" => BuiltinFilter::Sort,
            "string" => BuiltinFilter::Str,
            "striptags" => BuiltinFilter::StripTags,
            "sum" => BuiltinFilter::Sum,
            "title" => BuiltinFilter::Title,
            "trim" => BuiltinFilter::Trim,
            "truncate" => BuiltinFilter::Truncate,
            "unique" => BuiltinFilter::Unique,
            "upper" => BuiltinFilter::Upper,
            "urlencode" => BuiltinFilter::UrlEncode,
            "urlize" => BuiltinFilter::UrlIze,
            "wordcount" => BuiltinFilter::WordCount,
            "wordwrap" => BuiltinFilter::WordWrap,
            "xmlattr" => BuiltinFilter::XmlAttr,
            _ => return None,
        };
        Some(filter)
    }

    pub fn signature(&self) -> FilterSignature {
        use ArgKind::{Any, Scalar};
        match self {
            // Scalar to scalar.
            BuiltinFilter::Abs
            | BuiltinFilter::Capitalize
            | BuiltinFilter::Escape
            | BuiltinFilter::FileSizeFormat
            | BuiltinFilter::Float
            | BuiltinFilter::ForceEscape
            | BuiltinFilter::Int
            | BuiltinFilter::Lower
            | BuiltinFilter::Safe
            | BuiltinFilter::StripTags
            | BuiltinFilter::Title
            | BuiltinFilter::Trim
            | BuiltinFilter::Upper
            | BuiltinFilter::UrlEncode
            | BuiltinFilter::UrlIze
            | BuiltinFilter::WordCount => {
                FilterSignature::new(InputKind::Scalar, ResultKind::Scalar)
            }
            BuiltinFilter::Center | BuiltinFilter::Indent | BuiltinFilter::Round => {
                FilterSignature::new(InputKind::Scalar, ResultKind::Scalar).with_args(&[Scalar])
            }
            BuiltinFilter::Format => {
                FilterSignature::new(InputKind::Scalar, ResultKind::Scalar)
                    .with_args(&[Any, Any, Any])
            }
            BuiltinFilter::Replace => FilterSignature::new(InputKind::Scalar, ResultKind::Scalar)
                .with_args(&[Scalar, Scalar, Scalar]),
            BuiltinFilter::Truncate | BuiltinFilter::WordWrap => {
                FilterSignature::new(InputKind::Scalar, ResultKind::Scalar).with_args(&[Scalar])
            }
            BuiltinFilter::Str => FilterSignature::new(InputKind::Any, ResultKind::Scalar),

            // List input, scalar result.
            BuiltinFilter::Length => FilterSignature::new(InputKind::List, ResultKind::Scalar),
            BuiltinFilter::Sum => FilterSignature::new(InputKind::List, ResultKind::Scalar)
                .with_element(ElementKind::Scalar),
            BuiltinFilter::Join => FilterSignature::new(InputKind::List, ResultKind::Scalar)
                .with_element(ElementKind::Scalar)
                .with_args(&[Scalar]),

            // One element of the operand.
            BuiltinFilter::First
            | BuiltinFilter::Last
            | BuiltinFilter::Random
            | BuiltinFilter::Min
            | BuiltinFilter::Max => {
                FilterSignature::new(InputKind::List, ResultKind::ElementOfInput)
            }

            // The operand's list shape flows through.
            BuiltinFilter::Map
            | BuiltinFilter::Reject
            | BuiltinFilter::RejectAttr
            | BuiltinFilter::Select
            | BuiltinFilter::SelectAttr
            | BuiltinFilter::GroupBy => {
                FilterSignature::new(InputKind::List, ResultKind::SameAsInput).with_args(&[Scalar])
            }
            BuiltinFilter::Reverse | BuiltinFilter::Sort | BuiltinFilter::Unique => {
                FilterSignature::new(InputKind::List, ResultKind::SameAsInput)
            }

            // Rows of the operand.
            BuiltinFilter::Batch | BuiltinFilter::Slice => {
                FilterSignature::new(InputKind::List, ResultKind::NestedList).with_args(&[Scalar])
            }

            BuiltinFilter::List => FilterSignature::new(InputKind::Any, ResultKind::List),
            BuiltinFilter::Dictsort => {
                FilterSignature::new(InputKind::Dictionary, ResultKind::PairList)
            }
            BuiltinFilter::XmlAttr => {
                FilterSignature::new(InputKind::Dictionary, ResultKind::Scalar)
            }
            BuiltinFilter::Default => {
                FilterSignature::new(InputKind::Any, ResultKind::InputWithDefault)
                    .with_args(&[Any, Scalar])
            }
            BuiltinFilter::Attr => {
                FilterSignature::new(InputKind::Dictionary, ResultKind::AttributeOfInput)
                    .with_args(&[Scalar])
            }
            BuiltinFilter::Pprint => FilterSignature::new(InputKind::Any, ResultKind::Scalar),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinTest {
    Defined,
    Undefined,
    IsNone,
    IsNumber,
    IsString,
    IsSequence,
    IsMapping,
    IsIterable,
    IsLower,
    IsUpper,
    IsEven,
    IsOdd,
    IsEscaped,
    DivisibleBy,
    SameAs,
    EqualTo,
}

impl BuiltinTest {
    pub fn from_name(name: &str) -> Option<BuiltinTest> {
        let test = match name {
            "defined" => BuiltinTest::Defined,
            "undefined" => BuiltinTest::Undefined,
            "none" => BuiltinTest::IsNone,
            "number" => BuiltinTest::IsNumber,
            "string" => BuiltinTest::IsString,
            "sequence" => BuiltinTest::IsSequence,
            "mapping" => BuiltinTest::IsMapping,
            "iterable" => BuiltinTest::IsIterable,
            "lower" => BuiltinTest::IsLower,
            "upper" => BuiltinTest::IsUpper,
            "even" => BuiltinTest::IsEven,
            "odd" => BuiltinTest::IsOdd,
            "escaped" => BuiltinTest::IsEscaped,
            "divisibleby" => BuiltinTest::DivisibleBy,
            "sameas" => BuiltinTest::SameAs,
            "equalto" | "eq" => BuiltinTest::EqualTo,
            _ => return None,
        };
        Some(test)
    }

    /// The shape the tested operand is expected to have. Only a weak hint:
    /// scalar-flavored tests pin the operand down, the rest leave it open.
    pub fn operand_hint(&self) -> Structural {
        match self {
            BuiltinTest::IsLower
            | BuiltinTest::IsUpper
            | BuiltinTest::IsEven
            | BuiltinTest::IsOdd
            | BuiltinTest::IsEscaped
            | BuiltinTest::DivisibleBy => Structural::scalar(),
            _ => Structural::unknown(),
        }
    }

    /// Tests that flip the referenced variable's `required` flag.
    pub fn checks_definedness(&self) -> bool {
        matches!(self, BuiltinTest::Defined | BuiltinTest::Undefined)
    }

    pub fn requires_argument(&self) -> bool {
        matches!(
            self,
            BuiltinTest::DivisibleBy | BuiltinTest::SameAs | BuiltinTest::EqualTo
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{ArgKind, BuiltinFilter, BuiltinTest, InputKind, ResultKind};

    #[test]
    fn builtin_filter_inventory_is_complete() {
        let names = [
            "abs", "attr", "batch", "capitalize", "center", "default", "dictsort", "escape",
            "first", "last", "length", "list", "lower", "upper", "map", "join", "min", "max",
            "random", "reject", "replace", "reverse", "round", "safe", "select", "slice", "sort",
            "string", "striptags", "sum", "title", "trim", "truncate", "unique", "urlencode",
            "urlize", "wordcount", "wordwrap", "xmlattr",
        ];
        for name in names {
            assert!(
                BuiltinFilter::from_name(name).is_some(),
                "missing builtin filter `{name}`"
            );
        }
    }

    #[test]
    fn aliases_resolve_to_the_same_filter() {
        assert_eq!(
            BuiltinFilter::from_name("e"),
            BuiltinFilter::from_name("escape")
        );
        assert_eq!(
            BuiltinFilter::from_name("d"),
            BuiltinFilter::from_name("default")
        );
        assert_eq!(
            BuiltinFilter::from_name("count"),
            BuiltinFilter::from_name("length")
        );
    }

    #[test]
    fn unknown_filters_are_absent() {
        assert!(BuiltinFilter::from_name("sparkle").is_none());
    }

    #[test]
    fn signatures_expose_declared_shapes() {
        let batch = BuiltinFilter::Batch.signature();
        assert_eq!(batch.input, InputKind::List);
        assert_eq!(batch.result, ResultKind::NestedList);
        assert_eq!(batch.args, vec![ArgKind::Scalar]);

        let first = BuiltinFilter::First.signature();
        assert_eq!(first.result, ResultKind::ElementOfInput);

        let default = BuiltinFilter::Default.signature();
        assert_eq!(default.result, ResultKind::InputWithDefault);
    }

    #[test]
    fn definedness_tests_are_flagged() {
        assert!(BuiltinTest::Defined.checks_definedness());
        assert!(BuiltinTest::Undefined.checks_definedness());
        assert!(!BuiltinTest::IsNumber.checks_definedness());
    }

    #[test]
    fn scalar_tests_hint_scalar_operands() {
        assert_eq!(
            BuiltinTest::DivisibleBy.operand_hint(),
            crate::jinja::types::Structural::scalar()
        );
        assert!(BuiltinTest::IsMapping.operand_hint().is_unknown());
    }
}
