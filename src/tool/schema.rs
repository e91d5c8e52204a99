// Aglogen Assistant — Tool schema builder
//
// Tools declare their parameters explicitly (name, type hint, default) plus a
// Google-style doc block. The builder turns that declaration into the JSON
// Schema shown to the LLM and into the set of argument names the handler
// accepts.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use super::{AcceptedArgs, ToolDefinition, ToolHandler};

/// Parameter names that never appear in a generated schema.
pub const DEFAULT_EXCLUDED_PARAMS: [&str; 4] = ["user", "project_id", "kwargs", "args"];

// ---------------------------------------------------------------------------
// Parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array(Option<Box<ParamType>>),
    Object,
    Null,
    Union(Vec<ParamType>),
}

impl ParamType {
    pub fn optional(inner: ParamType) -> Self {
        ParamType::Union(vec![inner, ParamType::Null])
    }

    pub fn array_of(inner: ParamType) -> Self {
        ParamType::Array(Some(Box::new(inner)))
    }

    /// Parse a Python-style type hint such as `list[str]`, `Optional[int]`
    /// or `float | None`. Unknown names fall back to `String`.
    pub fn from_hint(hint: &str) -> Self {
        let hint = hint.trim();

        let alternatives = split_top_level(hint, '|');
        if alternatives.len() > 1 {
            return ParamType::Union(alternatives.iter().map(|a| Self::from_hint(a)).collect());
        }

        if let Some((head, inner)) = generic_parts(hint) {
            return match head {
                "Optional" => Self::optional(Self::from_hint(inner)),
                "Union" => ParamType::Union(
                    split_top_level(inner, ',')
                        .iter()
                        .map(|a| Self::from_hint(a))
                        .collect(),
                ),
                "list" | "List" | "Sequence" => {
                    let first = split_top_level(inner, ',');
                    match first.first() {
                        Some(t) if !t.trim().is_empty() => Self::array_of(Self::from_hint(t)),
                        _ => ParamType::Array(None),
                    }
                }
                "dict" | "Dict" | "Mapping" => ParamType::Object,
                _ => ParamType::String,
            };
        }

        match hint {
            "str" => ParamType::String,
            "int" => ParamType::Integer,
            "float" => ParamType::Number,
            "bool" => ParamType::Boolean,
            "list" | "List" => ParamType::Array(None),
            "dict" | "Dict" => ParamType::Object,
            "None" | "NoneType" => ParamType::Null,
            _ => ParamType::String,
        }
    }

    /// True for a union that admits `None`.
    pub fn is_nullable(&self) -> bool {
        match self {
            ParamType::Union(members) => members.contains(&ParamType::Null),
            _ => false,
        }
    }

    pub fn json_schema(&self) -> Value {
        match self {
            ParamType::String => json!({"type": "string"}),
            ParamType::Integer => json!({"type": "integer"}),
            ParamType::Number => json!({"type": "number"}),
            ParamType::Boolean => json!({"type": "boolean"}),
            ParamType::Object => json!({"type": "object"}),
            ParamType::Null => json!({"type": "null"}),
            ParamType::Array(None) => json!({"type": "array"}),
            ParamType::Array(Some(inner)) => json!({"type": "array", "items": inner.json_schema()}),
            ParamType::Union(members) => {
                let non_null: Vec<&ParamType> =
                    members.iter().filter(|m| **m != ParamType::Null).collect();
                if non_null.len() == 1 && self.is_nullable() {
                    non_null[0].json_schema()
                } else {
                    json!({"anyOf": members.iter().map(|m| m.json_schema()).collect::<Vec<_>>()})
                }
            }
        }
    }
}

fn generic_parts(hint: &str) -> Option<(&str, &str)> {
    let open = hint.find('[')?;
    let inner = hint.strip_suffix(']')?;
    let head = hint[..open].trim();
    let head = head.rsplit('.').next().unwrap_or(head);
    Some((head, &inner[open + 1..]))
}

fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: ParamType,
    pub has_default: bool,
    pub description: Option<String>,
}

impl Param {
    /// Declare a parameter from its type hint. Without `with_default` the
    /// parameter is required unless the hint is nullable.
    pub fn new(name: impl Into<String>, hint: &str) -> Self {
        Self {
            name: name.into(),
            ty: ParamType::from_hint(hint),
            has_default: false,
            description: None,
        }
    }

    pub fn typed(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            has_default: false,
            description: None,
        }
    }

    pub fn with_default(mut self) -> Self {
        self.has_default = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_required(&self) -> bool {
        !self.has_default && !self.ty.is_nullable()
    }
}

// ---------------------------------------------------------------------------
// Doc parsing
// ---------------------------------------------------------------------------

fn args_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*args?:\s*$").expect("valid regex"))
}

fn arg_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\s+)(\w+)(?:\s*\([^)]*\))?:\s*(.*)$").expect("valid regex")
    })
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Extract `name: description` pairs from the `Args:` block of a doc string.
/// Continuation lines are joined with single spaces.
pub fn parse_arg_docs(doc: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut lines = doc.lines().skip_while(|l| !args_header().is_match(l));
    let Some(header) = lines.next() else {
        return out;
    };
    let header_indent = indent_of(header);

    let mut arg_indent: Option<usize> = None;
    let mut current: Option<(String, String)> = None;

    for line in lines {
        if line.trim().is_empty() {
            break;
        }
        let indent = indent_of(line);
        if indent <= header_indent {
            break;
        }
        match arg_indent {
            Some(base) if indent > base => {
                if let Some((_, desc)) = current.as_mut() {
                    desc.push(' ');
                    desc.push_str(line.trim());
                }
                continue;
            }
            Some(base) if indent < base => break,
            _ => {}
        }
        let Some(caps) = arg_line().captures(line) else {
            break;
        };
        arg_indent.get_or_insert(indent);
        if let Some((name, desc)) = current.take() {
            out.insert(name, collapse_whitespace(&desc));
        }
        current = Some((caps[2].to_string(), caps[3].to_string()));
    }

    if let Some((name, desc)) = current {
        out.insert(name, collapse_whitespace(&desc));
    }
    out
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Build `{"type":"object","properties":{..},"required":[..]}` from declared
/// parameters, skipping excluded names.
pub fn build_parameter_schema(
    params: &[Param],
    docs: &BTreeMap<String, String>,
    exclude: &BTreeSet<String>,
) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for param in params {
        if exclude.contains(&param.name) {
            continue;
        }
        let mut schema = param.ty.json_schema();
        let description = param
            .description
            .clone()
            .or_else(|| docs.get(&param.name).cloned());
        if let (Some(desc), Some(map)) = (description, schema.as_object_mut()) {
            map.insert("description".to_string(), Value::String(desc));
        }
        properties.insert(param.name.clone(), schema);
        if param.is_required() {
            required.push(Value::String(param.name.clone()));
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ToolBuilder {
    name: String,
    description: Option<String>,
    doc: Option<String>,
    params: Vec<Param>,
    context_params: BTreeSet<String>,
    exclude: BTreeSet<String>,
    accepts_kwargs: bool,
    category: String,
    requires_project: bool,
    is_async: bool,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            doc: None,
            params: Vec::new(),
            context_params: BTreeSet::new(),
            exclude: DEFAULT_EXCLUDED_PARAMS.iter().map(|s| s.to_string()).collect(),
            accepts_kwargs: false,
            category: "utility".to_string(),
            requires_project: false,
            is_async: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Declare a context-supplied argument (`user`, `project_id`, ...) that the
    /// handler reads but the LLM never sees.
    pub fn context_param(mut self, name: impl Into<String>) -> Self {
        self.context_params.insert(name.into());
        self
    }

    /// Pass every merged argument through to the handler.
    pub fn accepts_kwargs(mut self) -> Self {
        self.accepts_kwargs = true;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn requires_project(mut self, requires_project: bool) -> Self {
        self.requires_project = requires_project;
        self
    }

    pub fn is_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub fn handler(self, handler: impl ToolHandler + 'static) -> ToolDefinition {
        let description = self.description.clone().unwrap_or_else(|| match &self.doc {
            Some(doc) => doc.split('\n').next().unwrap_or_default().trim().to_string(),
            None => format!("Execute {}", self.name),
        });
        let docs = self.doc.as_deref().map(parse_arg_docs).unwrap_or_default();
        let parameters = build_parameter_schema(&self.params, &docs, &self.exclude);

        let accepted = if self.accepts_kwargs {
            AcceptedArgs::Any
        } else {
            let mut names: BTreeSet<String> =
                self.params.iter().map(|p| p.name.clone()).collect();
            names.extend(self.context_params.iter().cloned());
            AcceptedArgs::Declared(names)
        };

        ToolDefinition::new(self.name, description, parameters, handler)
            .with_category(self.category)
            .with_requires_project(self.requires_project)
            .with_async(self.is_async)
            .with_accepted(accepted)
    }
}
