use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    pub fn json_type(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "object",
            ParamKind::Array => "array",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
        }
    }
}

fn default_required() -> bool {
    true
}

/// One declared tool parameter. Order matters: it is the positional order in markup calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

impl ToolParam {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            required: true,
            choices: Vec::new(),
        }
    }

    pub fn optional(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    pub fn one_of(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|c| c.to_string()).collect();
        self
    }
}

/// JSON schema handed to function-calling providers.
pub fn function_schema(params: &[ToolParam]) -> Value {
    let mut properties = Map::new();
    for p in params {
        let mut prop = json!({ "type": p.kind.json_type() });
        if !p.description.is_empty() {
            prop["description"] = json!(p.description);
        }
        if !p.choices.is_empty() {
            prop["enum"] = json!(p.choices);
        }
        properties.insert(p.name.clone(), prop);
    }
    let required: Vec<&str> = params
        .iter()
        .filter(|p| p.required)
        .map(|p| p.name.as_str())
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// Markup form of a tool's signature: positional parameters in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkupSchema {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

impl MarkupSchema {
    pub fn new(name: &str, description: &str, params: &[ToolParam]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params: params.to_vec(),
        }
    }

    /// Turn a markup call body into named arguments. Accepts a positional array, a named
    /// object, a bare string for the first parameter, or nothing.
    pub fn bind(&self, body: &Value) -> Result<Value, String> {
        let named = match body {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            Value::Array(items) => {
                if items.len() > self.params.len() {
                    return Err(format!(
                        "expected at most {} positional argument(s), got {}",
                        self.params.len(),
                        items.len()
                    ));
                }
                self.params
                    .iter()
                    .zip(items)
                    .map(|(p, v)| (p.name.clone(), v.clone()))
                    .collect()
            }
            Value::String(s) => {
                let Some(first) = self.params.first() else {
                    return Err("tool takes no arguments".to_string());
                };
                let mut map = Map::new();
                map.insert(first.name.clone(), Value::String(s.clone()));
                map
            }
            other => return Err(format!("unsupported argument body: {}", other)),
        };

        for p in &self.params {
            match named.get(&p.name) {
                None if p.required => {
                    return Err(format!("missing required argument '{}'", p.name));
                }
                Some(v) if !p.kind.accepts(v) => {
                    return Err(format!(
                        "argument '{}' must be {}",
                        p.name,
                        p.kind.json_type()
                    ));
                }
                _ => {}
            }
        }
        Ok(Value::Object(named))
    }

    pub fn render(&self) -> String {
        let placeholders: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                let optional = if p.required { "" } else { ", optional" };
                format!("\"<{}: {}{}>\"", p.name, p.kind.json_type(), optional)
            })
            .collect();
        let mut out = format!(
            "### {}\n{}\n<invoke name=\"{}\">[{}]</invoke>\n",
            self.name,
            self.description,
            self.name,
            placeholders.join(", ")
        );
        for p in self.params.iter().filter(|p| !p.description.is_empty()) {
            out.push_str(&format!("- {}: {}\n", p.name, p.description));
        }
        out
    }
}

/// System-prompt section teaching a markup-only model how to call tools.
pub fn render_catalog(schemas: &[&MarkupSchema]) -> String {
    if schemas.is_empty() {
        return String::new();
    }
    let mut out = String::from(
        "## Tools\nCall a tool by writing an <invoke> block whose body is a JSON array of \
         positional arguments. You may issue several blocks in one reply. Reply without any \
         <invoke> block when you are done.\n\n",
    );
    for schema in schemas {
        out.push_str(&schema.render());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_params() -> Vec<ToolParam> {
        vec![
            ToolParam::required("query", ParamKind::String, "What to look for"),
            ToolParam::optional("limit", ParamKind::Integer, ""),
        ]
    }

    #[test]
    fn function_schema_lists_required_params() {
        let schema = function_schema(&search_params());
        assert_eq!(schema["properties"]["query"]["type"], "string");
        assert_eq!(schema["required"], json!(["query"]));
        assert_eq!(schema["additionalProperties"], false);
    }

    #[test]
    fn markup_binds_positional_named_and_bare_bodies() {
        let markup = MarkupSchema::new("search", "Search", &search_params());
        assert_eq!(
            markup.bind(&json!(["rust", 3])).unwrap(),
            json!({"query": "rust", "limit": 3})
        );
        assert_eq!(
            markup.bind(&json!({"query": "rust"})).unwrap(),
            json!({"query": "rust"})
        );
        assert_eq!(markup.bind(&json!("rust")).unwrap(), json!({"query": "rust"}));
    }

    #[test]
    fn markup_rejects_arity_and_kind_errors() {
        let markup = MarkupSchema::new("search", "Search", &search_params());
        assert!(markup.bind(&json!([])).unwrap_err().contains("query"));
        assert!(markup.bind(&json!(["a", 1, 2])).is_err());
        assert!(markup.bind(&json!(["a", "three"])).unwrap_err().contains("integer"));
    }

    #[test]
    fn catalog_renders_invocation_examples() {
        let markup = MarkupSchema::new("search", "Search the web", &search_params());
        let catalog = render_catalog(&[&markup]);
        assert!(catalog.contains("<invoke name=\"search\">"));
        assert!(catalog.contains("<limit: integer, optional>"));
        assert!(render_catalog(&[]).is_empty());
    }
}
