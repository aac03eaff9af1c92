use async_trait::async_trait;
use minijinja::{Environment, UndefinedBehavior};
use relaycore::{Node, NodeContext, NodeError, NodeOutput};
use relayruntime::{NodeFactory, NodeMetadata};
use serde_json::{json, Value};
use std::collections::HashMap;

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

/// Parse the upstream JSON string into a value
pub struct JsonParseNode;

#[async_trait]
impl Node for JsonParseNode {
    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let upstream = ctx.upstream();
        let input = upstream.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: "json".to_string(),
            expected: "string".to_string(),
            actual: type_name(upstream).to_string(),
        })?;

        let parsed: Value = serde_json::from_str(input)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(NodeOutput::new(parsed))
    }
}

pub struct JsonParseNodeFactory;

impl NodeFactory for JsonParseNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonParseNode))
    }

    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Parse JSON string".to_string(),
            category: "transform".to_string(),
        }
    }
}

/// Serialize the upstream value to a JSON string
pub struct JsonStringifyNode;

#[async_trait]
impl Node for JsonStringifyNode {
    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let pretty = ctx
            .config
            .get("pretty")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let value = ctx.upstream();

        let json_str = if pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::new(json_str))
    }
}

pub struct JsonStringifyNodeFactory;

impl NodeFactory for JsonStringifyNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonStringifyNode))
    }

    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Convert value to JSON string".to_string(),
            category: "transform".to_string(),
        }
    }
}

/// Fill a prompt template.
///
/// Rendered with minijinja over `{upstream, input}`: `upstream` is the
/// previous node's output and `input` the run input. Undefined names fail the
/// node instead of rendering empty.
pub struct TemplateNode;

fn template_env<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

fn fill_template(template: &str, upstream: &Value, input: &Value) -> Result<String, NodeError> {
    let env = template_env();
    let tmpl = env
        .template_from_str(template)
        .map_err(|e| NodeError::Configuration(format!("Template parse error: {}", e)))?;
    let ctx = minijinja::Value::from_serialize(json!({ "upstream": upstream, "input": input }));
    tmpl.render(ctx)
        .map_err(|e| NodeError::ExecutionFailed(format!("Template render error: {}", e)))
}

#[async_trait]
impl Node for TemplateNode {
    fn node_type(&self) -> &str {
        "text.template"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let template = ctx
            .require_config("template")?
            .as_str()
            .ok_or_else(|| NodeError::Configuration("template must be a string".to_string()))?;

        let text = fill_template(template, ctx.upstream(), &ctx.data.input)?;
        Ok(NodeOutput::new(text))
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        match config.get("template") {
            Some(Value::String(template)) => template_env()
                .template_from_str(template)
                .map(|_| ())
                .map_err(|e| NodeError::Configuration(format!("Template parse error: {}", e))),
            Some(_) => Err(NodeError::Configuration(
                "template must be a string".to_string(),
            )),
            None => Err(NodeError::Configuration("Missing config: template".to_string())),
        }
    }
}

pub struct TemplateNodeFactory;

impl NodeFactory for TemplateNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(TemplateNode))
    }

    fn node_type(&self) -> &str {
        "text.template"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Fill a text template from upstream output and run input".to_string(),
            category: "transform".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_upstream_and_input_fields() {
        let text = fill_template(
            "Summarize for {{ input.audience }}: {{upstream}}",
            &json!("the report"),
            &json!({"audience": "executives"}),
        )
        .unwrap();
        assert_eq!(text, "Summarize for executives: the report");

        let text = fill_template("{{ upstream | tojson }}", &json!({"a": 1}), &json!(null)).unwrap();
        assert_eq!(text, r#"{"a":1}"#);

        let text = fill_template(
            "{% for topic in input.topics %}[{{ topic | upper }}]{% endfor %}",
            &json!(null),
            &json!({"topics": ["tides", "moons"]}),
        )
        .unwrap();
        assert_eq!(text, "[TIDES][MOONS]");
    }

    #[test]
    fn syntax_errors_are_configuration_errors() {
        assert!(matches!(
            fill_template("{{ upstream", &json!(""), &json!(null)),
            Err(NodeError::Configuration(_))
        ));

        let mut config = HashMap::new();
        config.insert("template".to_string(), json!("{% if upstream %}never closed"));
        assert!(matches!(
            TemplateNode.validate_config(&config),
            Err(NodeError::Configuration(_))
        ));
        config.insert("template".to_string(), json!("{{ upstream }}"));
        assert!(TemplateNode.validate_config(&config).is_ok());
    }

    #[test]
    fn undefined_names_fail_the_render() {
        assert!(matches!(
            fill_template("{{ other }}", &json!(""), &json!(null)),
            Err(NodeError::ExecutionFailed(_))
        ));
        assert!(matches!(
            fill_template("{{ input.missing }}", &json!(""), &json!({})),
            Err(NodeError::ExecutionFailed(_))
        ));
    }
}
