use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use storyloom_core::error::{LoomError, Result};
use storyloom_core::types::{
    Edge, Execution, InputSlot, Node, NodeKind, OutputMap, Transform, DEFAULT_OUTPUT,
};

/// Read access to the outputs of nodes that have already completed.
pub trait NodeOutputs {
    fn output_of(&self, node_id: &str) -> Option<&OutputMap>;
}

impl NodeOutputs for Execution {
    fn output_of(&self, node_id: &str) -> Option<&OutputMap> {
        self.node_output(node_id)
    }
}

impl NodeOutputs for HashMap<String, OutputMap> {
    fn output_of(&self, node_id: &str) -> Option<&OutputMap> {
        self.get(node_id)
    }
}

/// Input handed to the node executor: slot values in slot order, plus the
/// rendered template when the node has one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedInput {
    pub values: Vec<(String, Value)>,
    pub prompt: Option<String>,
}

impl ResolvedInput {
    pub fn get(&self, slot: &str) -> Option<&Value> {
        self.values.iter().find(|(name, _)| name == slot).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Slot values as a JSON object.
    pub fn to_map(&self) -> OutputMap {
        self.values.iter().cloned().collect()
    }
}

/// Resolve every input slot of `node` and render its template.
///
/// Values come from the completed upstream outputs in `outputs` or, for
/// edges from the external-input pseudo-node, from `external`. A node whose
/// upstream has not completed sees that value as missing. A slot fed by
/// several edges falls back to its default only when none of them resolve;
/// a partially resolved fan-in is a `MissingInput` error.
pub fn resolve_node_input(
    node: &Node,
    edges: &[Edge],
    outputs: &dyn NodeOutputs,
    external: &Value,
) -> Result<ResolvedInput> {
    let incoming: Vec<&Edge> = edges.iter().filter(|e| e.to == node.id).collect();

    let mut values = Vec::new();
    for slot in slots_of(node, &incoming) {
        let feeding: Vec<&&Edge> = incoming.iter().filter(|e| e.to_input == slot.name).collect();

        let mut vals: Vec<Value> = feeding
            .iter()
            .filter_map(|edge| edge_value(edge, outputs, external))
            .collect();

        if !vals.is_empty() && vals.len() < feeding.len() {
            return Err(LoomError::MissingInput {
                node_id: node.id.clone(),
                slot: slot.name.clone(),
            });
        }

        let value = match vals.len() {
            0 => slot.default.clone(),
            1 => vals.pop(),
            _ => Some(Value::Array(vals)),
        };

        match value {
            Some(v) => values.push((slot.name.clone(), v)),
            None if slot.required => {
                return Err(LoomError::MissingInput {
                    node_id: node.id.clone(),
                    slot: slot.name.clone(),
                })
            }
            None => {}
        }
    }

    let mut resolved = ResolvedInput {
        values,
        prompt: None,
    };
    if let Some(template) = template_of(&node.kind) {
        resolved.prompt = Some(render_template(
            &node.id,
            template,
            &resolved,
            outputs,
            external,
        )?);
    }
    Ok(resolved)
}

/// Declared slots first, then slots only named by incoming edges.
fn slots_of(node: &Node, incoming: &[&Edge]) -> Vec<InputSlot> {
    let mut slots = node.inputs.clone();
    for edge in incoming {
        if !slots.iter().any(|s| s.name == edge.to_input) {
            slots.push(InputSlot::required(edge.to_input.clone()));
        }
    }
    slots
}

fn edge_value(edge: &Edge, outputs: &dyn NodeOutputs, external: &Value) -> Option<Value> {
    if edge.is_external() {
        return lookup_path(external, &edge.from_output).cloned();
    }
    outputs
        .output_of(&edge.from)
        .and_then(|out| out.get(&edge.from_output))
        .cloned()
}

fn template_of(kind: &NodeKind) -> Option<&str> {
    match kind {
        NodeKind::DataTransform {
            transform: Transform::Format { template },
        } => Some(template),
        other => other.prompt(),
    }
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+)*)\}").unwrap()
    })
}

/// Replace every `{name}` / `{name.path}` placeholder in `template`.
///
/// Braces that are not placeholders (JSON snippets, for example) are left
/// untouched. Any placeholder that resolves to nothing fails the whole
/// render, listing every unresolved name once in order of appearance.
pub fn render_template(
    node_id: &str,
    template: &str,
    input: &ResolvedInput,
    outputs: &dyn NodeOutputs,
    external: &Value,
) -> Result<String> {
    let mut unresolved: Vec<String> = Vec::new();
    let rendered = placeholder_regex().replace_all(template, |caps: &regex::Captures| {
        let key = &caps[1];
        match lookup_placeholder(key, input, outputs, external) {
            Some(value) => value_to_text(&value),
            None => {
                if !unresolved.iter().any(|u| u == key) {
                    unresolved.push(key.to_string());
                }
                caps[0].to_string()
            }
        }
    });

    if !unresolved.is_empty() {
        return Err(LoomError::TemplateResolution {
            node_id: node_id.to_string(),
            placeholders: unresolved,
        });
    }
    Ok(rendered.into_owned())
}

fn lookup_placeholder(
    key: &str,
    input: &ResolvedInput,
    outputs: &dyn NodeOutputs,
    external: &Value,
) -> Option<Value> {
    let (head, rest) = match key.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (key, None),
    };

    // 1. resolved input slot
    if let Some(value) = input.get(head) {
        return match rest {
            None => Some(value.clone()),
            Some(path) => lookup_path(value, path).cloned(),
        };
    }

    // 2. completed upstream node
    if let Some(out) = outputs.output_of(head) {
        return match rest {
            None => out
                .get(DEFAULT_OUTPUT)
                .cloned()
                .or_else(|| Some(Value::Object(out.clone()))),
            Some(path) => {
                let (name, nested) = match path.split_once('.') {
                    Some((name, nested)) => (name, Some(nested)),
                    None => (path, None),
                };
                match out.get(name) {
                    Some(value) => match nested {
                        None => Some(value.clone()),
                        Some(nested) => lookup_path(value, nested).cloned(),
                    },
                    // `{node.field}` reaching into the default output
                    None => out
                        .get(DEFAULT_OUTPUT)
                        .and_then(|v| lookup_path(v, path))
                        .cloned(),
                }
            }
        };
    }

    // 3. external input field
    lookup_path(external, key).cloned()
}

/// Walk a dotted path through objects and arrays. Numeric segments index arrays.
pub fn lookup_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Strings are inserted as-is, everything else as compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storyloom_core::types::CombineMode;

    fn outputs(entries: &[(&str, Value)]) -> HashMap<String, OutputMap> {
        entries
            .iter()
            .map(|(id, v)| {
                let mut map = OutputMap::new();
                map.insert("output".into(), v.clone());
                (id.to_string(), map)
            })
            .collect()
    }

    #[test]
    fn test_external_input_and_prompt() {
        let node = Node::text("a", "Describe {topic}").with_inputs(vec![InputSlot::required("topic")]);
        let edges = vec![Edge::external("topic", "a", "topic")];
        let resolved = resolve_node_input(
            &node,
            &edges,
            &HashMap::new(),
            &json!({"topic": "a red bicycle"}),
        )
        .unwrap();
        assert_eq!(resolved.get("topic"), Some(&json!("a red bicycle")));
        assert_eq!(resolved.prompt.as_deref(), Some("Describe a red bicycle"));
    }

    #[test]
    fn test_fan_in_keys_by_slot() {
        let node = Node::combine("c", CombineMode::Object)
            .with_inputs(vec![InputSlot::required("left"), InputSlot::required("right")]);
        let edges = vec![
            Edge::wired("b", "output", "c", "right"),
            Edge::wired("a", "output", "c", "left"),
        ];
        let outs = outputs(&[("a", json!("from a")), ("b", json!("from b"))]);
        let resolved = resolve_node_input(&node, &edges, &outs, &Value::Null).unwrap();
        assert_eq!(resolved.get("left"), Some(&json!("from a")));
        assert_eq!(resolved.get("right"), Some(&json!("from b")));
        // declared order is kept
        assert_eq!(resolved.values[0].0, "left");
    }

    #[test]
    fn test_multiple_edges_into_one_slot_collect_in_edge_order() {
        let node = Node::combine("all", CombineMode::Array);
        let edges = vec![Edge::new("y", "all"), Edge::new("x", "all")];
        let outs = outputs(&[("x", json!(1)), ("y", json!(2))]);
        let resolved = resolve_node_input(&node, &edges, &outs, &Value::Null).unwrap();
        assert_eq!(resolved.get("input"), Some(&json!([2, 1])));
    }

    #[test]
    fn test_partial_fan_in_is_missing_input_even_with_default() {
        let node = Node::combine("all", CombineMode::Array)
            .with_inputs(vec![InputSlot::with_default("input", json!([]))]);
        let edges = vec![Edge::new("x", "all"), Edge::new("y", "all")];

        let outs = outputs(&[("x", json!(1))]);
        assert!(matches!(
            resolve_node_input(&node, &edges, &outs, &Value::Null),
            Err(LoomError::MissingInput { .. })
        ));

        // Nothing resolved at all: the default applies.
        let resolved = resolve_node_input(&node, &edges, &HashMap::new(), &Value::Null).unwrap();
        assert_eq!(resolved.get("input"), Some(&json!([])));
    }

    #[test]
    fn test_missing_upstream_is_missing_input() {
        let node = Node::text("b", "after {input}");
        let edges = vec![Edge::new("a", "b")];
        let err = resolve_node_input(&node, &edges, &HashMap::new(), &Value::Null).unwrap_err();
        match err {
            LoomError::MissingInput { node_id, slot } => {
                assert_eq!(node_id, "b");
                assert_eq!(slot, "input");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_defaults_and_optional_slots() {
        let node = Node::text("p", "Make {count} personas{tone}").with_inputs(vec![
            InputSlot::with_default("count", json!(3)),
            InputSlot::optional("style"),
            InputSlot::with_default("tone", json!("")),
        ]);
        let resolved = resolve_node_input(&node, &[], &HashMap::new(), &json!({})).unwrap();
        assert_eq!(resolved.get("count"), Some(&json!(3)));
        assert!(resolved.get("style").is_none());
        assert_eq!(resolved.prompt.as_deref(), Some("Make 3 personas"));

        let required = Node::text("q", "x").with_inputs(vec![InputSlot::required("brief")]);
        assert!(matches!(
            resolve_node_input(&required, &[], &HashMap::new(), &json!({})),
            Err(LoomError::MissingInput { .. })
        ));
    }

    #[test]
    fn test_placeholder_lookup_order() {
        let node = Node::image("img", "{gen_text.output} | {gen_text} | {meta.size} | {input}");
        let edges = vec![Edge::new("gen_text", "img")];
        let outs = outputs(&[("gen_text", json!("a shiny red bicycle"))]);
        let resolved =
            resolve_node_input(&node, &edges, &outs, &json!({"meta": {"size": "large"}})).unwrap();
        assert_eq!(
            resolved.prompt.as_deref(),
            Some("a shiny red bicycle | a shiny red bicycle | large | a shiny red bicycle")
        );
    }

    #[test]
    fn test_nested_paths_and_json_rendering() {
        let node = Node::text("t", "Name: {lead.name}, first: {list.0}, all: {list}");
        let edges = vec![
            Edge::wired("src", "output", "t", "lead"),
            Edge::wired("arr", "output", "t", "list"),
        ];
        let outs = outputs(&[
            ("src", json!({"name": "Ada", "age": 36})),
            ("arr", json!(["x", "y"])),
        ]);
        let resolved = resolve_node_input(&node, &edges, &outs, &Value::Null).unwrap();
        assert_eq!(
            resolved.prompt.as_deref(),
            Some(r#"Name: Ada, first: x, all: ["x","y"]"#)
        );
    }

    #[test]
    fn test_unresolved_placeholders_listed_once() {
        let node = Node::text("t", "{a} and {b} and {a}");
        let err = resolve_node_input(&node, &[], &HashMap::new(), &json!({})).unwrap_err();
        match err {
            LoomError::TemplateResolution {
                node_id,
                placeholders,
            } => {
                assert_eq!(node_id, "t");
                assert_eq!(placeholders, vec!["a", "b"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_non_placeholder_braces_untouched() {
        let node = Node::text("t", r#"Reply as {"name": "..."} about {topic}"#);
        let resolved =
            resolve_node_input(&node, &[], &HashMap::new(), &json!({"topic": "cats"})).unwrap();
        assert_eq!(
            resolved.prompt.as_deref(),
            Some(r#"Reply as {"name": "..."} about cats"#)
        );
    }

    #[test]
    fn test_format_transform_uses_template() {
        let node = Node::transform(
            "fmt",
            Transform::Format {
                template: "Hello {who}".into(),
            },
        )
        .with_inputs(vec![InputSlot::required("who")]);
        let edges = vec![Edge::external("name", "fmt", "who")];
        let resolved =
            resolve_node_input(&node, &edges, &HashMap::new(), &json!({"name": "Ada"})).unwrap();
        assert_eq!(resolved.prompt.as_deref(), Some("Hello Ada"));

        let merge = Node::transform("m", Transform::Merge);
        let resolved = resolve_node_input(&merge, &[], &HashMap::new(), &Value::Null).unwrap();
        assert!(resolved.prompt.is_none());
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_lookup_path() {
        let v = json!({"a": [{"b": 1}, {"b": 2}]});
        assert_eq!(lookup_path(&v, "a.1.b"), Some(&json!(2)));
        assert_eq!(lookup_path(&v, "a.x"), None);
        assert_eq!(lookup_path(&v, ""), Some(&v));
    }
}
