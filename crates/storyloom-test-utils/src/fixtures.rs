use serde_json::{json, Value};

use storyloom_core::types::{CombineMode, Edge, InputSlot, Node, Recipe};

/// A -> B -> C, with A reading `topic` from the external input.
pub fn linear_chain() -> Recipe {
    Recipe::new(
        "linear chain",
        vec![
            Node::text("a", "Step A about {topic}").with_inputs(vec![InputSlot::required("topic")]),
            Node::text("b", "Step B after {input}"),
            Node::text("c", "Step C after {input}").as_final(),
        ],
        vec![
            Edge::external("topic", "a", "topic"),
            Edge::new("a", "b"),
            Edge::new("b", "c"),
        ],
    )
    .with_id("linear-chain")
}

/// A and B both feed C through distinct slots.
pub fn fan_in() -> Recipe {
    Recipe::new(
        "fan in",
        vec![
            Node::text("a", "Left side"),
            Node::text("b", "Right side"),
            Node::combine("c", CombineMode::Object)
                .with_inputs(vec![InputSlot::required("left"), InputSlot::required("right")])
                .as_final(),
        ],
        vec![
            Edge::wired("a", "output", "c", "left"),
            Edge::wired("b", "output", "c", "right"),
        ],
    )
    .with_id("fan-in")
}

/// Text node describing a topic, followed by an image node illustrating it.
pub fn bicycle_recipe() -> Recipe {
    Recipe::new(
        "bicycle",
        vec![
            Node::text("gen_text", "Describe {topic}"),
            Node::image("gen_image", "Illustrate: {gen_text.output}"),
        ],
        vec![Edge::new("gen_text", "gen_image")],
    )
    .with_id("bicycle")
}

pub fn bicycle_input() -> Value {
    json!({"topic": "a red bicycle"})
}

/// Four text nodes in a line. Node `s2` prompts with "step two".
pub fn four_step_chain() -> Recipe {
    Recipe::new(
        "four steps",
        vec![
            Node::text("s1", "step one"),
            Node::text("s2", "step two after {input}"),
            Node::text("s3", "step three after {input}"),
            Node::text("s4", "step four after {input}"),
        ],
        vec![
            Edge::new("s1", "s2"),
            Edge::new("s2", "s3"),
            Edge::new("s3", "s4"),
        ],
    )
    .with_id("four-steps")
}
