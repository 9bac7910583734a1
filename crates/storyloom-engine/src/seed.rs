use serde_json::json;

use storyloom_core::types::{CombineMode, Edge, InputSlot, Node, Recipe, Transform};

pub const PERSONA_RECIPE_ID: &str = "seed-persona-generation";
pub const STORYBOARD_RECIPE_ID: &str = "seed-story-storyboard";

/// Recipes installed by `seed`. Ids are fixed so seeding can skip the ones
/// already present.
pub fn builtin_recipes() -> Vec<Recipe> {
    vec![persona_generation(), story_storyboard()]
}

fn persona_generation() -> Recipe {
    let nodes = vec![
        Node::text(
            "brief",
            "Summarize the target audience for this product in three sentences: {product}",
        )
        .with_inputs(vec![InputSlot::required("product")]),
        Node::text(
            "personas",
            "Create {count} distinct customer personas for the audience below. \
             Reply with a JSON array of objects with the fields name, age, \
             occupation, goals and pain_points.\n\n{brief}",
        )
        .structured()
        .with_inputs(vec![
            InputSlot::required("brief"),
            InputSlot::with_default("count", json!(3)),
        ])
        .as_final(),
        Node::transform("lead", Transform::Pick { path: "0".into() })
            .with_inputs(vec![InputSlot::required("personas")])
            .as_final(),
    ];
    let edges = vec![
        Edge::external("product", "brief", "product"),
        Edge::external("count", "personas", "count"),
        Edge::wired("brief", "output", "personas", "brief"),
        Edge::wired("personas", "output", "lead", "personas"),
    ];

    Recipe::new("Persona generation", nodes, edges)
        .with_id(PERSONA_RECIPE_ID)
        .with_stage("persona_generation")
        .with_description("Turns a product description into a set of customer personas.")
}

fn story_storyboard() -> Recipe {
    let nodes = vec![
        Node::text(
            "outline",
            "Break this story into {scene_count} scenes. Reply with a JSON array \
             of objects with the fields title and description.\n\n{story}",
        )
        .structured()
        .with_inputs(vec![
            InputSlot::required("story"),
            InputSlot::with_default("scene_count", json!(4)),
        ]),
        Node::transform(
            "key_frame",
            Transform::Pick {
                path: "0.description".into(),
            },
        )
        .with_inputs(vec![InputSlot::required("scenes")]),
        Node::image(
            "key_visual",
            "Cinematic key visual, storyboard style: {frame}",
        )
        .with_inputs(vec![InputSlot::required("frame")]),
        Node::combine("board", CombineMode::Object)
            .with_inputs(vec![
                InputSlot::required("scenes"),
                InputSlot::required("key_visual"),
            ])
            .as_final(),
    ];
    let edges = vec![
        Edge::external("story", "outline", "story"),
        Edge::external("scene_count", "outline", "scene_count"),
        Edge::wired("outline", "output", "key_frame", "scenes"),
        Edge::wired("key_frame", "output", "key_visual", "frame"),
        Edge::wired("outline", "output", "board", "scenes"),
        Edge::wired("key_visual", "output", "board", "key_visual"),
    ];

    Recipe::new("Story storyboard", nodes, edges)
        .with_id(STORYBOARD_RECIPE_ID)
        .with_stage("storyboard")
        .with_description("Outlines a story into scenes and renders a key visual.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{topological_order, validate_dag};

    #[test]
    fn test_builtins_are_valid_dags() {
        for recipe in builtin_recipes() {
            validate_dag(&recipe.nodes, &recipe.edges).unwrap();
        }
    }

    #[test]
    fn test_builtin_ids_and_stages() {
        let recipes = builtin_recipes();
        assert_eq!(recipes[0].id, PERSONA_RECIPE_ID);
        assert_eq!(recipes[0].stage_type.as_deref(), Some("persona_generation"));
        assert_eq!(recipes[1].id, STORYBOARD_RECIPE_ID);
        assert_eq!(recipes[1].stage_type.as_deref(), Some("storyboard"));
    }

    #[test]
    fn test_storyboard_order() {
        let recipe = story_storyboard();
        let order = topological_order(&recipe.nodes, &recipe.edges).unwrap();
        assert_eq!(order, vec!["outline", "key_frame", "key_visual", "board"]);
    }
}
