use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Text generation capability.
pub trait TextGenerator: Send + Sync + 'static {
    /// Provider name, for logging.
    fn name(&self) -> &str;

    /// Generate a completion for `prompt`.
    fn generate_text<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<String>>;
}

/// Image generation capability.
pub trait ImageGenerator: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn generate_image<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<GeneratedImage>>;
}

/// Video generation capability. Returns a URL to the rendered video.
pub trait VideoGenerator: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn generate_video<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<String>>;
}

/// Persists generated media and returns a durable URL.
pub trait MediaUploader: Send + Sync + 'static {
    fn upload<'a>(
        &'a self,
        data: &'a [u8],
        mime_type: &'a str,
        name_hint: &'a str,
    ) -> BoxFuture<'a, Result<String>>;
}

/// Recipe document store.
pub trait RecipeStore: Send + Sync + 'static {
    fn get_recipe(&self, id: &str) -> BoxFuture<'_, Result<Option<Recipe>>>;

    /// Insert or replace the recipe document.
    fn put_recipe(&self, recipe: &Recipe) -> BoxFuture<'_, Result<()>>;

    /// Physically remove the document. Returns whether it existed.
    fn delete_recipe(&self, id: &str) -> BoxFuture<'_, Result<bool>>;

    fn list_recipes(&self, filter: &RecipeFilter) -> BoxFuture<'_, Result<Vec<Recipe>>>;
}

/// Execution document store.
pub trait ExecutionStore: Send + Sync + 'static {
    fn get_execution(&self, id: &str) -> BoxFuture<'_, Result<Option<Execution>>>;

    /// Insert or replace the execution document.
    fn put_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>>;

    /// Executions of a recipe, newest first.
    fn list_executions(&self, recipe_id: &str, limit: usize)
        -> BoxFuture<'_, Result<Vec<Execution>>>;
}
