/// A named provider preset for OpenAI-compatible APIs.
pub struct ProviderPreset {
    /// API root; endpoint paths are appended to it.
    pub default_base_url: &'static str,
    pub needs_api_key: bool,
    /// Whether the provider serves `/images/generations`.
    pub supports_images: bool,
}

/// Look up a provider preset by name.
pub fn get_preset(provider: &str) -> Option<ProviderPreset> {
    match provider {
        "openai" => Some(ProviderPreset {
            default_base_url: "https://api.openai.com/v1",
            needs_api_key: true,
            supports_images: true,
        }),
        "ollama" => Some(ProviderPreset {
            default_base_url: "http://localhost:11434/v1",
            needs_api_key: false,
            supports_images: false,
        }),
        "groq" => Some(ProviderPreset {
            default_base_url: "https://api.groq.com/openai/v1",
            needs_api_key: true,
            supports_images: false,
        }),
        "openrouter" => Some(ProviderPreset {
            default_base_url: "https://openrouter.ai/api/v1",
            needs_api_key: true,
            supports_images: false,
        }),
        "together" => Some(ProviderPreset {
            default_base_url: "https://api.together.xyz/v1",
            needs_api_key: true,
            supports_images: true,
        }),
        "xai" => Some(ProviderPreset {
            default_base_url: "https://api.x.ai/v1",
            needs_api_key: true,
            supports_images: true,
        }),
        "mistral" => Some(ProviderPreset {
            default_base_url: "https://api.mistral.ai/v1",
            needs_api_key: true,
            supports_images: false,
        }),
        "deepseek" => Some(ProviderPreset {
            default_base_url: "https://api.deepseek.com/v1",
            needs_api_key: true,
            supports_images: false,
        }),
        _ => None,
    }
}

/// List all known preset provider names.
pub fn all_preset_names() -> &'static [&'static str] {
    &[
        "openai",
        "ollama",
        "groq",
        "openrouter",
        "together",
        "xai",
        "mistral",
        "deepseek",
    ]
}
