use std::fmt;

use serde::{Deserialize, Serialize};

/// Backend that serves a model. The set is closed; adding one means a new client in the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Groq,
    Google,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Groq, Provider::Google];

    pub fn id(&self) -> &'static str {
        match self {
            Self::Groq => "groq",
            Self::Google => "google",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Groq => "Groq",
            Self::Google => "Google",
        }
    }

    /// Settings key holding the user's credential override.
    pub fn settings_key(&self) -> &'static str {
        match self {
            Self::Groq => "groqApiKey",
            Self::Google => "googleApiKey",
        }
    }

    /// Environment variable holding the default credential.
    pub fn env_var(&self) -> &'static str {
        match self {
            Self::Groq => "GROQ_API_KEY",
            Self::Google => "GOOGLE_API_KEY",
        }
    }

    /// Value shipped in sample env files; treated the same as no key at all.
    pub fn placeholder_key(&self) -> &'static str {
        match self {
            Self::Groq => "your_groq_api_key_here",
            Self::Google => "your_google_api_key_here",
        }
    }

    /// Trims `raw` and returns it only if it is a real key.
    pub fn usable_credential(&self, raw: Option<&str>) -> Option<String> {
        let candidate = raw?.trim();
        if candidate.is_empty() || candidate == self.placeholder_key() {
            return None;
        }
        Some(candidate.to_string())
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    pub name: String,
    pub provider: Provider,
    pub description: Option<String>,
    pub supports_vision: bool,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>, provider: Provider) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider,
            description: None,
            supports_vision: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_vision(mut self) -> Self {
        self.supports_vision = true;
        self
    }
}

pub const RECOMMENDED_MODEL: &str = "llama-3.3-70b-versatile";

pub fn default_models() -> Vec<Model> {
    vec![
        Model::new(RECOMMENDED_MODEL, "Llama 3.3 70B", Provider::Groq)
            .with_description("Balanced quality and speed, recommended default"),
        Model::new("llama-3.1-8b-instant", "Llama 3.1 8B Instant", Provider::Groq)
            .with_description("Lowest latency for short exchanges"),
        Model::new(
            "meta-llama/llama-4-scout-17b-16e-instruct",
            "Llama 4 Scout",
            Provider::Groq,
        )
        .with_description("Multimodal model that reads images")
        .with_vision(),
        Model::new("gemma2-9b-it", "Gemma 2 9B", Provider::Groq)
            .with_description("Compact instruction-tuned model"),
        Model::new(
            "deepseek-r1-distill-llama-70b",
            "DeepSeek R1 Distill 70B",
            Provider::Groq,
        )
        .with_description("Reasoning-focused distillation"),
        Model::new("gemini-2.0-flash", "Gemini 2.0 Flash", Provider::Google)
            .with_description("Fast multimodal model")
            .with_vision(),
        Model::new("gemini-1.5-pro", "Gemini 1.5 Pro", Provider::Google)
            .with_description("Long-context multimodal model")
            .with_vision(),
        Model::new("gemini-1.5-flash", "Gemini 1.5 Flash", Provider::Google)
            .with_description("Lightweight multimodal model")
            .with_vision(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_and_blank_credentials_are_unusable() {
        let provider = Provider::Groq;

        assert_eq!(provider.usable_credential(None), None);
        assert_eq!(provider.usable_credential(Some("   ")), None);
        assert_eq!(provider.usable_credential(Some("your_groq_api_key_here")), None);
        assert_eq!(
            provider.usable_credential(Some(" gsk_live ")).as_deref(),
            Some("gsk_live")
        );
    }

    #[test]
    fn catalog_ids_are_unique_and_include_recommended_model() {
        let models = default_models();
        let mut ids = models.iter().map(|model| model.id.as_str()).collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();

        assert_eq!(ids.len(), models.len());
        assert!(ids.contains(&RECOMMENDED_MODEL));
    }
}
