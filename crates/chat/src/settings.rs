//! Keys of the flat settings map read and written by the chat core.
//!
//! Credential override keys live on [`parley_llm::Provider::settings_key`].

pub const SELECTED_MODEL_KEY: &str = "selectedModel";
pub const SYSTEM_PROMPT_KEY: &str = "systemPrompt";
