//! Persona templates: named prompt/model/parameter bundles.

use llm::ProviderKind;
use serde::{Deserialize, Serialize};

/// A process-wide persona template referenced by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// Registry key.
    pub name: String,
    /// Human-readable summary.
    pub description: String,
    /// System prompt injected ahead of the conversation.
    pub system_prompt: String,
    /// Provider used unless the caller overrides it.
    pub preferred_provider: ProviderKind,
    /// Model used unless the caller overrides it.
    pub preferred_model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Token budget per completion.
    pub max_tokens: usize,
    /// Capability tags advertised by agents wearing this persona.
    pub capabilities: Vec<String>,
}

impl Persona {
    /// Create a persona with mid-range sampling defaults.
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        preferred_provider: ProviderKind,
        preferred_model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            system_prompt: system_prompt.into(),
            preferred_provider,
            preferred_model: preferred_model.into(),
            temperature: 0.7,
            max_tokens: 2048,
            capabilities: Vec::new(),
        }
    }
}

/// The personas installed at startup.
pub fn default_personas() -> Vec<Persona> {
    vec![
        Persona {
            name: "general_assistant".to_string(),
            description: "General purpose AI assistant".to_string(),
            system_prompt: "You are a helpful AI assistant. Provide clear, accurate, and helpful responses.".to_string(),
            preferred_provider: ProviderKind::Remote,
            preferred_model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            capabilities: vec![
                "general_knowledge".to_string(),
                "conversation".to_string(),
                "problem_solving".to_string(),
            ],
        },
        Persona {
            name: "code_assistant".to_string(),
            description: "Specialized coding assistant".to_string(),
            system_prompt: "You are an expert software developer. Write clean, efficient, and well-documented code. Follow best practices and provide explanations for your solutions.".to_string(),
            preferred_provider: ProviderKind::Remote,
            preferred_model: "gpt-4o".to_string(),
            temperature: 0.3,
            max_tokens: 4096,
            capabilities: vec![
                "coding".to_string(),
                "debugging".to_string(),
                "code_review".to_string(),
                "architecture".to_string(),
            ],
        },
        Persona {
            name: "creative_writer".to_string(),
            description: "Creative writing and storytelling assistant".to_string(),
            system_prompt: "You are a creative writer with a vivid imagination. Create engaging stories, poems, and creative content.".to_string(),
            preferred_provider: ProviderKind::Local,
            preferred_model: "llama3".to_string(),
            temperature: 0.9,
            max_tokens: 2048,
            capabilities: vec![
                "creative_writing".to_string(),
                "storytelling".to_string(),
                "poetry".to_string(),
                "character_development".to_string(),
            ],
        },
        Persona {
            name: "analyst".to_string(),
            description: "Data analysis and research assistant".to_string(),
            system_prompt: "You are a data analyst and researcher. Provide detailed analysis, insights, and evidence-based recommendations.".to_string(),
            preferred_provider: ProviderKind::Remote,
            preferred_model: "gpt-4o".to_string(),
            temperature: 0.2,
            max_tokens: 3072,
            capabilities: vec![
                "data_analysis".to_string(),
                "research".to_string(),
                "critical_thinking".to_string(),
                "reporting".to_string(),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_personas_complete() {
        let personas = default_personas();
        let names: Vec<&str> = personas.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            ["general_assistant", "code_assistant", "creative_writer", "analyst"]
        );
        for persona in &personas {
            assert!(!persona.system_prompt.is_empty());
            assert!(persona.max_tokens > 0);
        }
    }

    #[test]
    fn test_creative_writer_prefers_local() {
        let personas = default_personas();
        let writer = personas.iter().find(|p| p.name == "creative_writer").unwrap();
        assert_eq!(writer.preferred_provider, ProviderKind::Local);
    }
}
