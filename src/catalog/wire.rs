//! `GET /models` wire shapes and their mapping onto [`ModelInfo`].

use super::{Capability, ModelInfo, Pricing};
use serde::Deserialize;
use std::collections::BTreeSet;

#[derive(Debug, Deserialize)]
pub(crate) struct ModelsEnvelope {
    #[serde(default)]
    pub data: Vec<ModelWire>,
}

impl ModelsEnvelope {
    pub fn into_models(self) -> Vec<ModelInfo> {
        self.data.into_iter().map(ModelInfo::from).collect()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelWire {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    pricing: Option<PricingWire>,
    #[serde(default)]
    context_length: Option<u64>,
    #[serde(default)]
    architecture: Option<ArchitectureWire>,
    #[serde(default)]
    top_provider: Option<TopProviderWire>,
    #[serde(default)]
    supported_parameters: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PricingWire {
    #[serde(default)]
    prompt: Option<serde_json::Value>,
    #[serde(default)]
    completion: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ArchitectureWire {
    #[serde(default)]
    modality: Option<String>,
    #[serde(default)]
    input_modalities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TopProviderWire {
    #[serde(default)]
    max_completion_tokens: Option<u64>,
}

/// Prices arrive as decimal strings; anything unreadable becomes [`Pricing::UNKNOWN`].
fn price(v: Option<&serde_json::Value>) -> f64 {
    let parsed = match v {
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        _ => None,
    };
    parsed.filter(|p| p.is_finite()).unwrap_or(Pricing::UNKNOWN)
}

fn clamp_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

impl From<ModelWire> for ModelInfo {
    fn from(w: ModelWire) -> Self {
        let mut capabilities = BTreeSet::from([Capability::Streaming]);
        if w.supported_parameters.iter().any(|p| p == "tools") {
            capabilities.insert(Capability::FunctionCalling);
        }
        let vision = w.architecture.as_ref().is_some_and(|a| {
            let input_side = a
                .modality
                .as_deref()
                .map(|m| m.split("->").next().unwrap_or(m))
                .unwrap_or("");
            input_side.contains("image") || a.input_modalities.iter().any(|m| m == "image")
        });
        if vision {
            capabilities.insert(Capability::Vision);
        }

        let provider = match w.id.split_once('/') {
            Some((prefix, _)) => prefix.to_string(),
            None => String::new(),
        };
        let pricing = Pricing {
            prompt: price(w.pricing.as_ref().and_then(|p| p.prompt.as_ref())),
            completion: price(w.pricing.as_ref().and_then(|p| p.completion.as_ref())),
        };

        ModelInfo {
            name: w.name.filter(|n| !n.is_empty()).unwrap_or_else(|| w.id.clone()),
            id: w.id,
            provider,
            context_length: w.context_length.map(clamp_u32).unwrap_or(0),
            pricing,
            capabilities,
            max_tokens: w
                .top_provider
                .and_then(|t| t.max_completion_tokens)
                .map(clamp_u32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{
      "data": [
        {
          "id": "openai/gpt-4o-mini",
          "name": "OpenAI: GPT-4o-mini",
          "pricing": {"prompt": "0.00000015", "completion": "0.0000006", "image": "0.007225"},
          "context_length": 128000,
          "architecture": {"modality": "text+image->text", "tokenizer": "GPT"},
          "top_provider": {"context_length": 128000, "max_completion_tokens": 16384},
          "supported_parameters": ["tools", "tool_choice", "temperature"]
        },
        {
          "id": "meta-llama/llama-3-8b-instruct",
          "name": "",
          "pricing": {"prompt": "0.00000006", "completion": "0.00000006"},
          "context_length": 8192,
          "architecture": {"modality": "text->text", "tokenizer": "Llama3"}
        },
        {
          "id": "openrouter/auto",
          "pricing": {"prompt": "-1", "completion": "n/a"}
        }
      ]
    }"#;

    fn parse() -> Vec<ModelInfo> {
        serde_json::from_str::<ModelsEnvelope>(BODY).unwrap().into_models()
    }

    #[test]
    fn maps_capabilities_and_pricing() {
        let models = parse();
        let gpt = &models[0];
        assert_eq!(gpt.provider, "openai");
        assert_eq!(gpt.context_length, 128_000);
        assert_eq!(gpt.max_tokens, Some(16_384));
        assert!((gpt.pricing.prompt - 0.000_000_15).abs() < 1e-15);
        assert!(gpt.supports(Capability::Vision));
        assert!(gpt.supports(Capability::FunctionCalling));
        assert!(gpt.supports(Capability::Streaming));

        let llama = &models[1];
        assert_eq!(llama.name, "meta-llama/llama-3-8b-instruct");
        assert!(!llama.supports(Capability::Vision));
        assert!(!llama.supports(Capability::FunctionCalling));
        assert_eq!(llama.max_tokens, None);
    }

    #[test]
    fn unreadable_prices_are_unknown() {
        let auto = &parse()[2];
        assert!(!auto.pricing.is_known());
        assert_eq!(auto.context_length, 0);
        assert_eq!(auto.provider, "openrouter");
    }

    #[test]
    fn output_only_image_modality_is_not_vision() {
        let body = r#"{"data":[{"id":"x/painter","architecture":{"modality":"text->image"}}]}"#;
        let models = serde_json::from_str::<ModelsEnvelope>(body).unwrap().into_models();
        assert!(!models[0].supports(Capability::Vision));
    }
}
