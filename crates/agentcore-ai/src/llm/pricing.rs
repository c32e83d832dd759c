//! Model catalog: vanity aliases, canonical ids, provider ids, pricing and
//! context windows.
//!
//! Lookup is two-level. A vanity alias (`sonnet`) resolves to a canonical id
//! (`anthropic/claude-sonnet-4`), which owns the pricing row and the
//! provider-native id sent over the wire (`claude-sonnet-4-20250514`).

use std::collections::HashMap;

use agentcore_traits::Credits;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::llm::client::TokenUsage;

/// Context window assumed for models missing from the catalog.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 128_000;

/// Model id substrings of providers that accept full JSON Schema in tool
/// definitions.
const FULL_SCHEMA_MARKERS: &[&str] = &["claude", "anthropic", "gpt-4o", "gpt-4.1", "gpt-5"];

/// Pricing per 1 million tokens (USD).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
    #[serde(default)]
    pub cache_read_per_1m: Option<f64>,
    #[serde(default)]
    pub cache_write_per_1m: Option<f64>,
}

impl ModelPricing {
    pub const fn flat(input_per_1m: f64, output_per_1m: f64) -> Self {
        Self {
            input_per_1m,
            output_per_1m,
            cache_read_per_1m: None,
            cache_write_per_1m: None,
        }
    }

    pub fn with_cache(mut self, read_per_1m: f64, write_per_1m: f64) -> Self {
        self.cache_read_per_1m = Some(read_per_1m);
        self.cache_write_per_1m = Some(write_per_1m);
        self
    }

    /// Cost of one completion. Cached prompt tokens are billed at the cache
    /// rates when the model has them, otherwise at the input rate.
    pub fn cost(&self, usage: &TokenUsage) -> Credits {
        let cache_read = usage.cache_read_tokens as u64;
        let cache_write = usage.cache_write_tokens as u64;
        Credits::for_tokens(usage.prompt_tokens as u64, self.input_per_1m)
            + Credits::for_tokens(usage.completion_tokens as u64, self.output_per_1m)
            + Credits::for_tokens(
                cache_read,
                self.cache_read_per_1m.unwrap_or(self.input_per_1m),
            )
            + Credits::for_tokens(
                cache_write,
                self.cache_write_per_1m.unwrap_or(self.input_per_1m),
            )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub canonical_id: String,
    pub provider_id: String,
    pub pricing: ModelPricing,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_context_window() -> u32 {
    DEFAULT_CONTEXT_WINDOW
}

#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, ModelInfo>,
    aliases: HashMap<String, String>,
}

static BUILTIN: Lazy<ModelCatalog> = Lazy::new(|| {
    let rows = [
        (
            "openai/gpt-5",
            "gpt-5",
            ModelPricing::flat(1.25, 10.0).with_cache(0.125, 1.25),
            400_000,
            &["gpt5"][..],
        ),
        (
            "openai/gpt-5-mini",
            "gpt-5-mini",
            ModelPricing::flat(0.25, 2.0).with_cache(0.025, 0.25),
            400_000,
            &["gpt-5-mini-latest"][..],
        ),
        (
            "openai/gpt-4o",
            "gpt-4o",
            ModelPricing::flat(2.5, 10.0),
            128_000,
            &["4o"][..],
        ),
        (
            "openai/gpt-4.1",
            "gpt-4.1",
            ModelPricing::flat(2.0, 8.0),
            1_000_000,
            &[][..],
        ),
        (
            "anthropic/claude-sonnet-4",
            "claude-sonnet-4-20250514",
            ModelPricing::flat(3.0, 15.0).with_cache(0.3, 3.75),
            200_000,
            &["sonnet", "claude-sonnet-4"][..],
        ),
        (
            "anthropic/claude-opus-4",
            "claude-opus-4-20250514",
            ModelPricing::flat(15.0, 75.0).with_cache(1.5, 18.75),
            200_000,
            &["opus", "claude-opus-4"][..],
        ),
        (
            "anthropic/claude-haiku-4",
            "claude-haiku-4-5",
            ModelPricing::flat(1.0, 5.0).with_cache(0.1, 1.25),
            200_000,
            &["haiku", "claude-haiku-4"][..],
        ),
        (
            "deepseek/deepseek-chat",
            "deepseek-chat",
            ModelPricing::flat(0.27, 1.10),
            64_000,
            &["deepseek"][..],
        ),
        (
            "google/gemini-2.5-pro",
            "gemini-2.5-pro",
            ModelPricing::flat(1.25, 10.0),
            1_048_576,
            &["gemini-pro"][..],
        ),
        (
            "google/gemini-2.5-flash",
            "gemini-2.5-flash",
            ModelPricing::flat(0.30, 2.50),
            1_048_576,
            &["gemini-flash"][..],
        ),
    ];

    let mut catalog = ModelCatalog::new();
    for (canonical, provider_id, pricing, context_window, aliases) in rows {
        catalog.insert(ModelInfo {
            canonical_id: canonical.to_string(),
            provider_id: provider_id.to_string(),
            pricing,
            context_window,
            aliases: aliases.iter().map(|alias| alias.to_string()).collect(),
        });
    }
    catalog
});

fn normalize(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of the models known out of the box.
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// Add or replace a model. The provider id doubles as an alias.
    pub fn insert(&mut self, info: ModelInfo) {
        let canonical = normalize(&info.canonical_id);
        for alias in info.aliases.iter().chain(std::iter::once(&info.provider_id)) {
            self.aliases.insert(normalize(alias), canonical.clone());
        }
        self.models.insert(canonical, info);
    }

    pub fn with_model(mut self, info: ModelInfo) -> Self {
        self.insert(info);
        self
    }

    pub fn with_alias(mut self, alias: &str, canonical_id: &str) -> Self {
        self.aliases
            .insert(normalize(alias), normalize(canonical_id));
        self
    }

    pub fn resolve(&self, model: &str) -> Option<&ModelInfo> {
        let key = normalize(model);
        if let Some(info) = self.models.get(&key) {
            return Some(info);
        }
        self.aliases
            .get(&key)
            .and_then(|canonical| self.models.get(canonical))
    }

    /// Canonical id, or the input unchanged for unknown models.
    pub fn canonical_id(&self, model: &str) -> String {
        self.resolve(model)
            .map(|info| info.canonical_id.clone())
            .unwrap_or_else(|| model.to_string())
    }

    /// Id sent to the provider, or the input unchanged for unknown models.
    pub fn provider_id(&self, model: &str) -> String {
        self.resolve(model)
            .map(|info| info.provider_id.clone())
            .unwrap_or_else(|| model.to_string())
    }

    pub fn context_window(&self, model: &str) -> u32 {
        self.resolve(model)
            .map(|info| info.context_window)
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }

    pub fn pricing(&self, model: &str) -> Option<ModelPricing> {
        self.resolve(model).map(|info| info.pricing)
    }

    /// Cost of a completion. Unknown models cost nothing and are logged.
    pub fn cost_for(&self, model: &str, usage: &TokenUsage) -> Credits {
        match self.pricing(model) {
            Some(pricing) => pricing.cost(usage),
            None => {
                tracing::warn!(model, "No pricing for model, recording zero cost");
                Credits::ZERO
            }
        }
    }
}

/// Whether tool schemas can be sent to the model without sanitization.
pub fn supports_full_schema(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    FULL_SCHEMA_MARKERS.iter().any(|marker| lower.contains(marker))
}
