use std::collections::BTreeMap;

use beigebox_core::config::RouteConfig;
use serde::{Deserialize, Serialize};

/// The output of a routing stage. Ephemeral — never persisted directly;
/// the reasoning goes to the wire log.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Decision {
    /// Concrete model string to route to ("" = leave unchanged).
    pub model: String,
    pub needs_search: bool,
    pub needs_rag: bool,
    pub tools: Vec<String>,
    pub reasoning: String,
    pub confidence: f32,
    /// True when this is a default produced by a failure path.
    pub fallback: bool,
}

impl Decision {
    pub fn fallback(default_model: &str) -> Self {
        Self {
            model: default_model.to_string(),
            confidence: 0.0,
            fallback: true,
            ..Default::default()
        }
    }
}

/// Named routes resolving to concrete model strings.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: BTreeMap<String, RouteConfig>,
    default_model: String,
}

impl RouteTable {
    pub fn new(routes: BTreeMap<String, RouteConfig>, default_model: &str) -> Self {
        Self { routes, default_model: default_model.to_string() }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn route_names(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    pub fn descriptions(&self) -> Vec<(String, String, String)> {
        self.routes
            .iter()
            .map(|(name, cfg)| (name.clone(), cfg.model.clone(), cfg.description.clone()))
            .collect()
    }

    /// Resolve a route name to a model string.
    ///
    /// Unknown names that look like a literal model (contain ':' or '/')
    /// pass through; anything else falls back to the default model.
    pub fn resolve(&self, route_name: &str) -> String {
        if let Some(cfg) = self.routes.get(route_name) {
            return cfg.model.clone();
        }
        if route_name.contains(':') || route_name.contains('/') {
            return route_name.to_string();
        }
        self.default_model.clone()
    }

    /// Resolution for the centroid classifier's tier names: unknown tiers
    /// fall back through the binary fast/large aliases.
    pub fn resolve_tier(&self, tier: &str) -> String {
        if let Some(cfg) = self.routes.get(tier) {
            return cfg.model.clone();
        }
        let alias = match tier {
            "simple" => "fast",
            "complex" => "large",
            _ => return self.default_model.clone(),
        };
        self.routes
            .get(alias)
            .map(|cfg| cfg.model.clone())
            .unwrap_or_else(|| self.default_model.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        let mut routes = BTreeMap::new();
        routes.insert(
            "fast".to_string(),
            RouteConfig { model: "llama3.2:3b".to_string(), description: String::new() },
        );
        routes.insert(
            "code".to_string(),
            RouteConfig { model: "qwen2.5-coder:14b".to_string(), description: String::new() },
        );
        RouteTable::new(routes, "default-model")
    }

    #[test]
    fn known_routes_resolve_to_their_model() {
        assert_eq!(table().resolve("code"), "qwen2.5-coder:14b");
    }

    #[test]
    fn literal_model_strings_pass_through() {
        assert_eq!(table().resolve("mistral:7b"), "mistral:7b");
        assert_eq!(table().resolve("org/model"), "org/model");
    }

    #[test]
    fn unknown_plain_names_fall_back_to_default() {
        assert_eq!(table().resolve("nonsense"), "default-model");
    }

    #[test]
    fn tier_aliases_bridge_simple_to_fast() {
        assert_eq!(table().resolve_tier("simple"), "llama3.2:3b");
        assert_eq!(table().resolve_tier("complex"), "default-model"); // no "large" route
    }
}
