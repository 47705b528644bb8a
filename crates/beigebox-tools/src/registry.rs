use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use beigebox_core::config::BeigeBoxConfig;
use beigebox_vector::VectorIndex;
use tracing::{info, warn};

use crate::notifier::ToolNotifier;
use crate::Tool;

/// Flat name→tool namespace shared by built-ins and script plugins.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    notifier: ToolNotifier,
}

impl ToolRegistry {
    /// Build the registry from config. Disabled tools are simply absent.
    pub fn from_config(cfg: &BeigeBoxConfig, vector: Option<Arc<VectorIndex>>) -> Self {
        let mut registry = Self {
            tools: BTreeMap::new(),
            notifier: ToolNotifier::new(&cfg.tools.webhook_url),
        };

        if !cfg.tools.enabled {
            info!("tools disabled globally");
            return registry;
        }

        // No-dependency built-ins default to enabled
        registry.register(Arc::new(crate::calculator::CalculatorTool));
        registry.register(Arc::new(crate::datetime::DateTimeTool));

        if cfg.tools.web_search.enabled {
            registry.register(Arc::new(crate::web_search::WebSearchTool::new(
                &cfg.tools.web_search.endpoint,
                cfg.tools.web_search.max_results,
            )));
        }

        if cfg.tools.memory.enabled {
            if let Some(vector) = vector {
                registry.register(Arc::new(crate::memory::MemoryTool::new(
                    vector,
                    cfg.tools.memory.max_results,
                    cfg.tools.memory.min_score,
                )));
            }
        }

        if cfg.tools.plugins.enabled {
            for tool in crate::script::load_script_tools(
                std::path::Path::new(&cfg.tools.plugins.path),
                &cfg.tools.plugins.disabled,
            ) {
                registry.register(tool.into());
            }
        }

        info!(tools = ?registry.list(), "tool registry loaded");
        registry
    }

    /// Empty registry for tests and disabled configurations.
    pub fn empty() -> Self {
        Self { tools: BTreeMap::new(), notifier: ToolNotifier::new("") }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Name → description pairs for prompt blocks.
    pub fn descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect()
    }

    /// Run a tool by name. `None` when the name is not registered.
    /// Fires the webhook notifier best-effort on every invocation.
    pub async fn run_tool(&self, name: &str, input: &str) -> Option<String> {
        let tool = match self.tools.get(name) {
            Some(t) => t,
            None => {
                warn!(name, "tool not found in registry");
                return None;
            }
        };

        let start = Instant::now();
        let result = tool.run(input).await;
        let elapsed_ms = start.elapsed().as_millis() as f64;

        self.notifier.notify(name, input, &result, elapsed_ms);
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        async fn run(&self, input: &str) -> String {
            format!("echo: {input}")
        }
    }

    #[tokio::test]
    async fn run_tool_dispatches_by_name() {
        let mut registry = ToolRegistry::empty();
        registry.register(Arc::new(Echo));

        assert_eq!(registry.run_tool("echo", "hi").await.as_deref(), Some("echo: hi"));
        assert_eq!(registry.run_tool("missing", "hi").await, None);
        assert_eq!(registry.list(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn default_config_registers_no_dependency_builtins() {
        let cfg = beigebox_core::config::BeigeBoxConfig::default();
        let registry = ToolRegistry::from_config(&cfg, None);
        let names = registry.list();
        assert!(names.contains(&"calculator".to_string()));
        assert!(names.contains(&"datetime".to_string()));
        // web_search needs explicit enablement; memory needs a vector index
        assert!(!names.contains(&"web_search".to_string()));
        assert!(!names.contains(&"memory".to_string()));
    }
}
