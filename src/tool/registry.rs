// Aglogen Assistant — Tool registry

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;

use super::ToolDefinition;

/// Catalog of tools keyed by name. Cloning yields another handle onto the
/// same catalog.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<BTreeMap<String, Arc<ToolDefinition>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry. Every call returns a handle onto the same
    /// catalog; request handlers should still receive it by injection.
    pub fn global() -> ToolRegistry {
        static GLOBAL: OnceLock<ToolRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ToolRegistry::new).clone()
    }

    /// Whether two handles point at the same catalog.
    pub fn same_as(&self, other: &ToolRegistry) -> bool {
        Arc::ptr_eq(&self.tools, &other.tools)
    }

    /// Insert a tool, replacing any previous tool with the same name.
    pub async fn register(&self, tool: ToolDefinition) {
        let name = tool.name.clone();
        let mut tools = self.tools.write().await;
        if tools.contains_key(&name) {
            tracing::warn!(tool = %name, "Tool already registered, overwriting");
        }
        tools.insert(name.clone(), Arc::new(tool));
        tracing::debug!(tool = %name, "Registered tool");
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.tools.write().await.remove(name).is_some();
        if removed {
            tracing::debug!(tool = %name, "Unregistered tool");
        }
        removed
    }

    pub async fn get_tool(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn get_all_tools(&self) -> Vec<Arc<ToolDefinition>> {
        self.tools.read().await.values().cloned().collect()
    }

    pub async fn get_tools_by_category(&self, category: &str) -> Vec<Arc<ToolDefinition>> {
        self.tools
            .read()
            .await
            .values()
            .filter(|t| t.category == category)
            .cloned()
            .collect()
    }

    /// Distinct categories, sorted.
    pub async fn get_categories(&self) -> Vec<String> {
        let tools = self.tools.read().await;
        let set: BTreeSet<&str> = tools.values().map(|t| t.category.as_str()).collect();
        set.into_iter().map(str::to_string).collect()
    }

    async fn filtered(&self, categories: Option<&[&str]>) -> Vec<Arc<ToolDefinition>> {
        let tools = self.tools.read().await;
        tools
            .values()
            .filter(|t| categories.map_or(true, |cats| cats.contains(&t.category.as_str())))
            .cloned()
            .collect()
    }

    pub async fn to_anthropic_format(&self, categories: Option<&[&str]>) -> Vec<Value> {
        self.filtered(categories)
            .await
            .iter()
            .map(|t| t.to_anthropic_format())
            .collect()
    }

    pub async fn to_openai_format(&self, categories: Option<&[&str]>) -> Vec<Value> {
        self.filtered(categories)
            .await
            .iter()
            .map(|t| t.to_openai_format())
            .collect()
    }

    pub async fn clear(&self) {
        self.tools.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn names(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{Arguments, HandlerOutput, ToolFailure};
    use serde_json::json;

    fn def(name: &str, description: &str, category: &str) -> ToolDefinition {
        ToolDefinition::new(
            name,
            description,
            json!({"type": "object", "properties": {}, "required": []}),
            |_args: Arguments| async move { Ok::<_, ToolFailure>(HandlerOutput::Data(json!({}))) },
        )
        .with_category(category)
    }

    #[tokio::test]
    async fn test_register_overwrites() {
        let registry = ToolRegistry::new();
        registry.register(def("a", "first", "utility")).await;
        registry.register(def("a", "second", "utility")).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get_tool("a").await.unwrap().description, "second");
    }

    #[tokio::test]
    async fn test_unregister_and_contains() {
        let registry = ToolRegistry::new();
        registry.register(def("a", "x", "utility")).await;
        assert!(registry.contains("a").await);
        assert!(registry.unregister("a").await);
        assert!(!registry.unregister("a").await);
        assert!(registry.get_tool("a").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_categories_and_filters() {
        let registry = ToolRegistry::new();
        registry.register(def("run", "r", "simulation")).await;
        registry.register(def("list", "l", "utility")).await;
        registry.register(def("peek", "p", "utility")).await;

        assert_eq!(registry.get_categories().await, vec!["simulation", "utility"]);
        assert_eq!(registry.get_tools_by_category("utility").await.len(), 2);
        assert!(registry.get_tools_by_category("nope").await.is_empty());

        let only_sim = registry.to_openai_format(Some(&["simulation"])).await;
        assert_eq!(only_sim.len(), 1);
        assert_eq!(only_sim[0]["function"]["name"], "run");
        assert_eq!(registry.to_anthropic_format(None).await.len(), 3);
    }

    #[tokio::test]
    async fn test_formats_agree() {
        let registry = ToolRegistry::new();
        registry.register(def("a", "x", "utility")).await;
        registry.register(def("b", "y", "analysis")).await;
        let anthropic = registry.to_anthropic_format(None).await;
        let openai = registry.to_openai_format(None).await;
        for (a, o) in anthropic.iter().zip(openai.iter()) {
            assert_eq!(a["name"], o["function"]["name"]);
            assert_eq!(a["input_schema"], o["function"]["parameters"]);
        }
    }

    #[tokio::test]
    async fn test_clear() {
        let registry = ToolRegistry::new();
        registry.register(def("a", "x", "utility")).await;
        registry.clear().await;
        assert_eq!(registry.len().await, 0);
    }

    #[test]
    fn test_global_identity() {
        let a = ToolRegistry::global();
        let b = ToolRegistry::global();
        assert!(a.same_as(&b));
        assert!(!a.same_as(&ToolRegistry::new()));
    }
}
