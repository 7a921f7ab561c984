use agentforge_core::{ForgeError, ForgeResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// A generated tool's declaration: agents reference tools by name; the
/// pipeline resolves names at validation time, so an unknown name is a
/// validation error rather than a runtime import failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    /// Workspace-relative path of the generated module.
    pub path: String,
    /// JSON schema of the tool's parameters.
    pub schema: serde_json::Value,
}

/// Typed registry of generated tools, declared by the tool-developer stage
/// and consulted by the agent-code validator.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolDeclaration>>,
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or re-declare) a tool.
    pub async fn declare(&self, declaration: ToolDeclaration) {
        debug!(tool = %declaration.name, path = %declaration.path, "Tool declared");
        let mut tools = self.tools.write().await;
        tools.insert(declaration.name.clone(), declaration);
    }

    /// Declare every tool in a batch.
    pub async fn declare_all(&self, declarations: Vec<ToolDeclaration>) {
        for declaration in declarations {
            self.declare(declaration).await;
        }
    }

    /// Resolve a tool by name.
    pub async fn resolve(&self, name: &str) -> ForgeResult<ToolDeclaration> {
        let tools = self.tools.read().await;
        tools
            .get(name)
            .cloned()
            .ok_or_else(|| ForgeError::Validation(format!("unknown tool name: {name}")))
    }

    /// Resolve a set of names, reporting the first unknown one.
    pub async fn resolve_all(&self, names: &[String]) -> ForgeResult<Vec<ToolDeclaration>> {
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            resolved.push(self.resolve(name).await?);
        }
        Ok(resolved)
    }

    /// Number of declared tools.
    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }

    /// Drop declarations whose path falls under the given prefix. Used when
    /// a restart clears a project's generated tools.
    pub async fn retract_under(&self, path_prefix: &str) {
        let mut tools = self.tools.write().await;
        tools.retain(|_, t| !t.path.starts_with(path_prefix));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decl(name: &str, path: &str) -> ToolDeclaration {
        ToolDeclaration {
            name: name.into(),
            path: path.into(),
            schema: json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn test_declare_and_resolve() {
        let registry = ToolRegistry::new();
        registry
            .declare(decl("fetch_forecast", "tools/generated_tools/w/api/fetch_forecast.py"))
            .await;
        let tool = registry.resolve("fetch_forecast").await.unwrap();
        assert!(tool.path.ends_with("fetch_forecast.py"));
    }

    #[tokio::test]
    async fn test_unknown_name_is_validation_error() {
        let registry = ToolRegistry::new();
        let err = registry.resolve("nope").await;
        assert!(matches!(err, Err(ForgeError::Validation(_))));
    }

    #[tokio::test]
    async fn test_resolve_all_reports_first_unknown() {
        let registry = ToolRegistry::new();
        registry.declare(decl("a", "tools/x/a.py")).await;
        let err = registry
            .resolve_all(&["a".into(), "missing".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_retract_under_prefix() {
        let registry = ToolRegistry::new();
        registry.declare(decl("a", "tools/generated_tools/p1/m/a.py")).await;
        registry.declare(decl("b", "tools/generated_tools/p2/m/b.py")).await;
        registry.retract_under("tools/generated_tools/p1").await;
        assert!(registry.resolve("a").await.is_err());
        assert!(registry.resolve("b").await.is_ok());
        assert_eq!(registry.len().await, 1);
    }
}
