//! Tool-call dispatch: a name → handler table consulted when the remote model
//! asks for a function call. The session relays the result verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A function call requested by the remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// The response relayed back for a [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub response: Value,
}

/// Schema advertised to the remote endpoint when the session is set up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// A single tool. Synchronous from the session's point of view.
pub trait ToolHandler: Send + Sync {
    fn declaration(&self) -> ToolDeclaration;

    fn call(&self, args: &Value) -> Result<Value, String>;
}

struct FnTool<F> {
    declaration: ToolDeclaration,
    func: F,
}

impl<F> ToolHandler for FnTool<F>
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync,
{
    fn declaration(&self) -> ToolDeclaration {
        self.declaration.clone()
    }

    fn call(&self, args: &Value) -> Result<Value, String> {
        (self.func)(args)
    }
}

/// Registered tools keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its declared name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.declaration().name;
        if self.tools.insert(name.clone(), handler).is_some() {
            warn!(target: "parley::voice", tool = %name, "tool handler replaced");
        }
    }

    /// Register a closure as a tool.
    pub fn register_fn<F>(&mut self, declaration: ToolDeclaration, func: F)
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnTool { declaration, func }));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Declarations of every registered tool, sorted by name.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut decls: Vec<_> = self.tools.values().map(|t| t.declaration()).collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    /// Run the named tool. Unknown names and handler failures become an
    /// `{"error": ...}` response so the remote side can recover.
    pub fn dispatch(&self, call: &ToolCall) -> ToolResult {
        let response = match self.tools.get(&call.name) {
            Some(handler) => match handler.call(&call.args) {
                Ok(value) => {
                    debug!(target: "parley::voice", tool = %call.name, id = %call.id, "tool call completed");
                    value
                }
                Err(e) => {
                    warn!(target: "parley::voice", tool = %call.name, id = %call.id, "tool call failed: {}", e);
                    json!({ "error": e })
                }
            },
            None => {
                warn!(target: "parley::voice", tool = %call.name, "unknown tool requested");
                json!({ "error": format!("unknown tool: {}", call.name) })
            }
        };
        ToolResult {
            id: call.id.clone(),
            name: call.name.clone(),
            response,
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}
