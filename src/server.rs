//! MCP server surface: PML presents as a single tool provider exposing the
//! two meta-tools `pml.discover` and `pml.execute`. Calls to any other
//! `provider:name` tool round-trip through the gateway, so upstream tools
//! stay reachable behind the one connection.

use crate::error::PmlError;
use crate::runtime::{DiscoverRequest, DiscoverResponse, ExecuteRequest, PmlRuntime};
use crate::workflow::ResultBundle;
use rmcp::{
    handler::server::tool::{ToolCallContext, ToolRouter},
    handler::server::wrapper::Parameters,
    handler::server::ServerHandler,
    model::{Implementation, InitializeRequestParam, InitializeResult, ServerCapabilities},
    service::{RequestContext, RoleServer},
    tool, Json, ServiceExt,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const PASSTHROUGH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct PmlServer {
    runtime: Arc<PmlRuntime>,
    tool_router: ToolRouter<Self>,
}

#[rmcp::tool_router(router = tool_router)]
impl PmlServer {
    pub fn new(runtime: Arc<PmlRuntime>) -> Self {
        Self {
            runtime,
            tool_router: Self::tool_router(),
        }
    }

    pub fn runtime(&self) -> &Arc<PmlRuntime> {
        &self.runtime
    }

    #[tool(
        name = "pml.discover",
        description = "Find the best tool or capability for a natural-language intent. Returns a ranked list mixing dense similarity with the learned capability score."
    )]
    pub async fn discover_tool(
        &self,
        params: Parameters<DiscoverRequest>,
    ) -> Result<Json<DiscoverResponse>, String> {
        self.runtime
            .discover(&params.0)
            .await
            .map(Json)
            .map_err(|e| serde_json::to_string(&e.to_wire(None)).unwrap_or_else(|_| e.to_string()))
    }

    #[tool(
        name = "pml.execute",
        description = "Execute a workflow of tool calls with dependency-ordered parallel layers. Input is either {intent} (planned into a workflow) or {workflow: {tasks: [...]}}. Outputs thread between tasks via $OUTPUT[task-id] references."
    )]
    pub async fn execute_tool(
        &self,
        params: Parameters<ExecuteRequest>,
    ) -> Result<Json<ResultBundle>, String> {
        self.runtime
            .execute(&params.0)
            .await
            .map(Json)
            .map_err(|e| serde_json::to_string(&e.to_wire(None)).unwrap_or_else(|_| e.to_string()))
    }

    pub async fn run(self) -> anyhow::Result<()> {
        eprintln!("PML meta-tool server ready (stdio transport)");
        let transport = (tokio::io::stdin(), tokio::io::stdout());
        self.serve(transport).await?.waiting().await?;
        Ok(())
    }
}

impl ServerHandler for PmlServer {
    async fn list_tools(
        &self,
        _request: Option<rmcp::model::PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<rmcp::model::ListToolsResult, rmcp::ErrorData> {
        Ok(rmcp::model::ListToolsResult {
            meta: None,
            tools: self.tool_router.list_all(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: rmcp::model::CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<rmcp::model::CallToolResult, rmcp::ErrorData> {
        if self.tool_router.has_route(&request.name) {
            let tool_context = ToolCallContext::new(self, request, context);
            return self.tool_router.call(tool_context).await;
        }

        // `provider:name` round-trips to the upstream through the gateway.
        if request.name.contains(':') {
            let Some(gateway) = self.runtime.gateway() else {
                return Err(rmcp::ErrorData::internal_error(
                    "no gateway configured".to_string(),
                    None,
                ));
            };
            let arguments = request
                .arguments
                .map(Value::Object)
                .unwrap_or(Value::Null);
            return match gateway
                .call(&request.name, arguments, PASSTHROUGH_TIMEOUT)
                .await
            {
                Ok(output) => {
                    let text = serde_json::to_string_pretty(&output)
                        .unwrap_or_else(|_| output.to_string());
                    Ok(rmcp::model::CallToolResult {
                        content: vec![rmcp::model::Content::text(text)],
                        structured_content: Some(output),
                        is_error: None,
                        meta: None,
                    })
                }
                Err(err) => Err(to_rpc_error(err)),
            };
        }

        Err(rmcp::ErrorData::method_not_found::<
            rmcp::model::CallToolRequestMethod,
        >())
    }

    async fn initialize(
        &self,
        request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, rmcp::ErrorData> {
        Ok(InitializeResult {
            protocol_version: request.protocol_version,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "pml".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("PML Procedural Memory Layer".to_string()),
                description: None,
                icons: None,
                website_url: Some("https://github.com/casys-ai/pml".to_string()),
            },
            instructions: Some(
                "Call pml.discover with an intent to find tools/capabilities, then \
                 pml.execute with an intent or an explicit workflow to run them."
                    .to_string(),
            ),
        })
    }
}

fn to_rpc_error(err: PmlError) -> rmcp::ErrorData {
    let wire = err.to_wire(None);
    let message = format!("{}: {}", wire.kind, wire.message);
    match err {
        PmlError::InvalidArgument { .. } => rmcp::ErrorData::invalid_params(message, wire.details),
        _ => rmcp::ErrorData::internal_error(message, wire.details),
    }
}
