pub mod composer;
pub mod config;
pub mod dispatcher;
pub mod federation_gateway;
pub mod ownership;
pub mod query_builder;
pub mod resolve_info;
pub mod schema_registry;
pub mod selection_rewriter;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use composer::{ComposedSchema, SchemaComposer, SdlComposer};
pub use config::GatewayConfig;
pub use dispatcher::{Delegation, DelegationError, DelegationKind, Dispatcher, WiredField};
pub use federation_gateway::FederationGateway;
pub use ownership::{CollisionPolicy, OwnershipIndex};
pub use resolve_info::{OperationContext, OperationKind, ResolveInfo};
pub use schema_registry::{BootstrapError, ServiceRegistry, ServiceRuntime};
pub use transport::{HttpTransport, RequestContext, Transport, TransportError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_KEEP_ALIVE_MSECS: u64 = 1000;
pub const DEFAULT_MAX_FREE_SOCKETS: usize = 256;

/// Static description of one subgraph, as read from the gateway configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_keep_alive_msecs")]
    pub keep_alive_msecs: u64,
    /// Upper bound on concurrent in-flight requests. `None` means unbounded.
    #[serde(default)]
    pub max_sockets: Option<usize>,
    #[serde(default = "default_max_free_sockets")]
    pub max_free_sockets: usize,
    #[serde(default = "default_reject_unauthorized")]
    pub reject_unauthorized: bool,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        ServiceConfig {
            name: name.into(),
            url: url.into(),
            keep_alive_msecs: DEFAULT_KEEP_ALIVE_MSECS,
            max_sockets: None,
            max_free_sockets: DEFAULT_MAX_FREE_SOCKETS,
            reject_unauthorized: true,
        }
    }
}

fn default_keep_alive_msecs() -> u64 {
    DEFAULT_KEEP_ALIVE_MSECS
}

fn default_max_free_sockets() -> usize {
    DEFAULT_MAX_FREE_SOCKETS
}

fn default_reject_unauthorized() -> bool {
    true
}

/// Body of every request sent to a subgraph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubgraphRequest {
    pub query: String,
    pub variables: Map<String, Value>,
    #[serde(skip)]
    pub operation_name: Option<String>,
}

impl SubgraphRequest {
    pub fn new(query: impl Into<String>) -> Self {
        SubgraphRequest {
            query: query.into(),
            variables: Map::new(),
            operation_name: None,
        }
    }
}

/// An error entry of a GraphQL response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl std::fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResponse {
    /// Walks `data` along `path`, where numeric segments index into lists.
    pub fn data_at(&self, path: &[&str]) -> Option<&Value> {
        let mut current = self.data.as_ref()?;
        for segment in path {
            current = match current {
                Value::Object(map) => map.get(*segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn service_config_defaults() {
        let config: ServiceConfig =
            serde_json::from_value(json!({ "name": "users", "url": "http://users/graphql" }))
                .unwrap();

        assert_eq!(config, ServiceConfig::new("users", "http://users/graphql"));
    }

    #[test]
    fn request_body_only_carries_query_and_variables() {
        let mut request = SubgraphRequest::new("query ServiceInfo { _service { sdl } }");
        request.operation_name = Some("ServiceInfo".to_string());

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "query": "query ServiceInfo { _service { sdl } }", "variables": {} })
        );
    }

    #[test]
    fn data_at_walks_objects_and_lists() {
        let response: GraphQLResponse = serde_json::from_value(json!({
            "data": { "_entities": [{ "product": { "name": "Lamp" } }] }
        }))
        .unwrap();

        assert_eq!(
            response.data_at(&["_entities", "0", "product"]),
            Some(&json!({ "name": "Lamp" }))
        );
        assert_eq!(response.data_at(&["_entities", "1"]), None);
        assert!(response.errors.is_empty());
    }
}
