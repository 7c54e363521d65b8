use serde_json::Value;
use std::sync::Arc;

use crate::{
    composer::{ComposedSchema, SchemaComposer},
    config::GatewayConfig,
    dispatcher::{DelegationError, Dispatcher, WiredField},
    ownership::OwnershipIndex,
    resolve_info::ResolveInfo,
    schema_registry::{BootstrapError, ServiceRegistry},
    transport::RequestContext,
};

pub struct FederationGateway {
    config: GatewayConfig,
    dispatcher: Dispatcher,
    wiring: Vec<WiredField>,
}

impl FederationGateway {
    // Any failure closes the transports opened so far.
    pub async fn bootstrap(
        config: GatewayConfig,
        composer: &dyn SchemaComposer,
    ) -> Result<Self, BootstrapError> {
        config.validate()?;
        let registry =
            ServiceRegistry::initialize_all(config.services.clone(), config.bootstrap_concurrency)
                .await?;
        Self::from_registry(config, registry, composer)
    }

    pub fn from_registry(
        config: GatewayConfig,
        registry: ServiceRegistry,
        composer: &dyn SchemaComposer,
    ) -> Result<Self, BootstrapError> {
        let built = OwnershipIndex::build(registry.services(), config.ownership_collisions)
            .map_err(BootstrapError::from)
            .and_then(|index| {
                let schema = composer.compose(registry.services())?;
                Ok((index, schema))
            });

        let (index, mut schema) = match built {
            Ok(built) => built,
            Err(error) => {
                registry.shutdown();
                return Err(error);
            }
        };

        let wiring = Dispatcher::wire(&mut schema, &index, &registry);
        tracing::info!(
            services = registry.len(),
            owned_types = index.owned_types().len(),
            delegations = wiring.len(),
            "gateway ready"
        );

        Ok(FederationGateway {
            config,
            dispatcher: Dispatcher::new(Arc::new(schema), Arc::new(index), Arc::new(registry)),
            wiring,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn schema(&self) -> &ComposedSchema {
        self.dispatcher.schema()
    }

    pub fn index(&self) -> &OwnershipIndex {
        self.dispatcher.index()
    }

    pub fn registry(&self) -> &ServiceRegistry {
        self.dispatcher.registry()
    }

    pub fn wiring(&self) -> &[WiredField] {
        &self.wiring
    }

    pub fn request_context(&self) -> RequestContext {
        match self.config.request_timeout() {
            Some(timeout) => RequestContext::new().with_timeout(timeout),
            None => RequestContext::new(),
        }
    }

    pub async fn resolve_field(
        &self,
        parent: &Value,
        ctx: &RequestContext,
        info: &ResolveInfo<'_, '_>,
    ) -> Result<Value, DelegationError> {
        self.dispatcher.resolve(parent, ctx, info).await
    }

    /// Closes every service transport. Later delegated calls fail as closed.
    pub fn shutdown(&self) {
        tracing::info!(services = self.registry().len(), "shutting down gateway");
        self.registry().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ServiceConfig,
        composer::SdlComposer,
        ownership::{CollisionPolicy, OwnershipError},
        resolve_info::OperationContext,
        testing::{RecordingTransport, runtime, runtime_with},
        transport::TransportError,
    };
    use graphql_parser::parse_query;
    use pretty_assertions::assert_eq;
    use serde_json::{Map, json};
    use std::time::Duration;

    #[test]
    fn collisions_abort_construction() {
        let registry = ServiceRegistry::from_runtimes(vec![
            runtime("a", "type User { id: ID }"),
            runtime("b", "type User { name: String }"),
        ]);

        let error = FederationGateway::from_registry(GatewayConfig::new(vec![]), registry, &SdlComposer)
            .err()
            .unwrap();

        assert!(matches!(
            error,
            BootstrapError::Ownership(OwnershipError::Conflict { .. })
        ));
    }

    #[test]
    fn last_wins_policy_is_taken_from_config() {
        let registry = ServiceRegistry::from_runtimes(vec![
            runtime("a", "type User { id: ID }"),
            runtime("b", "type User { id: ID name: String }"),
        ]);
        let mut config = GatewayConfig::new(vec![
            ServiceConfig::new("a", "http://a/graphql"),
            ServiceConfig::new("b", "http://b/graphql"),
        ]);
        config.ownership_collisions = CollisionPolicy::LastWins;

        let gateway = FederationGateway::from_registry(config, registry, &SdlComposer).unwrap();

        assert_eq!(gateway.index().owner_of("User"), Some("b"));
    }

    #[test]
    fn request_context_carries_the_configured_deadline() {
        let mut config = GatewayConfig::new(vec![]);
        config.request_timeout_msecs = Some(250);
        let gateway =
            FederationGateway::from_registry(config, ServiceRegistry::default(), &SdlComposer)
                .unwrap();

        assert_eq!(
            gateway.request_context().timeout(),
            Some(Duration::from_millis(250))
        );
        assert!(gateway.wiring().is_empty());
    }

    #[tokio::test]
    async fn resolves_through_the_wired_schema() {
        let transport = RecordingTransport::replying(vec![json!({ "data": { "me": "ada" } })]);
        let registry =
            ServiceRegistry::from_runtimes(vec![runtime_with("users", "type Query { me: String }", transport.clone())]);
        let gateway =
            FederationGateway::from_registry(GatewayConfig::new(vec![]), registry, &SdlComposer)
                .unwrap();
        let document = parse_query::<String>("{ me }").unwrap();
        let operation = OperationContext::from_document(&document, None, Map::new()).unwrap();

        let me = gateway
            .resolve_field(
                &Value::Null,
                &gateway.request_context(),
                &ResolveInfo::new("Query", operation.field_at(&["me"]).unwrap(), &operation),
            )
            .await
            .unwrap();

        assert_eq!(me, json!("ada"));
        assert_eq!(gateway.wiring().len(), 1);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn bootstrap_failure_names_the_service() {
        let config = GatewayConfig::new(vec![ServiceConfig::new(
            "unreachable",
            "http://127.0.0.1:9/graphql",
        )]);

        let error = FederationGateway::bootstrap(config, &SdlComposer)
            .await
            .err()
            .unwrap();

        assert!(matches!(
            &error,
            BootstrapError::Introspection { service, source: TransportError::Network(_) }
                if service == "unreachable"
        ));
    }
}
