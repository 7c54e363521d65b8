use futures::stream::{self, StreamExt, TryStreamExt};
use graphql_parser::{
    parse_query, parse_schema,
    query::{Definition as QueryDefinition, OperationDefinition, Selection, Value as AstValue},
    schema::{Definition, Directive, Field as SchemaField, TypeDefinition, TypeExtension},
};
use serde_json::{Map, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    GraphQLError, GraphQLResponse, ServiceConfig, SubgraphRequest,
    composer::ComposeError,
    config::ConfigError,
    ownership::OwnershipError,
    transport::{HttpTransport, RequestContext, Transport, TransportError},
};

pub const INTROSPECTION_OPERATION: &str = "ServiceInfo";
pub const INTROSPECTION_QUERY: &str = "query ServiceInfo { _service { sdl } }";

/// Type name to the set of field names a subgraph declares on it.
pub type TypeMap = HashMap<String, HashSet<String>>;

#[derive(thiserror::Error, Debug)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to create transport for service '{service}': {source}")]
    Transport {
        service: String,
        source: TransportError,
    },
    #[error("introspection of service '{service}' failed: {source}")]
    Introspection {
        service: String,
        source: TransportError,
    },
    #[error("service '{service}' did not return `_service.sdl`{}", format_errors(.errors))]
    MissingSdl {
        service: String,
        errors: Vec<GraphQLError>,
    },
    #[error("service '{service}' returned an invalid SDL: {source}")]
    InvalidSdl {
        service: String,
        source: graphql_parser::schema::ParseError,
    },
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
}

fn format_errors(errors: &[GraphQLError]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let messages: Vec<&str> = errors.iter().map(|error| error.message.as_str()).collect();
    format!(": {}", messages.join("; "))
}

pub(crate) fn is_root_type(type_name: &str) -> bool {
    matches!(type_name, "Query" | "Mutation" | "Subscription")
}

/// Federation plumbing (`_Service`, `_Any`, `_entities`, ...) never takes part in ownership.
fn is_federation_internal(name: &str) -> bool {
    name.starts_with('_')
}

/// A bootstrapped subgraph: its descriptor, connection pool and declared shape.
pub struct ServiceRuntime {
    config: ServiceConfig,
    transport: Arc<dyn Transport>,
    sdl: String,
    type_map: TypeMap,
    extensions: TypeMap,
    externals: TypeMap,
    entity_keys: HashMap<String, Vec<String>>,
}

struct SubgraphShape {
    type_map: TypeMap,
    extensions: TypeMap,
    externals: TypeMap,
    entity_keys: HashMap<String, Vec<String>>,
}

impl std::fmt::Debug for ServiceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRuntime")
            .field("name", &self.config.name)
            .field("url", &self.config.url)
            .field("type_map", &self.type_map)
            .finish_non_exhaustive()
    }
}

impl ServiceRuntime {
    /// Fetches the subgraph SDL with the `ServiceInfo` query and builds the runtime from it.
    pub async fn introspect(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BootstrapError> {
        tracing::debug!(service = %config.name, url = %config.url, "introspecting service");

        let request = SubgraphRequest {
            query: INTROSPECTION_QUERY.to_string(),
            variables: Map::new(),
            operation_name: Some(INTROSPECTION_OPERATION.to_string()),
        };

        let response: GraphQLResponse = transport
            .execute(&request, &RequestContext::new())
            .await
            .map_err(|source| BootstrapError::Introspection {
                service: config.name.clone(),
                source,
            })?;

        let sdl = match response.data_at(&["_service", "sdl"]) {
            Some(Value::String(sdl)) => sdl.clone(),
            _ => {
                return Err(BootstrapError::MissingSdl {
                    service: config.name,
                    errors: response.errors,
                });
            }
        };

        let runtime = Self::from_sdl(config, transport, sdl)?;
        tracing::info!(
            service = %runtime.name(),
            types = runtime.type_map.len(),
            "service initialized"
        );
        Ok(runtime)
    }

    pub fn from_sdl(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
        sdl: String,
    ) -> Result<Self, BootstrapError> {
        let shape = Self::shape_of(&config.name, &sdl)?;

        Ok(ServiceRuntime {
            config,
            transport,
            sdl,
            type_map: shape.type_map,
            extensions: shape.extensions,
            externals: shape.externals,
            entity_keys: shape.entity_keys,
        })
    }

    fn shape_of(service: &str, sdl: &str) -> Result<SubgraphShape, BootstrapError> {
        let document =
            parse_schema::<String>(sdl).map_err(|source| BootstrapError::InvalidSdl {
                service: service.to_string(),
                source,
            })?;

        let mut shape = SubgraphShape {
            type_map: TypeMap::new(),
            extensions: TypeMap::new(),
            externals: TypeMap::new(),
            entity_keys: HashMap::new(),
        };

        for definition in &document.definitions {
            match definition {
                Definition::TypeDefinition(TypeDefinition::Object(object)) => {
                    record_fields(
                        &mut shape.type_map,
                        &object.name,
                        object.fields.iter().map(|field| &field.name),
                    );
                    record_keys(&mut shape.entity_keys, &object.name, &object.directives);
                }
                Definition::TypeDefinition(TypeDefinition::Interface(interface)) => {
                    record_fields(
                        &mut shape.type_map,
                        &interface.name,
                        interface.fields.iter().map(|field| &field.name),
                    );
                    record_keys(
                        &mut shape.entity_keys,
                        &interface.name,
                        &interface.directives,
                    );
                }
                Definition::TypeDefinition(TypeDefinition::Union(union)) => {
                    record_fields(&mut shape.type_map, &union.name, std::iter::empty());
                }
                // Query and Mutation are split per field, so their extensions count as declarations.
                Definition::TypeExtension(TypeExtension::Object(extension))
                    if matches!(extension.name.as_str(), "Query" | "Mutation") =>
                {
                    record_fields(
                        &mut shape.type_map,
                        &extension.name,
                        extension.fields.iter().map(|field| &field.name),
                    );
                }
                Definition::TypeExtension(TypeExtension::Object(extension)) => {
                    shape.record_extension(&extension.name, &extension.fields);
                    record_keys(
                        &mut shape.entity_keys,
                        &extension.name,
                        &extension.directives,
                    );
                }
                Definition::TypeExtension(TypeExtension::Interface(extension)) => {
                    shape.record_extension(&extension.name, &extension.fields);
                    record_keys(
                        &mut shape.entity_keys,
                        &extension.name,
                        &extension.directives,
                    );
                }
                _ => {}
            }
        }

        Ok(shape)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn sdl(&self) -> &str {
        &self.sdl
    }

    pub fn type_map(&self) -> &TypeMap {
        &self.type_map
    }

    pub fn extensions(&self) -> &TypeMap {
        &self.extensions
    }

    /// Top-level `@key` field names per type, from definitions and extensions.
    pub fn entity_keys(&self) -> &HashMap<String, Vec<String>> {
        &self.entity_keys
    }

    pub fn owns_field(&self, type_name: &str, field_name: &str) -> bool {
        self.type_map
            .get(type_name)
            .is_some_and(|fields| fields.contains(field_name))
    }

    /// True for fields this service adds to a type owned elsewhere.
    pub fn contributes_field(&self, type_name: &str, field_name: &str) -> bool {
        self.extensions
            .get(type_name)
            .is_some_and(|fields| fields.contains(field_name))
    }

    /// True when the field is a key this service declares on its stub of an entity.
    pub fn serves_key_field(&self, type_name: &str, field_name: &str) -> bool {
        let is_key = self
            .entity_keys
            .get(type_name)
            .is_some_and(|keys| keys.iter().any(|key| key == field_name));
        let declared = self.owns_field(type_name, field_name)
            || [&self.extensions, &self.externals].iter().any(|map| {
                map.get(type_name)
                    .is_some_and(|fields| fields.contains(field_name))
            });
        is_key && declared
    }

    pub fn knows_type(&self, type_name: &str) -> bool {
        self.type_map.contains_key(type_name)
            || self.extensions.contains_key(type_name)
            || self.externals.contains_key(type_name)
            || self.entity_keys.contains_key(type_name)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn execute(
        &self,
        request: &SubgraphRequest,
        ctx: &RequestContext,
    ) -> Result<GraphQLResponse, TransportError> {
        self.transport.execute(request, ctx).await
    }

    pub fn close(&self) {
        tracing::debug!(service = %self.name(), "closing transport");
        self.transport.close();
    }
}

impl SubgraphShape {
    fn record_extension<'a>(&mut self, type_name: &str, fields: &[SchemaField<'a, String>]) {
        let (external, contributed): (Vec<_>, Vec<_>) = fields.iter().partition(|field| {
            field
                .directives
                .iter()
                .any(|directive| directive.name == "external")
        });
        record_fields(
            &mut self.externals,
            type_name,
            external.into_iter().map(|field| &field.name),
        );
        record_fields(
            &mut self.extensions,
            type_name,
            contributed.into_iter().map(|field| &field.name),
        );
    }
}

fn record_fields<'a>(
    map: &mut TypeMap,
    type_name: &str,
    fields: impl Iterator<Item = &'a String>,
) {
    if is_federation_internal(type_name) {
        return;
    }
    let root = is_root_type(type_name);
    let entry = map.entry(type_name.to_string()).or_default();
    for field in fields {
        if root && is_federation_internal(field) {
            continue;
        }
        entry.insert(field.clone());
    }
}

fn record_keys<'a>(
    keys: &mut HashMap<String, Vec<String>>,
    type_name: &str,
    directives: &[Directive<'a, String>],
) {
    for directive in directives.iter().filter(|directive| directive.name == "key") {
        let fields = directive
            .arguments
            .iter()
            .find(|(name, _)| name == "fields")
            .and_then(|(_, value)| match value {
                AstValue::String(fields) => Some(fields.as_str()),
                _ => None,
            });

        if let Some(fields) = fields {
            let entry = keys.entry(type_name.to_string()).or_default();
            for key in top_level_key_fields(fields) {
                if !entry.contains(&key) {
                    entry.push(key);
                }
            }
        }
    }
}

/// `"id sku"` gives `[id, sku]`, `"id, owner { id }"` gives `[id, owner]`.
fn top_level_key_fields(fields: &str) -> Vec<String> {
    let selection = format!("{{ {fields} }}");
    let document = match parse_query::<String>(&selection) {
        Ok(document) => document,
        Err(error) => {
            tracing::warn!(key = fields, %error, "ignoring unparsable @key selection");
            return Vec::new();
        }
    };

    let selection_set = match document.definitions.as_slice() {
        [QueryDefinition::Operation(OperationDefinition::SelectionSet(selection_set))] => {
            selection_set
        }
        _ => return Vec::new(),
    };
    selection_set
        .items
        .iter()
        .filter_map(|selection| match selection {
            Selection::Field(field) => Some(field.name.clone()),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Vec<Arc<ServiceRuntime>>,
    by_name: HashMap<String, usize>,
}

impl ServiceRegistry {
    /// Bootstraps every service with at most `concurrency` introspections in flight.
    pub async fn initialize_all(
        configs: Vec<ServiceConfig>,
        concurrency: usize,
    ) -> Result<Self, BootstrapError> {
        Self::initialize_with(configs, concurrency, |config| {
            Ok(Arc::new(HttpTransport::new(config)?) as Arc<dyn Transport>)
        })
        .await
    }

    pub async fn initialize_with<F>(
        configs: Vec<ServiceConfig>,
        concurrency: usize,
        connect: F,
    ) -> Result<Self, BootstrapError>
    where
        F: Fn(&ServiceConfig) -> Result<Arc<dyn Transport>, TransportError>,
    {
        if concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency.into());
        }
        let mut seen = HashSet::new();
        for config in &configs {
            if !seen.insert(config.name.clone()) {
                return Err(ConfigError::DuplicateService(config.name.clone()).into());
            }
        }

        tracing::info!(
            services = configs.len(),
            concurrency,
            "bootstrapping services"
        );

        let runtimes: Vec<ServiceRuntime> = stream::iter(configs.into_iter().map(|config| {
            let transport = connect(&config);
            async move {
                let transport = transport.map_err(|source| BootstrapError::Transport {
                    service: config.name.clone(),
                    source,
                })?;
                ServiceRuntime::introspect(config, transport).await
            }
        }))
        .buffered(concurrency)
        .try_collect()
        .await?;

        Ok(Self::from_runtimes(runtimes))
    }

    pub fn from_runtimes(runtimes: Vec<ServiceRuntime>) -> Self {
        let mut registry = ServiceRegistry::default();
        for runtime in runtimes {
            registry
                .by_name
                .insert(runtime.name().to_string(), registry.services.len());
            registry.services.push(Arc::new(runtime));
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceRuntime>> {
        self.by_name.get(name).map(|index| &self.services[*index])
    }

    pub fn services(&self) -> &[Arc<ServiceRuntime>] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn shutdown(&self) {
        for service in &self.services {
            service.close();
        }
    }
}
