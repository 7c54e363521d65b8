use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::Instrument;

use crate::{
    GraphQLError, GraphQLResponse,
    composer::{ComposedSchema, TypeKind},
    ownership::OwnershipIndex,
    query_builder::{
        ENTITIES_FIELD, SynthesizedOperation, entity_operation, field_resolver_operation,
        root_operation,
    },
    resolve_info::ResolveInfo,
    schema_registry::{ServiceRegistry, ServiceRuntime},
    selection_rewriter::{RewriteError, SelectionRewriter, TYPENAME},
    transport::{RequestContext, TransportError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelegationKind {
    RootDelegate,
    EntityReference,
    // Contributed by `extend type`, fetched through `_entities` on the parent.
    FieldResolver,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Delegation {
    pub kind: DelegationKind,
    pub service: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WiredField {
    pub type_name: String,
    pub field: String,
    pub delegation: Delegation,
}

#[derive(thiserror::Error, Debug)]
pub enum DelegationError {
    #[error("no service named '{0}' is registered")]
    UnknownService(String),
    #[error("request to service '{service}' failed: {source}")]
    Protocol {
        service: String,
        source: TransportError,
    },
    #[error("service '{service}' returned errors: {}", join_messages(.errors))]
    Application {
        service: String,
        errors: Vec<GraphQLError>,
    },
    #[error("response of service '{service}' has no value at '{path}'")]
    MalformedResponse { service: String, path: String },
    #[error("'{type_name}.{field}' has no object to build an entity representation from")]
    MissingRepresentation { type_name: String, field: String },
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
}

fn join_messages(errors: &[GraphQLError]) -> String {
    errors
        .iter()
        .map(|error| error.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct Dispatcher {
    schema: Arc<ComposedSchema>,
    index: Arc<OwnershipIndex>,
    registry: Arc<ServiceRegistry>,
}

impl Dispatcher {
    pub fn new(
        schema: Arc<ComposedSchema>,
        index: Arc<OwnershipIndex>,
        registry: Arc<ServiceRegistry>,
    ) -> Self {
        Dispatcher {
            schema,
            index,
            registry,
        }
    }

    /// Classifies every object field and attaches a delegation to the crossing ones.
    pub fn wire(
        schema: &mut ComposedSchema,
        index: &OwnershipIndex,
        registry: &ServiceRegistry,
    ) -> Vec<WiredField> {
        let mut wired = Vec::new();

        for composed in schema.types().filter(|t| t.kind == TypeKind::Object) {
            for field in &composed.fields {
                if let Some(delegation) =
                    classify(schema, index, registry, &composed.name, &field.name)
                {
                    wired.push(WiredField {
                        type_name: composed.name.clone(),
                        field: field.name.clone(),
                        delegation,
                    });
                }
            }
        }

        for entry in &wired {
            tracing::debug!(
                type_name = %entry.type_name,
                field = %entry.field,
                kind = ?entry.delegation.kind,
                service = %entry.delegation.service,
                "field wired"
            );
            schema.attach(&entry.type_name, &entry.field, entry.delegation.clone());
        }

        tracing::info!(delegations = wired.len(), "resolvers wired");
        wired
    }

    pub fn schema(&self) -> &ComposedSchema {
        &self.schema
    }

    pub fn index(&self) -> &OwnershipIndex {
        &self.index
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Resolves one field. Fields without a delegation read `parent[response key]`.
    pub async fn resolve(
        &self,
        parent: &Value,
        ctx: &RequestContext,
        info: &ResolveInfo<'_, '_>,
    ) -> Result<Value, DelegationError> {
        let field_name = info.field_name();
        let Some(delegation) = self.schema.delegation(info.parent_type, field_name) else {
            return Ok(parent.get(info.response_key()).cloned().unwrap_or(Value::Null));
        };

        let service = self
            .registry
            .get(&delegation.service)
            .ok_or_else(|| DelegationError::UnknownService(delegation.service.clone()))?;

        match delegation.kind {
            DelegationKind::RootDelegate => self.resolve_root(service, ctx, info).await,
            DelegationKind::EntityReference => {
                self.resolve_reference(service, parent, ctx, info).await
            }
            DelegationKind::FieldResolver => {
                self.resolve_contributed(service, parent, ctx, info).await
            }
        }
    }

    async fn resolve_root(
        &self,
        service: &ServiceRuntime,
        ctx: &RequestContext,
        info: &ResolveInfo<'_, '_>,
    ) -> Result<Value, DelegationError> {
        let operation = root_operation(
            &self.rewriter(service, info),
            info.operation.kind,
            info.field,
        )?;
        let response = self.send(service, operation, ctx, info).await?;
        extract(service, &response, &[info.response_key()])
    }

    async fn resolve_reference(
        &self,
        service: &ServiceRuntime,
        parent: &Value,
        ctx: &RequestContext,
        info: &ResolveInfo<'_, '_>,
    ) -> Result<Value, DelegationError> {
        let return_type = self
            .schema
            .field(info.parent_type, info.field_name())
            .map(|field| field.return_type.as_str())
            .unwrap_or_default();

        match parent.get(info.response_key()).unwrap_or(&Value::Null) {
            Value::Null => Ok(Value::Null),
            Value::Array(items) => {
                let mut type_names: Vec<String> = Vec::new();
                let mut representations = Vec::new();
                for item in items.iter().filter(|item| !item.is_null()) {
                    let concrete = typename_of(item).unwrap_or(return_type);
                    if !type_names.iter().any(|name| name == concrete) {
                        type_names.push(concrete.to_string());
                    }
                    representations.push(representation(item, concrete, info)?);
                }
                if representations.is_empty() {
                    return Ok(Value::Array(items.clone()));
                }

                let expected = representations.len();
                let operation =
                    entity_operation(&self.rewriter(service, info), info.field, &type_names, representations)?;
                let response = self.send(service, operation, ctx, info).await?;
                let entities = match extract(service, &response, &[ENTITIES_FIELD])? {
                    Value::Array(entities) if entities.len() == expected => entities,
                    _ => {
                        return Err(DelegationError::MalformedResponse {
                            service: service.name().to_string(),
                            path: ENTITIES_FIELD.to_string(),
                        });
                    }
                };

                let mut entities = entities.into_iter();
                let reassembled = items
                    .iter()
                    .map(|item| match item {
                        Value::Null => Value::Null,
                        _ => entities.next().unwrap_or(Value::Null),
                    })
                    .collect();
                Ok(Value::Array(reassembled))
            }
            stub => {
                let concrete = typename_of(stub).unwrap_or(return_type).to_string();
                let representation = representation(stub, &concrete, info)?;
                let operation = entity_operation(
                    &self.rewriter(service, info),
                    info.field,
                    &[concrete],
                    vec![representation],
                )?;
                let response = self.send(service, operation, ctx, info).await?;
                extract(service, &response, &[ENTITIES_FIELD, "0"])
            }
        }
    }

    async fn resolve_contributed(
        &self,
        service: &ServiceRuntime,
        parent: &Value,
        ctx: &RequestContext,
        info: &ResolveInfo<'_, '_>,
    ) -> Result<Value, DelegationError> {
        let concrete = typename_of(parent).unwrap_or(info.parent_type);
        let representation = representation(parent, concrete, info)?;
        let operation = field_resolver_operation(
            &self.rewriter(service, info),
            info.field,
            info.parent_type,
            concrete,
            representation,
        )?;
        let response = self.send(service, operation, ctx, info).await?;
        extract(service, &response, &[ENTITIES_FIELD, "0", info.response_key()])
    }

    fn rewriter<'a, 'q>(
        &'a self,
        service: &'a ServiceRuntime,
        info: &ResolveInfo<'a, 'q>,
    ) -> SelectionRewriter<'a, 'q> {
        SelectionRewriter::new(&self.schema, &self.index, service, info.operation)
    }

    async fn send(
        &self,
        service: &ServiceRuntime,
        operation: SynthesizedOperation,
        ctx: &RequestContext,
        info: &ResolveInfo<'_, '_>,
    ) -> Result<GraphQLResponse, DelegationError> {
        let field = format!("{}.{}", info.parent_type, info.field_name());
        let span = tracing::debug_span!(
            "delegate",
            service = %service.name(),
            operation = %operation.operation_name,
            field = %field,
        );

        async move {
            tracing::debug!(query = %operation.query, "sending delegated operation");
            service
                .execute(&operation.into(), ctx)
                .await
                .map_err(|source| DelegationError::Protocol {
                    service: service.name().to_string(),
                    source,
                })
        }
        .instrument(span)
        .await
    }
}

fn classify(
    schema: &ComposedSchema,
    index: &OwnershipIndex,
    registry: &ServiceRegistry,
    type_name: &str,
    field_name: &str,
) -> Option<Delegation> {
    let field = schema.field(type_name, field_name)?;

    match type_name {
        "Subscription" => None,
        "Query" | "Mutation" => {
            let service = index
                .root_field_owner(type_name, field_name)
                .or_else(|| index.owner_of(&field.return_type))?;
            Some(Delegation {
                kind: DelegationKind::RootDelegate,
                service: service.to_string(),
            })
        }
        _ => {
            let Some(declaring) = index.owner_of(type_name) else {
                tracing::warn!(type_name, field = field_name, "type has no owning service, not wired");
                return None;
            };
            let declares = registry
                .get(declaring)
                .is_some_and(|service| service.owns_field(type_name, field_name));

            let (kind, target) = if declares {
                if schema.is_leaf_type(&field.return_type) {
                    return None;
                }
                (
                    DelegationKind::EntityReference,
                    index.owner_of(&field.return_type)?,
                )
            } else {
                (
                    DelegationKind::FieldResolver,
                    index
                        .contributor_of(type_name, field_name)
                        .or_else(|| index.owner_of(&field.return_type))?,
                )
            };

            (target != declaring).then(|| Delegation {
                kind,
                service: target.to_string(),
            })
        }
    }
}

fn typename_of(value: &Value) -> Option<&str> {
    value.get(TYPENAME).and_then(Value::as_str)
}

fn representation(
    value: &Value,
    concrete: &str,
    info: &ResolveInfo<'_, '_>,
) -> Result<Value, DelegationError> {
    let Value::Object(fields) = value else {
        return Err(DelegationError::MissingRepresentation {
            type_name: info.parent_type.to_string(),
            field: info.field_name().to_string(),
        });
    };
    let mut fields: Map<String, Value> = fields.clone();
    fields
        .entry(TYPENAME)
        .or_insert_with(|| Value::String(concrete.to_string()));
    Ok(Value::Object(fields))
}

/// Reads the delegated value at `path`, classifying upstream GraphQL errors.
fn extract(
    service: &ServiceRuntime,
    response: &GraphQLResponse,
    path: &[&str],
) -> Result<Value, DelegationError> {
    let value = response.data_at(path);
    let has_errors = !response.errors.is_empty();

    match value {
        Some(value) if !value.is_null() => {
            if has_errors {
                tracing::warn!(
                    service = %service.name(),
                    errors = %join_messages(&response.errors),
                    "partial response from service"
                );
            }
            Ok(value.clone())
        }
        _ if has_errors => Err(DelegationError::Application {
            service: service.name().to_string(),
            errors: response.errors.clone(),
        }),
        Some(_) => Ok(Value::Null),
        None => Err(DelegationError::MalformedResponse {
            service: service.name().to_string(),
            path: path.join("."),
        }),
    }
}
