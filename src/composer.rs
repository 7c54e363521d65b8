use graphql_parser::{
    parse_schema,
    schema::{Definition, Field, Type, TypeDefinition, TypeExtension},
};
use std::{
    collections::{BTreeMap, btree_map::Entry},
    sync::Arc,
};

use crate::{dispatcher::Delegation, schema_registry::ServiceRuntime};

const BUILT_IN_SCALARS: [&str; 5] = ["Int", "Float", "String", "Boolean", "ID"];

#[derive(thiserror::Error, Debug)]
pub enum ComposeError {
    #[error("service '{service}' SDL could not be parsed: {source}")]
    Parse {
        service: String,
        source: graphql_parser::schema::ParseError,
    },
    #[error("type '{type_name}' is declared as {first:?} and as {second:?}")]
    KindMismatch {
        type_name: String,
        first: TypeKind,
        second: TypeKind,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Object,
    Interface,
    Union,
    Enum,
    Scalar,
    InputObject,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComposedField {
    pub name: String,
    /// Named type with list and non-null wrappers removed.
    pub return_type: String,
    pub is_list: bool,
    /// Filled in by the dispatcher when the field crosses a service boundary.
    pub delegation: Option<Delegation>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComposedType {
    pub name: String,
    pub kind: TypeKind,
    pub fields: Vec<ComposedField>,
}

impl ComposedType {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        ComposedType {
            name: name.into(),
            kind,
            fields: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&ComposedField> {
        self.fields.iter().find(|field| field.name == name)
    }

    fn add_field(&mut self, field: ComposedField) {
        if self.field(&field.name).is_none() {
            self.fields.push(field);
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComposedSchema {
    types: BTreeMap<String, ComposedType>,
}

impl ComposedSchema {
    pub fn insert_type(&mut self, composed: ComposedType) {
        self.types.insert(composed.name.clone(), composed);
    }

    pub fn get_type(&self, name: &str) -> Option<&ComposedType> {
        self.types.get(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &ComposedType> {
        self.types.values()
    }

    pub fn field(&self, type_name: &str, field: &str) -> Option<&ComposedField> {
        self.types.get(type_name)?.field(field)
    }

    pub fn is_leaf_type(&self, name: &str) -> bool {
        match self.types.get(name) {
            Some(composed) => matches!(composed.kind, TypeKind::Scalar | TypeKind::Enum),
            None => BUILT_IN_SCALARS.contains(&name),
        }
    }

    pub fn delegation(&self, type_name: &str, field: &str) -> Option<&Delegation> {
        self.field(type_name, field)?.delegation.as_ref()
    }

    /// Attaches a resolver to a field. Returns false when the field does not exist.
    pub fn attach(&mut self, type_name: &str, field: &str, delegation: Delegation) -> bool {
        let slot = self
            .types
            .get_mut(type_name)
            .and_then(|composed| composed.fields.iter_mut().find(|f| f.name == field));

        match slot {
            Some(slot) => {
                slot.delegation = Some(delegation);
                true
            }
            None => false,
        }
    }

    fn merge(
        &mut self,
        name: &str,
        kind: TypeKind,
        fields: impl IntoIterator<Item = ComposedField>,
    ) -> Result<(), ComposeError> {
        let composed = match self.types.entry(name.to_string()) {
            Entry::Vacant(entry) => entry.insert(ComposedType::new(name, kind)),
            Entry::Occupied(entry) => entry.into_mut(),
        };

        if composed.kind != kind {
            return Err(ComposeError::KindMismatch {
                type_name: name.to_string(),
                first: composed.kind,
                second: kind,
            });
        }

        for field in fields {
            composed.add_field(field);
        }
        Ok(())
    }
}

pub trait SchemaComposer: Send + Sync {
    fn compose(&self, services: &[Arc<ServiceRuntime>]) -> Result<ComposedSchema, ComposeError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SdlComposer;

impl SchemaComposer for SdlComposer {
    fn compose(&self, services: &[Arc<ServiceRuntime>]) -> Result<ComposedSchema, ComposeError> {
        let mut schema = ComposedSchema::default();
        for scalar in BUILT_IN_SCALARS {
            schema.insert_type(ComposedType::new(scalar, TypeKind::Scalar));
        }

        for service in services {
            let document =
                parse_schema::<String>(service.sdl()).map_err(|source| ComposeError::Parse {
                    service: service.name().to_string(),
                    source,
                })?;

            for definition in &document.definitions {
                let (name, kind, fields) = match definition {
                    Definition::TypeDefinition(definition) => match definition {
                        TypeDefinition::Object(object) => {
                            (&object.name, TypeKind::Object, Some(&object.fields))
                        }
                        TypeDefinition::Interface(interface) => {
                            (&interface.name, TypeKind::Interface, Some(&interface.fields))
                        }
                        TypeDefinition::Union(union) => (&union.name, TypeKind::Union, None),
                        TypeDefinition::Enum(enumeration) => {
                            (&enumeration.name, TypeKind::Enum, None)
                        }
                        TypeDefinition::Scalar(scalar) => (&scalar.name, TypeKind::Scalar, None),
                        TypeDefinition::InputObject(input) => {
                            (&input.name, TypeKind::InputObject, None)
                        }
                    },
                    Definition::TypeExtension(extension) => match extension {
                        TypeExtension::Object(object) => {
                            (&object.name, TypeKind::Object, Some(&object.fields))
                        }
                        TypeExtension::Interface(interface) => {
                            (&interface.name, TypeKind::Interface, Some(&interface.fields))
                        }
                        TypeExtension::Union(union) => (&union.name, TypeKind::Union, None),
                        TypeExtension::Enum(enumeration) => {
                            (&enumeration.name, TypeKind::Enum, None)
                        }
                        TypeExtension::Scalar(scalar) => (&scalar.name, TypeKind::Scalar, None),
                        TypeExtension::InputObject(input) => {
                            (&input.name, TypeKind::InputObject, None)
                        }
                    },
                    _ => continue,
                };

                if name.starts_with('_') {
                    continue;
                }

                let fields = fields
                    .into_iter()
                    .flatten()
                    .filter(|field| !field.name.starts_with('_'))
                    .map(composed_field);
                schema.merge(name, kind, fields)?;
            }
        }

        tracing::debug!(types = schema.types.len(), "schema composed");
        Ok(schema)
    }
}

fn composed_field<'a>(field: &Field<'a, String>) -> ComposedField {
    let (return_type, is_list) = unwrap_type(&field.field_type);
    ComposedField {
        name: field.name.clone(),
        return_type,
        is_list,
        delegation: None,
    }
}

fn unwrap_type<'a>(ty: &Type<'a, String>) -> (String, bool) {
    match ty {
        Type::NamedType(name) => (name.clone(), false),
        Type::ListType(inner) => (unwrap_type(inner).0, true),
        Type::NonNullType(inner) => unwrap_type(inner),
    }
}
