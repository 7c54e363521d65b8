use graphql_parser::query::{
    Definition, Document, Field, FragmentDefinition, OperationDefinition, Selection,
    SelectionSet, VariableDefinition,
};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum OperationError {
    #[error("document contains no operation")]
    NoOperation,
    #[error("operation '{0}' not found in document")]
    UnknownOperation(String),
    #[error("document contains several operations, an operation name is required")]
    AmbiguousOperation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn keyword(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }

    pub fn root_type(self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        }
    }
}

#[derive(Debug)]
pub struct OperationContext<'a, 'q> {
    pub kind: OperationKind,
    pub name: Option<&'a str>,
    pub variable_definitions: &'a [VariableDefinition<'q, String>],
    pub selection_set: &'a SelectionSet<'q, String>,
    pub fragments: HashMap<&'a str, &'a FragmentDefinition<'q, String>>,
    pub variables: Map<String, Value>,
}

impl<'a, 'q> OperationContext<'a, 'q> {
    pub fn from_document(
        document: &'a Document<'q, String>,
        operation_name: Option<&str>,
        variables: Map<String, Value>,
    ) -> Result<Self, OperationError> {
        let mut fragments = HashMap::new();
        let mut operations = Vec::new();

        for definition in &document.definitions {
            match definition {
                Definition::Fragment(fragment) => {
                    fragments.insert(fragment.name.as_str(), fragment);
                }
                Definition::Operation(operation) => operations.push(operation),
            }
        }

        let operation = match operation_name {
            Some(wanted) => operations
                .into_iter()
                .find(|operation| operation_parts(*operation).1 == Some(wanted))
                .ok_or_else(|| OperationError::UnknownOperation(wanted.to_string()))?,
            None => match operations.as_slice() {
                [] => return Err(OperationError::NoOperation),
                [single] => *single,
                _ => return Err(OperationError::AmbiguousOperation),
            },
        };

        let (kind, name, variable_definitions, selection_set) = operation_parts(operation);
        Ok(OperationContext {
            kind,
            name,
            variable_definitions,
            selection_set,
            fragments,
            variables,
        })
    }

    pub fn fragment(&self, name: &str) -> Option<&'a FragmentDefinition<'q, String>> {
        self.fragments.get(name).copied()
    }

    pub fn variable_definition(&self, name: &str) -> Option<&'a VariableDefinition<'q, String>> {
        self.variable_definitions
            .iter()
            .find(|definition| definition.name == name)
    }

    /// Finds the field node at a response path such as `["reviews", "product"]`.
    pub fn field_at(&self, path: &[&str]) -> Option<&'a Field<'q, String>> {
        let (first, rest) = path.split_first()?;
        let mut field = self.find_in(self.selection_set, first)?;
        for key in rest {
            field = self.find_in(&field.selection_set, key)?;
        }
        Some(field)
    }

    fn find_in(
        &self,
        selection_set: &'a SelectionSet<'q, String>,
        key: &str,
    ) -> Option<&'a Field<'q, String>> {
        selection_set
            .items
            .iter()
            .find_map(|selection| match selection {
                Selection::Field(field) => (response_key(field) == key).then_some(field),
                Selection::InlineFragment(inline) => self.find_in(&inline.selection_set, key),
                Selection::FragmentSpread(spread) => self
                    .fragment(&spread.fragment_name)
                    .and_then(|fragment| self.find_in(&fragment.selection_set, key)),
            })
    }
}

type OperationParts<'a, 'q> = (
    OperationKind,
    Option<&'a str>,
    &'a [VariableDefinition<'q, String>],
    &'a SelectionSet<'q, String>,
);

fn operation_parts<'a, 'q>(operation: &'a OperationDefinition<'q, String>) -> OperationParts<'a, 'q> {
    match operation {
        OperationDefinition::SelectionSet(selection_set) => {
            (OperationKind::Query, None, Default::default(), selection_set)
        }
        OperationDefinition::Query(query) => (
            OperationKind::Query,
            query.name.as_deref(),
            query.variable_definitions.as_slice(),
            &query.selection_set,
        ),
        OperationDefinition::Mutation(mutation) => (
            OperationKind::Mutation,
            mutation.name.as_deref(),
            mutation.variable_definitions.as_slice(),
            &mutation.selection_set,
        ),
        OperationDefinition::Subscription(subscription) => (
            OperationKind::Subscription,
            subscription.name.as_deref(),
            subscription.variable_definitions.as_slice(),
            &subscription.selection_set,
        ),
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ResolveInfo<'a, 'q> {
    pub parent_type: &'a str,
    pub field: &'a Field<'q, String>,
    pub operation: &'a OperationContext<'a, 'q>,
}

impl<'a, 'q> ResolveInfo<'a, 'q> {
    pub fn new(
        parent_type: &'a str,
        field: &'a Field<'q, String>,
        operation: &'a OperationContext<'a, 'q>,
    ) -> Self {
        ResolveInfo {
            parent_type,
            field,
            operation,
        }
    }

    pub fn field_name(&self) -> &'a str {
        &self.field.name
    }

    pub fn response_key(&self) -> &'a str {
        response_key(self.field)
    }
}

/// The alias if there is one, else the field name.
pub fn response_key<'f>(field: &'f Field<'_, String>) -> &'f str {
    field.alias.as_deref().unwrap_or(field.name.as_str())
}
