use graphql_parser::{
    Pos,
    query::{Field, FragmentDefinition, InlineFragment, Selection, SelectionSet, TypeCondition},
};
use std::collections::HashSet;

use crate::{
    composer::ComposedSchema,
    ownership::OwnershipIndex,
    resolve_info::{OperationContext, response_key},
    schema_registry::ServiceRuntime,
};

pub const TYPENAME: &str = "__typename";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum RewriteError {
    #[error("field '{type_name}.{field}' is not part of the composed schema")]
    UnknownField { type_name: String, field: String },
    #[error("fragment '{0}' is not defined in the operation")]
    UnknownFragment(String),
    #[error("variable '${0}' is used but not declared by the operation")]
    UndefinedVariable(String),
    #[error("variable '$representations' is reserved for entity representations")]
    ReservedVariable,
}

/// Prunes client selections down to what one target service can answer.
pub struct SelectionRewriter<'a, 'q> {
    schema: &'a ComposedSchema,
    index: &'a OwnershipIndex,
    service: &'a ServiceRuntime,
    operation: &'a OperationContext<'a, 'q>,
}

impl<'a, 'q> SelectionRewriter<'a, 'q> {
    pub fn new(
        schema: &'a ComposedSchema,
        index: &'a OwnershipIndex,
        service: &'a ServiceRuntime,
        operation: &'a OperationContext<'a, 'q>,
    ) -> Self {
        SelectionRewriter {
            schema,
            index,
            service,
            operation,
        }
    }

    pub fn service(&self) -> &'a ServiceRuntime {
        self.service
    }

    pub fn schema(&self) -> &'a ComposedSchema {
        self.schema
    }

    pub fn operation(&self) -> &'a OperationContext<'a, 'q> {
        self.operation
    }

    /// Keeps the fields of `type_name` the service declares (recursing with each field's
    /// return type), keeps spreads and inline fragments on types it knows, completes entity
    /// keys it can serve, and ends every level with `__typename`.
    pub fn prune(
        &self,
        selection_set: &SelectionSet<'q, String>,
        type_name: &str,
    ) -> Result<SelectionSet<'q, String>, RewriteError> {
        let mut items = Vec::with_capacity(selection_set.items.len() + 1);

        for selection in &selection_set.items {
            match selection {
                Selection::Field(field) if field.name == TYPENAME => {
                    // Directives are dropped so the typename is always present.
                    if !selects(&items, response_key(field)) {
                        items.push(Selection::Field(Field {
                            alias: field.alias.clone(),
                            ..bare_field(TYPENAME)
                        }));
                    }
                }
                Selection::Field(field) => {
                    if !self.can_select(type_name, &field.name) {
                        continue;
                    }
                    items.push(Selection::Field(self.prune_field(field, type_name)?));
                }
                Selection::FragmentSpread(spread) => {
                    let fragment = self
                        .operation
                        .fragment(&spread.fragment_name)
                        .ok_or_else(|| RewriteError::UnknownFragment(spread.fragment_name.clone()))?;
                    if self.service.knows_type(condition_name(&fragment.type_condition)) {
                        items.push(selection.clone());
                    }
                }
                Selection::InlineFragment(inline) => {
                    let condition = inline
                        .type_condition
                        .as_ref()
                        .map(condition_name)
                        .unwrap_or(type_name);
                    if !self.service.knows_type(condition) {
                        continue;
                    }
                    items.push(Selection::InlineFragment(InlineFragment {
                        position: inline.position,
                        type_condition: inline.type_condition.clone(),
                        directives: inline.directives.clone(),
                        selection_set: self.prune(&inline.selection_set, condition)?,
                    }));
                }
            }
        }

        for key in self.index.entity_keys(type_name) {
            let servable = self.service.owns_field(type_name, key)
                || self.service.serves_key_field(type_name, key);
            if !servable || selects(&items, key) {
                continue;
            }
            let is_leaf = self
                .schema
                .field(type_name, key)
                .is_some_and(|field| self.schema.is_leaf_type(&field.return_type));
            if is_leaf {
                items.push(leaf_field(key));
            }
        }

        if !selects(&items, TYPENAME) {
            items.push(leaf_field(TYPENAME));
        }

        Ok(SelectionSet {
            span: selection_set.span,
            items,
        })
    }

    /// Copies `field`, alias included, pruning its sub-selections against its return type.
    pub fn prune_field(
        &self,
        field: &Field<'q, String>,
        parent_type: &str,
    ) -> Result<Field<'q, String>, RewriteError> {
        let selection_set = if field.selection_set.items.is_empty() {
            empty_selection_set()
        } else {
            let return_type = &self
                .schema
                .field(parent_type, &field.name)
                .ok_or_else(|| RewriteError::UnknownField {
                    type_name: parent_type.to_string(),
                    field: field.name.clone(),
                })?
                .return_type;
            self.prune(&field.selection_set, return_type)?
        };

        Ok(Field {
            position: field.position,
            alias: field.alias.clone(),
            name: field.name.clone(),
            arguments: field.arguments.clone(),
            directives: field.directives.clone(),
            selection_set,
        })
    }

    /// Prunes every fragment definition reachable from `selection_set`, each exactly once.
    pub fn reachable_fragments(
        &self,
        selection_set: &SelectionSet<'q, String>,
    ) -> Result<Vec<FragmentDefinition<'q, String>>, RewriteError> {
        let mut visited = HashSet::new();
        let mut fragments = Vec::new();
        self.collect_fragments(selection_set, &mut visited, &mut fragments)?;
        Ok(fragments)
    }

    fn collect_fragments(
        &self,
        selection_set: &SelectionSet<'q, String>,
        visited: &mut HashSet<String>,
        fragments: &mut Vec<FragmentDefinition<'q, String>>,
    ) -> Result<(), RewriteError> {
        for selection in &selection_set.items {
            match selection {
                Selection::Field(field) => {
                    self.collect_fragments(&field.selection_set, visited, fragments)?
                }
                Selection::InlineFragment(inline) => {
                    self.collect_fragments(&inline.selection_set, visited, fragments)?
                }
                Selection::FragmentSpread(spread) => {
                    if !visited.insert(spread.fragment_name.clone()) {
                        continue;
                    }
                    let fragment = self
                        .operation
                        .fragment(&spread.fragment_name)
                        .ok_or_else(|| RewriteError::UnknownFragment(spread.fragment_name.clone()))?;

                    let pruned = FragmentDefinition {
                        position: fragment.position,
                        name: fragment.name.clone(),
                        type_condition: fragment.type_condition.clone(),
                        directives: fragment.directives.clone(),
                        selection_set: self.prune(
                            &fragment.selection_set,
                            condition_name(&fragment.type_condition),
                        )?,
                    };
                    self.collect_fragments(&pruned.selection_set, visited, fragments)?;
                    fragments.push(pruned);
                }
            }
        }
        Ok(())
    }

    fn can_select(&self, type_name: &str, field: &str) -> bool {
        self.service.owns_field(type_name, field)
            || self.service.contributes_field(type_name, field)
            || self.service.serves_key_field(type_name, field)
    }
}

fn condition_name<'c, 'q>(condition: &'c TypeCondition<'q, String>) -> &'c str {
    match condition {
        TypeCondition::On(name) => name,
    }
}

// An unaliased selection of `name`, which is what keys and `__typename` must be.
fn selects(items: &[Selection<'_, String>], name: &str) -> bool {
    items.iter().any(|item| {
        matches!(item, Selection::Field(field) if field.name == name && response_key(field) == name)
    })
}

pub(crate) fn origin() -> Pos {
    Pos { line: 1, column: 1 }
}

pub(crate) fn empty_selection_set<'q>() -> SelectionSet<'q, String> {
    SelectionSet {
        span: (origin(), origin()),
        items: Vec::new(),
    }
}

pub(crate) fn leaf_field<'q>(name: &str) -> Selection<'q, String> {
    Selection::Field(bare_field(name))
}

fn bare_field<'q>(name: &str) -> Field<'q, String> {
    Field {
        position: origin(),
        alias: None,
        name: name.to_string(),
        arguments: Vec::new(),
        directives: Vec::new(),
        selection_set: empty_selection_set(),
    }
}
