use graphql_parser::query::{
    Definition, Directive, Document, Field, FragmentDefinition, InlineFragment, Mutation,
    OperationDefinition, Query, Selection, SelectionSet, Subscription, Type, TypeCondition,
    Value as AstValue, VariableDefinition,
};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::{
    SubgraphRequest,
    resolve_info::OperationKind,
    selection_rewriter::{RewriteError, SelectionRewriter, TYPENAME, leaf_field, origin},
};

pub const ENTITIES_OPERATION: &str = "EntitiesQuery";
pub const ENTITIES_FIELD: &str = "_entities";
pub const REPRESENTATIONS: &str = "representations";

#[derive(Clone, Debug, PartialEq)]
pub struct SynthesizedOperation {
    pub operation_name: String,
    pub query: String,
    pub variables: Map<String, Value>,
}

impl From<SynthesizedOperation> for SubgraphRequest {
    fn from(operation: SynthesizedOperation) -> Self {
        SubgraphRequest {
            query: operation.query,
            variables: operation.variables,
            operation_name: Some(operation.operation_name),
        }
    }
}

/// `<keyword> Query_<field>(<vars>) { <field>(<args>) { <pruned> } }`
pub fn root_operation<'q>(
    rewriter: &SelectionRewriter<'_, 'q>,
    kind: OperationKind,
    field: &Field<'q, String>,
) -> Result<SynthesizedOperation, RewriteError> {
    let root_field = rewriter.prune_field(field, kind.root_type())?;
    let selection_set = SelectionSet {
        span: (origin(), origin()),
        items: vec![Selection::Field(root_field)],
    };
    let fragments = rewriter.reachable_fragments(&selection_set)?;

    let used = referenced_variables(&selection_set, &fragments);
    let (variable_definitions, variables) = forwarded_variables(rewriter, &used)?;

    let operation_name = format!("{}_{}", kind.root_type(), field.name);
    let operation = operation_definition(
        kind,
        operation_name.clone(),
        variable_definitions,
        selection_set,
    );

    Ok(SynthesizedOperation {
        query: print(operation, fragments),
        operation_name,
        variables,
    })
}

// One inline fragment per concrete type.
pub fn entity_operation<'q>(
    rewriter: &SelectionRewriter<'_, 'q>,
    field: &Field<'q, String>,
    type_names: &[String],
    representations: Vec<Value>,
) -> Result<SynthesizedOperation, RewriteError> {
    let mut items = Vec::with_capacity(type_names.len());
    for type_name in type_names {
        items.push(inline_fragment(
            type_name,
            rewriter.prune(&field.selection_set, type_name)?,
        ));
    }
    entities_operation(rewriter, items, representations)
}

pub fn field_resolver_operation<'q>(
    rewriter: &SelectionRewriter<'_, 'q>,
    field: &Field<'q, String>,
    parent_type: &str,
    type_condition: &str,
    representation: Value,
) -> Result<SynthesizedOperation, RewriteError> {
    let delegated = rewriter.prune_field(field, parent_type)?;
    let fragment = inline_fragment(
        type_condition,
        SelectionSet {
            span: (origin(), origin()),
            items: vec![Selection::Field(delegated)],
        },
    );
    entities_operation(rewriter, vec![fragment], vec![representation])
}

fn entities_operation<'q>(
    rewriter: &SelectionRewriter<'_, 'q>,
    inline_fragments: Vec<Selection<'q, String>>,
    representations: Vec<Value>,
) -> Result<SynthesizedOperation, RewriteError> {
    let mut entity_items = Vec::with_capacity(inline_fragments.len() + 1);
    entity_items.push(leaf_field(TYPENAME));
    entity_items.extend(inline_fragments);

    let entities = Field {
        position: origin(),
        alias: None,
        name: ENTITIES_FIELD.to_string(),
        arguments: vec![(
            REPRESENTATIONS.to_string(),
            AstValue::Variable(REPRESENTATIONS.to_string()),
        )],
        directives: Vec::new(),
        selection_set: SelectionSet {
            span: (origin(), origin()),
            items: entity_items,
        },
    };

    let fragments = rewriter.reachable_fragments(&entities.selection_set)?;
    let used = referenced_variables(&entities.selection_set, &fragments);
    if used.contains(REPRESENTATIONS) {
        return Err(RewriteError::ReservedVariable);
    }
    let (forwarded, mut variables) = forwarded_variables(rewriter, &used)?;

    let mut variable_definitions = Vec::with_capacity(forwarded.len() + 1);
    variable_definitions.push(representations_definition());
    variable_definitions.extend(forwarded);
    variables.insert(REPRESENTATIONS.to_string(), Value::Array(representations));

    let operation = operation_definition(
        OperationKind::Query,
        ENTITIES_OPERATION.to_string(),
        variable_definitions,
        SelectionSet {
            span: (origin(), origin()),
            items: vec![Selection::Field(entities)],
        },
    );

    Ok(SynthesizedOperation {
        query: print(operation, fragments),
        operation_name: ENTITIES_OPERATION.to_string(),
        variables,
    })
}

fn representations_definition<'q>() -> VariableDefinition<'q, String> {
    let any = Type::NonNullType(Box::new(Type::NamedType("_Any".to_string())));
    VariableDefinition {
        position: origin(),
        name: REPRESENTATIONS.to_string(),
        var_type: Type::NonNullType(Box::new(Type::ListType(Box::new(any)))),
        default_value: None,
    }
}

fn inline_fragment<'q>(type_name: &str, selection_set: SelectionSet<'q, String>) -> Selection<'q, String> {
    Selection::InlineFragment(InlineFragment {
        position: origin(),
        type_condition: Some(TypeCondition::On(type_name.to_string())),
        directives: Vec::new(),
        selection_set,
    })
}

fn operation_definition<'q>(
    kind: OperationKind,
    name: String,
    variable_definitions: Vec<VariableDefinition<'q, String>>,
    selection_set: SelectionSet<'q, String>,
) -> OperationDefinition<'q, String> {
    match kind {
        OperationKind::Query => OperationDefinition::Query(Query {
            position: origin(),
            name: Some(name),
            variable_definitions,
            directives: Vec::new(),
            selection_set,
        }),
        OperationKind::Mutation => OperationDefinition::Mutation(Mutation {
            position: origin(),
            name: Some(name),
            variable_definitions,
            directives: Vec::new(),
            selection_set,
        }),
        OperationKind::Subscription => OperationDefinition::Subscription(Subscription {
            position: origin(),
            name: Some(name),
            variable_definitions,
            directives: Vec::new(),
            selection_set,
        }),
    }
}

fn print<'q>(
    operation: OperationDefinition<'q, String>,
    fragments: Vec<FragmentDefinition<'q, String>>,
) -> String {
    let mut definitions = Vec::with_capacity(fragments.len() + 1);
    definitions.push(Definition::Operation(operation));
    definitions.extend(fragments.into_iter().map(Definition::Fragment));
    Document { definitions }.to_string()
}

fn forwarded_variables<'q>(
    rewriter: &SelectionRewriter<'_, 'q>,
    used: &BTreeSet<String>,
) -> Result<(Vec<VariableDefinition<'q, String>>, Map<String, Value>), RewriteError> {
    let operation = rewriter.operation();
    if let Some(undefined) = used
        .iter()
        .find(|name| operation.variable_definition(name).is_none())
    {
        return Err(RewriteError::UndefinedVariable(undefined.clone()));
    }

    let definitions = operation
        .variable_definitions
        .iter()
        .filter(|definition| used.contains(&definition.name))
        .cloned()
        .collect();
    let values = operation
        .variables
        .iter()
        .filter(|(name, _)| used.contains(*name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    Ok((definitions, values))
}

/// Variable names referenced by arguments and directives anywhere in the document body.
pub fn referenced_variables<'q>(
    selection_set: &SelectionSet<'q, String>,
    fragments: &[FragmentDefinition<'q, String>],
) -> BTreeSet<String> {
    let mut used = BTreeSet::new();
    collect_variables(selection_set, &mut used);
    for fragment in fragments {
        directive_variables(&fragment.directives, &mut used);
        collect_variables(&fragment.selection_set, &mut used);
    }
    used
}

fn collect_variables(selection_set: &SelectionSet<'_, String>, used: &mut BTreeSet<String>) {
    for selection in &selection_set.items {
        match selection {
            Selection::Field(field) => {
                for (_, value) in &field.arguments {
                    value_variables(value, used);
                }
                directive_variables(&field.directives, used);
                collect_variables(&field.selection_set, used);
            }
            Selection::FragmentSpread(spread) => directive_variables(&spread.directives, used),
            Selection::InlineFragment(inline) => {
                directive_variables(&inline.directives, used);
                collect_variables(&inline.selection_set, used);
            }
        }
    }
}

fn directive_variables(directives: &[Directive<'_, String>], used: &mut BTreeSet<String>) {
    for directive in directives {
        for (_, value) in &directive.arguments {
            value_variables(value, used);
        }
    }
}

fn value_variables(value: &AstValue<'_, String>, used: &mut BTreeSet<String>) {
    match value {
        AstValue::Variable(name) => {
            used.insert(name.clone());
        }
        AstValue::List(items) => items.iter().for_each(|item| value_variables(item, used)),
        AstValue::Object(fields) => fields.values().for_each(|item| value_variables(item, used)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        resolve_info::OperationContext,
        testing::{Federation, normalize},
    };
    use graphql_parser::parse_query;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const REVIEWS: &str = r#"
        type Query { reviews(first: Int): [Review] review(id: ID!): Review }
        type Mutation { addReview(body: String!): Review }
        type Review { id: ID! productId: ID! body(format: String): String }
    "#;
    const PRODUCTS: &str = r#"
        extend type Query { product(id: ID!): Product }
        type Product @key(fields: "id") { id: ID! name(locale: String): String price: Float }
        extend type Review @key(fields: "id") { id: ID! @external product: Product }
    "#;

    fn federation() -> Federation {
        Federation::new(&[("reviews", REVIEWS), ("products", PRODUCTS)])
    }

    fn variables(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn root_operation_forwards_arguments_verbatim() {
        let federation = federation();
        let document = parse_query::<String>(
            r#"query Top($id: ID!, $unused: Int) { product(id: $id) { name price reviews } }"#,
        )
        .unwrap();
        let operation = OperationContext::from_document(
            &document,
            None,
            variables(json!({ "id": "p1", "unused": 3 })),
        )
        .unwrap();
        let rewriter = federation.rewriter("products", &operation);

        let built = root_operation(
            &rewriter,
            OperationKind::Query,
            operation.field_at(&["product"]).unwrap(),
        )
        .unwrap();

        assert_eq!(built.operation_name, "Query_product");
        assert_eq!(
            built.query,
            normalize("query Query_product($id: ID!) { product(id: $id) { name price id __typename } }")
        );
        assert_eq!(built.variables, variables(json!({ "id": "p1" })));
    }

    #[test]
    fn root_operation_mirrors_the_mutation_keyword() {
        let federation = federation();
        let document = parse_query::<String>(
            r#"mutation { latest: addReview(body: "great") { id body } }"#,
        )
        .unwrap();
        let operation = OperationContext::from_document(&document, None, Map::new()).unwrap();
        let rewriter = federation.rewriter("reviews", &operation);

        let built = root_operation(
            &rewriter,
            OperationKind::Mutation,
            operation.field_at(&["latest"]).unwrap(),
        )
        .unwrap();

        assert_eq!(
            built.query,
            normalize(
                r#"mutation Mutation_addReview { latest: addReview(body: "great") { id body __typename } }"#
            )
        );
        assert!(built.variables.is_empty());
    }

    #[test]
    fn aliased_selections_of_one_field_stay_distinct() {
        let federation = federation();
        let document = parse_query::<String>(
            r#"{ product(id: 1) { en: name(locale: "en") fr: name(locale: "fr") } }"#,
        )
        .unwrap();
        let operation = OperationContext::from_document(&document, None, Map::new()).unwrap();
        let rewriter = federation.rewriter("products", &operation);

        let built = root_operation(
            &rewriter,
            OperationKind::Query,
            operation.field_at(&["product"]).unwrap(),
        )
        .unwrap();

        assert_eq!(
            built.query,
            normalize(
                r#"query Query_product { product(id: 1) { en: name(locale: "en") fr: name(locale: "fr") id __typename } }"#
            )
        );
    }

    #[test]
    fn field_resolver_operation_wraps_the_delegated_field() {
        let federation = federation();
        let document = parse_query::<String>("{ reviews { id product { name } } }").unwrap();
        let operation = OperationContext::from_document(&document, None, Map::new()).unwrap();
        let rewriter = federation.rewriter("products", &operation);

        let built = field_resolver_operation(
            &rewriter,
            operation.field_at(&["reviews", "product"]).unwrap(),
            "Review",
            "Review",
            json!({ "__typename": "Review", "id": "r1" }),
        )
        .unwrap();

        assert_eq!(built.operation_name, ENTITIES_OPERATION);
        assert_eq!(
            built.query,
            normalize(
                "query EntitiesQuery($representations: [_Any!]!) { \
                   _entities(representations: $representations) { \
                     __typename ... on Review { product { name id __typename } } } }"
            )
        );
        assert_eq!(
            built.variables,
            variables(json!({ "representations": [{ "__typename": "Review", "id": "r1" }] }))
        );
    }

    #[test]
    fn entity_operation_has_one_fragment_per_type() {
        let federation = federation();
        let document = parse_query::<String>("{ review(id: 1) { product { name } } }").unwrap();
        let operation = OperationContext::from_document(&document, None, Map::new()).unwrap();
        let rewriter = federation.rewriter("products", &operation);

        let built = entity_operation(
            &rewriter,
            operation.field_at(&["review", "product"]).unwrap(),
            &["Product".to_string()],
            vec![json!({ "__typename": "Product", "id": "p1" })],
        )
        .unwrap();

        assert_eq!(
            built.query,
            normalize(
                "query EntitiesQuery($representations: [_Any!]!) { \
                   _entities(representations: $representations) { \
                     __typename ... on Product { name id __typename } } }"
            )
        );
    }

    #[test]
    fn declared_variables_match_referenced_ones_exactly() {
        let federation = federation();
        let document = parse_query::<String>(
            r#"
            query Q($first: Int, $locale: String, $format: String, $withPrice: Boolean!) {
              reviews(first: $first) {
                body(format: $format)
                product { ...ProductParts }
              }
            }
            fragment ProductParts on Product {
              name(locale: $locale)
              price @include(if: $withPrice)
            }
            "#,
        )
        .unwrap();
        let operation = OperationContext::from_document(
            &document,
            None,
            variables(json!({ "first": 2, "locale": "fr", "format": "md", "withPrice": true })),
        )
        .unwrap();
        let rewriter = federation.rewriter("products", &operation);

        let built = field_resolver_operation(
            &rewriter,
            operation.field_at(&["reviews", "product"]).unwrap(),
            "Review",
            "Review",
            json!({ "__typename": "Review", "id": "r1" }),
        )
        .unwrap();

        assert_eq!(
            built.query,
            normalize(
                "query EntitiesQuery($representations: [_Any!]!, $locale: String, $withPrice: Boolean!) { \
                   _entities(representations: $representations) { \
                     __typename ... on Review { product { ...ProductParts id __typename } } } } \
                 fragment ProductParts on Product { \
                   name(locale: $locale) price @include(if: $withPrice) id __typename }"
            )
        );
        let mut names: Vec<&str> = built.variables.keys().map(String::as_str).collect();
        names.sort();
        assert_eq!(names, vec!["locale", "representations", "withPrice"]);
    }

    #[test]
    fn client_representations_variable_is_reserved() {
        let federation = federation();
        let document = parse_query::<String>(
            "query Q($representations: String) { reviews { product { name(locale: $representations) } } }",
        )
        .unwrap();
        let operation = OperationContext::from_document(&document, None, Map::new()).unwrap();
        let rewriter = federation.rewriter("products", &operation);

        let error = field_resolver_operation(
            &rewriter,
            operation.field_at(&["reviews", "product"]).unwrap(),
            "Review",
            "Review",
            json!({ "__typename": "Review", "id": "r1" }),
        )
        .unwrap_err();

        assert_eq!(error, RewriteError::ReservedVariable);
    }

    #[test]
    fn undeclared_variable_is_an_error() {
        let federation = federation();
        let document = parse_query::<String>("{ reviews(first: $first) { id } }").unwrap();
        let operation = OperationContext::from_document(&document, None, Map::new()).unwrap();
        let rewriter = federation.rewriter("reviews", &operation);

        let error = root_operation(
            &rewriter,
            OperationKind::Query,
            operation.field_at(&["reviews"]).unwrap(),
        )
        .unwrap_err();

        assert_eq!(error, RewriteError::UndefinedVariable("first".to_string()));
    }
}
