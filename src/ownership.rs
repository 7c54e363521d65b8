use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use crate::schema_registry::{ServiceRuntime, is_root_type};

/// What happens when two services both define the same non-root type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollisionPolicy {
    #[default]
    FailFast,
    LastWins,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum OwnershipError {
    #[error("type '{type_name}' is declared by both '{first}' and '{second}'")]
    Conflict {
        type_name: String,
        first: String,
        second: String,
    },
    #[error("field '{type_name}.{field}' is declared by both '{first}' and '{second}'")]
    FieldConflict {
        type_name: String,
        field: String,
        first: String,
        second: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Owner {
    /// Root operation types: every field is owned separately.
    Split,
    Service(String),
}

/// Type name to owning service, built once after the registry is up.
#[derive(Debug, Default)]
pub struct OwnershipIndex {
    owners: HashMap<String, Owner>,
    root_fields: HashMap<String, HashMap<String, String>>,
    contributors: HashMap<String, HashMap<String, String>>,
    entity_keys: HashMap<String, Vec<String>>,
}

impl OwnershipIndex {
    pub fn build(
        services: &[Arc<ServiceRuntime>],
        policy: CollisionPolicy,
    ) -> Result<Self, OwnershipError> {
        let mut index = OwnershipIndex::default();

        for root in ["Query", "Mutation", "Subscription"] {
            index.owners.insert(root.to_string(), Owner::Split);
        }

        for service in services {
            let name = service.name();

            for (type_name, fields) in sorted(service.type_map()) {
                if is_root_type(type_name) {
                    let owners = index.root_fields.entry(type_name.clone()).or_default();
                    for field in fields {
                        claim_field(owners, type_name, field, name, policy)?;
                    }
                    continue;
                }

                match index.owners.get(type_name) {
                    Some(Owner::Service(previous)) if previous != name => match policy {
                        CollisionPolicy::FailFast => {
                            return Err(OwnershipError::Conflict {
                                type_name: type_name.clone(),
                                first: previous.clone(),
                                second: name.to_string(),
                            });
                        }
                        CollisionPolicy::LastWins => {
                            tracing::warn!(
                                type_name = %type_name,
                                previous = %previous,
                                service = %name,
                                "type declared by several services, last one wins"
                            );
                        }
                    },
                    _ => {}
                }
                index
                    .owners
                    .insert(type_name.clone(), Owner::Service(name.to_string()));
            }

            for (type_name, fields) in sorted(service.extensions()) {
                let contributors = index.contributors.entry(type_name.clone()).or_default();
                for field in fields {
                    claim_field(contributors, type_name, field, name, policy)?;
                }
            }

            for (type_name, keys) in service.entity_keys() {
                let merged = index.entity_keys.entry(type_name.clone()).or_default();
                for key in keys {
                    if !merged.contains(key) {
                        merged.push(key.clone());
                    }
                }
            }
        }

        tracing::info!(
            types = index.owners.len(),
            extended_types = index.contributors.len(),
            "ownership index built"
        );
        Ok(index)
    }

    pub fn owner(&self, type_name: &str) -> Option<&Owner> {
        self.owners.get(type_name)
    }

    /// The service owning `type_name`. Root types and unknown types have none.
    pub fn owner_of(&self, type_name: &str) -> Option<&str> {
        match self.owners.get(type_name)? {
            Owner::Service(service) => Some(service.as_str()),
            Owner::Split => None,
        }
    }

    pub fn is_split(&self, type_name: &str) -> bool {
        matches!(self.owners.get(type_name), Some(Owner::Split))
    }

    /// The service declaring a root field (`Query.me`, `Mutation.createUser`).
    pub fn root_field_owner(&self, type_name: &str, field: &str) -> Option<&str> {
        self.root_fields
            .get(type_name)?
            .get(field)
            .map(String::as_str)
    }

    /// The service that added `field` to `type_name` through `extend type`.
    pub fn contributor_of(&self, type_name: &str, field: &str) -> Option<&str> {
        self.contributors
            .get(type_name)?
            .get(field)
            .map(String::as_str)
    }

    pub fn entity_keys(&self, type_name: &str) -> &[String] {
        self.entity_keys
            .get(type_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn owned_types(&self) -> BTreeMap<&str, &str> {
        self.owners
            .iter()
            .filter_map(|(type_name, owner)| match owner {
                Owner::Service(service) => Some((type_name.as_str(), service.as_str())),
                Owner::Split => None,
            })
            .collect()
    }
}

fn sorted<V>(map: &HashMap<String, V>) -> BTreeMap<&String, &V> {
    map.iter().collect()
}

fn claim_field(
    owners: &mut HashMap<String, String>,
    type_name: &str,
    field: &str,
    service: &str,
    policy: CollisionPolicy,
) -> Result<(), OwnershipError> {
    if let Some(previous) = owners.get(field) {
        if previous != service && policy == CollisionPolicy::FailFast {
            return Err(OwnershipError::FieldConflict {
                type_name: type_name.to_string(),
                field: field.to_string(),
                first: previous.clone(),
                second: service.to_string(),
            });
        }
    }
    owners.insert(field.to_string(), service.to_string());
    Ok(())
}
