//! Structural diff between two schema snapshots
//!
//! Attributes are matched by their stable id first, then by name, so a
//! renamed attribute shows up as [`SchemaChange::AttributeRenamed`] rather
//! than as a remove/add pair.

use std::collections::HashSet;

use super::{AttributeSchema, Cardinality, NodeSchema, RelationshipSchema, SchemaBranch, SchemaPath};

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    NodeAdded {
        kind: String,
    },
    NodeRemoved {
        kind: String,
    },
    AttributeAdded {
        kind: String,
        attribute: AttributeSchema,
    },
    AttributeRemoved {
        kind: String,
        attribute: AttributeSchema,
    },
    AttributeRenamed {
        kind: String,
        previous: AttributeSchema,
        new: AttributeSchema,
    },
    RelationshipAdded {
        kind: String,
        relationship: RelationshipSchema,
    },
    RelationshipRemoved {
        kind: String,
        relationship: RelationshipSchema,
    },
    CardinalityChanged {
        kind: String,
        relationship: String,
        previous: Cardinality,
        new: Cardinality,
    },
}

impl SchemaChange {
    /// The schema element the change applies to
    pub fn path(&self) -> SchemaPath {
        match self {
            SchemaChange::NodeAdded { kind } | SchemaChange::NodeRemoved { kind } => {
                SchemaPath::node(kind.as_str())
            }
            SchemaChange::AttributeAdded { kind, attribute }
            | SchemaChange::AttributeRemoved { kind, attribute } => {
                SchemaPath::attribute(kind.as_str(), attribute.name.as_str())
            }
            SchemaChange::AttributeRenamed { kind, new, .. } => {
                SchemaPath::attribute(kind.as_str(), new.name.as_str())
            }
            SchemaChange::RelationshipAdded { kind, relationship }
            | SchemaChange::RelationshipRemoved { kind, relationship } => {
                SchemaPath::relationship(kind.as_str(), relationship.name.as_str())
            }
            SchemaChange::CardinalityChanged {
                kind, relationship, ..
            } => SchemaPath::relationship(kind.as_str(), relationship.as_str()),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            SchemaChange::NodeAdded { kind }
            | SchemaChange::NodeRemoved { kind }
            | SchemaChange::AttributeAdded { kind, .. }
            | SchemaChange::AttributeRemoved { kind, .. }
            | SchemaChange::AttributeRenamed { kind, .. }
            | SchemaChange::RelationshipAdded { kind, .. }
            | SchemaChange::RelationshipRemoved { kind, .. }
            | SchemaChange::CardinalityChanged { kind, .. } => kind,
        }
    }
}

/// Ordered list of changes turning one snapshot into another
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaDiff {
    pub changes: Vec<SchemaChange>,
}

impl SchemaDiff {
    pub fn between(previous: &SchemaBranch, next: &SchemaBranch) -> Self {
        let mut changes = Vec::new();

        for node in next.nodes() {
            match previous.get(&node.kind) {
                Ok(prev) => diff_node(prev, node, &mut changes),
                Err(_) => changes.push(SchemaChange::NodeAdded {
                    kind: node.kind.clone(),
                }),
            }
        }
        for node in previous.nodes() {
            if !next.has(&node.kind) {
                changes.push(SchemaChange::NodeRemoved {
                    kind: node.kind.clone(),
                });
            }
        }

        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Kinds whose persisted definition differs
    pub fn touched_kinds(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.changes
            .iter()
            .map(SchemaChange::kind)
            .filter(|k| seen.insert(*k))
            .collect()
    }
}

fn diff_node(prev: &NodeSchema, next: &NodeSchema, changes: &mut Vec<SchemaChange>) {
    let kind = next.kind.clone();
    let mut matched: HashSet<usize> = HashSet::new();

    for attr in &next.attributes {
        let by_id = attr.id.as_ref().and_then(|id| {
            prev.attributes
                .iter()
                .position(|p| p.id.as_ref() == Some(id))
        });
        let by_name = || {
            prev.attributes
                .iter()
                .position(|p| p.name == attr.name && (p.id.is_none() || attr.id.is_none()))
        };
        match by_id.or_else(by_name) {
            Some(idx) if !matched.contains(&idx) => {
                matched.insert(idx);
                let previous = &prev.attributes[idx];
                if previous.name != attr.name {
                    changes.push(SchemaChange::AttributeRenamed {
                        kind: kind.clone(),
                        previous: previous.clone(),
                        new: attr.clone(),
                    });
                }
            }
            _ => changes.push(SchemaChange::AttributeAdded {
                kind: kind.clone(),
                attribute: attr.clone(),
            }),
        }
    }
    for (idx, attr) in prev.attributes.iter().enumerate() {
        if !matched.contains(&idx) {
            changes.push(SchemaChange::AttributeRemoved {
                kind: kind.clone(),
                attribute: attr.clone(),
            });
        }
    }

    for rel in &next.relationships {
        match prev.relationships.iter().find(|p| p.name == rel.name) {
            Some(previous) if previous.cardinality != rel.cardinality => {
                changes.push(SchemaChange::CardinalityChanged {
                    kind: kind.clone(),
                    relationship: rel.name.clone(),
                    previous: previous.cardinality,
                    new: rel.cardinality,
                });
            }
            Some(_) => {}
            None => changes.push(SchemaChange::RelationshipAdded {
                kind: kind.clone(),
                relationship: rel.clone(),
            }),
        }
    }
    for rel in &prev.relationships {
        if !next.relationships.iter().any(|r| r.name == rel.name) {
            changes.push(SchemaChange::RelationshipRemoved {
                kind: kind.clone(),
                relationship: rel.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AttributeKind;
    use pretty_assertions::assert_eq;

    fn car(attrs: Vec<AttributeSchema>, cardinality: Cardinality) -> NodeSchema {
        let mut node = NodeSchema::new("TestCar")
            .relationship(RelationshipSchema::new("owner", "TestPerson", cardinality));
        node.attributes = attrs;
        node
    }

    fn person() -> NodeSchema {
        NodeSchema::new("TestPerson").attribute(AttributeSchema::new("name", AttributeKind::Text))
    }

    fn with_id(name: &str, id: &str) -> AttributeSchema {
        let mut attr = AttributeSchema::new(name, AttributeKind::Text);
        attr.id = Some(id.to_string());
        attr
    }

    #[test]
    fn test_identical_snapshots_have_no_changes() {
        let schema = SchemaBranch::new(vec![car(vec![with_id("color", "a1")], Cardinality::Many), person()]).unwrap();
        assert!(SchemaDiff::between(&schema, &schema).is_empty());
    }

    #[test]
    fn test_rename_detected_through_id() {
        let before = SchemaBranch::new(vec![car(vec![with_id("color", "a1")], Cardinality::Many), person()]).unwrap();
        let after = SchemaBranch::new(vec![car(vec![with_id("new-color", "a1")], Cardinality::Many), person()]).unwrap();
        let diff = SchemaDiff::between(&before, &after);
        assert_eq!(diff.len(), 1);
        match &diff.changes[0] {
            SchemaChange::AttributeRenamed { previous, new, .. } => {
                assert_eq!(previous.name, "color");
                assert_eq!(new.name, "new-color");
            }
            other => panic!("unexpected change {:?}", other),
        }
        assert_eq!(diff.changes[0].path(), SchemaPath::attribute("TestCar", "new-color"));
    }

    #[test]
    fn test_rename_without_ids_is_remove_and_add() {
        let before = SchemaBranch::new(vec![car(vec![AttributeSchema::new("color", AttributeKind::Text)], Cardinality::Many), person()]).unwrap();
        let after = SchemaBranch::new(vec![car(vec![AttributeSchema::new("paint", AttributeKind::Text)], Cardinality::Many), person()]).unwrap();
        let diff = SchemaDiff::between(&before, &after);
        assert!(matches!(diff.changes[0], SchemaChange::AttributeAdded { .. }));
        assert!(matches!(diff.changes[1], SchemaChange::AttributeRemoved { .. }));
    }

    #[test]
    fn test_node_and_cardinality_changes() {
        let before = SchemaBranch::new(vec![car(vec![], Cardinality::Many), person()]).unwrap();
        let boat = NodeSchema::new("TestBoat");
        let after = SchemaBranch::new(vec![car(vec![], Cardinality::One), person(), boat]).unwrap();

        let diff = SchemaDiff::between(&before, &after);
        assert_eq!(
            diff.changes,
            vec![
                SchemaChange::NodeAdded { kind: "TestBoat".into() },
                SchemaChange::CardinalityChanged {
                    kind: "TestCar".into(),
                    relationship: "owner".into(),
                    previous: Cardinality::Many,
                    new: Cardinality::One,
                },
            ]
        );
        assert_eq!(diff.touched_kinds(), vec!["TestBoat", "TestCar"]);

        let reverse = SchemaDiff::between(&after, &before);
        assert!(reverse
            .changes
            .iter()
            .any(|c| matches!(c, SchemaChange::NodeRemoved { kind } if kind == "TestBoat")));
    }
}
