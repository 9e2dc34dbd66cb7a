//! Peer set of one relationship on one node

use crate::error::{GraphError, Result};
use crate::schema::{Cardinality, RelationshipSchema};

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipManager {
    schema: RelationshipSchema,
    /// Kind of the owning node
    kind: String,
    peers: Vec<String>,
}

impl RelationshipManager {
    pub fn new(schema: RelationshipSchema, kind: impl Into<String>) -> Self {
        Self {
            schema,
            kind: kind.into(),
            peers: Vec::new(),
        }
    }

    pub(crate) fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &RelationshipSchema {
        &self.schema
    }

    /// Shared name of the `Relationship` vertices backing this relationship
    pub fn identifier(&self) -> String {
        self.schema.identifier_for(&self.kind)
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// The single peer of a `one` relationship
    pub fn peer(&self) -> Option<&str> {
        self.peers.first().map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.iter().any(|p| p == id)
    }

    fn cardinality_error(&self) -> GraphError {
        GraphError::validation(
            self.schema.name.as_str(),
            format!(
                "{}.{} has cardinality one and cannot hold more than one peer",
                self.kind, self.schema.name
            ),
        )
    }

    /// Replace the peer of the relationship (`None` clears it)
    pub fn set(&mut self, peer: Option<String>) {
        self.peers = peer.into_iter().collect();
    }

    /// Add a peer; a peer already present is a no-op
    pub fn add_peer(&mut self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        if self.contains(&id) {
            return Ok(());
        }
        if self.schema.cardinality == Cardinality::One && !self.peers.is_empty() {
            return Err(self.cardinality_error());
        }
        self.peers.push(id);
        Ok(())
    }

    pub fn remove_peer(&mut self, id: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p != id);
        self.peers.len() != before
    }

    pub fn set_peers<I, S>(&mut self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut peers: Vec<String> = Vec::new();
        for id in ids {
            let id = id.into();
            if !peers.contains(&id) {
                peers.push(id);
            }
        }
        if self.schema.cardinality == Cardinality::One && peers.len() > 1 {
            return Err(self.cardinality_error());
        }
        self.peers = peers;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema.cardinality == Cardinality::One && self.peers.len() > 1 {
            return Err(self.cardinality_error());
        }
        if !self.schema.optional && self.peers.is_empty() {
            return Err(GraphError::validation(
                self.schema.name.as_str(),
                format!("{}.{} requires at least one peer", self.kind, self.schema.name),
            ));
        }
        Ok(())
    }
}
