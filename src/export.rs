//! JSON seed export/import.
//!
//! A [`GraphSeed`] is the committed state of one instance in a portable
//! form. Exporting reads a snapshot; importing assigns fresh ids from the
//! target store and writes everything in one transaction, so a seed can be
//! loaded next to existing data.
//!
//! ```text
//! store A → export_json() → seed.json → import_json() → store B
//! ```

use std::collections::HashMap;
use std::io::{Read, Write};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::*;
use crate::storage::{Filter, GraphSnapshot, GraphStore, IdKind};
use crate::tx::{TxMode, WriteSet};
use crate::{Error, Result};

/// Portable graph contents. Ids are local to the seed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSeed {
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
    pub entities: Vec<Entity>,
    pub memberships: Vec<Membership>,
    pub boundaries: Vec<Boundary>,
}

impl From<GraphSnapshot> for GraphSeed {
    fn from(s: GraphSnapshot) -> Self {
        Self {
            nodes: s.nodes,
            links: s.links,
            entities: s.entities,
            memberships: s.memberships,
            boundaries: s.boundaries,
        }
    }
}

impl GraphSeed {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Seed id → store id, per record kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    pub nodes: HashMap<NodeId, NodeId>,
    pub links: HashMap<LinkId, LinkId>,
    pub entities: HashMap<EntityId, EntityId>,
}

impl IdMap {
    fn node(&self, id: NodeId) -> Result<NodeId> {
        self.nodes.get(&id).copied().ok_or_else(|| Error::NotFound(format!("seed node {id}")))
    }

    fn entity(&self, id: EntityId) -> Result<EntityId> {
        self.entities.get(&id).copied().ok_or_else(|| Error::NotFound(format!("seed entity {id}")))
    }
}

/// Export everything matching `filter` as pretty-printed JSON.
pub async fn export_json<S: GraphStore + ?Sized>(
    store: &S,
    filter: &Filter,
    writer: &mut dyn Write,
) -> Result<()> {
    let seed = GraphSeed::from(store.snapshot(filter).await?);
    serde_json::to_writer_pretty(&mut *writer, &seed)?;
    writeln!(writer)?;
    info!(nodes = seed.nodes.len(), links = seed.links.len(), entities = seed.entities.len(), "graph exported");
    Ok(())
}

/// Load a seed into `store` under fresh ids.
///
/// Dangling references (a link to a node the seed does not contain, say)
/// fail the import before anything is written.
pub async fn import_seed<S: GraphStore + ?Sized>(store: &S, seed: GraphSeed) -> Result<IdMap> {
    let mut ids = IdMap::default();
    for n in &seed.nodes {
        ids.nodes.insert(n.id, NodeId(store.allocate_id(IdKind::Node).await?));
    }
    for l in &seed.links {
        ids.links.insert(l.id, LinkId(store.allocate_id(IdKind::Link).await?));
    }
    for e in &seed.entities {
        ids.entities.insert(e.id, EntityId(store.allocate_id(IdKind::Entity).await?));
    }

    let mut writes = WriteSet::default();
    for mut n in seed.nodes {
        n.id = ids.node(n.id)?;
        writes.nodes.push(n);
    }
    for mut l in seed.links {
        l.id = ids.links.get(&l.id).copied().ok_or_else(|| Error::NotFound(format!("seed link {}", l.id)))?;
        l.source = ids.node(l.source)?;
        l.target = ids.node(l.target)?;
        writes.links.push(l);
    }
    for mut e in seed.entities {
        e.id = ids.entity(e.id)?;
        writes.entities.push(e);
    }
    for mut m in seed.memberships {
        m.node = ids.node(m.node)?;
        m.entity = ids.entity(m.entity)?;
        writes.memberships.push(m);
    }
    for mut b in seed.boundaries {
        b.source = ids.entity(b.source)?;
        b.target = ids.entity(b.target)?;
        writes.boundaries.push(b);
    }

    let count = writes.len();
    let mut tx = store.begin_tx(TxMode::ReadWrite).await?;
    if let Err(e) = store.stage(&mut tx, writes).await {
        store.rollback_tx(tx).await?;
        return Err(e);
    }
    store.commit_tx(tx).await?;
    info!(records = count, "seed imported");
    Ok(ids)
}

/// Read a JSON seed and import it.
pub async fn import_json<S: GraphStore + ?Sized>(store: &S, reader: &mut dyn Read) -> Result<IdMap> {
    let mut buf = String::new();
    reader.read_to_string(&mut buf)?;
    import_seed(store, GraphSeed::from_json(&buf)?).await
}
