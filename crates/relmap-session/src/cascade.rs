//! Cascades along loaded relationships.
//!
//! Save-update pulls transient instances into the session, delete and
//! delete-orphan mark related instances for deletion. Only loaded
//! relationship slots are walked: a collection that was never loaded is
//! never fetched as a side effect of flushing.

use crate::attributes::{InstanceId, InstanceState};
use crate::history;
use crate::Session;
use relmap_core::{Connection, Error, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

impl<C: Connection> Session<C> {
    /// Pull transient instances reachable from `root` through save-update
    /// relationships into the session.
    pub(crate) fn cascade_save_update(&mut self, root: InstanceId) -> Result<()> {
        let mut queue = vec![root];
        let mut seen = BTreeSet::new();
        while let Some(id) = queue.pop() {
            if !seen.insert(id) {
                continue;
            }
            for rel in self.relationships_of(id)? {
                if !rel.cascade.save_update {
                    continue;
                }
                let Some(slot) = self.instance(id)?.slot(&rel.name) else {
                    continue;
                };
                for related in slot.current.referenced() {
                    match self.instance(related)?.state() {
                        InstanceState::Transient => {
                            tracing::trace!(
                                instance = %related,
                                via = %rel.name,
                                "Cascading save-update"
                            );
                            self.set_state(related, InstanceState::Pending)?;
                            queue.push(related);
                        }
                        InstanceState::Pending | InstanceState::Persistent => queue.push(related),
                        InstanceState::Deleted => {}
                        InstanceState::Detached => {
                            return Err(Error::invalid_request(format!(
                                "instance {} refers to detached instance {} through '{}'; \
                                 merge or add it first",
                                id, related, rel.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn cascade_all_save_update(
        &mut self,
        scope: Option<&BTreeSet<InstanceId>>,
    ) -> Result<()> {
        let roots = self.ids_where(|i| {
            matches!(
                i.state(),
                InstanceState::Pending | InstanceState::Persistent
            )
        });
        for id in roots {
            if scope.is_none_or(|s| s.contains(&id)) {
                self.cascade_save_update(id)?;
            }
        }
        Ok(())
    }

    /// Mark instances reachable from a deleted `root` through delete or
    /// delete-orphan relationships. Pending ones leave the session instead.
    pub(crate) fn cascade_delete(&mut self, root: InstanceId) -> Result<()> {
        let mut queue = vec![root];
        let mut seen = BTreeSet::new();
        while let Some(id) = queue.pop() {
            if !seen.insert(id) {
                continue;
            }
            for rel in self.relationships_of(id)? {
                if !(rel.cascade.delete || rel.cascade.delete_orphan) {
                    continue;
                }
                let Some(slot) = self.instance(id)?.slot(&rel.name) else {
                    continue;
                };
                for related in slot.current.referenced() {
                    match self.instance(related)?.state() {
                        InstanceState::Persistent => {
                            tracing::trace!(
                                instance = %related,
                                via = %rel.name,
                                "Cascading delete"
                            );
                            self.set_state(related, InstanceState::Deleted)?;
                            queue.push(related);
                        }
                        InstanceState::Pending => {
                            self.expunge_one(related)?;
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete instances removed from a delete-orphan relationship that no
    /// other owner holds. Pending orphans simply leave the session.
    pub(crate) fn resolve_orphans(&mut self, scope: Option<&BTreeSet<InstanceId>>) -> Result<()> {
        let mapper = Arc::clone(&self.mapper);
        let mut candidates = Vec::new();
        for (&id, instance) in &self.instances {
            if instance.state() == InstanceState::Deleted
                || !instance.state().in_session()
                || scope.is_some_and(|s| !s.contains(&id))
            {
                continue;
            }
            for rel in mapper.relationships(instance.entity())? {
                if rel.cascade.delete_orphan {
                    let removed = history::related_history(instance.slot(&rel.name)).deleted;
                    candidates.extend(removed);
                }
            }
        }

        // A pending child no parent holds was never attached, or was
        // detached before its first flush.
        let owned_entities: BTreeSet<&str> = mapper
            .entities()
            .iter()
            .flat_map(|e| &e.relationships)
            .filter(|r| r.cascade.delete_orphan && r.is_one_to_many())
            .map(|r| r.target.as_str())
            .collect();
        candidates.extend(self.ids_where(|i| {
            i.state() == InstanceState::Pending && owned_entities.contains(i.entity())
        }));

        for orphan in candidates {
            let state = self.instance(orphan)?.state();
            if !matches!(state, InstanceState::Pending | InstanceState::Persistent)
                || self.has_owner(orphan)?
                || (state == InstanceState::Pending && self.names_parent(orphan)?)
            {
                continue;
            }
            tracing::debug!(instance = %orphan, "Deleting orphan");
            if state == InstanceState::Persistent {
                self.set_state(orphan, InstanceState::Deleted)?;
                self.cascade_delete(orphan)?;
            } else {
                self.expunge_one(orphan)?;
            }
        }
        Ok(())
    }

    /// Whether any live instance still holds `id` in a delete-orphan
    /// relationship.
    fn has_owner(&self, id: InstanceId) -> Result<bool> {
        for instance in self.instances.values() {
            if !matches!(
                instance.state(),
                InstanceState::Pending | InstanceState::Persistent
            ) {
                continue;
            }
            for rel in self.mapper.relationships(instance.entity())? {
                if rel.cascade.delete_orphan
                    && instance
                        .slot(&rel.name)
                        .is_some_and(|s| s.current.referenced().contains(&id))
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Whether a pending instance points at a parent on its own side, through
    /// a many-to-one reference or a foreign key value.
    fn names_parent(&self, id: InstanceId) -> Result<bool> {
        let instance = self.instance(id)?;
        let mut foreign_keys = Vec::new();
        for entity in self.mapper.entities() {
            for rel in &entity.relationships {
                if rel.is_one_to_many() && rel.target == instance.entity() {
                    foreign_keys.push(&rel.foreign_key);
                }
            }
        }
        for rel in self.mapper.relationships(instance.entity())? {
            if rel.is_many_to_one() {
                foreign_keys.push(&rel.foreign_key);
                if instance
                    .slot(&rel.name)
                    .and_then(|s| s.current.as_reference())
                    .is_some_and(|r| r.is_some())
                {
                    return Ok(true);
                }
            }
        }
        Ok(foreign_keys.iter().any(|columns| {
            !columns.is_empty()
                && columns
                    .iter()
                    .all(|c| instance.value(c).is_some_and(|v| !v.is_null()))
        }))
    }

    /// Re-run the delete cascade for deleted instances, picking up
    /// relationships loaded after `delete()` was called. Unloaded
    /// collections are left to the database.
    pub(crate) fn cascade_deletes(&mut self, scope: Option<&BTreeSet<InstanceId>>) -> Result<()> {
        let mut done = BTreeSet::new();
        loop {
            let next: Vec<_> = self
                .deleted()
                .into_iter()
                .filter(|id| !done.contains(id) && scope.is_none_or(|s| s.contains(id)))
                .collect();
            if next.is_empty() {
                return Ok(());
            }
            for id in next {
                done.insert(id);
                self.cascade_delete(id)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{InstanceState, Session};
    use relmap_core::{
        ColumnDescriptor, EntityDescriptor, LinkTable, MapperRegistry, RelationshipDescriptor,
    };
    use relmap_memory::MemoryConnection;
    use std::sync::Arc;

    fn session() -> Session<MemoryConnection> {
        let mapper = Arc::new(
            MapperRegistry::builder()
                .entity(
                    EntityDescriptor::new("Order", "orders")
                        .column(ColumnDescriptor::new("id").primary_key().auto_increment())
                        .relationship(
                            RelationshipDescriptor::one_to_many("lines", "Line", &["order_id"])
                                .cascade("all, delete-orphan")
                                .unwrap(),
                        )
                        .relationship(RelationshipDescriptor::many_to_many(
                            "tags",
                            "Tag",
                            LinkTable::new("order_tag", &["order_id"], &["tag_id"]),
                        )),
                )
                .entity(
                    EntityDescriptor::new("Line", "line")
                        .column(ColumnDescriptor::new("id").primary_key().auto_increment())
                        .column(ColumnDescriptor::new("order_id")),
                )
                .entity(
                    EntityDescriptor::new("Tag", "tag")
                        .column(ColumnDescriptor::new("id").primary_key().auto_increment()),
                )
                .build()
                .unwrap(),
        );
        Session::new(MemoryConnection::new(mapper.as_ref()), mapper)
    }

    #[test]
    fn test_save_update_reaches_collections() {
        let mut session = session();
        let order = session.new_instance("Order").unwrap();
        let line = session.new_instance("Line").unwrap();
        let tag = session.new_instance("Tag").unwrap();
        session.set_collection(order, "lines", vec![line]).unwrap();
        session.set_collection(order, "tags", vec![tag]).unwrap();

        session.add(order).unwrap();
        assert_eq!(session.state(line).unwrap(), InstanceState::Pending);
        assert_eq!(session.state(tag).unwrap(), InstanceState::Pending);
    }

    #[test]
    fn test_delete_of_pending_owner_expunges_children() {
        let mut session = session();
        let order = session.new_instance("Order").unwrap();
        let line = session.new_instance("Line").unwrap();
        session.set_collection(order, "lines", vec![line]).unwrap();
        session.add(order).unwrap();

        session.delete(order).unwrap();
        assert_eq!(session.state(order).unwrap(), InstanceState::Transient);
        assert_eq!(session.state(line).unwrap(), InstanceState::Pending);
    }

    #[test]
    fn test_pending_orphan_leaves_session() {
        let mut session = session();
        let order = session.new_instance("Order").unwrap();
        let line = session.new_instance("Line").unwrap();
        session.set_collection(order, "lines", vec![line]).unwrap();
        session.add(order).unwrap();

        session.remove(order, "lines", line).unwrap();
        session.resolve_orphans(None).unwrap();
        assert_eq!(session.state(line).unwrap(), InstanceState::Transient);
    }
}
