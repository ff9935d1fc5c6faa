//! Relationship mutations and back-population.
//!
//! Assigning one side of a bidirectional relationship updates the inverse
//! side when it is in memory. Inverse collections of persistent instances
//! that were never loaded are left alone; the database reflects the change
//! after flush.

use crate::attributes::{AttrValue, InstanceId, InstanceState};
use crate::Session;
use relmap_core::{Connection, Error, RelationshipDescriptor, Result};
use std::sync::Arc;

impl<C: Connection> Session<C> {
    /// Point a many-to-one or one-to-one relationship at `target`.
    pub fn set_related(
        &mut self,
        id: InstanceId,
        attr: &str,
        target: Option<InstanceId>,
    ) -> Result<()> {
        let rel = self.relationship(id, attr)?;
        if rel.uselist {
            return Err(Error::invalid_request(format!(
                "'{}' is a collection; use set_collection, append or remove",
                attr
            )));
        }
        if let Some(target) = target {
            self.check_target(&rel, target)?;
        }

        let previous = self
            .instance(id)?
            .slot(attr)
            .and_then(|s| s.current.as_reference())
            .flatten();
        let entity = self.instance(id)?.entity().to_string();
        self.assign_attribute(id, &entity, attr, AttrValue::Reference(target))?;

        if previous != target {
            if let Some(old) = previous {
                self.populate_inverse(&rel, id, old, false)?;
            }
            if let Some(new) = target {
                self.populate_inverse(&rel, id, new, true)?;
            }
        }
        Ok(())
    }

    /// Replace a collection.
    pub fn set_collection(
        &mut self,
        id: InstanceId,
        attr: &str,
        items: Vec<InstanceId>,
    ) -> Result<()> {
        let rel = self.relationship(id, attr)?;
        if !rel.uselist {
            return Err(Error::invalid_request(format!(
                "'{}' is a scalar reference; use set_related",
                attr
            )));
        }
        for &item in &items {
            self.check_target(&rel, item)?;
        }
        let mut unique = Vec::with_capacity(items.len());
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }

        let previous = self
            .instance(id)?
            .slot(attr)
            .and_then(|s| s.current.as_collection())
            .map(<[InstanceId]>::to_vec)
            .unwrap_or_default();
        let entity = self.instance(id)?.entity().to_string();
        self.assign_attribute(id, &entity, attr, AttrValue::Collection(unique.clone()))?;

        for old in previous.iter().filter(|o| !unique.contains(o)) {
            self.populate_inverse(&rel, id, *old, false)?;
        }
        for new in unique.iter().filter(|n| !previous.contains(n)) {
            self.populate_inverse(&rel, id, *new, true)?;
        }
        Ok(())
    }

    /// Add `item` to a collection. Appending a member twice is a no-op.
    pub fn append(&mut self, id: InstanceId, attr: &str, item: InstanceId) -> Result<()> {
        let mut items = self.collection_for_update(id, attr)?;
        if items.contains(&item) {
            return Ok(());
        }
        items.push(item);
        self.set_collection(id, attr, items)
    }

    /// Remove `item` from a collection.
    pub fn remove(&mut self, id: InstanceId, attr: &str, item: InstanceId) -> Result<()> {
        let mut items = self.collection_for_update(id, attr)?;
        let before = items.len();
        items.retain(|i| *i != item);
        if items.len() == before {
            return Err(Error::invalid_request(format!(
                "{} is not a member of '{}' on {}",
                item, attr, id
            )));
        }
        self.set_collection(id, attr, items)
    }

    fn relationship(&self, id: InstanceId, attr: &str) -> Result<RelationshipDescriptor> {
        let instance = self.instance(id)?;
        let descriptor = self.mapper.require(instance.entity())?;
        descriptor.find_relationship(attr).cloned().ok_or_else(|| {
            Error::invalid_request(format!(
                "{} has no relationship '{}'",
                descriptor.name, attr
            ))
        })
    }

    fn check_target(&self, rel: &RelationshipDescriptor, target: InstanceId) -> Result<()> {
        let entity = self.instance(target)?.entity();
        if entity != rel.target {
            return Err(Error::invalid_request(format!(
                "'{}' holds {} instances, got {} ({})",
                rel.name, rel.target, target, entity
            )));
        }
        Ok(())
    }

    /// Current members of a collection, for an in-place edit.
    ///
    /// A persistent instance must have the collection loaded: editing an
    /// unknown collection would lose the members the database holds.
    fn collection_for_update(&self, id: InstanceId, attr: &str) -> Result<Vec<InstanceId>> {
        let rel = self.relationship(id, attr)?;
        if !rel.uselist {
            return Err(Error::invalid_request(format!(
                "'{}' is a scalar reference; use set_related",
                attr
            )));
        }
        let instance = self.instance(id)?;
        match instance.slot(attr) {
            Some(slot) => Ok(slot.current.as_collection().map(<[InstanceId]>::to_vec).unwrap_or_default()),
            None => match instance.state() {
                InstanceState::Transient | InstanceState::Pending => Ok(Vec::new()),
                _ => Err(Error::invalid_request(format!(
                    "collection '{}' of {} is not loaded; load it with get_attr first",
                    attr, id
                ))),
            },
        }
    }

    /// Mirror a link between `owner` and `target` onto the inverse side.
    fn populate_inverse(
        &mut self,
        rel: &RelationshipDescriptor,
        owner: InstanceId,
        target: InstanceId,
        linked: bool,
    ) -> Result<()> {
        let Some(inverse_name) = rel.back_populates.as_deref() else {
            return Ok(());
        };
        let mapper = Arc::clone(&self.mapper);
        let inverse = mapper
            .require(&rel.target)?
            .find_relationship(inverse_name)
            .ok_or_else(|| {
                Error::config(format!(
                    "'{}' back-populates missing relationship '{}.{}'",
                    rel.name, rel.target, inverse_name
                ))
            })?;

        let instance = self.instance(target)?;
        let slot = instance.slot(inverse_name).map(|s| s.current.clone());
        let unknown = slot.is_none()
            && !matches!(
                instance.state(),
                InstanceState::Transient | InstanceState::Pending
            );

        if inverse.uselist {
            if unknown {
                return Ok(());
            }
            let mut members = slot
                .as_ref()
                .and_then(AttrValue::as_collection)
                .map(<[InstanceId]>::to_vec)
                .unwrap_or_default();
            let present = members.contains(&owner);
            if linked == present {
                return Ok(());
            }
            if linked {
                members.push(owner);
            } else {
                members.retain(|m| *m != owner);
            }
            self.write_inverse(target, inverse_name, AttrValue::Collection(members));
            return Ok(());
        }

        let current = slot.as_ref().and_then(AttrValue::as_reference).flatten();
        if linked {
            if current == Some(owner) {
                return Ok(());
            }
            self.write_inverse(target, inverse_name, AttrValue::Reference(Some(owner)));
            // The target leaves its previous owner's loaded collection.
            if let Some(previous) = current {
                let detach = self
                    .instance(previous)?
                    .slot(&rel.name)
                    .and_then(|s| s.current.as_collection())
                    .map(|items| items.iter().copied().filter(|i| *i != target).collect::<Vec<_>>());
                if let Some(items) = detach {
                    self.write_inverse(previous, &rel.name, AttrValue::Collection(items));
                }
            }
        } else if current == Some(owner) {
            self.write_inverse(target, inverse_name, AttrValue::Reference(None));
        }
        Ok(())
    }

    fn write_inverse(&mut self, id: InstanceId, attr: &str, value: AttrValue) {
        if self.contains(id) {
            self.touch(id);
        }
        if let Some(instance) = self.instances.get_mut(&id) {
            tracing::trace!(instance = %id, attribute = attr, "Back-populated");
            instance.assign(attr, value);
        }
    }
}
