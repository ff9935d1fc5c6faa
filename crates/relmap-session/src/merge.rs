//! Merging outside state into the session.
//!
//! `merge` copies the state of a transient or detached instance onto the
//! session's instance with the same identity, loading that instance (or
//! creating a pending one) as needed. Relationships configured with the
//! `merge` cascade are merged too; a source that is reached twice maps to
//! the same target, so cyclic graphs terminate.

use crate::attributes::{AttrValue, Instance, InstanceId, InstanceState};
use crate::config::UnloadedCollectionPolicy;
use crate::identity_map::IdentityKey;
use crate::Session;
use relmap_core::{Connection, Cx, Error, Outcome};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// How a merged attribute treats a value already on the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// The source value wins.
    #[default]
    Overwrite,
    /// Keep the target's value when it has one in memory.
    KeepExisting,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Query the database for a target missing from the identity map. With
    /// `false` the source is registered as persistent without a query and
    /// must describe the row as it is.
    pub load: bool,
    /// Overrides `SessionConfig::unloaded_collections` for this merge.
    pub unloaded_collections: Option<UnloadedCollectionPolicy>,
    pub default_policy: MergePolicy,
    fields: HashMap<String, MergePolicy>,
}

impl MergeOptions {
    pub fn new() -> Self {
        Self {
            load: true,
            ..Self::default()
        }
    }

    pub fn load(mut self, value: bool) -> Self {
        self.load = value;
        self
    }

    pub fn unloaded_collections(mut self, policy: UnloadedCollectionPolicy) -> Self {
        self.unloaded_collections = Some(policy);
        self
    }

    pub fn default_policy(mut self, policy: MergePolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn field(mut self, attr: &str, policy: MergePolicy) -> Self {
        self.fields.insert(attr.to_string(), policy);
        self
    }

    pub fn policy(&self, attr: &str) -> MergePolicy {
        self.fields.get(attr).copied().unwrap_or(self.default_policy)
    }
}

impl<C: Connection> Session<C> {
    // ========================================================================
    // Merge
    // ========================================================================

    /// Merge the state of `source` into the session and return the instance
    /// that now carries it.
    ///
    /// A source already pending or persistent here is its own target.
    #[tracing::instrument(level = "debug", skip(self, cx, options))]
    pub async fn merge(
        &mut self,
        cx: &Cx,
        source: InstanceId,
        options: &MergeOptions,
    ) -> Outcome<InstanceId, Error> {
        let mut mapping: BTreeMap<InstanceId, InstanceId> = BTreeMap::new();
        let mut queue = vec![source];

        // Resolve every reachable source to its target, copying columns.
        while let Some(next) = queue.pop() {
            if mapping.contains_key(&next) {
                continue;
            }
            let target = try_outcome!(self.merge_target(cx, next, options).await);
            mapping.insert(next, target);

            let relationships = try_result!(self.relationships_of(next));
            let instance = try_result!(self.instance(next));
            for rel in relationships.iter().filter(|r| r.cascade.merge) {
                if let Some(slot) = instance.slot(&rel.name) {
                    queue.extend(slot.current.referenced());
                }
            }
        }

        // Wire relationships between the targets.
        let policy = options
            .unloaded_collections
            .unwrap_or(self.config.unloaded_collections);
        for (&from, &to) in &mapping {
            if from == to {
                continue;
            }
            try_outcome!(self.merge_relationships(cx, from, to, &mapping, policy, options).await);
        }

        let target = mapping.get(&source).copied().unwrap_or(source);
        tracing::debug!(source = %source, target = %target, merged = mapping.len(), "Merged");
        Outcome::Ok(target)
    }

    /// Import an owned instance and merge it.
    pub async fn merge_instance(
        &mut self,
        cx: &Cx,
        instance: Instance,
        options: &MergeOptions,
    ) -> Outcome<InstanceId, Error> {
        let source = try_result!(self.import(instance));
        let target = try_outcome!(self.merge(cx, source, options).await);
        if target != source {
            self.instances.remove(&source);
        }
        Outcome::Ok(target)
    }

    /// Find or create the target for one source and copy its columns.
    async fn merge_target(
        &mut self,
        cx: &Cx,
        source: InstanceId,
        options: &MergeOptions,
    ) -> Outcome<InstanceId, Error> {
        let mapper = Arc::clone(&self.mapper);
        let instance = try_result!(self.instance(source));
        match instance.state() {
            InstanceState::Pending | InstanceState::Persistent => return Outcome::Ok(source),
            InstanceState::Deleted => {
                return Outcome::Err(Error::invalid_request(format!(
                    "instance {} is marked for deletion and cannot be merged",
                    source
                )));
            }
            InstanceState::Transient | InstanceState::Detached => {}
        }
        let descriptor = try_result!(mapper.require(instance.entity()));
        let entity = descriptor.name.clone();
        let key = instance
            .key()
            .cloned()
            .or_else(|| IdentityKey::of(descriptor, instance));
        let columns: Vec<(String, AttrValue)> = instance
            .slots()
            .filter(|(name, _)| descriptor.find_column(name).is_some())
            .map(|(name, slot)| (name.to_string(), slot.current.clone()))
            .collect();

        let existing = match &key {
            None => None,
            Some(key) => match self.identity_map.lookup(key) {
                Some(id) => Some(id),
                None if options.load => try_outcome!(self.fetch_by_key(cx, &entity, key.values()).await),
                None => None,
            },
        };

        if let Some(target) = existing {
            if try_result!(self.instance(target)).state() == InstanceState::Deleted {
                return Outcome::Err(Error::invalid_request(format!(
                    "merge target {} is marked for deletion",
                    target
                )));
            }
            self.touch(target);
            let target_instance = try_result!(self.instance_mut(target));
            for (name, value) in columns {
                let keep = options.policy(&name) == MergePolicy::KeepExisting
                    && target_instance.is_loaded(&name);
                if keep {
                    continue;
                }
                if options.load {
                    target_instance.assign(&name, value);
                } else {
                    target_instance.load(&name, value);
                }
            }
            return Outcome::Ok(target);
        }

        let mut copy = Instance::new(entity.clone());
        match (&key, options.load) {
            (Some(key), false) => {
                for (name, value) in columns {
                    copy.load(&name, value);
                }
                copy.set_state(InstanceState::Persistent);
                copy.set_key(Some(key.clone()));
                let target = self.allocate(copy);
                try_result!(self.identity_map.add(key.clone(), target));
                tracing::trace!(instance = %target, key = %key, "Registered merged instance without loading");
                Outcome::Ok(target)
            }
            _ => {
                for (name, value) in columns {
                    copy.assign(&name, value);
                }
                let target = self.allocate(copy);
                self.touch(target);
                try_result!(self.instance_mut(target)).set_state(InstanceState::Pending);
                Outcome::Ok(target)
            }
        }
    }

    async fn merge_relationships(
        &mut self,
        cx: &Cx,
        source: InstanceId,
        target: InstanceId,
        mapping: &BTreeMap<InstanceId, InstanceId>,
        policy: UnloadedCollectionPolicy,
        options: &MergeOptions,
    ) -> Outcome<(), Error> {
        let relationships = try_result!(self.relationships_of(source));
        for rel in relationships {
            let source_value = try_result!(self.instance(source))
                .slot(&rel.name)
                .map(|s| s.current.clone());
            let target_loaded = try_result!(self.instance(target)).is_loaded(&rel.name);
            if options.policy(&rel.name) == MergePolicy::KeepExisting && target_loaded {
                continue;
            }

            let value = match source_value {
                Some(value) => {
                    let translate = |id: InstanceId| -> Option<InstanceId> {
                        if rel.cascade.merge {
                            mapping.get(&id).copied()
                        } else if self.contains(id) {
                            Some(id)
                        } else {
                            None
                        }
                    };
                    match value {
                        AttrValue::Reference(r) => AttrValue::Reference(r.and_then(translate)),
                        AttrValue::Collection(items) => {
                            AttrValue::Collection(items.into_iter().filter_map(translate).collect())
                        }
                        AttrValue::Scalar(_) => continue,
                    }
                }
                None if rel.uselist && policy == UnloadedCollectionPolicy::TreatUnloadedAsEmpty => {
                    let persistent =
                        try_result!(self.instance(target)).state() == InstanceState::Persistent;
                    if persistent && !target_loaded {
                        // Removing members needs the current membership.
                        try_outcome!(self.load_relationship(cx, target, &rel.name).await);
                    }
                    tracing::debug!(
                        target = %target,
                        relationship = %rel.name,
                        "Unloaded source collection merged as empty"
                    );
                    AttrValue::Collection(Vec::new())
                }
                None => continue,
            };

            self.touch(target);
            let target_instance = try_result!(self.instance_mut(target));
            if options.load {
                target_instance.assign(&rel.name, value);
            } else if target_instance.is_loaded(&rel.name) {
                target_instance.assign(&rel.name, value);
            } else {
                target_instance.load(&rel.name, value);
            }
        }
        Outcome::Ok(())
    }
}
