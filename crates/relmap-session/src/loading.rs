//! Reading from the database: `get`, lazy attribute loads, refresh and
//! expiration.
//!
//! Every query result passes through `load_row`, which consults the identity
//! map first so a row never materializes as a second instance.

use crate::attributes::{AttrValue, Instance, InstanceId, InstanceState, Read};
use crate::identity_map::IdentityKey;
use crate::Session;
use relmap_core::{
    Connection, Cx, Error, Outcome, RelationshipKind, Result, Row, StaleDataError, StaleOperation,
    Statement, Value,
};
use std::collections::BTreeSet;
use std::sync::Arc;

fn missing_row(key: &IdentityKey, operation: StaleOperation) -> Error {
    Error::StaleData(StaleDataError {
        entity: key.entity().to_string(),
        key: key.values().to_vec(),
        operation,
        expected_rows: 1,
        actual_rows: 0,
        version: None,
    })
}

impl<C: Connection> Session<C> {
    // ========================================================================
    // Lookup
    // ========================================================================

    /// Get an instance by primary key.
    ///
    /// The identity map is consulted first; a hit issues no query. An
    /// instance marked deleted reads as absent.
    #[tracing::instrument(level = "debug", skip(self, cx, pk))]
    pub async fn get(
        &mut self,
        cx: &Cx,
        entity: &str,
        pk: &[Value],
    ) -> Outcome<Option<InstanceId>, Error> {
        let mapper = Arc::clone(&self.mapper);
        let descriptor = try_result!(mapper.require(entity));
        if descriptor.primary_key().count() != pk.len() {
            return Outcome::Err(Error::invalid_request(format!(
                "{} has a {}-column primary key, got {} values",
                entity,
                descriptor.primary_key().count(),
                pk.len()
            )));
        }
        let Some(key) = IdentityKey::new(entity, pk.to_vec()) else {
            return Outcome::Err(Error::invalid_request(
                "primary key values must not be NULL",
            ));
        };

        if let Some(id) = self.identity_map.lookup(&key) {
            tracing::trace!(key = %key, instance = %id, "Identity map hit");
            let deleted = try_result!(self.instance(id)).state() == InstanceState::Deleted;
            return Outcome::Ok(if deleted { None } else { Some(id) });
        }

        if self.config.autoflush {
            try_outcome!(self.flush(cx).await);
        }
        self.fetch_by_key(cx, entity, key.values()).await
    }

    /// SELECT one row by primary key and load it.
    pub(crate) async fn fetch_by_key(
        &mut self,
        cx: &Cx,
        entity: &str,
        values: &[Value],
    ) -> Outcome<Option<InstanceId>, Error> {
        let mapper = Arc::clone(&self.mapper);
        let descriptor = try_result!(mapper.require(entity));
        try_outcome!(self.ensure_transaction(cx).await);

        let statement = Statement::Select {
            table: descriptor.table.clone(),
            columns: descriptor.column_names(),
            filter: descriptor.primary_key_names(),
        };
        let rows = try_outcome!(self.connection.query(cx, &statement, values).await);
        match rows.first() {
            Some(row) => Outcome::Ok(Some(try_result!(self.load_row(entity, row)))),
            None => Outcome::Ok(None),
        }
    }

    /// Turn a row into an instance, reusing the identity map entry if one
    /// exists. Attributes already in memory are not overwritten.
    pub(crate) fn load_row(&mut self, entity: &str, row: &Row) -> Result<InstanceId> {
        let mapper = Arc::clone(&self.mapper);
        let descriptor = mapper.require(entity)?;
        let values = descriptor
            .primary_key()
            .map(|c| {
                row.get_by_name(&c.name).cloned().ok_or_else(|| {
                    Error::Custom(format!("row for {} lacks key column {}", entity, c.name))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let key = IdentityKey::new(entity, values)
            .ok_or_else(|| Error::Custom(format!("row for {} has a NULL primary key", entity)))?;

        let columns = row
            .iter()
            .filter(|(name, _)| descriptor.find_column(name).is_some());

        if let Some(id) = self.identity_map.lookup(&key) {
            let instance = self.instance_mut(id)?;
            for (name, value) in columns {
                if !instance.is_loaded(name) {
                    instance.load(name, AttrValue::Scalar(value.clone()));
                }
            }
            return Ok(id);
        }

        let mut instance = Instance::new(entity);
        for (name, value) in columns {
            instance.load(name, AttrValue::Scalar(value.clone()));
        }
        instance.set_state(InstanceState::Persistent);
        instance.set_key(Some(key.clone()));
        let id = self.allocate(instance);
        self.identity_map.add(key, id)?;
        tracing::trace!(instance = %id, entity, "Loaded row");
        Ok(id)
    }

    // ========================================================================
    // Attribute Loading
    // ========================================================================

    /// Read an attribute, loading it from the database if needed.
    pub async fn get_attr(
        &mut self,
        cx: &Cx,
        id: InstanceId,
        attr: &str,
    ) -> Outcome<AttrValue, Error> {
        let mapper = Arc::clone(&self.mapper);
        let instance = try_result!(self.instance(id));
        let descriptor = try_result!(mapper.require(instance.entity()));
        if let Read::Value(value) = try_result!(instance.read(descriptor, attr)) {
            return Outcome::Ok(value);
        }

        if descriptor.find_column(attr).is_some() {
            try_outcome!(self.load_scalars(cx, id).await);
        } else {
            try_outcome!(self.load_relationship(cx, id, attr).await);
        }
        match try_result!(self.instance(id)).slot(attr) {
            Some(slot) => Outcome::Ok(slot.current.clone()),
            None => Outcome::Err(Error::Custom(format!(
                "attribute '{}' of {} could not be loaded",
                attr, id
            ))),
        }
    }

    /// Load every column of `id` that is not in memory.
    pub(crate) async fn load_scalars(&mut self, cx: &Cx, id: InstanceId) -> Outcome<(), Error> {
        let mapper = Arc::clone(&self.mapper);
        let instance = try_result!(self.instance(id));
        let descriptor = try_result!(mapper.require(instance.entity()));
        let key = try_result!(persisted_key(id, instance));
        let missing: Vec<String> = descriptor
            .columns
            .iter()
            .filter(|c| !instance.is_loaded(&c.name))
            .map(|c| c.name.clone())
            .collect();
        if missing.is_empty() {
            return Outcome::Ok(());
        }

        try_outcome!(self.ensure_transaction(cx).await);
        let statement = Statement::Select {
            table: descriptor.table.clone(),
            columns: missing.clone(),
            filter: descriptor.primary_key_names(),
        };
        let rows = try_outcome!(self.connection.query(cx, &statement, key.values()).await);
        let Some(row) = rows.first() else {
            return Outcome::Err(missing_row(&key, StaleOperation::Load));
        };

        let instance = try_result!(self.instance_mut(id));
        for name in &missing {
            if let Some(value) = row.get_by_name(name) {
                instance.load(name, AttrValue::Scalar(value.clone()));
            }
        }
        tracing::trace!(instance = %id, columns = missing.len(), "Loaded columns");
        Outcome::Ok(())
    }

    /// Load one relationship attribute of a persistent instance.
    pub(crate) async fn load_relationship(
        &mut self,
        cx: &Cx,
        id: InstanceId,
        attr: &str,
    ) -> Outcome<(), Error> {
        let mapper = Arc::clone(&self.mapper);
        let instance = try_result!(self.instance(id));
        let descriptor = try_result!(mapper.require(instance.entity()));
        let Some(rel) = descriptor.find_relationship(attr) else {
            return Outcome::Err(Error::invalid_request(format!(
                "{} has no relationship '{}'",
                descriptor.name, attr
            )));
        };
        let key = try_result!(persisted_key(id, instance));
        try_outcome!(self.ensure_transaction(cx).await);

        let value = match rel.kind {
            RelationshipKind::ManyToOne => {
                let instance = try_result!(self.instance(id));
                let fk_loaded = rel.foreign_key.iter().all(|c| instance.is_loaded(c));
                if !fk_loaded {
                    try_outcome!(self.load_scalars(cx, id).await);
                }
                let instance = try_result!(self.instance(id));
                let target_key = rel
                    .foreign_key
                    .iter()
                    .map(|c| instance.value(c).cloned())
                    .collect::<Option<Vec<_>>>()
                    .and_then(|values| IdentityKey::new(rel.target.clone(), values));
                match target_key {
                    None => AttrValue::Reference(None),
                    Some(k) => match self.identity_map.lookup(&k) {
                        Some(target) => AttrValue::Reference(Some(target)),
                        None => AttrValue::Reference(try_outcome!(
                            self.fetch_by_key(cx, &rel.target, k.values()).await
                        )),
                    },
                }
            }
            RelationshipKind::OneToMany => {
                let target = try_result!(mapper.require(&rel.target));
                let statement = Statement::Select {
                    table: target.table.clone(),
                    columns: target.column_names(),
                    filter: rel.foreign_key.clone(),
                };
                let rows = try_outcome!(self.connection.query(cx, &statement, key.values()).await);
                let mut ids = Vec::with_capacity(rows.len());
                for row in &rows {
                    ids.push(try_result!(self.load_row(&rel.target, row)));
                }
                if rel.uselist {
                    AttrValue::Collection(ids)
                } else {
                    AttrValue::Reference(ids.first().copied())
                }
            }
            RelationshipKind::ManyToMany => {
                let Some(link) = &rel.link else {
                    return Outcome::Err(Error::config(format!(
                        "many-to-many '{}' has no link table",
                        rel.name
                    )));
                };
                let statement = Statement::Select {
                    table: link.table.clone(),
                    columns: link.remote_columns.clone(),
                    filter: link.local_columns.clone(),
                };
                let rows = try_outcome!(self.connection.query(cx, &statement, key.values()).await);
                let mut ids = Vec::with_capacity(rows.len());
                for row in &rows {
                    let values = link
                        .remote_columns
                        .iter()
                        .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
                        .collect();
                    let Some(target_key) = IdentityKey::new(rel.target.clone(), values) else {
                        continue;
                    };
                    let target = match self.identity_map.lookup(&target_key) {
                        Some(target) => Some(target),
                        None => try_outcome!(
                            self.fetch_by_key(cx, &rel.target, target_key.values())
                                .await
                        ),
                    };
                    ids.extend(target);
                }
                AttrValue::Collection(ids)
            }
        };

        tracing::trace!(instance = %id, relationship = attr, "Loaded relationship");
        try_result!(self.instance_mut(id)).load(attr, value);
        Outcome::Ok(())
    }

    /// Version columns of instances about to be updated or deleted, when
    /// they are not in memory. The WHERE clause of a versioned statement
    /// cannot be built without them; nothing else is loaded during flush.
    pub(crate) async fn load_version_tokens(
        &mut self,
        cx: &Cx,
        scope: Option<&BTreeSet<InstanceId>>,
    ) -> Outcome<(), Error> {
        let mut needed = Vec::new();
        for (&id, instance) in &self.instances {
            let touched = match instance.state() {
                InstanceState::Deleted => true,
                InstanceState::Persistent => instance.is_modified(),
                _ => false,
            };
            if !touched || scope.is_some_and(|s| !s.contains(&id)) {
                continue;
            }
            let descriptor = try_result!(self.mapper.require(instance.entity()));
            if let Some(version) = descriptor.version_column() {
                if !instance.is_loaded(&version.name) {
                    needed.push((id, descriptor.table.clone(), version.name.clone(), descriptor.primary_key_names()));
                }
            }
        }

        for (id, table, column, filter) in needed {
            let instance = try_result!(self.instance(id));
            let key = try_result!(persisted_key(id, instance));
            let operation = if instance.state() == InstanceState::Deleted {
                StaleOperation::Delete
            } else {
                StaleOperation::Update
            };
            let statement = Statement::Select {
                table,
                columns: vec![column.clone()],
                filter,
            };
            let rows = try_outcome!(self.connection.query(cx, &statement, key.values()).await);
            let Some(value) = rows.first().and_then(|r| r.get_by_name(&column)).cloned() else {
                return Outcome::Err(missing_row(&key, operation));
            };
            tracing::debug!(instance = %id, version = ?value, "Loaded version for flush");
            try_result!(self.instance_mut(id)).load(&column, AttrValue::Scalar(value));
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Expiration
    // ========================================================================

    /// Reload every column now, discarding unflushed changes.
    ///
    /// Relationships configured with `refresh-expire` cascade the refresh to
    /// the loaded related instances.
    pub async fn refresh(&mut self, cx: &Cx, id: InstanceId) -> Outcome<(), Error> {
        let targets = try_result!(self.expire_cascade(id));
        for target in targets {
            try_outcome!(self.load_scalars(cx, target).await);
        }
        tracing::debug!(instance = %id, "Refreshed");
        Outcome::Ok(())
    }

    /// Expire one attribute, or all of them when `attr` is `None`.
    ///
    /// The next read reloads from the database. Expiring everything cascades
    /// along `refresh-expire` relationships.
    pub fn expire(&mut self, id: InstanceId, attr: Option<&str>) -> Result<()> {
        let Some(attr) = attr else {
            self.expire_cascade(id)?;
            return Ok(());
        };
        let instance = self.instance(id)?;
        persisted_key(id, instance)?;
        let descriptor = self.mapper.require(instance.entity())?;
        if descriptor.find_column(attr).is_none() && descriptor.find_relationship(attr).is_none() {
            return Err(Error::invalid_request(format!(
                "{} has no attribute '{}'",
                descriptor.name, attr
            )));
        }
        self.touch(id);
        self.instance_mut(id)?.expire(attr);
        Ok(())
    }

    /// Expire every attribute of every persistent instance.
    pub fn expire_all(&mut self) {
        let ids = self.ids_where(|i| {
            matches!(
                i.state(),
                InstanceState::Persistent | InstanceState::Deleted
            )
        });
        for id in ids {
            self.touch(id);
            if let Some(instance) = self.instances.get_mut(&id) {
                instance.expire_all();
            }
        }
    }

    /// Expire `root` and everything reachable through `refresh-expire`.
    /// Returns the expired instances.
    fn expire_cascade(&mut self, root: InstanceId) -> Result<Vec<InstanceId>> {
        persisted_key(root, self.instance(root)?)?;
        let mut expired = Vec::new();
        let mut queue = vec![root];
        let mut seen = BTreeSet::new();
        while let Some(id) = queue.pop() {
            if !seen.insert(id) {
                continue;
            }
            let instance = self.instance(id)?;
            if !matches!(
                instance.state(),
                InstanceState::Persistent | InstanceState::Deleted
            ) {
                continue;
            }
            for rel in self.mapper.relationships(instance.entity())? {
                if rel.cascade.refresh_expire {
                    if let Some(slot) = instance.slot(&rel.name) {
                        queue.extend(slot.current.referenced());
                    }
                }
            }
            self.touch(id);
            self.instance_mut(id)?.expire_all();
            expired.push(id);
        }
        Ok(expired)
    }
}

/// Identity of an instance that can be loaded from the database.
fn persisted_key(id: InstanceId, instance: &Instance) -> Result<IdentityKey> {
    match instance.state() {
        InstanceState::Persistent | InstanceState::Deleted => instance.key().cloned().ok_or_else(|| {
            Error::Custom(format!("persistent instance {} has no identity key", id))
        }),
        state => Err(Error::invalid_request(format!(
            "instance {} is {:?}; only persistent instances can be loaded or expired",
            id, state
        ))),
    }
}

#[cfg(test)]
mod tests {
    use crate::{AttrValue, InstanceState, Session};
    use asupersync::runtime::RuntimeBuilder;
    use relmap_core::{
        ColumnDescriptor, Cx, EntityDescriptor, Error, LinkTable, MapperRegistry, Outcome,
        RelationshipDescriptor, Value,
    };
    use relmap_memory::MemoryConnection;
    use std::sync::Arc;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn seeded_session() -> Session<MemoryConnection> {
        let mapper = Arc::new(
            MapperRegistry::builder()
                .entity(
                    EntityDescriptor::new("Team", "team")
                        .column(ColumnDescriptor::new("id").primary_key())
                        .column(ColumnDescriptor::new("name"))
                        .relationship(RelationshipDescriptor::one_to_many(
                            "players",
                            "Player",
                            &["team_id"],
                        )),
                )
                .entity(
                    EntityDescriptor::new("Player", "player")
                        .column(ColumnDescriptor::new("id").primary_key())
                        .column(ColumnDescriptor::new("team_id"))
                        .relationship(RelationshipDescriptor::many_to_one(
                            "team",
                            "Team",
                            &["team_id"],
                        ))
                        .relationship(RelationshipDescriptor::many_to_many(
                            "skills",
                            "Skill",
                            LinkTable::new("player_skill", &["player_id"], &["skill_id"]),
                        )),
                )
                .entity(
                    EntityDescriptor::new("Skill", "skill")
                        .column(ColumnDescriptor::new("id").primary_key()),
                )
                .build()
                .unwrap(),
        );
        let conn = MemoryConnection::new(mapper.as_ref());
        conn.seed("team", &[("id", Value::BigInt(1)), ("name", Value::from("red"))])
            .unwrap();
        for player in [10, 11] {
            conn.seed(
                "player",
                &[("id", Value::BigInt(player)), ("team_id", Value::BigInt(1))],
            )
            .unwrap();
        }
        conn.seed("skill", &[("id", Value::BigInt(7))]).unwrap();
        conn.seed(
            "player_skill",
            &[("player_id", Value::BigInt(10)), ("skill_id", Value::BigInt(7))],
        )
        .unwrap();
        Session::new(conn, mapper)
    }

    fn run<T>(f: impl std::future::Future<Output = T>) -> T {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(f)
    }

    #[test]
    fn test_get_uses_identity_map() {
        let mut session = seeded_session();
        let cx = Cx::for_testing();
        run(async {
            let first = unwrap_outcome(session.get(&cx, "Team", &[Value::BigInt(1)]).await);
            let queries = session.connection().statement_log().len();
            let second = unwrap_outcome(session.get(&cx, "Team", &[Value::BigInt(1)]).await);
            assert_eq!(first, second);
            assert_eq!(session.connection().statement_log().len(), queries);

            let missing = unwrap_outcome(session.get(&cx, "Team", &[Value::BigInt(9)]).await);
            assert!(missing.is_none());
        });
    }

    #[test]
    fn test_get_rejects_null_key() {
        let mut session = seeded_session();
        let cx = Cx::for_testing();
        run(async {
            assert!(matches!(
                session.get(&cx, "Team", &[Value::Null]).await,
                Outcome::Err(Error::InvalidRequest(_))
            ));
        });
    }

    #[test]
    fn test_lazy_loads_resolve_to_one_instance() {
        let mut session = seeded_session();
        let cx = Cx::for_testing();
        run(async {
            let team = unwrap_outcome(session.get(&cx, "Team", &[Value::BigInt(1)]).await).unwrap();
            let players = unwrap_outcome(session.get_attr(&cx, team, "players").await);
            let players = players.as_collection().unwrap().to_vec();
            assert_eq!(players.len(), 2);

            let back = unwrap_outcome(session.get_attr(&cx, players[0], "team").await);
            assert_eq!(back, AttrValue::Reference(Some(team)));

            let skills = unwrap_outcome(session.get_attr(&cx, players[0], "skills").await);
            assert_eq!(skills.as_collection().unwrap().len(), 1);
        });
    }

    #[test]
    fn test_expire_and_refresh_reload() {
        let mut session = seeded_session();
        let cx = Cx::for_testing();
        run(async {
            let team = unwrap_outcome(session.get(&cx, "Team", &[Value::BigInt(1)]).await).unwrap();
            session.set(team, "name", "blue").unwrap();
            session
                .connection()
                .external_update("team", &[("id", Value::BigInt(1))], &[("name", Value::from("green"))])
                .unwrap();

            unwrap_outcome(session.refresh(&cx, team).await);
            assert_eq!(session.instance(team).unwrap().value("name"), Some(&Value::from("green")));
            assert!(!session.is_modified(team).unwrap());

            session.expire(team, Some("name")).unwrap();
            assert!(!session.instance(team).unwrap().is_loaded("name"));
        });
    }

    #[test]
    fn test_detached_access_fails() {
        let mut session = seeded_session();
        let cx = Cx::for_testing();
        run(async {
            let team = unwrap_outcome(session.get(&cx, "Team", &[Value::BigInt(1)]).await).unwrap();
            session.expire(team, None).unwrap();
            session.expunge(team).unwrap();
            assert_eq!(session.state(team).unwrap(), InstanceState::Detached);
            assert!(matches!(
                session.get_attr(&cx, team, "name").await,
                Outcome::Err(Error::DetachedAccess(_))
            ));
        });
    }

    #[test]
    fn test_refresh_of_deleted_row_is_stale() {
        let mut session = seeded_session();
        let cx = Cx::for_testing();
        run(async {
            let skill = unwrap_outcome(session.get(&cx, "Skill", &[Value::BigInt(7)]).await).unwrap();
            let conn = session.connection();
            conn.execute_sync(
                &relmap_core::Statement::Delete {
                    table: "player_skill".to_string(),
                    filter: vec!["skill_id".to_string()],
                },
                &[Value::BigInt(7)],
            )
            .unwrap();
            conn.execute_sync(
                &relmap_core::Statement::Delete {
                    table: "skill".to_string(),
                    filter: vec!["id".to_string()],
                },
                &[Value::BigInt(7)],
            )
            .unwrap();
            match session.refresh(&cx, skill).await {
                Outcome::Err(e) => assert!(e.is_stale_data()),
                _ => panic!("refresh should fail"),
            }
        });
    }
}
