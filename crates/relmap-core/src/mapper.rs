//! Entity descriptors and the mapper service.
//!
//! Entity types are plain data: an [`EntityDescriptor`] lists the columns and
//! relationships of one mapped table. Descriptors are registered once in a
//! [`MapperRegistry`], which validates the whole graph before any session can
//! use it. Registration order is significant: it is the tie-break the flush
//! uses to order otherwise independent statements.
//!
//! ```
//! use relmap_core::mapper::{ColumnDescriptor, EntityDescriptor, Mapper, MapperRegistry, RelationshipDescriptor};
//!
//! let registry = MapperRegistry::builder()
//!     .entity(
//!         EntityDescriptor::new("Parent", "parent")
//!             .column(ColumnDescriptor::new("id").primary_key().auto_increment())
//!             .column(ColumnDescriptor::new("name"))
//!             .relationship(
//!                 RelationshipDescriptor::one_to_many("children", "Child", &["parent_id"])
//!                     .cascade("all, delete-orphan")
//!                     .unwrap(),
//!             ),
//!     )
//!     .entity(
//!         EntityDescriptor::new("Child", "child")
//!             .column(ColumnDescriptor::new("id").primary_key().auto_increment())
//!             .column(ColumnDescriptor::new("parent_id").references("Parent", "id")),
//!     )
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(registry.entities().len(), 2);
//! ```

use crate::error::{Error, Result};
use crate::value::Value;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

fn identifier_regex() -> Option<&'static Regex> {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Check that a name is a plain SQL identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}

/// One mapped column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    /// Value is generated by the store on INSERT
    #[serde(default)]
    pub auto_increment: bool,
    /// Value used when a new instance never set the attribute
    #[serde(default)]
    pub default: Option<Value>,
    /// (entity, column) this column references
    #[serde(default)]
    pub foreign_key: Option<(String, String)>,
    /// Optimistic concurrency counter
    #[serde(default)]
    pub version: bool,
}

fn default_true() -> bool {
    true
}

impl ColumnDescriptor {
    /// A nullable, non-key column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nullable: true,
            primary_key: false,
            auto_increment: false,
            default: None,
            foreign_key: None,
            version: false,
        }
    }

    /// Mark as (part of) the primary key. Implies NOT NULL.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub fn not_null(self) -> Self {
        self.nullable(false)
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn references(mut self, entity: impl Into<String>, column: impl Into<String>) -> Self {
        self.foreign_key = Some((entity.into(), column.into()));
        self
    }

    /// Mark as the version counter. Implies NOT NULL with a default of 1.
    pub fn version(mut self) -> Self {
        self.version = true;
        self.nullable = false;
        if self.default.is_none() {
            self.default = Some(Value::BigInt(1));
        }
        self
    }
}

/// Direction of a relationship, named from the side that declares it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipKind {
    /// Foreign key lives on the declaring entity.
    #[default]
    ManyToOne,
    /// Foreign key lives on the target entity.
    OneToMany,
    /// Rows are associated through a link table.
    ManyToMany,
}

/// Link table for many-to-many relationships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTable {
    pub table: String,
    /// Link columns referencing the declaring entity's primary key
    pub local_columns: Vec<String>,
    /// Link columns referencing the target entity's primary key
    pub remote_columns: Vec<String>,
}

impl LinkTable {
    pub fn new(table: impl Into<String>, local_columns: &[&str], remote_columns: &[&str]) -> Self {
        Self {
            table: table.into(),
            local_columns: local_columns.iter().map(|s| (*s).to_string()).collect(),
            remote_columns: remote_columns.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

/// Cascade rules of a relationship.
///
/// Parsed from the familiar comma separated form: `"save-update, merge"`,
/// `"all, delete-orphan"`, `"none"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cascade {
    pub save_update: bool,
    pub merge: bool,
    pub delete: bool,
    pub delete_orphan: bool,
    pub expunge: bool,
    pub refresh_expire: bool,
}

impl Default for Cascade {
    /// `save-update, merge`
    fn default() -> Self {
        Self {
            save_update: true,
            merge: true,
            delete: false,
            delete_orphan: false,
            expunge: false,
            refresh_expire: false,
        }
    }
}

impl Cascade {
    pub const fn none() -> Self {
        Self {
            save_update: false,
            merge: false,
            delete: false,
            delete_orphan: false,
            expunge: false,
            refresh_expire: false,
        }
    }

    /// `save-update, merge, delete, expunge, refresh-expire`
    pub const fn all() -> Self {
        Self {
            save_update: true,
            merge: true,
            delete: true,
            delete_orphan: false,
            expunge: true,
            refresh_expire: true,
        }
    }

    pub fn parse(spec: &str) -> Result<Self> {
        let mut cascade = Cascade::none();
        for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "all" => {
                    let orphan = cascade.delete_orphan;
                    cascade = Cascade::all();
                    cascade.delete_orphan = orphan;
                }
                "none" => {}
                "save-update" => cascade.save_update = true,
                "merge" => cascade.merge = true,
                "delete" => cascade.delete = true,
                "delete-orphan" => cascade.delete_orphan = true,
                "expunge" => cascade.expunge = true,
                "refresh-expire" => cascade.refresh_expire = true,
                other => {
                    return Err(Error::config(format!("unknown cascade option '{}'", other)));
                }
            }
        }
        Ok(cascade)
    }
}

impl fmt::Display for Cascade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.save_update {
            parts.push("save-update");
        }
        if self.merge {
            parts.push("merge");
        }
        if self.delete {
            parts.push("delete");
        }
        if self.delete_orphan {
            parts.push("delete-orphan");
        }
        if self.expunge {
            parts.push("expunge");
        }
        if self.refresh_expire {
            parts.push("refresh-expire");
        }
        if parts.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

impl TryFrom<String> for Cascade {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Cascade::parse(&value)
    }
}

impl From<Cascade> for String {
    fn from(value: Cascade) -> Self {
        value.to_string()
    }
}

/// One mapped relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    pub name: String,
    /// Target entity name
    pub target: String,
    pub kind: RelationshipKind,
    /// Foreign key columns on the dependent side, ordered like the parent's
    /// primary key. The dependent side is the declaring entity for
    /// `ManyToOne` and the target for `OneToMany`.
    #[serde(default)]
    pub foreign_key: Vec<String>,
    #[serde(default)]
    pub link: Option<LinkTable>,
    #[serde(default)]
    pub cascade: Cascade,
    /// Resolve this dependency with a second UPDATE after both rows exist
    #[serde(default)]
    pub post_update: bool,
    /// A child may belong to at most one parent through this relationship
    #[serde(default)]
    pub single_parent: bool,
    /// Name of the inverse relationship on the target
    #[serde(default)]
    pub back_populates: Option<String>,
    /// Leave dependents of a deleted parent to the database instead of
    /// loading them during flush
    #[serde(default)]
    pub passive_deletes: bool,
    /// Collection (true) or scalar reference (false)
    pub uselist: bool,
}

impl RelationshipDescriptor {
    fn base(name: &str, target: &str, kind: RelationshipKind, uselist: bool) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            kind,
            foreign_key: Vec::new(),
            link: None,
            cascade: Cascade::default(),
            post_update: false,
            single_parent: false,
            back_populates: None,
            passive_deletes: false,
            uselist,
        }
    }

    /// Scalar reference through foreign key columns on the declaring entity.
    pub fn many_to_one(name: &str, target: &str, foreign_key: &[&str]) -> Self {
        let mut rel = Self::base(name, target, RelationshipKind::ManyToOne, false);
        rel.foreign_key = foreign_key.iter().map(|s| (*s).to_string()).collect();
        rel
    }

    /// Collection through foreign key columns on the target.
    pub fn one_to_many(name: &str, target: &str, foreign_key: &[&str]) -> Self {
        let mut rel = Self::base(name, target, RelationshipKind::OneToMany, true);
        rel.foreign_key = foreign_key.iter().map(|s| (*s).to_string()).collect();
        rel
    }

    /// Scalar reference through foreign key columns on the target.
    pub fn one_to_one(name: &str, target: &str, foreign_key: &[&str]) -> Self {
        let mut rel = Self::one_to_many(name, target, foreign_key);
        rel.uselist = false;
        rel
    }

    pub fn many_to_many(name: &str, target: &str, link: LinkTable) -> Self {
        let mut rel = Self::base(name, target, RelationshipKind::ManyToMany, true);
        rel.link = Some(link);
        rel
    }

    /// Set cascade rules from their string form.
    pub fn cascade(mut self, spec: &str) -> Result<Self> {
        self.cascade = Cascade::parse(spec)?;
        Ok(self)
    }

    pub fn with_cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn post_update(mut self) -> Self {
        self.post_update = true;
        self
    }

    pub fn single_parent(mut self) -> Self {
        self.single_parent = true;
        self
    }

    pub fn back_populates(mut self, name: &str) -> Self {
        self.back_populates = Some(name.to_string());
        self
    }

    pub fn passive_deletes(mut self) -> Self {
        self.passive_deletes = true;
        self
    }

    pub fn is_many_to_one(&self) -> bool {
        self.kind == RelationshipKind::ManyToOne
    }

    pub fn is_one_to_many(&self) -> bool {
        self.kind == RelationshipKind::OneToMany
    }

    pub fn is_many_to_many(&self) -> bool {
        self.kind == RelationshipKind::ManyToMany
    }
}

/// One mapped entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDescriptor>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDescriptor) -> Self {
        self.columns.push(column);
        self
    }

    pub fn relationship(mut self, relationship: RelationshipDescriptor) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Primary key columns in declaration order.
    pub fn primary_key(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    pub fn primary_key_names(&self) -> Vec<String> {
        self.primary_key().map(|c| c.name.clone()).collect()
    }

    pub fn version_column(&self) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.version)
    }

    /// The single auto-increment primary key column, if any.
    pub fn generated_key(&self) -> Option<&ColumnDescriptor> {
        self.primary_key().find(|c| c.auto_increment)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// The mapper service consumed by the session.
pub trait Mapper: Send + Sync {
    /// All entity descriptors in registration order.
    fn entities(&self) -> &[EntityDescriptor];

    fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities().iter().find(|e| e.name == name)
    }

    /// Position of an entity in registration order.
    fn registration_index(&self, name: &str) -> Option<usize> {
        self.entities().iter().position(|e| e.name == name)
    }

    fn columns(&self, name: &str) -> Result<&[ColumnDescriptor]> {
        self.require(name).map(|e| e.columns.as_slice())
    }

    fn primary_key(&self, name: &str) -> Result<Vec<String>> {
        self.require(name).map(EntityDescriptor::primary_key_names)
    }

    fn relationships(&self, name: &str) -> Result<&[RelationshipDescriptor]> {
        self.require(name).map(|e| e.relationships.as_slice())
    }

    /// Look up an entity or fail with `InvalidRequest`.
    fn require(&self, name: &str) -> Result<&EntityDescriptor> {
        self.entity(name)
            .ok_or_else(|| Error::invalid_request(format!("unknown entity '{}'", name)))
    }
}

/// Validated table of entity descriptors.
#[derive(Debug, Clone, Default)]
pub struct MapperRegistry {
    entities: Vec<EntityDescriptor>,
    by_name: HashMap<String, usize>,
}

impl MapperRegistry {
    pub fn builder() -> MapperRegistryBuilder {
        MapperRegistryBuilder::default()
    }

    /// Build a registry from a JSON array of entity descriptors.
    pub fn from_json(json: &str) -> Result<Self> {
        let entities: Vec<EntityDescriptor> = serde_json::from_str(json)?;
        MapperRegistryBuilder { entities }.build()
    }
}

impl Mapper for MapperRegistry {
    fn entities(&self) -> &[EntityDescriptor] {
        &self.entities
    }

    fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.by_name.get(name).map(|&i| &self.entities[i])
    }

    fn registration_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}

/// Collects descriptors and validates them together.
#[derive(Debug, Default)]
pub struct MapperRegistryBuilder {
    entities: Vec<EntityDescriptor>,
}

impl MapperRegistryBuilder {
    pub fn entity(mut self, entity: EntityDescriptor) -> Self {
        self.entities.push(entity);
        self
    }

    #[tracing::instrument(level = "debug", skip(self), fields(entities = self.entities.len()))]
    pub fn build(self) -> Result<MapperRegistry> {
        let mut by_name = HashMap::new();
        for (i, entity) in self.entities.iter().enumerate() {
            validate_entity_shape(entity)?;
            if by_name.insert(entity.name.clone(), i).is_some() {
                return Err(Error::config(format!(
                    "entity '{}' registered twice",
                    entity.name
                )));
            }
        }

        let registry = MapperRegistry {
            entities: self.entities,
            by_name,
        };
        for entity in &registry.entities {
            validate_references(&registry, entity)?;
        }
        tracing::debug!(
            entities = registry.entities.len(),
            "Mapper registry validated"
        );
        Ok(registry)
    }
}

fn check_ident(kind: &str, name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(Error::config(format!("invalid {} name '{}'", kind, name)))
    }
}

fn validate_entity_shape(entity: &EntityDescriptor) -> Result<()> {
    check_ident("entity", &entity.name)?;
    check_ident("table", &entity.table)?;

    let mut seen = std::collections::HashSet::new();
    for column in &entity.columns {
        check_ident("column", &column.name)?;
        if !seen.insert(column.name.as_str()) {
            return Err(Error::config(format!(
                "{}: duplicate attribute '{}'",
                entity.name, column.name
            )));
        }
    }
    for rel in &entity.relationships {
        check_ident("relationship", &rel.name)?;
        if !seen.insert(rel.name.as_str()) {
            return Err(Error::config(format!(
                "{}: duplicate attribute '{}'",
                entity.name, rel.name
            )));
        }
    }

    let pk: Vec<_> = entity.primary_key().collect();
    if pk.is_empty() {
        return Err(Error::config(format!(
            "{}: no primary key column",
            entity.name
        )));
    }
    if pk.iter().any(|c| c.auto_increment) && pk.len() > 1 {
        return Err(Error::config(format!(
            "{}: auto-increment requires a single-column primary key",
            entity.name
        )));
    }
    let versions: Vec<_> = entity.columns.iter().filter(|c| c.version).collect();
    if versions.len() > 1 {
        return Err(Error::config(format!(
            "{}: more than one version column",
            entity.name
        )));
    }
    if versions.iter().any(|c| c.primary_key) {
        return Err(Error::config(format!(
            "{}: version column cannot be part of the primary key",
            entity.name
        )));
    }
    Ok(())
}

fn validate_references(registry: &MapperRegistry, entity: &EntityDescriptor) -> Result<()> {
    for column in &entity.columns {
        if let Some((target, target_col)) = &column.foreign_key {
            let target_entity = registry.entity(target).ok_or_else(|| {
                Error::config(format!(
                    "{}.{} references unknown entity '{}'",
                    entity.name, column.name, target
                ))
            })?;
            if target_entity.find_column(target_col).is_none() {
                return Err(Error::config(format!(
                    "{}.{} references unknown column {}.{}",
                    entity.name, column.name, target, target_col
                )));
            }
        }
    }

    for rel in &entity.relationships {
        let target = registry.entity(&rel.target).ok_or_else(|| {
            Error::config(format!(
                "{}.{} targets unknown entity '{}'",
                entity.name, rel.name, rel.target
            ))
        })?;
        match rel.kind {
            RelationshipKind::ManyToOne => check_fk(entity, rel, entity, target)?,
            RelationshipKind::OneToMany => check_fk(entity, rel, target, entity)?,
            RelationshipKind::ManyToMany => {
                let link = rel.link.as_ref().ok_or_else(|| {
                    Error::config(format!(
                        "{}.{}: many-to-many requires a link table",
                        entity.name, rel.name
                    ))
                })?;
                check_ident("table", &link.table)?;
                for col in link.local_columns.iter().chain(&link.remote_columns) {
                    check_ident("column", col)?;
                }
                if link.local_columns.len() != entity.primary_key().count()
                    || link.remote_columns.len() != target.primary_key().count()
                {
                    return Err(Error::config(format!(
                        "{}.{}: link table columns do not match primary keys",
                        entity.name, rel.name
                    )));
                }
            }
        }
        if let Some(back) = &rel.back_populates {
            let inverse = target.find_relationship(back).ok_or_else(|| {
                Error::config(format!(
                    "{}.{}: back_populates '{}' not found on {}",
                    entity.name, rel.name, back, target.name
                ))
            })?;
            if inverse.target != entity.name {
                return Err(Error::config(format!(
                    "{}.{}: back_populates '{}' targets {}",
                    entity.name, rel.name, back, inverse.target
                )));
            }
        }
    }
    Ok(())
}

fn check_fk(
    entity: &EntityDescriptor,
    rel: &RelationshipDescriptor,
    dependent: &EntityDescriptor,
    parent: &EntityDescriptor,
) -> Result<()> {
    if rel.foreign_key.len() != parent.primary_key().count() {
        return Err(Error::config(format!(
            "{}.{}: {} foreign key column(s) for a {}-column primary key on {}",
            entity.name,
            rel.name,
            rel.foreign_key.len(),
            parent.primary_key().count(),
            parent.name
        )));
    }
    for col in &rel.foreign_key {
        if dependent.find_column(col).is_none() {
            return Err(Error::config(format!(
                "{}.{}: foreign key column '{}' not found on {}",
                entity.name, rel.name, col, dependent.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent_child() -> MapperRegistryBuilder {
        MapperRegistry::builder()
            .entity(
                EntityDescriptor::new("Parent", "parent")
                    .column(ColumnDescriptor::new("id").primary_key().auto_increment())
                    .column(ColumnDescriptor::new("name"))
                    .relationship(
                        RelationshipDescriptor::one_to_many("children", "Child", &["parent_id"])
                            .back_populates("parent"),
                    ),
            )
            .entity(
                EntityDescriptor::new("Child", "child")
                    .column(ColumnDescriptor::new("id").primary_key().auto_increment())
                    .column(ColumnDescriptor::new("parent_id").references("Parent", "id"))
                    .relationship(
                        RelationshipDescriptor::many_to_one("parent", "Child", &["parent_id"])
                            .back_populates("children"),
                    ),
            )
    }

    #[test]
    fn test_cascade_parse() {
        let c = Cascade::parse("all, delete-orphan").unwrap();
        assert!(c.save_update && c.merge && c.delete && c.delete_orphan && c.expunge);

        let c = Cascade::parse("delete-orphan, all").unwrap();
        assert!(c.delete_orphan && c.delete);

        assert_eq!(Cascade::parse("").unwrap(), Cascade::none());
        assert_eq!(Cascade::parse("save-update, merge").unwrap(), Cascade::default());
        assert!(matches!(Cascade::parse("explode"), Err(Error::Config(_))));
    }

    #[test]
    fn test_cascade_display_round_trips() {
        let c = Cascade::parse("save-update, delete").unwrap();
        assert_eq!(c.to_string(), "save-update, delete");
        assert_eq!(Cascade::none().to_string(), "none");
    }

    #[test]
    fn test_back_populates_must_point_back() {
        // Child.parent targets Child by mistake, so Parent.children's inverse is wrong.
        let err = parent_child().build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_valid_registry_preserves_order() {
        let registry = MapperRegistry::builder()
            .entity(
                EntityDescriptor::new("B", "b")
                    .column(ColumnDescriptor::new("id").primary_key()),
            )
            .entity(
                EntityDescriptor::new("A", "a")
                    .column(ColumnDescriptor::new("id").primary_key())
                    .column(ColumnDescriptor::new("b_id").references("B", "id"))
                    .relationship(RelationshipDescriptor::many_to_one("b", "B", &["b_id"])),
            )
            .build()
            .unwrap();

        assert_eq!(registry.registration_index("B"), Some(0));
        assert_eq!(registry.registration_index("A"), Some(1));
        assert_eq!(registry.primary_key("A").unwrap(), vec!["id".to_string()]);
        assert!(registry.relationships("Nope").is_err());
    }

    #[test]
    fn test_rejects_missing_primary_key_and_bad_identifiers() {
        let no_pk = MapperRegistry::builder()
            .entity(EntityDescriptor::new("T", "t").column(ColumnDescriptor::new("x")))
            .build();
        assert!(no_pk.is_err());

        let bad_name = MapperRegistry::builder()
            .entity(
                EntityDescriptor::new("T", "t; drop table t")
                    .column(ColumnDescriptor::new("id").primary_key()),
            )
            .build();
        assert!(bad_name.is_err());
    }

    #[test]
    fn test_rejects_foreign_key_arity_mismatch() {
        let err = MapperRegistry::builder()
            .entity(
                EntityDescriptor::new("P", "p")
                    .column(ColumnDescriptor::new("a").primary_key())
                    .column(ColumnDescriptor::new("b").primary_key()),
            )
            .entity(
                EntityDescriptor::new("C", "c")
                    .column(ColumnDescriptor::new("id").primary_key())
                    .column(ColumnDescriptor::new("p_a"))
                    .relationship(RelationshipDescriptor::many_to_one("p", "P", &["p_a"])),
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("foreign key column"));
    }

    #[test]
    fn test_version_column_defaults() {
        let col = ColumnDescriptor::new("version").version();
        assert!(!col.nullable);
        assert_eq!(col.default, Some(Value::BigInt(1)));
    }

    #[test]
    fn test_from_json() {
        let json = r#"[
            {"name": "Tag", "table": "tag",
             "columns": [{"name": "id", "primary_key": true, "nullable": false}]},
            {"name": "Post", "table": "post",
             "columns": [{"name": "id", "primary_key": true, "nullable": false}],
             "relationships": [{
                "name": "tags", "target": "Tag", "kind": "ManyToMany", "uselist": true,
                "link": {"table": "post_tag", "local_columns": ["post_id"], "remote_columns": ["tag_id"]},
                "cascade": "save-update"
             }]}
        ]"#;
        let registry = MapperRegistry::from_json(json).unwrap();
        let post = registry.entity("Post").unwrap();
        let tags = post.find_relationship("tags").unwrap();
        assert!(tags.is_many_to_many());
        assert!(tags.cascade.save_update && !tags.cascade.merge);
    }
}
