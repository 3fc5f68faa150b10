use super::FieldType;
use super::table::Table;
use crate::condition::{Orders, Range};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Normal,
    Pk,
    IncrPk,
    /// Created by.
    Acb,
    /// Created at.
    Act,
    /// Modified by.
    Amb,
    /// Modified at.
    Amt,
    /// Deleted by.
    Adb,
    /// Deleted at.
    Adt,
    /// Optimistic lock version.
    Aol,
    Json,
    Virtual,
    Ref,
    Link,
    Links,
    Tree,
}

impl ColumnKind {
    pub fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "normal" => Self::Normal,
            "pk" => Self::Pk,
            "incrpk" => Self::IncrPk,
            "acb" => Self::Acb,
            "act" => Self::Act,
            "amb" => Self::Amb,
            "amt" => Self::Amt,
            "adb" => Self::Adb,
            "adt" => Self::Adt,
            "aol" => Self::Aol,
            "json" => Self::Json,
            "vc" => Self::Virtual,
            "ref" => Self::Ref,
            "link" => Self::Link,
            "links" => Self::Links,
            "tree" => Self::Tree,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Pk => "pk",
            Self::IncrPk => "incrpk",
            Self::Acb => "acb",
            Self::Act => "act",
            Self::Amb => "amb",
            Self::Amt => "amt",
            Self::Adb => "adb",
            Self::Adt => "adt",
            Self::Aol => "aol",
            Self::Json => "json",
            Self::Virtual => "vc",
            Self::Ref => "ref",
            Self::Link => "link",
            Self::Links => "links",
            Self::Tree => "tree",
        }
    }

    pub fn is_relation(&self) -> bool {
        matches!(self, Self::Ref | Self::Link | Self::Links | Self::Tree)
    }

    pub fn is_key(&self) -> bool {
        matches!(self, Self::Pk | Self::IncrPk)
    }

    /// Columns that exist in the table (everything but computed projections).
    pub fn is_stored(&self) -> bool {
        !self.is_relation() && *self != Self::Virtual
    }

    pub fn is_audit_by(&self) -> bool {
        matches!(self, Self::Acb | Self::Amb | Self::Adb)
    }

    pub fn is_audit_at(&self) -> bool {
        matches!(self, Self::Act | Self::Amt | Self::Adt)
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved relation of a `ref`/`link`/`links`/`tree` column. `host` is a
/// column of the declaring table, `target` a column of `table`.
#[derive(Debug, Clone)]
pub struct Relation {
    pub host: String,
    pub target: String,
    pub table: Arc<Table>,
    pub orders: Orders,
    pub range: Option<Range>,
}

#[derive(Debug, Clone)]
pub enum ColumnOptions {
    None,
    Virtual(String),
    Relation(Relation),
}

#[derive(Debug, Clone)]
pub struct Column {
    pub(crate) field: String,
    pub(crate) name: String,
    pub(crate) kind: ColumnKind,
    pub(crate) conflict: bool,
    pub(crate) options: ColumnOptions,
    pub(crate) field_type: FieldType,
}

impl Column {
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ColumnKind {
        self.kind
    }

    pub fn is_conflict(&self) -> bool {
        self.conflict
    }

    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    pub fn nullable(&self) -> bool {
        self.field_type.nullable()
    }

    pub fn fragment(&self) -> Option<&str> {
        match &self.options {
            ColumnOptions::Virtual(fragment) => Some(fragment),
            _ => None,
        }
    }

    pub fn relation(&self) -> Option<&Relation> {
        match &self.options {
            ColumnOptions::Relation(relation) => Some(relation),
            _ => None,
        }
    }

    /// Part of INSERT column lists.
    pub fn is_insertable(&self) -> bool {
        self.kind.is_stored() && self.kind != ColumnKind::IncrPk
    }

    /// Part of the SET clause of a full update. Keys, creation audits,
    /// deletion audits and the version are handled separately.
    pub fn is_updatable(&self) -> bool {
        matches!(
            self.kind,
            ColumnKind::Normal | ColumnKind::Json | ColumnKind::Amb | ColumnKind::Amt
        )
    }
}
