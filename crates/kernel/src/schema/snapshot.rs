//! Structural description of a model's table.

use serde::{Deserialize, Serialize};

use super::checksum::checksum_of;

/// One column. Column order is significant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub default: Option<String>,
}

impl ColumnDef {
    /// A nullable column with no default.
    pub fn new(name: &str, column_type: &str) -> Self {
        Self {
            name: name.to_string(),
            column_type: column_type.to_string(),
            nullable: true,
            primary_key: false,
            unique: false,
            default: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, default: &str) -> Self {
        self.default = Some(default.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDef {
    pub fn new(name: &str, columns: &[&str], unique: bool) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub name: String,
    pub column: String,
    pub references_table: String,
    pub references_column: String,
    pub on_delete: Option<String>,
}

impl ForeignKeyDef {
    pub fn new(name: &str, column: &str, references_table: &str, references_column: &str) -> Self {
        Self {
            name: name.to_string(),
            column: column.to_string(),
            references_table: references_table.to_string(),
            references_column: references_column.to_string(),
            on_delete: None,
        }
    }

    pub fn on_delete(mut self, action: &str) -> Self {
        self.on_delete = Some(action.to_string());
        self
    }
}

/// A named table constraint such as a CHECK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintDef {
    pub name: String,
    pub definition: String,
}

impl ConstraintDef {
    pub fn new(name: &str, definition: &str) -> Self {
        Self {
            name: name.to_string(),
            definition: definition.to_string(),
        }
    }
}

/// Columns, indexes, foreign keys and constraints of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
    #[serde(default)]
    pub constraints: Vec<ConstraintDef>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_foreign_key(mut self, foreign_key: ForeignKeyDef) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    pub fn with_constraint(mut self, constraint: ConstraintDef) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column order kept; indexes, foreign keys and constraints sorted by
    /// name, since their declaration order carries no meaning.
    pub fn canonical(&self) -> Self {
        let mut canonical = self.clone();
        canonical.indexes.sort_by(|a, b| a.name.cmp(&b.name));
        canonical.foreign_keys.sort_by(|a, b| a.name.cmp(&b.name));
        canonical.constraints.sort_by(|a, b| a.name.cmp(&b.name));
        canonical
    }

    /// Hex SHA-256 of the canonical form.
    #[allow(clippy::expect_used)]
    pub fn checksum(&self) -> String {
        checksum_of(&self.canonical()).expect("schema snapshot serializes")
    }
}

/// A model as declared by a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    /// Logical model name, unique within the module.
    pub name: String,
    pub table_name: String,
    pub snapshot: SchemaSnapshot,
}

impl ModelDefinition {
    pub fn new(name: &str, table_name: &str, snapshot: SchemaSnapshot) -> Self {
        Self {
            name: name.to_string(),
            table_name: table_name.to_string(),
            snapshot,
        }
    }

    pub fn checksum(&self) -> String {
        self.snapshot.checksum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partner() -> SchemaSnapshot {
        SchemaSnapshot::new()
            .with_column(ColumnDef::new("id", "integer").primary_key())
            .with_column(ColumnDef::new("name", "varchar(255)").not_null())
            .with_column(ColumnDef::new("email", "varchar(255)").unique())
            .with_index(IndexDef::new("ix_partner_name", &["name"], false))
            .with_index(IndexDef::new("ix_partner_email", &["email"], true))
            .with_constraint(ConstraintDef::new("ck_name", "length(name) > 0"))
    }

    #[test]
    fn checksum_is_stable() {
        let snapshot = partner();
        assert_eq!(snapshot.checksum(), snapshot.checksum());
        assert_eq!(snapshot.checksum().len(), 64);
    }

    #[test]
    fn index_order_does_not_matter() {
        let mut reordered = partner();
        reordered.indexes.reverse();
        assert_eq!(reordered.checksum(), partner().checksum());
    }

    #[test]
    fn column_order_matters() {
        let mut reordered = partner();
        reordered.columns.swap(1, 2);
        assert_ne!(reordered.checksum(), partner().checksum());
    }

    #[test]
    fn any_structural_change_alters_checksum() {
        let base = partner().checksum();

        let mut nullable = partner();
        nullable.columns[1].nullable = true;
        assert_ne!(nullable.checksum(), base);

        let with_fk = partner().with_foreign_key(ForeignKeyDef::new(
            "fk_partner_company",
            "company_id",
            "company",
            "id",
        ));
        assert_ne!(with_fk.checksum(), base);
    }

    #[test]
    fn column_type_serializes_as_type() {
        let json = serde_json::to_value(ColumnDef::new("id", "integer")).unwrap_or_default();
        assert_eq!(json["type"], "integer");
    }
}
