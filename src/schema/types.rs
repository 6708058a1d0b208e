use serde::{Deserialize, Serialize};

/// One column as the catalog reports it, or as a target wants it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub is_primary_key: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDescriptor {
    /// A nullable column without default
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default_value: None,
            is_primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }

    pub fn shape(&self) -> ColumnShape {
        ColumnShape {
            data_type: self.data_type.clone(),
            nullable: self.nullable,
            default_value: self.default_value.clone(),
        }
    }

    /// Same column with its type, nullability and default replaced
    pub fn with_shape(&self, shape: &ColumnShape) -> Self {
        Self {
            data_type: shape.data_type.clone(),
            nullable: shape.nullable,
            default_value: shape.default_value.clone(),
            ..self.clone()
        }
    }
}

/// The mutable part of a column definition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnShape {
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub default_value: Option<String>,
}

impl ColumnShape {
    pub fn new(data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            data_type: data_type.into(),
            nullable,
            default_value: None,
        }
    }

    /// Type and nullability agree. Defaults are spelled differently by every
    /// engine's catalog and are not compared.
    pub fn matches(&self, other: &ColumnShape) -> bool {
        self.nullable == other.nullable
            && normalize_type(&self.data_type) == normalize_type(&other.data_type)
    }

    pub fn describe(&self) -> String {
        let mut out = format!(
            "{} {}",
            self.data_type,
            if self.nullable { "NULL" } else { "NOT NULL" }
        );
        if let Some(default) = &self.default_value {
            out.push_str(&format!(" DEFAULT {}", default));
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDescriptor {
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Same name, or same columns in the same order with the same uniqueness
    pub fn is_equivalent(&self, other: &IndexDescriptor) -> bool {
        self.name == other.name || (self.columns == other.columns && self.unique == other.unique)
    }
}

/// ON DELETE behaviour of a foreign key
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferentialAction {
    #[strum(serialize = "CASCADE")]
    Cascade,
    #[strum(serialize = "SET NULL")]
    SetNull,
    #[strum(serialize = "SET DEFAULT")]
    SetDefault,
    #[strum(serialize = "RESTRICT")]
    Restrict,
    #[default]
    #[strum(serialize = "NO ACTION")]
    NoAction,
}

/// Single-column foreign key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDescriptor {
    pub name: String,
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
    #[serde(default)]
    pub on_delete: ReferentialAction,
}

impl ForeignKeyDescriptor {
    pub fn new(
        name: impl Into<String>,
        column: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            referenced_table: referenced_table.into(),
            referenced_column: referenced_column.into(),
            on_delete: ReferentialAction::default(),
        }
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }

    /// Same name, or the same column pointing at the same referenced column
    pub fn is_equivalent(&self, other: &ForeignKeyDescriptor) -> bool {
        self.name == other.name
            || (self.column == other.column
                && self.referenced_table == other.referenced_table
                && self.referenced_column == other.referenced_column)
    }
}

/// Table-level character set and collation (MySQL)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collation {
    pub charset: String,
    pub collation: String,
}

impl Collation {
    pub fn new(charset: impl Into<String>, collation: impl Into<String>) -> Self {
        Self {
            charset: charset.into(),
            collation: collation.into(),
        }
    }

    /// Spelling with MySQL's `utf8` alias resolved to `utf8mb3`, which is how
    /// 8.0.30 and later report it.
    pub fn normalized(&self) -> Collation {
        let charset = self.charset.to_ascii_lowercase();
        let collation = self.collation.to_ascii_lowercase();
        Collation {
            charset: if charset == "utf8" { "utf8mb3".to_string() } else { charset },
            collation: match collation.strip_prefix("utf8_") {
                Some(rest) => format!("utf8mb3_{}", rest),
                None => collation,
            },
        }
    }

    /// Equal once aliases are resolved
    pub fn matches(&self, other: &Collation) -> bool {
        self.normalized() == other.normalized()
    }
}

impl std::fmt::Display for Collation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.charset, self.collation)
    }
}

/// Canonical spelling of a column type, so catalog output from different
/// engines compares equal to what a target declares.
pub fn normalize_type(data_type: &str) -> String {
    let collapsed = data_type
        .trim()
        .to_ascii_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let (base, rest) = match collapsed.find('(') {
        Some(pos) => (
            collapsed[..pos].trim_end().to_string(),
            collapsed[pos..].to_string(),
        ),
        None => (collapsed.clone(), String::new()),
    };

    let base = match base.as_str() {
        "character varying" => "varchar",
        "character" | "bpchar" => "char",
        "integer" | "int4" => "int",
        "int8" => "bigint",
        "int2" => "smallint",
        "bool" => "boolean",
        "double precision" | "float8" => "double",
        "timestamp without time zone" => "timestamp",
        "timestamp with time zone" => "timestamptz",
        other => other,
    }
    .to_string();

    // Integer display widths (`int(11)`) carry no meaning for storage.
    let rest = if matches!(
        base.as_str(),
        "int" | "bigint" | "smallint" | "mediumint"
    ) && rest.starts_with('(')
    {
        match rest.find(')') {
            Some(end) => rest[end + 1..].to_string(),
            None => rest,
        }
    } else {
        rest
    };

    format!("{}{}", base, rest)
}

/// Character types, the only ones where an empty string is a distinct value
pub fn is_text_type(data_type: &str) -> bool {
    let normalized = normalize_type(data_type);
    let base = normalized
        .split(|c: char| c == '(' || c == ' ')
        .next()
        .unwrap_or_default();
    matches!(
        base,
        "char"
            | "varchar"
            | "nchar"
            | "nvarchar"
            | "text"
            | "tinytext"
            | "mediumtext"
            | "longtext"
            | "bpchar"
            | "citext"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn normalizes_dialect_spellings() {
        assert_eq!(normalize_type("character varying(255)"), "varchar(255)");
        assert_eq!(normalize_type("VARCHAR(255)"), "varchar(255)");
        assert_eq!(normalize_type("character(36)"), "char(36)");
        assert_eq!(normalize_type("int(11)"), "int");
        assert_eq!(normalize_type("integer"), "int");
        assert_eq!(normalize_type("int(10) unsigned"), "int unsigned");
        assert_eq!(normalize_type("decimal(10,2)"), "decimal(10,2)");
        assert_eq!(
            normalize_type("timestamp  with time zone"),
            "timestamptz"
        );
        assert_eq!(normalize_type("tinyint(1)"), "tinyint(1)");
    }

    #[test]
    fn text_types_are_recognized_across_dialects() {
        assert!(is_text_type("char(36)"));
        assert!(is_text_type("character varying(255)"));
        assert!(is_text_type("TEXT"));
        assert!(is_text_type("longtext"));
        assert!(!is_text_type("int(11)"));
        assert!(!is_text_type("integer"));
        assert!(!is_text_type("decimal(10,2)"));
        assert!(!is_text_type("timestamptz"));
    }

    #[test]
    fn utf8_alias_matches_utf8mb3() {
        let declared = Collation::new("utf8", "utf8_general_ci");
        let reported = Collation::new("utf8mb3", "utf8mb3_general_ci");
        assert!(declared.matches(&reported));
        assert_eq!(declared.normalized(), reported);
        assert!(!declared.matches(&Collation::new("utf8mb4", "utf8mb4_general_ci")));
        assert_eq!(
            Collation::new("utf8mb4", "utf8mb4_unicode_ci").normalized(),
            Collation::new("utf8mb4", "utf8mb4_unicode_ci")
        );
    }

    #[test]
    fn shapes_ignore_defaults_when_matching() {
        let catalog = ColumnShape {
            data_type: "character(36)".into(),
            nullable: false,
            default_value: Some("''::bpchar".into()),
        };
        let wanted = ColumnShape::new("char(36)", false);
        assert!(catalog.matches(&wanted));
        assert!(!catalog.matches(&ColumnShape::new("char(36)", true)));
    }

    #[test]
    fn referential_actions_parse_catalog_spelling() {
        assert_eq!(
            ReferentialAction::from_str("SET NULL").unwrap(),
            ReferentialAction::SetNull
        );
        assert_eq!(ReferentialAction::Restrict.to_string(), "RESTRICT");
    }

    #[test]
    fn equivalence_by_name_or_structure() {
        let wanted = ForeignKeyDescriptor::new("FK_orders_tenantId", "tenantId", "tenants", "id");
        let auto_named = ForeignKeyDescriptor::new("orders_ibfk_3", "tenantId", "tenants", "id");
        assert!(wanted.is_equivalent(&auto_named));

        let index = IndexDescriptor::new("IDX_orders_tenantId", ["tenantId"]);
        assert!(index.is_equivalent(&IndexDescriptor::new("orders_tenant_idx", ["tenantId"])));
        assert!(!index.is_equivalent(&IndexDescriptor::new("other", ["tenantId"]).unique()));
    }
}
