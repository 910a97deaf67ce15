use std::collections::HashMap;

/// Startup-time table metadata: is this table sharded, and which column
/// carries the tenant id.
#[derive(Debug, Clone)]
pub struct EntityClass {
    pub table_name: String,
    pub is_sharded: bool,
    pub tenant_column: Option<String>,
}

impl EntityClass {
    pub fn sharded(table_name: impl Into<String>, tenant_column: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            is_sharded: true,
            tenant_column: Some(tenant_column.into()),
        }
    }

    pub fn global(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            is_sharded: false,
            tenant_column: None,
        }
    }
}

/// Registry answering "is table T sharded, and by which column". Built
/// once at startup from user-supplied metadata; read-only afterwards.
/// Unknown tables are non-sharded.
#[derive(Debug)]
pub struct EntityClassifier {
    tables: HashMap<String, EntityClass>,
    default_tenant_column: String,
}

impl EntityClassifier {
    pub fn new(classes: Vec<EntityClass>, default_tenant_column: impl Into<String>) -> Self {
        let tables = classes
            .into_iter()
            .map(|c| (c.table_name.to_lowercase(), c))
            .collect();
        Self {
            tables,
            default_tenant_column: default_tenant_column.into(),
        }
    }

    pub fn classify(&self, table: &str) -> Option<&EntityClass> {
        self.tables.get(&table.to_lowercase())
    }

    pub fn is_sharded(&self, table: &str) -> bool {
        self.classify(table).map(|c| c.is_sharded).unwrap_or(false)
    }

    /// Tenant column for a sharded table; the configured default when the
    /// class did not name one. `None` for non-sharded tables.
    pub fn tenant_column(&self, table: &str) -> Option<&str> {
        let class = self.classify(table)?;
        if !class.is_sharded {
            return None;
        }
        Some(
            class
                .tenant_column
                .as_deref()
                .unwrap_or(&self.default_tenant_column),
        )
    }

    pub fn sharded_tables(&self) -> Vec<&str> {
        self.tables
            .values()
            .filter(|c| c.is_sharded)
            .map(|c| c.table_name.as_str())
            .collect()
    }
}
