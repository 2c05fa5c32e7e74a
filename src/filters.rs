// ABOUTME: Namespace-aware object filtering for selective migration
// ABOUTME: Four clauses: include-only/exclude for schemas and tables

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

/// A `schema.table` pair as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedTable {
    pub nspname: String,
    pub relname: String,
}

impl QualifiedTable {
    pub fn parse(spec: &str) -> Result<QualifiedTable> {
        match spec.split_once('.') {
            Some((nsp, rel)) if !nsp.is_empty() && !rel.is_empty() => Ok(QualifiedTable {
                nspname: nsp.to_string(),
                relname: rel.to_string(),
            }),
            _ => bail!("Table must be specified as 'schema.table', got '{}'", spec),
        }
    }
}

/// Filtering rules applied to every source object.
///
/// An object is kept iff it passes all four clauses. Empty clauses pass
/// everything.
#[derive(Debug, Clone, Default)]
pub struct CopyFilters {
    include_only_schemas: Vec<String>,
    exclude_schemas: Vec<String>,
    include_only_tables: Vec<QualifiedTable>,
    exclude_tables: Vec<QualifiedTable>,
}

impl CopyFilters {
    pub fn new(
        include_only_schemas: Vec<String>,
        exclude_schemas: Vec<String>,
        include_only_tables: Vec<String>,
        exclude_tables: Vec<String>,
    ) -> Result<CopyFilters> {
        let include_only_tables = include_only_tables
            .iter()
            .map(|s| QualifiedTable::parse(s))
            .collect::<Result<Vec<_>>>()?;
        let exclude_tables = exclude_tables
            .iter()
            .map(|s| QualifiedTable::parse(s))
            .collect::<Result<Vec<_>>>()?;

        Ok(CopyFilters {
            include_only_schemas,
            exclude_schemas,
            include_only_tables,
            exclude_tables,
        })
    }

    /// Whether no clause is set at all.
    pub fn is_empty(&self) -> bool {
        self.include_only_schemas.is_empty()
            && self.exclude_schemas.is_empty()
            && self.include_only_tables.is_empty()
            && self.exclude_tables.is_empty()
    }

    pub fn include_only_schemas(&self) -> &[String] {
        &self.include_only_schemas
    }

    /// Whether objects in `nspname` pass the schema clauses.
    pub fn allows_schema(&self, nspname: &str) -> bool {
        if !self.include_only_schemas.is_empty()
            && !self.include_only_schemas.iter().any(|s| s == nspname)
        {
            return false;
        }
        !self.exclude_schemas.iter().any(|s| s == nspname)
    }

    /// Whether the table `nspname.relname` passes all four clauses.
    pub fn allows_table(&self, nspname: &str, relname: &str) -> bool {
        if !self.allows_schema(nspname) {
            return false;
        }
        if !self.include_only_tables.is_empty()
            && !self
                .include_only_tables
                .iter()
                .any(|t| t.nspname == nspname && t.relname == relname)
        {
            return false;
        }
        !self
            .exclude_tables
            .iter()
            .any(|t| t.nspname == nspname && t.relname == relname)
    }

    /// Stable fingerprint of the filter configuration, used to detect a
    /// resumed run started with different filters.
    pub fn fingerprint(&self) -> String {
        fn hash_list(hasher: &mut Sha256, values: &[String]) {
            let mut sorted = values.to_vec();
            sorted.sort();
            for item in sorted {
                hasher.update(item.as_bytes());
                hasher.update(b"|");
            }
            hasher.update(b"#");
        }

        let mut hasher = Sha256::new();
        hash_list(&mut hasher, &self.include_only_schemas);
        hash_list(&mut hasher, &self.exclude_schemas);
        hash_list(
            &mut hasher,
            &self
                .include_only_tables
                .iter()
                .map(|t| format!("{}.{}", t.nspname, t.relname))
                .collect::<Vec<_>>(),
        );
        hash_list(
            &mut hasher,
            &self
                .exclude_tables
                .iter()
                .map(|t| format!("{}.{}", t.nspname, t.relname))
                .collect::<Vec<_>>(),
        );

        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(ios: &[&str], es: &[&str], iot: &[&str], et: &[&str]) -> CopyFilters {
        CopyFilters::new(
            ios.iter().map(|s| s.to_string()).collect(),
            es.iter().map(|s| s.to_string()).collect(),
            iot.iter().map(|s| s.to_string()).collect(),
            et.iter().map(|s| s.to_string()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_qualified_table_parse() {
        let t = QualifiedTable::parse("s.secret").unwrap();
        assert_eq!(t.nspname, "s");
        assert_eq!(t.relname, "secret");

        assert!(QualifiedTable::parse("noschema").is_err());
        assert!(QualifiedTable::parse(".t").is_err());
        assert!(QualifiedTable::parse("s.").is_err());
    }

    #[test]
    fn test_empty_filters_pass_everything() {
        let f = CopyFilters::default();
        assert!(f.is_empty());
        assert!(f.allows_schema("public"));
        assert!(f.allows_table("public", "t"));
    }

    #[test]
    fn test_include_only_schema() {
        let f = filters(&["app"], &[], &[], &[]);
        assert!(f.allows_table("app", "t"));
        assert!(!f.allows_table("public", "t"));
        assert!(!f.allows_schema("public"));
    }

    #[test]
    fn test_exclude_schema() {
        let f = filters(&[], &["audit"], &[], &[]);
        assert!(f.allows_table("public", "t"));
        assert!(!f.allows_table("audit", "t"));
    }

    #[test]
    fn test_include_only_table() {
        let f = filters(&[], &[], &["public.users"], &[]);
        assert!(f.allows_table("public", "users"));
        assert!(!f.allows_table("public", "orders"));
    }

    #[test]
    fn test_exclude_table() {
        let f = filters(&[], &[], &[], &["s.secret"]);
        assert!(f.allows_table("public", "t"));
        assert!(!f.allows_table("s", "secret"));
        // the schema itself stays allowed
        assert!(f.allows_schema("s"));
    }

    #[test]
    fn test_all_four_clauses_must_pass() {
        let f = filters(&["app"], &["audit"], &["app.users"], &["app.events"]);
        assert!(f.allows_table("app", "users"));
        assert!(!f.allows_table("app", "events"));
        assert!(!f.allows_table("app", "orders"));
        assert!(!f.allows_table("audit", "users"));
        assert!(!f.allows_table("public", "users"));
    }

    #[test]
    fn test_fingerprint_stability() {
        let a = filters(&["app"], &[], &["app.users"], &[]);
        let b = filters(&["app"], &[], &["app.users"], &[]);
        let c = filters(&["app"], &[], &["app.orders"], &[]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
