//! Collection DDL executor
//!
//! Recipients call the executor once while in `CreatingCollection` to
//! decide the schema and indexes of the destination collection. A failure
//! here is an ordinary participant error.

use crate::shard::collection::CollectionOptions;
use crate::Result;

pub trait DdlExecutor: Send + Sync {
    /// Return the options the destination collection is created with
    fn materialize(
        &self,
        shard_id: &str,
        physical: &str,
        source: &CollectionOptions,
    ) -> Result<CollectionOptions>;
}

/// Copies the source schema and indexes verbatim
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDdl;

impl DdlExecutor for LocalDdl {
    fn materialize(
        &self,
        shard_id: &str,
        physical: &str,
        source: &CollectionOptions,
    ) -> Result<CollectionOptions> {
        source.validate()?;
        tracing::debug!(
            shard_id,
            physical,
            indexes = source.indexes.len(),
            "materializing destination collection"
        );
        Ok(source.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::collection::IndexSpec;

    #[test]
    fn test_local_ddl_copies_options() {
        let options = CollectionOptions {
            indexes: vec![IndexSpec {
                name: "email_1".into(),
                fields: vec!["email".into()],
                unique: true,
            }],
            required_fields: vec!["email".into()],
        };
        let out = LocalDdl
            .materialize("shard-b", "app.users", &options)
            .unwrap();
        assert_eq!(out, options);
    }

    #[test]
    fn test_local_ddl_rejects_bad_index() {
        let options = CollectionOptions {
            indexes: vec![IndexSpec {
                name: String::new(),
                fields: vec![],
                unique: false,
            }],
            required_fields: vec![],
        };
        assert!(LocalDdl.materialize("shard-b", "app.users", &options).is_err());
    }
}
