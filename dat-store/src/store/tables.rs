// Table Definitions

use redb::{Table, TableDefinition, WriteTransaction};

/// Table: Sequences
/// Key:   `u64`          # seq
/// Value: `(&str, &str)` # (id, rev)
pub const SEQUENCES_TABLE: TableDefinition<u64, (&str, &str)> =
    TableDefinition::new("sequences-1");

/// Table: Rows
/// Key:   `(&str, &str)` # (id, rev)
/// Value: `&[u8]`        # encoded row
pub const ROWS_TABLE: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("rows-1");

/// Table: Current index
/// Key:   `&str`        # id
/// Value: `(&str, u64)` # (rev, seq) of the latest revision
pub const CURRENT_TABLE: TableDefinition<&str, (&str, u64)> = TableDefinition::new("current-1");

/// Table: Columns
/// Key:   `u64`  # position
/// Value: `&str` # column name
pub const COLUMNS_TABLE: TableDefinition<u64, &str> = TableDefinition::new("columns-1");

/// Table: Replication origins
/// Key:   `(&str, &str)` # (origin, id)
/// Value: `u64`          # greatest origin seq adopted for the id
pub const ORIGINS_TABLE: TableDefinition<(&str, &str), u64> = TableDefinition::new("origins-1");

/// The row tables, opened together in one write transaction.
#[derive(derive_more::Debug)]
pub struct Tables<'tx> {
    #[debug("sequences")]
    pub sequences: Table<'tx, u64, (&'static str, &'static str)>,
    #[debug("rows")]
    pub rows: Table<'tx, (&'static str, &'static str), &'static [u8]>,
    #[debug("current")]
    pub current: Table<'tx, &'static str, (&'static str, u64)>,
    #[debug("origins")]
    pub origins: Table<'tx, (&'static str, &'static str), u64>,
}

impl<'tx> Tables<'tx> {
    pub fn new(tx: &'tx WriteTransaction) -> Result<Self, redb::TableError> {
        let sequences = tx.open_table(SEQUENCES_TABLE)?;
        let rows = tx.open_table(ROWS_TABLE)?;
        let current = tx.open_table(CURRENT_TABLE)?;
        let origins = tx.open_table(ORIGINS_TABLE)?;
        Ok(Self {
            sequences,
            rows,
            current,
            origins,
        })
    }
}
