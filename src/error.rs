use thiserror::Error;

/// Errors raised by the cache itself, as opposed to its collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("value of item {item_id} needs {len} bytes, text cache holds {capacity}")]
    ValueTooLarge {
        item_id: u64,
        len: usize,
        capacity: usize,
    },

    #[error("item id 0 is reserved")]
    InvalidItem,

    #[error("history cache is closed")]
    Closed,

    #[error("cannot reserve ids for table {table}: id cache is full")]
    IdTablesExhausted { table: String },

    #[error("cannot reserve ids for table {table}: id space exhausted")]
    IdOverflow { table: String },
}
