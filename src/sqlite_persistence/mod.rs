mod versioned_schema;

pub use versioned_schema::{
    open_in_memory, open_versioned, Column, ForeignKey, OnDelete, SqlType, Table,
    VersionedSchema, BASE_DB_VERSION, DEFAULT_TIMESTAMP,
};
