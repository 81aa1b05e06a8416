use clap::Subcommand;

/// One-off commands run against the configured store. Tables can be named by
/// id or by name; JSON arguments are passed as single strings.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Create a table from a JSON array of column definitions
    CreateTable {
        #[clap(value_parser)]
        name: String,
        #[clap(value_parser, default_value = "[]")]
        columns: String,
    },
    /// List all tables
    ListTables,
    /// Print a table's schema
    Describe {
        #[clap(value_parser)]
        table: String,
    },
    /// Fetch a single document
    Get {
        #[clap(value_parser)]
        table: String,
        #[clap(value_parser)]
        id: String,
    },
    /// Validate and insert a JSON document
    Insert {
        #[clap(value_parser)]
        table: String,
        #[clap(value_parser)]
        document: String,
    },
    /// Validate a JSON document without storing it
    Validate {
        #[clap(value_parser)]
        table: String,
        #[clap(value_parser)]
        document: String,
    },
    /// Merge a JSON patch into a document
    Update {
        #[clap(value_parser)]
        table: String,
        #[clap(value_parser)]
        id: String,
        #[clap(value_parser)]
        patch: String,
    },
    /// Delete one or more documents
    Delete {
        #[clap(value_parser)]
        table: String,
        #[clap(value_parser, required = true)]
        ids: Vec<String>,
    },
    /// Check whether a value is free in a unique column
    CheckUnique {
        #[clap(value_parser)]
        table: String,
        #[clap(value_parser)]
        key: String,
        /// JSON value; bare words are taken as strings
        #[clap(value_parser)]
        value: String,
        /// Document allowed to hold the value already
        #[clap(long, value_parser)]
        exclude: Option<String>,
    },
    /// Add a column from a JSON column definition
    AddColumn {
        #[clap(value_parser)]
        table: String,
        #[clap(value_parser)]
        column: String,
    },
    /// Drop a column and its values
    DropColumn {
        #[clap(value_parser)]
        table: String,
        #[clap(value_parser)]
        key: String,
    },
    /// Make a column unique, or plain again with --disable
    SetUnique {
        #[clap(value_parser)]
        table: String,
        #[clap(value_parser)]
        key: String,
        #[clap(long, action)]
        disable: bool,
    },
    /// Rebuild a unique column's index from the table's documents
    RebuildIndex {
        #[clap(value_parser)]
        table: String,
        #[clap(value_parser)]
        key: String,
    },
    /// Run a JSON query (filters, sort, page, pageSize)
    Query {
        #[clap(value_parser)]
        table: String,
        #[clap(value_parser, default_value = "{}")]
        query: String,
    },
    /// Delete a table and its indexes
    DropTable {
        #[clap(value_parser)]
        table: String,
    },
}
