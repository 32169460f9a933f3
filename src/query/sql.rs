//! Statement builders for the PostgreSQL dialect.
//!
//! Every builder wraps the user query verbatim, which is why live queries
//! must be side-effect free selections.

use crate::connection::LiveQueryConfig;

/// Lists one content hash per result row, in the query's own row order.
pub fn fingerprint_listing(config: &LiveQueryConfig, query_sql: &str) -> String {
    let alias = quote_ident(&config.query_alias);
    format!(
        "WITH {alias} AS ({query_sql}) SELECT {hash} AS {hash_col} FROM {alias}",
        hash = row_hash(&alias),
        hash_col = quote_ident(&config.hash_column),
    )
}

/// Re-runs the query and keeps only rows whose hash is one of `count`
/// placeholders numbered from `first_param`.
///
/// Returned rows carry every user column plus the hash column.
pub fn targeted_fetch(
    config: &LiveQueryConfig,
    query_sql: &str,
    first_param: usize,
    count: usize,
) -> String {
    let alias = quote_ident(&config.query_alias);
    let hashed = quote_ident(&format!("{}_hashed", config.query_alias));
    let hash_col = quote_ident(&config.hash_column);
    let placeholders = (first_param..first_param + count)
        .map(|n| format!("${}", n))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "WITH {alias} AS ({query_sql}) SELECT * FROM (SELECT {alias}.*, {hash} AS {hash_col} FROM {alias}) AS {hashed} WHERE {hashed}.{hash_col} IN ({placeholders})",
        hash = row_hash(&alias),
    )
}

/// Creates the temporary view used to introspect table provenance.
pub fn create_dependency_view(view_name: &str, normalized_sql: &str) -> String {
    format!(
        "CREATE OR REPLACE TEMP VIEW {} AS {}",
        quote_ident(view_name),
        normalized_sql
    )
}

/// Lists the tables feeding the columns of the view named by `$1`.
pub fn view_dependencies() -> &'static str {
    "SELECT DISTINCT vc.table_name FROM information_schema.view_column_usage vc WHERE vc.view_name = $1"
}

pub fn drop_dependency_view(view_name: &str) -> String {
    format!("DROP VIEW IF EXISTS {}", quote_ident(view_name))
}

fn row_hash(alias: &str) -> String {
    format!("md5(CAST(ROW({alias}.*) AS TEXT))")
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
