//! DDL for collection tables.
//!
//! Every collection is one table: metadata columns plus a virtual generated
//! column per indexed field, extracted from the JSON body. Statements are
//! idempotent (`IF NOT EXISTS`) so `ensure_table` can run on every
//! materialisation.

use log::info;

use crate::schema::SchemaFields;
use crate::sql::SqlWriter;

/// `CREATE TABLE IF NOT EXISTS` for the collection.
pub(crate) fn create_table_sql(table: &str, schema: &SchemaFields) -> String {
    let mut sql = SqlWriter::new();
    sql.push("CREATE TABLE IF NOT EXISTS ");
    sql.push_ident(table);
    sql.push(" (");
    sql.push("_id TEXT PRIMARY KEY");
    sql.push(", body BLOB NOT NULL");
    sql.push(", created_at INTEGER NOT NULL");
    sql.push(", updated_at INTEGER NOT NULL");
    for field in schema.fields.values() {
        if !field.indexed {
            continue;
        }
        sql.push(", ");
        sql.push_ident(&field.column_name());
        sql.push(" ");
        sql.push(field.sql_type.column_type());
        sql.push(" GENERATED ALWAYS AS (json_extract(body, ");
        sql.push_literal(&field.path);
        sql.push(")) VIRTUAL");
    }
    sql.push(")");
    sql.build()
}

/// One `CREATE [UNIQUE] INDEX IF NOT EXISTS` per indexed field and per
/// compound index, in declaration order.
pub(crate) fn create_index_sql(table: &str, schema: &SchemaFields) -> Vec<String> {
    let mut statements = Vec::new();
    for field in schema.fields.values() {
        if !field.indexed {
            continue;
        }
        let mut sql = SqlWriter::new();
        sql.push(if field.unique {
            "CREATE UNIQUE INDEX IF NOT EXISTS "
        } else {
            "CREATE INDEX IF NOT EXISTS "
        });
        sql.push_ident(&format!("idx_{}_{}", table, field.name));
        sql.push(" ON ");
        sql.push_ident(table);
        sql.push(" (");
        sql.push_ident(&field.column_name());
        sql.push(")");
        statements.push(sql.build());
    }
    for index in &schema.compound_indexes {
        let mut sql = SqlWriter::new();
        sql.push(if index.unique {
            "CREATE UNIQUE INDEX IF NOT EXISTS "
        } else {
            "CREATE INDEX IF NOT EXISTS "
        });
        sql.push_ident(&index.name);
        sql.push(" ON ");
        sql.push_ident(table);
        sql.push(" (");
        for (i, field_name) in index.fields.iter().enumerate() {
            if i > 0 {
                sql.push(", ");
            }
            // Validated at schema build time to reference indexed fields.
            sql.push_ident(&format!("_{}", field_name));
        }
        sql.push(")");
        statements.push(sql.build());
    }
    statements
}

pub(crate) fn drop_table_sql(table: &str) -> String {
    let mut sql = SqlWriter::new();
    sql.push("DROP TABLE IF EXISTS ");
    sql.push_ident(table);
    sql.build()
}

/// Materialises the table and its indexes. Idempotent.
pub(crate) async fn ensure_table(
    conn: &mut sqlx::SqliteConnection,
    table: &str,
    schema: &SchemaFields,
) -> Result<(), sqlx::Error> {
    sqlx::query(&create_table_sql(table, schema))
        .execute(&mut *conn)
        .await?;
    for statement in create_index_sql(table, schema) {
        sqlx::query(&statement).execute(&mut *conn).await?;
    }
    info!("materialised collection table {:?}", table);
    Ok(())
}
