use fractaldb::{Database, DatabaseOptions, FieldDef, Schema, SqlType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub age: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub email: Option<String>,
}

impl User {
    pub fn new(name: &str, age: i64) -> Self {
        Self {
            name: name.into(),
            age,
            email: None,
        }
    }

    pub fn with_email(name: &str, age: i64, email: &str) -> Self {
        Self {
            name: name.into(),
            age,
            email: Some(email.into()),
        }
    }
}

pub fn user_schema() -> Schema<User> {
    Schema::builder()
        .field(FieldDef::new("age", SqlType::Integer).indexed())
        .field(FieldDef::new("email", SqlType::Text).unique().nullable())
        .build()
        .unwrap()
}

pub async fn open_db() -> Database {
    Database::in_memory(DatabaseOptions::default()).await.unwrap()
}

pub async fn users_collection(db: &Database) -> fractaldb::Collection<User> {
    db.collection::<User>("users", user_schema()).await.unwrap()
}
