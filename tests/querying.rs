mod common;

use common::{open_db, users_collection, User};
use fractaldb::query::{and, contains, elem_match, eq, exists, gt, ilike, is_in, or, size, Query};
use fractaldb::{FieldDef, QueryOptions, Schema, SortOrder, SqlType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Post {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    comments: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Comment {
    author: String,
    score: i64,
}

async fn seed_users(users: &fractaldb::Collection<User>) {
    for (name, age) in [("Alice", 30), ("alan", 40), ("Bob", 25), ("carol", 35)] {
        users.insert_one(User::new(name, age)).await.unwrap();
    }
}

#[tokio::test]
async fn filters_compose_over_indexed_and_json_fields() {
    let db = open_db().await;
    let users = users_collection(&db).await;
    seed_users(&users).await;

    // `age` runs over the generated column, `name` over json_extract.
    // SQLite LIKE is ASCII case-insensitive, so "Alice" matches too.
    let found = users
        .find(
            &and([gt("age", 26), contains("name", "a")]),
            &QueryOptions::new().sort("age", SortOrder::Asc),
        )
        .await
        .unwrap();
    let names: Vec<_> = found.iter().map(|d| d.data.name.as_str()).collect();
    assert_eq!(names, vec!["Alice", "carol", "alan"]);

    let found = users
        .find(
            &or([eq("age", 25), eq("age", 40)]),
            &QueryOptions::new().sort("age", SortOrder::Asc),
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
}

#[tokio::test]
async fn in_list_matches_membership() {
    let db = open_db().await;
    let users = users_collection(&db).await;
    seed_users(&users).await;

    assert_eq!(
        users.count(&is_in("age", [25, 30])).await.unwrap(),
        2
    );
    // Empty IN matches nothing.
    assert_eq!(
        users.count(&is_in("age", Vec::<i64>::new())).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn ilike_is_case_insensitive_both_ways() {
    let db = open_db().await;
    let users = users_collection(&db).await;
    seed_users(&users).await;

    let found = users
        .find(&ilike("name", "AL%"), &QueryOptions::new().sort("age", SortOrder::Asc))
        .await
        .unwrap();
    let names: Vec<_> = found.iter().map(|d| d.data.name.as_str()).collect();
    assert_eq!(names, vec!["Alice", "alan"]);
}

#[tokio::test]
async fn exists_false_matches_missing_and_null() {
    let db = open_db().await;
    let users = users_collection(&db).await;
    users.insert_one(User::new("no-email", 1)).await.unwrap();
    users
        .insert_one(User::with_email("has-email", 2, "x@y"))
        .await
        .unwrap();

    let missing = users.find(&exists("email", false), &QueryOptions::new()).await.unwrap();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].data.name, "no-email");

    let present = users.find(&exists("email", true), &QueryOptions::new()).await.unwrap();
    assert_eq!(present.len(), 1);
    assert_eq!(present[0].data.name, "has-email");
}

#[tokio::test]
async fn size_zero_matches_empty_not_missing_arrays() {
    let db = open_db().await;
    let posts = db
        .collection::<Post>("posts", Schema::empty())
        .await
        .unwrap();

    posts
        .insert_one(Post {
            title: "empty-tags".into(),
            tags: Some(vec![]),
            comments: vec![],
        })
        .await
        .unwrap();
    posts
        .insert_one(Post {
            title: "no-tags".into(),
            tags: None,
            comments: vec![],
        })
        .await
        .unwrap();

    let found = posts.find(&size("tags", 0), &QueryOptions::new()).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].data.title, "empty-tags");
}

#[tokio::test]
async fn array_operators_inspect_elements() {
    use fractaldb::query::{all, at_index};
    let db = open_db().await;
    let posts = db
        .collection::<Post>("posts", Schema::empty())
        .await
        .unwrap();

    posts
        .insert_one(Post {
            title: "rust".into(),
            tags: Some(vec!["db".into(), "sqlite".into()]),
            comments: vec![
                Comment { author: "bo".into(), score: 7 },
                Comment { author: "zed".into(), score: 2 },
            ],
        })
        .await
        .unwrap();
    posts
        .insert_one(Post {
            title: "go".into(),
            tags: Some(vec!["db".into()]),
            comments: vec![Comment { author: "bo".into(), score: 1 }],
        })
        .await
        .unwrap();

    assert_eq!(posts.count(&all("tags", ["db", "sqlite"])).await.unwrap(), 1);
    assert_eq!(posts.count(&all("tags", ["db"])).await.unwrap(), 2);
    assert_eq!(posts.count(&at_index("tags", 1, "sqlite")).await.unwrap(), 1);

    // Sibling fields inside one element must match the same element.
    let matched = posts
        .find(
            &elem_match("comments", and([eq("author", "bo"), gt("score", 5)])),
            &QueryOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].data.title, "rust");
}

#[tokio::test]
async fn select_projects_fields_and_keeps_metadata() {
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Sparse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        age: i64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        email: Option<String>,
    }

    let db = open_db().await;
    let people = db
        .collection::<Sparse>("people", Schema::empty())
        .await
        .unwrap();
    let inserted = people
        .insert_one(Sparse {
            name: "Ada".into(),
            age: 36,
            email: Some("ada@x".into()),
        })
        .await
        .unwrap();

    let found = people
        .find(&Query::Empty, &QueryOptions::new().select(["name"]))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, inserted.id);
    assert_eq!(found[0].created_at, inserted.created_at);
    assert_eq!(found[0].data.name, "Ada");
    assert_eq!(found[0].data.age, 0);
    assert_eq!(found[0].data.email, None);

    let found = people
        .find(&Query::Empty, &QueryOptions::new().omit(["email", "age"]))
        .await
        .unwrap();
    assert_eq!(found[0].data.name, "Ada");
    assert_eq!(found[0].data.email, None);
}

#[tokio::test]
async fn search_scans_multiple_fields() {
    let db = open_db().await;
    let users = users_collection(&db).await;
    users
        .insert_one(User::with_email("Annika", 1, "ann@x"))
        .await
        .unwrap();
    users
        .insert_one(User::with_email("Bo", 2, "hanna@x"))
        .await
        .unwrap();
    users.insert_one(User::new("Chris", 3)).await.unwrap();

    let found = users
        .find(
            &Query::Empty,
            &QueryOptions::new()
                .search("ann", ["name", "email"])
                .sort("age", SortOrder::Asc),
        )
        .await
        .unwrap();
    let names: Vec<_> = found.iter().map(|d| d.data.name.as_str()).collect();
    assert_eq!(names, vec!["Annika", "Bo"]);
}

#[tokio::test]
async fn cursor_pages_forward_without_overlap() {
    let db = open_db().await;
    let users = users_collection(&db).await;
    for age in 1..=5 {
        users.insert_one(User::new(&format!("u{}", age), age)).await.unwrap();
    }

    // id is the unique tail key, so pages neither skip nor repeat.
    let opts = QueryOptions::new().sort("id", SortOrder::Asc).limit(2);
    let page1 = users.find(&Query::Empty, &opts).await.unwrap();
    assert_eq!(page1.len(), 2);

    let opts = QueryOptions::new()
        .sort("id", SortOrder::Asc)
        .limit(2)
        .after(page1.last().unwrap().id.clone());
    let page2 = users.find(&Query::Empty, &opts).await.unwrap();
    assert_eq!(page2.len(), 2);

    let opts = QueryOptions::new()
        .sort("id", SortOrder::Asc)
        .limit(2)
        .after(page2.last().unwrap().id.clone());
    let page3 = users.find(&Query::Empty, &opts).await.unwrap();
    assert_eq!(page3.len(), 1);

    let mut seen: Vec<String> = page1
        .iter()
        .chain(&page2)
        .chain(&page3)
        .map(|d| d.id.clone())
        .collect();
    let total = seen.len();
    seen.dedup();
    assert_eq!(total, 5);
    assert_eq!(seen.len(), 5);

    // Paging backwards from the middle returns the preceding documents.
    let opts = QueryOptions::new()
        .sort("id", SortOrder::Asc)
        .limit(2)
        .before(page2.first().unwrap().id.clone());
    let back = users.find(&Query::Empty, &opts).await.unwrap();
    assert_eq!(back.len(), 2);
    let mut back_ids: Vec<_> = back.iter().map(|d| d.id.clone()).collect();
    back_ids.sort();
    let mut expected: Vec<_> = page1.iter().map(|d| d.id.clone()).collect();
    expected.sort();
    assert_eq!(back_ids, expected);
}

#[tokio::test]
async fn nested_paths_resolve_into_documents() {
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Profile {
        name: String,
        address: Address,
    }
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Address {
        city: String,
    }

    let db = open_db().await;
    let schema: Schema<Profile> = Schema::builder()
        .field(FieldDef::new("city", SqlType::Text).path("$.address.city").indexed())
        .build()
        .unwrap();
    let profiles = db.collection::<Profile>("profiles", schema).await.unwrap();

    profiles
        .insert_one(Profile {
            name: "a".into(),
            address: Address { city: "Oslo".into() },
        })
        .await
        .unwrap();
    profiles
        .insert_one(Profile {
            name: "b".into(),
            address: Address { city: "Bergen".into() },
        })
        .await
        .unwrap();

    // Declared path through the generated column.
    assert_eq!(profiles.count(&eq("city", "Oslo")).await.unwrap(), 1);
    // Undeclared dotted name through json_extract.
    assert_eq!(profiles.count(&eq("address.city", "Bergen")).await.unwrap(), 1);
}
