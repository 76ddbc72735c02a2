mod helpers;

use authgate::error::GatewayError;
use authgate::token::db::{HistoryFilters, TokenDatabase};
use authgate::token::TokenType;
use sqlx::PgPool;

#[sqlx::test]
async fn insert_then_get_round_trips(pool: PgPool) {
    let db = TokenDatabase::new(pool);
    let token = helpers::make_token("alice", TokenType::User, &["read:all"]);

    db.insert_token(&token, Some("laptop"), None, None, "alice", Some("127.0.0.1"))
        .await
        .unwrap();

    let info = db.get_token_info(token.key()).await.unwrap().unwrap();
    assert_eq!(info.username, "alice");
    assert_eq!(info.token_type, TokenType::User);
    assert_eq!(info.token_name.as_deref(), Some("laptop"));
    assert!(info.scopes.contains("read:all"));
}

#[sqlx::test]
async fn duplicate_user_token_name_is_rejected(pool: PgPool) {
    let db = TokenDatabase::new(pool);
    let first = helpers::make_token("alice", TokenType::User, &["read:all"]);
    let second = helpers::make_token("alice", TokenType::User, &["read:all"]);

    db.insert_token(&first, Some("laptop"), None, None, "alice", None)
        .await
        .unwrap();

    let err = db
        .insert_token(&second, Some("laptop"), None, None, "alice", None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::DuplicateTokenName));
}

#[sqlx::test]
async fn list_tokens_excludes_other_users_and_revoked(pool: PgPool) {
    let db = TokenDatabase::new(pool);
    let mine = helpers::make_token("alice", TokenType::User, &["read:all"]);
    let also_mine = helpers::make_token("alice", TokenType::User, &["read:all"]);
    let theirs = helpers::make_token("bob", TokenType::User, &["read:all"]);

    db.insert_token(&mine, Some("one"), None, None, "alice", None)
        .await
        .unwrap();
    db.insert_token(&also_mine, Some("two"), None, None, "alice", None)
        .await
        .unwrap();
    db.insert_token(&theirs, Some("one"), None, None, "bob", None)
        .await
        .unwrap();

    db.revoke_token(also_mine.key(), "alice", None).await.unwrap();

    let tokens = db.list_tokens("alice").await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].token, mine.key());
}

#[sqlx::test]
async fn modify_user_token_records_old_values_in_history(pool: PgPool) {
    let db = TokenDatabase::new(pool);
    let token = helpers::make_token("alice", TokenType::User, &["read:all"]);
    db.insert_token(&token, Some("laptop"), None, None, "alice", None)
        .await
        .unwrap();

    let new_scopes: std::collections::BTreeSet<String> =
        ["read:all", "exec:admin"].into_iter().map(String::from).collect();
    let updated = db
        .modify_user_token(
            token.key(),
            Some("renamed"),
            Some(&new_scopes),
            None,
            "alice",
            Some("10.0.0.1"),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.token_name.as_deref(), Some("renamed"));
    assert!(updated.scopes.contains("exec:admin"));

    let history = db
        .get_change_history(HistoryFilters {
            key: Some(token.key().to_owned()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(history.entries.len(), 2);
    let edit = history
        .entries
        .iter()
        .find(|e| e.action == authgate::token::HistoryAction::Edit)
        .unwrap();
    assert_eq!(edit.old_token_name.as_deref(), Some("laptop"));
    assert_eq!(
        edit.old_scopes.as_ref().unwrap(),
        &["read:all"].into_iter().map(String::from).collect()
    );
}

#[sqlx::test]
async fn revoke_cascades_to_notebook_and_internal_children(pool: PgPool) {
    let db = TokenDatabase::new(pool);
    let parent = helpers::make_token("alice", TokenType::User, &["read:all"]);
    db.insert_token(&parent, Some("laptop"), None, None, "alice", None)
        .await
        .unwrap();

    let notebook = helpers::child_token(&parent, TokenType::Notebook, &["read:all"]);
    db.insert_token(&notebook, None, None, None, "alice", None)
        .await
        .unwrap();

    let internal = helpers::child_token(&parent, TokenType::Internal, &["read:all"]);
    db.insert_token(
        &internal,
        None,
        Some("some-service"),
        Some("fingerprint-abc"),
        "alice",
        None,
    )
    .await
    .unwrap();

    let revoked = db.revoke_token(parent.key(), "alice", None).await.unwrap();
    assert_eq!(revoked.len(), 3);
    assert!(revoked.contains(&parent.key().to_string()));
    assert!(revoked.contains(&notebook.key().to_string()));
    assert!(revoked.contains(&internal.key().to_string()));

    assert!(db.get_token_info(parent.key()).await.unwrap().is_none());
    assert!(db.get_token_info(notebook.key()).await.unwrap().is_none());
    assert!(db.get_token_info(internal.key()).await.unwrap().is_none());
}

#[sqlx::test]
async fn change_history_cursor_paginates_newest_first(pool: PgPool) {
    let db = TokenDatabase::new(pool);
    for i in 0..3 {
        let token = helpers::make_token("alice", TokenType::User, &["read:all"]);
        db.insert_token(&token, Some(&format!("token-{i}")), None, None, "alice", None)
            .await
            .unwrap();
    }

    let page = db
        .get_change_history(HistoryFilters {
            username: Some("alice".into()),
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(page.entries.len(), 2);
    assert_eq!(page.count, 3);
    assert_eq!(page.entries[0].token_name.as_deref(), Some("token-2"));
    assert!(page.next_cursor.is_some());

    let next_page = db
        .get_change_history(HistoryFilters {
            username: Some("alice".into()),
            limit: Some(2),
            cursor: page.next_cursor,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(next_page.entries.len(), 1);
    assert_eq!(next_page.entries[0].token_name.as_deref(), Some("token-0"));
}

#[sqlx::test]
async fn bootstrap_admins_seeds_only_when_empty(pool: PgPool) {
    let db = TokenDatabase::new(pool);
    db.bootstrap_admins(&["root".to_string()]).await.unwrap();
    assert!(db.is_admin("root").await.unwrap());

    db.bootstrap_admins(&["someone-else".to_string()]).await.unwrap();
    assert!(!db.is_admin("someone-else").await.unwrap());
}
