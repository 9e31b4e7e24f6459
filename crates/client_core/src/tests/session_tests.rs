use super::*;
use crate::test_support::profile;
use storage::{FileKeyValueStore, MemoryKeyValueStore, SESSION_STORAGE_KEY};

fn assert_consistent(store: &SessionStore) {
    let session = store.snapshot();
    assert_eq!(
        session.is_authenticated(),
        session.credential().is_some() && session.profile().is_some()
    );
    assert_eq!(
        store.is_authenticated(),
        store.current_credential().is_some() && store.current_profile().is_some()
    );
}

#[test]
fn starts_anonymous_without_persisted_state() {
    let store = SessionStore::in_memory();
    assert!(!store.is_authenticated());
    assert_eq!(store.current_credential(), None);
    assert_eq!(store.current_profile(), None);
    assert_eq!(store.snapshot().state(), SessionState::Anonymous);
    assert_eq!(store.generation(), 0);
}

#[test]
fn login_and_logout_keep_credential_and_profile_together() {
    let store = SessionStore::in_memory();
    for round in 0..3 {
        store.login(Token::new(format!("tok-{round}")), profile(round));
        assert_consistent(&store);
        assert!(store.is_authenticated());
        assert_eq!(
            store.current_credential().map(|t| t.expose().to_string()),
            Some(format!("tok-{round}"))
        );

        assert!(store.logout());
        assert_consistent(&store);
        assert!(!store.is_authenticated());
    }
}

#[test]
fn relogin_replaces_the_whole_session() {
    let store = SessionStore::in_memory();
    store.login(Token::new("first"), profile(1));
    store.login(Token::new("second"), profile(2));

    assert_eq!(store.current_credential(), Some(Token::new("second")));
    assert_eq!(store.current_profile(), Some(profile(2)));
    assert_eq!(store.generation(), 2);
}

#[test]
fn logout_when_anonymous_is_a_no_op() {
    let store = SessionStore::in_memory();
    let mut rx = store.subscribe();
    assert!(!store.logout());
    assert!(!store.logout());
    assert!(!rx.has_changed().expect("sender alive"));
}

#[test]
fn subscribers_see_each_mutation_before_it_returns() {
    let store = SessionStore::in_memory();
    let mut rx = store.subscribe();

    store.login(Token::new("tok"), profile(5));
    assert!(rx.has_changed().expect("sender alive"));
    assert!(rx.borrow_and_update().is_authenticated());

    store.logout();
    assert!(rx.has_changed().expect("sender alive"));
    assert!(!rx.borrow_and_update().is_authenticated());
}

#[test]
fn session_is_rehydrated_from_storage() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let store = SessionStore::open(Arc::new(FileKeyValueStore::new(dir.path())));
        store.login(Token::new("persisted-token"), profile(9));
    }

    let reopened = SessionStore::open(Arc::new(FileKeyValueStore::new(dir.path())));
    assert!(reopened.is_authenticated());
    assert_eq!(reopened.current_credential(), Some(Token::new("persisted-token")));
    assert_eq!(reopened.current_profile(), Some(profile(9)));
    assert_eq!(reopened.generation(), 1);
}

#[test]
fn logout_is_persisted() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let store = SessionStore::open(Arc::new(FileKeyValueStore::new(dir.path())));
        store.login(Token::new("tok"), profile(1));
        store.logout();
    }

    let reopened = SessionStore::open(Arc::new(FileKeyValueStore::new(dir.path())));
    assert!(!reopened.is_authenticated());
}

#[test]
fn partial_or_corrupt_persisted_sessions_rehydrate_as_anonymous() {
    let storage = Arc::new(MemoryKeyValueStore::new());
    storage
        .set(
            SESSION_STORAGE_KEY,
            r#"{"version": 1, "credential": "orphan-token", "profile": null}"#,
        )
        .expect("seed");
    let store = SessionStore::open(storage.clone());
    assert!(!store.is_authenticated());
    assert_eq!(store.current_credential(), None);

    storage.set(SESSION_STORAGE_KEY, "garbage").expect("seed");
    let store = SessionStore::open(storage);
    assert!(!store.is_authenticated());
}

#[test]
fn token_debug_output_is_redacted() {
    let token = Token::new("abcdefghijklmnopqrstuvwxyz");
    let rendered = format!("{token:?}");
    assert!(rendered.contains("abcdefgh"));
    assert!(!rendered.contains("ijklmnop"));
}

#[test]
fn conditional_logout_only_clears_the_matching_credential() {
    let store = SessionStore::in_memory();
    store.login(Token::new("first"), profile(1));
    store.login(Token::new("second"), profile(1));

    assert_eq!(store.logout_if_current(Some(&Token::new("first"))), None);
    assert_eq!(store.current_credential(), Some(Token::new("second")));

    assert_eq!(store.logout_if_current(Some(&Token::new("second"))), Some(2));
    assert!(!store.is_authenticated());

    // An anonymous rejection matches an anonymous session but has nothing to clear.
    let mut rx = store.subscribe();
    assert_eq!(store.logout_if_current(None), Some(2));
    assert!(!rx.has_changed().expect("sender alive"));
}

#[test]
fn conditional_profile_refresh_ignores_a_replaced_credential() {
    let store = SessionStore::in_memory();
    store.login(Token::new("tok"), profile(1));

    let mut renamed = profile(1);
    renamed.full_name = Some("Renamed".into());
    assert!(store.refresh_profile_if_current(&Token::new("tok"), renamed.clone()));
    assert_eq!(store.current_profile(), Some(renamed.clone()));
    assert_eq!(store.generation(), 1);

    store.logout();
    assert!(!store.refresh_profile_if_current(&Token::new("tok"), renamed));
    assert!(!store.is_authenticated());
}

#[test]
fn concurrent_logins_are_never_cleared_by_a_stale_rejection() {
    let store = Arc::new(SessionStore::in_memory());
    store.login(Token::new("stale"), profile(1));

    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for round in 0..200 {
                store.login(Token::new(format!("fresh-{round}")), profile(1));
            }
        })
    };
    let stale = Token::new("stale");
    let mut cleared = 0;
    for _ in 0..200 {
        if store.logout_if_current(Some(&stale)).is_some() {
            cleared += 1;
        }
    }
    writer.join().expect("writer thread");

    assert!(cleared <= 1);
    assert_eq!(store.current_credential(), Some(Token::new("fresh-199")));
    assert_consistent(&store);
}
