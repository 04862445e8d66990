mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{Badge, Person, Pet, expect_err, fixture, seed, unwrap_outcome};
use tierdb::{ForeignKeyErrorKind, ObjectState};
use tierdb::prelude::*;

#[test]
fn one_instance_per_row_within_a_session() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let ids = seed(&fx.engine, &cx, &[("alice", 10), ("bob", 12)]).await;

        let mut session = Session::new(&fx.engine);
        let first = unwrap_outcome(session.must_load_by_id::<Person>(&cx, ids[0]).await);
        session.get_mut(first).unwrap().name = "alicia".into();

        let again = unwrap_outcome(session.must_load_by_id::<Person>(&cx, ids[0]).await);
        assert_eq!(first, again);
        assert_eq!(session.get(again).unwrap().name, "alicia");

        let batch = unwrap_outcome(session.load_by_ids::<Person>(&cx, &[ids[1], ids[0], 999]).await);
        assert_eq!(batch[1], Some(first));
        assert!(batch[0].is_some());
        assert!(batch[2].is_none());
        assert_eq!(session.tracked_count(), 2);
    });
}

#[test]
fn flushed_values_round_trip_through_every_tier() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let ids = seed(&fx.engine, &cx, &[("alice", 10)]).await;
        fx.storage.reset_counters();

        let mut local = Session::new(&fx.engine);
        let h = unwrap_outcome(local.must_load_by_id::<Person>(&cx, ids[0]).await);
        assert_eq!(local.get(h).unwrap(), &Person { id: ids[0], name: "alice".into(), age: 10 });
        assert_eq!(fx.storage.query_count(), 0);

        fx.engine.local_cache("local").expect("local tier").clear();
        let before = fx.engine.stats();
        let mut remote = Session::new(&fx.engine);
        let h = unwrap_outcome(remote.must_load_by_id::<Person>(&cx, ids[0]).await);
        assert_eq!(remote.get(h).unwrap().name, "alice");
        assert_eq!(fx.engine.stats().remote_hits, before.remote_hits + 1);
        assert_eq!(fx.storage.query_count(), 0);

        fx.engine.local_cache("local").expect("local tier").clear();
        fx.remote.flush_all();
        let mut cold = Session::new(&fx.engine);
        let h = unwrap_outcome(cold.must_load_by_id::<Person>(&cx, ids[0]).await);
        assert_eq!(cold.get(h).unwrap().age, 10);
        assert_eq!(fx.storage.query_count(), 1);
    });
}

#[test]
fn unchanged_entities_are_not_written() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let ids = seed(&fx.engine, &cx, &[("alice", 10)]).await;

        let mut session = Session::new(&fx.engine);
        let h = unwrap_outcome(session.must_load_by_id::<Person>(&cx, ids[0]).await);
        session.get_mut(h).unwrap().name = "alice".into();
        assert!(!session.is_dirty(h));

        fx.storage.reset_counters();
        let summary = unwrap_outcome(session.flush(&cx).await);
        assert!(summary.is_empty());
        assert_eq!(fx.storage.statement_count(), 0);

        session.get_mut(h).unwrap().age = 11;
        assert!(session.is_dirty(h));
        assert_eq!(session.dirty_count(), 1);
        let summary = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(summary.updated, 1);
        assert!(!session.is_dirty(h));

        let mut reader = Session::new(&fx.engine);
        let seen = unwrap_outcome(reader.must_load_by_id::<Person>(&cx, ids[0]).await);
        assert_eq!(reader.get(seen).unwrap().age, 11);
    });
}

#[test]
fn missing_rows_are_remembered() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let mut first = Session::new(&fx.engine);
        assert!(unwrap_outcome(first.load_by_id::<Person>(&cx, 999).await).is_none());
        assert_eq!(fx.storage.query_count(), 1);

        let mut second = Session::new(&fx.engine);
        assert!(unwrap_outcome(second.load_by_id::<Person>(&cx, 999).await).is_none());
        assert_eq!(fx.storage.query_count(), 1);

        let err = expect_err(second.must_load_by_id::<Person>(&cx, 999).await);
        assert!(matches!(err, Error::EntityNotFound { id: 999, .. }));

        // An explicit-id insert replaces the remembered miss.
        let mut writer = Session::new(&fx.engine);
        writer
            .track(Person {
                id: 999,
                name: "late".into(),
                age: 40,
            })
            .unwrap();
        unwrap_outcome(writer.flush(&cx).await);

        let mut third = Session::new(&fx.engine);
        let h = unwrap_outcome(third.must_load_by_id::<Person>(&cx, 999).await);
        assert_eq!(third.get(h).unwrap().name, "late");
    });
}

#[test]
fn fake_deleted_rows_read_as_missing() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let ids = seed(&fx.engine, &cx, &[("alice", 10)]).await;

        let mut session = Session::new(&fx.engine);
        let h = unwrap_outcome(session.must_load_by_id::<Person>(&cx, ids[0]).await);
        assert!(session.mark_to_delete(h));
        let summary = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(summary.updated, 1);
        assert_eq!(fx.storage.row_count("people"), 1);

        let mut reader = Session::new(&fx.engine);
        assert!(unwrap_outcome(reader.load_by_id::<Person>(&cx, ids[0]).await).is_none());
        let all = unwrap_outcome(reader.cached_search_count::<Person>(&cx, "All", &[]).await);
        assert_eq!(all, 0);
    });
}

#[test]
fn references_resolve_and_deletes_cascade() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let ids = seed(&fx.engine, &cx, &[("alice", 10), ("bob", 12)]).await;

        let mut session = Session::new(&fx.engine);
        session.track(Pet::new(ids[0], "rex")).unwrap();
        session.track(Pet::new(ids[0], "tom")).unwrap();
        session.track(Pet::new(ids[1], "kit")).unwrap();
        unwrap_outcome(session.flush(&cx).await);

        let mut reader = Session::new(&fx.engine);
        let page = unwrap_outcome(
            reader
                .cached_search_with_references::<Pet>(
                    &cx,
                    "ByOwner",
                    &[Value::from(ids[0])],
                    Pager::all(),
                    &["owner_id"],
                )
                .await,
        );
        assert_eq!(page.total, 2);
        let owner = reader.handle_of::<Person>(ids[0]).expect("owner loaded with the page");
        let via_pet = unwrap_outcome(reader.reference::<Pet, Person>(&cx, page.handles[0], "owner_id").await);
        assert_eq!(via_pet, Some(owner));

        let err = expect_err(reader.reference::<Pet, Pet>(&cx, page.handles[0], "owner_id").await);
        assert!(matches!(err, Error::Schema(_)));

        let mut deleter = Session::new(&fx.engine);
        let alice = unwrap_outcome(deleter.must_load_by_id::<Person>(&cx, ids[0]).await);
        assert!(deleter.force_mark_to_delete(alice));
        let summary = unwrap_outcome(deleter.flush(&cx).await);
        assert_eq!(summary.deleted, 3);
        assert_eq!(summary.cascaded, 2);
        assert_eq!(fx.storage.row_count("pets"), 1);
        assert_eq!(deleter.state(alice), Some(ObjectState::Deleted));

        let mut after = Session::new(&fx.engine);
        let left = unwrap_outcome(
            after
                .cached_search_count::<Pet>(&cx, "ByOwner", &[Value::from(ids[0])])
                .await,
        );
        assert_eq!(left, 0);
    });
}

#[test]
fn missing_parent_fails_the_whole_flush() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let mut session = Session::new(&fx.engine);
        let person = session.track(Person::new("carol", 30)).unwrap();
        let pet = session.track(Pet::new(404, "ghost")).unwrap();

        let err = expect_err(session.flush(&cx).await);
        assert!(matches!(err, Error::ForeignKeyViolation(_)));
        assert_eq!(fx.storage.row_count("people"), 0);
        assert_eq!(fx.storage.row_count("pets"), 0);
        assert_eq!(session.state(person), Some(ObjectState::New));
        assert!(session.is_dirty(pet));
    });
}

#[test]
fn restricted_parent_cannot_be_deleted() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let ids = seed(&fx.engine, &cx, &[("alice", 10)]).await;
        let mut session = Session::new(&fx.engine);
        session.track(Badge::new(ids[0], "founder")).unwrap();
        session.track(Pet::new(ids[0], "rex")).unwrap();
        unwrap_outcome(session.flush(&cx).await);

        let mut deleter = Session::new(&fx.engine);
        let alice = unwrap_outcome(deleter.must_load_by_id::<Person>(&cx, ids[0]).await);
        assert!(deleter.force_mark_to_delete(alice));
        fx.storage.reset_counters();

        match expect_err(deleter.flush(&cx).await) {
            Error::ForeignKeyViolation(fk) => {
                assert_eq!(fk.kind, ForeignKeyErrorKind::RestrictedChildren);
                assert_eq!(fk.entity, "Badge");
                assert_eq!(fk.id, ids[0]);
            }
            other => std::panic::panic_any(format!("unexpected error: {other:?}")),
        }
        assert_eq!(fx.storage.statement_count(), fx.storage.query_count());
        assert_eq!(fx.storage.row_count("people"), 1);
        assert_eq!(fx.storage.row_count("pets"), 1);
        assert_eq!(fx.storage.row_count("badges"), 1);
        assert!(deleter.is_dirty(alice));
        assert_eq!(deleter.state(alice), Some(ObjectState::Persistent));
    });
}

#[test]
fn storage_failure_mid_flush_keeps_tracked_state() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let ids = seed(&fx.engine, &cx, &[("alice", 10)]).await;
        let next_id = ids[0] + 1;

        let mut reader = Session::new(&fx.engine);
        assert!(unwrap_outcome(reader.load_by_id::<Person>(&cx, next_id).await).is_none());
        assert_eq!(
            unwrap_outcome(reader.cached_search_count::<Person>(&cx, "All", &[]).await),
            1
        );

        let mut session = Session::new(&fx.engine);
        let bob = session.track(Person::new("bob", 12)).unwrap();
        let pet = session.track(Pet::new(ids[0], "rex")).unwrap();
        fx.storage.fail_next_write("pets");

        let err = expect_err(session.flush(&cx).await);
        assert!(matches!(err, Error::Query(_)));
        assert_eq!(fx.storage.row_count("people"), 2);
        assert_eq!(fx.storage.row_count("pets"), 0);
        assert_eq!(session.state(bob), Some(ObjectState::New));
        assert_eq!(session.get(bob).unwrap().id, 0);
        assert!(session.is_dirty(pet));

        // The tombstone and the list cached before the write are gone.
        let mut after = Session::new(&fx.engine);
        let found = unwrap_outcome(after.load_by_id::<Person>(&cx, next_id).await);
        let found = found.expect("written row is visible");
        assert_eq!(after.get(found).unwrap().name, "bob");
        assert_eq!(
            unwrap_outcome(after.cached_search_count::<Person>(&cx, "All", &[]).await),
            2
        );
    });
}
