mod common;

use std::time::Duration;

use asupersync::runtime::RuntimeBuilder;
use common::{Fixture, Person, expect_err, fixture, seed, unwrap_outcome};
use tierdb::prelude::*;
use tierdb::{
    CacheAheadReceiver, ChangeKind, DirtyReceiver, LazyReceiver, Locker, ObjectState,
    flush_cache_ahead, flush_lazy,
};

/// Column values of a person as storage holds them: name, age, fake_delete.
async fn stored(fx: &Fixture, cx: &Cx, id: u64) -> Vec<Value> {
    let meta = fx.engine.meta::<Person>().expect("registered");
    let mut rows = unwrap_outcome(fx.engine.load_from_storage(cx, &meta, &[id]).await);
    rows.remove(&id).expect("stored row")
}

#[test]
fn lazily_inserted_row_is_missing_until_digested() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let mut writer = Session::new(&fx.engine);
        writer
            .track(Person {
                id: 42,
                name: "deferred".into(),
                age: 20,
            })
            .unwrap();
        assert_eq!(unwrap_outcome(flush_lazy(&mut writer, &cx).await), 1);

        let mut before = Session::new(&fx.engine);
        assert!(unwrap_outcome(before.load_by_id::<Person>(&cx, 42).await).is_none());
        assert_eq!(
            unwrap_outcome(before.cached_search_count::<Person>(&cx, "All", &[]).await),
            0
        );

        let receiver = LazyReceiver::new(&fx.engine);
        assert_eq!(unwrap_outcome(receiver.digest_all(&cx, 10).await), 1);

        let mut after = Session::new(&fx.engine);
        let h = unwrap_outcome(after.must_load_by_id::<Person>(&cx, 42).await);
        assert_eq!(after.get(h).unwrap().name, "deferred");
        assert_eq!(
            unwrap_outcome(after.cached_search_count::<Person>(&cx, "All", &[]).await),
            1
        );
    });
}

#[test]
fn lazy_update_keeps_old_values_visible() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let ids = seed(&fx.engine, &cx, &[("alice", 10)]).await;

        let mut writer = Session::new(&fx.engine);
        let alice = unwrap_outcome(writer.must_load_by_id::<Person>(&cx, ids[0]).await);
        writer.get_mut(alice).unwrap().age = 11;
        unwrap_outcome(flush_lazy(&mut writer, &cx).await);
        assert!(!writer.is_dirty(alice));

        let mut reader = Session::new(&fx.engine);
        let seen = unwrap_outcome(reader.must_load_by_id::<Person>(&cx, ids[0]).await);
        assert_eq!(reader.get(seen).unwrap().age, 10);

        let summary = unwrap_outcome(LazyReceiver::new(&fx.engine).digest(&cx).await)
            .expect("queued message");
        assert_eq!(summary.updated, 1);

        let mut later = Session::new(&fx.engine);
        let seen = unwrap_outcome(later.must_load_by_id::<Person>(&cx, ids[0]).await);
        assert_eq!(later.get(seen).unwrap().age, 11);
    });
}

#[test]
fn cache_ahead_update_reaches_lists_and_storage() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let ids = seed(&fx.engine, &cx, &[("alice", 10), ("bob", 10)]).await;
        let ten = [Value::Int(10)];

        let mut reader = Session::new(&fx.engine);
        assert_eq!(
            unwrap_outcome(reader.cached_search_count::<Person>(&cx, "IndexAge", &ten).await),
            2
        );

        let mut writer = Session::new(&fx.engine);
        let alice = unwrap_outcome(writer.must_load_by_id::<Person>(&cx, ids[0]).await);
        let bob = unwrap_outcome(writer.must_load_by_id::<Person>(&cx, ids[1]).await);
        writer.get_mut(alice).unwrap().age = 31;
        writer.get_mut(bob).unwrap().age = 30;
        let summary = unwrap_outcome(flush_cache_ahead(&mut writer, &cx).await);
        assert_eq!(summary.updated, 2);

        let mut cached = Session::new(&fx.engine);
        let seen = unwrap_outcome(cached.must_load_by_id::<Person>(&cx, ids[1]).await);
        assert_eq!(cached.get(seen).unwrap().age, 30);

        let receiver = CacheAheadReceiver::new(&fx.engine);
        assert_eq!(unwrap_outcome(receiver.size(&cx).await), 2);
        assert_eq!(unwrap_outcome(receiver.digest(&cx).await), Some(1));
        assert_eq!(unwrap_outcome(receiver.size(&cx).await), 1);
        assert_eq!(unwrap_outcome(receiver.digest_all(&cx, 10).await), 1);
        assert_eq!(stored(&fx, &cx, ids[0]).await[1], Value::Int(31));
        assert_eq!(stored(&fx, &cx, ids[1]).await[1], Value::Int(30));

        let mut after = Session::new(&fx.engine);
        assert_eq!(
            unwrap_outcome(after.cached_search_count::<Person>(&cx, "IndexAge", &ten).await),
            0
        );
        for age in [30, 31] {
            let count = unwrap_outcome(
                after
                    .cached_search_count::<Person>(&cx, "IndexAge", &[Value::Int(age)])
                    .await,
            );
            assert_eq!(count, 1);
        }
    });
}

#[test]
fn failed_storage_write_leaves_cache_ahead_updates_pending() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let ids = seed(&fx.engine, &cx, &[("alice", 10)]).await;

        let mut writer = Session::new(&fx.engine);
        let alice = unwrap_outcome(writer.must_load_by_id::<Person>(&cx, ids[0]).await);
        writer.get_mut(alice).unwrap().age = 30;
        let newcomer = writer.track(Person::new("bob", 5)).unwrap();

        fx.storage.fail_next_write("people");
        let err = expect_err(flush_cache_ahead(&mut writer, &cx).await);
        assert!(matches!(err, Error::Query(_)));
        assert!(writer.is_dirty(alice));
        assert_eq!(writer.state(newcomer), Some(ObjectState::New));

        let receiver = CacheAheadReceiver::new(&fx.engine);
        assert_eq!(unwrap_outcome(receiver.size(&cx).await), 0);
        let mut reader = Session::new(&fx.engine);
        let seen = unwrap_outcome(reader.must_load_by_id::<Person>(&cx, ids[0]).await);
        assert_eq!(reader.get(seen).unwrap().age, 10);

        let summary = unwrap_outcome(flush_cache_ahead(&mut writer, &cx).await);
        assert_eq!((summary.inserted, summary.updated), (1, 1));
        assert!(!writer.is_dirty(alice));
        assert_eq!(unwrap_outcome(receiver.size(&cx).await), 1);
    });
}

#[test]
fn later_synchronous_write_survives_cache_ahead_digest() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let ids = seed(&fx.engine, &cx, &[("a", 10)]).await;

        let mut ahead = Session::new(&fx.engine);
        let first = unwrap_outcome(ahead.must_load_by_id::<Person>(&cx, ids[0]).await);
        ahead.get_mut(first).unwrap().name = "b".into();
        unwrap_outcome(flush_cache_ahead(&mut ahead, &cx).await);

        let mut direct = Session::new(&fx.engine);
        let second = unwrap_outcome(direct.must_load_by_id::<Person>(&cx, ids[0]).await);
        assert_eq!(direct.get(second).unwrap().name, "b");
        direct.get_mut(second).unwrap().name = "c".into();
        unwrap_outcome(direct.flush(&cx).await);

        let receiver = CacheAheadReceiver::new(&fx.engine);
        assert_eq!(unwrap_outcome(receiver.digest(&cx).await), Some(0));
        assert_eq!(unwrap_outcome(receiver.size(&cx).await), 0);
        assert_eq!(stored(&fx, &cx, ids[0]).await[0], Value::from("c"));

        let mut reader = Session::new(&fx.engine);
        let seen = unwrap_outcome(reader.must_load_by_id::<Person>(&cx, ids[0]).await);
        assert_eq!(reader.get(seen).unwrap().name, "c");
    });
}

#[test]
fn cache_ahead_write_survives_a_lost_cache_entry() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let ids = seed(&fx.engine, &cx, &[("alice", 10)]).await;

        let mut writer = Session::new(&fx.engine);
        let alice = unwrap_outcome(writer.must_load_by_id::<Person>(&cx, ids[0]).await);
        writer.get_mut(alice).unwrap().age = 44;
        unwrap_outcome(flush_cache_ahead(&mut writer, &cx).await);
        unwrap_outcome(fx.engine.clear_by_ids::<Person>(&cx, &[ids[0]]).await);

        let receiver = CacheAheadReceiver::new(&fx.engine);
        assert_eq!(unwrap_outcome(receiver.digest(&cx).await), Some(1));
        assert_eq!(stored(&fx, &cx, ids[0]).await[1], Value::Int(44));
    });
}

#[test]
fn dirty_channel_reports_each_flush() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let ids = seed(&fx.engine, &cx, &[("alice", 10), ("bob", 12)]).await;

        let mut session = Session::new(&fx.engine);
        let alice = unwrap_outcome(session.must_load_by_id::<Person>(&cx, ids[0]).await);
        session.get_mut(alice).unwrap().age = 15;
        unwrap_outcome(session.flush(&cx).await);

        let receiver = DirtyReceiver::new(&fx.engine, "people");
        let mut kinds = Vec::new();
        let handled = unwrap_outcome(
            receiver
                .digest(&cx, 10, |event| {
                    kinds.push(event.entries.iter().map(|e| e.kind).collect::<Vec<_>>());
                    Ok(())
                })
                .await,
        );
        assert_eq!(handled, 2);
        assert_eq!(
            kinds,
            vec![
                vec![ChangeKind::Insert, ChangeKind::Insert],
                vec![ChangeKind::Update]
            ]
        );
        assert_eq!(unwrap_outcome(receiver.size(&cx).await), 0);
    });
}

#[test]
fn one_digester_at_a_time() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let fx = fixture();

    rt.block_on(async {
        let locker = Locker::new(Pool::shared(fx.remote.clone()));
        let ttl = Duration::from_secs(10);

        let held = unwrap_outcome(locker.obtain(&cx, "lazy-digest", ttl, Duration::ZERO).await)
            .expect("free lock");
        let rival = unwrap_outcome(locker.obtain(&cx, "lazy-digest", ttl, Duration::ZERO).await);
        assert!(rival.is_none());

        let mut writer = Session::new(&fx.engine);
        writer.track(Person::new("queued", 5)).unwrap();
        unwrap_outcome(flush_lazy(&mut writer, &cx).await);
        assert_eq!(
            unwrap_outcome(LazyReceiver::new(&fx.engine).digest_all(&cx, 10).await),
            1
        );

        assert!(unwrap_outcome(held.release(&cx).await));
        let next = unwrap_outcome(locker.obtain(&cx, "lazy-digest", ttl, Duration::ZERO).await);
        assert!(next.is_some());
        assert_eq!(fx.storage.row_count("people"), 1);
    });
}
