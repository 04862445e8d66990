mod common;

use std::collections::HashMap;

use asupersync::runtime::RuntimeBuilder;
use common::{Person, fixture, seed, unwrap_outcome};
use proptest::prelude::*;
use tierdb::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// A page is exactly the skip/take window over the full list.
    #[test]
    fn prop_page_is_skip_take_window(
        len in 0usize..60,
        page in 0usize..12,
        page_size in 1usize..15,
    ) {
        let items: Vec<usize> = (0..len).collect();
        let expected: Vec<usize> = items
            .iter()
            .copied()
            .skip(page.max(1).saturating_sub(1) * page_size)
            .take(page_size)
            .collect();
        prop_assert_eq!(Pager::new(page, page_size).slice(&items), expected.as_slice());
    }

    /// Pages of one size never overlap and together cover the list in order.
    #[test]
    fn prop_pages_partition_the_list(len in 0usize..60, page_size in 1usize..15) {
        let items: Vec<usize> = (0..len).collect();
        let mut joined = Vec::new();
        let mut page = 1;
        loop {
            let slice = Pager::new(page, page_size).slice(&items);
            if slice.is_empty() {
                break;
            }
            joined.extend_from_slice(slice);
            page += 1;
        }
        prop_assert_eq!(joined, items);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// However often and in whatever batches ids are loaded, a session
    /// holds one instance per stored row.
    #[test]
    fn prop_identity_map_holds_one_instance_per_row(
        lookups in prop::collection::vec(prop::collection::vec(0usize..6, 1..5), 1..8),
    ) {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let fx = fixture();

        rt.block_on(async {
            let ids = seed(
                &fx.engine,
                &cx,
                &[("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5), ("f", 6)],
            )
            .await;

            let mut session = Session::new(&fx.engine);
            let mut seen: HashMap<u64, Handle<Person>> = HashMap::new();
            for batch in &lookups {
                let wanted: Vec<u64> = batch.iter().map(|i| ids[*i]).collect();
                let handles = unwrap_outcome(session.load_by_ids::<Person>(&cx, &wanted).await);
                for (id, handle) in wanted.iter().zip(handles) {
                    let handle = handle.expect("seeded row");
                    assert_eq!(session.get(handle).unwrap().id, *id);
                    let first = *seen.entry(*id).or_insert(handle);
                    assert_eq!(first, handle);
                }
            }
            assert_eq!(session.tracked_count(), seen.len());
        });
    }
}
