//! Property tests for cursor pagination.
//!
//! Paging through a result set with `limit` and `start(cursor)` must visit
//! every matching row exactly once, in the same order as the unpaged query,
//! no matter how many rows share a sort value.

use proptest::prelude::*;
use rowsync_core::{
    col, ColumnType, Direction, PermissionSet, Query, ResolvedQuery, Row, SchemaRegistry,
    TableSchema,
};
use std::collections::BTreeMap;

fn registry() -> SchemaRegistry {
    SchemaRegistry::builder()
        .table(
            TableSchema::builder("item")
                .column("id", ColumnType::Text)
                .column("score", ColumnType::Integer)
                .column("label", ColumnType::Text)
                .primary_key(["id"])
                .build(),
        )
        .build()
        .expect("valid schema")
}

fn items_strategy() -> impl Strategy<Value = Vec<(i64, String)>> {
    prop::collection::vec((0i64..5, "[a-c]{1,2}"), 0..40)
}

fn source(items: &[(i64, String)]) -> BTreeMap<String, Vec<Row>> {
    let rows = items
        .iter()
        .enumerate()
        .map(|(i, (score, label))| {
            Row::new()
                .with("id", format!("item-{i:03}"))
                .with("score", *score)
                .with("label", label.as_str())
        })
        .collect();
    let mut data = BTreeMap::new();
    data.insert("item".to_string(), rows);
    data
}

fn ids(rows: &[rowsync_core::ResultRow]) -> Vec<String> {
    rows.iter()
        .map(|r| r.row.text("id").expect("id").to_string())
        .collect()
}

proptest! {
    #[test]
    fn pages_cover_all_rows_once(
        items in items_strategy(),
        page in 1usize..7,
        descending in any::<bool>(),
    ) {
        let registry = registry();
        let perms = PermissionSet::open();
        let data = source(&items);
        let direction = if descending { Direction::Desc } else { Direction::Asc };
        let base = Query::table("item").order_by("score", direction);

        let full = ResolvedQuery::resolve(&base, &registry, &perms, None)
            .expect("resolves")
            .execute(&data);

        let mut seen = Vec::new();
        let mut query = base.clone().limit(page);
        loop {
            let resolved = ResolvedQuery::resolve(&query, &registry, &perms, None)
                .expect("resolves");
            let rows = resolved.execute(&data);
            prop_assert!(rows.len() <= page);
            seen.extend(ids(&rows));
            match rows.last() {
                Some(last) if rows.len() == page => {
                    query = base.clone().limit(page).start(resolved.cursor(&last.row));
                }
                _ => break,
            }
        }

        prop_assert_eq!(seen, ids(&full));
    }

    #[test]
    fn filters_compose_with_paging(items in items_strategy(), page in 1usize..5) {
        let registry = registry();
        let perms = PermissionSet::open();
        let data = source(&items);
        let base = Query::table("item")
            .filter(col("label").like("a%"))
            .order_by("score", Direction::Asc);

        let full = ResolvedQuery::resolve(&base, &registry, &perms, None)
            .expect("resolves")
            .execute(&data);
        prop_assert!(full.iter().all(|r| r.row.text("label").expect("label").starts_with('a')));

        let mut seen = Vec::new();
        let mut query = base.clone().limit(page);
        loop {
            let resolved = ResolvedQuery::resolve(&query, &registry, &perms, None)
                .expect("resolves");
            let rows = resolved.execute(&data);
            seen.extend(ids(&rows));
            match rows.last() {
                Some(last) if rows.len() == page => {
                    query = base.clone().limit(page).start(resolved.cursor(&last.row));
                }
                _ => break,
            }
        }
        prop_assert_eq!(seen, ids(&full));
    }

    #[test]
    fn inclusive_start_repeats_the_cursor_row(items in items_strategy()) {
        prop_assume!(!items.is_empty());
        let registry = registry();
        let perms = PermissionSet::open();
        let data = source(&items);
        let base = Query::table("item").order_by("score", Direction::Desc);

        let first = ResolvedQuery::resolve(&base.clone().limit(1), &registry, &perms, None)
            .expect("resolves");
        let rows = first.execute(&data);
        let cursor = first.cursor(&rows[0].row);

        let again = ResolvedQuery::resolve(&base.start_inclusive(cursor).limit(1), &registry, &perms, None)
            .expect("resolves")
            .execute(&data);
        prop_assert_eq!(ids(&again), ids(&rows));
    }
}
