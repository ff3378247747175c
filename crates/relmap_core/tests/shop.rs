//! End-to-end tests over the shop fixture graph.

use relmap_codec::{Row, Value};
use relmap_core::{
    Cardinality, CascadeOp, CascadeSet, CoreError, EntityId, EntityType, Fetch, Ownership,
    Persistence, SchemaBuilder,
};
use relmap_storage::{MemoryBackend, StorageBackend};
use relmap_testkit::{
    Address, DELIVERY, MEMBER, ORDER, ORDER_ITEM, ShopEnv, new_delivery, new_member, new_order,
    new_order_item,
};
use std::sync::Arc;

fn home() -> Address {
    Address::new("Seoul", "Teheran-ro 1", "06000")
}

#[test]
fn create_member_assigns_id_and_persists() {
    let env = ShopEnv::new();
    let mut session = env.session();

    let member = new_member(&mut session, "Alice", &home()).unwrap();
    assert!(session.entity(member).unwrap().id().is_none());

    session.flush().unwrap();

    let id = session.entity(member).unwrap().id().unwrap();
    let row = env.backend.get_by_key("member", id.raw()).unwrap().unwrap();
    assert_eq!(row.get("name"), Some(&Value::text("Alice")));
    assert_eq!(row.get("address_city"), Some(&Value::text("Seoul")));
}

#[test]
fn identity_map_returns_same_instance() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    session.flush().unwrap();
    let id = session.entity(member).unwrap().id().unwrap();

    let mut second = env.session();
    let first_load = second.get(MEMBER, id).unwrap();
    let second_load = second.get(MEMBER, id).unwrap();
    assert_eq!(first_load, second_load);
}

#[test]
fn lazy_relation_target_joins_identity_map() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let order = new_order(&mut session, member, "ORDERED").unwrap();
    session.flush().unwrap();
    let member_id = session.entity(member).unwrap().id().unwrap();
    let order_id = session.entity(order).unwrap().id().unwrap();

    // Fresh session: loading the order then walking to its member must
    // yield the same instance a direct get returns.
    let mut fresh = env.session();
    let order = fresh.get(ORDER, order_id).unwrap();
    let via_relation = fresh.to_one(order, "member").unwrap().unwrap();
    let direct = fresh.get(MEMBER, member_id).unwrap();
    assert_eq!(via_relation, direct);
}

#[test]
fn lazy_load_fetches_once_and_caches() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let order = new_order(&mut session, member, "ORDERED").unwrap();
    new_order_item(&mut session, order, "book", 12000, 2).unwrap();
    session.flush().unwrap();
    let order_id = session.entity(order).unwrap().id().unwrap();

    let mut fresh = env.session();
    let order = fresh.get(ORDER, order_id).unwrap();
    let first = fresh.to_many(order, "items").unwrap();
    assert_eq!(first.len(), 1);

    // A row committed behind the session's back must not appear on the
    // second access: the materialized value is cached.
    let tx = env.backend.begin().unwrap();
    let mut rogue = Row::new("order_item", 999);
    rogue.set("order_id", Value::Id(order_id.raw()));
    rogue.set("item_name", Value::text("smuggled"));
    env.backend.write(tx, &rogue).unwrap();
    env.backend.commit(tx).unwrap();

    let second = fresh.to_many(order, "items").unwrap();
    assert_eq!(second, first);
}

#[test]
fn eager_relation_is_materialized_at_load_time() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let order = new_order(&mut session, member, "ORDERED").unwrap();
    new_delivery(&mut session, order, &home()).unwrap();
    session.flush().unwrap();
    let delivery_id = session
        .to_one(order, "delivery")
        .unwrap()
        .and_then(|d| session.entity(d).unwrap().id())
        .unwrap();

    // delivery.order is declared eager: it must come back materialized.
    let mut fresh = env.session();
    let delivery = fresh.get(DELIVERY, delivery_id).unwrap();
    let relation = fresh.entity(delivery).unwrap().relation("order").unwrap().clone();
    assert!(relation.is_materialized());
}

#[test]
fn persist_cascades_to_items_and_delivery() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let order = new_order(&mut session, member, "ORDERED").unwrap();
    let item_a = new_order_item(&mut session, order, "book", 12000, 2).unwrap();
    let item_b = new_order_item(&mut session, order, "album", 8000, 1).unwrap();
    let delivery = new_delivery(&mut session, order, &home()).unwrap();

    // Only member and order were scheduled explicitly; items and delivery
    // ride the Persist cascade.
    session.flush().unwrap();

    let order_id = session.entity(order).unwrap().id().unwrap();
    for item in [item_a, item_b] {
        let id = session.entity(item).unwrap().id().unwrap();
        let row = env
            .backend
            .get_by_key("order_item", id.raw())
            .unwrap()
            .unwrap();
        assert_eq!(row.foreign_key("order_id"), Some(order_id.raw()));
    }
    assert!(session.entity(delivery).unwrap().id().is_some());
}

#[test]
fn remove_cascades_to_items_and_delivery() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let order = new_order(&mut session, member, "ORDERED").unwrap();
    let item = new_order_item(&mut session, order, "book", 12000, 2).unwrap();
    let delivery = new_delivery(&mut session, order, &home()).unwrap();
    session.flush().unwrap();

    let order_id = session.entity(order).unwrap().id().unwrap();
    let item_id = session.entity(item).unwrap().id().unwrap();
    let delivery_id = session.entity(delivery).unwrap().id().unwrap();

    session.remove(order).unwrap();
    session.flush().unwrap();

    assert!(env.backend.get_by_key("order", order_id.raw()).unwrap().is_none());
    assert!(env
        .backend
        .get_by_key("order_item", item_id.raw())
        .unwrap()
        .is_none());
    assert!(env
        .backend
        .get_by_key("delivery", delivery_id.raw())
        .unwrap()
        .is_none());
    // The member does not ride any Remove cascade.
    assert!(env.backend.scan("member").unwrap().len() == 1);
}

#[test]
fn remove_cascade_materializes_unloaded_children() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let order = new_order(&mut session, member, "ORDERED").unwrap();
    new_order_item(&mut session, order, "book", 12000, 2).unwrap();
    new_delivery(&mut session, order, &home()).unwrap();
    session.flush().unwrap();
    let order_id = session.entity(order).unwrap().id().unwrap();

    // A session that never touched the order's relationships: the Remove
    // closure has to fetch them itself to reach every child.
    let mut fresh = env.session();
    let order = fresh.get(ORDER, order_id).unwrap();
    fresh.remove(order).unwrap();
    fresh.flush().unwrap();

    assert!(env.backend.scan("order").unwrap().is_empty());
    assert!(env.backend.scan("order_item").unwrap().is_empty());
    assert!(env.backend.scan("delivery").unwrap().is_empty());
    assert_eq!(env.backend.scan("member").unwrap().len(), 1);
}

#[test]
fn cascade_closure_terminates_on_cycles() {
    // A dedicated two-type cycle where both directions cascade Remove.
    const A: EntityType = EntityType::new("a");
    const B: EntityType = EntityType::new("b");
    let schema = SchemaBuilder::new()
        .entity(A)
        .entity(B)
        .relationship(
            B,
            "a",
            A,
            Cardinality::ToOne,
            Ownership::Owning { fk_field: "a_id" },
            CascadeSet::REMOVE,
            Fetch::Lazy,
        )
        .relationship(
            A,
            "bs",
            B,
            Cardinality::ToMany,
            Ownership::Inverse { mapped_by: "a" },
            CascadeSet::REMOVE,
            Fetch::Lazy,
        )
        .build()
        .unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let persistence = Persistence::new(schema, backend);
    let mut session = persistence.session();

    let a = session.create(A).unwrap();
    session.persist(a).unwrap();
    let b1 = session.create(B).unwrap();
    session.set_one(b1, "a", Some(a)).unwrap();
    session.add_to_many(a, "bs", b1).unwrap();
    let b2 = session.create(B).unwrap();
    session.set_one(b2, "a", Some(a)).unwrap();
    session.add_to_many(a, "bs", b2).unwrap();
    session.persist(b1).unwrap();
    session.persist(b2).unwrap();
    session.flush().unwrap();

    let closure = session.cascade_closure(CascadeOp::Remove, a).unwrap();
    assert_eq!(closure.len(), 3);
    assert_eq!(closure[0], a);
    let unique: std::collections::HashSet<_> = closure.iter().collect();
    assert_eq!(unique.len(), 3);
}

#[test]
fn flush_failure_commits_nothing_and_is_retryable() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let order = new_order(&mut session, member, "ORDERED").unwrap();
    new_order_item(&mut session, order, "book", 12000, 2).unwrap();
    new_order_item(&mut session, order, "album", 8000, 1).unwrap();

    // Fail on the third of five writes.
    env.backend.fail_after_writes(2);
    let err = session.flush().unwrap_err();
    assert!(matches!(err, CoreError::FlushFailed { .. }));

    // Nothing observable was committed.
    assert_eq!(env.backend.committed_count(), 0);
    // The session rolled back: entities are transient again.
    assert!(session.entity(member).unwrap().id().is_none());

    // After the fault clears, the same unit of work flushes cleanly.
    env.backend.clear_faults();
    session.flush().unwrap();
    assert!(session.entity(member).unwrap().id().is_some());
    assert_eq!(env.backend.scan("order_item").unwrap().len(), 2);
}

#[test]
fn commit_failure_surfaces_as_flush_failed() {
    let env = ShopEnv::new();
    let mut session = env.session();
    new_member(&mut session, "Alice", &home()).unwrap();

    env.backend.fail_next_commit();
    let err = session.flush().unwrap_err();
    assert!(matches!(err, CoreError::FlushFailed { .. }));
    assert_eq!(env.backend.committed_count(), 0);

    session.flush().unwrap();
    assert_eq!(env.backend.scan("member").unwrap().len(), 1);
}

#[test]
fn inverse_mutation_without_owning_update_blocks_flush() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let order = new_order(&mut session, member, "ORDERED").unwrap();
    session.flush().unwrap();

    // Mutate only the inverse collection; the item's owning fk still
    // points nowhere.
    let item = session.create(ORDER_ITEM).unwrap();
    session
        .set_field(item, "item_name", Value::text("book"))
        .unwrap();
    session.add_to_many(order, "items", item).unwrap();

    let err = session.flush().unwrap_err();
    assert!(matches!(err, CoreError::DanglingReference { .. }));

    // Fixing the owning side and re-issuing the root operation unblocks
    // the same unit of work; the item rides the Persist cascade.
    session.set_one(item, "order", Some(order)).unwrap();
    session.persist(order).unwrap();
    session.flush().unwrap();
    assert_eq!(env.backend.scan("order_item").unwrap().len(), 1);
}

#[test]
fn removing_a_referenced_entity_blocks_flush() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    new_order(&mut session, member, "ORDERED").unwrap();
    session.flush().unwrap();

    // member.orders carries no Remove cascade; the order still holds
    // member_id, so the removal dangles.
    session.remove(member).unwrap();
    let err = session.flush().unwrap_err();
    assert!(matches!(err, CoreError::DanglingReference { .. }));
    assert_eq!(env.backend.scan("member").unwrap().len(), 1);
}

#[test]
fn removed_entity_is_detached_and_stale() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let order = new_order(&mut session, member, "ORDERED").unwrap();
    session.flush().unwrap();

    session.remove(order).unwrap();
    session.flush().unwrap();

    let err = session.to_one(order, "member").unwrap_err();
    assert!(matches!(err, CoreError::StaleReferenceAccess { .. }));
    let err = session.set_field(order, "status", Value::text("CANCELLED")).unwrap_err();
    assert!(matches!(err, CoreError::StaleReferenceAccess { .. }));
}

#[test]
fn closed_session_access_is_stale() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    session.flush().unwrap();
    let id = session.entity(member).unwrap().id().unwrap();
    session.close();

    assert!(matches!(
        session.get(MEMBER, id),
        Err(CoreError::StaleReferenceAccess { .. })
    ));
    assert!(matches!(
        session.field(member, "name"),
        Err(CoreError::StaleReferenceAccess { .. })
    ));
}

#[test]
fn not_found_is_recoverable() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let err = session.get(MEMBER, EntityId::new(404)).unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
    // The session keeps working afterwards.
    new_member(&mut session, "Alice", &home()).unwrap();
    session.flush().unwrap();
}

#[test]
fn storage_assigned_ids_flow_through_flush() {
    let env = ShopEnv::storage_assigned();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let other = new_member(&mut session, "Bob", &home()).unwrap();
    session.flush().unwrap();

    let a = session.entity(member).unwrap().id().unwrap();
    let b = session.entity(other).unwrap().id().unwrap();
    assert_ne!(a, b);
    assert!(env.backend.get_by_key("member", a.raw()).unwrap().is_some());
}

#[test]
fn dirty_update_touches_changed_entities_only() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let order = new_order(&mut session, member, "ORDERED").unwrap();
    session.flush().unwrap();

    session
        .set_field(order, "status", Value::text("CANCELLED"))
        .unwrap();
    session.flush().unwrap();

    let order_id = session.entity(order).unwrap().id().unwrap();
    let row = env.backend.get_by_key("order", order_id.raw()).unwrap().unwrap();
    assert_eq!(row.get("status"), Some(&Value::text("CANCELLED")));

    // The member row kept its original content.
    let member_id = session.entity(member).unwrap().id().unwrap();
    let row = env.backend.get_by_key("member", member_id.raw()).unwrap().unwrap();
    assert_eq!(row.get("name"), Some(&Value::text("Alice")));
}

#[test]
fn merge_cascade_schedules_new_items() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let order = new_order(&mut session, member, "ORDERED").unwrap();
    session.flush().unwrap();

    // A new item wired on both sides, scheduled through a Merge root:
    // order.items cascades Merge, so the transient item gets inserted.
    let item = new_order_item(&mut session, order, "book", 12000, 2).unwrap();
    session.merge(order).unwrap();
    session.flush().unwrap();

    assert!(session.entity(item).unwrap().id().is_some());
    assert_eq!(env.backend.scan("order_item").unwrap().len(), 1);
}

#[test]
fn removing_from_inverse_collection_does_not_delete_the_target() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let order = new_order(&mut session, member, "ORDERED").unwrap();
    let item = new_order_item(&mut session, order, "book", 12000, 2).unwrap();
    session.flush().unwrap();

    // Dropping the item from the collection view does not touch the
    // owning foreign key: the owning side stays the source of truth.
    session.remove_from_many(order, "items", item).unwrap();
    assert!(session.to_many(order, "items").unwrap().is_empty());
    session.flush().unwrap();

    assert_eq!(env.backend.scan("order_item").unwrap().len(), 1);
}

#[test]
fn inverse_collection_is_visible_in_fresh_session() {
    let env = ShopEnv::new();
    let mut session = env.session();
    let member = new_member(&mut session, "Alice", &home()).unwrap();
    let order_a = new_order(&mut session, member, "ORDERED").unwrap();
    let order_b = new_order(&mut session, member, "ORDERED").unwrap();
    session.flush().unwrap();
    let member_id = session.entity(member).unwrap().id().unwrap();
    let expected: Vec<EntityId> = [order_a, order_b]
        .iter()
        .map(|o| session.entity(*o).unwrap().id().unwrap())
        .collect();

    let mut fresh = env.session();
    let member = fresh.get(MEMBER, member_id).unwrap();
    let orders = fresh.to_many(member, "orders").unwrap();
    let ids: Vec<EntityId> = orders
        .iter()
        .map(|o| fresh.entity(*o).unwrap().id().unwrap())
        .collect();
    assert_eq!(ids, expected);
}
