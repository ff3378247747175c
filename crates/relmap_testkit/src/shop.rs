//! The shop fixture graph and entity builders.

use relmap_codec::Value;
use relmap_core::{
    Cardinality, CascadeSet, CoreResult, EntityKey, EntityType, Fetch, Ownership, Schema,
    SchemaBuilder, Session,
};

/// A shop member.
pub const MEMBER: EntityType = EntityType::new("member");
/// An order placed by a member.
pub const ORDER: EntityType = EntityType::new("order");
/// One line of an order.
pub const ORDER_ITEM: EntityType = EntityType::new("order_item");
/// The delivery of an order.
pub const DELIVERY: EntityType = EntityType::new("delivery");

/// Builds the shop relationship graph.
///
/// Panics on misdeclaration: the fixture is validated by the schema
/// builder and a failure here is a bug in the fixture itself.
#[must_use]
pub fn shop_schema() -> Schema {
    SchemaBuilder::new()
        .entity(MEMBER)
        .entity(ORDER)
        .entity(ORDER_ITEM)
        .entity(DELIVERY)
        .relationship(
            ORDER,
            "member",
            MEMBER,
            Cardinality::ToOne,
            Ownership::Owning { fk_field: "member_id" },
            CascadeSet::NONE,
            Fetch::Lazy,
        )
        .relationship(
            MEMBER,
            "orders",
            ORDER,
            Cardinality::ToMany,
            Ownership::Inverse { mapped_by: "member" },
            CascadeSet::NONE,
            Fetch::Lazy,
        )
        .relationship(
            ORDER_ITEM,
            "order",
            ORDER,
            Cardinality::ToOne,
            Ownership::Owning { fk_field: "order_id" },
            CascadeSet::NONE,
            Fetch::Lazy,
        )
        .relationship(
            ORDER,
            "items",
            ORDER_ITEM,
            Cardinality::ToMany,
            Ownership::Inverse { mapped_by: "order" },
            CascadeSet::ALL,
            Fetch::Lazy,
        )
        .relationship(
            ORDER,
            "delivery",
            DELIVERY,
            Cardinality::ToOne,
            Ownership::Owning { fk_field: "delivery_id" },
            CascadeSet::PERSIST | CascadeSet::REMOVE,
            Fetch::Lazy,
        )
        .relationship(
            DELIVERY,
            "order",
            ORDER,
            Cardinality::ToOne,
            Ownership::Inverse { mapped_by: "delivery" },
            CascadeSet::NONE,
            Fetch::Eager,
        )
        .build()
        .expect("shop fixture schema is consistent")
}

/// A grouped address value, stored as flat prefixed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// City line.
    pub city: String,
    /// Street line.
    pub street: String,
    /// Postal code.
    pub zipcode: String,
}

impl Address {
    /// Creates an address.
    pub fn new(city: impl Into<String>, street: impl Into<String>, zipcode: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            street: street.into(),
            zipcode: zipcode.into(),
        }
    }

    /// Returns the flat field values for this address.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("address_city", Value::text(self.city.clone())),
            ("address_street", Value::text(self.street.clone())),
            ("address_zipcode", Value::text(self.zipcode.clone())),
        ]
    }

    /// Reads the address group from an entity's fields.
    pub fn read(session: &Session, key: EntityKey) -> CoreResult<Self> {
        let text = |name: &str| -> CoreResult<String> {
            Ok(session
                .field(key, name)?
                .and_then(Value::as_text)
                .unwrap_or_default()
                .to_string())
        };
        Ok(Self {
            city: text("address_city")?,
            street: text("address_street")?,
            zipcode: text("address_zipcode")?,
        })
    }
}

/// Creates and schedules a member.
pub fn new_member(session: &mut Session, name: &str, address: &Address) -> CoreResult<EntityKey> {
    let member = session.create(MEMBER)?;
    session.set_field(member, "name", Value::text(name))?;
    for (field, value) in address.to_fields() {
        session.set_field(member, field, value)?;
    }
    session.persist(member)?;
    Ok(member)
}

/// Creates and schedules an order for a member.
pub fn new_order(session: &mut Session, member: EntityKey, status: &str) -> CoreResult<EntityKey> {
    let order = session.create(ORDER)?;
    session.set_one(order, "member", Some(member))?;
    session.set_field(order, "status", Value::text(status))?;
    session.persist(order)?;
    Ok(order)
}

/// Creates an order item and wires both relationship sides.
pub fn new_order_item(
    session: &mut Session,
    order: EntityKey,
    name: &str,
    price: i64,
    count: i64,
) -> CoreResult<EntityKey> {
    let item = session.create(ORDER_ITEM)?;
    session.set_field(item, "item_name", Value::text(name))?;
    session.set_field(item, "price", Value::Integer(price))?;
    session.set_field(item, "count", Value::Integer(count))?;
    session.set_one(item, "order", Some(order))?;
    session.add_to_many(order, "items", item)?;
    Ok(item)
}

/// Creates a delivery and attaches it to an order.
pub fn new_delivery(
    session: &mut Session,
    order: EntityKey,
    address: &Address,
) -> CoreResult<EntityKey> {
    let delivery = session.create(DELIVERY)?;
    for (field, value) in address.to_fields() {
        session.set_field(delivery, field, value)?;
    }
    session.set_field(delivery, "status", Value::text("READY"))?;
    session.set_one(order, "delivery", Some(delivery))?;
    Ok(delivery)
}
