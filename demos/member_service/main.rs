//! relmap demo - member and order services behind a DTO boundary.
//!
//! This example demonstrates the API-boundary discipline of relmap:
//! - every operation takes and returns DTOs, never entities
//! - ids are server-assigned; requests cannot carry them
//! - update requests name exactly the fields they change
//! - collection responses are wrapped in an envelope that can grow
//!
//! Run with: cargo run -p member_service

use relmap_codec::Value;
use relmap_core::{
    Cardinality, CascadeSet, CoreError, CoreResult, EntityId, EntityKey, EntityType, Fetch,
    Ownership, Persistence, Projector, RequestShape, ResponseProjection, Schema, SchemaBuilder,
    Session,
};
use relmap_storage::MemoryBackend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const MEMBER: EntityType = EntityType::new("member");
const ORDER: EntityType = EntityType::new("order");
const ORDER_ITEM: EntityType = EntityType::new("order_item");
const DELIVERY: EntityType = EntityType::new("delivery");

/// Builds the shop relationship graph.
fn shop_schema() -> CoreResult<Schema> {
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
}

// ---- API error mapping ----------------------------------------------------

/// What the routing layer sees.
///
/// `NotFound` maps to a "no such resource" response; everything else maps
/// to a generic failure that leaks neither entity field names nor storage
/// error text.
#[derive(Debug, PartialEq, Eq)]
enum ApiError {
    /// The requested resource does not exist.
    NotFound,
    /// The request failed validation.
    BadRequest(String),
    /// Anything else.
    Failure,
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { .. } => Self::NotFound,
            CoreError::InvalidRequest { message } => Self::BadRequest(message),
            _ => Self::Failure,
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---- DTOs -----------------------------------------------------------------

/// Address group carried by requests and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AddressDto {
    city: String,
    street: String,
    zipcode: String,
}

impl AddressDto {
    fn to_fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("address_city", Value::text(self.city.clone())),
            ("address_street", Value::text(self.street.clone())),
            ("address_zipcode", Value::text(self.zipcode.clone())),
        ]
    }

    fn read(p: &Projector<'_>, key: EntityKey) -> CoreResult<Self> {
        Ok(Self {
            city: p.text(key, "address_city")?,
            street: p.text(key, "address_street")?,
            zipcode: p.text(key, "address_zipcode")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CreateMemberRequest {
    name: String,
    address: AddressDto,
}

impl RequestShape for CreateMemberRequest {
    const ENTITY: EntityType = MEMBER;

    fn validate(&self) -> CoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::invalid_request("member name must not be blank"));
        }
        Ok(())
    }

    fn fields(&self) -> Vec<(&'static str, Value)> {
        let mut fields = vec![("name", Value::text(self.name.clone()))];
        fields.extend(self.address.to_fields());
        fields
    }
}

/// Carries only `name`: an update must not touch anything else.
#[derive(Debug, Deserialize)]
struct UpdateMemberRequest {
    name: String,
}

impl RequestShape for UpdateMemberRequest {
    const ENTITY: EntityType = MEMBER;

    fn validate(&self) -> CoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::invalid_request("member name must not be blank"));
        }
        Ok(())
    }

    fn fields(&self) -> Vec<(&'static str, Value)> {
        vec![("name", Value::text(self.name.clone()))]
    }
}

#[derive(Debug, Serialize)]
struct MemberResponse {
    id: u64,
    name: String,
    address: AddressDto,
}

impl ResponseProjection for MemberResponse {
    const ENTITY: EntityType = MEMBER;

    fn project(p: &mut Projector<'_>, key: EntityKey) -> CoreResult<Self> {
        Ok(Self {
            id: p.id(key)?.raw(),
            name: p.text(key, "name")?,
            address: AddressDto::read(p, key)?,
        })
    }
}

/// List item shape: intentionally name-only.
#[derive(Debug, Serialize)]
struct MemberSummary {
    name: String,
}

impl ResponseProjection for MemberSummary {
    const ENTITY: EntityType = MEMBER;

    fn project(p: &mut Projector<'_>, key: EntityKey) -> CoreResult<Self> {
        Ok(Self {
            name: p.text(key, "name")?,
        })
    }
}

/// Envelope for collection responses, so the shape can grow.
#[derive(Debug, Serialize)]
struct MemberListResponse {
    members: Vec<MemberSummary>,
    count: usize,
}

#[derive(Debug, Deserialize)]
struct OrderLineRequest {
    item_name: String,
    price: i64,
    count: i64,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderRequest {
    member_id: u64,
    items: Vec<OrderLineRequest>,
    delivery_address: AddressDto,
}

#[derive(Debug, Serialize)]
struct OrderItemResponse {
    item_name: String,
    price: i64,
    count: i64,
}

impl ResponseProjection for OrderItemResponse {
    const ENTITY: EntityType = ORDER_ITEM;

    fn project(p: &mut Projector<'_>, key: EntityKey) -> CoreResult<Self> {
        let integer = |p: &Projector<'_>, name: &str| -> CoreResult<i64> {
            Ok(p.field(key, name)?.as_integer().unwrap_or(0))
        };
        Ok(Self {
            item_name: p.text(key, "item_name")?,
            price: integer(p, "price")?,
            count: integer(p, "count")?,
        })
    }
}

#[derive(Debug, Serialize)]
struct OrderResponse {
    id: u64,
    status: String,
    items: Vec<OrderItemResponse>,
    delivery_address: Option<AddressDto>,
}

impl ResponseProjection for OrderResponse {
    const ENTITY: EntityType = ORDER;

    fn project(p: &mut Projector<'_>, key: EntityKey) -> CoreResult<Self> {
        let delivery_address = match p.to_one(key, "delivery")? {
            Some(delivery) => Some(AddressDto::read(p, delivery)?),
            None => None,
        };
        Ok(Self {
            id: p.id(key)?.raw(),
            status: p.text(key, "status")?,
            items: p.project_many(key, "items")?,
            delivery_address,
        })
    }
}

// ---- services -------------------------------------------------------------

/// Member use cases. One session per operation: open at request start,
/// closed at request end.
struct MemberService {
    persistence: Arc<Persistence>,
}

impl MemberService {
    fn new(persistence: Arc<Persistence>) -> Self {
        Self { persistence }
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> ApiResult<T>) -> ApiResult<T> {
        let mut session = self.persistence.session();
        let result = f(&mut session);
        session.close();
        result
    }

    fn create_member(&self, request: &CreateMemberRequest) -> ApiResult<MemberResponse> {
        self.with_session(|session| {
            let key = session.from_request_create(request)?;
            session.flush()?;
            info!(name = %request.name, "member created");
            Ok(session.to_response(key)?)
        })
    }

    fn update_member(&self, id: u64, request: &UpdateMemberRequest) -> ApiResult<MemberResponse> {
        self.with_session(|session| {
            let key = session.get(MEMBER, EntityId::new(id))?;
            session.apply_request(key, request)?;
            session.flush()?;
            Ok(session.to_response(key)?)
        })
    }

    fn get_member(&self, id: u64) -> ApiResult<MemberResponse> {
        self.with_session(|session| {
            let key = session.get(MEMBER, EntityId::new(id))?;
            Ok(session.to_response(key)?)
        })
    }

    fn list_members(&self) -> ApiResult<MemberListResponse> {
        self.with_session(|session| {
            let keys = session.list(MEMBER)?;
            let members = keys
                .into_iter()
                .map(|key| session.to_response(key))
                .collect::<CoreResult<Vec<MemberSummary>>>()?;
            let count = members.len();
            Ok(MemberListResponse { members, count })
        })
    }
}

/// Order use cases.
struct OrderService {
    persistence: Arc<Persistence>,
}

impl OrderService {
    fn new(persistence: Arc<Persistence>) -> Self {
        Self { persistence }
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> ApiResult<T>) -> ApiResult<T> {
        let mut session = self.persistence.session();
        let result = f(&mut session);
        session.close();
        result
    }

    /// Places an order: the order, its items, and its delivery are
    /// created in one unit of work and ride the Persist cascade.
    fn place_order(&self, request: &PlaceOrderRequest) -> ApiResult<OrderResponse> {
        if request.items.is_empty() {
            return Err(ApiError::BadRequest("an order needs at least one item".into()));
        }
        self.with_session(|session| {
            let member = session.get(MEMBER, EntityId::new(request.member_id))?;

            let order = session.create(ORDER)?;
            session.set_one(order, "member", Some(member))?;
            session.set_field(order, "status", Value::text("ORDERED"))?;

            for line in &request.items {
                let item = session.create(ORDER_ITEM)?;
                session.set_field(item, "item_name", Value::text(line.item_name.clone()))?;
                session.set_field(item, "price", Value::Integer(line.price))?;
                session.set_field(item, "count", Value::Integer(line.count))?;
                session.set_one(item, "order", Some(order))?;
                session.add_to_many(order, "items", item)?;
            }

            let delivery = session.create(DELIVERY)?;
            for (field, value) in request.delivery_address.to_fields() {
                session.set_field(delivery, field, value)?;
            }
            session.set_field(delivery, "status", Value::text("READY"))?;
            session.set_one(order, "delivery", Some(delivery))?;

            session.persist(order)?;
            session.flush()?;
            info!(member_id = request.member_id, "order placed");
            Ok(session.to_response(order)?)
        })
    }

    /// Cancels an order: a status update, not a removal.
    fn cancel_order(&self, id: u64) -> ApiResult<OrderResponse> {
        self.with_session(|session| {
            let key = session.get(ORDER, EntityId::new(id))?;
            session.set_field(key, "status", Value::text("CANCELLED"))?;
            session.flush()?;
            Ok(session.to_response(key)?)
        })
    }

    fn get_order(&self, id: u64) -> ApiResult<OrderResponse> {
        self.with_session(|session| {
            let key = session.get(ORDER, EntityId::new(id))?;
            Ok(session.to_response(key)?)
        })
    }
}

// ---- demo flow ------------------------------------------------------------

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let schema = shop_schema()?;
    let persistence = Arc::new(Persistence::new(schema, Arc::new(MemoryBackend::new())));
    let members = MemberService::new(Arc::clone(&persistence));
    let orders = OrderService::new(Arc::clone(&persistence));

    println!("Member Service Example");
    println!("======================\n");

    let created = members
        .create_member(&CreateMemberRequest {
            name: "Alice".into(),
            address: AddressDto {
                city: "Seoul".into(),
                street: "Teheran-ro 1".into(),
                zipcode: "06000".into(),
            },
        })
        .expect("create member");
    println!("[+] Created: {}", serde_json::to_string(&created)?);

    let updated = members
        .update_member(created.id, &UpdateMemberRequest { name: "Alicia".into() })
        .expect("update member");
    println!("[~] Renamed: {}", serde_json::to_string(&updated)?);

    let placed = orders
        .place_order(&PlaceOrderRequest {
            member_id: created.id,
            items: vec![
                OrderLineRequest {
                    item_name: "book".into(),
                    price: 12000,
                    count: 2,
                },
                OrderLineRequest {
                    item_name: "album".into(),
                    price: 8000,
                    count: 1,
                },
            ],
            delivery_address: AddressDto {
                city: "Seoul".into(),
                street: "Teheran-ro 1".into(),
                zipcode: "06000".into(),
            },
        })
        .expect("place order");
    println!("[+] Ordered: {}", serde_json::to_string(&placed)?);

    let cancelled = orders.cancel_order(placed.id).expect("cancel order");
    println!("[-] Cancelled: {}", serde_json::to_string(&cancelled)?);

    let listing = members.list_members().expect("list members");
    println!("[*] Members: {}", serde_json::to_string(&listing)?);

    match members.get_member(9999) {
        Err(ApiError::NotFound) => println!("[!] Member 9999: no such resource"),
        other => println!("[!] Unexpected: {other:?}"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services() -> (MemberService, OrderService) {
        let persistence = Arc::new(Persistence::new(
            shop_schema().unwrap(),
            Arc::new(MemoryBackend::new()),
        ));
        (
            MemberService::new(Arc::clone(&persistence)),
            OrderService::new(persistence),
        )
    }

    fn alice() -> CreateMemberRequest {
        CreateMemberRequest {
            name: "Alice".into(),
            address: AddressDto {
                city: "Seoul".into(),
                street: "Teheran-ro 1".into(),
                zipcode: "06000".into(),
            },
        }
    }

    #[test]
    fn create_member_returns_assigned_id() {
        let (members, _) = services();
        let response = members.create_member(&alice()).unwrap();
        assert!(response.id > 0);
        assert_eq!(response.name, "Alice");
    }

    #[test]
    fn update_changes_name_and_nothing_else() {
        let (members, _) = services();
        let created = members.create_member(&alice()).unwrap();
        let updated = members
            .update_member(created.id, &UpdateMemberRequest { name: "Alicia".into() })
            .unwrap();
        assert_eq!(updated.name, "Alicia");
        assert_eq!(updated.address, created.address);
    }

    #[test]
    fn blank_name_is_a_bad_request() {
        let (members, _) = services();
        let result = members.update_member(1, &UpdateMemberRequest { name: " ".into() });
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn missing_member_maps_to_not_found() {
        let (members, _) = services();
        assert_eq!(members.get_member(404).unwrap_err(), ApiError::NotFound);
    }

    #[test]
    fn place_and_cancel_order() {
        let (members, orders) = services();
        let member = members.create_member(&alice()).unwrap();
        let placed = orders
            .place_order(&PlaceOrderRequest {
                member_id: member.id,
                items: vec![OrderLineRequest {
                    item_name: "book".into(),
                    price: 12000,
                    count: 2,
                }],
                delivery_address: AddressDto {
                    city: "Seoul".into(),
                    street: "Teheran-ro 1".into(),
                    zipcode: "06000".into(),
                },
            })
            .unwrap();
        assert_eq!(placed.status, "ORDERED");
        assert_eq!(placed.items.len(), 1);
        assert!(placed.delivery_address.is_some());

        let cancelled = orders.cancel_order(placed.id).unwrap();
        assert_eq!(cancelled.status, "CANCELLED");
        // Cancelling is a field update: items and delivery survive.
        let fetched = orders.get_order(placed.id).unwrap();
        assert_eq!(fetched.items.len(), 1);
    }

    #[test]
    fn empty_order_is_a_bad_request() {
        let (members, orders) = services();
        let member = members.create_member(&alice()).unwrap();
        let result = orders.place_order(&PlaceOrderRequest {
            member_id: member.id,
            items: vec![],
            delivery_address: AddressDto {
                city: "Seoul".into(),
                street: "x".into(),
                zipcode: "1".into(),
            },
        });
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn summaries_never_leak_entity_only_fields() {
        let (members, _) = services();
        members.create_member(&alice()).unwrap();
        let listing = members.list_members().unwrap();
        let json = serde_json::to_string(&listing).unwrap();

        // The member entity carries address fields; the summary DTO does
        // not, so the serialized response must not contain them.
        assert!(json.contains("Alice"));
        assert!(!json.contains("address"));
        assert!(!json.contains("Seoul"));
        assert!(!json.contains("member_id"));
        assert_eq!(listing.count, listing.members.len());
    }

    #[test]
    fn requests_cannot_smuggle_ids() {
        struct Rogue;
        impl RequestShape for Rogue {
            const ENTITY: EntityType = MEMBER;
            fn fields(&self) -> Vec<(&'static str, Value)> {
                vec![("id", Value::Id(7)), ("name", Value::text("Mallory"))]
            }
        }
        let persistence = Arc::new(Persistence::new(
            shop_schema().unwrap(),
            Arc::new(MemoryBackend::new()),
        ));
        let mut session = persistence.session();
        let result = session.from_request_create(&Rogue);
        assert!(matches!(result, Err(CoreError::InvalidRequest { .. })));
    }
}
