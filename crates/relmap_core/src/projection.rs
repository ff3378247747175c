//! DTO projection boundary.
//!
//! Entities never cross the API boundary; request and response shapes are
//! separate types mapped by the pure functions in this module. A response
//! projection reads through a [`Projector`], which can materialize
//! relationships but cannot hand out entities or relationship state. A
//! request shape writes through an explicit field whitelist and can never
//! supply an id.

use crate::error::{CoreError, CoreResult};
use crate::session::Session;
use crate::types::{EntityId, EntityKey, EntityType};
use relmap_codec::Value;

/// A response DTO derived one-way from an entity.
///
/// Implementations name the fields they expose; anything not read here is
/// never serialized, so entity-shape changes cannot leak into responses.
pub trait ResponseProjection: Sized {
    /// Entity type this DTO projects.
    const ENTITY: EntityType;

    /// Builds the DTO from the entity behind `key`.
    fn project(projector: &mut Projector<'_>, key: EntityKey) -> CoreResult<Self>;
}

/// A request DTO applied to an entity through a field whitelist.
pub trait RequestShape {
    /// Entity type this request targets.
    const ENTITY: EntityType;

    /// Boundary validation, before any entity is touched.
    fn validate(&self) -> CoreResult<()> {
        Ok(())
    }

    /// The whitelisted field values this request carries.
    ///
    /// Only fields returned here are written; everything else on the
    /// entity is left untouched.
    fn fields(&self) -> Vec<(&'static str, Value)>;
}

/// Read access used while building a response DTO.
///
/// The projector exposes scalar fields, ids, and projected relationship
/// targets - never an entity, a relationship reference, or lazy state.
pub struct Projector<'a> {
    session: &'a mut Session,
}

impl Projector<'_> {
    /// Returns the entity's id.
    ///
    /// # Errors
    ///
    /// Fails for transient entities; project after flush.
    pub fn id(&self, key: EntityKey) -> CoreResult<EntityId> {
        self.session.entity(key)?.id().ok_or_else(|| {
            CoreError::invalid_operation("cannot project a transient entity's id")
        })
    }

    /// Returns a field value, `Null` when absent.
    pub fn field(&self, key: EntityKey, name: &str) -> CoreResult<Value> {
        Ok(self
            .session
            .field(key, name)?
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Returns a text field.
    ///
    /// # Errors
    ///
    /// Fails when the field is absent or not text.
    pub fn text(&self, key: EntityKey, name: &str) -> CoreResult<String> {
        match self.field(key, name)? {
            Value::Text(s) => Ok(s),
            other => Err(CoreError::invalid_operation(format!(
                "field `{name}` has kind {}, expected text",
                other.kind()
            ))),
        }
    }

    /// Resolves a to-one relationship, forcing materialization.
    pub fn to_one(&mut self, key: EntityKey, relation: &str) -> CoreResult<Option<EntityKey>> {
        self.session.to_one(key, relation)
    }

    /// Resolves a to-many relationship, forcing materialization.
    pub fn to_many(&mut self, key: EntityKey, relation: &str) -> CoreResult<Vec<EntityKey>> {
        self.session.to_many(key, relation)
    }

    /// Projects another entity into a nested DTO.
    pub fn project<D: ResponseProjection>(&mut self, key: EntityKey) -> CoreResult<D> {
        self.session.to_response(key)
    }

    /// Projects a collection relationship into an ordered DTO sequence.
    pub fn project_many<D: ResponseProjection>(
        &mut self,
        key: EntityKey,
        relation: &str,
    ) -> CoreResult<Vec<D>> {
        let targets = self.session.to_many(key, relation)?;
        targets
            .into_iter()
            .map(|target| self.session.to_response(target))
            .collect()
    }
}

impl Session {
    /// Maps an entity outward into a response DTO.
    pub fn to_response<D: ResponseProjection>(&mut self, key: EntityKey) -> CoreResult<D> {
        let etype = self.entity(key)?.entity_type();
        if etype != D::ENTITY {
            return Err(CoreError::invalid_operation(format!(
                "projection expects `{}`, got `{etype}`",
                D::ENTITY
            )));
        }
        D::project(&mut Projector { session: self }, key)
    }

    /// Creates a transient entity from a request DTO and schedules it for
    /// insertion.
    ///
    /// Ids are server-assigned: a request carrying an `id` field is
    /// rejected before any entity is created.
    pub fn from_request_create<R: RequestShape>(&mut self, request: &R) -> CoreResult<EntityKey> {
        request.validate()?;
        let fields = request.fields();
        reject_caller_id(&fields)?;
        let key = self.create(R::ENTITY)?;
        for (name, value) in fields {
            self.set_field(key, name, value)?;
        }
        self.persist(key)?;
        Ok(key)
    }

    /// Applies a request DTO's whitelisted fields to a managed entity.
    ///
    /// Fields not named by the request shape are left unchanged.
    pub fn apply_request<R: RequestShape>(&mut self, key: EntityKey, request: &R) -> CoreResult<()> {
        let etype = self.entity(key)?.entity_type();
        if etype != R::ENTITY {
            return Err(CoreError::invalid_operation(format!(
                "request expects `{}`, got `{etype}`",
                R::ENTITY
            )));
        }
        request.validate()?;
        let fields = request.fields();
        reject_caller_id(&fields)?;
        for (name, value) in fields {
            self.set_field(key, name, value)?;
        }
        Ok(())
    }
}

fn reject_caller_id(fields: &[(&'static str, Value)]) -> CoreResult<()> {
    if fields.iter().any(|(name, _)| *name == "id") {
        return Err(CoreError::invalid_request(
            "ids are server-assigned and cannot be supplied by a request",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaBuilder;
    use crate::session::Persistence;
    use relmap_storage::MemoryBackend;
    use std::sync::Arc;

    const MEMBER: EntityType = EntityType::new("member");

    struct MemberResponse {
        id: u64,
        name: String,
    }

    impl ResponseProjection for MemberResponse {
        const ENTITY: EntityType = MEMBER;

        fn project(p: &mut Projector<'_>, key: EntityKey) -> CoreResult<Self> {
            Ok(Self {
                id: p.id(key)?.raw(),
                name: p.text(key, "name")?,
            })
        }
    }

    struct CreateMember {
        name: String,
    }

    impl RequestShape for CreateMember {
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

    struct RogueCreate;

    impl RequestShape for RogueCreate {
        const ENTITY: EntityType = MEMBER;

        fn fields(&self) -> Vec<(&'static str, Value)> {
            vec![("id", Value::Id(99)), ("name", Value::text("Mallory"))]
        }
    }

    fn persistence() -> Persistence {
        let schema = SchemaBuilder::new().entity(MEMBER).build().unwrap();
        Persistence::new(schema, Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn create_project_roundtrip() {
        let persistence = persistence();
        let mut session = persistence.session();
        let key = session
            .from_request_create(&CreateMember { name: "Alice".into() })
            .unwrap();
        session.flush().unwrap();

        let response: MemberResponse = session.to_response(key).unwrap();
        assert_eq!(response.name, "Alice");
        assert!(response.id > 0);
    }

    #[test]
    fn caller_supplied_id_is_rejected() {
        let persistence = persistence();
        let mut session = persistence.session();
        let result = session.from_request_create(&RogueCreate);
        assert!(matches!(result, Err(CoreError::InvalidRequest { .. })));
    }

    #[test]
    fn blank_name_is_rejected_before_creation() {
        let persistence = persistence();
        let mut session = persistence.session();
        let result = session.from_request_create(&CreateMember { name: "  ".into() });
        assert!(matches!(result, Err(CoreError::InvalidRequest { .. })));
    }

    #[test]
    fn apply_request_touches_whitelisted_fields_only() {
        let persistence = persistence();
        let mut session = persistence.session();
        let key = session
            .from_request_create(&CreateMember { name: "Alice".into() })
            .unwrap();
        session.set_field(key, "address_city", Value::text("Seoul")).unwrap();
        session.flush().unwrap();

        session
            .apply_request(key, &CreateMember { name: "Alicia".into() })
            .unwrap();
        session.flush().unwrap();

        assert_eq!(
            session.field(key, "name").unwrap(),
            Some(&Value::text("Alicia"))
        );
        assert_eq!(
            session.field(key, "address_city").unwrap(),
            Some(&Value::text("Seoul"))
        );
    }

    #[test]
    fn projection_type_mismatch_fails() {
        let schema = SchemaBuilder::new()
            .entity(MEMBER)
            .entity(EntityType::new("order"))
            .build()
            .unwrap();
        let persistence = Persistence::new(schema, Arc::new(MemoryBackend::new()));
        let mut session = persistence.session();
        let key = session.create(EntityType::new("order")).unwrap();
        let result: CoreResult<MemberResponse> = session.to_response(key);
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn transient_entity_has_no_projectable_id() {
        let persistence = persistence();
        let mut session = persistence.session();
        let key = session
            .from_request_create(&CreateMember { name: "Alice".into() })
            .unwrap();
        let result: CoreResult<MemberResponse> = session.to_response(key);
        assert!(result.is_err());
    }
}
