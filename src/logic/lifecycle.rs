use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Result, SyncError};
use crate::events::EventSink;
use crate::logic::propagation::CancellationRegistry;
use crate::logic::validate::TypeValidator;
use crate::model::{
    CallContext, ChangeKind, ChangeNotification, Id, Instance, InstanceKind, InstanceStatus,
    NewInstance, NewRelationship, PropertyBag, PropertyChanges, TypeKind, TypeRegistry,
};
use crate::store::traits::Store;

/// Create, mutate and remove versioned instances. Every mutation is a
/// compare-and-swap against the caller's expected version.
pub struct InstanceService<S: Store> {
    store: Arc<S>,
    registry: Arc<TypeRegistry>,
    events: Arc<dyn EventSink>,
    cancellations: CancellationRegistry,
}

impl<S: Store> Clone for InstanceService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            cancellations: self.cancellations.clone(),
        }
    }
}

impl<S: Store> InstanceService<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<TypeRegistry>,
        events: Arc<dyn EventSink>,
        cancellations: CancellationRegistry,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            cancellations,
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn validator(&self) -> TypeValidator<'_> {
        TypeValidator::new(&self.registry)
    }

    pub async fn create(&self, ctx: &CallContext, request: NewInstance) -> Result<Instance> {
        let validator = self.validator();
        validator.resolve_type(&request.type_name, TypeKind::Entity)?;

        let mut properties = request.properties;
        validator.apply_defaults(&request.type_name, &mut properties);
        validator.validate_properties(&request.type_name, &properties)?;

        let status = request.initial_status.unwrap_or_default();
        validator.check_status(&request.type_name, status)?;

        let instance = self.first_version(ctx, InstanceKind::Entity, request.type_name, properties, status);
        self.store.insert_instance(instance.clone()).await?;
        log::debug!("Created {} {} by {}", instance.type_name, instance.guid, ctx.user_id);
        self.emit(&instance, ChangeKind::Created);
        Ok(instance)
    }

    pub async fn create_relationship(&self, ctx: &CallContext, request: NewRelationship) -> Result<Instance> {
        let validator = self.validator();
        let def = validator.resolve_type(&request.type_name, TypeKind::Relationship)?;

        for (end_guid, end_type) in [(&request.end1, &def.end1_type), (&request.end2, &def.end2_type)] {
            let end = self
                .store
                .get_instance(end_guid)
                .await?
                .ok_or_else(|| SyncError::not_found("relationship end", end_guid.clone()))?;
            if end.is_relationship() {
                return Err(SyncError::InvalidType {
                    type_name: request.type_name.clone(),
                    reason: format!("end {} is a relationship", end_guid),
                });
            }
            if let Some(required) = end_type {
                if !self.registry.is_subtype_of(&end.type_name, required) {
                    return Err(SyncError::InvalidType {
                        type_name: request.type_name.clone(),
                        reason: format!("end {} is a {}, expected {}", end_guid, end.type_name, required),
                    });
                }
            }
        }

        let mut properties = request.properties;
        validator.apply_defaults(&request.type_name, &mut properties);
        validator.validate_properties(&request.type_name, &properties)?;

        let kind = InstanceKind::Relationship {
            end1: request.end1,
            end2: request.end2,
        };
        let instance = self.first_version(ctx, kind, request.type_name, properties, InstanceStatus::Active);
        self.store.insert_instance(instance.clone()).await?;
        self.emit(&instance, ChangeKind::Created);
        Ok(instance)
    }

    /// Property-level merge of `changes` into the current bag
    pub async fn update(
        &self,
        ctx: &CallContext,
        guid: &Id,
        expected_version: u64,
        changes: &PropertyChanges,
    ) -> Result<Instance> {
        let current = self.load_live(guid, expected_version).await?;
        let mut next = current.next_version(&ctx.user_id);
        next.properties = changes.apply_to(&current.properties);
        self.validator().validate_properties(&next.type_name, &next.properties)?;
        self.commit(next, expected_version, ChangeKind::Updated).await
    }

    /// Replace the whole property bag
    pub async fn replace(
        &self,
        ctx: &CallContext,
        guid: &Id,
        expected_version: u64,
        properties: PropertyBag,
    ) -> Result<Instance> {
        let current = self.load_live(guid, expected_version).await?;
        let mut next = current.next_version(&ctx.user_id);
        next.properties = properties;
        self.validator().validate_properties(&next.type_name, &next.properties)?;
        self.commit(next, expected_version, ChangeKind::Updated).await
    }

    pub async fn update_status(
        &self,
        ctx: &CallContext,
        guid: &Id,
        expected_version: u64,
        status: InstanceStatus,
    ) -> Result<Instance> {
        if status.is_deleted() {
            return Err(SyncError::invalid_state(guid, "use soft delete to delete an instance"));
        }
        let current = self.load_live(guid, expected_version).await?;
        self.validator().check_status(&current.type_name, status)?;

        let mut next = current.next_version(&ctx.user_id);
        next.status = status;
        self.commit(next, expected_version, ChangeKind::StatusChanged).await
    }

    pub async fn soft_delete(&self, ctx: &CallContext, guid: &Id, expected_version: u64) -> Result<Instance> {
        let current = self.load_live(guid, expected_version).await?;
        let mut next = current.next_version(&ctx.user_id);
        next.status_on_delete = Some(current.status);
        next.status = InstanceStatus::Deleted;
        self.commit(next, expected_version, ChangeKind::SoftDeleted).await
    }

    pub async fn restore(&self, ctx: &CallContext, guid: &Id, expected_version: u64) -> Result<Instance> {
        let current = self.load_expected(guid, expected_version).await?;
        if !current.status.is_deleted() {
            return Err(SyncError::invalid_state(
                guid,
                format!("only deleted instances can be restored, status is {:?}", current.status),
            ));
        }
        let mut next = current.next_version(&ctx.user_id);
        next.status = current.status_on_delete.unwrap_or_default();
        next.status_on_delete = None;
        self.commit(next, expected_version, ChangeKind::Restored).await
    }

    /// Irreversibly remove the instance, its history and its correlations.
    /// Pending propagation for the guid is cancelled.
    pub async fn purge(&self, ctx: &CallContext, guid: &Id, expected_version: u64) -> Result<()> {
        let current = self.load_expected(guid, expected_version).await?;
        if !current.is_relationship() {
            let attached = self.store.list_relationships(guid, None).await?;
            if !attached.is_empty() {
                return Err(SyncError::invalid_state(
                    guid,
                    format!("{} relationship(s) must be purged first", attached.len()),
                ));
            }
        }

        let purged = self.store.purge_instance(guid, expected_version).await?;
        self.cancellations.cancel(guid);
        log::info!("Purged {} {} by {}", purged.type_name, guid, ctx.user_id);
        self.emit(&purged, ChangeKind::Purged);
        Ok(())
    }

    pub async fn get(&self, guid: &Id) -> Result<Instance> {
        self.store
            .get_instance(guid)
            .await?
            .ok_or_else(|| SyncError::not_found("instance", guid.clone()))
    }

    /// State last committed at or before `as_of`
    pub async fn get_as_of(&self, guid: &Id, as_of: DateTime<Utc>) -> Result<Instance> {
        self.store
            .get_instance_as_of(guid, as_of)
            .await?
            .ok_or_else(|| SyncError::not_found("instance", guid.clone()))
    }

    fn first_version(
        &self,
        ctx: &CallContext,
        kind: InstanceKind,
        type_name: String,
        properties: PropertyBag,
        status: InstanceStatus,
    ) -> Instance {
        let now = Utc::now();
        Instance {
            guid: crate::model::generate_id(),
            kind,
            type_name,
            properties,
            status,
            status_on_delete: None,
            version: 1,
            created_by: ctx.user_id.clone(),
            create_time: now,
            updated_by: ctx.user_id.clone(),
            update_time: now,
        }
    }

    async fn load_expected(&self, guid: &Id, expected_version: u64) -> Result<Instance> {
        let current = self.get(guid).await?;
        if current.version != expected_version {
            return Err(SyncError::VersionConflict {
                guid: guid.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }
        Ok(current)
    }

    /// Like `load_expected` but refuses soft-deleted instances
    async fn load_live(&self, guid: &Id, expected_version: u64) -> Result<Instance> {
        let current = self.load_expected(guid, expected_version).await?;
        if current.status.is_deleted() {
            return Err(SyncError::invalid_state(guid, "instance is deleted"));
        }
        Ok(current)
    }

    async fn commit(&self, next: Instance, expected_version: u64, kind: ChangeKind) -> Result<Instance> {
        self.store.commit_instance(next.clone(), expected_version).await?;
        self.emit(&next, kind);
        Ok(next)
    }

    fn emit(&self, instance: &Instance, change_kind: ChangeKind) {
        self.events.notify(ChangeNotification {
            guid: instance.guid.clone(),
            version: instance.version,
            change_kind,
            external_system_id: None,
        });
    }
}
