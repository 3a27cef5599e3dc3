//! Caller identity and access predicates.
//!
//! Credentials are checked elsewhere. The engine only ever sees a resolved
//! [`Identity`] (or `None` for anonymous callers) and asks an
//! [`AccessPolicy`] whether it may read or write a [`Resource`].

use std::fmt;

use crate::model::{Container, Entity, Group};

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub is_admin: bool,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_admin: false,
        }
    }

    pub fn admin(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_admin: true,
        }
    }
}

/// Something an access decision is made about.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    /// An entity, with the group that owns it, if any.
    Entity {
        entity: &'a Entity,
        group: Option<&'a Group>,
    },
    /// A container, with its entity and the entity's group.
    Container {
        container: &'a Container,
        entity: &'a Entity,
        group: Option<&'a Group>,
    },
}

impl Resource<'_> {
    fn entity(&self) -> &Entity {
        match self {
            Resource::Entity { entity, .. } | Resource::Container { entity, .. } => entity,
        }
    }

    fn group(&self) -> Option<&Group> {
        match self {
            Resource::Entity { group, .. } | Resource::Container { group, .. } => *group,
        }
    }
}

/// Access predicates supplied by the authentication layer.
pub trait AccessPolicy: fmt::Debug + Send + Sync {
    fn can_read(&self, resource: &Resource<'_>, identity: Option<&Identity>) -> bool;
    fn can_write(&self, resource: &Resource<'_>, identity: Option<&Identity>) -> bool;
}

/// Admins may do anything. The entity's owner and the members of its group
/// may read and write. Anyone may read a public container.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerPolicy;

impl OwnerPolicy {
    fn is_member(resource: &Resource<'_>, identity: &Identity) -> bool {
        let entity = resource.entity();
        if entity.owner.as_deref() == Some(identity.username.as_str())
            || entity.name == identity.username
        {
            return true;
        }
        resource
            .group()
            .is_some_and(|group| group.members.iter().any(|m| m == &identity.username))
    }
}

impl AccessPolicy for OwnerPolicy {
    fn can_read(&self, resource: &Resource<'_>, identity: Option<&Identity>) -> bool {
        if let Resource::Container { container, .. } = resource {
            if !container.private {
                return true;
            }
        }
        self.can_write(resource, identity)
    }

    fn can_write(&self, resource: &Resource<'_>, identity: Option<&Identity>) -> bool {
        match identity {
            None => false,
            Some(identity) if identity.is_admin => true,
            Some(identity) => Self::is_member(resource, identity),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::{CollectionId, ContainerId, ContainerPath, EntityId, GroupId};

    fn entity(name: &str) -> Entity {
        Entity {
            id: EntityId::new(),
            name: name.into(),
            owner: Some(name.into()),
            group_id: None,
            used_quota: 0,
            created_at: Utc::now(),
        }
    }

    fn container(entity: &Entity, private: bool) -> Container {
        Container {
            id: ContainerId::new(),
            entity_id: entity.id,
            collection_id: CollectionId::new(),
            path: ContainerPath::parse("c", &entity.name).unwrap(),
            owner: entity.owner.clone(),
            private,
            used_quota: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn owner_and_admin_write() {
        let alice = entity("alice");
        let resource = Resource::Entity {
            entity: &alice,
            group: None,
        };
        let policy = OwnerPolicy;

        assert!(policy.can_write(&resource, Some(&Identity::new("alice"))));
        assert!(!policy.can_write(&resource, Some(&Identity::new("bob"))));
        assert!(policy.can_write(&resource, Some(&Identity::admin("root"))));
        assert!(!policy.can_write(&resource, None));
    }

    #[test]
    fn public_containers_are_readable() {
        let alice = entity("alice");
        let public = container(&alice, false);
        let private = container(&alice, true);
        let policy = OwnerPolicy;

        let resource = Resource::Container {
            container: &public,
            entity: &alice,
            group: None,
        };
        assert!(policy.can_read(&resource, None));

        let resource = Resource::Container {
            container: &private,
            entity: &alice,
            group: None,
        };
        assert!(!policy.can_read(&resource, None));
        assert!(!policy.can_read(&resource, Some(&Identity::new("bob"))));
        assert!(policy.can_read(&resource, Some(&Identity::new("alice"))));
    }

    #[test]
    fn group_members_write() {
        let mut lab = entity("lab");
        lab.owner = None;
        let group = Group {
            id: GroupId::new(),
            name: "lab".into(),
            members: vec!["bob".into()],
            quota: 0,
            used_quota: 0,
        };
        lab.group_id = Some(group.id);
        let resource = Resource::Entity {
            entity: &lab,
            group: Some(&group),
        };

        assert!(OwnerPolicy.can_write(&resource, Some(&Identity::new("bob"))));
        assert!(!OwnerPolicy.can_write(&resource, Some(&Identity::new("carol"))));
    }
}
