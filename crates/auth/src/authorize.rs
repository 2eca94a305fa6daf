use thiserror::Error;

use scribe_core::{Job, TenantId, UserId};

use crate::{JwtClaims, Role};

/// A verified caller identity.
///
/// Fixed for the lifetime of a request or a live connection: the tenant is
/// taken from the credential, never from request parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub roles: Vec<Role>,
}

impl Identity {
    pub fn new(tenant_id: TenantId, user_id: UserId, roles: Vec<Role>) -> Self {
        Self {
            tenant_id,
            user_id,
            roles,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(Role::is_admin)
    }
}

impl From<JwtClaims> for Identity {
    fn from(claims: JwtClaims) -> Self {
        Self::new(claims.tenant_id, claims.sub, claims.roles)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("job belongs to another tenant")]
    TenantMismatch,

    #[error("not authorized to access this job")]
    NotOwner,
}

/// Authorize access to a job.
///
/// - The job must belong to the identity's tenant
/// - Within the tenant, admins see every job; other users only their own
///
/// No IO, no panics.
pub fn authorize_job_access(identity: &Identity, job: &Job) -> Result<(), AuthzError> {
    if job.tenant_id != identity.tenant_id {
        return Err(AuthzError::TenantMismatch);
    }
    if identity.is_admin() || job.is_owned_by(identity.user_id) {
        Ok(())
    } else {
        Err(AuthzError::NotOwner)
    }
}
