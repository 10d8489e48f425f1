use pagewatch_core::TenantId;

/// Tenant a request acts for, taken from `x-tenant-id`.
///
/// This is immutable and must be present for all tenant routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTenant {
    tenant_id: TenantId,
}

impl RequestTenant {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn as_str(&self) -> &str {
        self.tenant_id.as_str()
    }
}

/// Acting principal, taken from `x-principal-id` when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal_id: String,
}

impl PrincipalContext {
    pub fn new(principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
        }
    }

    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }
}
