//! Shared application state (ambient): bundles the manager handle, the
//! compiled router, and the policy engine behind `Arc`s so every request
//! handler gets a cheap clone, mirroring the gateway's own per-request
//! `DgwState` handle.

use std::sync::Arc;

use crate::manager::SessionManager;
use crate::policy::PolicyEngine;
use crate::router::Router;

#[derive(Clone)]
pub struct GatewayState {
    pub manager: SessionManager,
    pub router: Arc<Router>,
    pub policy: Arc<PolicyEngine>,
}

impl GatewayState {
    pub fn new(manager: SessionManager, router: Router, policy: Arc<PolicyEngine>) -> Self {
        Self {
            manager,
            router: Arc::new(router),
            policy,
        }
    }
}
