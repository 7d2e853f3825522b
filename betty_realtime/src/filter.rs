//! Relevance of a [ChangeEvent] to the current viewer.
//!
//! Only customers are narrowed here. Staff roles receive every order event and
//! do their own status filtering downstream, so a strict filter never makes
//! them miss an order.

use crate::models::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    Allow,
    Deny,
}

impl Relevance {
    pub fn is_allowed(&self) -> bool { *self == Self::Allow }
}

/// Decision taken while the viewer's identity has not been resolved yet.
///
/// Events are let through and consumers filter for themselves, so nothing is
/// lost between mounting and the session becoming available.
pub const UNKNOWN_IDENTITY_POLICY: Relevance = Relevance::Allow;

pub fn relevance(event: &ChangeEvent, identity: Option<&Identity>) -> Relevance {
    let Some(identity) = identity else {
        return UNKNOWN_IDENTITY_POLICY;
    };
    if identity.role.is_staff() || event.snapshot().is_owned_by(&identity.id) {
        Relevance::Allow
    } else {
        Relevance::Deny
    }
}

pub fn is_relevant(event: &ChangeEvent, identity: Option<&Identity>) -> bool {
    relevance(event, identity).is_allowed()
}
