use crate::model::{Actor, Role};

use super::EngineError;

pub(super) fn require_login(actor: Option<&Actor>) -> Result<Actor, EngineError> {
    actor.copied().ok_or(EngineError::Unauthenticated)
}

pub(super) fn require_role(actor: Option<&Actor>, allowed: &[Role]) -> Result<Actor, EngineError> {
    let actor = require_login(actor)?;
    if allowed.contains(&actor.role) {
        Ok(actor)
    } else {
        Err(EngineError::forbidden_unless(actor.role, allowed))
    }
}
