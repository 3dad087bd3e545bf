//! Builder for [`Elector`].

use std::sync::Arc;

use crate::actions::Action;
use crate::backends::Backend;
use crate::elector::{Elector, ElectorError};

/// Fluent API for wiring the three lifecycle actions and a backend into an
/// [`Elector`]. All four components are required.
pub struct ElectorBuilder {
    on_become_leader: Option<Arc<dyn Action>>,
    on_lose_leader: Option<Arc<dyn Action>>,
    on_error: Option<Arc<dyn Action>>,
    backend: Option<Box<dyn Backend>>,
}

impl ElectorBuilder {
    pub fn new() -> Self {
        Self {
            on_become_leader: None,
            on_lose_leader: None,
            on_error: None,
            backend: None,
        }
    }

    /// Action invoked when this process is granted leadership.
    pub fn on_become_leader(mut self, action: impl Action + 'static) -> Self {
        self.on_become_leader = Some(Arc::new(action));
        self
    }

    /// Action invoked when this process stops being leader.
    pub fn on_lose_leader(mut self, action: impl Action + 'static) -> Self {
        self.on_lose_leader = Some(Arc::new(action));
        self
    }

    /// Action invoked after any action failure, before re-entering candidacy.
    pub fn on_error(mut self, action: impl Action + 'static) -> Self {
        self.on_error = Some(Arc::new(action));
        self
    }

    /// The election backend driving the state machine.
    pub fn backend(mut self, backend: impl Backend) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    /// Builds the [`Elector`].
    ///
    /// # Errors
    ///
    /// Returns [`ElectorError::MissingComponent`] when an action or the
    /// backend was not supplied.
    pub fn build(self) -> Result<Elector, ElectorError> {
        let on_become_leader = self
            .on_become_leader
            .ok_or(ElectorError::MissingComponent("on_become_leader action"))?;
        let on_lose_leader = self
            .on_lose_leader
            .ok_or(ElectorError::MissingComponent("on_lose_leader action"))?;
        let on_error = self
            .on_error
            .ok_or(ElectorError::MissingComponent("on_error action"))?;
        let backend = self
            .backend
            .ok_or(ElectorError::MissingComponent("election backend"))?;

        Ok(Elector::new(on_become_leader, on_lose_leader, on_error, backend))
    }
}

impl Default for ElectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
