use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::prompting::MemoryContext;
use crate::provisioner::ModelProvisioner;

use super::{ResponseEngine, TextGenerator, TurnOutcome};

/// Cloneable handle that serializes turns from many threads onto one engine.
///
/// Generation holds the lock for the whole turn, so at most one generation
/// runs at a time and cache updates never interleave.
pub struct SharedResponder<G = ModelProvisioner> {
    inner: Arc<Mutex<ResponseEngine<G>>>,
}

impl<G> Clone for SharedResponder<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: TextGenerator> SharedResponder<G> {
    pub fn new(engine: ResponseEngine<G>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    // A panic inside a turn is already turned into a fallback reply, so a
    // poisoned lock still guards a consistent engine.
    fn lock(&self) -> MutexGuard<'_, ResponseEngine<G>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn generate_response(&self, user_input: &str, memory: Option<&MemoryContext>) -> String {
        self.lock().generate_response(user_input, memory)
    }

    pub fn respond(&self, user_input: &str, memory: Option<&MemoryContext>) -> TurnOutcome {
        self.lock().respond(user_input, memory)
    }

    pub fn update_persona(&self, persona: impl Into<String>) {
        self.lock().update_persona(persona);
    }

    pub fn persona(&self) -> String {
        self.lock().persona().to_string()
    }

    pub fn clear_cache(&self) {
        self.lock().clear_cache();
    }

    pub fn cache_len(&self) -> usize {
        self.lock().cache_len()
    }

    /// Runs `f` with exclusive access to the engine.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut ResponseEngine<G>) -> R) -> R {
        f(&mut self.lock())
    }
}
