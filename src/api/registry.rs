use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::session::Session;

/// Opaque session handle: slot index in the low 32 bits, generation in
/// the high 32. The generation is bumped on destroy, so a handle kept
/// around after `destroy_handler` can never resolve to a recycled
/// slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    fn new(index: u32, generation: u32) -> Self {
        Self(u64::from(generation) << 32 | u64::from(index))
    }

    fn index(self) -> u32 {
        self.0 as u32
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index(), self.generation())
    }
}

struct Slot {
    generation: u32,
    session: Option<Arc<Session>>,
}

/// Arena of live sessions. The slot table is the only structure shared
/// between caller threads and session workers; it is locked only for
/// slot lookup, never across a callback or a network wait.
pub(crate) struct Registry {
    slots: Mutex<Vec<Slot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self) -> Result<(Handle, Arc<Session>)> {
        let session = Session::new();
        let mut slots = self.slots.lock().unwrap();

        if let Some(index) = slots.iter().position(|s| s.session.is_none()) {
            let slot = &mut slots[index];
            slot.session = Some(Arc::clone(&session));
            return Ok((Handle::new(index as u32, slot.generation), session));
        }

        if slots.len() > u32::MAX as usize {
            return Err(Error::InvalidState("handler table exhausted"));
        }
        let index = slots.len() as u32;
        slots.push(Slot {
            generation: 0,
            session: Some(Arc::clone(&session)),
        });
        Ok((Handle::new(index, 0), session))
    }

    pub fn get(&self, handle: Handle) -> Result<Arc<Session>> {
        let slots = self.slots.lock().unwrap();
        let slot = slots
            .get(handle.index() as usize)
            .ok_or(Error::InvalidHandle)?;
        if slot.generation != handle.generation() {
            return Err(Error::InvalidHandle);
        }
        slot.session.clone().ok_or(Error::InvalidHandle)
    }

    pub fn remove(&self, handle: Handle) -> Result<Arc<Session>> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .get_mut(handle.index() as usize)
            .ok_or(Error::InvalidHandle)?;
        if slot.generation != handle.generation() {
            return Err(Error::InvalidHandle);
        }
        let session = slot.session.take().ok_or(Error::InvalidHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(session)
    }
}
