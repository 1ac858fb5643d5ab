//! Connection-id slot registry.
//!
//! Fixed-size slots hold the opaque per-connection identifiers used by the
//! application-level handshake. Clients know their connection budget up front
//! and reserve exactly that many slots; servers cannot know how many
//! connections they will field and grow their slot storage in chunks. Slots
//! are lent out for the life of a connection and returned when it closes.
//!
//! Chunked slabs stand in for the original's reserve-then-commit contiguous
//! range; contiguity is not observable by the protocol.

use parking_lot::Mutex;
use protocol_traffic::CONNECTION_ID_LEN;

use crate::error::EngineError;

/// How many slots each server growth step commits.
const GROWTH_STEP: usize = 2_500;

/// An exclusive lease on one slot. Returned to the pool with
/// [`ConnectionIdPool::release`].
#[derive(Debug)]
pub struct IdSlot {
    chunk: usize,
    index: usize,
}

struct PoolState {
    chunks: Vec<Box<[u8]>>,
    free: Vec<(usize, usize)>,
}

impl PoolState {
    fn grow(&mut self, slots: usize) {
        let chunk_idx = self.chunks.len();
        self.chunks
            .push(vec![0u8; slots * CONNECTION_ID_LEN].into_boxed_slice());
        for index in (0..slots).rev() {
            self.free.push((chunk_idx, index));
        }
    }
}

pub struct ConnectionIdPool {
    state: Mutex<PoolState>,
    /// Servers grow on demand; clients are capped at their initial reserve.
    growable: bool,
}

impl ConnectionIdPool {
    /// A client pool holding exactly `connection_limit` slots.
    pub fn for_client(connection_limit: usize) -> Self {
        let mut state = PoolState { chunks: Vec::new(), free: Vec::new() };
        state.grow(connection_limit.max(1));
        Self { state: Mutex::new(state), growable: false }
    }

    /// A server pool seeded with one growth step.
    pub fn for_server() -> Self {
        let mut state = PoolState { chunks: Vec::new(), free: Vec::new() };
        state.grow(GROWTH_STEP);
        Self { state: Mutex::new(state), growable: true }
    }

    /// Lease a slot and stamp `connection_id` into it.
    pub fn acquire(
        &self,
        connection_id: &[u8; CONNECTION_ID_LEN],
    ) -> Result<IdSlot, EngineError> {
        let mut state = self.state.lock();
        if state.free.is_empty() {
            if !self.growable {
                // clients pre-allocate exactly the number necessary
                return Err(EngineError::IdSlotsExhausted);
            }
            state.grow(GROWTH_STEP);
        }
        let (chunk, index) = state.free.pop().expect("free list refilled above");
        let offset = index * CONNECTION_ID_LEN;
        state.chunks[chunk][offset..offset + CONNECTION_ID_LEN].copy_from_slice(connection_id);
        Ok(IdSlot { chunk, index })
    }

    /// Copy the identifier out of a leased slot.
    pub fn read(&self, slot: &IdSlot) -> [u8; CONNECTION_ID_LEN] {
        let state = self.state.lock();
        let offset = slot.index * CONNECTION_ID_LEN;
        let mut id = [0u8; CONNECTION_ID_LEN];
        id.copy_from_slice(&state.chunks[slot.chunk][offset..offset + CONNECTION_ID_LEN]);
        id
    }

    /// Overwrite a leased slot (the client stores the server-assigned id).
    pub fn write(&self, slot: &IdSlot, connection_id: &[u8; CONNECTION_ID_LEN]) {
        let mut state = self.state.lock();
        let offset = slot.index * CONNECTION_ID_LEN;
        state.chunks[slot.chunk][offset..offset + CONNECTION_ID_LEN]
            .copy_from_slice(connection_id);
    }

    /// Return a lease to the free list.
    pub fn release(&self, slot: IdSlot) {
        let mut state = self.state.lock();
        state.free.push((slot.chunk, slot.index));
    }

    /// Slots currently available without growing.
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }
}
