//! Deferred destruction of connections leaving their pool.

use std::sync::Arc;

use tracing::trace;

use crate::network::connection::PooledConnection;

/// Holds connections that were unlinked from their pool but must survive one
/// more manager-loop turn, so that a straggler transport callback never finds
/// its connection already released mid-dispatch. Entries are drained at the
/// top of each manager-loop iteration.
pub(crate) struct Trashcan {
    parked: Vec<Arc<PooledConnection>>,
}

impl Trashcan {
    pub(crate) fn new() -> Self {
        Self { parked: Vec::new() }
    }

    pub(crate) fn park(&mut self, connection: Arc<PooledConnection>) {
        trace!(
            "[{}] Parking connection {} for deferred release",
            connection.address(),
            connection.id(),
        );
        self.parked.push(connection);
    }

    pub(crate) fn drain(&mut self) {
        if self.parked.is_empty() {
            return;
        }
        trace!("Releasing {} recycled connections", self.parked.len());
        self.parked.clear();
    }
}
