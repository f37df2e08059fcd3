// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serializes operations that target the same instance.
//!
//! Each instance id maps to its own async mutex. The table itself is guarded
//! by a synchronous mutex that is never held across an await point, so
//! operations on different instances never wait on each other.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use compute_api_types::InstanceId;
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub(crate) struct InstanceLocks {
    table: Mutex<BTreeMap<InstanceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstanceLocks {
    /// Waits until no other operation holds `instance_id`, then returns a
    /// guard that holds it until dropped.
    pub(crate) async fn lock(
        &self,
        instance_id: &InstanceId,
    ) -> OwnedMutexGuard<()> {
        let entry = {
            let mut table = self.table.lock().unwrap();

            // An entry referenced only by the table has no holder and no
            // waiters, and every new locker has to come through here.
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
            table.entry(instance_id.clone()).or_default().clone()
        };

        entry.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}
