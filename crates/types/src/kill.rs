//! Cancellation orders.

use serde::{Deserialize, Serialize};

/// A cancellation order, fanned out to every worker. Workers holding a child
/// whose batch contains the transfer signal it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kill {
    pub transfer_id: String,
}
