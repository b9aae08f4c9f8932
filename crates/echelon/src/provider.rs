//! Scheduling policy injection.

/// Errors surfaced by an [`InfoProvider`]. Transient by nature; the
/// scheduler retries on its next tick.
pub type ProviderError = Box<dyn std::error::Error + Send + Sync>;

/// Policy oracle consulted during the echelon descent.
///
/// `weight` and `slots_available` are pure with respect to the tree;
/// `consume_slot` mutates the accounting and must be invoked exactly once
/// per successfully dequeued item, by the component that owns both the
/// echelon and the scoreboard.
pub trait InfoProvider: Send + Sync {
    /// Relative weight of the branch addressed by `route` within its
    /// parent. Missing policy means 1.0.
    fn weight(&self, route: &[String]) -> f32;

    /// Whether the branch addressed by the partial `route` may receive one
    /// more running batch.
    fn slots_available(&self, route: &[String]) -> Result<bool, ProviderError>;

    /// Account one running batch against the full `route`.
    fn consume_slot(&self, route: &[String]) -> Result<(), ProviderError>;
}
