//! Read-model builders over published envelopes.

/// A projection builds a read model from an append-only event stream.
///
/// Projections are the CQRS read side: they transform committed events into
/// queryable state. Read models are disposable — events are the source of
/// truth and a projection can always be rebuilt by replaying them.
///
/// ## Idempotency
///
/// The bus delivers at-least-once, so `apply` must tolerate duplicates:
/// applying the same envelope twice must leave the read model unchanged
/// (natural upserts, or sequence-number checks inside the implementation).
///
/// Implementations use interior mutability: projections sit behind shared
/// handles (service facade + bus subscriber threads) and apply concurrently.
pub trait Projection<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    /// Apply a single published message to the read model.
    fn apply(&self, message: &M) -> Result<(), Self::Error>;
}
