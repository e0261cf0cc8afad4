//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Jobs, generation records and notifications are entities: their fields change
/// over time (status transitions, result fields) while the identifier stays put.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
