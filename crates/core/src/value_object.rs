//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. The bridge
/// forwards them untouched; only their shape changes at the engine boundary.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
