pub mod amount;
pub mod quantities;

pub use amount::{InvalidQuantity, ResourceAmount};
pub use quantities::{FlavorResourceQuantities, ResourceQuantities};

/// Name of a requestable resource, e.g. "cpu" or "memory".
pub type ResourceName = String;

/// Name of a resource flavor, e.g. "on-demand" or "spot".
pub type FlavorName = String;
