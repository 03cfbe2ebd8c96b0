use crate::resources::{FlavorName, ResourceAmount, ResourceName};
use crate::Map;

/// Per-resource amounts.
pub type ResourceQuantities = Map<ResourceName, ResourceAmount>;

/// Amounts keyed by (flavor, resource). The container used for cluster-queue
/// usage vectors, cohort totals and per-workload admission contributions.
pub type FlavorResourceQuantities = Map<FlavorName, ResourceQuantities>;

/// Adds `amount` to `target[flavor][resource]`, creating entries as needed.
pub fn add_quantity(
    target: &mut FlavorResourceQuantities,
    flavor: &str,
    resource: &str,
    amount: ResourceAmount,
) {
    *target
        .entry(flavor.to_string())
        .or_default()
        .entry(resource.to_string())
        .or_default() += amount;
}

/// Subtracts `amount` from `target[flavor][resource]`.
///
/// Entries are kept at zero rather than removed so that a subtract followed by
/// the matching add restores the container to an identical state.
pub fn sub_quantity(
    target: &mut FlavorResourceQuantities,
    flavor: &str,
    resource: &str,
    amount: ResourceAmount,
) {
    if let Some(entry) = target
        .get_mut(flavor)
        .and_then(|resources| resources.get_mut(resource))
    {
        *entry = entry.saturating_sub(amount);
    } else {
        log::error!("subtracting {amount} of untracked ({flavor}, {resource})");
    }
}

/// Merges `delta` into `target`, adding entry by entry.
pub fn add_all(target: &mut FlavorResourceQuantities, delta: &FlavorResourceQuantities) {
    for (flavor, resources) in delta {
        for (resource, amount) in resources {
            add_quantity(target, flavor, resource, *amount);
        }
    }
}

/// Subtracts `delta` from `target`, entry by entry.
pub fn sub_all(target: &mut FlavorResourceQuantities, delta: &FlavorResourceQuantities) {
    for (flavor, resources) in delta {
        for (resource, amount) in resources {
            sub_quantity(target, flavor, resource, *amount);
        }
    }
}

/// Looks up `quantities[flavor][resource]`, defaulting to zero.
pub fn quantity_of(
    quantities: &FlavorResourceQuantities,
    flavor: &str,
    resource: &str,
) -> ResourceAmount {
    quantities
        .get(flavor)
        .and_then(|resources| resources.get(resource))
        .copied()
        .unwrap_or(ResourceAmount::ZERO)
}
