use fxhash::FxBuildHasher;

/// Hash map used throughout the crate.
///
/// Uses a fast non-cryptographic hasher; keys are internal identifiers, never
/// attacker-controlled data. Construct with `Map::default()`.
pub type Map<K, V> = hashbrown::HashMap<K, V, FxBuildHasher>;

/// Hash set counterpart of [`Map`].
pub type Set<T> = hashbrown::HashSet<T, FxBuildHasher>;
