//! Service start policies.

/// Controller-level policy deciding whether a service demands its
/// dependencies and whether it needs external demand to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceMode {
    /// Starts as soon as dependencies allow; demands its dependencies from
    /// installation until removal.
    #[default]
    Active,
    /// Starts only when demanded, propagates the demand downward, and stays
    /// up once started until removed.
    Lazy,
    /// Starts only when demanded and stops again when the last demand goes
    /// away.
    OnDemand,
}

impl ServiceMode {
    /// Returns a short stable label.
    pub fn as_label(self) -> &'static str {
        match self {
            ServiceMode::Active => "active",
            ServiceMode::Lazy => "lazy",
            ServiceMode::OnDemand => "on_demand",
        }
    }
}
