use semver::Version;

/// A release that installations must pass through before crossing an
/// incompatible format change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary {
    /// Mandatory intermediate release.
    pub via: Version,
    /// First release that requires `via` to have run.
    pub guards: Version,
    /// Why the stop is required.
    pub reason: &'static str,
}

impl Boundary {
    /// Create a boundary entry.
    pub fn new(via: Version, guards: Version, reason: &'static str) -> Self {
        Self {
            via,
            guards,
            reason,
        }
    }
}

/// Ordered list of [`Boundary`] entries, ascending by `via`.
#[derive(Debug, Clone)]
pub struct BoundaryTable {
    boundaries: Vec<Boundary>,
}

impl BoundaryTable {
    /// Build a table; entries are sorted by `via`.
    pub fn new(mut boundaries: Vec<Boundary>) -> Self {
        boundaries.sort_by(|a, b| a.via.cmp(&b.via));
        Self {
            boundaries,
        }
    }

    /// The table shipped with promup.
    ///
    /// 3.x reads only TSDB/WAL data written by 2.55 or later and rejects
    /// several 2.x flags, so every 2.x install below 2.55.1 stops there first.
    pub fn builtin() -> Self {
        Self::new(vec![Boundary::new(
            Version::new(2, 55, 1),
            Version::new(3, 0, 0),
            "3.x requires data written by 2.55 or later",
        )])
    }

    /// All entries.
    pub fn entries(&self) -> &[Boundary] {
        &self.boundaries
    }

    /// Intermediate stops strictly between `current` and `target`, ascending.
    pub fn stops_between<'a>(
        &'a self,
        current: &'a Version,
        target: &'a Version,
    ) -> impl Iterator<Item = &'a Version> + 'a {
        self.boundaries
            .iter()
            .filter(move |b| *current < b.via && b.via < *target && *target >= b.guards)
            .map(|b| &b.via)
    }
}
