use compact_str::CompactString;

/// A parsed realtime entity id.
///
/// Upstream ids look like `<prefix>-<trip-component>-<version>-<suffix>`,
/// e.g. `agency-T1-2-x`. Only the version segment takes part in ordering;
/// `logical_trip` is `prefix-component`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityId {
    pub logical_trip: CompactString,
    pub version: u64,
}

impl EntityId {
    /// Returns `None` for any id that does not follow the grammar. Callers
    /// treat those as ignorable rather than guessing.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(4, '-');
        let prefix = parts.next()?;
        let component = parts.next()?;
        let version = parts.next()?;
        // The suffix has to be present, even if empty.
        parts.next()?;

        if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let version = version.parse::<u64>().ok()?;

        let mut logical_trip = CompactString::from(prefix);
        logical_trip.push('-');
        logical_trip.push_str(component);

        Some(Self {
            logical_trip,
            version,
        })
    }
}
