// Active Part Set
//
// The set of parts that will be active once every queued action has run.
// Adding a part drops the parts it covers, so the set never holds two
// parts where one covers the other. Disabled ranges live alongside as
// explicit sentinels that block merges (and optionally fetches).

use serde::Serialize;
use std::collections::BTreeMap;

use super::{PartInfo, PartNameError};

/// What a disabled range forbids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum DisableScope {
    /// New merges and mutations may not be assigned inside the range.
    Merges,
    /// Additionally, no fetch may produce a part inside the range.
    MergesAndFetches,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisabledRange {
    pub range: PartInfo,
    pub scope: DisableScope,
}

#[derive(Debug, Clone, Default)]
pub struct ActivePartSet {
    parts: BTreeMap<PartInfo, String>,
    disabled: BTreeMap<PartInfo, DisableScope>,
}

impl ActivePartSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Result<Self, PartNameError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for name in names {
            set.add(name.as_ref())?;
        }
        Ok(set)
    }

    /// Add a part by name. Returns `false` if an existing part already covers it.
    pub fn add(&mut self, name: &str) -> Result<bool, PartNameError> {
        let info = PartInfo::from_part_name(name)?;
        Ok(self.add_info(info))
    }

    pub fn add_info(&mut self, info: PartInfo) -> bool {
        if self.containing_part(&info).is_some() {
            return false;
        }

        let covered: Vec<PartInfo> = self
            .partition_parts(&info.partition_id)
            .filter(|(existing, _)| info.contains(existing))
            .map(|(existing, _)| existing.clone())
            .collect();
        for existing in covered {
            self.parts.remove(&existing);
        }

        let name = info.part_name();
        self.parts.insert(info, name);
        true
    }

    /// Name of the part covering `info` (possibly `info` itself).
    pub fn containing_part(&self, info: &PartInfo) -> Option<&str> {
        self.partition_parts(&info.partition_id)
            .find(|(existing, _)| existing.contains(info))
            .map(|(_, name)| name.as_str())
    }

    pub fn contains(&self, info: &PartInfo) -> bool {
        self.parts.contains_key(info)
    }

    /// Parts of the same partition whose block range intersects `info`.
    pub fn intersecting<'a>(&'a self, info: &'a PartInfo) -> impl Iterator<Item = &'a str> + 'a {
        self.partition_parts(&info.partition_id)
            .filter(move |(existing, _)| existing.intersects(info))
            .map(|(_, name)| name.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parts.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Install a disabled-range sentinel. A wider scope replaces a narrower one.
    pub fn disable_range(&mut self, range: PartInfo, scope: DisableScope) {
        let entry = self.disabled.entry(range).or_insert(scope);
        if scope > *entry {
            *entry = scope;
        }
    }

    pub fn enable_range(&mut self, range: &PartInfo) -> bool {
        self.disabled.remove(range).is_some()
    }

    /// First disabled range intersecting `info` whose scope is at least `scope`.
    pub fn disabled_range_intersecting(
        &self,
        info: &PartInfo,
        scope: DisableScope,
    ) -> Option<DisabledRange> {
        self.disabled
            .iter()
            .find(|(range, active)| **active >= scope && range.intersects(info))
            .map(|(range, active)| DisabledRange {
                range: range.clone(),
                scope: *active,
            })
    }

    pub fn disabled_ranges(&self) -> Vec<DisabledRange> {
        self.disabled
            .iter()
            .map(|(range, scope)| DisabledRange {
                range: range.clone(),
                scope: *scope,
            })
            .collect()
    }

    fn partition_parts<'a>(
        &'a self,
        partition_id: &str,
    ) -> impl Iterator<Item = (&'a PartInfo, &'a String)> + 'a {
        let (lower, upper) = PartInfo::partition_bounds(partition_id);
        self.parts.range(lower..=upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> PartInfo {
        PartInfo::from_part_name(name).unwrap()
    }

    #[test]
    fn adding_covering_part_replaces_covered_ones() {
        let mut set = ActivePartSet::from_names(["p_1_1_0", "p_2_2_0", "p_3_3_0", "q_1_1_0"]).unwrap();
        assert_eq!(set.len(), 4);

        assert!(set.add("p_1_2_1").unwrap());
        let names: Vec<_> = set.names().collect();
        assert_eq!(names, vec!["p_1_2_1", "p_3_3_0", "q_1_1_0"]);

        // Already covered: no-op.
        assert!(!set.add("p_2_2_0").unwrap());
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn containing_part_lookup() {
        let set = ActivePartSet::from_names(["p_1_5_2", "p_6_6_0"]).unwrap();
        assert_eq!(set.containing_part(&info("p_2_3_1")), Some("p_1_5_2"));
        assert_eq!(set.containing_part(&info("p_6_6_0")), Some("p_6_6_0"));
        assert_eq!(set.containing_part(&info("p_7_7_0")), None);
        assert_eq!(set.containing_part(&info("q_2_3_1")), None);
    }

    #[test]
    fn intersecting_parts_stay_within_partition() {
        let set = ActivePartSet::from_names(["p_1_5_2", "p_6_6_0", "q_1_9_1"]).unwrap();
        let gap = PartInfo::new("p", 4, 7, 0);
        let hits: Vec<_> = set.intersecting(&gap).collect();
        assert_eq!(hits, vec!["p_1_5_2", "p_6_6_0"]);
    }

    #[test]
    fn disabled_ranges_respect_scope() {
        let mut set = ActivePartSet::new();
        set.disable_range(info("p_0_10_999999999"), DisableScope::Merges);

        let inside = info("p_3_4_1");
        assert!(set
            .disabled_range_intersecting(&inside, DisableScope::Merges)
            .is_some());
        assert!(set
            .disabled_range_intersecting(&inside, DisableScope::MergesAndFetches)
            .is_none());

        set.disable_range(info("p_0_10_999999999"), DisableScope::MergesAndFetches);
        assert!(set
            .disabled_range_intersecting(&inside, DisableScope::MergesAndFetches)
            .is_some());

        assert!(set.enable_range(&info("p_0_10_999999999")));
        assert!(set.disabled_ranges().is_empty());
    }
}
