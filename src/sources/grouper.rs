//! Collapses sources that share a URL onto a single poller
//!
//! Within each URL group the member with the shortest refresh interval
//! becomes the primary; ties go to the earliest-created source and manual
//! sources sort after any timed one. Every other member is a secondary that
//! is never polled itself and instead receives the primary's response.

use crate::events::{Role, SourceId};
use crate::sources::Source;
use log::debug;
use std::collections::HashMap;

/// Sources sharing one URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub url: String,
    pub primary: SourceId,
    /// Remaining members in creation order
    pub secondaries: Vec<SourceId>,
}

/// Result of a regroup: one entry per distinct URL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grouping {
    groups: HashMap<String, Group>,
}

impl Grouping {
    pub fn group_for(&self, url: &str) -> Option<&Group> {
        self.groups.get(url)
    }

    /// Secondaries fed by `id`; empty unless `id` is a primary
    pub fn secondaries_of(&self, id: SourceId) -> &[SourceId] {
        self.groups
            .values()
            .find(|group| group.primary == id)
            .map(|group| group.secondaries.as_slice())
            .unwrap_or(&[])
    }

    /// Every source that is fed by another
    pub fn secondaries(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.groups
            .values()
            .flat_map(|group| group.secondaries.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Assigns primary and secondary roles across all sources
#[derive(Debug, Default, Clone, Copy)]
pub struct DeduplicationGrouper;

impl DeduplicationGrouper {
    pub fn new() -> Self {
        Self
    }

    /// Rebuild URL groups and set each source's role
    ///
    /// Sources marked removed are ignored. The result is fully determined by
    /// the sources' URLs, refresh intervals and ids, so running it twice
    /// yields the same grouping.
    pub fn regroup(&self, sources: &mut [Source]) -> Grouping {
        let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, source) in sources.iter().enumerate() {
            if !source.removed {
                buckets.entry(source.url.clone()).or_default().push(index);
            }
        }

        let mut groups = HashMap::with_capacity(buckets.len());
        for (url, mut members) in buckets {
            members.sort_by_key(|&index| {
                let source = &sources[index];
                (source.refresh.is_none(), source.refresh, source.id())
            });

            let primary = members[0];
            if members.len() == 1 {
                sources[primary].role = Role::Standalone;
            } else {
                sources[primary].role = Role::Primary;
                debug!(
                    "{}: Primary for {} ({} sources)",
                    sources[primary].name,
                    url,
                    members.len()
                );
            }

            let mut secondaries: Vec<SourceId> = members[1..]
                .iter()
                .map(|&index| {
                    sources[index].role = Role::Secondary;
                    sources[index].id()
                })
                .collect();
            secondaries.sort();

            groups.insert(
                url.clone(),
                Group {
                    url,
                    primary: sources[primary].id(),
                    secondaries,
                },
            );
        }

        Grouping { groups }
    }
}
