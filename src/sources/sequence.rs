use crate::config::SettingsStore;
use crate::error::StoreError;
use crate::sources::Source;
use log::debug;

/// Keeps display positions dense and persists the resulting order
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceManager;

impl SequenceManager {
    pub fn new() -> Self {
        Self
    }

    /// Drop removed sources and resolve declared positions into `0..N-1`
    ///
    /// Removed sources are dropped first and every later source's declared
    /// position shifts down by the number removed before it. Then, until no
    /// source sits away from its declared position, the first misplaced
    /// source is moved to that position (clamped to the end) and all
    /// positions are renumbered from list order.
    pub fn normalize(&self, sources: &mut Vec<Source>) {
        let mut dropped = 0;
        sources.retain_mut(|source| {
            if source.removed {
                debug!("{}: Dropped", source.name);
                dropped += 1;
                return false;
            }
            source.sequence = source.sequence.saturating_sub(dropped);
            true
        });

        let len = sources.len();
        for _ in 0..=len {
            let Some(index) = sources
                .iter()
                .enumerate()
                .position(|(index, source)| source.sequence != index)
            else {
                return;
            };

            let target = sources[index].sequence.min(len.saturating_sub(1));
            if target != index {
                let moved = sources.remove(index);
                debug!("{}: Moved to position {}", moved.name, target);
                sources.insert(target, moved);
            }
            renumber(sources);
        }
    }

    /// Normalise positions and write the sources back to the settings store
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the settings document cannot be written. The
    /// in-memory order is normalised regardless.
    pub fn reorder(&self, sources: &mut Vec<Source>, store: &SettingsStore) -> Result<(), StoreError> {
        self.normalize(sources);
        let records = sources.iter().map(Source::to_record).collect();
        store.update(|document| document.apis = records)
    }
}

fn renumber(sources: &mut [Source]) {
    for (index, source) in sources.iter_mut().enumerate() {
        source.sequence = index;
    }
}
