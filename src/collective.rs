use crate::tensor::{format_shape, FeatureBlock, Shape};
use crate::EmbedError;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::error;

/// What one rank brings to a gather.
///
/// Every participant must supply the same shape. A rank with nothing authoritative to
/// contribute sends a `Placeholder` carrying the shape its real data would have had.
#[derive(Debug, Clone, PartialEq)]
pub enum Contribution {
    Real(FeatureBlock),
    Placeholder { shape: Shape, reason: Option<String> },
}

impl Contribution {
    pub fn placeholder(shape: Shape, reason: impl Into<String>) -> Self {
        Contribution::Placeholder { shape, reason: Some(reason.into()) }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Contribution::Real(block) => block.shape(),
            Contribution::Placeholder { shape, .. } => shape,
        }
    }

}

/// Fixed-size per-rank report exchanged before any feature data moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RankStatus {
    Ready { tiles: usize },
    Failed { reason: String },
}

pub trait Collective: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_primary(&self) -> bool {
        self.rank() == 0
    }

    /// Block until every rank reaches the same call.
    fn barrier(&self) -> Result<(), EmbedError>;

    /// Collect one contribution per rank on the primary, ordered by rank.
    /// Non-primary ranks get `None`.
    fn gather_to_main(&self, contribution: Contribution) -> Result<Option<Vec<Contribution>>, EmbedError>;

    /// Every rank receives every rank's status, ordered by rank.
    fn all_gather(&self, status: RankStatus) -> Result<Vec<RankStatus>, EmbedError>;

    /// Release every rank blocked in (or later entering) a collective with an error.
    fn abort(&self, _reason: &str) {}
}

/// World of one: every collective is trivially satisfied.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), EmbedError> {
        Ok(())
    }

    fn gather_to_main(&self, contribution: Contribution) -> Result<Option<Vec<Contribution>>, EmbedError> {
        Ok(Some(vec![contribution]))
    }

    fn all_gather(&self, status: RankStatus) -> Result<Vec<RankStatus>, EmbedError> {
        Ok(vec![status])
    }
}

struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted: Option<String>,
}

struct GroupShared {
    world_size: usize,
    state: Mutex<BarrierState>,
    turnstile: Condvar,
    slots: Mutex<Vec<Option<Contribution>>>,
    statuses: Mutex<Vec<Option<RankStatus>>>,
}

impl GroupShared {
    fn lock_state(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Option<Contribution>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_statuses(&self) -> MutexGuard<'_, Vec<Option<RankStatus>>> {
        self.statuses.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn abort(&self, reason: String) {
        let mut state = self.lock_state();
        if state.aborted.is_none() {
            error!(reason = %reason, "aborting rank group");
            state.aborted = Some(reason);
        }
        self.turnstile.notify_all();
    }
}

/// In-process rank group: one handle per rank, each driven by its own thread.
pub struct LocalGroup;

impl LocalGroup {
    pub fn new(world_size: usize) -> Result<Vec<LocalRank>, EmbedError> {
        if world_size == 0 {
            return Err(EmbedError::Config("world size must be at least 1".to_string()));
        }
        let shared = Arc::new(GroupShared {
            world_size,
            state: Mutex::new(BarrierState { arrived: 0, generation: 0, aborted: None }),
            turnstile: Condvar::new(),
            slots: Mutex::new(vec![None; world_size]),
            statuses: Mutex::new(vec![None; world_size]),
        });
        Ok((0..world_size)
            .map(|rank| LocalRank { rank, shared: Arc::clone(&shared) })
            .collect())
    }
}

pub struct LocalRank {
    rank: usize,
    shared: Arc<GroupShared>,
}

impl Drop for LocalRank {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.abort("panicked");
        }
    }
}

impl Collective for LocalRank {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self) -> Result<(), EmbedError> {
        let mut state = self.shared.lock_state();
        if let Some(reason) = &state.aborted {
            return Err(EmbedError::Collective(format!("group aborted: {}", reason)));
        }
        state.arrived += 1;
        if state.arrived == self.shared.world_size {
            state.arrived = 0;
            state.generation += 1;
            self.shared.turnstile.notify_all();
            return Ok(());
        }

        let generation = state.generation;
        while state.generation == generation && state.aborted.is_none() {
            state = self
                .shared
                .turnstile
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if state.generation != generation {
            Ok(())
        } else {
            let reason = state.aborted.clone().unwrap_or_default();
            Err(EmbedError::Collective(format!("group aborted: {}", reason)))
        }
    }

    fn abort(&self, reason: &str) {
        self.shared.abort(format!("rank {}: {}", self.rank, reason));
    }

    fn gather_to_main(&self, contribution: Contribution) -> Result<Option<Vec<Contribution>>, EmbedError> {
        self.shared.lock_slots()[self.rank] = Some(contribution);
        self.barrier()?;

        let gathered = if self.is_primary() {
            let taken: Vec<Option<Contribution>> = self.shared.lock_slots().iter_mut().map(Option::take).collect();
            match validate_gather(taken) {
                Ok(all) => Some(all),
                Err(e) => {
                    self.abort(&e.to_string());
                    return Err(e);
                }
            }
        } else {
            None
        };

        // Slots are free again only after the primary has drained them.
        self.barrier()?;
        Ok(gathered)
    }

    fn all_gather(&self, status: RankStatus) -> Result<Vec<RankStatus>, EmbedError> {
        self.shared.lock_statuses()[self.rank] = Some(status);
        self.barrier()?;
        let all = self
            .shared
            .lock_statuses()
            .iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.clone()
                    .ok_or_else(|| EmbedError::Collective(format!("rank {} reached the exchange without a status", rank)))
            })
            .collect::<Result<Vec<_>, _>>();
        // Nobody overwrites a status until every rank has read them all.
        self.barrier()?;
        all
    }
}

fn validate_gather(taken: Vec<Option<Contribution>>) -> Result<Vec<Contribution>, EmbedError> {
    let mut all: Vec<Contribution> = Vec::with_capacity(taken.len());
    for (rank, slot) in taken.into_iter().enumerate() {
        let contribution =
            slot.ok_or_else(|| EmbedError::Collective(format!("rank {} reached the gather without data", rank)))?;
        if let Some(first) = all.first() {
            if first.shape() != contribution.shape() {
                return Err(EmbedError::Collective(format!(
                    "gather shape mismatch: rank 0 sent {}, rank {} sent {}",
                    format_shape(first.shape()),
                    rank,
                    format_shape(contribution.shape())
                )));
            }
        }
        all.push(contribution);
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{shape_of, Tensor};
    use std::thread;

    fn real(indices: &[u64], width: usize) -> Contribution {
        let features = Tensor::zeros(shape_of(&[indices.len(), width]));
        Contribution::Real(FeatureBlock::new(indices.to_vec(), features).unwrap())
    }

    #[test]
    fn test_single_process_gather_returns_own_contribution() {
        let c = real(&[0, 1], 3);
        let gathered = SingleProcess.gather_to_main(c.clone()).unwrap().unwrap();
        assert_eq!(gathered, vec![c]);
        assert!(SingleProcess.is_primary());
    }

    #[test]
    fn test_zero_world_size_rejected() {
        assert!(LocalGroup::new(0).is_err());
    }

    #[test]
    fn test_gather_orders_by_rank() {
        let ranks = LocalGroup::new(3).unwrap();
        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = ranks
                .iter()
                .map(|rank| {
                    s.spawn(move || {
                        let i = rank.rank() as u64;
                        rank.gather_to_main(real(&[i * 10, i * 10 + 1], 2)).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let on_primary = results[0].as_ref().unwrap();
        assert_eq!(on_primary.len(), 3);
        for (rank, c) in on_primary.iter().enumerate() {
            match c {
                Contribution::Real(block) => assert_eq!(block.indices[0], rank as u64 * 10),
                Contribution::Placeholder { .. } => panic!("expected real data"),
            }
        }
        assert!(results[1].is_none());
        assert!(results[2].is_none());
    }

    #[test]
    fn test_placeholder_with_matching_shape_is_accepted() {
        let ranks = LocalGroup::new(2).unwrap();
        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = ranks
                .iter()
                .map(|rank| {
                    s.spawn(move || {
                        let c = if rank.is_primary() {
                            real(&[0, 1], 4)
                        } else {
                            Contribution::placeholder(shape_of(&[2, 4]), "no data")
                        };
                        rank.gather_to_main(c)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let gathered = results[0].as_ref().unwrap().as_ref().unwrap();
        assert!(matches!(gathered[0], Contribution::Real(_)));
        assert!(matches!(gathered[1], Contribution::Placeholder { .. }));
        assert_eq!(gathered[0].shape(), gathered[1].shape());
    }

    #[test]
    fn test_shape_mismatch_is_rejected_on_every_rank() {
        let ranks = LocalGroup::new(2).unwrap();
        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = ranks
                .iter()
                .map(|rank| {
                    s.spawn(move || {
                        let width = 2 + rank.rank();
                        rank.gather_to_main(real(&[0], width))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for result in results {
            assert!(matches!(result, Err(EmbedError::Collective(_))));
        }
    }

    #[test]
    fn test_all_gather_reaches_every_rank() {
        let ranks = LocalGroup::new(3).unwrap();
        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = ranks
                .iter()
                .map(|rank| {
                    s.spawn(move || {
                        let mut seen = Vec::new();
                        for round in 0..3 {
                            let status = if rank.rank() == 1 && round == 1 {
                                RankStatus::Failed { reason: "unreadable".to_string() }
                            } else {
                                RankStatus::Ready { tiles: round * 10 + rank.rank() }
                            };
                            seen.push(rank.all_gather(status).unwrap());
                        }
                        seen
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for seen in &results {
            assert_eq!(seen, &results[0]);
        }
        let rounds = &results[0];
        assert_eq!(rounds[0], vec![
            RankStatus::Ready { tiles: 0 },
            RankStatus::Ready { tiles: 1 },
            RankStatus::Ready { tiles: 2 },
        ]);
        assert_eq!(rounds[1][1], RankStatus::Failed { reason: "unreadable".to_string() });
        assert_eq!(rounds[2][2], RankStatus::Ready { tiles: 22 });
    }

    #[test]
    fn test_abort_releases_waiting_rank() {
        let ranks = LocalGroup::new(2).unwrap();
        thread::scope(|s| {
            let waiter = s.spawn(|| ranks[1].barrier());
            ranks[0].abort("giving up");
            assert!(waiter.join().unwrap().is_err());
        });
        assert!(ranks[0].barrier().is_err());
    }

    #[test]
    fn test_barrier_is_reusable() {
        let ranks = LocalGroup::new(2).unwrap();
        thread::scope(|s| {
            for rank in &ranks {
                s.spawn(move || {
                    for _ in 0..50 {
                        rank.barrier().unwrap();
                    }
                });
            }
        });
    }
}
