//! Shard registry kept by the configuration service.
//!
//! Masters are stored in one vector sorted by id, with expired masters after
//! every active one. Key ownership follows the ring implied by that order: a
//! key belongs to the first master whose id is strictly greater than the
//! key's ring position, wrapping to the smallest id.
//!
//! [`Registry`] is plain data. The service wraps it in a reader/writer lock
//! and every method here restores the sort order before returning, so the
//! invariant holds whenever the lock is released.
//!
//! Time is passed in explicitly so expiry can be driven deterministically.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;

use crate::hashing::{random_shard_id, ring_position, ShardId};
use crate::protocol::Operation;

/// Reasons a registration or discovery is refused. The text is sent to the
/// peer verbatim.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("reached max shard capacity")]
    Full,
    #[error("no master shards registered")]
    NoMasters,
    #[error("all masters at follower capacity")]
    FollowersFull,
}

/// Size bounds of a registry, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    /// Most masters registered at once, expired ones included until swept.
    pub max_masters: usize,
    /// Follower slots per master.
    pub max_followers: usize,
}

/// A follower occupying one slot of its master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerShard {
    /// Address the follower listens on.
    pub addr: SocketAddr,
    /// Moment the follower expires unless a heartbeat arrives first.
    pub expiration: Instant,
}

/// A registered master and its followers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterShard {
    /// Ring position; the master owns keys hashing below it.
    pub id: ShardId,
    /// Address the master listens on.
    pub addr: SocketAddr,
    /// Moment the master expires unless a heartbeat arrives first.
    pub expiration: Instant,
    /// Set by a sweep; expired masters are compacted out before it returns.
    pub expired: bool,
    /// Fixed slots; a follower keeps its slot index for life.
    pub followers: Vec<Option<FollowerShard>>,
}

impl MasterShard {
    pub fn follower_count(&self) -> usize {
        self.followers.iter().flatten().count()
    }

    pub fn live_followers(&self) -> impl Iterator<Item = &FollowerShard> {
        self.followers.iter().flatten()
    }
}

/// Where a newly registered follower was attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerAssignment {
    pub master_id: ShardId,
    pub slot: u32,
    pub master_addr: SocketAddr,
}

/// A failed master replaced in place by one of its followers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub master_id: ShardId,
    pub promoted: SocketAddr,
    pub redirected: Vec<SocketAddr>,
}

/// What one sweep changed, for logging and announcements.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub expired_masters: Vec<MasterShard>,
    pub expired_followers: Vec<SocketAddr>,
    pub promotions: Vec<Promotion>,
}

/// Masters sorted on the ring plus the follower round counter.
#[derive(Debug)]
pub struct Registry {
    masters: Vec<MasterShard>,
    /// Round counter for spreading followers evenly across masters.
    follower_round: usize,
    limits: RegistryLimits,
    window: Duration,
}

impl Registry {
    pub fn new(limits: RegistryLimits, window: Duration) -> Self {
        Self {
            masters: Vec::new(),
            follower_round: 0,
            limits,
            window,
        }
    }

    pub fn masters(&self) -> &[MasterShard] {
        &self.masters
    }

    /// Number of masters that have not expired.
    pub fn active_len(&self) -> usize {
        self.masters.partition_point(|m| !m.expired)
    }

    pub fn register_master<R: Rng + ?Sized>(
        &mut self,
        addr: SocketAddr,
        now: Instant,
        rng: &mut R,
    ) -> Result<ShardId, RegistryError> {
        if self.masters.len() >= self.limits.max_masters {
            return Err(RegistryError::Full);
        }

        let id = loop {
            let candidate = random_shard_id(rng);
            if self.find(candidate).is_none() {
                break candidate;
            }
        };

        let pos = self.masters[..self.active_len()].partition_point(|m| m.id < id);
        self.masters.insert(
            pos,
            MasterShard {
                id,
                addr,
                expiration: now + self.window,
                expired: false,
                followers: vec![None; self.limits.max_followers],
            },
        );
        self.follower_round = 0;
        Ok(id)
    }

    /// Attaches a follower to the first master, in id order, whose follower
    /// count has not run ahead of the current round.
    pub fn register_follower(
        &mut self,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<FollowerAssignment, RegistryError> {
        let active = self.active_len();
        if active == 0 {
            return Err(RegistryError::NoMasters);
        }
        let max = self.limits.max_followers;
        if max == 0 {
            return Err(RegistryError::FollowersFull);
        }

        loop {
            let round = self.follower_round;
            let candidate = self.masters[..active].iter().position(|m| {
                let count = m.follower_count();
                count <= round && count < max
            });

            if let Some(idx) = candidate {
                let master = &mut self.masters[idx];
                let slot = master
                    .followers
                    .iter()
                    .position(Option::is_none)
                    .ok_or(RegistryError::FollowersFull)?;
                master.followers[slot] = Some(FollowerShard {
                    addr,
                    expiration: now + self.window,
                });
                return Ok(FollowerAssignment {
                    master_id: master.id,
                    slot: slot as u32,
                    master_addr: master.addr,
                });
            }

            if round + 1 >= max {
                return Err(RegistryError::FollowersFull);
            }
            self.follower_round += 1;
        }
    }

    /// The active master owning `key` on the ring.
    pub fn owner_of(&self, key: &str) -> Option<&MasterShard> {
        let active = &self.masters[..self.active_len()];
        if active.is_empty() {
            return None;
        }
        let position = ring_position(key);
        let idx = active.partition_point(|m| m.id <= position);
        Some(&active[if idx == active.len() { 0 } else { idx }])
    }

    /// Picks the shard a client should contact for `op` on `key`.
    ///
    /// Puts always go to the owning master. Gets pick uniformly among the
    /// owner and its live followers.
    pub fn discover<R: Rng + ?Sized>(
        &self,
        op: Operation,
        key: &str,
        rng: &mut R,
    ) -> Result<SocketAddr, RegistryError> {
        let master = self.owner_of(key).ok_or(RegistryError::NoMasters)?;
        match op {
            Operation::Put => Ok(master.addr),
            Operation::Get => {
                let followers: Vec<SocketAddr> = master.live_followers().map(|f| f.addr).collect();
                let pick = rng.gen_range(0..=followers.len());
                Ok(followers.get(pick).copied().unwrap_or(master.addr))
            }
        }
    }

    /// Extends a master's lease. Unknown ids are ignored.
    pub fn heartbeat_master(&mut self, id: ShardId, now: Instant) -> bool {
        match self.find(id) {
            Some(idx) => {
                self.masters[idx].expiration = now + self.window;
                true
            }
            None => false,
        }
    }

    /// Extends a follower's lease. Unknown masters or empty slots are ignored.
    pub fn heartbeat_follower(&mut self, master_id: ShardId, slot: u32, now: Instant) -> bool {
        let window = self.window;
        let Some(idx) = self.find(master_id) else {
            return false;
        };
        match self.masters[idx].followers.get_mut(slot as usize) {
            Some(Some(follower)) => {
                follower.expiration = now + window;
                true
            }
            _ => false,
        }
    }

    /// Expires every shard whose lease ended at or before `now`.
    ///
    /// Lapsed followers are freed. Lapsed masters are marked expired, sorted
    /// behind the active ones and removed. With `promote` set, a lapsed
    /// master that still has a live follower is instead replaced in place by
    /// that follower, keeping its id so key ownership does not move.
    pub fn sweep(&mut self, now: Instant, promote: bool) -> SweepReport {
        let mut report = SweepReport::default();
        let window = self.window;

        for master in &mut self.masters {
            for slot in &mut master.followers {
                if slot.as_ref().is_some_and(|f| f.expiration <= now) {
                    if let Some(follower) = slot.take() {
                        report.expired_followers.push(follower.addr);
                    }
                }
            }

            if master.expired || master.expiration > now {
                continue;
            }
            master.expired = true;

            if !promote {
                continue;
            }
            let Some(slot) = master.followers.iter().position(Option::is_some) else {
                continue;
            };
            let Some(successor) = master.followers[slot].take() else {
                continue;
            };
            report.promotions.push(Promotion {
                master_id: master.id,
                promoted: successor.addr,
                redirected: master.live_followers().map(|f| f.addr).collect(),
            });
            master.addr = successor.addr;
            master.expiration = now + window;
            master.expired = false;
        }

        self.masters.sort_by_key(|m| (m.expired, m.id));
        let active = self.active_len();
        report.expired_masters = self.masters.split_off(active);
        report
    }

    fn find(&self, id: ShardId) -> Option<usize> {
        self.masters[..self.active_len()]
            .binary_search_by_key(&id, |m| m.id)
            .ok()
    }

    #[cfg(test)]
    pub(crate) fn assert_sorted(&self) {
        let active = self.active_len();
        assert!(
            self.masters[active..].iter().all(|m| m.expired),
            "expired masters must trail active ones"
        );
        assert!(
            self.masters[..active].windows(2).all(|w| w[0].id < w[1].id),
            "active masters must be sorted by id"
        );
    }
}
