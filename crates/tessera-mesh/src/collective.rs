//! Named collectives: all-reduce, all-gather and barrier across localities.
//!
//! Star topology: every participant sends its encoded contribution to the
//! root locality, the root folds the contributions in rank order with the
//! caller's combinator once all of them (and its own) have arrived, and the
//! combined value is handed back to every participant. Collectives are keyed
//! by a string such as `"dot:reduce/x@0#2"`, so neither concurrent operators
//! on different values nor repeated calls on one value mix contributions.
//!
//! A participant that fails before reaching a collective sends an abort
//! instead of a value; everybody waiting on that key then fails with
//! [`MeshError::RemoteUnreachable`] rather than hanging.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use tessera_tensor::Numeric;

use crate::error::MeshError;
use crate::locality::{rpc_context, Locality};
use crate::protocol::{decode, encode, Contribution};

/// Reduction operation for element-wise collectives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
}

impl ReduceOp {
    /// Combine two scalars.
    pub fn apply<T: Numeric>(self, a: T, b: T) -> T {
        match self {
            Self::Sum => a + b,
            Self::Min => {
                if b < a {
                    b
                } else {
                    a
                }
            }
            Self::Max => {
                if b > a {
                    b
                } else {
                    a
                }
            }
        }
    }

    /// Combine two equal-length vectors element by element.
    pub fn apply_elementwise<T: Numeric>(self, mut a: Vec<T>, b: Vec<T>) -> Vec<T> {
        debug_assert_eq!(a.len(), b.len());
        for (x, y) in a.iter_mut().zip(b) {
            *x = self.apply(*x, y);
        }
        a
    }
}

/// Result handed to a waiting participant; the error is already rendered
/// because it may have to cross the wire.
pub(crate) type RoundResult = Result<Vec<u8>, String>;

/// Folds the encoded contributions (in rank order) into the encoded result.
pub(crate) type Combiner = Box<dyn FnOnce(Vec<Vec<u8>>) -> Result<Vec<u8>, MeshError> + Send>;

struct Round {
    participants: u32,
    contributions: BTreeMap<u32, Vec<u8>>,
    combine: Option<Combiner>,
    waiters: Vec<oneshot::Sender<RoundResult>>,
}

impl Round {
    fn new(participants: u32) -> Self {
        Self {
            participants,
            contributions: BTreeMap::new(),
            combine: None,
            waiters: Vec::new(),
        }
    }

    fn fail(self, reason: &str) {
        for w in self.waiters {
            let _ = w.send(Err(reason.to_string()));
        }
    }
}

/// A failed round, remembered until every participant has heard about it
/// or the tombstone outlives the collective timeout.
struct Failure {
    reason: String,
    remaining: u32,
    at: Instant,
}

impl Failure {
    fn new(reason: &str, remaining: u32) -> Self {
        Self {
            reason: reason.to_string(),
            remaining,
            at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct CollectiveState {
    open: HashMap<String, Round>,
    failed: HashMap<String, Failure>,
}

/// Root-side bookkeeping for in-flight collectives on one locality.
pub struct Collectives {
    state: Mutex<CollectiveState>,
    /// How long a failed round is remembered for participants that have
    /// not arrived yet.
    tombstone_ttl: Duration,
}

impl Collectives {
    pub fn new(tombstone_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CollectiveState::default()),
            tombstone_ttl,
        }
    }

    /// Lock the state, dropping tombstones nobody came back for.
    fn state(&self) -> MutexGuard<'_, CollectiveState> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let ttl = self.tombstone_ttl;
        state.failed.retain(|_, f| f.at.elapsed() <= ttl);
        state
    }

    /// Number of collectives currently waiting for participants.
    pub fn in_flight(&self) -> usize {
        self.state().open.len()
    }

    /// Register one participant's contribution. The root passes the
    /// combinator; everyone else passes `None`. The receiver resolves once
    /// the round completes or fails.
    pub(crate) fn join(
        &self,
        key: &str,
        rank: u32,
        participants: u32,
        contribution: Contribution,
        combine: Option<Combiner>,
    ) -> oneshot::Receiver<RoundResult> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state();

        let failed = match state.failed.get_mut(key) {
            Some(f) => {
                f.remaining = f.remaining.saturating_sub(1);
                Some((f.reason.clone(), f.remaining == 0))
            }
            None => None,
        };
        if let Some((reason, exhausted)) = failed {
            if exhausted {
                state.failed.remove(key);
            }
            drop(state);
            let _ = tx.send(Err(reason));
            return rx;
        }

        let round = state
            .open
            .entry(key.to_string())
            .or_insert_with(|| Round::new(participants));

        let problem = match &contribution {
            _ if round.participants != participants => Some(format!(
                "collective {key}: rank {rank} expects {participants} participants, others expect {}",
                round.participants
            )),
            _ if rank >= participants => Some(format!(
                "collective {key}: rank {rank} is out of range for {participants} participants"
            )),
            Contribution::Value(_) if round.contributions.contains_key(&rank) => {
                Some(format!("collective {key}: rank {rank} contributed twice"))
            }
            Contribution::Abort(reason) => {
                Some(format!("collective {key} aborted by rank {rank}: {reason}"))
            }
            Contribution::Value(_) => None,
        };

        if let Some(reason) = problem {
            let Some(round) = state.open.remove(key) else {
                return rx;
            };
            let arrived = round.contributions.len() as u32 + 1;
            let remaining = round.participants.saturating_sub(arrived);
            if remaining > 0 {
                state.failed.insert(key.to_string(), Failure::new(&reason, remaining));
            }
            drop(state);
            warn!("{reason}");
            round.fail(&reason);
            let _ = tx.send(Err(reason));
            return rx;
        }

        if let Contribution::Value(bytes) = contribution {
            round.contributions.insert(rank, bytes);
        }
        round.waiters.push(tx);
        if combine.is_some() {
            round.combine = combine;
        }

        let complete = round.combine.is_some()
            && round.contributions.len() as u32 == round.participants;
        if !complete {
            return rx;
        }
        let Some(round) = state.open.remove(key) else {
            return rx;
        };
        drop(state);

        let Round {
            contributions,
            combine,
            waiters,
            ..
        } = round;
        let result = match combine {
            Some(f) => f(contributions.into_values().collect()).map_err(|e| e.to_string()),
            None => Err(format!("collective {key} completed without a combinator")),
        };
        debug!("collective {key} complete");
        for w in waiters {
            let _ = w.send(result.clone());
        }
        rx
    }

    /// Fail an in-flight round (e.g. on timeout) for everybody waiting on it.
    pub(crate) fn expire(&self, key: &str, reason: &str) {
        let mut state = self.state();
        if let Some(round) = state.open.remove(key) {
            let remaining = round
                .participants
                .saturating_sub(round.contributions.len() as u32);
            if remaining > 0 {
                state.failed.insert(key.to_string(), Failure::new(reason, remaining));
            }
            drop(state);
            warn!("{reason}");
            round.fail(reason);
        }
    }

    /// Wait for a round registered through [`Self::join`], expiring it after
    /// `timeout`.
    pub(crate) async fn wait(
        &self,
        key: &str,
        rx: oneshot::Receiver<RoundResult>,
        timeout: Duration,
    ) -> RoundResult {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(format!("collective {key} was dropped")),
            Err(_) => {
                let reason = format!("collective {key} timed out after {timeout:?}");
                self.expire(key, &reason);
                Err(reason)
            }
        }
    }
}

fn root_for(locality: &Locality, participants: u32) -> Result<u32, MeshError> {
    let root = locality.config().root;
    if root >= participants {
        return Err(MeshError::InvalidSite {
            site: root,
            num_sites: participants,
        });
    }
    Ok(root)
}

fn check_rank(locality: &Locality, participants: u32) -> Result<(), MeshError> {
    if locality.id() >= participants || participants > locality.num_localities() {
        return Err(MeshError::InvalidSite {
            site: locality.id(),
            num_sites: participants,
        });
    }
    Ok(())
}

/// Combine `value` with the values of localities `0..participants` under
/// `key`. Every participant must call this with the same key and count.
pub async fn all_reduce_among<T, F>(
    locality: &Locality,
    key: &str,
    participants: u32,
    value: T,
    combine: F,
) -> Result<T, MeshError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(T, T) -> T + Send + 'static,
{
    check_rank(locality, participants)?;
    if participants == 1 {
        return Ok(value);
    }
    let root = root_for(locality, participants)?;
    let bytes = encode(&value)?;
    let timeout = locality.config().collective_timeout;

    let combined = if locality.id() == root {
        let combiner: Combiner = Box::new(move |parts: Vec<Vec<u8>>| {
            let mut parts = parts.into_iter();
            let first = parts
                .next()
                .ok_or_else(|| MeshError::Serde("empty collective".into()))?;
            let mut acc: T = decode(&first)?;
            for p in parts {
                acc = combine(acc, decode(&p)?);
            }
            encode(&acc)
        });
        let collectives = locality.collectives();
        let rx = collectives.join(key, root, participants, Contribution::Value(bytes), Some(combiner));
        collectives.wait(key, rx, timeout).await
    } else {
        let client = locality.peer(root).await?;
        client
            .contribute(
                rpc_context(timeout),
                key.to_string(),
                locality.id(),
                participants,
                Contribution::Value(bytes),
            )
            .await?
    };
    let bytes = combined.map_err(MeshError::RemoteUnreachable)?;
    decode(&bytes)
}

/// [`all_reduce_among`] over every locality of the mesh.
pub async fn all_reduce<T, F>(
    locality: &Locality,
    key: &str,
    value: T,
    combine: F,
) -> Result<T, MeshError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(T, T) -> T + Send + 'static,
{
    all_reduce_among(locality, key, locality.num_localities(), value, combine).await
}

/// Collect one value from each of localities `0..participants`, in rank
/// order.
pub async fn all_gather_among<T>(
    locality: &Locality,
    key: &str,
    participants: u32,
    value: T,
) -> Result<Vec<T>, MeshError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    check_rank(locality, participants)?;
    let mut slots: Vec<Option<T>> = (0..participants).map(|_| None).collect();
    slots[locality.id() as usize] = Some(value);
    let merged = all_reduce_among(locality, key, participants, slots, |a, b| {
        a.into_iter().zip(b).map(|(x, y)| x.or(y)).collect()
    })
    .await?;
    merged
        .into_iter()
        .enumerate()
        .map(|(rank, v)| {
            v.ok_or_else(|| {
                MeshError::RemoteUnreachable(format!("collective {key}: rank {rank} contributed nothing"))
            })
        })
        .collect()
}

/// Wait until localities `0..participants` have all reached `key`.
pub async fn barrier_among(
    locality: &Locality,
    key: &str,
    participants: u32,
) -> Result<(), MeshError> {
    all_reduce_among(locality, key, participants, (), |_, _| ()).await
}

/// [`barrier_among`] over every locality of the mesh.
pub async fn barrier(locality: &Locality, key: &str) -> Result<(), MeshError> {
    barrier_among(locality, key, locality.num_localities()).await
}

/// Tell the other participants of `key` that this locality will not
/// contribute, so they fail instead of waiting.
pub async fn abort_among(locality: &Locality, key: &str, participants: u32, reason: &str) {
    if participants <= 1 || locality.id() >= participants {
        return;
    }
    let Ok(root) = root_for(locality, participants) else {
        return;
    };
    let contribution = Contribution::Abort(reason.to_string());
    if locality.id() == root {
        let _ = locality
            .collectives()
            .join(key, root, participants, contribution, None);
        return;
    }
    match locality.peer(root).await {
        Ok(client) => {
            let timeout = locality.config().collective_timeout;
            if let Err(e) = client
                .contribute(rpc_context(timeout), key.to_string(), locality.id(), participants, contribution)
                .await
            {
                warn!("could not deliver abort for {key}: {e}");
            }
        }
        Err(e) => warn!("could not deliver abort for {key}: {e}"),
    }
}

/// Run the collective on success; on failure abort it so peers do not wait
/// for this locality, and return the local error.
pub async fn reduce_or_abort<T, F>(
    locality: &Locality,
    key: &str,
    participants: u32,
    local: Result<T, MeshError>,
    combine: F,
) -> Result<T, MeshError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(T, T) -> T + Send + 'static,
{
    match local {
        Ok(value) => all_reduce_among(locality, key, participants, value, combine).await,
        Err(e) => {
            abort_among(locality, key, participants, &e.to_string()).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;

    use super::*;
    use crate::config::MeshConfig;
    use crate::mesh::Mesh;

    #[test]
    fn reduce_ops() {
        assert_eq!(ReduceOp::Sum.apply(2i64, 3), 5);
        assert_eq!(ReduceOp::Min.apply(2.0, -1.0), -1.0);
        assert_eq!(ReduceOp::Max.apply(2i64, 7), 7);
        assert_eq!(
            ReduceOp::Sum.apply_elementwise(vec![1.0, 2.0, 3.0], vec![3.0, 4.0, 5.0]),
            vec![4.0, 6.0, 8.0]
        );
    }

    #[test]
    fn root_side_round_completes_in_rank_order() {
        let c = Collectives::new(Duration::from_secs(60));
        let r2 = c.join("k", 2, 3, Contribution::Value(encode(&30i64).unwrap()), None);
        let r1 = c.join("k", 1, 3, Contribution::Value(encode(&20i64).unwrap()), None);
        assert_eq!(c.in_flight(), 1);
        let combiner: Combiner = Box::new(|parts| {
            let vals: Vec<i64> = parts.iter().map(|p| decode(p).unwrap()).collect();
            assert_eq!(vals, vec![10, 20, 30]);
            encode(&vals.iter().sum::<i64>())
        });
        let r0 = c.join("k", 0, 3, Contribution::Value(encode(&10i64).unwrap()), Some(combiner));
        assert_eq!(c.in_flight(), 0);
        for mut rx in [r0, r1, r2] {
            let bytes = rx.try_recv().unwrap().unwrap();
            assert_eq!(decode::<i64>(&bytes).unwrap(), 60);
        }
    }

    #[test]
    fn abort_fails_waiters_and_latecomers() {
        let c = Collectives::new(Duration::from_secs(60));
        let mut r1 = c.join("k", 1, 3, Contribution::Value(encode(&1u8).unwrap()), None);
        let mut r2 = c.join("k", 2, 3, Contribution::Abort("bad axis".into()), None);
        assert!(r1.try_recv().unwrap().unwrap_err().contains("bad axis"));
        assert!(r2.try_recv().unwrap().is_err());

        // The root shows up late and still learns about the abort.
        let mut r0 = c.join("k", 0, 3, Contribution::Value(encode(&1u8).unwrap()), None);
        assert!(r0.try_recv().unwrap().unwrap_err().contains("aborted by rank 2"));

        // Everyone has heard; the key is free again.
        let mut again = c.join("k", 1, 2, Contribution::Value(encode(&1u8).unwrap()), None);
        assert!(again.try_recv().is_err()); // pending, not failed
    }

    #[test]
    fn tombstones_expire_without_latecomers() {
        let c = Collectives::new(Duration::from_millis(20));
        let _r1 = c.join("k", 1, 3, Contribution::Value(encode(&1u8).unwrap()), None);
        let _r2 = c.join("k", 2, 3, Contribution::Abort("bad axis".into()), None);
        std::thread::sleep(Duration::from_millis(40));

        // Rank 0 never heard of the old round; the key starts fresh.
        let mut r0 = c.join("k", 0, 3, Contribution::Value(encode(&1u8).unwrap()), None);
        assert!(r0.try_recv().is_err()); // pending, not failed
        assert_eq!(c.in_flight(), 1);
    }

    #[tokio::test]
    async fn all_reduce_across_three_localities() {
        let mesh = Mesh::local(3, MeshConfig::default()).await.unwrap();
        let results = mesh
            .run(|loc| async move {
                let mine = (loc.id() as i64 + 1) * 10;
                all_reduce(&loc, "sum", mine, |a, b| a + b).await
            })
            .await;
        for r in results {
            assert_eq!(r.unwrap(), 60);
        }
    }

    #[tokio::test]
    async fn all_gather_orders_by_rank() {
        let mesh = Mesh::local(3, MeshConfig::default()).await.unwrap();
        let results = mesh
            .run(|loc| async move { all_gather_among(&loc, "names", 3, format!("loc{}", loc.id())).await })
            .await;
        for r in results {
            assert_eq!(r.unwrap(), vec!["loc0", "loc1", "loc2"]);
        }
    }

    #[tokio::test]
    async fn missing_participant_times_out_for_everyone() {
        let cfg = MeshConfig::default().with_collective_timeout(Duration::from_millis(100));
        let mesh = Mesh::local(3, cfg).await.unwrap();
        // Locality 2 never arrives.
        let results = join_all(mesh.localities()[..2].iter().map(|loc| async move {
            barrier(loc, "never-complete").await
        }))
        .await;
        for r in results {
            assert!(matches!(r, Err(MeshError::RemoteUnreachable(_))));
        }
    }

    #[tokio::test]
    async fn local_failure_aborts_peers() {
        let mesh = Mesh::local(2, MeshConfig::default()).await.unwrap();
        let results = mesh
            .run(|loc| async move {
                let local = if loc.id() == 1 {
                    Err(MeshError::InvalidAxis { op: "test", axis: 5, rank: 1 })
                } else {
                    Ok(1i64)
                };
                reduce_or_abort(&loc, "fragile", 2, local, |a, b| a + b).await
            })
            .await;
        assert!(matches!(results[0], Err(MeshError::RemoteUnreachable(_))));
        assert!(matches!(results[1], Err(MeshError::InvalidAxis { .. })));
    }
}
