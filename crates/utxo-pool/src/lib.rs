//! Per-chain UTXO pool manager.
//!
//! Keeps a cached set of UTXOs covering the watched address set so withdrawal
//! paths get funding without a synchronous chain roundtrip. A refresh task
//! re-fetches the watched set on an interval and merges under the pool lock;
//! no lock is ever held across the gateway call.
//!
//! Every outpoint is in exactly one of {live, reserved, forgotten}.
//! [`UtxoPool::choose_utxos`] moves outpoints live -> reserved atomically and
//! nothing else can obtain them until an explicit [`UtxoPool::put_utxos`],
//! a confirmed spend ([`UtxoPool::consume`]), or reservation expiry.

use chain_gateway::{ChainGateway, GatewayError};
use common_types::{Amount, CoinType, OutpointId, Utxo};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("insufficient funds in the live pool")]
    InsufficientFunds,
    #[error("timed out waiting for pool funding")]
    ReservationTimeout,
}

/// A successful checkout: the selected UTXOs sum to at least the requested
/// amount and are exclusively held until release, spend, or expiry.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: u64,
    pub utxos: Vec<Utxo>,
}

struct Reserved {
    utxo: Utxo,
    reservation: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct PoolState {
    live: HashMap<OutpointId, Utxo>,
    reserved: HashMap<OutpointId, Reserved>,
    watched: BTreeSet<String>,
    /// Outpoints present in the most recent chain snapshot. Expired
    /// reservations only return to live while still on-chain.
    on_chain: HashSet<OutpointId>,
    next_reservation: u64,
}

pub struct UtxoPool {
    chain: CoinType,
    gateway: Arc<ChainGateway>,
    capacity: usize,
    reservation_ttl: Duration,
    state: Mutex<PoolState>,
    replenished: Notify,
}

impl UtxoPool {
    pub fn new(
        gateway: Arc<ChainGateway>,
        capacity: usize,
        reservation_ttl: Duration,
        watch_addrs: Vec<String>,
    ) -> Self {
        let chain = gateway.coin_type();
        UtxoPool {
            chain,
            gateway,
            capacity,
            reservation_ttl,
            state: Mutex::new(PoolState {
                watched: watch_addrs.into_iter().collect(),
                next_reservation: 1,
                ..PoolState::default()
            }),
            replenished: Notify::new(),
        }
    }

    pub fn chain(&self) -> CoinType {
        self.chain
    }

    /// Extend the watched set; effective at the next refresh tick.
    pub async fn watch_addresses(&self, addrs: &[String]) {
        let mut state = self.state.lock().await;
        state.watched.extend(addrs.iter().cloned());
    }

    /// Reserve UTXOs summing to at least `amount`, waiting up to `wait` for
    /// refresh to replenish the pool. Zero amount returns an empty selection
    /// immediately; zero wait fails immediately on a shortfall.
    pub async fn choose_utxos(
        &self,
        amount: Amount,
        wait: Duration,
    ) -> Result<Reservation, PoolError> {
        let deadline = Instant::now() + wait;
        loop {
            let mut notified = pin!(self.replenished.notified());
            {
                let mut state = self.state.lock().await;
                sweep_expired(&mut state, Instant::now());

                if amount == 0 {
                    let id = state.next_reservation;
                    state.next_reservation += 1;
                    return Ok(Reservation { id, utxos: Vec::new() });
                }
                if let Some(utxos) = select_greedy(&state.live, amount) {
                    let id = state.next_reservation;
                    state.next_reservation += 1;
                    let expires_at = Instant::now() + self.reservation_ttl;
                    for utxo in &utxos {
                        let outpoint = utxo.outpoint();
                        state.live.remove(&outpoint);
                        state.reserved.insert(
                            outpoint,
                            Reserved {
                                utxo: utxo.clone(),
                                reservation: id,
                                expires_at,
                            },
                        );
                    }
                    debug!(chain = %self.chain, reservation = id, count = utxos.len(), "reserved utxos");
                    return Ok(Reservation { id, utxos });
                }

                // Register for wakeups before the lock drops so a refresh
                // landing in between cannot be missed.
                notified.as_mut().enable();
            }

            if wait.is_zero() {
                return Err(PoolError::InsufficientFunds);
            }
            if Instant::now() >= deadline {
                return Err(PoolError::ReservationTimeout);
            }
            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep_until(deadline.into()) => {
                    return Err(PoolError::ReservationTimeout);
                }
            }
        }
    }

    /// Voluntarily return reserved UTXOs to the live set.
    pub async fn put_utxos(&self, utxos: &[Utxo]) {
        let mut state = self.state.lock().await;
        for utxo in utxos {
            let outpoint = utxo.outpoint();
            state.reserved.remove(&outpoint);
            state.live.insert(outpoint, utxo.clone());
        }
        drop(state);
        self.replenished.notify_waiters();
    }

    /// Forget UTXOs whose spend has been broadcast; the outpoints are gone
    /// from every set and will not be revived by expiry.
    pub async fn consume(&self, utxos: &[Utxo]) {
        let mut state = self.state.lock().await;
        for utxo in utxos {
            let outpoint = utxo.outpoint();
            state.reserved.remove(&outpoint);
            state.live.remove(&outpoint);
            state.on_chain.remove(&outpoint);
        }
    }

    /// One refresh cycle: fetch the watched set's UTXOs, then merge under the
    /// lock. Reserved entries are never touched by the merge; live entries
    /// that disappeared on-chain are dropped; new outpoints enter live,
    /// subject to the pool capacity.
    pub async fn refresh_once(&self) -> Result<(), GatewayError> {
        let addrs: Vec<String> = {
            let state = self.state.lock().await;
            state.watched.iter().cloned().collect()
        };
        let fetched = self.gateway.get_utxos(&addrs).await?;

        let mut state = self.state.lock().await;
        let seen: HashSet<OutpointId> = fetched.iter().map(Utxo::outpoint).collect();
        state.live.retain(|outpoint, _| seen.contains(outpoint));

        let mut grew = false;
        for utxo in fetched {
            let outpoint = utxo.outpoint();
            if state.live.contains_key(&outpoint) || state.reserved.contains_key(&outpoint) {
                continue;
            }
            if state.live.len() >= self.capacity {
                // Saturated: admit only by evicting an equal-or-smaller entry.
                let smallest = state
                    .live
                    .iter()
                    .min_by_key(|(_, u)| u.amount())
                    .map(|(k, u)| (k.clone(), u.amount()));
                match smallest {
                    Some((victim, value)) if value <= utxo.amount() => {
                        state.live.remove(&victim);
                    }
                    _ => continue,
                }
            }
            state.live.insert(outpoint, utxo);
            grew = true;
        }

        state.on_chain = seen;
        if sweep_expired(&mut state, Instant::now()) {
            grew = true;
        }
        drop(state);

        if grew {
            self.replenished.notify_waiters();
        }
        Ok(())
    }

    /// Long-lived refresh loop; gateway errors keep the stale pool.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        warn!(chain = %self.chain, error = %e, "utxo refresh failed; pool kept stale");
                    }
                }
                _ = shutdown.changed() => {
                    info!(chain = %self.chain, "utxo pool refresh stopped");
                    return;
                }
            }
        }
    }

    pub async fn live_count(&self) -> usize {
        self.state.lock().await.live.len()
    }

    pub async fn live_total(&self) -> Amount {
        self.state.lock().await.live.values().map(Utxo::amount).sum()
    }

    pub async fn reserved_count(&self) -> usize {
        self.state.lock().await.reserved.len()
    }

    /// Live and reserved outpoints, for invariant checks.
    pub async fn outpoint_sets(&self) -> (HashSet<OutpointId>, HashSet<OutpointId>) {
        let state = self.state.lock().await;
        (
            state.live.keys().cloned().collect(),
            state.reserved.keys().cloned().collect(),
        )
    }
}

/// Move expired reservations back to live while still on-chain, otherwise
/// forget them. Returns whether the live set grew.
fn sweep_expired(state: &mut PoolState, now: Instant) -> bool {
    let expired: Vec<OutpointId> = state
        .reserved
        .iter()
        .filter(|(_, r)| r.expires_at <= now)
        .map(|(k, _)| k.clone())
        .collect();

    let mut revived = false;
    for outpoint in expired {
        if let Some(entry) = state.reserved.remove(&outpoint) {
            if state.on_chain.contains(&outpoint) {
                debug!(outpoint = %outpoint, reservation = entry.reservation, "reservation expired; utxo back to live");
                state.live.insert(outpoint, entry.utxo);
                revived = true;
            } else {
                debug!(outpoint = %outpoint, reservation = entry.reservation, "reservation expired off-chain; forgotten");
            }
        }
    }
    revived
}

/// Greedy selection over the live set in decreasing value order.
fn select_greedy(live: &HashMap<OutpointId, Utxo>, amount: Amount) -> Option<Vec<Utxo>> {
    let mut candidates: Vec<&Utxo> = live.values().collect();
    candidates.sort_by(|a, b| {
        b.amount()
            .cmp(&a.amount())
            .then_with(|| a.outpoint().cmp(&b.outpoint()))
    });

    let mut picked = Vec::new();
    let mut total: Amount = 0;
    for utxo in candidates {
        if total >= amount {
            break;
        }
        picked.push(utxo.clone());
        total += utxo.amount();
    }
    (total >= amount).then_some(picked)
}
