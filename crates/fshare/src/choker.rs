//! Choke algorithm, decides which peers may download from us.
//!
//! Every `UnchokingInterval` the `k` preferred neighbors are recomputed from
//! the download rates, or picked at random among the interested peers while
//! no rate is known. Every `OptimisticUnchokingInterval` one more interested
//! peer, outside of the preferred ones, is unchoked at random.
use std::{collections::BTreeMap, sync::Arc};

use hashbrown::HashSet;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tokio::{
    spawn,
    sync::Mutex,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{daemon::DaemonCtx, peer::PeerId};

/// State of the choke algorithm. All the decisions are made here, without IO,
/// the [`Choker`] applies them to the connected peers.
#[derive(Debug)]
pub struct Ranking {
    local_id: PeerId,
    k: usize,
    /// Peers that told us they are interested in our pieces.
    interested: HashSet<PeerId>,
    /// Last download rate of each peer, in bytes per millisecond. Kept across
    /// reconnections.
    rates: BTreeMap<PeerId, f64>,
    preferred: Vec<PeerId>,
    optimistic: Option<PeerId>,
    rng: StdRng,
}

impl Ranking {
    pub fn new(local_id: PeerId, k: usize, rng: StdRng) -> Self {
        Self {
            local_id,
            k,
            interested: HashSet::new(),
            rates: BTreeMap::new(),
            preferred: Vec::new(),
            optimistic: None,
            rng,
        }
    }

    pub fn mark_interested(&mut self, peer: PeerId) {
        if peer != self.local_id {
            self.interested.insert(peer);
        }
    }

    pub fn mark_not_interested(&mut self, peer: PeerId) {
        self.interested.remove(&peer);
    }

    pub fn is_interested(&self, peer: PeerId) -> bool {
        self.interested.contains(&peer)
    }

    /// The last value wins.
    pub fn record_rate(&mut self, peer: PeerId, rate: f64) {
        self.rates.insert(peer, rate);
    }

    pub fn rate(&self, peer: PeerId) -> Option<f64> {
        self.rates.get(&peer).copied()
    }

    pub fn preferred(&self) -> &[PeerId] {
        &self.preferred
    }

    pub fn optimistic(&self) -> Option<PeerId> {
        self.optimistic
    }

    /// Preferred or optimistically unchoked.
    pub fn is_unchoked(&self, peer: PeerId) -> bool {
        self.optimistic == Some(peer) || self.preferred.contains(&peer)
    }

    /// Recompute and store the preferred neighbors.
    ///
    /// While every known rate is zero, `k` interested peers are picked at
    /// random. Otherwise the `k` peers with the highest rates are picked, in
    /// descending order, whether they are interested or not. Ties keep the
    /// order of the rate table.
    pub fn select_preferred(&mut self) -> Vec<PeerId> {
        self.interested.remove(&self.local_id);

        let preferred: Vec<PeerId> = if self.rates.values().all(|r| *r <= 0.0)
        {
            let mut candidates: Vec<PeerId> =
                self.interested.iter().copied().collect();
            candidates.sort();
            candidates.shuffle(&mut self.rng);
            candidates.truncate(self.k);
            candidates
        } else {
            let mut ranked: Vec<(PeerId, f64)> = self
                .rates
                .iter()
                .filter(|(peer, _)| **peer != self.local_id)
                .map(|(peer, rate)| (*peer, *rate))
                .collect();
            // stable, equal rates keep the table order
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
            ranked.into_iter().take(self.k).map(|(peer, _)| peer).collect()
        };

        if self.optimistic.is_some_and(|p| preferred.contains(&p)) {
            self.optimistic = None;
        }

        self.preferred = preferred.clone();
        preferred
    }

    /// Pick a random interested peer that is not preferred. When there is no
    /// such peer the previous pick is kept and `None` is returned.
    pub fn select_optimistic(&mut self) -> Option<PeerId> {
        let mut candidates: Vec<PeerId> = self
            .interested
            .iter()
            .filter(|p| **p != self.local_id && !self.preferred.contains(p))
            .copied()
            .collect();
        candidates.sort();

        let pick = *candidates.choose(&mut self.rng)?;
        self.optimistic = Some(pick);
        Some(pick)
    }
}

/// Shared handle to the [`Ranking`], and the two timers that drive it.
#[derive(Debug)]
pub struct Choker {
    ranking: Mutex<Ranking>,
}

impl Choker {
    pub fn new(local_id: PeerId, k: usize) -> Self {
        Self::with_ranking(Ranking::new(local_id, k, StdRng::from_entropy()))
    }

    pub fn with_ranking(ranking: Ranking) -> Self {
        Self { ranking: Mutex::new(ranking) }
    }

    pub async fn mark_interested(&self, peer: PeerId) {
        self.ranking.lock().await.mark_interested(peer);
    }

    pub async fn mark_not_interested(&self, peer: PeerId) {
        self.ranking.lock().await.mark_not_interested(peer);
    }

    pub async fn record_rate(&self, peer: PeerId, rate: f64) {
        self.ranking.lock().await.record_rate(peer, rate);
    }

    pub async fn rate(&self, peer: PeerId) -> Option<f64> {
        self.ranking.lock().await.rate(peer)
    }

    pub async fn is_interested(&self, peer: PeerId) -> bool {
        self.ranking.lock().await.is_interested(peer)
    }

    pub async fn preferred(&self) -> Vec<PeerId> {
        self.ranking.lock().await.preferred().to_vec()
    }

    pub async fn optimistic(&self) -> Option<PeerId> {
        self.ranking.lock().await.optimistic()
    }

    /// Recompute the preferred neighbors, then tell every connected peer if
    /// it is choked or not.
    #[tracing::instrument(skip_all, name = "choker::preferred")]
    pub async fn recompute_preferred(&self, ctx: &DaemonCtx) {
        let peers = ctx.peers.peer_ids().await;

        let (preferred, decisions) = {
            let mut ranking = self.ranking.lock().await;
            let preferred = ranking.select_preferred();
            let decisions: Vec<(PeerId, bool)> =
                peers.iter().map(|p| (*p, ranking.is_unchoked(*p))).collect();
            (preferred, decisions)
        };

        debug!("preferred neighbors {preferred:?}");
        ctx.activity.preferred_neighbors(&preferred);

        for (peer, unchoke) in decisions {
            if let Err(e) = ctx.peers.apply_choke_decision(peer, unchoke).await
            {
                debug!("could not apply choke decision to {peer}: {e}");
            }
        }
    }

    /// Pick a new optimistically unchoked neighbor, and unchoke it.
    #[tracing::instrument(skip_all, name = "choker::optimistic")]
    pub async fn recompute_optimistic(&self, ctx: &DaemonCtx) {
        let Some(pick) = self.ranking.lock().await.select_optimistic() else {
            debug!("no candidate for optimistic unchoke");
            return;
        };

        ctx.activity.optimistic_neighbor(pick);

        if let Err(e) = ctx.peers.apply_choke_decision(pick, true).await {
            debug!("could not unchoke {pick}: {e}");
        }
    }

    /// Start both timers, they tick right away and then once per interval.
    pub fn spawn(ctx: Arc<DaemonCtx>) -> [JoinHandle<()>; 2] {
        let unchoking_every = ctx.config.unchoking_interval;
        let optimistic_every = ctx.config.optimistic_unchoking_interval;

        info!(
            "choker running, unchoking every {unchoking_every:?}, optimistic \
             every {optimistic_every:?}"
        );

        let preferred_ctx = ctx.clone();
        let preferred = spawn(async move {
            let mut tick = interval(unchoking_every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                preferred_ctx.choker.recompute_preferred(&preferred_ctx).await;
            }
        });

        let optimistic = spawn(async move {
            let mut tick = interval(optimistic_every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                ctx.choker.recompute_optimistic(&ctx).await;
            }
        });

        [preferred, optimistic]
    }
}
