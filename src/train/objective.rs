//! Gradient assembly for one optimizer evaluation.
//!
//! The full objective is the negative joint log-likelihood: for each example
//! the log partition function accumulates positively and the gold-path score
//! is subtracted once, through the cached empirical counts. The gradient is
//! expected counts minus those cached counts. The pseudo-likelihood
//! objective used for warm starts is assembled directly, position by
//! position, without forward-backward.

use crate::context::{Context, Flag};
use crate::dataset::{Dataset, Event, Sequence, TriSequence};
use crate::errors::{Result, TricrfError};
use crate::model::{Model, ModelKind};
use crate::params::{ParamStore, BOUNDARY};
use crate::train::{Estimation, TrainOpts};

/// Interned training examples, laid out per model kind.
pub(crate) enum TrainData {
    /// MaxEnt and linear-chain examples over the global dictionaries
    Seq(Dataset<Sequence>),
    /// Triangular examples. For the per-topic-dictionary variant,
    /// `per_topic[z][i]` re-expresses example i in topic z's feature space;
    /// it is empty for the shared-dictionary variants.
    Tri {
        examples: Dataset<TriSequence>,
        per_topic: Vec<Vec<Sequence>>,
    },
}

impl TrainData {
    fn num_examples(&self) -> usize {
        match self {
            Self::Seq(d) => d.len(),
            Self::Tri { examples, .. } => examples.len(),
        }
    }

    fn max_items(&self) -> usize {
        match self {
            Self::Seq(d) => d.iter().map(Vec::len).max().unwrap_or(0),
            Self::Tri { examples, .. } => {
                examples.iter().map(|ex| ex.seq.len()).max().unwrap_or(0)
            }
        }
    }
}

/// Computes `(L, g)` at a given weight vector over a finalized model.
///
/// Holds the per-store gradient buffers and the reusable chain contexts;
/// nothing here survives between evaluations except buffer capacity.
pub(crate) struct Evaluator<'a> {
    model: &'a mut Model,
    data: &'a TrainData,
    estimation: Estimation,
    l1_c: f64,
    l2_sigma: f64,
    max_skip_ratio: f64,
    pl_observation_only: bool,
    contexts: Vec<Context>,
    grads: Vec<Vec<f64>>,
    scores: Vec<f64>,
    probs: Vec<f64>,
    chain_logz: Vec<f64>,
    skipped: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(model: &'a mut Model, data: &'a TrainData, opts: &TrainOpts) -> Self {
        let hint = data.max_items();
        let contexts = match model.kind() {
            ModelKind::MaxEnt => Vec::new(),
            ModelKind::Crf => vec![Context::new(
                Flag::MARGINALS,
                model.stores[0].num_states(),
                hint,
            )],
            ModelKind::TriCrf1 | ModelKind::TriCrf3 => model
                .stores
                .iter()
                .map(|s| Context::new(Flag::MARGINALS, s.num_states(), hint))
                .collect(),
            ModelKind::TriCrf2 => model
                .zy_index
                .iter()
                .map(|subset| Context::new(Flag::MARGINALS, subset.len(), hint))
                .collect(),
        };
        let grads = model
            .all_stores()
            .iter()
            .map(|s| vec![0.0; s.num_weights()])
            .collect();
        Self {
            model,
            data,
            estimation: opts.estimation,
            l1_c: opts.l1_c,
            l2_sigma: opts.l2_sigma,
            max_skip_ratio: opts.max_skip_ratio,
            pl_observation_only: opts.pl_observation_only,
            contexts,
            grads,
            scores: Vec::new(),
            probs: Vec::new(),
            chain_logz: Vec::new(),
            skipped: 0,
        }
    }

    /// Examples skipped for numerical underflow in the last evaluation
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Full negative log-likelihood and gradient at `theta`
    pub fn evaluate(&mut self, theta: &[f64], grad: &mut [f64]) -> Result<f64> {
        self.model.set_weights(theta);
        for gbuf in &mut self.grads {
            gbuf.fill(0.0);
        }
        self.skipped = 0;
        let kind = self.model.kind();
        let data = self.data;
        let mut loss = 0.0;

        match (kind, data) {
            (ModelKind::MaxEnt, TrainData::Seq(examples)) => {
                let store = &self.model.stores[0];
                let g = &mut self.grads[0];
                for seq in examples.iter() {
                    for ev in seq {
                        loss +=
                            maxent_event(ev, store, &mut self.scores, &mut self.probs, g, false);
                    }
                }
            }
            (ModelKind::Crf, TrainData::Seq(examples)) => {
                let store = &self.model.stores[0];
                let ctx = &mut self.contexts[0];
                let g = &mut self.grads[0];
                fill_transitions(ctx, store);
                for seq in examples.iter() {
                    fill_state(ctx, store, seq);
                    let logz = ctx.forward();
                    if !logz.is_finite() {
                        self.skipped += 1;
                        continue;
                    }
                    loss += logz;
                    chain_accumulate(seq, store, ctx, g, 1.0);
                }
            }
            (ModelKind::TriCrf1 | ModelKind::TriCrf3, TrainData::Tri { examples, per_topic }) => {
                let stores = &self.model.stores;
                let topic_store = &self.model.topic_store;
                let contexts = &mut self.contexts;
                let (topic_g, seq_gs) = self.grads.split_at_mut(1);
                let topic_g = &mut topic_g[0];
                let nz = stores.len();

                for (z, ctx) in contexts.iter_mut().enumerate() {
                    fill_transitions(ctx, &stores[z]);
                }
                self.chain_logz.clear();
                self.chain_logz.resize(nz, 0.0);

                'example: for (i, ex) in examples.iter().enumerate() {
                    topic_scores(&ex.topic, topic_store, &mut self.scores);
                    for z in 0..nz {
                        let seq = if per_topic.is_empty() {
                            &ex.seq
                        } else {
                            &per_topic[z][i]
                        };
                        fill_state(&mut contexts[z], &stores[z], seq);
                        let logz = contexts[z].forward();
                        if !logz.is_finite() {
                            self.skipped += 1;
                            continue 'example;
                        }
                        self.chain_logz[z] = logz;
                    }
                    for z in 0..nz {
                        self.scores[z] += self.chain_logz[z];
                    }
                    let joint = logsumexp(&self.scores);
                    loss += joint;
                    self.probs.clear();
                    self.probs
                        .extend(self.scores.iter().map(|s| (s - joint).exp()));

                    for attr in &ex.topic.obs {
                        for &(z, widx) in topic_store.attr_refs(attr.0) {
                            topic_g[widx as usize] += self.probs[z as usize] * attr.1;
                        }
                    }
                    for z in 0..nz {
                        let seq = if per_topic.is_empty() {
                            &ex.seq
                        } else {
                            &per_topic[z][i]
                        };
                        chain_accumulate(
                            seq,
                            &stores[z],
                            &mut contexts[z],
                            &mut seq_gs[z],
                            self.probs[z],
                        );
                    }
                }
            }
            (ModelKind::TriCrf2, TrainData::Tri { examples, .. }) => {
                let store = &self.model.stores[0];
                let topic_store = &self.model.topic_store;
                let zy_index = &self.model.zy_index;
                let zy_pos = &self.model.zy_pos;
                let contexts = &mut self.contexts;
                let (topic_g, seq_gs) = self.grads.split_at_mut(1);
                let topic_g = &mut topic_g[0];
                let seq_g = &mut seq_gs[0];
                let nz = zy_index.len();

                for (z, ctx) in contexts.iter_mut().enumerate() {
                    fill_transitions_subset(ctx, store, &zy_index[z]);
                }
                self.chain_logz.clear();
                self.chain_logz.resize(nz, 0.0);

                'example2: for ex in examples.iter() {
                    topic_scores(&ex.topic, topic_store, &mut self.scores);
                    for z in 0..nz {
                        fill_state_subset(&mut contexts[z], store, &ex.seq, &zy_pos[z]);
                        let logz = contexts[z].forward();
                        if !logz.is_finite() {
                            self.skipped += 1;
                            continue 'example2;
                        }
                        self.chain_logz[z] = logz;
                    }
                    for z in 0..nz {
                        self.scores[z] += self.chain_logz[z];
                    }
                    let joint = logsumexp(&self.scores);
                    loss += joint;
                    self.probs.clear();
                    self.probs
                        .extend(self.scores.iter().map(|s| (s - joint).exp()));

                    for attr in &ex.topic.obs {
                        for &(z, widx) in topic_store.attr_refs(attr.0) {
                            topic_g[widx as usize] += self.probs[z as usize] * attr.1;
                        }
                    }
                    for z in 0..nz {
                        chain_accumulate_subset(
                            &ex.seq,
                            store,
                            &mut contexts[z],
                            seq_g,
                            self.probs[z],
                            &zy_index[z],
                            &zy_pos[z],
                        );
                    }
                }
            }
            _ => unreachable!("training data does not match the model kind"),
        }

        self.check_skips()?;
        loss -= self.model.gold_score();
        self.pack_gradient(grad, true);
        Ok(self.regularize(theta, grad, loss))
    }

    /// Pseudo-likelihood objective and gradient at `theta`.
    ///
    /// Per-position conditionals given the gold previous label; no
    /// forward-backward. Transition weights are updated unless the
    /// observation-only option is set.
    pub fn evaluate_pl(&mut self, theta: &[f64], grad: &mut [f64]) -> Result<f64> {
        self.model.set_weights(theta);
        for gbuf in &mut self.grads {
            gbuf.fill(0.0);
        }
        self.skipped = 0;
        let kind = self.model.kind();
        let data = self.data;
        let obs_only = self.pl_observation_only;
        let mut loss = 0.0;

        match (kind, data) {
            (ModelKind::MaxEnt, TrainData::Seq(examples)) => {
                let store = &self.model.stores[0];
                let g = &mut self.grads[0];
                for seq in examples.iter() {
                    for ev in seq {
                        loss +=
                            maxent_event(ev, store, &mut self.scores, &mut self.probs, g, true);
                    }
                }
            }
            (ModelKind::Crf, TrainData::Seq(examples)) => {
                let store = &self.model.stores[0];
                let g = &mut self.grads[0];
                for seq in examples.iter() {
                    loss +=
                        pl_sequence(seq, store, &mut self.scores, &mut self.probs, g, obs_only);
                }
            }
            (ModelKind::TriCrf1 | ModelKind::TriCrf3, TrainData::Tri { examples, per_topic }) => {
                let stores = &self.model.stores;
                let topic_store = &self.model.topic_store;
                let (topic_g, seq_gs) = self.grads.split_at_mut(1);
                let topic_g = &mut topic_g[0];
                for (i, ex) in examples.iter().enumerate() {
                    loss += maxent_event(
                        &ex.topic,
                        topic_store,
                        &mut self.scores,
                        &mut self.probs,
                        topic_g,
                        true,
                    );
                    let z = ex.topic.label as usize;
                    let seq = if per_topic.is_empty() {
                        &ex.seq
                    } else {
                        &per_topic[z][i]
                    };
                    loss += pl_sequence(
                        seq,
                        &stores[z],
                        &mut self.scores,
                        &mut self.probs,
                        &mut seq_gs[z],
                        obs_only,
                    );
                }
            }
            (ModelKind::TriCrf2, TrainData::Tri { examples, .. }) => {
                let store = &self.model.stores[0];
                let topic_store = &self.model.topic_store;
                let zy_index = &self.model.zy_index;
                let zy_pos = &self.model.zy_pos;
                let (topic_g, seq_gs) = self.grads.split_at_mut(1);
                let topic_g = &mut topic_g[0];
                let seq_g = &mut seq_gs[0];
                for ex in examples.iter() {
                    loss += maxent_event(
                        &ex.topic,
                        topic_store,
                        &mut self.scores,
                        &mut self.probs,
                        topic_g,
                        true,
                    );
                    let z = ex.topic.label as usize;
                    loss += pl_sequence_subset(
                        &ex.seq,
                        store,
                        &zy_index[z],
                        &zy_pos[z],
                        &mut self.scores,
                        &mut self.probs,
                        seq_g,
                        obs_only,
                    );
                }
            }
            _ => unreachable!("training data does not match the model kind"),
        }

        self.pack_gradient(grad, false);
        Ok(self.regularize(theta, grad, loss))
    }

    fn check_skips(&self) -> Result<()> {
        let n = self.data.num_examples();
        if self.skipped as f64 > self.max_skip_ratio * n as f64 {
            return Err(TricrfError::optimizer(format!(
                "{} of {} examples skipped for numerical underflow",
                self.skipped, n
            )));
        }
        Ok(())
    }

    fn pack_gradient(&self, grad: &mut [f64], subtract_counts: bool) {
        let mut off = 0;
        for (gbuf, store) in self.grads.iter().zip(self.model.all_stores()) {
            if subtract_counts {
                let counts = store.counts();
                for i in 0..gbuf.len() {
                    grad[off + i] = gbuf[i] - counts[i];
                }
            } else {
                grad[off..off + gbuf.len()].copy_from_slice(gbuf);
            }
            off += gbuf.len();
        }
    }

    fn regularize(&self, theta: &[f64], grad: &mut [f64], mut loss: f64) -> f64 {
        match self.estimation {
            Estimation::LbfgsL2 => {
                let inv_s2 = 1.0 / (self.l2_sigma * self.l2_sigma);
                for (g, &t) in grad.iter_mut().zip(theta) {
                    loss += 0.5 * t * t * inv_s2;
                    *g += t * inv_s2;
                }
            }
            Estimation::LbfgsL1 => {
                // The orthant-wise optimizer differentiates the penalty via
                // the pseudo-gradient; only the objective carries it here.
                loss += self.l1_c * theta.iter().map(|t| t.abs()).sum::<f64>();
            }
        }
        loss
    }
}

/// Numerically stable log of the summed exponentials
pub(crate) fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Score, normalize, and accumulate one independent event.
///
/// With `with_gold`, the gradient receives expected minus empirical directly
/// and the loss includes the gold score; otherwise only expectations are
/// accumulated and the gold side is settled through the cached counts.
fn maxent_event(
    ev: &Event,
    store: &ParamStore,
    scores: &mut Vec<f64>,
    probs: &mut Vec<f64>,
    g: &mut [f64],
    with_gold: bool,
) -> f64 {
    let l = store.num_states();
    scores.clear();
    scores.resize(l, 0.0);
    for &(fid, val) in &ev.obs {
        for &(y, widx) in store.attr_refs(fid) {
            scores[y as usize] += store.weights()[widx as usize] * val;
        }
    }
    let logz = logsumexp(scores);
    probs.clear();
    probs.extend(scores.iter().map(|s| (s - logz).exp()));

    for &(fid, val) in &ev.obs {
        for &(y, widx) in store.attr_refs(fid) {
            let mut p = probs[y as usize];
            if with_gold && y == ev.label {
                p -= 1.0;
            }
            g[widx as usize] += p * val;
        }
    }
    if with_gold {
        logz - scores[ev.label as usize]
    } else {
        logz
    }
}

/// Linear scores of every topic for one topic event
fn topic_scores(topic: &Event, store: &ParamStore, scores: &mut Vec<f64>) {
    let nz = store.num_states();
    scores.clear();
    scores.resize(nz, 0.0);
    for &(fid, val) in &topic.obs {
        for &(z, widx) in store.attr_refs(fid) {
            scores[z as usize] += store.weights()[widx as usize] * val;
        }
    }
}

/// Write log transition and start scores into the context
pub(crate) fn fill_transitions(ctx: &mut Context, store: &ParamStore) {
    let l = store.num_states();
    let w = store.weights();
    for i in 0..l {
        for j in 0..l {
            ctx.trans[[i, j]] = w[store.trans_widx(i as u32, j as u32) as usize];
        }
    }
    for j in 0..l {
        ctx.start[j] = w[store.trans_widx(BOUNDARY, j as u32) as usize];
    }
    ctx.exp_transitions();
}

/// Transition scores restricted to a topic's state subset
pub(crate) fn fill_transitions_subset(ctx: &mut Context, store: &ParamStore, subset: &[u32]) {
    let w = store.weights();
    for (li, &gi) in subset.iter().enumerate() {
        for (lj, &gj) in subset.iter().enumerate() {
            ctx.trans[[li, lj]] = w[store.trans_widx(gi, gj) as usize];
        }
    }
    for (lj, &gj) in subset.iter().enumerate() {
        ctx.start[lj] = w[store.trans_widx(BOUNDARY, gj) as usize];
    }
    ctx.exp_transitions();
}

/// Write log observation scores for one example into the context
pub(crate) fn fill_state(ctx: &mut Context, store: &ParamStore, seq: &Sequence) {
    ctx.set_num_items(seq.len());
    ctx.reset_state();
    let w = store.weights();
    for (t, ev) in seq.iter().enumerate() {
        for &(fid, val) in &ev.obs {
            for &(y, widx) in store.attr_refs(fid) {
                ctx.state[[t, y as usize]] += w[widx as usize] * val;
            }
        }
    }
    ctx.exp_states();
}

/// Observation scores restricted to a topic's state subset
pub(crate) fn fill_state_subset(ctx: &mut Context, store: &ParamStore, seq: &Sequence, pos: &[u32]) {
    ctx.set_num_items(seq.len());
    ctx.reset_state();
    let w = store.weights();
    for (t, ev) in seq.iter().enumerate() {
        for &(fid, val) in &ev.obs {
            for &(y, widx) in store.attr_refs(fid) {
                let p = pos[y as usize];
                if p > 0 {
                    ctx.state[[t, (p - 1) as usize]] += w[widx as usize] * val;
                }
            }
        }
    }
    ctx.exp_states();
}

/// Run backward and add `weight`-scaled expected counts to the gradient.
///
/// Requires a completed forward pass on the context.
fn chain_accumulate(seq: &Sequence, store: &ParamStore, ctx: &mut Context, g: &mut [f64], weight: f64) {
    ctx.backward();
    let l = store.num_states();
    for (t, ev) in seq.iter().enumerate() {
        for &(fid, val) in &ev.obs {
            for &(y, widx) in store.attr_refs(fid) {
                g[widx as usize] += weight * ctx.marginal_state(t, y as usize) * val;
            }
        }
    }
    for j in 0..l {
        g[store.trans_widx(BOUNDARY, j as u32) as usize] += weight * ctx.marginal_state(0, j);
    }
    for t in 1..seq.len() {
        for i in 0..l {
            for j in 0..l {
                g[store.trans_widx(i as u32, j as u32) as usize] +=
                    weight * ctx.marginal_edge(t, i, j);
            }
        }
    }
}

fn chain_accumulate_subset(
    seq: &Sequence,
    store: &ParamStore,
    ctx: &mut Context,
    g: &mut [f64],
    weight: f64,
    subset: &[u32],
    pos: &[u32],
) {
    ctx.backward();
    for (t, ev) in seq.iter().enumerate() {
        for &(fid, val) in &ev.obs {
            for &(y, widx) in store.attr_refs(fid) {
                let p = pos[y as usize];
                if p > 0 {
                    g[widx as usize] +=
                        weight * ctx.marginal_state(t, (p - 1) as usize) * val;
                }
            }
        }
    }
    for (lj, &gj) in subset.iter().enumerate() {
        g[store.trans_widx(BOUNDARY, gj) as usize] += weight * ctx.marginal_state(0, lj);
    }
    for t in 1..seq.len() {
        for (li, &gi) in subset.iter().enumerate() {
            for (lj, &gj) in subset.iter().enumerate() {
                g[store.trans_widx(gi, gj) as usize] += weight * ctx.marginal_edge(t, li, lj);
            }
        }
    }
}

/// Per-position conditional objective given the gold previous label
fn pl_sequence(
    seq: &Sequence,
    store: &ParamStore,
    scores: &mut Vec<f64>,
    probs: &mut Vec<f64>,
    g: &mut [f64],
    obs_only: bool,
) -> f64 {
    let l = store.num_states();
    let w = store.weights();
    let mut loss = 0.0;
    let mut prev = BOUNDARY;
    for ev in seq {
        scores.clear();
        scores.resize(l, 0.0);
        for &(fid, val) in &ev.obs {
            for &(y, widx) in store.attr_refs(fid) {
                scores[y as usize] += w[widx as usize] * val;
            }
        }
        for (y, score) in scores.iter_mut().enumerate() {
            *score += w[store.trans_widx(prev, y as u32) as usize];
        }
        let logz = logsumexp(scores);
        loss += logz - scores[ev.label as usize];
        probs.clear();
        probs.extend(scores.iter().map(|s| (s - logz).exp()));

        for &(fid, val) in &ev.obs {
            for &(y, widx) in store.attr_refs(fid) {
                let mut p = probs[y as usize];
                if y == ev.label {
                    p -= 1.0;
                }
                g[widx as usize] += p * val;
            }
        }
        if !obs_only {
            for y in 0..l {
                let mut p = probs[y];
                if y as u32 == ev.label {
                    p -= 1.0;
                }
                g[store.trans_widx(prev, y as u32) as usize] += p;
            }
        }
        prev = ev.label;
    }
    loss
}

#[allow(clippy::too_many_arguments)]
fn pl_sequence_subset(
    seq: &Sequence,
    store: &ParamStore,
    subset: &[u32],
    pos: &[u32],
    scores: &mut Vec<f64>,
    probs: &mut Vec<f64>,
    g: &mut [f64],
    obs_only: bool,
) -> f64 {
    let w = store.weights();
    let mut loss = 0.0;
    let mut prev = BOUNDARY;
    for ev in seq {
        scores.clear();
        scores.resize(subset.len(), 0.0);
        for &(fid, val) in &ev.obs {
            for &(y, widx) in store.attr_refs(fid) {
                let p = pos[y as usize];
                if p > 0 {
                    scores[(p - 1) as usize] += w[widx as usize] * val;
                }
            }
        }
        for (lj, &gj) in subset.iter().enumerate() {
            scores[lj] += w[store.trans_widx(prev, gj) as usize];
        }
        let gold = (pos[ev.label as usize] - 1) as usize;
        let logz = logsumexp(scores);
        loss += logz - scores[gold];
        probs.clear();
        probs.extend(scores.iter().map(|s| (s - logz).exp()));

        for &(fid, val) in &ev.obs {
            for &(y, widx) in store.attr_refs(fid) {
                let p = pos[y as usize];
                if p > 0 {
                    let mut pr = probs[(p - 1) as usize];
                    if (p - 1) as usize == gold {
                        pr -= 1.0;
                    }
                    g[widx as usize] += pr * val;
                }
            }
        }
        if !obs_only {
            for (lj, &gj) in subset.iter().enumerate() {
                let mut pr = probs[lj];
                if lj == gold {
                    pr -= 1.0;
                }
                g[store.trans_widx(prev, gj) as usize] += pr;
            }
        }
        prev = ev.label;
    }
    loss
}
