use crate::context::{Context, Flag};
use crate::dataset::Attribute;
use crate::dictionary::{Dictionary, DEFAULT_STATE};
use crate::errors::{Result, TricrfError};
use crate::model::{Model, ModelKind};
use crate::params::{ParamStore, BOUNDARY};

/// One predicted example.
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Predicted topic (triangular models)
    pub topic: Option<String>,
    /// Posterior of the predicted topic, when confidence was requested
    pub topic_posterior: Option<f64>,
    /// Predicted label per token
    pub labels: Vec<String>,
    /// Marginal posterior of each predicted label, when confidence was
    /// requested
    pub posteriors: Option<Vec<f64>>,
}

impl Prediction {
    fn empty() -> Self {
        Self {
            topic: None,
            topic_posterior: None,
            labels: Vec::new(),
            posteriors: None,
        }
    }
}

/// Predicts label sequences (and topics) for input sequences using a model.
///
/// Transition scores are constant per model and computed once at
/// construction; observation scores are filled per example.
pub struct Tagger<'a> {
    model: &'a Model,
    contexts: Vec<Context>,
    scores: Vec<f64>,
}

impl<'a> Tagger<'a> {
    pub fn new(model: &'a Model) -> Result<Self> {
        let flag = Flag::VITERBI | Flag::MARGINALS;
        let mut contexts = match model.kind() {
            ModelKind::MaxEnt => Vec::new(),
            ModelKind::Crf => vec![Context::new(flag, model.stores[0].num_states(), 0)],
            ModelKind::TriCrf1 | ModelKind::TriCrf3 => model
                .stores
                .iter()
                .map(|s| Context::new(flag, s.num_states(), 0))
                .collect(),
            ModelKind::TriCrf2 => model
                .zy_index
                .iter()
                .map(|subset| Context::new(flag, subset.len(), 0))
                .collect(),
        };
        match model.kind() {
            ModelKind::MaxEnt => {}
            ModelKind::Crf => fill_transitions(&mut contexts[0], &model.stores[0]),
            ModelKind::TriCrf1 | ModelKind::TriCrf3 => {
                for (z, ctx) in contexts.iter_mut().enumerate() {
                    fill_transitions(ctx, &model.stores[z]);
                }
            }
            ModelKind::TriCrf2 => {
                for (z, ctx) in contexts.iter_mut().enumerate() {
                    fill_transitions_subset(ctx, &model.stores[0], &model.zy_index[z]);
                }
            }
        }
        Ok(Self {
            model,
            contexts,
            scores: Vec::new(),
        })
    }

    /// Predict the label sequence for an item sequence (chain models).
    pub fn tag<T: AsRef<[Attribute]>>(&mut self, xseq: &[T], confidence: bool) -> Result<Prediction> {
        if xseq.is_empty() {
            return Ok(Prediction::empty());
        }
        match self.model.kind() {
            ModelKind::MaxEnt => self.tag_maxent(xseq, confidence),
            ModelKind::Crf => self.tag_crf(xseq, confidence),
            _ => Err(TricrfError::invalid_argument(
                "triangular models predict through tag_tri",
            )),
        }
    }

    /// Predict the topic and label sequence for a triangular example.
    ///
    /// The chosen topic maximizes the topic prior times the best path score;
    /// ties break toward the lower topic id.
    pub fn tag_tri<T: AsRef<[Attribute]>>(
        &mut self,
        topic_feats: &[Attribute],
        xseq: &[T],
        confidence: bool,
    ) -> Result<Prediction> {
        if !self.model.kind().is_triangular() {
            return Err(TricrfError::invalid_argument(
                "chain models predict through tag",
            ));
        }
        if xseq.is_empty() {
            return Ok(Prediction::empty());
        }
        let model = self.model;
        let nz = self.contexts.len();

        // Topic prior scores
        let topic_lin = topic_linear_scores(topic_feats, model, nz);

        let mut best_z = 0usize;
        let mut best_total = f64::NEG_INFINITY;
        let mut best_path: Vec<u32> = Vec::new();
        let mut chain_logz = vec![0.0; nz];

        for z in 0..nz {
            let ctx = &mut self.contexts[z];
            match model.kind() {
                ModelKind::TriCrf1 => {
                    fill_state_from_attrs(ctx, &model.stores[z], &model.seq_attrs[z], xseq)
                }
                ModelKind::TriCrf3 => {
                    fill_state_from_attrs(ctx, &model.stores[z], &model.attrs, xseq)
                }
                ModelKind::TriCrf2 => fill_state_from_attrs_subset(
                    ctx,
                    &model.stores[0],
                    &model.attrs,
                    xseq,
                    &model.zy_pos[z],
                ),
                _ => unreachable!(),
            }
            if confidence {
                ctx.exp_states();
                chain_logz[z] = ctx.forward();
            }
            let (path, vscore) = ctx.viterbi();
            let total = topic_lin[z] + vscore;
            if total > best_total {
                best_total = total;
                best_z = z;
                best_path = path;
            }
        }

        let labels = self.path_names(best_z, &best_path);
        let topic = model.topics.name(best_z as u32).unwrap_or("").to_string();

        let (topic_posterior, posteriors) = if confidence {
            let joint: Vec<f64> = (0..nz).map(|z| topic_lin[z] + chain_logz[z]).collect();
            let max = joint.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let log_joint =
                max + joint.iter().map(|v| (v - max).exp()).sum::<f64>().ln();
            let pz = (joint[best_z] - log_joint).exp();
            let ctx = &mut self.contexts[best_z];
            let posteriors = if ctx.log_norm().is_finite() {
                ctx.backward();
                Some(
                    best_path
                        .iter()
                        .enumerate()
                        .map(|(t, &y)| ctx.marginal_state(t, y as usize))
                        .collect(),
                )
            } else {
                None
            };
            (Some(pz), posteriors)
        } else {
            (None, None)
        };

        Ok(Prediction {
            topic: Some(topic),
            topic_posterior,
            labels,
            posteriors,
        })
    }

    fn tag_maxent<T: AsRef<[Attribute]>>(
        &mut self,
        xseq: &[T],
        confidence: bool,
    ) -> Result<Prediction> {
        let store = &self.model.stores[0];
        let l = store.num_states();
        let mut labels = Vec::with_capacity(xseq.len());
        let mut posteriors = confidence.then(|| Vec::with_capacity(xseq.len()));

        for item in xseq {
            self.scores.clear();
            self.scores.resize(l, 0.0);
            for attr in item.as_ref() {
                if let Some(fid) = self.model.attrs.find(&attr.name) {
                    for &(y, widx) in store.attr_refs(fid) {
                        self.scores[y as usize] += store.weights()[widx as usize] * attr.value;
                    }
                }
            }
            let mut best = 0usize;
            for y in 1..l {
                if self.scores[y] > self.scores[best] {
                    best = y;
                }
            }
            labels.push(self.label_name(best as u32));
            if let Some(posteriors) = posteriors.as_mut() {
                let max = self.scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let z: f64 = self.scores.iter().map(|s| (s - max).exp()).sum();
                posteriors.push((self.scores[best] - max).exp() / z);
            }
        }
        Ok(Prediction {
            topic: None,
            topic_posterior: None,
            labels,
            posteriors,
        })
    }

    fn tag_crf<T: AsRef<[Attribute]>>(
        &mut self,
        xseq: &[T],
        confidence: bool,
    ) -> Result<Prediction> {
        let model = self.model;
        let ctx = &mut self.contexts[0];
        fill_state_from_attrs(ctx, &model.stores[0], &model.attrs, xseq);
        let (path, _) = ctx.viterbi();

        let posteriors = if confidence {
            ctx.exp_states();
            let logz = ctx.forward();
            if logz.is_finite() {
                ctx.backward();
                Some(
                    path.iter()
                        .enumerate()
                        .map(|(t, &y)| ctx.marginal_state(t, y as usize))
                        .collect(),
                )
            } else {
                None
            }
        } else {
            None
        };

        let labels = path.iter().map(|&y| self.label_name(y)).collect();
        Ok(Prediction {
            topic: None,
            topic_posterior: None,
            labels,
            posteriors,
        })
    }

    fn label_name(&self, y: u32) -> String {
        self.model
            .labels
            .name(y)
            .unwrap_or(DEFAULT_STATE)
            .to_string()
    }

    fn path_names(&self, z: usize, path: &[u32]) -> Vec<String> {
        match self.model.kind() {
            ModelKind::TriCrf1 | ModelKind::TriCrf3 => path
                .iter()
                .map(|&y| {
                    self.model.seq_labels[z]
                        .name(y)
                        .unwrap_or(DEFAULT_STATE)
                        .to_string()
                })
                .collect(),
            ModelKind::TriCrf2 => path
                .iter()
                .map(|&local| {
                    let y = self.model.zy_index[z][local as usize];
                    self.model
                        .labels
                        .name(y)
                        .unwrap_or(DEFAULT_STATE)
                        .to_string()
                })
                .collect(),
            _ => unreachable!(),
        }
    }
}

fn topic_linear_scores(topic_feats: &[Attribute], model: &Model, nz: usize) -> Vec<f64> {
    let store = &model.topic_store;
    let mut lin = vec![0.0; nz];
    for attr in topic_feats {
        if let Some(fid) = model.topic_attrs.find(&attr.name) {
            for &(z, widx) in store.attr_refs(fid) {
                lin[z as usize] += store.weights()[widx as usize] * attr.value;
            }
        }
    }
    lin
}

fn fill_transitions(ctx: &mut Context, store: &ParamStore) {
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

fn fill_transitions_subset(ctx: &mut Context, store: &ParamStore, subset: &[u32]) {
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

/// Fill observation scores from named attributes; unseen names are ignored
fn fill_state_from_attrs<T: AsRef<[Attribute]>>(
    ctx: &mut Context,
    store: &ParamStore,
    attrs: &Dictionary,
    xseq: &[T],
) {
    ctx.set_num_items(xseq.len());
    ctx.reset_state();
    let w = store.weights();
    for (t, item) in xseq.iter().enumerate() {
        for attr in item.as_ref() {
            if let Some(fid) = attrs.find(&attr.name) {
                for &(y, widx) in store.attr_refs(fid) {
                    ctx.state[[t, y as usize]] += w[widx as usize] * attr.value;
                }
            }
        }
    }
}

fn fill_state_from_attrs_subset<T: AsRef<[Attribute]>>(
    ctx: &mut Context,
    store: &ParamStore,
    attrs: &Dictionary,
    xseq: &[T],
    pos: &[u32],
) {
    ctx.set_num_items(xseq.len());
    ctx.reset_state();
    let w = store.weights();
    for (t, item) in xseq.iter().enumerate() {
        for attr in item.as_ref() {
            if let Some(fid) = attrs.find(&attr.name) {
                for &(y, widx) in store.attr_refs(fid) {
                    let p = pos[y as usize];
                    if p > 0 {
                        ctx.state[[t, (p - 1) as usize]] += w[widx as usize] * attr.value;
                    }
                }
            }
        }
    }
}
