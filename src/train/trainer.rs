//! The training driver: dictionary interning, store finalization, the
//! optional pseudo-likelihood warm start, and the optimizer loop.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::lbfgs::{Lbfgs, LbfgsParams, Outcome};
use super::objective::{Evaluator, TrainData};
use super::{Estimation, TrainOpts};
use crate::dataset::{Dataset, Event, Sequence, StringSequence, TriSequence, TriStringSequence};
use crate::dictionary::{Dictionary, DEFAULT_STATE, EDGE_FEATURE};
use crate::errors::{Result, TricrfError};
use crate::logger::Logger;
use crate::model::{Model, ModelKind};
use crate::params::{ParamStore, BOUNDARY};

/// How a training run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitOutcome {
    /// A convergence test was satisfied
    Converged,
    /// The evaluation budget ran out first
    MaxIterReached,
    /// The cooperative stop flag was raised
    Stopped,
    /// The optimizer could not make progress; the model holds the
    /// best-so-far weights
    Failed,
}

/// A finished training run.
pub struct Trained {
    pub model: Model,
    pub outcome: FitOutcome,
    pub iterations: usize,
}

/// Trains one model kind over a dataset.
pub struct Trainer {
    kind: ModelKind,
    opts: TrainOpts,
    stop: Arc<AtomicBool>,
}

impl Trainer {
    pub fn new(kind: ModelKind, opts: TrainOpts) -> Result<Self> {
        if opts.max_iter == 0 {
            return Err(TricrfError::invalid_argument("max_iter must be >= 1"));
        }
        if opts.l2_sigma <= 0.0 {
            return Err(TricrfError::invalid_argument("l2_sigma must be positive"));
        }
        if opts.l1_c < 0.0 {
            return Err(TricrfError::invalid_argument("l1_c must be non-negative"));
        }
        Ok(Self {
            kind,
            opts,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag checked between evaluations; raising it retains the best-so-far
    /// weights
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Train a MaxEnt or linear-chain model
    pub fn train_sequences(
        &self,
        logger: &mut Logger,
        data: &Dataset<StringSequence>,
    ) -> Result<Trained> {
        if self.kind.is_triangular() {
            return Err(TricrfError::invalid_argument(
                "triangular models train on topic-headed data",
            ));
        }
        if data.is_empty() {
            return Err(TricrfError::invalid_argument("no training data"));
        }
        let (model, train_data) = self.intern_sequences(data)?;
        logger.report(
            2,
            format_args!(
                "{}: {} examples, {} events, {} labels, {} features, {} weights",
                self.kind.name(),
                data.len(),
                data.num_events(),
                model.labels.len(),
                model.attrs.len(),
                model.num_weights()
            ),
        );
        self.fit(logger, model, train_data)
    }

    /// Train a triangular model
    pub fn train_tri(
        &self,
        logger: &mut Logger,
        data: &Dataset<TriStringSequence>,
    ) -> Result<Trained> {
        if !self.kind.is_triangular() {
            return Err(TricrfError::invalid_argument(
                "chain models train on plain sequence data",
            ));
        }
        if data.is_empty() {
            return Err(TricrfError::invalid_argument("no training data"));
        }
        let (model, train_data) = match self.kind {
            ModelKind::TriCrf1 => self.intern_tri_per_topic(data, true)?,
            ModelKind::TriCrf3 => self.intern_tri_per_topic(data, false)?,
            ModelKind::TriCrf2 => self.intern_tri_shared(data)?,
            _ => unreachable!(),
        };
        logger.report(
            2,
            format_args!(
                "{}: {} examples, {} events, {} topics, {} weights",
                self.kind.name(),
                data.len(),
                data.num_events(),
                model.num_topics(),
                model.num_weights()
            ),
        );
        self.fit(logger, model, train_data)
    }

    fn intern_sequences(
        &self,
        data: &Dataset<StringSequence>,
    ) -> Result<(Model, TrainData)> {
        let mut labels = Dictionary::with_reserved(DEFAULT_STATE);
        let mut attrs = Dictionary::with_reserved(EDGE_FEATURE);
        let mut store = ParamStore::new();
        let mut examples = Dataset::new();

        for sseq in data.iter() {
            let mut seq = Sequence::new();
            let mut prev = BOUNDARY;
            for sev in sseq {
                let y = labels.intern(&sev.label);
                let mut ev = Event::new(y);
                ev.fval = sev.fval;
                for attr in &sev.obs {
                    let fid = attrs.intern(&attr.name);
                    store.record_obs(y, fid, attr.value)?;
                    ev.obs.push((fid, attr.value));
                }
                if self.kind == ModelKind::Crf {
                    store.record_trans(prev, y)?;
                    prev = y;
                }
                seq.push(ev);
            }
            examples.append(seq)?;
        }

        store.finalize(labels.len(), attrs.len(), self.opts.tie_threshold)?;
        let mut model = Model::empty(self.kind);
        model.labels = labels;
        model.attrs = attrs;
        model.stores.push(store);
        Ok((model, TrainData::Seq(examples)))
    }

    /// Interning for the per-topic variants. With `per_topic_attrs` every
    /// topic keeps its own feature dictionary and examples are re-expressed
    /// per topic; otherwise one shared feature dictionary serves all topic
    /// blocks.
    fn intern_tri_per_topic(
        &self,
        data: &Dataset<TriStringSequence>,
        per_topic_attrs: bool,
    ) -> Result<(Model, TrainData)> {
        let mut topics = Dictionary::new();
        let mut topic_attrs = Dictionary::with_reserved(EDGE_FEATURE);
        let mut topic_store = ParamStore::new();
        let mut attrs = Dictionary::with_reserved(EDGE_FEATURE);
        let mut seq_labels: Vec<Dictionary> = Vec::new();
        let mut seq_attrs: Vec<Dictionary> = Vec::new();
        let mut stores: Vec<ParamStore> = Vec::new();
        let mut examples = Dataset::new();

        for tseq in data.iter() {
            let z = topics.intern(&tseq.topic.label);
            if z as usize == stores.len() {
                seq_labels.push(Dictionary::with_reserved(DEFAULT_STATE));
                if per_topic_attrs {
                    seq_attrs.push(Dictionary::with_reserved(EDGE_FEATURE));
                }
                stores.push(ParamStore::new());
            }

            let mut topic_ev = Event::new(z);
            topic_ev.fval = tseq.topic.fval;
            for attr in &tseq.topic.obs {
                let fid = topic_attrs.intern(&attr.name);
                topic_store.record_obs(z, fid, attr.value)?;
                topic_ev.obs.push((fid, attr.value));
            }

            let mut seq = Sequence::new();
            let mut prev = BOUNDARY;
            for sev in &tseq.seq {
                let y = seq_labels[z as usize].intern(&sev.label);
                let mut ev = Event::new(y);
                ev.fval = sev.fval;
                for attr in &sev.obs {
                    let fid = if per_topic_attrs {
                        seq_attrs[z as usize].intern(&attr.name)
                    } else {
                        attrs.intern(&attr.name)
                    };
                    stores[z as usize].record_obs(y, fid, attr.value)?;
                    ev.obs.push((fid, attr.value));
                }
                stores[z as usize].record_trans(prev, y)?;
                prev = y;
                seq.push(ev);
            }
            examples.append(TriSequence {
                topic: topic_ev,
                seq,
            })?;
        }

        topic_store.finalize(topics.len(), topic_attrs.len(), None)?;
        for (z, store) in stores.iter_mut().enumerate() {
            let nf = if per_topic_attrs {
                seq_attrs[z].len()
            } else {
                attrs.len()
            };
            store.finalize(seq_labels[z].len(), nf, self.opts.tie_threshold)?;
        }

        // The per-topic-dictionary variant re-expresses every example in
        // every topic's feature space once the dictionaries are frozen.
        let per_topic = if per_topic_attrs {
            let nz = stores.len();
            let mut per_topic: Vec<Vec<Sequence>> = vec![Vec::with_capacity(data.len()); nz];
            for (tseq, ex) in data.iter().zip(examples.iter()) {
                let gold_z = ex.topic.label as usize;
                for (z, mapped) in per_topic.iter_mut().enumerate() {
                    let mut seq = Sequence::new();
                    for sev in &tseq.seq {
                        let label = if z == gold_z {
                            seq_labels[z].find(&sev.label).unwrap_or(0)
                        } else {
                            0
                        };
                        let mut ev = Event::new(label);
                        ev.fval = sev.fval;
                        for attr in &sev.obs {
                            if let Some(fid) = seq_attrs[z].find(&attr.name) {
                                ev.obs.push((fid, attr.value));
                            }
                        }
                        seq.push(ev);
                    }
                    mapped.push(seq);
                }
            }
            per_topic
        } else {
            Vec::new()
        };

        let mut model = Model::empty(self.kind);
        model.attrs = attrs;
        model.topics = topics;
        model.topic_attrs = topic_attrs;
        model.topic_store = topic_store;
        model.seq_labels = seq_labels;
        model.seq_attrs = seq_attrs;
        model.stores = stores;
        Ok((
            model,
            TrainData::Tri {
                examples,
                per_topic,
            },
        ))
    }

    fn intern_tri_shared(&self, data: &Dataset<TriStringSequence>) -> Result<(Model, TrainData)> {
        let mut topics = Dictionary::new();
        let mut topic_attrs = Dictionary::with_reserved(EDGE_FEATURE);
        let mut topic_store = ParamStore::new();
        let mut labels = Dictionary::with_reserved(DEFAULT_STATE);
        let mut attrs = Dictionary::with_reserved(EDGE_FEATURE);
        let mut store = ParamStore::new();
        let mut zy: Vec<BTreeSet<u32>> = Vec::new();
        let mut examples = Dataset::new();

        for tseq in data.iter() {
            let z = topics.intern(&tseq.topic.label);
            if z as usize == zy.len() {
                zy.push(BTreeSet::new());
            }

            let mut topic_ev = Event::new(z);
            topic_ev.fval = tseq.topic.fval;
            for attr in &tseq.topic.obs {
                let fid = topic_attrs.intern(&attr.name);
                topic_store.record_obs(z, fid, attr.value)?;
                topic_ev.obs.push((fid, attr.value));
            }

            let mut seq = Sequence::new();
            let mut prev = BOUNDARY;
            for sev in &tseq.seq {
                let y = labels.intern(&sev.label);
                zy[z as usize].insert(y);
                let mut ev = Event::new(y);
                ev.fval = sev.fval;
                for attr in &sev.obs {
                    let fid = attrs.intern(&attr.name);
                    store.record_obs(y, fid, attr.value)?;
                    ev.obs.push((fid, attr.value));
                }
                store.record_trans(prev, y)?;
                prev = y;
                seq.push(ev);
            }
            examples.append(TriSequence {
                topic: topic_ev,
                seq,
            })?;
        }

        topic_store.finalize(topics.len(), topic_attrs.len(), None)?;
        store.finalize(labels.len(), attrs.len(), self.opts.tie_threshold)?;

        let zy_index: Vec<Vec<u32>> = zy.into_iter().map(|s| s.into_iter().collect()).collect();
        let mut yz_index: Vec<Vec<u32>> = vec![Vec::new(); labels.len()];
        for (z, subset) in zy_index.iter().enumerate() {
            for &y in subset {
                yz_index[y as usize].push(z as u32);
            }
        }

        let mut model = Model::empty(self.kind);
        model.labels = labels;
        model.attrs = attrs;
        model.topics = topics;
        model.topic_attrs = topic_attrs;
        model.topic_store = topic_store;
        model.stores.push(store);
        model.zy_index = zy_index;
        model.yz_index = yz_index;
        model.build_zy_pos();
        Ok((
            model,
            TrainData::Tri {
                examples,
                per_topic: Vec::new(),
            },
        ))
    }

    fn lbfgs_params(&self) -> LbfgsParams {
        LbfgsParams {
            epsilon: self.opts.epsilon,
            delta: self.opts.delta,
            l1: (self.opts.estimation == Estimation::LbfgsL1).then_some(self.opts.l1_c),
            ..LbfgsParams::default()
        }
    }

    fn fit(&self, logger: &mut Logger, mut model: Model, data: TrainData) -> Result<Trained> {
        let n = model.num_weights();
        let mut theta = vec![0.0; n];
        let mut grad = vec![0.0; n];
        let mut iterations = 0;
        let mut outcome = FitOutcome::MaxIterReached;

        {
            let mut evaluator = Evaluator::new(&mut model, &data, &self.opts);

            if self.opts.pl_init {
                if self.kind == ModelKind::MaxEnt {
                    logger.report(
                        1,
                        format_args!("warm start skipped: events are already independent"),
                    );
                } else {
                    let mut opt = Lbfgs::new(n, self.lbfgs_params());
                    for it in 0..self.opts.pl_iter {
                        if self.stop.load(Ordering::Relaxed) {
                            break;
                        }
                        let loss = evaluator.evaluate_pl(&theta, &mut grad)?;
                        logger.report(
                            3,
                            format_args!("warm start iter {:>3}  loss = {:.6}", it + 1, loss),
                        );
                        match opt.step(&mut theta, loss, &grad) {
                            Outcome::Continue => {}
                            Outcome::Converged => break,
                            Outcome::Failed => {
                                logger.report(
                                    1,
                                    format_args!("warm start abandoned at its best iterate"),
                                );
                                break;
                            }
                        }
                    }
                    opt.restore_best(&mut theta);
                }
            }

            let mut opt = Lbfgs::new(n, self.lbfgs_params());
            for it in 0..self.opts.max_iter {
                if self.stop.load(Ordering::Relaxed) {
                    outcome = FitOutcome::Stopped;
                    break;
                }
                let loss = evaluator.evaluate(&theta, &mut grad)?;
                if evaluator.skipped() > 0 {
                    logger.report(
                        1,
                        format_args!(
                            "warning: {} examples skipped for numerical underflow",
                            evaluator.skipped()
                        ),
                    );
                }
                let gnorm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
                logger.report(
                    2,
                    format_args!("iter {:>4}  loss = {:.6}  |g| = {:.6e}", it + 1, loss, gnorm),
                );
                iterations = it + 1;
                match opt.step(&mut theta, loss, &grad) {
                    Outcome::Continue => {}
                    Outcome::Converged => {
                        outcome = FitOutcome::Converged;
                        break;
                    }
                    Outcome::Failed => {
                        outcome = FitOutcome::Failed;
                        break;
                    }
                }
            }
            opt.restore_best(&mut theta);
        }

        model.set_weights(&theta);
        Ok(Trained {
            model,
            outcome,
            iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::StringEvent;

    fn seq_dataset() -> Dataset<StringSequence> {
        let mut data = Dataset::new();
        let rows = [
            vec![("A", vec!["w=a", "c=1"]), ("B", vec!["w=b"])],
            vec![("A", vec!["w=a"]), ("B", vec!["w=b", "c=1"]), ("A", vec!["w=a"])],
            vec![("B", vec!["w=b"])],
        ];
        for row in rows {
            let mut seq = StringSequence::new();
            for (label, feats) in row {
                let mut ev = StringEvent::new(label);
                for f in feats {
                    ev.obs.push(f.into());
                }
                seq.push(ev);
            }
            data.append(seq).unwrap();
        }
        data
    }

    fn tri_dataset() -> Dataset<TriStringSequence> {
        let mut data = Dataset::new();
        let rows = [
            ("FLIGHT", vec!["t=go"], vec![("FROM-B", vec!["w=denver"]), ("TO-B", vec!["w=boston"])]),
            ("FLIGHT", vec!["t=fly"], vec![("FROM-B", vec!["w=austin"])]),
            ("HOTEL", vec!["t=book"], vec![("CITY-B", vec!["w=york"]), ("DATE-B", vec!["w=friday"])]),
            ("HOTEL", vec!["t=room"], vec![("CITY-B", vec!["w=paris"])]),
        ];
        for (topic, tfeats, toks) in rows {
            let mut topic_ev = StringEvent::new(topic);
            for f in tfeats {
                topic_ev.obs.push(f.into());
            }
            let mut seq = StringSequence::new();
            for (label, feats) in toks {
                let mut ev = StringEvent::new(label);
                for f in feats {
                    ev.obs.push(f.into());
                }
                seq.push(ev);
            }
            data.append(TriStringSequence {
                topic: topic_ev,
                seq,
            })
            .unwrap();
        }
        data
    }

    fn deterministic_theta(n: usize) -> Vec<f64> {
        (0..n).map(|i| ((i * 7 % 13) as f64) * 0.05 - 0.3).collect()
    }

    fn check_gradient(kind: ModelKind, mut model: Model, data: TrainData) {
        let opts = TrainOpts {
            l2_sigma: 1.0,
            ..TrainOpts::default()
        };
        let n = model.num_weights();
        assert!(n > 0, "{kind:?} produced no weights");
        let mut evaluator = Evaluator::new(&mut model, &data, &opts);
        let theta = deterministic_theta(n);
        let mut grad = vec![0.0; n];
        evaluator.evaluate(&theta, &mut grad).unwrap();

        let eps = 1e-4;
        let mut scratch = vec![0.0; n];
        for i in 0..n {
            let mut plus = theta.clone();
            plus[i] += eps;
            let lp = evaluator.evaluate(&plus, &mut scratch).unwrap();
            let mut minus = theta.clone();
            minus[i] -= eps;
            let lm = evaluator.evaluate(&minus, &mut scratch).unwrap();
            let fd = (lp - lm) / (2.0 * eps);
            assert!(
                (fd - grad[i]).abs() < 1e-4,
                "{kind:?} slot {i}: finite difference {fd} vs gradient {}",
                grad[i]
            );
        }
    }

    #[test]
    fn test_gradient_matches_finite_difference_maxent() {
        let trainer = Trainer::new(ModelKind::MaxEnt, TrainOpts::default()).unwrap();
        let (model, data) = trainer.intern_sequences(&seq_dataset()).unwrap();
        check_gradient(ModelKind::MaxEnt, model, data);
    }

    #[test]
    fn test_gradient_matches_finite_difference_crf() {
        let trainer = Trainer::new(ModelKind::Crf, TrainOpts::default()).unwrap();
        let (model, data) = trainer.intern_sequences(&seq_dataset()).unwrap();
        check_gradient(ModelKind::Crf, model, data);
    }

    #[test]
    fn test_gradient_matches_finite_difference_tricrf1() {
        let trainer = Trainer::new(ModelKind::TriCrf1, TrainOpts::default()).unwrap();
        let (model, data) = trainer.intern_tri_per_topic(&tri_dataset(), true).unwrap();
        check_gradient(ModelKind::TriCrf1, model, data);
    }

    #[test]
    fn test_gradient_matches_finite_difference_tricrf2() {
        let trainer = Trainer::new(ModelKind::TriCrf2, TrainOpts::default()).unwrap();
        let (model, data) = trainer.intern_tri_shared(&tri_dataset()).unwrap();
        check_gradient(ModelKind::TriCrf2, model, data);
    }

    #[test]
    fn test_gradient_matches_finite_difference_tricrf3() {
        let trainer = Trainer::new(ModelKind::TriCrf3, TrainOpts::default()).unwrap();
        let (model, data) = trainer.intern_tri_per_topic(&tri_dataset(), false).unwrap();
        check_gradient(ModelKind::TriCrf3, model, data);
    }

    #[test]
    fn test_cached_counts_match_recomputation() {
        let trainer = Trainer::new(ModelKind::Crf, TrainOpts::default()).unwrap();
        let (model, data) = trainer.intern_sequences(&seq_dataset()).unwrap();
        let store = &model.stores[0];

        let mut recomputed = vec![0.0; store.num_weights()];
        let TrainData::Seq(examples) = &data else {
            unreachable!()
        };
        for seq in examples.iter() {
            let mut prev = BOUNDARY;
            for ev in seq {
                for &(fid, val) in &ev.obs {
                    let widx = store
                        .obs_index_of(ev.label)
                        .iter()
                        .find(|&&(f, _)| f == fid)
                        .unwrap()
                        .1;
                    recomputed[widx as usize] += val;
                }
                recomputed[store.trans_widx(prev, ev.label) as usize] += 1.0;
                prev = ev.label;
            }
        }
        // bit-for-bit: the cache was accumulated in the same order
        assert_eq!(store.counts(), recomputed.as_slice());
    }

    #[test]
    fn test_pl_gradient_matches_finite_difference() {
        let trainer = Trainer::new(ModelKind::Crf, TrainOpts::default()).unwrap();
        let (mut model, data) = trainer.intern_sequences(&seq_dataset()).unwrap();
        let opts = TrainOpts {
            l2_sigma: 1.0,
            ..TrainOpts::default()
        };
        let n = model.num_weights();
        let mut evaluator = Evaluator::new(&mut model, &data, &opts);
        let theta = deterministic_theta(n);
        let mut grad = vec![0.0; n];
        evaluator.evaluate_pl(&theta, &mut grad).unwrap();

        let eps = 1e-4;
        let mut scratch = vec![0.0; n];
        for i in 0..n {
            let mut plus = theta.clone();
            plus[i] += eps;
            let lp = evaluator.evaluate_pl(&plus, &mut scratch).unwrap();
            let mut minus = theta.clone();
            minus[i] -= eps;
            let lm = evaluator.evaluate_pl(&minus, &mut scratch).unwrap();
            let fd = (lp - lm) / (2.0 * eps);
            assert!(
                (fd - grad[i]).abs() < 1e-4,
                "slot {i}: finite difference {fd} vs gradient {}",
                grad[i]
            );
        }
    }
}
