use tricrf::{
    Attribute, Dataset, Logger, ModelKind, StringEvent, StringSequence, Tagger, TrainOpts, Trainer,
};

fn transition_dataset() -> Dataset<StringSequence> {
    // 100 copies of the bigram A -> B over an uninformative observation
    let mut data = Dataset::new();
    for _ in 0..100 {
        let mut seq = StringSequence::new();
        for label in ["A", "B"] {
            let mut ev = StringEvent::new(label);
            ev.obs.push("w".into());
            seq.push(ev);
        }
        data.append(seq).unwrap();
    }
    data
}

#[test]
fn test_transition_dominates_viterbi() {
    let opts = TrainOpts {
        l2_sigma: 1.0,
        max_iter: 50,
        ..TrainOpts::default()
    };
    let trainer = Trainer::new(ModelKind::Crf, opts).unwrap();
    let mut logger = Logger::new(0);
    let trained = trainer
        .train_sequences(&mut logger, &transition_dataset())
        .unwrap();

    // Both tokens look the same; only the learned transitions can order them
    let mut tagger = Tagger::new(&trained.model).unwrap();
    let xseq = vec![vec![Attribute::from("w")], vec![Attribute::from("w")]];
    let prediction = tagger.tag(&xseq, false).unwrap();
    assert_eq!(prediction.labels, vec!["A", "B"]);
}

#[test]
fn test_marginal_confidence_sums_to_one_side() {
    let opts = TrainOpts {
        l2_sigma: 1.0,
        max_iter: 50,
        ..TrainOpts::default()
    };
    let trainer = Trainer::new(ModelKind::Crf, opts).unwrap();
    let mut logger = Logger::new(0);
    let trained = trainer
        .train_sequences(&mut logger, &transition_dataset())
        .unwrap();

    let mut tagger = Tagger::new(&trained.model).unwrap();
    let xseq = vec![vec![Attribute::from("w")], vec![Attribute::from("w")]];
    let prediction = tagger.tag(&xseq, true).unwrap();
    let posteriors = prediction.posteriors.unwrap();
    assert_eq!(posteriors.len(), 2);
    for p in posteriors {
        assert!(p > 0.5 && p <= 1.0 + 1e-12);
    }
}

#[test]
fn test_training_is_deterministic() {
    let mut weights = Vec::new();
    for _ in 0..2 {
        let opts = TrainOpts {
            l2_sigma: 2.0,
            max_iter: 30,
            ..TrainOpts::default()
        };
        let trainer = Trainer::new(ModelKind::Crf, opts).unwrap();
        let mut logger = Logger::new(0);
        let trained = trainer
            .train_sequences(&mut logger, &transition_dataset())
            .unwrap();
        weights.push(trained.model.weights());
    }
    assert_eq!(weights[0], weights[1]);
}

#[test]
fn test_warm_start_reaches_the_same_labels() {
    let opts = TrainOpts {
        l2_sigma: 1.0,
        max_iter: 50,
        pl_init: true,
        pl_iter: 10,
        ..TrainOpts::default()
    };
    let trainer = Trainer::new(ModelKind::Crf, opts).unwrap();
    let mut logger = Logger::new(0);
    let trained = trainer
        .train_sequences(&mut logger, &transition_dataset())
        .unwrap();

    let mut tagger = Tagger::new(&trained.model).unwrap();
    let xseq = vec![vec![Attribute::from("w")], vec![Attribute::from("w")]];
    assert_eq!(tagger.tag(&xseq, false).unwrap().labels, vec!["A", "B"]);
}
