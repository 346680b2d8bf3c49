use tricrf::{
    Attribute, Dataset, Estimation, Logger, ModelKind, StringEvent, StringSequence, Tagger,
    TrainOpts, Trainer,
};

fn xor_dataset() -> Dataset<StringSequence> {
    let mut data = Dataset::new();
    for (label, feats) in [("+", ["a", "b"]), ("-", ["a", "c"])] {
        let mut ev = StringEvent::new(label);
        for f in feats {
            ev.obs.push(f.into());
        }
        data.append(vec![ev]).unwrap();
    }
    data
}

#[test]
fn test_maxent_xor() {
    let opts = TrainOpts {
        estimation: Estimation::LbfgsL2,
        l2_sigma: 1.0,
        max_iter: 50,
        ..TrainOpts::default()
    };
    let trainer = Trainer::new(ModelKind::MaxEnt, opts).unwrap();
    let mut logger = Logger::new(0);
    let trained = trainer.train_sequences(&mut logger, &xor_dataset()).unwrap();

    let mut tagger = Tagger::new(&trained.model).unwrap();
    let plus = tagger
        .tag(&[vec![Attribute::from("a"), Attribute::from("b")]], true)
        .unwrap();
    assert_eq!(plus.labels, vec!["+"]);
    let minus = tagger
        .tag(&[vec![Attribute::from("a"), Attribute::from("c")]], true)
        .unwrap();
    assert_eq!(minus.labels, vec!["-"]);

    // Posterior column is populated and is a probability
    let p = plus.posteriors.unwrap()[0];
    assert!(p > 0.5 && p <= 1.0);
}

#[test]
fn test_maxent_l1_sparsity() {
    let opts = TrainOpts {
        estimation: Estimation::LbfgsL1,
        l1_c: 10.0,
        max_iter: 100,
        ..TrainOpts::default()
    };
    let trainer = Trainer::new(ModelKind::MaxEnt, opts).unwrap();
    let mut logger = Logger::new(0);
    let trained = trainer.train_sequences(&mut logger, &xor_dataset()).unwrap();

    let weights = trained.model.weights();
    assert!(
        weights.iter().any(|&w| w == 0.0),
        "expected at least one exactly-zero weight, got {weights:?}"
    );
}

#[test]
fn test_maxent_unseen_feature_is_ignored() {
    let opts = TrainOpts {
        l2_sigma: 1.0,
        max_iter: 50,
        ..TrainOpts::default()
    };
    let trainer = Trainer::new(ModelKind::MaxEnt, opts).unwrap();
    let mut logger = Logger::new(0);
    let trained = trainer.train_sequences(&mut logger, &xor_dataset()).unwrap();

    let mut tagger = Tagger::new(&trained.model).unwrap();
    let prediction = tagger
        .tag(
            &[vec![Attribute::from("b"), Attribute::from("never-seen")]],
            false,
        )
        .unwrap();
    assert_eq!(prediction.labels, vec!["+"]);
}
