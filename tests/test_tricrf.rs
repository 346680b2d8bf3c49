use tricrf::{
    Dataset, Logger, ModelKind, StringEvent, StringSequence, Tagger, TrainOpts, Trainer,
    TriStringSequence,
};

/// Two topics with disjoint tag vocabularies and disjoint cue words.
fn dispatch_dataset() -> Dataset<TriStringSequence> {
    let mut data = Dataset::new();
    let flights = [
        vec![("FROMLOC.CITY_NAME-B", "word=denver"), ("TOLOC.CITY_NAME-B", "word=boston")],
        vec![("FROMLOC.CITY_NAME-B", "word=austin"), ("TOLOC.CITY_NAME-B", "word=reno")],
        vec![("FROMLOC.CITY_NAME-B", "word=denver"), ("TOLOC.CITY_NAME-B", "word=reno")],
    ];
    let hotels = [
        vec![("CITY_NAME-B", "word=york"), ("DATE-B", "word=friday")],
        vec![("CITY_NAME-B", "word=paris"), ("DATE-B", "word=monday")],
        vec![("CITY_NAME-B", "word=york"), ("DATE-B", "word=monday")],
    ];
    for toks in flights {
        data.append(example("FLIGHT", "t=fly", &toks)).unwrap();
    }
    for toks in hotels {
        data.append(example("HOTEL", "t=book", &toks)).unwrap();
    }
    data
}

fn example(topic: &str, topic_feat: &str, toks: &[(&str, &str)]) -> TriStringSequence {
    let mut topic_ev = StringEvent::new(topic);
    topic_ev.obs.push(topic_feat.into());
    let mut seq = StringSequence::new();
    for &(label, feat) in toks {
        let mut ev = StringEvent::new(label);
        ev.obs.push(feat.into());
        seq.push(ev);
    }
    TriStringSequence {
        topic: topic_ev,
        seq,
    }
}

fn check_dispatch(kind: ModelKind) {
    let opts = TrainOpts {
        l2_sigma: 1.0,
        max_iter: 60,
        ..TrainOpts::default()
    };
    let trainer = Trainer::new(kind, opts).unwrap();
    let mut logger = Logger::new(0);
    let data = dispatch_dataset();
    let trained = trainer.train_tri(&mut logger, &data).unwrap();

    let flight_tags = ["FROMLOC.CITY_NAME-B", "TOLOC.CITY_NAME-B"];
    let hotel_tags = ["CITY_NAME-B", "DATE-B"];

    let mut tagger = Tagger::new(&trained.model).unwrap();
    for ex in data.iter() {
        let xseq: Vec<&[tricrf::Attribute]> = ex.seq.iter().map(|ev| ev.obs.as_slice()).collect();
        let prediction = tagger.tag_tri(&ex.topic.obs, &xseq, true).unwrap();

        assert_eq!(
            prediction.topic.as_deref(),
            Some(ex.topic.label.as_str()),
            "{kind:?} mispredicted the topic"
        );
        let allowed: &[&str] = if ex.topic.label == "FLIGHT" {
            &flight_tags
        } else {
            &hotel_tags
        };
        for label in &prediction.labels {
            assert!(
                allowed.contains(&label.as_str()),
                "{kind:?} predicted {label} outside the {} domain",
                ex.topic.label
            );
        }
        let gold: Vec<&str> = ex.seq.iter().map(|ev| ev.label.as_str()).collect();
        assert_eq!(prediction.labels, gold, "{kind:?} mislabeled the tokens");

        let p = prediction.topic_posterior.unwrap();
        assert!(p > 0.5 && p <= 1.0 + 1e-12, "{kind:?} posterior {p}");
    }
}

#[test]
fn test_topic_dispatch_tricrf1() {
    check_dispatch(ModelKind::TriCrf1);
}

#[test]
fn test_topic_dispatch_tricrf2() {
    check_dispatch(ModelKind::TriCrf2);
}

#[test]
fn test_topic_dispatch_tricrf3() {
    check_dispatch(ModelKind::TriCrf3);
}

#[test]
fn test_tri_training_is_deterministic() {
    let mut weights = Vec::new();
    for _ in 0..2 {
        let opts = TrainOpts {
            l2_sigma: 1.0,
            max_iter: 25,
            ..TrainOpts::default()
        };
        let trainer = Trainer::new(ModelKind::TriCrf2, opts).unwrap();
        let mut logger = Logger::new(0);
        let trained = trainer.train_tri(&mut logger, &dispatch_dataset()).unwrap();
        weights.push(trained.model.weights());
    }
    assert_eq!(weights[0], weights[1]);
}

#[test]
fn test_tri_rejects_plain_training_data() {
    let trainer = Trainer::new(ModelKind::TriCrf1, TrainOpts::default()).unwrap();
    let mut logger = Logger::new(0);
    let mut data = Dataset::new();
    data.append(vec![StringEvent::new("A")]).unwrap();
    assert!(trainer.train_sequences(&mut logger, &data).is_err());
}
