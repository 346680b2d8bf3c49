use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use structopt::StructOpt;

use tricrf::reader;
use tricrf::{
    Config, Dataset, FitOutcome, Logger, Mode, Model, Prediction, StringSequence, Tagger,
    TrainOpts, Trainer, TriStringSequence, TricrfError,
};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "tricrf",
    about = "Trains and applies triangular-chain CRF models for spoken language understanding."
)]
struct Opt {
    /// Configuration file describing the run
    #[structopt(parse(from_os_str))]
    config: PathBuf,
}

fn main() -> ExitCode {
    let opt = Opt::from_args();
    match run(&opt) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            match e {
                TricrfError::Optimizer(_) => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

fn run(opt: &Opt) -> tricrf::Result<()> {
    let config = Config::parse(&opt.config)?;
    let mut logger = match &config.log_file {
        Some(path) => Logger::with_file(config.log_mode, path)?,
        None => Logger::new(config.log_mode),
    };

    let mut trained_model = None;
    if matches!(config.mode, Mode::Train | Mode::Both) {
        trained_model = Some(train(&config, &mut logger)?);
    }
    if matches!(config.mode, Mode::Test | Mode::Both) {
        let model = match trained_model {
            Some(model) => model,
            None => {
                let model = Model::load(&config.model_file)?;
                if model.kind() != config.model_type {
                    return Err(TricrfError::invalid_model(format!(
                        "model file holds a {} model but the configuration asks for {}",
                        model.kind().name(),
                        config.model_type.name()
                    )));
                }
                model
            }
        };
        test(&config, &mut logger, &model)?;
    }
    Ok(())
}

fn train(config: &Config, logger: &mut Logger) -> tricrf::Result<Model> {
    let opts = TrainOpts {
        estimation: config.estimation,
        l1_c: config.l1_prior,
        l2_sigma: config.l2_prior,
        max_iter: config.iter,
        pl_init: config.initialize_pl,
        pl_iter: config.initialize_iter,
        ..TrainOpts::default()
    };
    let trainer = Trainer::new(config.model_type, opts)?;
    let train_file = config
        .train_file
        .as_ref()
        .ok_or_else(|| TricrfError::invalid_argument("train mode requires train_file"))?;

    let trained = if config.model_type.is_triangular() {
        let data = reader::read_tri_sequences(train_file)?;
        trainer.train_tri(logger, &data)?
    } else {
        let data = reader::read_sequences(train_file)?;
        trainer.train_sequences(logger, &data)?
    };

    logger.report(
        2,
        format_args!(
            "training finished after {} evaluations ({:?})",
            trained.iterations, trained.outcome
        ),
    );
    if let Some(dev_file) = &config.dev_file {
        accuracy_pass(config, logger, &trained.model, dev_file, "dev")?;
    }
    trained.model.save(&config.model_file)?;
    logger.report(
        2,
        format_args!("model written to {}", config.model_file.display()),
    );

    if trained.outcome == FitOutcome::Failed {
        return Err(TricrfError::optimizer(
            "estimation failed; the best-so-far weights were saved",
        ));
    }
    Ok(trained.model)
}

fn test(config: &Config, logger: &mut Logger, model: &Model) -> tricrf::Result<()> {
    let test_file = config
        .test_file
        .as_ref()
        .ok_or_else(|| TricrfError::invalid_argument("test mode requires test_file"))?;
    let mut out: Box<dyn Write> = match &config.output_file {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut tagger = Tagger::new(model)?;

    let mut correct = 0usize;
    let mut total = 0usize;
    let mut topic_correct = 0usize;
    let mut topic_total = 0usize;

    if config.model_type.is_triangular() {
        let data: Dataset<TriStringSequence> = reader::read_tri_sequences(test_file)?;
        for ex in data.iter() {
            let xseq: Vec<&[tricrf::Attribute]> =
                ex.seq.iter().map(|ev| ev.obs.as_slice()).collect();
            let prediction = tagger.tag_tri(&ex.topic.obs, &xseq, config.confidence)?;
            write_prediction(&mut out, &prediction)?;
            topic_total += 1;
            if prediction.topic.as_deref() == Some(ex.topic.label.as_str()) {
                topic_correct += 1;
            }
            total += ex.seq.len();
            for (ev, predicted) in ex.seq.iter().zip(&prediction.labels) {
                if &ev.label == predicted {
                    correct += 1;
                }
            }
        }
        logger.report(
            2,
            format_args!(
                "topic accuracy {}/{} ({:.4})",
                topic_correct,
                topic_total,
                topic_correct as f64 / topic_total.max(1) as f64
            ),
        );
    } else {
        let data: Dataset<StringSequence> = reader::read_sequences(test_file)?;
        for seq in data.iter() {
            let xseq: Vec<&[tricrf::Attribute]> =
                seq.iter().map(|ev| ev.obs.as_slice()).collect();
            let prediction = tagger.tag(&xseq, config.confidence)?;
            write_prediction(&mut out, &prediction)?;
            total += seq.len();
            for (ev, predicted) in seq.iter().zip(&prediction.labels) {
                if &ev.label == predicted {
                    correct += 1;
                }
            }
        }
    }
    out.flush()?;
    logger.report(
        2,
        format_args!(
            "token accuracy {}/{} ({:.4})",
            correct,
            total,
            correct as f64 / total.max(1) as f64
        ),
    );
    Ok(())
}

/// Held-out accuracy report without prediction output.
fn accuracy_pass(
    config: &Config,
    logger: &mut Logger,
    model: &Model,
    file: &std::path::Path,
    tag: &str,
) -> tricrf::Result<()> {
    let mut tagger = Tagger::new(model)?;
    let mut correct = 0usize;
    let mut total = 0usize;

    if config.model_type.is_triangular() {
        let data: Dataset<TriStringSequence> = reader::read_tri_sequences(file)?;
        for ex in data.iter() {
            let xseq: Vec<&[tricrf::Attribute]> =
                ex.seq.iter().map(|ev| ev.obs.as_slice()).collect();
            let prediction = tagger.tag_tri(&ex.topic.obs, &xseq, false)?;
            total += ex.seq.len();
            for (ev, predicted) in ex.seq.iter().zip(&prediction.labels) {
                if &ev.label == predicted {
                    correct += 1;
                }
            }
        }
    } else {
        let data: Dataset<StringSequence> = reader::read_sequences(file)?;
        for seq in data.iter() {
            let xseq: Vec<&[tricrf::Attribute]> =
                seq.iter().map(|ev| ev.obs.as_slice()).collect();
            let prediction = tagger.tag(&xseq, false)?;
            total += seq.len();
            for (ev, predicted) in seq.iter().zip(&prediction.labels) {
                if &ev.label == predicted {
                    correct += 1;
                }
            }
        }
    }
    logger.report(
        2,
        format_args!(
            "{tag} token accuracy {}/{} ({:.4})",
            correct,
            total,
            correct as f64 / total.max(1) as f64
        ),
    );
    Ok(())
}

/// One label per line, a blank line after each example; the topic goes on
/// the first line of a block, confidences in a trailing `p=` column.
fn write_prediction<W: Write>(out: &mut W, prediction: &Prediction) -> tricrf::Result<()> {
    if let Some(topic) = &prediction.topic {
        match prediction.topic_posterior {
            Some(p) => writeln!(out, "{topic} p={p:.6}")?,
            None => writeln!(out, "{topic}")?,
        }
    }
    for (t, label) in prediction.labels.iter().enumerate() {
        match prediction.posteriors.as_ref().and_then(|p| p.get(t)) {
            Some(p) => writeln!(out, "{label} p={p:.6}")?,
            None => writeln!(out, "{label}")?,
        }
    }
    writeln!(out)?;
    Ok(())
}
