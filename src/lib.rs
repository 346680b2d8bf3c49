//! # tricrf
//!
//! Probabilistic sequence labeling for spoken language understanding.
//!
//! The flagship model is the triangular-chain conditional random field: a
//! jointly normalized log-linear model over a topic and a tag sequence given
//! an utterance. Three triangular variants are provided together with a
//! linear-chain CRF and a maximum-entropy baseline, all sharing the same
//! parameter store, L-BFGS optimizer, and forward-backward/Viterbi
//! inference machinery.
//!
//! # Examples
//!
//! ## Training
//!
//! ```no_run
//! use tricrf::{Dataset, Logger, ModelKind, StringEvent, TrainOpts, Trainer};
//!
//! # fn main() -> tricrf::Result<()> {
//! let mut data = Dataset::new();
//! let mut seq = Vec::new();
//! let mut ev = StringEvent::new("CITY_NAME-B");
//! ev.obs.push("word=denver".into());
//! seq.push(ev);
//! data.append(seq)?;
//!
//! let trainer = Trainer::new(ModelKind::Crf, TrainOpts::default())?;
//! let mut logger = Logger::new(1);
//! let trained = trainer.train_sequences(&mut logger, &data)?;
//! trained.model.save(std::path::Path::new("model.bin"))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Prediction
//!
//! ```no_run
//! use tricrf::{Attribute, Model, Tagger};
//!
//! # fn main() -> tricrf::Result<()> {
//! let model = Model::load(std::path::Path::new("model.bin"))?;
//! let mut tagger = Tagger::new(&model)?;
//! let xseq = vec![vec![Attribute::new("word=denver", 1.0)]];
//! let prediction = tagger.tag(&xseq, false)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod context;
mod dataset;
mod dictionary;
mod errors;
mod logger;
mod model;
mod params;
pub mod reader;
mod tagger;
pub mod train;

pub use self::config::{Config, Mode};
pub use self::context::{Context, Flag};
pub use self::dataset::{
    Attribute, Dataset, Event, ExampleLen, Sequence, StringEvent, StringSequence, TriSequence,
    TriStringSequence,
};
pub use self::dictionary::{Dictionary, DEFAULT_STATE, EDGE_FEATURE};
pub use self::errors::{Result, TricrfError};
pub use self::logger::Logger;
pub use self::model::{Model, ModelKind};
pub use self::params::{ParamStore, BOUNDARY};
pub use self::tagger::{Prediction, Tagger};
pub use self::train::{Estimation, FitOutcome, TrainOpts, Trained, Trainer};
