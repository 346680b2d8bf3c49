//! Configuration-file surface.
//!
//! A configuration is a `key = value` file with `#` comments. Recognized
//! keys: `model_type`, `mode`, `train_file`, `dev_file`, `test_file`,
//! `model_file`, `output_file`, `log_file`, `estimation`, `l1_prior`,
//! `l2_prior`, `iter`, `initialize`, `initialize_iter`, `confidence`,
//! `log_mode`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{Result, TricrfError};
use crate::model::ModelKind;
use crate::train::Estimation;

/// What a run should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Test,
    Both,
}

/// Parsed configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub model_type: ModelKind,
    pub mode: Mode,
    pub train_file: Option<PathBuf>,
    pub dev_file: Option<PathBuf>,
    pub test_file: Option<PathBuf>,
    pub model_file: PathBuf,
    pub output_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub estimation: Estimation,
    pub l1_prior: f64,
    pub l2_prior: f64,
    pub iter: usize,
    pub initialize_pl: bool,
    pub initialize_iter: usize,
    pub confidence: bool,
    pub log_mode: u32,
}

impl Config {
    /// Parse a configuration file
    pub fn parse(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse_str(&text, &path.display().to_string())
    }

    pub fn parse_str(text: &str, name: &str) -> Result<Self> {
        let mut model_type = None;
        let mut mode = Mode::Both;
        let mut train_file = None;
        let mut dev_file = None;
        let mut test_file = None;
        let mut model_file = None;
        let mut output_file = None;
        let mut log_file = None;
        let mut estimation = Estimation::LbfgsL2;
        let mut l1_prior = 1.0;
        let mut l2_prior = 20.0;
        let mut iter = 100;
        let mut initialize_pl = false;
        let mut initialize_iter = 30;
        let mut confidence = false;
        let mut log_mode = 1;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                TricrfError::format(name, lineno + 1, "expected `key = value`")
            })?;
            let key = key.trim();
            let value = value.trim();
            let bad = |msg: &str| {
                TricrfError::format(name.to_string(), lineno + 1, format!("{key}: {msg}"))
            };
            match key {
                "model_type" => {
                    model_type =
                        Some(ModelKind::from_name(value).ok_or_else(|| bad("unknown model type"))?);
                }
                "mode" => {
                    mode = match value {
                        "train" => Mode::Train,
                        "test" => Mode::Test,
                        "both" => Mode::Both,
                        _ => return Err(bad("expected train, test, or both")),
                    };
                }
                "train_file" => train_file = Some(PathBuf::from(value)),
                "dev_file" => dev_file = Some(PathBuf::from(value)),
                "test_file" => test_file = Some(PathBuf::from(value)),
                "model_file" => model_file = Some(PathBuf::from(value)),
                "output_file" => output_file = Some(PathBuf::from(value)),
                "log_file" => log_file = Some(PathBuf::from(value)),
                "estimation" => {
                    estimation = match value {
                        "LBFGS-L1" => Estimation::LbfgsL1,
                        "LBFGS-L2" => Estimation::LbfgsL2,
                        _ => return Err(bad("expected LBFGS-L1 or LBFGS-L2")),
                    };
                }
                "l1_prior" => l1_prior = value.parse().map_err(|_| bad("expected a number"))?,
                "l2_prior" => l2_prior = value.parse().map_err(|_| bad("expected a number"))?,
                "iter" => iter = value.parse().map_err(|_| bad("expected an integer"))?,
                "initialize" => {
                    initialize_pl = match value {
                        "PL" => true,
                        "none" => false,
                        _ => return Err(bad("expected PL or none")),
                    };
                }
                "initialize_iter" => {
                    initialize_iter = value.parse().map_err(|_| bad("expected an integer"))?;
                }
                "confidence" => {
                    confidence = match value {
                        "true" | "1" | "yes" => true,
                        "false" | "0" | "no" => false,
                        _ => return Err(bad("expected true or false")),
                    };
                }
                "log_mode" => {
                    log_mode = value.parse().map_err(|_| bad("expected 0..3"))?;
                    if log_mode > 3 {
                        return Err(bad("expected 0..3"));
                    }
                }
                _ => return Err(bad("unknown key")),
            }
        }

        let model_type = model_type.ok_or_else(|| {
            TricrfError::format(name.to_string(), 0, "model_type is required".to_string())
        })?;
        let model_file = model_file.ok_or_else(|| {
            TricrfError::format(name.to_string(), 0, "model_file is required".to_string())
        })?;
        let config = Self {
            model_type,
            mode,
            train_file,
            dev_file,
            test_file,
            model_file,
            output_file,
            log_file,
            estimation,
            l1_prior,
            l2_prior,
            iter,
            initialize_pl,
            initialize_iter,
            confidence,
            log_mode,
        };
        config.validate(name)?;
        Ok(config)
    }

    fn validate(&self, name: &str) -> Result<()> {
        let missing =
            |msg: &str| TricrfError::format(name.to_string(), 0, msg.to_string());
        if matches!(self.mode, Mode::Train | Mode::Both) && self.train_file.is_none() {
            return Err(missing("train mode requires train_file"));
        }
        if matches!(self.mode, Mode::Test | Mode::Both) && self.test_file.is_none() {
            return Err(missing("test mode requires test_file"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let text = "\
# training setup
model_type = TriCRF1
mode = both
train_file = data/train.txt
test_file = data/test.txt
model_file = model.bin
estimation = LBFGS-L2
l2_prior = 2.0
iter = 50
initialize = PL
initialize_iter = 10
confidence = true
log_mode = 2
";
        let config = Config::parse_str(text, "test.cfg").unwrap();
        assert_eq!(config.model_type, ModelKind::TriCrf1);
        assert_eq!(config.mode, Mode::Both);
        assert_eq!(config.estimation, Estimation::LbfgsL2);
        assert_eq!(config.l2_prior, 2.0);
        assert_eq!(config.iter, 50);
        assert!(config.initialize_pl);
        assert_eq!(config.initialize_iter, 10);
        assert!(config.confidence);
        assert_eq!(config.log_mode, 2);
    }

    #[test]
    fn test_unknown_key_reports_line() {
        let text = "model_type = CRF\nmodel_file = m.bin\nbogus = 1\n";
        let err = Config::parse_str(text, "bad.cfg").unwrap_err();
        assert!(err.to_string().contains("bad.cfg:3"));
    }

    #[test]
    fn test_mode_requirements() {
        let text = "model_type = CRF\nmodel_file = m.bin\nmode = train\n";
        assert!(Config::parse_str(text, "c").is_err());
        let text = "model_type = CRF\nmodel_file = m.bin\nmode = train\ntrain_file = t.txt\n";
        assert!(Config::parse_str(text, "c").is_ok());
    }
}
