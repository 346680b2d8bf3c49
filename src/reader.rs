//! Reading of blank-line-separated training and test data.
//!
//! One token per line; the first whitespace token is the label name, the
//! remaining tokens are feature names with an optional `:value` suffix
//! (missing suffix means the event's default value). For triangular data the
//! first line of each record carries the topic label and the topic features.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::dataset::{Attribute, Dataset, StringEvent, StringSequence, TriStringSequence};
use crate::errors::{Result, TricrfError};

/// Read a dataset of plain label/feature sequences
pub fn read_sequences(path: &Path) -> Result<Dataset<StringSequence>> {
    let file = File::open(path)?;
    read_sequences_from(BufReader::new(file), &path.display().to_string())
}

/// Read a dataset of topic-headed triangular sequences
pub fn read_tri_sequences(path: &Path) -> Result<Dataset<TriStringSequence>> {
    let file = File::open(path)?;
    read_tri_sequences_from(BufReader::new(file), &path.display().to_string())
}

pub fn read_sequences_from<R: BufRead>(reader: R, name: &str) -> Result<Dataset<StringSequence>> {
    let mut data = Dataset::new();
    let mut seq = StringSequence::new();
    let mut last = 0;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        last = lineno + 1;
        if line.trim().is_empty() {
            if !seq.is_empty() {
                data.append(std::mem::take(&mut seq))?;
            }
            continue;
        }
        seq.push(parse_event(&line, name, lineno + 1)?);
    }
    if !seq.is_empty() {
        data.append(seq)?;
    }
    if data.is_empty() {
        return Err(TricrfError::format(
            name.to_string(),
            last,
            "file contains no examples".to_string(),
        ));
    }
    Ok(data)
}

pub fn read_tri_sequences_from<R: BufRead>(
    reader: R,
    name: &str,
) -> Result<Dataset<TriStringSequence>> {
    let mut data = Dataset::new();
    let mut topic: Option<StringEvent> = None;
    let mut topic_line = 0;
    let mut seq = StringSequence::new();
    let mut last = 0;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        last = lineno + 1;
        if line.trim().is_empty() {
            if let Some(topic) = topic.take() {
                if seq.is_empty() {
                    return Err(TricrfError::format(
                        name.to_string(),
                        topic_line,
                        "topic line is not followed by a token sequence".to_string(),
                    ));
                }
                data.append(TriStringSequence {
                    topic,
                    seq: std::mem::take(&mut seq),
                })?;
            }
            continue;
        }
        let event = parse_event(&line, name, lineno + 1)?;
        if topic.is_none() {
            // First line of a record encodes the topic
            topic = Some(event);
            topic_line = lineno + 1;
        } else {
            seq.push(event);
        }
    }
    if let Some(topic) = topic {
        if seq.is_empty() {
            return Err(TricrfError::format(
                name.to_string(),
                topic_line,
                "topic line is not followed by a token sequence".to_string(),
            ));
        }
        data.append(TriStringSequence { topic, seq })?;
    }
    if data.is_empty() {
        return Err(TricrfError::format(
            name.to_string(),
            last,
            "file contains no examples".to_string(),
        ));
    }
    Ok(data)
}

fn parse_event(line: &str, name: &str, lineno: usize) -> Result<StringEvent> {
    let mut tokens = line.split_whitespace();
    let label = tokens.next().ok_or_else(|| {
        TricrfError::format(name.to_string(), lineno, "missing label".to_string())
    })?;
    let mut event = StringEvent::new(label);
    for token in tokens {
        event.obs.push(parse_feature(token, event.fval));
    }
    Ok(event)
}

/// Split a `name:value` token; a suffix that does not parse as a number is
/// part of the feature name.
fn parse_feature(token: &str, default: f64) -> Attribute {
    if let Some((name, value)) = token.rsplit_once(':') {
        if let Ok(value) = value.parse::<f64>() {
            if !name.is_empty() {
                return Attribute::new(name, value);
            }
        }
    }
    Attribute::new(token, default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_sequences() {
        let text = "\
A word=denver caps:0.5
B word=york

A word=paris
";
        let data = read_sequences_from(text.as_bytes(), "test").unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.num_events(), 3);
        let first = data.get(0).unwrap();
        assert_eq!(first[0].label, "A");
        assert_eq!(first[0].obs[0], Attribute::new("word=denver", 1.0));
        assert_eq!(first[0].obs[1], Attribute::new("caps", 0.5));
        assert_eq!(first[1].label, "B");
    }

    #[test]
    fn test_read_tri_sequences() {
        let text = "\
FLIGHT t=go t=denver
NONE word=i
FROMLOC.CITY_NAME-B word=denver

HOTEL t=book
CITY_NAME-B word=york
";
        let data = read_tri_sequences_from(text.as_bytes(), "test").unwrap();
        assert_eq!(data.len(), 2);
        let first = data.get(0).unwrap();
        assert_eq!(first.topic.label, "FLIGHT");
        assert_eq!(first.topic.obs.len(), 2);
        assert_eq!(first.seq.len(), 2);
        assert_eq!(first.seq[1].label, "FROMLOC.CITY_NAME-B");
    }

    #[test]
    fn test_topic_without_tokens_is_an_error() {
        let text = "FLIGHT t=go\n\nHOTEL t=book\nCITY_NAME-B word=york\n";
        let err = read_tri_sequences_from(text.as_bytes(), "bad").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bad:1"), "{msg}");
    }

    #[test]
    fn test_feature_value_suffix() {
        assert_eq!(parse_feature("word=a:2.5", 1.0), Attribute::new("word=a", 2.5));
        assert_eq!(parse_feature("word=a:b", 1.0), Attribute::new("word=a:b", 1.0));
        assert_eq!(parse_feature("plain", 1.0), Attribute::new("plain", 1.0));
    }

    #[test]
    fn test_empty_file_is_an_error() {
        assert!(read_sequences_from("\n\n".as_bytes(), "empty").is_err());
    }
}
