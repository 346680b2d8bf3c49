use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::dictionary::Dictionary;
use crate::errors::{Result, TricrfError};
use crate::params::ParamStore;

const MAGIC: &[u8; 4] = b"TCRF";
const VERSION: u32 = 1;

/// The family of models sharing the parameter, optimizer, and inference
/// machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Log-linear classifier over independent events
    MaxEnt,
    /// Linear-chain CRF
    Crf,
    /// Triangular-chain CRF with per-topic parameters and dictionaries
    TriCrf1,
    /// Triangular-chain CRF with shared parameters and topic-filtered states
    TriCrf2,
    /// Triangular-chain CRF with a shared feature dictionary and per-topic
    /// transitions
    TriCrf3,
}

impl ModelKind {
    /// Numeric tag stored in model files
    pub fn tag(self) -> u32 {
        match self {
            Self::MaxEnt => 0,
            Self::Crf => 1,
            Self::TriCrf1 => 2,
            Self::TriCrf2 => 3,
            Self::TriCrf3 => 4,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::MaxEnt),
            1 => Some(Self::Crf),
            2 => Some(Self::TriCrf1),
            3 => Some(Self::TriCrf2),
            4 => Some(Self::TriCrf3),
            _ => None,
        }
    }

    /// Parse a configuration-file model name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "MaxEnt" => Some(Self::MaxEnt),
            "CRF" => Some(Self::Crf),
            "TriCRF1" => Some(Self::TriCrf1),
            "TriCRF2" => Some(Self::TriCrf2),
            "TriCRF3" => Some(Self::TriCrf3),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::MaxEnt => "MaxEnt",
            Self::Crf => "CRF",
            Self::TriCrf1 => "TriCRF1",
            Self::TriCrf2 => "TriCRF2",
            Self::TriCrf3 => "TriCRF3",
        }
    }

    /// Whether the model couples a topic variable with the tag chain
    pub fn is_triangular(self) -> bool {
        matches!(self, Self::TriCrf1 | Self::TriCrf2 | Self::TriCrf3)
    }
}

/// A trained (or in-training) model: dictionaries plus parameter blocks.
///
/// Chain models use `labels`/`attrs` and a single store. Triangular models
/// add the topic dictionaries and the topic parameter block; the per-topic
/// variants carry one sequence store per topic together with per-topic label
/// (and, for the string-feature variant, feature) dictionaries.
#[derive(Debug, Clone)]
pub struct Model {
    pub(crate) kind: ModelKind,
    /// Global tag dictionary (unused by the per-topic variants)
    pub(crate) labels: Dictionary,
    /// Global feature dictionary (per-topic for TriCRF1)
    pub(crate) attrs: Dictionary,
    /// Topic dictionary
    pub(crate) topics: Dictionary,
    /// Topic feature dictionary, disjoint from token features
    pub(crate) topic_attrs: Dictionary,
    /// Topic-level parameter block
    pub(crate) topic_store: ParamStore,
    /// Per-topic tag dictionaries (TriCRF1, TriCRF3)
    pub(crate) seq_labels: Vec<Dictionary>,
    /// Per-topic feature dictionaries (TriCRF1)
    pub(crate) seq_attrs: Vec<Dictionary>,
    /// Sequence parameter blocks: one, or one per topic
    pub(crate) stores: Vec<ParamStore>,
    /// Topic -> global tag ids seen with that topic (TriCRF2)
    pub(crate) zy_index: Vec<Vec<u32>>,
    /// Global tag -> topics it occurs with (TriCRF2)
    pub(crate) yz_index: Vec<Vec<u32>>,
    /// Derived: `zy_pos[z][y]` is the 1-based position of global tag y in
    /// topic z's state subset, 0 when absent (TriCRF2)
    pub(crate) zy_pos: Vec<Vec<u32>>,
}

impl Model {
    pub(crate) fn empty(kind: ModelKind) -> Self {
        Self {
            kind,
            labels: Dictionary::new(),
            attrs: Dictionary::new(),
            topics: Dictionary::new(),
            topic_attrs: Dictionary::new(),
            topic_store: ParamStore::new(),
            seq_labels: Vec::new(),
            seq_attrs: Vec::new(),
            stores: Vec::new(),
            zy_index: Vec::new(),
            yz_index: Vec::new(),
            zy_pos: Vec::new(),
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Number of topics known to the model (0 for chain models)
    pub fn num_topics(&self) -> usize {
        self.topics.len()
    }

    pub(crate) fn all_stores(&self) -> Vec<&ParamStore> {
        let mut out = Vec::with_capacity(self.stores.len() + 1);
        if self.kind.is_triangular() {
            out.push(&self.topic_store);
        }
        out.extend(self.stores.iter());
        out
    }

    pub(crate) fn all_stores_mut(&mut self) -> Vec<&mut ParamStore> {
        let mut out = Vec::with_capacity(self.stores.len() + 1);
        if self.kind.is_triangular() {
            out.push(&mut self.topic_store);
        }
        out.extend(self.stores.iter_mut());
        out
    }

    /// Total number of weight slots across all parameter blocks
    pub fn num_weights(&self) -> usize {
        self.all_stores().iter().map(|s| s.num_weights()).sum()
    }

    /// Copy a flat weight vector into the parameter blocks
    pub(crate) fn set_weights(&mut self, theta: &[f64]) {
        debug_assert_eq!(theta.len(), self.num_weights());
        let mut off = 0;
        for store in self.all_stores_mut() {
            let n = store.num_weights();
            store.weights_mut().copy_from_slice(&theta[off..off + n]);
            off += n;
        }
    }

    /// Concatenated weight vector over all parameter blocks
    pub fn weights(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.num_weights());
        for store in self.all_stores() {
            out.extend_from_slice(store.weights());
        }
        out
    }

    /// Total gold-path score under the current weights
    pub(crate) fn gold_score(&self) -> f64 {
        self.all_stores().iter().map(|s| s.gold_score()).sum()
    }

    pub(crate) fn build_zy_pos(&mut self) {
        let n_labels = self.labels.len();
        self.zy_pos = self
            .zy_index
            .iter()
            .map(|subset| {
                let mut pos = vec![0u32; n_labels];
                for (local, &y) in subset.iter().enumerate() {
                    pos[y as usize] = local as u32 + 1;
                }
                pos
            })
            .collect();
    }

    /// Persist the model
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&self.kind.tag().to_le_bytes())?;
        self.labels.write_to(&mut w)?;
        self.attrs.write_to(&mut w)?;

        if self.kind.is_triangular() {
            self.topics.write_to(&mut w)?;
            self.topic_attrs.write_to(&mut w)?;
            self.topic_store.write_to(&mut w)?;
        }
        match self.kind {
            ModelKind::MaxEnt | ModelKind::Crf => {
                self.stores[0].write_to(&mut w)?;
            }
            ModelKind::TriCrf1 => {
                w.write_all(&(self.stores.len() as u32).to_le_bytes())?;
                for z in 0..self.stores.len() {
                    self.seq_labels[z].write_to(&mut w)?;
                    self.seq_attrs[z].write_to(&mut w)?;
                    self.stores[z].write_to(&mut w)?;
                }
            }
            ModelKind::TriCrf3 => {
                w.write_all(&(self.stores.len() as u32).to_le_bytes())?;
                for z in 0..self.stores.len() {
                    self.seq_labels[z].write_to(&mut w)?;
                    self.stores[z].write_to(&mut w)?;
                }
            }
            ModelKind::TriCrf2 => {
                w.write_all(&(self.zy_index.len() as u32).to_le_bytes())?;
                for subset in &self.zy_index {
                    write_ids(&mut w, subset)?;
                }
                w.write_all(&(self.yz_index.len() as u32).to_le_bytes())?;
                for zs in &self.yz_index {
                    write_ids(&mut w, zs)?;
                }
                self.stores[0].write_to(&mut w)?;
            }
        }
        w.flush()?;
        Ok(())
    }

    /// Load a model persisted with [`save`](Self::save)
    pub fn load(path: &Path) -> Result<Self> {
        let mut r = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(TricrfError::invalid_model("not a model file"));
        }
        let version = read_u32(&mut r)?;
        if version != VERSION {
            return Err(TricrfError::invalid_model(format!(
                "unsupported model version {version}"
            )));
        }
        let tag = read_u32(&mut r)?;
        let kind = ModelKind::from_tag(tag)
            .ok_or_else(|| TricrfError::invalid_model(format!("unknown model type tag {tag}")))?;

        let mut model = Model::empty(kind);
        model.labels = Dictionary::read_from(&mut r)?;
        model.attrs = Dictionary::read_from(&mut r)?;

        if kind.is_triangular() {
            model.topics = Dictionary::read_from(&mut r)?;
            model.topic_attrs = Dictionary::read_from(&mut r)?;
            model.topic_store = ParamStore::read_from(&mut r)?;
        }
        match kind {
            ModelKind::MaxEnt | ModelKind::Crf => {
                model.stores.push(ParamStore::read_from(&mut r)?);
            }
            ModelKind::TriCrf1 => {
                let nz = read_u32(&mut r)? as usize;
                for _ in 0..nz {
                    model.seq_labels.push(Dictionary::read_from(&mut r)?);
                    model.seq_attrs.push(Dictionary::read_from(&mut r)?);
                    model.stores.push(ParamStore::read_from(&mut r)?);
                }
            }
            ModelKind::TriCrf3 => {
                let nz = read_u32(&mut r)? as usize;
                for _ in 0..nz {
                    model.seq_labels.push(Dictionary::read_from(&mut r)?);
                    model.stores.push(ParamStore::read_from(&mut r)?);
                }
            }
            ModelKind::TriCrf2 => {
                let nz = read_u32(&mut r)? as usize;
                for _ in 0..nz {
                    let subset = read_ids(&mut r)?;
                    if subset.iter().any(|&y| y as usize >= model.labels.len()) {
                        return Err(TricrfError::invalid_model(
                            "topic state subset out of dictionary range",
                        ));
                    }
                    model.zy_index.push(subset);
                }
                let ny = read_u32(&mut r)? as usize;
                for _ in 0..ny {
                    model.yz_index.push(read_ids(&mut r)?);
                }
                model.stores.push(ParamStore::read_from(&mut r)?);
                model.build_zy_pos();
            }
        }
        if kind.is_triangular() && model.stores.is_empty() {
            return Err(TricrfError::invalid_model("model carries no topic chains"));
        }
        Ok(model)
    }
}

fn write_ids<W: Write>(w: &mut W, ids: &[u32]) -> Result<()> {
    w.write_all(&(ids.len() as u32).to_le_bytes())?;
    for &id in ids {
        w.write_all(&id.to_le_bytes())?;
    }
    Ok(())
}

fn read_ids<R: Read>(r: &mut R) -> Result<Vec<u32>> {
    let n = read_u32(r)? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_u32(r)?);
    }
    Ok(out)
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_roundtrip() {
        for kind in [
            ModelKind::MaxEnt,
            ModelKind::Crf,
            ModelKind::TriCrf1,
            ModelKind::TriCrf2,
            ModelKind::TriCrf3,
        ] {
            assert_eq!(ModelKind::from_tag(kind.tag()), Some(kind));
            assert_eq!(ModelKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ModelKind::from_tag(99), None);
        assert_eq!(ModelKind::from_name("HMM"), None);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = std::env::temp_dir();
        let path = dir.join("tricrf_garbage_model_test.bin");
        std::fs::write(&path, b"not a model at all").unwrap();
        assert!(Model::load(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
