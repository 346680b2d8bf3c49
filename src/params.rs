use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};

use crate::errors::{Result, TricrfError};

/// Label id of the distinguished boundary state.
///
/// Coincides with the reserved default state: start transitions are the
/// outgoing bigrams of this label.
pub const BOUNDARY: u32 = 0;

/// Sparse parameter block for one chain model.
///
/// During the training read pass, observation pairs `(state, feature)` and
/// transition bigrams `(state, state)` are registered together with their
/// gold counts. `finalize` assigns every registered pair a weight slot,
/// builds the scoring indexes, and freezes the structure; afterwards only
/// the weight values may change.
///
/// Weight slot 0 is the wildcard edge parameter: it scores any transition
/// bigram that was never seen during training.
#[derive(Debug, Clone)]
pub struct ParamStore {
    /// (state, feature) -> value-weighted gold count, collected pre-finalize
    obs_seen: BTreeMap<(u32, u32), f64>,
    /// (prev state, state) -> gold count, collected pre-finalize
    trans_seen: BTreeMap<(u32, u32), f64>,

    num_states: usize,
    num_features: usize,
    /// ParamIndex: per state, (feature id, weight index) sorted by feature id
    obs_index: Vec<Vec<(u32, u32)>>,
    /// Reverse index: per feature id, (state, weight index) sorted by state
    attr_index: Vec<Vec<(u32, u32)>>,
    trans_map: HashMap<(u32, u32), u32>,
    /// Dense `[num_states * num_states]` transition slot table; entries for
    /// unseen bigrams hold the wildcard edge slot
    trans_dense: Vec<u32>,

    weights: Vec<f64>,
    counts: Vec<f64>,
    finalized: bool,
}

/// The wildcard edge weight slot.
const EDGE_WIDX: u32 = 0;

impl ParamStore {
    pub fn new() -> Self {
        Self {
            obs_seen: BTreeMap::new(),
            trans_seen: BTreeMap::new(),
            num_states: 0,
            num_features: 0,
            obs_index: Vec::new(),
            attr_index: Vec::new(),
            trans_map: HashMap::new(),
            trans_dense: Vec::new(),
            weights: Vec::new(),
            counts: Vec::new(),
            finalized: false,
        }
    }

    /// Record that feature `fid` co-occurs with state `y` on a gold path,
    /// adding `value` to its empirical count.
    pub fn record_obs(&mut self, y: u32, fid: u32, value: f64) -> Result<()> {
        if self.finalized {
            return Err(TricrfError::invalid_argument(
                "record_obs called on a finalized parameter store",
            ));
        }
        *self.obs_seen.entry((y, fid)).or_insert(0.0) += value;
        Ok(())
    }

    /// Record a gold transition bigram; `y1` may be [`BOUNDARY`].
    pub fn record_trans(&mut self, y1: u32, y2: u32) -> Result<()> {
        if self.finalized {
            return Err(TricrfError::invalid_argument(
                "record_trans called on a finalized parameter store",
            ));
        }
        *self.trans_seen.entry((y1, y2)).or_insert(0.0) += 1.0;
        Ok(())
    }

    /// Assign weight slots, build the scoring indexes, and freeze the
    /// structure.
    ///
    /// With `tie_threshold` set, bigrams whose gold count falls below the
    /// threshold share a single tied tail slot instead of dedicated slots.
    pub fn finalize(
        &mut self,
        num_states: usize,
        num_features: usize,
        tie_threshold: Option<f64>,
    ) -> Result<()> {
        if self.finalized {
            return Err(TricrfError::invalid_argument(
                "parameter store is already finalized",
            ));
        }
        if num_states == 0 {
            return Err(TricrfError::invalid_argument(
                "cannot finalize a store with no states",
            ));
        }
        self.num_states = num_states;
        self.num_features = num_features;

        // Slot 0 is the wildcard edge parameter.
        let mut next = EDGE_WIDX + 1;
        let mut empirical = vec![0.0];

        self.obs_index = vec![Vec::new(); num_states];
        self.attr_index = vec![Vec::new(); num_features];
        for (&(y, fid), &count) in &self.obs_seen {
            let widx = next;
            next += 1;
            empirical.push(count);
            self.obs_index[y as usize].push((fid, widx));
            self.attr_index[fid as usize].push((y, widx));
        }

        let mut tied_widx = None;
        for (&(y1, y2), &count) in &self.trans_seen {
            let tail = tie_threshold.map_or(false, |k| count < k);
            let widx = if tail {
                let widx = *tied_widx.get_or_insert_with(|| {
                    let widx = next;
                    next += 1;
                    empirical.push(0.0);
                    widx
                });
                empirical[widx as usize] += count;
                widx
            } else {
                let widx = next;
                next += 1;
                empirical.push(count);
                widx
            };
            self.trans_map.insert((y1, y2), widx);
        }

        self.trans_dense = vec![EDGE_WIDX; num_states * num_states];
        for (&(y1, y2), &widx) in &self.trans_map {
            self.trans_dense[y1 as usize * num_states + y2 as usize] = widx;
        }

        self.weights = vec![0.0; next as usize];
        self.counts = empirical;
        self.finalized = true;
        Ok(())
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    /// Number of weight slots
    pub fn num_weights(&self) -> usize {
        self.weights.len()
    }

    /// ParamIndex row for state `y`: (feature id, weight index), sorted by
    /// feature id
    pub fn obs_index_of(&self, y: u32) -> &[(u32, u32)] {
        &self.obs_index[y as usize]
    }

    /// Reverse index for feature `fid`: (state, weight index) pairs.
    ///
    /// Out-of-range features (unseen at training time) yield an empty slice.
    pub fn attr_refs(&self, fid: u32) -> &[(u32, u32)] {
        self.attr_index
            .get(fid as usize)
            .map_or(&[], Vec::as_slice)
    }

    /// Weight slot of the bigram `(y1, y2)`, falling back to the wildcard
    /// edge slot for unseen bigrams
    #[inline]
    pub fn trans_widx(&self, y1: u32, y2: u32) -> u32 {
        self.trans_dense[y1 as usize * self.num_states + y2 as usize]
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f64] {
        &mut self.weights
    }

    /// Cached empirical counts, parallel to the weight vector
    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    /// Dot product of the current weights with the cached empirical counts
    pub fn gold_score(&self) -> f64 {
        self.weights
            .iter()
            .zip(&self.counts)
            .map(|(w, c)| w * c)
            .sum()
    }

    /// Serialize the finalized structure and weights
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&(self.num_states as u32).to_le_bytes())?;
        w.write_all(&(self.num_features as u32).to_le_bytes())?;

        let n_obs: usize = self.obs_index.iter().map(Vec::len).sum();
        w.write_all(&(n_obs as u32).to_le_bytes())?;
        for (y, row) in self.obs_index.iter().enumerate() {
            for &(fid, widx) in row {
                w.write_all(&(y as u32).to_le_bytes())?;
                w.write_all(&fid.to_le_bytes())?;
                w.write_all(&widx.to_le_bytes())?;
            }
        }

        let trans: BTreeMap<(u32, u32), u32> =
            self.trans_map.iter().map(|(&k, &v)| (k, v)).collect();
        w.write_all(&(trans.len() as u32).to_le_bytes())?;
        for ((y1, y2), widx) in trans {
            w.write_all(&y1.to_le_bytes())?;
            w.write_all(&y2.to_le_bytes())?;
            w.write_all(&widx.to_le_bytes())?;
        }

        w.write_all(&(self.weights.len() as u32).to_le_bytes())?;
        for &v in &self.weights {
            w.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    /// Deserialize a store written by [`write_to`](Self::write_to)
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut buf8 = [0u8; 8];

        let num_states = read_u32(r)? as usize;
        let num_features = read_u32(r)? as usize;
        if num_states == 0 {
            return Err(TricrfError::invalid_model("model block has no states"));
        }

        let mut store = Self::new();
        store.num_states = num_states;
        store.num_features = num_features;
        store.obs_index = vec![Vec::new(); num_states];
        store.attr_index = vec![Vec::new(); num_features];

        let n_obs = read_u32(r)? as usize;
        for _ in 0..n_obs {
            let y = read_u32(r)?;
            let fid = read_u32(r)?;
            let widx = read_u32(r)?;
            if y as usize >= num_states || fid as usize >= num_features {
                return Err(TricrfError::invalid_model(
                    "observation slot out of dictionary range",
                ));
            }
            store.obs_index[y as usize].push((fid, widx));
            store.attr_index[fid as usize].push((y, widx));
        }
        for row in &mut store.obs_index {
            row.sort_unstable_by_key(|&(fid, _)| fid);
        }
        for row in &mut store.attr_index {
            row.sort_unstable_by_key(|&(y, _)| y);
        }

        let n_trans = read_u32(r)? as usize;
        store.trans_dense = vec![EDGE_WIDX; num_states * num_states];
        for _ in 0..n_trans {
            let y1 = read_u32(r)?;
            let y2 = read_u32(r)?;
            let widx = read_u32(r)?;
            if y1 as usize >= num_states || y2 as usize >= num_states {
                return Err(TricrfError::invalid_model(
                    "transition slot out of dictionary range",
                ));
            }
            store.trans_map.insert((y1, y2), widx);
            store.trans_dense[y1 as usize * num_states + y2 as usize] = widx;
        }

        let n_weights = read_u32(r)? as usize;
        store.weights = Vec::with_capacity(n_weights);
        for _ in 0..n_weights {
            r.read_exact(&mut buf8)?;
            store.weights.push(f64::from_le_bytes(buf8));
        }
        let max_widx = store
            .obs_index
            .iter()
            .flatten()
            .map(|&(_, w)| w)
            .chain(store.trans_map.values().copied())
            .max()
            .unwrap_or(0);
        if max_widx as usize >= n_weights.max(1) {
            return Err(TricrfError::invalid_model(
                "weight index out of range in model block",
            ));
        }

        store.counts = vec![0.0; store.weights.len()];
        store.finalized = true;
        Ok(store)
    }
}

impl Default for ParamStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store() -> ParamStore {
        let mut store = ParamStore::new();
        // states: 0 = boundary/default, 1 = A, 2 = B; features: 1, 2
        store.record_obs(1, 1, 1.0).unwrap();
        store.record_obs(1, 2, 0.5).unwrap();
        store.record_obs(2, 1, 1.0).unwrap();
        store.record_trans(BOUNDARY, 1).unwrap();
        store.record_trans(1, 2).unwrap();
        store.record_trans(1, 2).unwrap();
        store.finalize(3, 3, None).unwrap();
        store
    }

    #[test]
    fn test_record_and_finalize() {
        let store = small_store();
        // edge slot + 3 obs + 2 trans
        assert_eq!(store.num_weights(), 6);

        let idx = store.obs_index_of(1);
        assert_eq!(idx.len(), 2);
        assert!(idx.windows(2).all(|w| w[0].0 < w[1].0));

        // seen bigrams get dedicated slots, unseen fall back to the edge slot
        assert_ne!(store.trans_widx(1, 2), EDGE_WIDX);
        assert_eq!(store.trans_widx(2, 1), EDGE_WIDX);
    }

    #[test]
    fn test_empirical_counts() {
        let store = small_store();
        let widx = store.obs_index_of(1)[1].1; // (y=1, fid=2)
        assert_eq!(store.counts()[widx as usize], 0.5);
        let t = store.trans_widx(1, 2);
        assert_eq!(store.counts()[t as usize], 2.0);
    }

    #[test]
    fn test_finalized_rejects_mutation() {
        let mut store = small_store();
        assert!(store.record_obs(1, 1, 1.0).is_err());
        assert!(store.record_trans(1, 2).is_err());
        assert!(store.finalize(3, 3, None).is_err());
    }

    #[test]
    fn test_tied_transitions() {
        let mut store = ParamStore::new();
        store.record_obs(1, 1, 1.0).unwrap();
        for _ in 0..5 {
            store.record_trans(1, 2).unwrap();
        }
        store.record_trans(2, 1).unwrap();
        store.record_trans(2, 2).unwrap();
        store.finalize(3, 2, Some(2.0)).unwrap();

        // (1,2) is selected; the two singletons share a tied tail slot
        let selected = store.trans_widx(1, 2);
        let tail_a = store.trans_widx(2, 1);
        let tail_b = store.trans_widx(2, 2);
        assert_ne!(selected, tail_a);
        assert_eq!(tail_a, tail_b);
        assert_ne!(tail_a, EDGE_WIDX);
        assert_eq!(store.counts()[tail_a as usize], 2.0);
    }

    #[test]
    fn test_store_roundtrip() {
        let mut store = small_store();
        store.weights_mut().copy_from_slice(&[0.1, -0.2, 0.3, 0.0, 1.5, -2.5]);

        let mut buf = Vec::new();
        store.write_to(&mut buf).unwrap();
        let loaded = ParamStore::read_from(&mut buf.as_slice()).unwrap();

        assert_eq!(loaded.num_states(), store.num_states());
        assert_eq!(loaded.weights(), store.weights());
        assert_eq!(loaded.obs_index_of(1), store.obs_index_of(1));
        assert_eq!(loaded.trans_widx(1, 2), store.trans_widx(1, 2));
        assert_eq!(loaded.trans_widx(2, 1), EDGE_WIDX);
    }
}
