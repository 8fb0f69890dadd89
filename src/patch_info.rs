//! Patch geometry and neighbor topology.
//!
//! A plain struct with public fields a driver fills in directly, plus a
//! neighbor map and two serialization surfaces: an opaque binary form
//! (`ciborium`) and an exact, hand-written JSON schema that a
//! `#[derive(Serialize)]` cannot produce directly.

use crate::error::{Result, RuntimeError};
use crate::face::{Edge, NbrType, Orthant, Side};
use crate::neighbor_info::{CoarseNbrInfo, FineNbrInfo, NeighborInfo, NormalNbrInfo};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Binds a face-like key type (`Side`, `Edge`, `Orthant`) to the neighbor
/// map it indexes on a `PatchInfo`, so the typed accessors in §4.2 can be
/// written once and used for all three feature kinds.
pub trait NbrMapKey: Copy + Eq + std::hash::Hash {
    fn map(info: &PatchInfo) -> &HashMap<Self, NeighborInfo>
    where
        Self: Sized;
    fn map_mut(info: &mut PatchInfo) -> &mut HashMap<Self, NeighborInfo>
    where
        Self: Sized;
}

impl NbrMapKey for Side {
    fn map(info: &PatchInfo) -> &HashMap<Self, NeighborInfo> {
        &info.side_nbrs
    }
    fn map_mut(info: &mut PatchInfo) -> &mut HashMap<Self, NeighborInfo> {
        &mut info.side_nbrs
    }
}

impl NbrMapKey for Edge {
    fn map(info: &PatchInfo) -> &HashMap<Self, NeighborInfo> {
        &info.edge_nbrs
    }
    fn map_mut(info: &mut PatchInfo) -> &mut HashMap<Self, NeighborInfo> {
        &mut info.edge_nbrs
    }
}

impl NbrMapKey for Orthant {
    fn map(info: &PatchInfo) -> &HashMap<Self, NeighborInfo> {
        &info.corner_nbrs
    }
    fn map_mut(info: &mut PatchInfo) -> &mut HashMap<Self, NeighborInfo> {
        &mut info.corner_nbrs
    }
}

/// Geometry, identifiers, and full neighbor map for a single patch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchInfo {
    pub id: i64,
    pub local_index: i64,
    pub global_index: i64,
    pub rank: i32,
    pub refine_level: i32,
    pub parent_id: i64,
    pub parent_rank: i32,
    pub orth_on_parent: Option<Orthant>,
    pub child_ids: Vec<i64>,
    pub child_ranks: Vec<i32>,
    pub ns: Vec<usize>,
    pub starts: Vec<f64>,
    pub spacings: Vec<f64>,
    pub num_ghost_cells: usize,
    side_nbrs: HashMap<Side, NeighborInfo>,
    edge_nbrs: HashMap<Edge, NeighborInfo>,
    corner_nbrs: HashMap<Orthant, NeighborInfo>,
}

impl PatchInfo {
    /// A patch of dimension `ndims` with every field at its
    /// default: `id=0, rank=-1, refine_level=-1, parent_id=-1,
    /// orth_on_parent=null, ns=1, starts=0, spacings=1`, no neighbors.
    pub fn new(ndims: usize) -> Self {
        Self {
            id: 0,
            local_index: -1,
            global_index: -1,
            rank: -1,
            refine_level: -1,
            parent_id: -1,
            parent_rank: -1,
            orth_on_parent: None,
            child_ids: Vec::new(),
            child_ranks: Vec::new(),
            ns: vec![1; ndims],
            starts: vec![0.0; ndims],
            spacings: vec![1.0; ndims],
            num_ghost_cells: 0,
            side_nbrs: HashMap::new(),
            edge_nbrs: HashMap::new(),
            corner_nbrs: HashMap::new(),
        }
    }

    pub fn ndims(&self) -> usize {
        self.ns.len()
    }

    pub fn set_nbr_info<K: NbrMapKey>(&mut self, key: K, info: NeighborInfo) {
        K::map_mut(self).insert(key, info);
    }

    pub fn has_nbr<K: NbrMapKey>(&self, key: K) -> bool {
        K::map(self).contains_key(&key)
    }

    pub fn get_nbr_type<K: NbrMapKey>(&self, key: K) -> Option<NbrType> {
        K::map(self).get(&key).map(|n| n.nbr_type())
    }

    pub fn get_normal_nbr_info<K: NbrMapKey>(&self, key: K) -> Result<&NormalNbrInfo> {
        match K::map(self).get(&key) {
            Some(NeighborInfo::Normal(n)) => Ok(n),
            Some(other) => Err(RuntimeError::WrongNeighborVariant {
                expected: "NORMAL",
                found: other.nbr_type().name(),
            }),
            None => Err(RuntimeError::WrongNeighborVariant { expected: "NORMAL", found: "none" }),
        }
    }

    pub fn get_coarse_nbr_info<K: NbrMapKey>(&self, key: K) -> Result<&CoarseNbrInfo> {
        match K::map(self).get(&key) {
            Some(NeighborInfo::Coarse(n)) => Ok(n),
            Some(other) => Err(RuntimeError::WrongNeighborVariant {
                expected: "COARSE",
                found: other.nbr_type().name(),
            }),
            None => Err(RuntimeError::WrongNeighborVariant { expected: "COARSE", found: "none" }),
        }
    }

    pub fn get_fine_nbr_info<K: NbrMapKey>(&self, key: K) -> Result<&FineNbrInfo> {
        match K::map(self).get(&key) {
            Some(NeighborInfo::Fine(n)) => Ok(n),
            Some(other) => Err(RuntimeError::WrongNeighborVariant {
                expected: "FINE",
                found: other.nbr_type().name(),
            }),
            None => Err(RuntimeError::WrongNeighborVariant { expected: "FINE", found: "none" }),
        }
    }

    /// All neighbor ids, faces first (`Side` order), then edges (3-D only,
    /// `Edge` order), then corners (`Orthant` order).
    pub fn nbr_ids(&self) -> Vec<i64> {
        self.nbr_infos().iter().flat_map(|n| n.ids()).collect()
    }

    pub fn nbr_ranks(&self) -> Vec<i32> {
        self.nbr_infos().iter().flat_map(|n| n.ranks()).collect()
    }

    fn nbr_infos(&self) -> Vec<&NeighborInfo> {
        let ndims = self.ndims();
        let mut out = Vec::new();
        for side in Side::for_dim(ndims) {
            if let Some(n) = self.side_nbrs.get(&side) {
                out.push(n);
            }
        }
        if ndims == 3 {
            for edge in Edge::iter_all() {
                if let Some(n) = self.edge_nbrs.get(&edge) {
                    out.push(n);
                }
            }
        }
        for corner in Orthant::iter_all(ndims as u8) {
            if let Some(n) = self.corner_nbrs.get(&corner) {
                out.push(n);
            }
        }
        out
    }

    fn nbr_infos_mut(&mut self) -> Vec<&mut NeighborInfo> {
        let ndims = self.ndims();
        let mut out: Vec<&mut NeighborInfo> = Vec::new();
        out.extend(Side::for_dim(ndims).filter_map(|s| self.side_nbrs.get_mut(&s)));
        if ndims == 3 {
            out.extend(Edge::iter_all().filter_map(|e| self.edge_nbrs.get_mut(&e)));
        }
        out.extend(Orthant::iter_all(ndims as u8).filter_map(|c| self.corner_nbrs.get_mut(&c)));
        out
    }

    /// For every neighbor id present in `map`, fill that neighbor's
    /// `local_index`; ids absent from `map` keep -1.
    pub fn set_neighbor_local_indexes(&mut self, map: &HashMap<i64, i64>) {
        for n in self.nbr_infos_mut() {
            n.set_local_indexes(map);
        }
    }

    /// For every neighbor id present in `map`, fill that neighbor's
    /// `rank`/`global_index`.
    pub fn set_neighbor_global_indexes(&mut self, map: &HashMap<i64, (i32, i64)>) {
        for n in self.nbr_infos_mut() {
            n.set_global_indexes(map);
        }
    }

    /// Opaque, version-locked binary round trip.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf).map_err(|e| RuntimeError::Malformed(e.to_string()))?;
        Ok(buf)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| RuntimeError::Malformed(e.to_string()))
    }

    /// Geometry round-trips as `starts`/`lengths`
    /// (`lengths[i] = spacings[i] * ns[i]`); `ns`, `num_ghost_cells`, and the
    /// index fields are intentionally outside the schema and snap back to
    /// their defaults on `from_json` (the result equals the original modulo
    /// those default-valued fields).
    pub fn to_json(&self) -> Value {
        let ndims = self.ndims();
        let lengths: Vec<f64> = self.spacings.iter().zip(&self.ns).map(|(s, n)| s * (*n as f64)).collect();

        let mut obj = serde_json::Map::new();
        obj.insert("id".into(), json!(self.id));
        obj.insert("rank".into(), json!(self.rank));
        obj.insert("refine_level".into(), json!(self.refine_level));
        obj.insert("parent_id".into(), json!(self.parent_id));
        obj.insert("parent_rank".into(), json!(self.parent_rank));
        obj.insert(
            "orth_on_parent".into(),
            match self.orth_on_parent {
                Some(o) => json!(o.name()),
                None => Value::Null,
            },
        );
        obj.insert("starts".into(), json!(self.starts));
        obj.insert("lengths".into(), json!(lengths));
        obj.insert(
            "child_ids".into(),
            if self.child_ids.is_empty() { Value::Null } else { json!(self.child_ids) },
        );
        obj.insert(
            "child_ranks".into(),
            if self.child_ranks.is_empty() { Value::Null } else { json!(self.child_ranks) },
        );

        let mut nbrs = Vec::new();
        for side in Side::for_dim(ndims) {
            if let Some(info) = self.side_nbrs.get(&side) {
                let mut v = nbr_info_to_json(info);
                v.as_object_mut().unwrap().insert("side".into(), json!(side.name()));
                nbrs.push(v);
            }
        }
        obj.insert("nbrs".into(), Value::Array(nbrs));

        if ndims == 3 {
            let mut edge_nbrs = Vec::new();
            for edge in Edge::iter_all() {
                if let Some(info) = self.edge_nbrs.get(&edge) {
                    let mut v = nbr_info_to_json(info);
                    v.as_object_mut().unwrap().insert("edge".into(), json!(edge.name()));
                    edge_nbrs.push(v);
                }
            }
            obj.insert("edge_nbrs".into(), Value::Array(edge_nbrs));
        }

        let mut corner_nbrs = Vec::new();
        for corner in Orthant::iter_all(ndims as u8) {
            if let Some(info) = self.corner_nbrs.get(&corner) {
                let mut v = nbr_info_to_json(info);
                v.as_object_mut().unwrap().insert("corner".into(), json!(corner.name()));
                corner_nbrs.push(v);
            }
        }
        obj.insert("corner_nbrs".into(), Value::Array(corner_nbrs));

        Value::Object(obj)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| RuntimeError::Malformed("expected a JSON object".into()))?;

        let field = |key: &str| -> Result<&Value> {
            obj.get(key).ok_or_else(|| RuntimeError::Malformed(format!("missing field \"{}\"", key)))
        };
        let as_i64 = |v: &Value, what: &str| -> Result<i64> {
            v.as_i64().ok_or_else(|| RuntimeError::Malformed(format!("\"{}\" is not an integer", what)))
        };
        let as_f64 = |v: &Value, what: &str| -> Result<f64> {
            v.as_f64().ok_or_else(|| RuntimeError::Malformed(format!("\"{}\" is not a number", what)))
        };
        let as_array = |v: &Value, what: &str| -> Result<&Vec<Value>> {
            v.as_array().ok_or_else(|| RuntimeError::Malformed(format!("\"{}\" is not an array", what)))
        };

        let id = as_i64(field("id")?, "id")?;
        let rank = as_i64(field("rank")?, "rank")? as i32;
        let refine_level = as_i64(field("refine_level")?, "refine_level")? as i32;
        let parent_id = as_i64(field("parent_id")?, "parent_id")?;
        let parent_rank = as_i64(field("parent_rank")?, "parent_rank")? as i32;

        let starts: Vec<f64> = as_array(field("starts")?, "starts")?
            .iter()
            .map(|v| as_f64(v, "starts[]"))
            .collect::<Result<_>>()?;
        let lengths: Vec<f64> = as_array(field("lengths")?, "lengths")?
            .iter()
            .map(|v| as_f64(v, "lengths[]"))
            .collect::<Result<_>>()?;
        if starts.len() != lengths.len() {
            return Err(RuntimeError::Malformed("starts/lengths dimension mismatch".into()));
        }
        let ndims = starts.len();

        let orth_on_parent = match field("orth_on_parent")? {
            Value::Null => None,
            Value::String(s) => Some(
                Orthant::from_name(ndims as u8, s)
                    .ok_or_else(|| RuntimeError::Malformed(format!("unknown orthant name \"{}\"", s)))?,
            ),
            _ => return Err(RuntimeError::Malformed("\"orth_on_parent\" must be a string or null".into())),
        };

        let int_vec = |v: &Value, what: &str| -> Result<Vec<i64>> {
            match v {
                Value::Null => Ok(Vec::new()),
                Value::Array(a) => a.iter().map(|e| as_i64(e, what)).collect(),
                _ => Err(RuntimeError::Malformed(format!("\"{}\" must be an array or null", what))),
            }
        };
        let child_ids = int_vec(field("child_ids")?, "child_ids")?;
        let child_ranks: Vec<i32> = int_vec(field("child_ranks")?, "child_ranks")?.into_iter().map(|v| v as i32).collect();

        let mut pinfo = PatchInfo::new(ndims);
        pinfo.id = id;
        pinfo.rank = rank;
        pinfo.refine_level = refine_level;
        pinfo.parent_id = parent_id;
        pinfo.parent_rank = parent_rank;
        pinfo.orth_on_parent = orth_on_parent;
        pinfo.starts = starts;
        pinfo.spacings = lengths; // ns defaults to 1, so spacings == lengths
        pinfo.child_ids = child_ids;
        pinfo.child_ranks = child_ranks;

        for nbr_json in as_array(field("nbrs")?, "nbrs")? {
            let name = nbr_json.get("side").and_then(Value::as_str).ok_or_else(|| RuntimeError::Malformed("nbr missing \"side\"".into()))?;
            let side = Side::from_name(name).ok_or_else(|| RuntimeError::Malformed(format!("unknown side \"{}\"", name)))?;
            let info = nbr_info_from_json(nbr_json, (ndims as u8).saturating_sub(1))?;
            pinfo.side_nbrs.insert(side, info);
        }

        if ndims == 3 {
            if let Some(Value::Array(edge_arr)) = obj.get("edge_nbrs") {
                for nbr_json in edge_arr {
                    let name = nbr_json.get("edge").and_then(Value::as_str).ok_or_else(|| RuntimeError::Malformed("nbr missing \"edge\"".into()))?;
                    let edge = Edge::from_name(name).ok_or_else(|| RuntimeError::Malformed(format!("unknown edge \"{}\"", name)))?;
                    let info = nbr_info_from_json(nbr_json, 1)?;
                    pinfo.edge_nbrs.insert(edge, info);
                }
            }
        }

        if let Some(Value::Array(corner_arr)) = obj.get("corner_nbrs") {
            for nbr_json in corner_arr {
                let name = nbr_json.get("corner").and_then(Value::as_str).ok_or_else(|| RuntimeError::Malformed("nbr missing \"corner\"".into()))?;
                let corner = Orthant::from_name(ndims as u8, name).ok_or_else(|| RuntimeError::Malformed(format!("unknown corner \"{}\"", name)))?;
                let info = nbr_info_from_json(nbr_json, 0)?;
                pinfo.corner_nbrs.insert(corner, info);
            }
        }

        Ok(pinfo)
    }
}

fn nbr_info_to_json(info: &NeighborInfo) -> Value {
    match info {
        NeighborInfo::Normal(n) => json!({"type": "NORMAL", "ids": [n.id], "ranks": [n.rank]}),
        NeighborInfo::Coarse(n) => {
            let orth = match n.orth_on_coarse {
                Some(o) => json!(o.name()),
                None => Value::Null,
            };
            json!({"type": "COARSE", "ids": [n.id], "ranks": [n.rank], "orth_on_coarse": orth})
        }
        NeighborInfo::Fine(n) => json!({"type": "FINE", "ids": n.ids, "ranks": n.ranks}),
    }
}

/// `feature_ndims` is the shared feature's dimension (`D-1` for a side, `1`
/// for an edge, `0` for a corner) and resolves which `Orthant` an
/// `orth_on_coarse` string decodes into.
fn nbr_info_from_json(value: &Value, feature_ndims: u8) -> Result<NeighborInfo> {
    let obj = value.as_object().ok_or_else(|| RuntimeError::Malformed("expected a neighbor object".into()))?;
    let ty = obj.get("type").and_then(Value::as_str).ok_or_else(|| RuntimeError::Malformed("neighbor missing \"type\"".into()))?;

    let int_arr = |key: &str| -> Result<Vec<i64>> {
        obj.get(key)
            .and_then(Value::as_array)
            .ok_or_else(|| RuntimeError::Malformed(format!("neighbor missing \"{}\"", key)))?
            .iter()
            .map(|v| v.as_i64().ok_or_else(|| RuntimeError::Malformed(format!("\"{}\"[] not an integer", key))))
            .collect()
    };

    match ty {
        "NORMAL" => {
            let ids = int_arr("ids")?;
            let ranks = int_arr("ranks")?;
            if ids.len() != 1 || ranks.len() != 1 {
                return Err(RuntimeError::Malformed("NORMAL neighbor must have exactly one id/rank".into()));
            }
            let mut n = NormalNbrInfo::new(ids[0]);
            n.rank = ranks[0] as i32;
            Ok(NeighborInfo::Normal(n))
        }
        "COARSE" => {
            let ids = int_arr("ids")?;
            let ranks = int_arr("ranks")?;
            if ids.len() != 1 || ranks.len() != 1 {
                return Err(RuntimeError::Malformed("COARSE neighbor must have exactly one id/rank".into()));
            }
            let orth_on_coarse = if feature_ndims == 0 {
                None
            } else {
                match obj.get("orth_on_coarse") {
                    Some(Value::String(s)) => Some(
                        Orthant::from_name(feature_ndims, s)
                            .ok_or_else(|| RuntimeError::Malformed(format!("unknown orthant \"{}\"", s)))?,
                    ),
                    _ => None,
                }
            };
            let mut n = CoarseNbrInfo::new(ids[0], orth_on_coarse);
            n.rank = ranks[0] as i32;
            Ok(NeighborInfo::Coarse(n))
        }
        "FINE" => {
            let ids = int_arr("ids")?;
            let ranks = int_arr("ranks")?;
            if ids.len() != ranks.len() {
                return Err(RuntimeError::Malformed("FINE neighbor ids/ranks length mismatch".into()));
            }
            let mut n = FineNbrInfo::new(ids);
            n.ranks = ranks.into_iter().map(|r| r as i32).collect();
            Ok(NeighborInfo::Fine(n))
        }
        other => Err(RuntimeError::Malformed(format!("unknown neighbor type \"{}\"", other))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_patch() -> PatchInfo {
        let mut p = PatchInfo::new(2);
        p.id = 7;
        p.rank = 1;
        p.refine_level = 2;
        p.ns = vec![10, 10];
        p.starts = vec![0.0, 0.0];
        p.spacings = vec![0.1, 0.1];
        p.num_ghost_cells = 1;
        p.set_nbr_info(Side::East, NeighborInfo::Normal(NormalNbrInfo::new(8)));
        p.set_nbr_info(
            Side::North,
            NeighborInfo::Coarse(CoarseNbrInfo::new(9, Some(Orthant::lower()))),
        );
        p.set_nbr_info(Orthant::ne(), NeighborInfo::Fine(FineNbrInfo::new(vec![3, 4, 5, 6])));
        p
    }

    #[test]
    fn binary_round_trip_preserves_every_field() {
        let p = sample_patch();
        let bytes = p.serialize().unwrap();
        let back = PatchInfo::deserialize(&bytes).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn json_round_trip_preserves_topology_fields() {
        let p = sample_patch();
        let value = p.to_json();
        let back = PatchInfo::from_json(&value).unwrap();
        assert_eq!(back.id, p.id);
        assert_eq!(back.rank, p.rank);
        assert_eq!(back.refine_level, p.refine_level);
        assert_eq!(back.starts, p.starts);
        // ns/num_ghost_cells/indices are outside the schema and snap to defaults.
        assert_eq!(back.ns, vec![1, 1]);
        assert_eq!(back.num_ghost_cells, 0);
        assert_eq!(back.local_index, -1);

        let east = back.get_normal_nbr_info(Side::East).unwrap();
        assert_eq!(east.id, 8);
        let north = back.get_coarse_nbr_info(Side::North).unwrap();
        assert_eq!(north.id, 9);
        assert_eq!(north.orth_on_coarse, Some(Orthant::lower()));
        let fine = back.get_fine_nbr_info(Orthant::ne()).unwrap();
        assert_eq!(fine.ids, vec![3, 4, 5, 6]);
    }

    #[test]
    fn wrong_variant_access_is_an_error() {
        let p = sample_patch();
        let err = p.get_fine_nbr_info(Side::East).unwrap_err();
        assert!(matches!(err, RuntimeError::WrongNeighborVariant { .. }));
    }

    #[test]
    fn missing_neighbor_means_physical_boundary() {
        let p = sample_patch();
        assert!(!p.has_nbr(Side::West));
        assert!(p.get_nbr_type(Side::West).is_none());
    }

    #[test]
    fn nbr_ids_are_in_canonical_order() {
        let p = sample_patch();
        // Side order (West..North, dim 2 -> 4 sides), then corners; the
        // corner slot holds a Fine neighbor so all 4 of its ids are flattened in.
        assert_eq!(p.nbr_ids(), vec![8, 9, 3, 4, 5, 6]);
    }
}
