//! Compile-time-flavored, runtime-dispatched face algebra.
//!
//! A face could be monomorphized over a const-generic dimension
//! (`Face<D,M>`) or dispatched at runtime on a small enum. `patchgrid`
//! takes the enum route: `Side`, `Edge`, and `Orthant` are plain values
//! carrying their own dimensionality, which keeps `PatchInfo`/`Domain` free
//! of const-generic array lengths.

use serde::{Deserialize, Serialize};

/// One face of a `D`-dimensional patch, `D` in `{1,2,3}`.
///
/// Index values are load-bearing: `west=0, east=1, south=2, north=3,
/// bottom=4, top=5`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    West,
    East,
    South,
    North,
    Bottom,
    Top,
}

impl Side {
    /// The six sides, in canonical index order.
    const ALL: [Side; 6] = [
        Side::West,
        Side::East,
        Side::South,
        Side::North,
        Side::Bottom,
        Side::Top,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The sides that exist on a patch of dimension `ndims`.
    pub fn for_dim(ndims: usize) -> impl Iterator<Item = Side> {
        let n = match ndims {
            1 => 2,
            2 => 4,
            3 => 6,
            _ => panic!("dimension must be 1, 2, or 3"),
        };
        Self::ALL.into_iter().take(n)
    }

    pub fn opposite(self) -> Side {
        use Side::*;
        match self {
            West => East,
            East => West,
            South => North,
            North => South,
            Bottom => Top,
            Top => Bottom,
        }
    }

    /// The spatial axis this side lies perpendicular to (`0=x, 1=y, 2=z`).
    pub fn axis_index(self) -> usize {
        use Side::*;
        match self {
            West | East => 0,
            South | North => 1,
            Bottom | Top => 2,
        }
    }

    /// Whether this side is the lower-valued end of its axis.
    pub fn is_lower_on_axis(self) -> bool {
        use Side::*;
        matches!(self, West | South | Bottom)
    }

    /// The sides meeting at this feature. For a `Side` this is just itself,
    /// a one-element list.
    pub fn get_sides(self) -> Vec<Side> {
        vec![self]
    }

    pub fn name(self) -> &'static str {
        use Side::*;
        match self {
            West => "WEST",
            East => "EAST",
            South => "SOUTH",
            North => "NORTH",
            Bottom => "BOTTOM",
            Top => "TOP",
        }
    }

    pub fn from_name(name: &str) -> Option<Side> {
        use Side::*;
        Some(match name {
            "WEST" => West,
            "EAST" => East,
            "SOUTH" => South,
            "NORTH" => North,
            "BOTTOM" => Bottom,
            "TOP" => Top,
            _ => return None,
        })
    }
}

/// A 3-D-only edge, shared between two patches that meet along a 1-D line.
///
/// Index order is load-bearing: `bs=0, tn=1, bn=2, ts=3, bw=4, te=5, be=6,
/// tw=7, sw=8, ne=9, se=10, nw=11`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Edge {
    Bs,
    Tn,
    Bn,
    Ts,
    Bw,
    Te,
    Be,
    Tw,
    Sw,
    Ne,
    Se,
    Nw,
}

impl Edge {
    pub const ALL: [Edge; 12] = [
        Edge::Bs,
        Edge::Tn,
        Edge::Bn,
        Edge::Ts,
        Edge::Bw,
        Edge::Te,
        Edge::Be,
        Edge::Tw,
        Edge::Sw,
        Edge::Ne,
        Edge::Se,
        Edge::Nw,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn iter_all() -> impl Iterator<Item = Edge> {
        Self::ALL.into_iter()
    }

    pub fn opposite(self) -> Edge {
        use Edge::*;
        match self {
            Bs => Tn,
            Tn => Bs,
            Bn => Ts,
            Ts => Bn,
            Bw => Te,
            Te => Bw,
            Be => Tw,
            Tw => Be,
            Sw => Ne,
            Ne => Sw,
            Se => Nw,
            Nw => Se,
        }
    }

    /// The two sides meeting at this edge.
    pub fn get_sides(self) -> Vec<Side> {
        use Edge::*;
        match self {
            Bs => vec![Side::Bottom, Side::South],
            Tn => vec![Side::Top, Side::North],
            Bn => vec![Side::Bottom, Side::North],
            Ts => vec![Side::Top, Side::South],
            Bw => vec![Side::Bottom, Side::West],
            Te => vec![Side::Top, Side::East],
            Be => vec![Side::Bottom, Side::East],
            Tw => vec![Side::Top, Side::West],
            Sw => vec![Side::South, Side::West],
            Ne => vec![Side::North, Side::East],
            Se => vec![Side::South, Side::East],
            Nw => vec![Side::North, Side::West],
        }
    }

    pub fn name(self) -> &'static str {
        use Edge::*;
        match self {
            Bs => "BS",
            Tn => "TN",
            Bn => "BN",
            Ts => "TS",
            Bw => "BW",
            Te => "TE",
            Be => "BE",
            Tw => "TW",
            Sw => "SW",
            Ne => "NE",
            Se => "SE",
            Nw => "NW",
        }
    }

    pub fn from_name(name: &str) -> Option<Edge> {
        Self::ALL.into_iter().find(|e| e.name() == name)
    }
}

/// An orthant of an `ndims`-dimensional feature: one of `2^ndims` equal
/// sub-regions, identified by a bitmask (bit `i` set means "upper half on
/// axis `i`"). `Corner<D>` is the special case `ndims == D`; `Orthant<M>`
/// used as `orth_on_coarse`/`orth_on_parent` is the general case.
///
/// Named constructors give these index values: 2-D corners `sw=0, se=1,
/// nw=2, ne=3`; 3-D corners `bsw=0, bse=1, bnw=2, bne=3, tsw=4, tse=5,
/// tnw=6, tne=7`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Orthant {
    ndims: u8,
    bits: u8,
}

impl Orthant {
    pub fn new(ndims: u8, bits: u8) -> Self {
        assert!(ndims <= 3, "orthants of more than 3 dimensions are not supported");
        assert!(
            (bits as u32) < (1u32 << ndims),
            "bit pattern {} out of range for {} dimensions",
            bits,
            ndims
        );
        Self { ndims, bits }
    }

    pub fn from_index(ndims: u8, index: usize) -> Self {
        Self::new(ndims, index as u8)
    }

    pub fn ndims(self) -> u8 {
        self.ndims
    }

    pub fn index(self) -> usize {
        self.bits as usize
    }

    pub fn num_orthants(ndims: u8) -> usize {
        1usize << ndims
    }

    /// Whether this orthant is on the upper half of `axis` (0-indexed).
    pub fn is_upper_on_axis(self, axis: u8) -> bool {
        (self.bits >> axis) & 1 == 1
    }

    pub fn opposite(self) -> Self {
        let mask = (1u8 << self.ndims) - 1;
        Self::new(self.ndims, (!self.bits) & mask)
    }

    pub fn iter_all(ndims: u8) -> impl Iterator<Item = Orthant> {
        (0..Self::num_orthants(ndims)).map(move |i| Orthant::from_index(ndims, i))
    }

    /// The `ndims` sides meeting at this orthant, in axis order. Only
    /// meaningful when `ndims` matches a patch's spatial dimension (i.e.
    /// when this orthant is being used as a `Corner`).
    pub fn get_sides(self) -> Vec<Side> {
        (0..self.ndims)
            .map(|axis| {
                let lower = match axis {
                    0 => Side::West,
                    1 => Side::South,
                    2 => Side::Bottom,
                    _ => unreachable!(),
                };
                if self.is_upper_on_axis(axis) {
                    lower.opposite()
                } else {
                    lower
                }
            })
            .collect()
    }

    // -- 2-D corner constructors --
    pub fn sw() -> Self {
        Self::new(2, 0)
    }
    pub fn se() -> Self {
        Self::new(2, 1)
    }
    pub fn nw() -> Self {
        Self::new(2, 2)
    }
    pub fn ne() -> Self {
        Self::new(2, 3)
    }

    // -- 3-D corner constructors --
    pub fn bsw() -> Self {
        Self::new(3, 0)
    }
    pub fn bse() -> Self {
        Self::new(3, 1)
    }
    pub fn bnw() -> Self {
        Self::new(3, 2)
    }
    pub fn bne() -> Self {
        Self::new(3, 3)
    }
    pub fn tsw() -> Self {
        Self::new(3, 4)
    }
    pub fn tse() -> Self {
        Self::new(3, 5)
    }
    pub fn tnw() -> Self {
        Self::new(3, 6)
    }
    pub fn tne() -> Self {
        Self::new(3, 7)
    }

    // -- 1-D orthant constructors (used for edge-level orth_on_coarse) --
    pub fn lower() -> Self {
        Self::new(1, 0)
    }
    pub fn upper() -> Self {
        Self::new(1, 1)
    }

    /// The corner name for this orthant, assuming `ndims` matches a patch's
    /// spatial dimension (2 or 3).
    pub fn name(self) -> &'static str {
        match (self.ndims, self.bits) {
            (2, 0) => "SW",
            (2, 1) => "SE",
            (2, 2) => "NW",
            (2, 3) => "NE",
            (3, 0) => "BSW",
            (3, 1) => "BSE",
            (3, 2) => "BNW",
            (3, 3) => "BNE",
            (3, 4) => "TSW",
            (3, 5) => "TSE",
            (3, 6) => "TNW",
            (3, 7) => "TNE",
            (1, 0) => "LOWER",
            (1, 1) => "UPPER",
            _ => "UNKNOWN",
        }
    }

    pub fn from_name(ndims: u8, name: &str) -> Option<Self> {
        Self::iter_all(ndims).find(|o| o.name() == name)
    }
}

/// A corner is the special case of `Orthant` where the feature dimension
/// equals the patch's spatial dimension.
pub type Corner = Orthant;

/// Discriminates the three `NeighborInfo` flavors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NbrType {
    Normal,
    Coarse,
    Fine,
}

impl NbrType {
    pub fn name(self) -> &'static str {
        match self {
            NbrType::Normal => "NORMAL",
            NbrType::Coarse => "COARSE",
            NbrType::Fine => "FINE",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "NORMAL" => NbrType::Normal,
            "COARSE" => NbrType::Coarse,
            "FINE" => NbrType::Fine,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn side_index_values_are_stable() {
        assert_eq!(Side::West.index(), 0);
        assert_eq!(Side::East.index(), 1);
        assert_eq!(Side::South.index(), 2);
        assert_eq!(Side::North.index(), 3);
        assert_eq!(Side::Bottom.index(), 4);
        assert_eq!(Side::Top.index(), 5);
    }

    #[test]
    fn corner_index_values_are_stable() {
        assert_eq!(Corner::bsw().index(), 0);
        assert_eq!(Corner::tne().index(), 7);
    }

    #[test]
    fn edge_index_values_are_stable() {
        assert_eq!(Edge::Bs.index(), 0);
        assert_eq!(Edge::Nw.index(), 11);
    }

    #[test]
    fn opposite_is_an_involution() {
        for side in Side::for_dim(3) {
            assert_eq!(side.opposite().opposite(), side);
        }
        for edge in Edge::iter_all() {
            assert_eq!(edge.opposite().opposite(), edge);
        }
        for corner in Orthant::iter_all(3) {
            assert_eq!(corner.opposite().opposite(), corner);
        }
    }

    #[test]
    fn corner_sides_are_perpendicular_and_distinct() {
        for corner in Orthant::iter_all(3) {
            let sides = corner.get_sides();
            assert_eq!(sides.len(), 3);
            for i in 0..sides.len() {
                for j in 0..sides.len() {
                    if i != j {
                        assert_ne!(sides[i], sides[j]);
                        assert_ne!(sides[i].axis_index(), sides[j].axis_index());
                    }
                }
            }
        }
    }

    #[test]
    fn corner_get_sides_matches_reference_order() {
        assert_eq!(Corner::bsw().get_sides(), vec![Side::West, Side::South, Side::Bottom]);
        assert_eq!(Corner::tne().get_sides(), vec![Side::East, Side::North, Side::Top]);
        assert_eq!(Corner::sw().get_sides(), vec![Side::West, Side::South]);
        assert_eq!(Corner::ne().get_sides(), vec![Side::East, Side::North]);
    }

    #[test]
    fn edge_get_sides_matches_reference() {
        assert_eq!(Edge::Bs.get_sides(), vec![Side::Bottom, Side::South]);
        assert_eq!(Edge::Nw.get_sides(), vec![Side::North, Side::West]);
    }

    #[test]
    fn side_names_round_trip() {
        for side in Side::for_dim(3) {
            assert_eq!(Side::from_name(side.name()), Some(side));
        }
    }

    #[test]
    fn edge_names_round_trip() {
        for edge in Edge::iter_all() {
            assert_eq!(Edge::from_name(edge.name()), Some(edge));
        }
    }

    #[test]
    fn corner_names_round_trip() {
        for corner in Orthant::iter_all(3) {
            assert_eq!(Orthant::from_name(3, corner.name()), Some(corner));
        }
    }
}
