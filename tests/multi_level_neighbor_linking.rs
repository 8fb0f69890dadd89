//! Cross-module integration test: `DomainGenerator` walks a two-rank,
//! two-level `UniformOctree` coarsening sequence and the resulting
//! `Domain`s carry correctly linked same-level and parent/child neighbor
//! topology, all over an in-process `LocalCommunicator`.

use patchgrid::comm::local::LocalCommunicator;
use patchgrid::domain_generator::{identity_block_map, DomainGenerator};
use patchgrid::face::Side;
use patchgrid::octree::UniformOctree;

#[test]
fn two_rank_coarsening_sequence_links_every_level() {
    let mut group = LocalCommunicator::new_group(2);
    let comm1 = group.pop().unwrap();
    let comm0 = group.pop().unwrap();

    let run = |comm, my_rank: i32| {
        let tree = UniformOctree::new(2, 2, 2, my_rank);
        let mut gen = DomainGenerator::new(tree, identity_block_map(1.0), vec![4, 4], 1, comm);

        assert!(gen.has_coarser_domain());
        let finest = gen.get_finest_domain().unwrap();
        assert_eq!(finest.get_num_global_patches(), 16);

        // Every finest patch has a parent, and every parent belongs to the
        // next-coarser level's global patch set.
        for p in finest.patches() {
            assert_ne!(p.parent_id, -1);
            assert!(p.orth_on_parent.is_some());
        }

        assert!(gen.has_coarser_domain());
        let mid = gen.get_coarser_domain().unwrap();
        assert_eq!(mid.get_num_global_patches(), 4);

        assert!(!gen.has_coarser_domain());
        let coarsest = gen.get_coarser_domain().unwrap();
        assert_eq!(coarsest.get_num_global_patches(), 1);
        for side in Side::for_dim(2) {
            for p in coarsest.patches() {
                assert!(!p.has_nbr(side));
            }
        }

        (finest.get_num_global_patches(), mid.get_num_global_patches(), coarsest.get_num_global_patches())
    };

    let h0 = std::thread::spawn(move || run(comm0, 0));
    let h1 = std::thread::spawn(move || run(comm1, 1));

    assert_eq!(h0.join().unwrap(), (16, 4, 1));
    assert_eq!(h1.join().unwrap(), (16, 4, 1));
}

#[test]
fn single_rank_finest_level_has_same_level_neighbors_on_every_interior_face() {
    let group = LocalCommunicator::new_group(1);
    let comm = group.into_iter().next().unwrap();

    let tree = UniformOctree::new(2, 2, 1, 0);
    let mut gen = DomainGenerator::new(tree, identity_block_map(1.0), vec![4, 4], 1, comm);
    let finest = gen.get_finest_domain().unwrap();
    assert_eq!(finest.get_num_global_patches(), 16);

    // A 4x4 grid of unit-square leaves has exactly 24 interior faces (2 *
    // 4 * 3), each resolved from both sides, so 48 of the 64 total
    // side-slots (16 patches * 4 sides) carry a same-level neighbor.
    let linked: usize = finest
        .patches()
        .iter()
        .flat_map(|p| Side::for_dim(2).map(move |s| p.has_nbr(s)))
        .filter(|&has| has)
        .count();
    assert_eq!(linked, 48);
}
