// Tests for vole-core: tensor construction, region copies, gradients, ops

use vole_core::{Error, Region, Tensor};

fn host(dims: &[usize], data: &[f32]) -> Tensor {
    Tensor::host_from(dims, data.to_vec()).unwrap()
}

// Construction

#[test]
fn rank_zero_and_rank_four_are_rejected() {
    assert!(matches!(
        Tensor::host(&[]),
        Err(Error::RankUnsupported { rank: 0 })
    ));
    assert!(matches!(
        Tensor::host(&[2, 2, 2, 2]),
        Err(Error::RankUnsupported { rank: 4 })
    ));
}

#[test]
fn zero_sized_dimension_is_rejected() {
    assert!(Tensor::host(&[3, 0]).is_err());
}

#[test]
fn host_from_checks_data_length() {
    assert!(matches!(
        Tensor::host_from(&[2, 3], vec![1.0; 5]),
        Err(Error::LengthMismatch {
            expected: 6,
            got: 5
        })
    ));
}

#[test]
fn empty_clone_matches_shape_and_zeroes() {
    let t = host(&[2, 3], &[1., 2., 3., 4., 5., 6.]);
    let c = t.empty_clone().unwrap();
    assert_eq!(c.dims(), &[2, 3]);
    assert_eq!(c.to_vec().unwrap(), vec![0.0; 6]);
}

#[test]
fn clone_is_a_handle_not_a_copy() {
    let t = host(&[3], &[1., 2., 3.]);
    let h = t.clone();
    assert!(t.same_tensor(&h));
    h.update_raw_data(&[9., 9., 9.]).unwrap();
    assert_eq!(t.to_vec().unwrap(), vec![9., 9., 9.]);
}

// Region copies

#[test]
fn rank1_region_copy_places_only_the_addressed_run() {
    let src = host(&[6], &[1., 2., 3., 4., 5., 6.]);
    let dst = Tensor::host(&[6]).unwrap();
    src.copy_region_to(&dst, &Region::rank1(2, 3), [1, 0, 0])
        .unwrap();
    assert_eq!(dst.to_vec().unwrap(), vec![0., 3., 4., 5., 0., 0.]);
}

#[test]
fn rank2_region_copy_leaves_surroundings_untouched() {
    // 3x3 source with rows [1 2 3], [4 5 6], [7 8 9] (x contiguous).
    let src = host(&[3, 3], &[1., 2., 3., 4., 5., 6., 7., 8., 9.]);
    let dst = Tensor::host_from(&[4, 3], vec![-1.0; 12]).unwrap();
    src.copy_region_to(&dst, &Region::rank2(1, 1, 2, 2), [0, 0, 0])
        .unwrap();
    assert_eq!(
        dst.to_vec().unwrap(),
        vec![5., 6., -1., -1., 8., 9., -1., -1., -1., -1., -1., -1.]
    );
}

#[test]
fn rank3_region_copy_moves_one_inner_slice() {
    // 2x2x2 source; copy the z=1 slice into the z=0 slice of the dst.
    let src = host(&[2, 2, 2], &[0., 1., 2., 3., 4., 5., 6., 7.]);
    let dst = Tensor::host(&[2, 2, 2]).unwrap();
    src.copy_region_to(&dst, &Region::rank3(0, 0, 1, 2, 2, 1), [0, 0, 0])
        .unwrap();
    assert_eq!(dst.to_vec().unwrap(), vec![4., 5., 6., 7., 0., 0., 0., 0.]);
}

#[test]
fn region_copy_between_different_ranks() {
    // One row of a rank-2 tensor into a rank-1 tensor.
    let src = host(&[3, 2], &[1., 2., 3., 4., 5., 6.]);
    let dst = Tensor::host(&[3]).unwrap();
    src.copy_region_to(&dst, &Region::rank2(0, 1, 3, 1), [0, 0, 0])
        .unwrap();
    assert_eq!(dst.to_vec().unwrap(), vec![4., 5., 6.]);
}

#[test]
fn region_copy_validates_both_sides() {
    let src = host(&[4], &[1., 2., 3., 4.]);
    let dst = Tensor::host(&[4]).unwrap();
    // Source overrun.
    assert!(matches!(
        src.copy_region_to(&dst, &Region::rank1(2, 3), [0, 0, 0]),
        Err(Error::RegionOutOfBounds { .. })
    ));
    // Destination overrun.
    assert!(matches!(
        src.copy_region_to(&dst, &Region::rank1(0, 3), [2, 0, 0]),
        Err(Error::RegionOutOfBounds { .. })
    ));
}

#[test]
fn region_copy_into_itself_is_rejected() {
    let t = host(&[4], &[1., 2., 3., 4.]);
    let alias = t.clone();
    assert!(t.copy_region_to(&alias, &Region::rank1(0, 2), [2, 0, 0]).is_err());
}

// Full copies

#[test]
fn host_copy_requires_equal_lengths_not_shapes() {
    let src = host(&[2, 3], &[1., 2., 3., 4., 5., 6.]);
    let dst = Tensor::host(&[6]).unwrap();
    src.copy_to(&dst).unwrap();
    assert_eq!(dst.to_vec().unwrap(), vec![1., 2., 3., 4., 5., 6.]);

    let short = Tensor::host(&[4]).unwrap();
    assert!(src.copy_to(&short).is_err());
}

#[test]
fn copy_to_self_is_a_noop() {
    let t = host(&[3], &[1., 2., 3.]);
    let alias = t.clone();
    t.copy_to(&alias).unwrap();
    assert_eq!(t.to_vec().unwrap(), vec![1., 2., 3.]);
}

// Gradient companion

#[test]
fn gradient_lifecycle() {
    let t = host(&[2, 2], &[1., 2., 3., 4.]);
    assert!(!t.has_gradient());
    assert!(matches!(t.gradient_required(), Err(Error::MissingGradient)));

    t.create_gradient().unwrap();
    let g = t.gradient_required().unwrap();
    assert_eq!(g.dims(), t.dims());
    assert_eq!(g.backend(), t.backend());
    assert_eq!(g.to_vec().unwrap(), vec![0.0; 4]);

    // Idempotent: a second create keeps the same companion.
    g.update_raw_data(&[1., 1., 1., 1.]).unwrap();
    t.create_gradient().unwrap();
    assert_eq!(t.gradient_required().unwrap().to_vec().unwrap(), vec![1.0; 4]);

    t.dispose_gradient();
    assert!(!t.has_gradient());
}

#[test]
fn gradient_is_visible_through_every_handle() {
    let t = host(&[2], &[1., 2.]);
    let h = t.clone();
    t.create_gradient().unwrap();
    assert!(h.has_gradient());
    assert!(h.gradient().unwrap().same_tensor(&t.gradient().unwrap()));
}

// Elementwise ops

#[test]
fn elementwise_ops_on_host() {
    let a = host(&[4], &[1., 2., 3., 4.]);
    let b = host(&[4], &[10., 20., 30., 40.]);
    a.add_assign(&b).unwrap();
    assert_eq!(a.to_vec().unwrap(), vec![11., 22., 33., 44.]);
    a.scale(0.5).unwrap();
    assert_eq!(a.to_vec().unwrap(), vec![5.5, 11., 16.5, 22.]);
    a.scaled_add_assign(&b, -0.1).unwrap();
    assert_eq!(a.to_vec().unwrap(), vec![4.5, 9., 13.5, 18.]);
    a.mul_assign(&b).unwrap();
    assert_eq!(a.to_vec().unwrap(), vec![45., 180., 405., 720.]);
    a.zero().unwrap();
    assert_eq!(a.to_vec().unwrap(), vec![0.0; 4]);
}

#[test]
fn elementwise_ops_reject_aliasing_and_length_mismatch() {
    let a = host(&[3], &[1., 2., 3.]);
    let alias = a.clone();
    assert!(a.add_assign(&alias).is_err());
    let b = host(&[2], &[1., 2.]);
    assert!(a.add_assign(&b).is_err());
}

#[test]
fn sum_of_squares_matches_hand_computation() {
    let t = host(&[3], &[1., -2., 3.]);
    assert_eq!(t.sum_of_squares().unwrap(), 14.0);
}

#[test]
fn map_host_rejects_nothing_on_host() {
    let t = host(&[2], &[3., 4.]);
    let total = t.map_host(|v| v.iter().sum::<f32>()).unwrap();
    assert_eq!(total, 7.0);
    t.map_host_mut(|v| v[0] = 9.0).unwrap();
    assert_eq!(t.to_vec().unwrap(), vec![9., 4.]);
}
