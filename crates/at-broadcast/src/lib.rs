#![forbid(unsafe_code)]

use std::fmt;

use at_core::{CanonicalArgument, checked_numel, contiguous_strides};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastMode {
    ElementWise,
    CartesianProduct,
}

impl BroadcastMode {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ElementWise => "element_wise",
            Self::CartesianProduct => "cartesian_product",
        }
    }

    #[must_use]
    pub const fn from_flag(cartesian_product: bool) -> Self {
        if cartesian_product {
            Self::CartesianProduct
        } else {
            Self::ElementWise
        }
    }
}

/// Maps output coordinates onto one argument's flat buffer. A stride of 0
/// marks an output axis the argument does not vary along.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMap {
    strides: Vec<usize>,
}

impl IndexMap {
    fn constant(rank: usize) -> Self {
        Self {
            strides: vec![0; rank],
        }
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn is_constant(&self) -> bool {
        self.strides.iter().all(|stride| *stride == 0)
    }

    #[must_use]
    pub fn local_index(&self, coordinates: &[usize]) -> usize {
        coordinates
            .iter()
            .zip(self.strides.iter())
            .map(|(coord, stride)| coord * stride)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPlan {
    mode: BroadcastMode,
    output_shape: Vec<usize>,
    output_len: usize,
    index_maps: Vec<IndexMap>,
}

impl BroadcastPlan {
    #[must_use]
    pub fn mode(&self) -> BroadcastMode {
        self.mode
    }

    #[must_use]
    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    #[must_use]
    pub fn output_len(&self) -> usize {
        self.output_len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.output_len == 0
    }

    #[must_use]
    pub fn index_maps(&self) -> &[IndexMap] {
        &self.index_maps
    }

    /// Local flat index of `argument` at row-major output position `global`.
    #[must_use]
    pub fn local_index(&self, argument: usize, global: usize) -> Option<usize> {
        let map = self.index_maps.get(argument)?;
        if global >= self.output_len {
            return None;
        }
        let mut remainder = global;
        let mut local = 0usize;
        for (dim, stride) in self
            .output_shape
            .iter()
            .zip(map.strides.iter())
            .rev()
        {
            local += (remainder % dim) * stride;
            remainder /= dim;
        }
        Some(local)
    }

    /// Visits every output position in row-major order (last axis fastest)
    /// with the matching local index of each argument. Stops at the first
    /// error.
    pub fn for_each_position<E, F>(&self, mut visit: F) -> Result<(), E>
    where
        F: FnMut(usize, &[usize]) -> Result<(), E>,
    {
        if self.is_empty() {
            return Ok(());
        }

        let rank = self.output_shape.len();
        let mut coordinates = vec![0usize; rank];
        let mut locals = vec![0usize; self.index_maps.len()];

        for global in 0..self.output_len {
            visit(global, &locals)?;

            for axis in (0..rank).rev() {
                coordinates[axis] += 1;
                if coordinates[axis] < self.output_shape[axis] {
                    for (local, map) in locals.iter_mut().zip(self.index_maps.iter()) {
                        *local += map.strides[axis];
                    }
                    break;
                }
                let wrapped = self.output_shape[axis] - 1;
                coordinates[axis] = 0;
                for (local, map) in locals.iter_mut().zip(self.index_maps.iter()) {
                    *local -= map.strides[axis] * wrapped;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    IncompatibleShapes { lhs: Vec<usize>, rhs: Vec<usize> },
    ShapeOverflow { shape: Vec<usize> },
}

impl fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncompatibleShapes { lhs, rhs } => write!(
                f,
                "shapes {lhs:?} and {rhs:?} cannot be broadcast together"
            ),
            Self::ShapeOverflow { shape } => {
                write!(f, "output shape {shape:?} overflows the index space")
            }
        }
    }
}

impl std::error::Error for BroadcastError {}

pub fn plan<S: AsRef<[usize]>>(
    shapes: &[S],
    mode: BroadcastMode,
) -> Result<BroadcastPlan, BroadcastError> {
    let (output_shape, index_maps) = match mode {
        BroadcastMode::ElementWise => element_wise_layout(shapes)?,
        BroadcastMode::CartesianProduct => cartesian_layout(shapes),
    };

    let output_len = checked_numel(&output_shape).ok_or_else(|| BroadcastError::ShapeOverflow {
        shape: output_shape.clone(),
    })?;

    if output_len == 0 {
        return Ok(BroadcastPlan {
            mode,
            output_shape: vec![0],
            output_len: 0,
            index_maps: vec![IndexMap::constant(1); shapes.len()],
        });
    }

    Ok(BroadcastPlan {
        mode,
        output_shape,
        output_len,
        index_maps,
    })
}

pub fn plan_arguments(
    arguments: &[CanonicalArgument],
    mode: BroadcastMode,
) -> Result<BroadcastPlan, BroadcastError> {
    let shapes: Vec<&[usize]> = arguments.iter().map(CanonicalArgument::shape).collect();
    plan(&shapes, mode)
}

fn element_wise_layout<S: AsRef<[usize]>>(
    shapes: &[S],
) -> Result<(Vec<usize>, Vec<IndexMap>), BroadcastError> {
    let rank = shapes
        .iter()
        .map(|shape| shape.as_ref().len())
        .max()
        .unwrap_or(0);

    let mut output_shape = vec![1usize; rank];
    let mut owners: Vec<Option<usize>> = vec![None; rank];
    for (arg_index, shape) in shapes.iter().enumerate() {
        let shape = shape.as_ref();
        let offset = rank - shape.len();
        for (local_axis, dim) in shape.iter().copied().enumerate() {
            let axis = offset + local_axis;
            if dim == 1 {
                continue;
            }
            match owners[axis] {
                None => {
                    output_shape[axis] = dim;
                    owners[axis] = Some(arg_index);
                }
                Some(_) if output_shape[axis] == dim => {}
                Some(owner) => {
                    return Err(BroadcastError::IncompatibleShapes {
                        lhs: shapes[owner].as_ref().to_vec(),
                        rhs: shape.to_vec(),
                    });
                }
            }
        }
    }

    let index_maps = shapes
        .iter()
        .map(|shape| {
            let shape = shape.as_ref();
            let own_strides = contiguous_strides(shape);
            let offset = rank - shape.len();
            let mut strides = vec![0usize; rank];
            for (local_axis, (dim, stride)) in shape.iter().zip(own_strides).enumerate() {
                if *dim != 1 {
                    strides[offset + local_axis] = stride;
                }
            }
            IndexMap { strides }
        })
        .collect();

    Ok((output_shape, index_maps))
}

fn cartesian_layout<S: AsRef<[usize]>>(shapes: &[S]) -> (Vec<usize>, Vec<IndexMap>) {
    let output_shape: Vec<usize> = shapes
        .iter()
        .flat_map(|shape| shape.as_ref().iter().copied())
        .collect();
    let rank = output_shape.len();

    let mut offset = 0usize;
    let index_maps = shapes
        .iter()
        .map(|shape| {
            let shape = shape.as_ref();
            let mut strides = vec![0usize; rank];
            for (local_axis, stride) in contiguous_strides(shape).into_iter().enumerate() {
                strides[offset + local_axis] = stride;
            }
            offset += shape.len();
            IndexMap { strides }
        })
        .collect();

    (output_shape, index_maps)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::{BroadcastError, BroadcastMode, plan};

    fn det_seed(parts: &[usize]) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for value in parts {
            for byte in value.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }

    fn build_property_log(
        test_id: &str,
        mode: BroadcastMode,
        seed: u64,
        output_digest: u64,
        reason_code: &str,
    ) -> BTreeMap<String, String> {
        let mut log = BTreeMap::new();
        log.insert("suite_id".to_string(), "at_broadcast_property".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert("mode".to_string(), mode.label().to_string());
        log.insert("seed".to_string(), seed.to_string());
        log.insert(
            "output_digest".to_string(),
            format!("det64:{output_digest:016x}"),
        );
        log.insert(
            "replay_command".to_string(),
            format!("cargo test -p at-broadcast {test_id} -- --nocapture"),
        );
        log.insert("outcome".to_string(), "pass".to_string());
        log.insert("reason_code".to_string(), reason_code.to_string());
        log
    }

    fn assert_log_contract(log: &BTreeMap<String, String>) {
        for key in [
            "suite_id",
            "test_id",
            "mode",
            "seed",
            "output_digest",
            "replay_command",
            "outcome",
            "reason_code",
        ] {
            assert!(log.contains_key(key), "property log missing key '{key}'");
        }
    }

    fn walk(plan: &super::BroadcastPlan) -> Vec<Vec<usize>> {
        let mut visited = Vec::new();
        plan.for_each_position::<(), _>(|_, locals| {
            visited.push(locals.to_vec());
            Ok(())
        })
        .expect("walk without errors");
        visited
    }

    #[test]
    fn element_wise_stretches_size_one_axes() {
        let plan = plan(&[vec![2usize, 1], vec![3]], BroadcastMode::ElementWise)
            .expect("(2,1) and (3,) broadcast");
        assert_eq!(plan.output_shape(), &[2, 3]);
        assert_eq!(
            walk(&plan),
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2],
            ]
        );
    }

    #[test]
    fn element_wise_scalars_use_constant_index() {
        let plan = plan(&[vec![], vec![3usize], vec![]], BroadcastMode::ElementWise)
            .expect("scalars broadcast against anything");
        assert_eq!(plan.output_shape(), &[3]);
        assert!(plan.index_maps()[0].is_constant());
        assert!(plan.index_maps()[2].is_constant());
        assert_eq!(plan.local_index(1, 2), Some(2));
        assert_eq!(plan.local_index(0, 2), Some(0));
    }

    #[test]
    fn element_wise_rejects_disagreeing_sizes() {
        let err = plan(&[vec![3usize], vec![4]], BroadcastMode::ElementWise)
            .expect_err("(3,) vs (4,) must fail");
        assert_eq!(
            err,
            BroadcastError::IncompatibleShapes {
                lhs: vec![3],
                rhs: vec![4],
            }
        );
    }

    #[test]
    fn element_wise_checks_compatibility_before_zero_collapse() {
        let err = plan(&[vec![0usize], vec![3]], BroadcastMode::ElementWise)
            .expect_err("(0,) vs (3,) is not broadcastable");
        assert!(matches!(err, BroadcastError::IncompatibleShapes { .. }));

        let plan = plan(&[vec![0usize], vec![1]], BroadcastMode::ElementWise)
            .expect("(0,) stretches (1,)");
        assert_eq!(plan.output_shape(), &[0]);
        assert!(walk(&plan).is_empty());
    }

    #[test]
    fn all_scalars_produce_single_position() {
        for mode in [BroadcastMode::ElementWise, BroadcastMode::CartesianProduct] {
            let plan = plan(&[Vec::<usize>::new(), Vec::new()], mode).expect("scalars plan");
            assert_eq!(plan.output_shape(), &[] as &[usize]);
            assert_eq!(plan.output_len(), 1);
            assert_eq!(walk(&plan), vec![vec![0, 0]]);
        }
    }

    #[test]
    fn cartesian_concatenates_axes_in_argument_order() {
        let plan = plan(&[vec![2usize], vec![], vec![3], vec![4]], BroadcastMode::CartesianProduct)
            .expect("cartesian plan");
        assert_eq!(plan.output_shape(), &[2, 3, 4]);
        assert_eq!(plan.index_maps()[0].strides(), &[1, 0, 0]);
        assert!(plan.index_maps()[1].is_constant());
        assert_eq!(plan.index_maps()[2].strides(), &[0, 1, 0]);
        assert_eq!(plan.index_maps()[3].strides(), &[0, 0, 1]);

        // output (1, 2, 3) sits at 1*12 + 2*4 + 3
        let global = 12 + 8 + 3;
        assert_eq!(plan.local_index(0, global), Some(1));
        assert_eq!(plan.local_index(2, global), Some(2));
        assert_eq!(plan.local_index(3, global), Some(3));
        assert_eq!(plan.index_maps()[2].local_index(&[1, 2, 3]), 2);
    }

    #[test]
    fn cartesian_keeps_multi_dim_arguments_intact() {
        let plan = plan(&[vec![2usize, 2], vec![3]], BroadcastMode::CartesianProduct)
            .expect("cartesian plan");
        assert_eq!(plan.output_shape(), &[2, 2, 3]);
        assert_eq!(plan.index_maps()[0].strides(), &[2, 1, 0]);
        assert_eq!(plan.index_maps()[1].strides(), &[0, 0, 1]);
    }

    #[test]
    fn cartesian_with_empty_argument_collapses() {
        let plan = plan(&[vec![0usize], vec![3], vec![4]], BroadcastMode::CartesianProduct)
            .expect("empty cartesian plan");
        assert_eq!(plan.output_shape(), &[0]);
        assert!(plan.is_empty());
        assert!(walk(&plan).is_empty());
        assert_eq!(plan.local_index(0, 0), None);
    }

    #[test]
    fn walk_stops_at_first_error() {
        let plan = plan(&[vec![5usize]], BroadcastMode::ElementWise).expect("plan");
        let mut seen = 0usize;
        let result = plan.for_each_position(|global, _| {
            seen += 1;
            if global == 2 { Err("stop") } else { Ok(()) }
        });
        assert_eq!(result, Err("stop"));
        assert_eq!(seen, 3);
    }

    #[test]
    fn overflowing_shape_is_rejected() {
        let err = plan(&[vec![usize::MAX], vec![2]], BroadcastMode::CartesianProduct)
            .expect_err("overflow must fail");
        assert!(matches!(err, BroadcastError::ShapeOverflow { .. }));
    }

    proptest! {
        #[test]
        fn prop_cartesian_walk_matches_coordinate_formula(
            shapes in prop::collection::vec(prop::collection::vec(1usize..=3, 0..=2), 1..=3),
        ) {
            let plan = plan(&shapes, BroadcastMode::CartesianProduct).expect("cartesian plan");
            let expected_shape: Vec<usize> = shapes.iter().flatten().copied().collect();
            prop_assert_eq!(plan.output_shape(), expected_shape.as_slice());

            let mut visits = 0usize;
            plan.for_each_position::<(), _>(|global, locals| {
                for (argument, local) in locals.iter().enumerate() {
                    assert_eq!(plan.local_index(argument, global), Some(*local));
                }
                visits += 1;
                Ok(())
            })
            .expect("walk without errors");
            prop_assert_eq!(visits, plan.output_len());

            let seed = det_seed(expected_shape.as_slice());
            let log = build_property_log(
                "prop_cartesian_walk_matches_coordinate_formula",
                BroadcastMode::CartesianProduct,
                seed,
                visits as u64,
                "cartesian_walk_contract_ok",
            );
            assert_log_contract(&log);
        }

        #[test]
        fn prop_element_wise_stretches_size_one_axes(
            base in prop::collection::vec(1usize..=4, 0..=3),
            ones in prop::collection::vec(any::<(bool, bool)>(), 3),
            drops in (0usize..=3, 0usize..=3),
        ) {
            let derive = |drop: usize, pick: fn(&(bool, bool)) -> bool| -> Vec<usize> {
                let start = drop.min(base.len());
                base[start..]
                    .iter()
                    .zip(&ones[start..])
                    .map(|(dim, flags)| if pick(flags) { 1 } else { *dim })
                    .collect()
            };
            let left = derive(drops.0, |flags| flags.0);
            let right = derive(drops.1, |flags| flags.1);

            let rank = left.len().max(right.len());
            let padded = |shape: &[usize]| -> Vec<usize> {
                let mut out = vec![1usize; rank - shape.len()];
                out.extend_from_slice(shape);
                out
            };
            let (left_padded, right_padded) = (padded(&left), padded(&right));
            let expected: Vec<usize> = left_padded
                .iter()
                .zip(&right_padded)
                .map(|(l, r)| *l.max(r))
                .collect();

            let plan = plan(&[left.clone(), right.clone()], BroadcastMode::ElementWise)
                .expect("shapes derived from one base broadcast");
            prop_assert_eq!(plan.output_shape(), expected.as_slice());
            prop_assert_eq!(plan.output_len(), expected.iter().product::<usize>());

            let local_from_coords = |shape: &[usize], coords: &[usize]| -> usize {
                shape.iter().zip(coords).fold(0, |acc, (dim, coord)| {
                    acc * dim + if *dim == 1 { 0 } else { *coord }
                })
            };
            let mut visits = 0usize;
            plan.for_each_position::<(), _>(|global, locals| {
                let mut coords = vec![0usize; rank];
                let mut rest = global;
                for axis in (0..rank).rev() {
                    coords[axis] = rest % expected[axis];
                    rest /= expected[axis];
                }
                assert_eq!(locals[0], local_from_coords(&left_padded, &coords));
                assert_eq!(locals[1], local_from_coords(&right_padded, &coords));
                for (argument, local) in locals.iter().enumerate() {
                    assert_eq!(plan.local_index(argument, global), Some(*local));
                }
                visits += 1;
                Ok(())
            })
            .expect("walk without errors");
            prop_assert_eq!(visits, plan.output_len());

            let seed = det_seed(expected.as_slice());
            let log = build_property_log(
                "prop_element_wise_stretches_size_one_axes",
                BroadcastMode::ElementWise,
                seed,
                visits as u64,
                "element_wise_stretch_contract_ok",
            );
            assert_log_contract(&log);
        }

        #[test]
        fn prop_element_wise_against_scalar_keeps_shape(shape in prop::collection::vec(1usize..=4, 1..=3)) {
            let plan = plan(&[shape.clone(), Vec::new()], BroadcastMode::ElementWise)
                .expect("scalar broadcasts");
            prop_assert_eq!(plan.output_shape(), shape.as_slice());
            prop_assert!(plan.index_maps()[1].is_constant());

            let seed = det_seed(shape.as_slice());
            let log = build_property_log(
                "prop_element_wise_against_scalar_keeps_shape",
                BroadcastMode::ElementWise,
                seed,
                plan.output_len() as u64,
                "element_wise_scalar_contract_ok",
            );
            assert_log_contract(&log);
        }
    }
}
