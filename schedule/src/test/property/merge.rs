//! Merges either restructure soundly or change nothing.

use proptest::prelude::*;
use strata_ir::OpId;

use crate::builder::build;
use crate::merge::merge;
use crate::test::helpers::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn merge_is_sound_or_inert(
        len in 2usize..=4,
        levels in 1usize..=3,
        requests in prop::collection::vec((0u32..4, 0u32..4, 0usize..3), 1..6),
    ) {
        let mut tree = build(&chain(len, &[8, 4]), levels).unwrap();
        for (consumer, producer, level) in requests {
            let (consumer, producer) = (OpId(consumer), OpId(producer));
            let before = tree.snapshot();
            let roots = tree.children(tree.root()).len();

            if merge(&mut tree, consumer, producer, level) {
                prop_assert!(tree.validate().is_ok());
                prop_assert!(level > 0);
                prop_assert!(tree.share_tile(consumer, producer));
                let outer = tree
                    .chain(consumer)
                    .into_iter()
                    .find(|&t| tree.tile(t).is_some_and(|t| t.op == consumer && t.level == level));
                prop_assert!(outer.is_some());
                let producer_node = tree.op_node(producer).unwrap();
                prop_assert!(tree.is_ancestor(outer.unwrap(), producer_node));
                if level + 1 == levels {
                    prop_assert_eq!(tree.children(tree.root()).len(), roots - 1);
                }
            } else {
                prop_assert_eq!(tree.snapshot(), before);
            }
        }
    }
}
