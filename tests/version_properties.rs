use std::cmp::Ordering;
use std::str::FromStr;

use proptest::prelude::*;

use pkgforge::capability::{Capability, Version};

/// Versions assembled from explicit parts, so every generated string has a
/// release (the wildcard rule would otherwise make ordering only partial).
fn version_strategy() -> impl Strategy<Value = Version> {
    (
        0u64..3,
        proptest::collection::vec((0u32..30, "[a-c]{0,2}"), 1..4),
        0u32..5,
    )
        .prop_map(|(epoch, segments, release)| {
            let upstream = segments
                .into_iter()
                .map(|(num, alpha)| format!("{num}{alpha}"))
                .collect::<Vec<_>>()
                .join(".");
            Version::parse(&format!("{epoch}:{upstream}-{release}"))
        })
}

proptest! {
    #[test]
    fn comparison_is_reflexive(v in version_strategy()) {
        prop_assert_eq!(v.compare(&v), Ordering::Equal);
    }

    #[test]
    fn comparison_is_antisymmetric(a in version_strategy(), b in version_strategy()) {
        prop_assert_eq!(a.compare(&b), b.compare(&a).reverse());
    }

    #[test]
    fn comparison_is_transitive(
        a in version_strategy(),
        b in version_strategy(),
        c in version_strategy()
    ) {
        let mut sorted = [a, b, c];
        sorted.sort_by(|x, y| x.compare(y));
        prop_assert_ne!(sorted[0].compare(&sorted[2]), Ordering::Greater);
    }

    #[test]
    fn display_round_trips_through_parse(v in version_strategy()) {
        let reparsed = Version::parse(&v.to_string());
        prop_assert_eq!(v.compare(&reparsed), Ordering::Equal);
    }

    #[test]
    fn point_provides_match_lower_bounds_exactly_when_not_below(
        provided in version_strategy(),
        required in version_strategy()
    ) {
        let provide = Capability::from_str(&format!("x = {provided}")).unwrap();
        let requirement = Capability::from_str(&format!("x >= {required}")).unwrap();
        let satisfied = provide.satisfies(&requirement);
        prop_assert_eq!(satisfied, provided.compare(&required) != Ordering::Less);
    }
}
