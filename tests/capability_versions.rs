use std::cmp::Ordering;
use std::str::FromStr;

use pkgforge::capability::{Capability, CompareOp, Version};

#[test]
fn unversioned_requirements_parse_and_display() {
    let cap = Capability::from_str("bash").expect("parse");
    assert_eq!(cap.name, "bash");
    assert!(cap.constraint.is_none());
    assert_eq!(cap.to_string(), "bash");
}

#[test]
fn versioned_requirements_round_trip_through_display() {
    for raw in [
        "bash >= 4.0",
        "openssl = 3.0.7-2",
        "rpmlib(CompressedFileNames) <= 3.0.4-1",
        "libfoo > 2:1.4",
    ] {
        let cap = Capability::from_str(raw).expect("parse");
        assert_eq!(cap.to_string(), raw, "round trip of '{raw}'");
    }
}

#[test]
fn file_and_parenthesized_names_are_accepted() {
    assert_eq!(Capability::from_str("/bin/sh").expect("parse").name, "/bin/sh");
    assert_eq!(
        Capability::from_str("config(foo) = 1.0-1").expect("parse").name,
        "config(foo)"
    );
}

#[test]
fn malformed_requirements_are_rejected() {
    assert!(Capability::from_str("").is_err());
    assert!(Capability::from_str("foo ~> 1.0").is_err());
    assert!(Capability::from_str("foo >=").is_err());
    assert!(Capability::from_str("foo >= 1.0 extra").is_err());
}

#[test]
fn rpmlib_dependencies_are_recognized() {
    assert!(Capability::from_str("rpmlib(FileDigests) <= 4.6.0-1")
        .expect("parse")
        .is_rpmlib());
    assert!(!Capability::from_str("rpm-libs = 4.18").expect("parse").is_rpmlib());
}

#[test]
fn numeric_segments_compare_as_integers() {
    let a = Version::parse("1.2");
    let b = Version::parse("1.10");
    assert_eq!(a.compare(&b), Ordering::Less);

    // Leading zeros are insignificant.
    let a = Version::parse("1.02");
    let b = Version::parse("1.2");
    assert_eq!(a.compare(&b), Ordering::Equal);
}

#[test]
fn numeric_beats_alphabetic_and_longer_wins() {
    assert_eq!(
        Version::parse("1.0a").compare(&Version::parse("1.0.1")),
        Ordering::Less
    );
    assert_eq!(
        Version::parse("1.0").compare(&Version::parse("1.0.1")),
        Ordering::Less
    );
}

#[test]
fn tilde_sorts_before_the_release() {
    assert_eq!(
        Version::parse("1.0~rc1").compare(&Version::parse("1.0")),
        Ordering::Less
    );
    assert_eq!(
        Version::parse("1.0~rc1").compare(&Version::parse("1.0~rc2")),
        Ordering::Less
    );
}

#[test]
fn epoch_dominates_everything() {
    assert_eq!(
        Version::parse("2:0.1").compare(&Version::parse("1:99")),
        Ordering::Greater
    );
}

#[test]
fn missing_release_acts_as_a_wildcard() {
    let bare = Version::parse("1.0");
    let with_release = Version::parse("1.0-5");
    assert_eq!(bare.compare(&with_release), Ordering::Equal);

    let other_release = Version::parse("1.0-7");
    assert_eq!(with_release.compare(&other_release), Ordering::Less);
}

#[test]
fn point_provides_satisfy_ranges() {
    let provide = Capability::from_str("bash = 5.0-1").expect("parse");

    assert!(provide.satisfies(&Capability::from_str("bash").expect("parse")));
    assert!(provide.satisfies(&Capability::from_str("bash >= 4.0").expect("parse")));
    assert!(provide.satisfies(&Capability::from_str("bash <= 5.0-1").expect("parse")));
    assert!(!provide.satisfies(&Capability::from_str("bash > 5.0-1").expect("parse")));
    assert!(!provide.satisfies(&Capability::from_str("bash < 5.0").expect("parse")));
    assert!(!provide.satisfies(&Capability::from_str("zsh >= 4.0").expect("parse")));
}

#[test]
fn unversioned_provides_satisfy_any_requirement() {
    let provide = Capability::from_str("libfoo").expect("parse");
    assert!(provide.satisfies(&Capability::from_str("libfoo >= 9.9").expect("parse")));
    assert!(provide.satisfies(&Capability::from_str("libfoo = 1.0").expect("parse")));
}

#[test]
fn exclusive_bounds_do_not_touch() {
    let provide = Capability::versioned("x", CompareOp::Greater, Version::parse("1.0"));
    let required = Capability::versioned("x", CompareOp::Less, Version::parse("1.0"));
    assert!(!provide.satisfies(&required));

    let provide = Capability::versioned("x", CompareOp::GreaterOrEqual, Version::parse("1.0"));
    let required = Capability::versioned("x", CompareOp::LessOrEqual, Version::parse("1.0"));
    assert!(provide.satisfies(&required));
}
