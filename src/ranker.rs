//! Marginal benefit of an organ for a given host.

use crate::features::FeatureDict;
use crate::model::WeightMap;
use crate::organ::Organ;
use rustc_hash::FxHashSet;

/// Organs requiring more permissions than this are not considered.
pub const MAX_ORGAN_PERMISSIONS: usize = 1;
/// Organs referencing more classes than this are not considered.
pub const MAX_ORGAN_CLASSES: usize = 20;

/// Contribution of `organ` towards the benign side of the boundary, given the
/// host's current features and classes. Lower is better; `0.0` means no
/// benefit.
///
/// Organs that share a class with the host, or that exceed the permission or
/// class limits, contribute nothing. Otherwise the weights of every organ
/// feature the classifier knows and the host does not yet have are summed.
pub fn contributions(
    organ: &Organ,
    weights: &WeightMap,
    host_features: &FeatureDict,
    host_classes: &FxHashSet<String>,
) -> f64 {
    if organ.classes.iter().any(|c| host_classes.contains(c)) {
        return 0.0;
    }

    // Keep organs within benign statistical norms
    if organ.permissions.len() > MAX_ORGAN_PERMISSIONS || organ.classes.len() > MAX_ORGAN_CLASSES {
        return 0.0;
    }

    organ
        .feature_dict
        .keys()
        .filter(|f| !host_features.contains_key(*f))
        .filter_map(|f| weights.get(f))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn organ(features: &[&str], classes: &[&str], permissions: &[&str]) -> Organ {
        Organ {
            feature: features[0].to_string(),
            donor: PathBuf::from("/apps/D.apk"),
            feature_dict: features.iter().map(|f| (f.to_string(), 1.0)).collect(),
            classes: classes.iter().map(|c| c.to_string()).collect(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            needs_vein: false,
            dangerous_permissions: false,
            extraction_time: 1.0,
            location: PathBuf::from("/ice/x/D"),
        }
    }

    fn weights() -> WeightMap {
        WeightMap::from([
            ("urls::a".to_string(), -0.4),
            ("urls::b".to_string(), -0.2),
            ("urls::c".to_string(), 0.1),
        ])
    }

    fn classes(names: &[&str]) -> FxHashSet<String> {
        names.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_shared_class_contributes_nothing() {
        let o = organ(&["urls::a", "urls::b"], &["A", "B"], &[]);
        assert_eq!(contributions(&o, &weights(), &FeatureDict::new(), &classes(&["A"])), 0.0);
    }

    #[test]
    fn test_limits() {
        let o = organ(&["urls::a"], &["B"], &["p::1", "p::2"]);
        assert_eq!(contributions(&o, &weights(), &FeatureDict::new(), &classes(&[])), 0.0);

        let many: Vec<String> = (0..21).map(|i| format!("C{i}")).collect();
        let many: Vec<&str> = many.iter().map(String::as_str).collect();
        let o = organ(&["urls::a"], &many, &[]);
        assert_eq!(contributions(&o, &weights(), &FeatureDict::new(), &classes(&[])), 0.0);

        let o = organ(&["urls::a"], &many[..20], &["p::1"]);
        assert_eq!(contributions(&o, &weights(), &FeatureDict::new(), &classes(&[])), -0.4);
    }

    #[test]
    fn test_only_novel_known_features_count() {
        let o = organ(&["urls::a", "urls::b", "urls::c", "urls::unknown"], &["B"], &[]);
        let host = FeatureDict::from([("urls::b".to_string(), 1.0)]);
        let total = contributions(&o, &weights(), &host, &classes(&["A"]));
        assert!((total - (-0.3)).abs() < 1e-12);
    }

    #[test]
    fn test_permissions_are_a_set() {
        let mut o = organ(&["urls::a"], &[], &[]);
        o.permissions = BTreeSet::from(["p::1".to_string()]);
        assert!(contributions(&o, &weights(), &FeatureDict::new(), &classes(&[])) < 0.0);
    }
}
