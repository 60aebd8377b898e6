//! Feature keys and feature dictionaries.
//!
//! Every feature produced by the static extractor is keyed as
//! `category::identifier`, e.g. `api_calls::android/media/AudioRecord` or
//! `app_permissions::android_permission_SEND_SMS`. The slicing tools use a
//! slightly different spelling of the identifier (dots instead of
//! underscores), so a few conversions live here alongside the permission
//! helpers that both harvesting and transplantation need.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Sparse feature vector: feature key -> count/weight.
pub type FeatureDict = BTreeMap<String, f64>;

/// Separator between feature category and identifier.
pub const KEY_SEPARATOR: &str = "::";

/// Categories reported in patient records and transplant reports.
pub const FEATURE_CATEGORIES: [&str; 9] = [
    "intents",
    "activities",
    "providers",
    "urls",
    "interesting_calls",
    "api_permissions",
    "app_permissions",
    "api_calls",
    "s_and_r",
];

/// Marker identifying permission features in either permission category.
pub const PERMISSION_MARKER: &str = "android_permission";

/// Android "dangerous" permissions. Organs requiring any of these are flagged.
pub const DANGEROUS_PERMISSIONS: [&str; 26] = [
    "READ_CALENDAR",
    "WRITE_CALENDAR",
    "READ_CALL_LOG",
    "WRITE_CALL_LOG",
    "PROCESS_OUTGOING_CALLS",
    "CAMERA",
    "READ_CONTACTS",
    "WRITE_CONTACTS",
    "GET_ACCOUNTS",
    "ACCESS_FINE_LOCATION",
    "ACCESS_COARSE_LOCATION",
    "RECORD_AUDIO",
    "READ_PHONE_STATE",
    "READ_PHONE_NUMBERS",
    "CALL_PHONE",
    "ANSWER_PHONE_CALLS",
    "ADD_VOICEMAIL",
    "USE_SIP",
    "BODY_SENSORS",
    "SEND_SMS",
    "RECEIVE_SMS",
    "READ_SMS",
    "RECEIVE_WAP_PUSH",
    "RECEIVE_MMS",
    "READ_EXTERNAL_STORAGE",
    "WRITE_EXTERNAL_STORAGE",
];

/// Split a feature key into `(category, identifier)`.
///
/// Keys without a separator are treated as a bare category with an empty
/// identifier.
pub fn split_key(key: &str) -> (&str, &str) {
    key.split_once(KEY_SEPARATOR).unwrap_or((key, ""))
}

/// Category of a feature key.
pub fn category(key: &str) -> &str {
    split_key(key).0
}

/// Convert an extractor feature key into the `(category, identifier)` pair the
/// slice extractor expects, where underscores in the identifier become dots.
pub fn to_j_feature(key: &str) -> (String, String) {
    let (category, identifier) = split_key(key);
    (category.to_string(), identifier.replace('_', "."))
}

/// Slice extractor feature type for a feature category.
pub fn slice_feature_type(category: &str) -> &'static str {
    match category {
        "activities" | "Activity" => "Activity",
        _ => "URL",
    }
}

/// Directory name the slice extractor uses for a feature (in its dotted form).
pub fn organ_dir_name(j_feature: &str) -> String {
    if j_feature.starts_with("http") {
        j_feature
            .replace('.', "_")
            .replace('/', "£")
            .replace(':', "^")
    } else {
        j_feature.replace('.', "_")
    }
}

/// Application name: the file name up to its first dot.
pub fn app_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    file_name
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Count features per category over [`FEATURE_CATEGORIES`].
pub fn category_counts(features: &FeatureDict) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = FEATURE_CATEGORIES
        .iter()
        .map(|c| (c.to_string(), 0))
        .collect();
    for key in features.keys() {
        if let Some(count) = counts.get_mut(category(key)) {
            *count += 1;
        }
    }
    counts
}

/// Permission features contained in a feature dict.
pub fn permission_features(features: &FeatureDict) -> impl Iterator<Item = &String> {
    features.keys().filter(|k| k.contains(PERMISSION_MARKER))
}

fn permission_segments(key: &str) -> Vec<String> {
    split_key(key)
        .1
        .replace('_', ".")
        .split('.')
        .map(str::to_string)
        .collect()
}

/// Short permission name (e.g. `SEND_SMS`) of a permission feature key.
///
/// The identifier is split on both `_` and `.`, which loses the original
/// underscores; names are only rebuilt for 3, 4 or 5 segments. Any other
/// shape yields `None`.
pub fn short_permission_name(key: &str) -> Option<String> {
    let s = permission_segments(key);
    match s.len() {
        3 => Some(s[2].clone()),
        4 => Some(format!("{}_{}", s[2], s[3])),
        5 => Some(format!("{}_{}_{}", s[2], s[3], s[4])),
        _ => None,
    }
}

/// Manifest permission string for a permission feature key, as written into
/// the injector's permission file.
///
/// `api_permissions::android_permission_SEND_SMS` becomes
/// `android.permission.SEND_SMS`. Names with more than two underscores in the
/// short form cannot be rebuilt and produce an empty entry.
pub fn permission_file_entry(key: &str) -> String {
    let s = permission_segments(key);
    match s.len() {
        3 => split_key(key).1.replace('_', "."),
        4 => format!("{}.{}.{}_{}", s[0], s[1], s[2], s[3]),
        5 => format!("{}.{}.{}_{}_{}", s[0], s[1], s[2], s[3], s[4]),
        _ => String::new(),
    }
}

/// True when a permission feature maps to a dangerous permission, or when its
/// name cannot be rebuilt at all.
pub fn is_dangerous_permission(key: &str) -> bool {
    match short_permission_name(key) {
        Some(name) if !name.is_empty() => DANGEROUS_PERMISSIONS.contains(&name.as_str()),
        _ => true,
    }
}

/// Convert the extractor's raw JSON report into a [`FeatureDict`].
///
/// The content hash field is dropped; booleans count as 0/1 and any other
/// non-numeric value is ignored.
pub fn feature_dict_from_json(report: BTreeMap<String, Value>) -> FeatureDict {
    report
        .into_iter()
        .filter(|(key, _)| key != "sha256")
        .filter_map(|(key, value)| {
            let numeric = match &value {
                Value::Number(n) => n.as_f64(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            };
            if numeric.is_none() {
                tracing::debug!("Ignoring non-numeric feature {}: {}", key, value);
            }
            numeric.map(|v| (key, v))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_key() {
        assert_eq!(
            split_key("api_calls::android/media/AudioRecord"),
            ("api_calls", "android/media/AudioRecord")
        );
        assert_eq!(split_key("sha256"), ("sha256", ""));
    }

    #[test]
    fn test_to_j_feature() {
        let (category, ident) = to_j_feature("activities::com_s2lab_minactivity_SecondActivity");
        assert_eq!(category, "activities");
        assert_eq!(ident, "com.s2lab.minactivity.SecondActivity");
        assert_eq!(slice_feature_type(&category), "Activity");
        assert_eq!(slice_feature_type("urls"), "URL");
    }

    #[test]
    fn test_organ_dir_name() {
        assert_eq!(
            organ_dir_name("com.s2lab.minactivity.SecondActivity"),
            "com_s2lab_minactivity_SecondActivity"
        );
        assert_eq!(organ_dir_name("http://www.w3.org/x"), "http^££www_w3_org£x");
    }

    #[test]
    fn test_app_name() {
        assert_eq!(app_name(Path::new("/data/00A3.apk")), "00A3");
        assert_eq!(app_name(Path::new("records/00A3.apk.record.json")), "00A3");
    }

    #[test]
    fn test_category_counts() {
        let mut features = FeatureDict::new();
        features.insert("urls::a".into(), 1.0);
        features.insert("urls::b".into(), 1.0);
        features.insert("api_calls::c".into(), 1.0);
        features.insert("_id::x".into(), 1.0);
        let counts = category_counts(&features);
        assert_eq!(counts.len(), FEATURE_CATEGORIES.len());
        assert_eq!(counts["urls"], 2);
        assert_eq!(counts["api_calls"], 1);
        assert_eq!(counts["intents"], 0);
        assert!(!counts.contains_key("_id"));
    }

    #[test]
    fn test_permission_file_entry_segments() {
        assert_eq!(
            permission_file_entry("api_permissions::android_permission_CAMERA"),
            "android.permission.CAMERA"
        );
        assert_eq!(
            permission_file_entry("app_permissions::android_permission_SEND_SMS"),
            "android.permission.SEND_SMS"
        );
        assert_eq!(
            permission_file_entry("app_permissions::android_permission_READ_PHONE_STATE"),
            "android.permission.READ_PHONE_STATE"
        );
        // Six segments cannot be rebuilt.
        assert_eq!(
            permission_file_entry("app_permissions::android_permission_A_B_C_D"),
            ""
        );
    }

    #[test]
    fn test_dangerous_permissions() {
        assert!(is_dangerous_permission(
            "app_permissions::android_permission_SEND_SMS"
        ));
        assert!(!is_dangerous_permission(
            "app_permissions::android_permission_INTERNET"
        ));
        // Unrecognised shape counts as dangerous
        assert!(is_dangerous_permission(
            "app_permissions::android_permission_A_B_C_D"
        ));
    }

    #[test]
    fn test_feature_dict_from_json_strips_hash() {
        let raw: BTreeMap<String, Value> = serde_json::from_str(
            r#"{"sha256": "abc", "urls::x": 1, "api_calls::y": true, "s_and_r::z": "n/a"}"#,
        )
        .unwrap();
        let dict = feature_dict_from_json(raw);
        assert_eq!(dict.len(), 2);
        assert_eq!(dict["urls::x"], 1.0);
        assert_eq!(dict["api_calls::y"], 1.0);
        assert!(!dict.contains_key("sha256"));
    }
}
