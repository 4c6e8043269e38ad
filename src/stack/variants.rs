//! Compose file variant selection by stack version.

use semver::{Version, VersionReq};

pub const STACK_VARIANT_ENV: &str = "STACK_VERSION_VARIANT";

const DEFAULT_VARIANT: &str = "default";

// Checked in order; the first matching range wins.
const VARIANTS: &[(&str, &str)] = &[("80", ">=8.0.0-0, <8.2.0-0"), ("8x", ">=8.2.0-0, <9.0.0-0")];

/// Variant of the compose definitions suited to `version`.
///
/// Unparseable versions use the default variant.
pub fn select_stack_variant(version: &str) -> &'static str {
    let Ok(version) = Version::parse(version) else {
        return DEFAULT_VARIANT;
    };
    VARIANTS
        .iter()
        .find(|(_, range)| {
            VersionReq::parse(range)
                .map(|req| matches_with_prerelease(&req, &version))
                .unwrap_or(false)
        })
        .map(|(name, _)| *name)
        .unwrap_or(DEFAULT_VARIANT)
}

// `VersionReq` only admits pre-releases that share major.minor.patch with a
// bound; compare against the bounds directly so snapshots fall in range.
fn matches_with_prerelease(req: &VersionReq, version: &Version) -> bool {
    use semver::Op;
    req.comparators.iter().all(|c| {
        let bound = Version {
            major: c.major,
            minor: c.minor.unwrap_or(0),
            patch: c.patch.unwrap_or(0),
            pre: c.pre.clone(),
            build: Default::default(),
        };
        match c.op {
            Op::GreaterEq => *version >= bound,
            Op::Greater => *version > bound,
            Op::Less => *version < bound,
            Op::LessEq => *version <= bound,
            Op::Exact => *version == bound,
            _ => c.matches(version),
        }
    })
}

/// `STACK_VERSION_VARIANT=<variant>` for the compose environment.
pub fn stack_variant_env(version: &str) -> (String, String) {
    (
        STACK_VARIANT_ENV.to_string(),
        select_stack_variant(version).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_boundaries() {
        let cases = [
            ("", "default"),
            ("7", "default"),
            ("7.x", "default"),
            ("7.14.0", "default"),
            ("8.0.0-SNAPSHOT", "80"),
            ("8.0.0", "80"),
            ("8.1.999-SNAPSHOT", "80"),
            ("8.2.0-SNAPSHOT", "8x"),
            ("8.2.0", "8x"),
            ("8.17.0", "8x"),
            ("9.0.0-SNAPSHOT", "default"),
            ("9.x", "default"),
            ("9.1.0", "default"),
        ];
        for (version, expected) in cases {
            assert_eq!(select_stack_variant(version), expected, "version {}", version);
        }
    }

    #[test]
    fn env_pair() {
        assert_eq!(
            stack_variant_env("8.1.0"),
            ("STACK_VERSION_VARIANT".to_string(), "80".to_string())
        );
    }
}
