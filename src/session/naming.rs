//! Session identifiers and derived resource names.

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Prefix of every instance name.
pub const INSTANCE_NAME_PREFIX: &str = "taster";

/// Timestamp format used in instance names.
pub const TIME_SLUG_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Distribution tag used when an image name does not start with a letter.
const FALLBACK_DISTRO: &str = "image";

const SUFFIX_LEN: usize = 8;

/// Unique identifier of one tasting session.
///
/// Formatted as `YYYYmmddHHMMSS-xxxxxxxx`, the suffix being taken from a
/// random UUID, so identifiers sort by start time and stay unique when
/// sessions start within the same second.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SessionId(String);

impl SessionId {
    /// Generates an identifier for a session starting at `started`.
    #[must_use]
    pub fn new(started: DateTime<Utc>) -> Self {
        let suffix: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(SUFFIX_LEN)
            .collect();
        Self(format!("{}-{suffix}", started.format("%Y%m%d%H%M%S")))
    }

    /// Identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lower-cased image name truncated at the first character outside `a-z`.
///
/// ```
/// use taster::session::distro_tag;
///
/// assert_eq!(distro_tag("Ubuntu2004-x86"), "ubuntu");
/// assert_eq!(distro_tag("CentOS 7"), "centos");
/// ```
#[must_use]
pub fn distro_tag(image_name: &str) -> String {
    let tag: String = image_name
        .to_lowercase()
        .chars()
        .take_while(char::is_ascii_lowercase)
        .collect();
    if tag.is_empty() {
        FALLBACK_DISTRO.to_owned()
    } else {
        tag
    }
}

/// Instance name `taster-<YYYYmmdd_HHMMSS>-<distro>`.
#[must_use]
pub fn instance_name(started: DateTime<Utc>, image_name: &str) -> String {
    format!(
        "{INSTANCE_NAME_PREFIX}-{}-{}",
        started.format(TIME_SLUG_FORMAT),
        distro_tag(image_name)
    )
}

/// Name of the snapshot taken when an instance fails its tests.
#[must_use]
pub fn snapshot_name(instance_name: &str, image_name: &str) -> String {
    format!("{instance_name}_{image_name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .single()
            .expect("valid timestamp")
    }

    #[rstest]
    #[case("ubuntu2004-x86", "ubuntu")]
    #[case("CentOS-7", "centos")]
    #[case("debian", "debian")]
    #[case("Fedora Cloud 39", "fedora")]
    #[case("7-minimal", "image")]
    fn distro_tag_truncates_at_first_non_letter(#[case] image: &str, #[case] expected: &str) {
        assert_eq!(distro_tag(image), expected);
    }

    #[rstest]
    fn instance_name_combines_prefix_slug_and_tag() {
        assert_eq!(
            instance_name(started(), "ubuntu2004-x86"),
            "taster-20240309_140507-ubuntu"
        );
    }

    #[rstest]
    fn snapshot_name_joins_instance_and_image() {
        assert_eq!(
            snapshot_name("taster-20240309_140507-ubuntu", "ubuntu2004-x86"),
            "taster-20240309_140507-ubuntu_ubuntu2004-x86"
        );
    }

    #[rstest]
    fn session_ids_share_timestamp_but_differ() {
        let first = SessionId::new(started());
        let second = SessionId::new(started());

        assert!(first.as_str().starts_with("20240309140507-"));
        assert_eq!(first.as_str().len(), "20240309140507-".len() + SUFFIX_LEN);
        assert_ne!(first, second);
    }
}
