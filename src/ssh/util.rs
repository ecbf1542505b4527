//! Path helpers for key material.

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is unset.
///
/// # Examples
///
/// ```
/// # use taster::ssh::expand_tilde;
/// assert_eq!(expand_tilde("/etc/ssh/id_taster"), "/etc/ssh/id_taster");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
